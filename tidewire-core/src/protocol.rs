//! WebSocket protocol constants and utilities
//!
//! This module contains the fundamental protocol definitions from RFC 6455,
//! including opcodes, frame header bits, and protocol constants.

/// WebSocket opcodes as defined in RFC 6455 Section 5.2
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Continuation frame
    Continuation = 0x0,
    /// Text frame
    Text = 0x1,
    /// Binary frame
    Binary = 0x2,
    /// Close frame
    Close = 0x8,
    /// Ping frame
    Ping = 0x9,
    /// Pong frame
    Pong = 0xA,
}

impl Opcode {
    /// Create an Opcode from a u8, `None` for reserved values
    pub fn from(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(Opcode::Continuation),
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xA => Some(Opcode::Pong),
            _ => None,
        }
    }

    /// Get the numeric value of the opcode
    pub fn value(&self) -> u8 {
        *self as u8
    }

    /// Check if this is a control opcode
    pub fn is_control(&self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }

    /// Check if this is a data opcode
    pub fn is_data(&self) -> bool {
        matches!(self, Opcode::Text | Opcode::Binary | Opcode::Continuation)
    }

    /// Check if this opcode starts a new data message
    pub fn starts_message(&self) -> bool {
        matches!(self, Opcode::Text | Opcode::Binary)
    }
}

/// WebSocket protocol constants
pub mod constants {
    /// Initial size of each receiver buffer pool
    pub const DEFAULT_POOL_SIZE: usize = 1024;

    /// Payloads below this size are merged with their header into one write
    pub const DEFAULT_MERGE_THRESHOLD: usize = 32 * 1024;

    /// Largest payload a control frame may carry
    pub const MAX_CONTROL_PAYLOAD: usize = 125;

    /// Minimum close frame payload size when a payload is present
    pub const MIN_CLOSE_PAYLOAD_SIZE: usize = 2;

    /// Close code reported when a close frame carries no payload
    pub const DEFAULT_CLOSE_CODE: u16 = 1000;

    /// Payloads above this size are buffered as they arrive instead of
    /// being sized from the length field up front
    pub const MAX_POOLED_PAYLOAD: usize = 1024 * 1024;
}

/// Frame header bit positions and masks
pub mod frame {
    /// FIN bit position
    pub const FIN_BIT: u8 = 0x80;

    /// RSV1 bit position
    pub const RSV1_BIT: u8 = 0x40;

    /// RSV2 bit position
    pub const RSV2_BIT: u8 = 0x20;

    /// RSV3 bit position
    pub const RSV3_BIT: u8 = 0x10;

    /// All three reserved bits
    pub const RSV_MASK: u8 = RSV1_BIT | RSV2_BIT | RSV3_BIT;

    /// Opcode mask
    pub const OPCODE_MASK: u8 = 0x0F;

    /// MASK bit position
    pub const MASK_BIT: u8 = 0x80;

    /// Payload length mask for 7-bit length
    pub const PAYLOAD_LEN_MASK: u8 = 0x7F;

    /// Extended payload length (16-bit) marker
    pub const PAYLOAD_LEN_16: u8 = 126;

    /// Extended payload length (64-bit) marker
    pub const PAYLOAD_LEN_64: u8 = 127;

    /// Masking key length
    pub const MASKING_KEY_LEN: usize = 4;
}

/// WebSocket extension names
pub mod extensions {
    /// Per-message deflate extension
    pub const PERMESSAGE_DEFLATE: &str = "permessage-deflate";
}

/// Utility functions for WebSocket protocol operations
pub mod utils {
    use crate::error::CloseCode;

    /// Check if a close code may appear in a close frame
    pub fn is_valid_close_code(code: u16) -> bool {
        CloseCode::from(code).is_allowed()
    }

    /// Validate that a buffer holds well-formed UTF-8
    pub fn is_valid_utf8(buf: &[u8]) -> bool {
        std::str::from_utf8(buf).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_conversion() {
        assert_eq!(Opcode::from(0x1), Some(Opcode::Text));
        assert_eq!(Opcode::from(0x3), None);
        assert_eq!(Opcode::from(0xB), None);
        assert_eq!(Opcode::from(0xFF), None);
        assert_eq!(Opcode::Pong.value(), 0xA);
        assert!(Opcode::Ping.is_control());
        assert!(Opcode::Binary.is_data());
        assert!(!Opcode::Continuation.starts_message());
    }

    #[test]
    fn test_close_code_validation() {
        assert!(utils::is_valid_close_code(1000));
        assert!(utils::is_valid_close_code(3000));
        assert!(!utils::is_valid_close_code(999));
        assert!(!utils::is_valid_close_code(1005));
    }

    #[test]
    fn test_utf8_validation() {
        assert!(utils::is_valid_utf8("Lorem ipsum dolor sit amet".as_bytes()));
        assert!(utils::is_valid_utf8(&[0xf0, 0x90, 0x80, 0x80]));
        assert!(!utils::is_valid_utf8(&[0xce, 0xba, 0xe1, 0xbd]));
        assert!(!utils::is_valid_utf8(&[
            0xce, 0xba, 0xe1, 0xbd, 0xb9, 0xcf, 0x83, 0xce, 0xbc, 0xce, 0xb5, 0xed, 0xa0, 0x80,
            0x65, 0x64, 0x69, 0x74, 0x65, 0x64,
        ]));
    }
}
