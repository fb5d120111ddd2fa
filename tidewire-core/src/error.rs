//! Error types for Tidewire
//!
//! This module defines all error types used by the wire-protocol engine.
//! Protocol violations carry the close code that the connection owner should
//! send back to the peer; caller mistakes are reported synchronously.

#![allow(missing_docs)]

use std::fmt;
use thiserror::Error;

/// Result type alias for Tidewire operations
pub type Result<T> = std::result::Result<T, Error>;

/// Comprehensive error type for Tidewire operations
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed frame or invalid frame sequencing
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Message grew past the configured maximum payload
    #[error("Payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// Extension codec failure
    #[error("Extension error: {0}")]
    Extension(#[from] ExtensionError),

    /// I/O errors on the byte channel
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Caller passed a close code that may not be sent on the wire
    #[error("Invalid close code: {0}")]
    InvalidCloseCode(u16),

    /// The engine has been torn down
    #[error("Engine closed")]
    Closed,
}

impl Error {
    /// Close code the peer should receive for this error, if it is a protocol concern
    pub fn close_code(&self) -> Option<CloseCode> {
        match self {
            Error::Protocol(err) => Some(err.close_code()),
            Error::PayloadTooLarge { .. } => Some(CloseCode::TooBig),
            Error::Extension(ExtensionError::TooLarge { .. }) => Some(CloseCode::TooBig),
            Error::Extension(_) => Some(CloseCode::InvalidPayload),
            Error::Io(_) | Error::Config(_) | Error::InvalidCloseCode(_) | Error::Closed => None,
        }
    }
}

/// WebSocket protocol violations detected while parsing
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Reserved bits set without a negotiated extension that claims them
    #[error("Reserved bits must be empty")]
    ReservedBitsSet,

    /// Continuation frame carrying the per-message compressed bit
    #[error("Continuation frame cannot have the per-message compressed bit")]
    CompressedContinuation,

    /// Control frame carrying the per-message compressed bit
    #[error("Control frames cannot have the per-message compressed bit")]
    CompressedControlFrame,

    /// Continuation frame without an active fragmented message
    #[error("Continuation frame cannot follow current opcode")]
    UnexpectedContinuation,

    /// New data frame while a fragmented message is still open
    #[error("Data frames after the initial data frame must have opcode 0")]
    ExpectedContinuation,

    /// Control frame with FIN cleared
    #[error("Control frames cannot be fragmented")]
    FragmentedControlFrame,

    /// Control frame payload over 125 bytes
    #[error("Control frames cannot have more than 125 bytes of data")]
    ControlFrameTooLarge,

    /// Opcode with no defined meaning
    #[error("Invalid opcode: {0}")]
    InvalidOpcode(u8),

    /// 64-bit length with a nonzero high word
    #[error("Frame lengths spanning more than 32 bits are not supported")]
    UnsupportedLength,

    /// Close frame payload of exactly one byte
    #[error("Close frames with data must be at least two bytes long")]
    CloseFrameTooShort,

    /// Close frame carrying a code that may not appear on the wire
    #[error("Invalid close code: {0}")]
    InvalidCloseCode(u16),

    /// Text message or close reason that is not valid UTF-8
    #[error("Invalid UTF-8 sequence")]
    InvalidUtf8,
}

impl ProtocolError {
    /// Close code associated with this violation
    pub fn close_code(&self) -> CloseCode {
        match self {
            ProtocolError::InvalidUtf8 => CloseCode::InvalidPayload,
            ProtocolError::UnsupportedLength => CloseCode::PolicyViolation,
            _ => CloseCode::ProtocolError,
        }
    }
}

/// Extension codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtensionError {
    /// Compression failed
    #[error("Compression failed: {0}")]
    Compress(String),

    /// Decompression failed
    #[error("Invalid compressed data: {0}")]
    Decompress(String),

    /// Inflated output exceeded its limit
    #[error("Inflated payload too large: {size} bytes (max: {max})")]
    TooLarge { size: usize, max: usize },

    /// The codec session was already closed
    #[error("Codec session {0} is closed")]
    SessionClosed(u64),

    /// The codec host is gone
    #[error("Codec unavailable")]
    Unavailable,
}

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Invalid configuration value
    #[error("Invalid configuration value for {field}: {value}")]
    InvalidValue { field: String, value: String },

    /// Configuration validation failed
    #[error("Configuration validation failed: {0}")]
    Validation(String),
}

/// WebSocket close codes as defined in RFC 6455
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    /// Normal closure
    Normal,
    /// Going away
    Away,
    /// Protocol error
    ProtocolError,
    /// Unsupported data
    Unsupported,
    /// No status received
    NoStatus,
    /// Abnormal closure
    Abnormal,
    /// Invalid frame payload data
    InvalidPayload,
    /// Policy violation
    PolicyViolation,
    /// Message too big
    TooBig,
    /// Mandatory extension
    MandatoryExtension,
    /// Internal server error
    Internal,
    /// TLS handshake failure
    TlsHandshake,
    /// Application-specific close code (3000-4999)
    Application(u16),
    /// Any other code; never valid on the wire
    Other(u16),
}

impl CloseCode {
    /// Create a CloseCode from a u16
    pub fn from(code: u16) -> Self {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::Away,
            1002 => CloseCode::ProtocolError,
            1003 => CloseCode::Unsupported,
            1005 => CloseCode::NoStatus,
            1006 => CloseCode::Abnormal,
            1007 => CloseCode::InvalidPayload,
            1008 => CloseCode::PolicyViolation,
            1009 => CloseCode::TooBig,
            1010 => CloseCode::MandatoryExtension,
            1011 => CloseCode::Internal,
            1015 => CloseCode::TlsHandshake,
            code if (3000..=4999).contains(&code) => CloseCode::Application(code),
            code => CloseCode::Other(code),
        }
    }

    /// Get the numeric value of the close code
    pub fn code(&self) -> u16 {
        match self {
            CloseCode::Normal => 1000,
            CloseCode::Away => 1001,
            CloseCode::ProtocolError => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::NoStatus => 1005,
            CloseCode::Abnormal => 1006,
            CloseCode::InvalidPayload => 1007,
            CloseCode::PolicyViolation => 1008,
            CloseCode::TooBig => 1009,
            CloseCode::MandatoryExtension => 1010,
            CloseCode::Internal => 1011,
            CloseCode::TlsHandshake => 1015,
            CloseCode::Application(code) | CloseCode::Other(code) => *code,
        }
    }

    /// Check if this is a reserved close code that must not be sent
    pub fn is_reserved(&self) -> bool {
        matches!(
            self,
            CloseCode::NoStatus | CloseCode::Abnormal | CloseCode::TlsHandshake | CloseCode::Other(_)
        )
    }

    /// Check if this code may appear in a close frame
    pub fn is_allowed(&self) -> bool {
        !self.is_reserved()
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> u16 {
        code.code()
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, self.code())
    }
}
