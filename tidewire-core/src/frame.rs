//! WebSocket frame header encoding and payload masking
//!
//! The receiver decodes headers incrementally and the sender writes them
//! straight into its output buffers, so this module only deals with the
//! fixed pieces of the wire format: header bytes, length classes and the
//! XOR mask.

use crate::protocol::{frame::*, Opcode};
use bytes::{BufMut, Bytes, BytesMut};

/// The first two bytes of a frame, before any validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawHeader {
    /// FIN bit
    pub fin: bool,
    /// RSV1..RSV3 as they appear in the first byte (`0x70` mask)
    pub rsv: u8,
    /// Raw 4-bit opcode
    pub opcode: u8,
    /// MASK bit
    pub masked: bool,
    /// 7-bit length or one of the extended-length markers
    pub len7: u8,
}

impl RawHeader {
    /// Split the two leading header bytes into their fields
    pub fn decode(bytes: [u8; 2]) -> Self {
        Self {
            fin: bytes[0] & FIN_BIT != 0,
            rsv: bytes[0] & RSV_MASK,
            opcode: bytes[0] & OPCODE_MASK,
            masked: bytes[1] & MASK_BIT != 0,
            len7: bytes[1] & PAYLOAD_LEN_MASK,
        }
    }

    /// RSV1 is the per-message compressed bit
    pub fn rsv1(&self) -> bool {
        self.rsv & RSV1_BIT != 0
    }
}

/// Size of the header for a payload of `len` bytes
pub fn header_len(len: usize, masked: bool) -> usize {
    let base = if len < PAYLOAD_LEN_16 as usize {
        2
    } else if len <= u16::MAX as usize {
        4
    } else {
        10
    };
    if masked {
        base + MASKING_KEY_LEN
    } else {
        base
    }
}

/// Write a frame header for a payload of `len` bytes
pub fn encode_header(
    buf: &mut BytesMut,
    fin: bool,
    rsv1: bool,
    opcode: Opcode,
    mask: Option<[u8; 4]>,
    len: usize,
) {
    let mut first_byte = opcode.value();
    if fin {
        first_byte |= FIN_BIT;
    }
    if rsv1 {
        first_byte |= RSV1_BIT;
    }
    buf.put_u8(first_byte);

    let mask_bit = if mask.is_some() { MASK_BIT } else { 0 };
    if len < PAYLOAD_LEN_16 as usize {
        buf.put_u8(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        buf.put_u8(mask_bit | PAYLOAD_LEN_16);
        buf.put_u16(len as u16);
    } else {
        buf.put_u8(mask_bit | PAYLOAD_LEN_64);
        buf.put_u64(len as u64);
    }

    if let Some(mask) = mask {
        buf.put_slice(&mask);
    }
}

/// XOR `buf` in place with the 4-byte masking key
///
/// Masking is an involution, so the same call unmasks.
pub fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    let mut chunks = buf.chunks_exact_mut(4);
    for chunk in &mut chunks {
        chunk[0] ^= mask[0];
        chunk[1] ^= mask[1];
        chunk[2] ^= mask[2];
        chunk[3] ^= mask[3];
    }
    for (i, byte) in chunks.into_remainder().iter_mut().enumerate() {
        *byte ^= mask[i];
    }
}

/// A complete outgoing frame, mostly useful for building wire fixtures
#[derive(Debug, Clone)]
pub struct Frame {
    /// Indicates if this is the final frame in a message
    pub fin: bool,
    /// Per-message compressed bit
    pub rsv1: bool,
    /// Frame opcode
    pub opcode: Opcode,
    /// Masking key (if present)
    pub mask: Option<[u8; 4]>,
    /// Unmasked payload data
    pub payload: Bytes,
}

impl Frame {
    /// Create a new final, unmasked frame
    pub fn new(opcode: Opcode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            rsv1: false,
            opcode,
            mask: None,
            payload: payload.into(),
        }
    }

    /// Create a text frame
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Text, payload)
    }

    /// Create a binary frame
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Binary, payload)
    }

    /// Create a continuation frame
    pub fn continuation(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Continuation, payload)
    }

    /// Create a ping frame
    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Ping, payload)
    }

    /// Create a pong frame
    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Pong, payload)
    }

    /// Create a close frame with optional code and reason
    pub fn close(code: Option<u16>, reason: Option<&str>) -> Self {
        let mut payload = BytesMut::new();
        if let Some(code) = code {
            payload.put_u16(code);
        }
        if let Some(reason) = reason {
            payload.put_slice(reason.as_bytes());
        }
        Self::new(Opcode::Close, payload.freeze())
    }

    /// Set the FIN bit
    pub fn fin(mut self, fin: bool) -> Self {
        self.fin = fin;
        self
    }

    /// Set the per-message compressed bit
    pub fn compressed(mut self, rsv1: bool) -> Self {
        self.rsv1 = rsv1;
        self
    }

    /// Mask the payload with the given key when serialized
    pub fn masked_with(mut self, mask: [u8; 4]) -> Self {
        self.mask = Some(mask);
        self
    }

    /// Mask the payload with a random key when serialized
    pub fn masked(self) -> Self {
        self.masked_with(rand::random::<[u8; 4]>())
    }

    /// Serialize the frame to bytes
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(header_len(self.payload.len(), self.mask.is_some()) + self.payload.len());
        self.write_to(&mut buf);
        buf.freeze()
    }

    /// Write the frame to a buffer
    pub fn write_to(&self, buf: &mut BytesMut) {
        encode_header(buf, self.fin, self.rsv1, self.opcode, self.mask, self.payload.len());
        let start = buf.len();
        buf.put_slice(&self.payload);
        if let Some(mask) = self.mask {
            apply_mask(&mut buf[start..], mask);
        }
    }
}
