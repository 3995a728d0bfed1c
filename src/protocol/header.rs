//! Fixed-size wire header.
//!
//! Every frame starts with a 10-byte header:
//! ```text
//! ┌──────────┬──────────┬──────────┬──────────┐
//! │ Magic    │ Version  │ Code     │ Length   │
//! │ 4 bytes  │ 2 bytes  │ 2 bytes  │ 2 bytes  │
//! │ uint32 BE│ uint16 BE│ uint16 BE│ uint16 BE│
//! └──────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! `length` counts the body bytes that follow, so a single frame carries at
//! most [`MAX_BODY_SIZE`] bytes of body.

use bytes::BufMut;

use crate::error::FrameError;

/// Header size in bytes.
pub const HEADER_SIZE: usize = 10;

/// Protocol identifier ("VSOK").
pub const MAGIC: u32 = 0x5653_4F4B;

/// Protocol version spoken by this crate.
pub const VERSION: u16 = 1;

/// Largest body a frame can carry.
pub const MAX_BODY_SIZE: usize = u16::MAX as usize;

/// Header code meaning "success, not a status".
pub const CODE_SUCCESS: u16 = 0;

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Protocol identifier, always [`MAGIC`] once decoded.
    pub magic: u32,
    /// Protocol version, always [`VERSION`] once decoded.
    pub version: u16,
    /// Status code on responses, or dispatch key in the code-addressed convention.
    pub code: u16,
    /// Body length in bytes.
    pub length: u16,
}

impl Header {
    /// Create a header with the protocol's magic and version.
    pub fn new(code: u16, length: u16) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            code,
            length,
        }
    }

    /// Header for a response to this request, keeping magic and version.
    pub fn reply(&self, code: u16, length: u16) -> Self {
        Self {
            code,
            length,
            ..*self
        }
    }

    /// Whether `code` is the success marker.
    #[inline]
    pub fn is_success(&self) -> bool {
        self.code == CODE_SUCCESS
    }

    /// Encode to bytes (big endian). Never fails.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic.to_be_bytes());
        buf[4..6].copy_from_slice(&self.version.to_be_bytes());
        buf[6..8].copy_from_slice(&self.code.to_be_bytes());
        buf[8..10].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    /// Append the encoded header to `buf`.
    pub fn encode_into(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.magic);
        buf.put_u16(self.version);
        buf.put_u16(self.code);
        buf.put_u16(self.length);
    }

    /// Decode and validate a header.
    ///
    /// Fails with [`FrameError::MalformedHeader`] when magic or version do not
    /// match this crate's constants.
    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Self, FrameError> {
        let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let version = u16::from_be_bytes([buf[4], buf[5]]);
        if magic != MAGIC || version != VERSION {
            return Err(FrameError::MalformedHeader { magic, version });
        }
        Ok(Self {
            magic,
            version,
            code: u16::from_be_bytes([buf[6], buf[7]]),
            length: u16::from_be_bytes([buf[8], buf[9]]),
        })
    }
}
