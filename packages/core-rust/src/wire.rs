//! Cluster message header: the 16 bytes prepended to every payload sent
//! through the group transport.
//!
//! Layout (offsets in bytes): target port (0, u8), source port (1, u8),
//! pad (2, u16, zero), flags (4, u32), source node id (8, u32), target node
//! id (12, u32; 0 = broadcast to all members). Fields are little-endian on
//! the wire; when the transport flags a foreign-endian delivery the decoder
//! reads the multi-byte fields big-endian instead.

use bytes::{Buf, BufMut};
use thiserror::Error;

/// Size of the encoded header.
pub const HEADER_SIZE: usize = 16;

/// Send flag: totally-ordered (AGREED) delivery. The default; carried for
/// wire compatibility.
pub const FLAG_AGREED: u32 = 0x0100_0000;
/// Send flag: request SAFE delivery (AGREED plus all-members buffering).
pub const FLAG_SAFE: u32 = 0x0200_0000;
/// Send flag: loop a copy back to the sender on broadcast.
pub const FLAG_BCAST_SELF: u32 = 0x0400_0000;

/// Decoding failures for cluster-wire structures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("message truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("unknown message command {0}")]
    UnknownCommand(u8),
    #[error("invalid field value in {context}")]
    InvalidField { context: &'static str },
}

/// The per-message routing header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub target_port: u8,
    pub source_port: u8,
    pub flags: u32,
    pub source_node: u32,
    /// 0 means broadcast-to-all-members.
    pub target_node: u32,
}

impl MessageHeader {
    #[must_use]
    pub fn new(target_port: u8, source_port: u8, target_node: u32, flags: u32) -> Self {
        Self {
            target_port,
            source_port,
            flags,
            source_node: 0,
            target_node,
        }
    }

    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.target_node == 0
    }

    #[must_use]
    pub fn wants_safe_delivery(&self) -> bool {
        self.flags & FLAG_SAFE != 0
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.target_port);
        buf.put_u8(self.source_port);
        buf.put_u16_le(0); // pad
        buf.put_u32_le(self.flags);
        buf.put_u32_le(self.source_node);
        buf.put_u32_le(self.target_node);
    }

    /// Decodes a header, consuming [`HEADER_SIZE`] bytes from `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Truncated`] if fewer than [`HEADER_SIZE`]
    /// bytes remain.
    pub fn decode(buf: &mut impl Buf, swap: bool) -> Result<Self, DecodeError> {
        if buf.remaining() < HEADER_SIZE {
            return Err(DecodeError::Truncated {
                need: HEADER_SIZE,
                have: buf.remaining(),
            });
        }
        let target_port = buf.get_u8();
        let source_port = buf.get_u8();
        let _pad = buf.get_u16_le();
        let (flags, source_node, target_node) = if swap {
            (buf.get_u32(), buf.get_u32(), buf.get_u32())
        } else {
            (buf.get_u32_le(), buf.get_u32_le(), buf.get_u32_le())
        };
        Ok(Self {
            target_port,
            source_port,
            flags,
            source_node,
            target_node,
        })
    }
}
