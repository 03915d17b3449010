//! Frame header encoding/decoding
//!
//! The frame format uses a 5-byte header:
//! - message_type: 1 byte (u8)
//! - payload_length: 4 bytes (u32, little-endian)

use bytes::{Buf, BufMut, BytesMut};

use crate::error::ProtocolError;
use crate::message::MessageType;

/// Size of the frame header in bytes
pub const HEADER_SIZE: usize = 5;

/// Maximum payload size accepted from the peer (1 MiB)
pub const MAX_PAYLOAD_SIZE: usize = 1 << 20;

/// Frame header containing type and length information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Type of message in the payload
    pub message_type: MessageType,
    /// Length of the payload in bytes
    pub payload_length: u32,
}

impl FrameHeader {
    /// Create a new frame header
    pub fn new(message_type: MessageType, payload_length: u32) -> Self {
        Self {
            message_type,
            payload_length,
        }
    }

    /// Encode the header into a byte buffer
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_SIZE);
        dst.put_u8(self.message_type.as_u8());
        dst.put_u32_le(self.payload_length);
    }

    /// Decode a header from a byte buffer
    ///
    /// Returns None if there aren't enough bytes in the buffer.
    /// Returns Err if the header is invalid: unknown type, oversized payload,
    /// or a length that does not fit a fixed-size message. Nothing is
    /// consumed from `src` unless a valid header is returned.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let type_byte = src[0];
        let message_type =
            MessageType::from_u8(type_byte).ok_or(ProtocolError::UnknownMessageType(type_byte))?;

        let payload_length = u32::from_le_bytes([src[1], src[2], src[3], src[4]]);
        let size = payload_length as usize;
        if size > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        if let Some(expected) = message_type.fixed_payload_len() {
            if size != expected {
                return Err(ProtocolError::InvalidPayloadLength {
                    message_type,
                    expected,
                    actual: size,
                });
            }
        }

        src.advance(HEADER_SIZE);

        Ok(Some(Self {
            message_type,
            payload_length,
        }))
    }
}
