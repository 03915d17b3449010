//! Tokio codec for framed protocol messages

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::frame::{FrameHeader, MAX_PAYLOAD_SIZE};
use crate::message::Message;

/// Codec for encoding/decoding protocol messages
///
/// A message is only yielded once its header and full payload are buffered.
#[derive(Debug, Default)]
pub struct MessageCodec {
    /// Current header being decoded (if any)
    pending_header: Option<FrameHeader>,
}

impl MessageCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self {
            pending_header: None,
        }
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header = match self.pending_header.take() {
            Some(h) => h,
            None => match FrameHeader::decode(src)? {
                Some(h) => h,
                None => return Ok(None),
            },
        };

        let payload_len = header.payload_length as usize;
        if src.len() < payload_len {
            src.reserve(payload_len - src.len());
            self.pending_header = Some(header);
            return Ok(None);
        }

        let payload = src.split_to(payload_len).freeze();
        let message = Message::from_parts(header.message_type, payload)?;
        tracing::trace!("Decoded {:?} ({} byte payload)", header.message_type, payload_len);

        Ok(Some(message))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = ProtocolError;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload_len = message.payload_len();
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let header = FrameHeader::new(message.message_type(), payload_len as u32);
        dst.reserve(payload_len);
        header.encode(dst);
        message.encode_payload(dst);

        Ok(())
    }
}
