//! Message types for the session channel
//!
//! The vocabulary is deliberately small: a session is authenticated once,
//! kept alive with heartbeats, carries opaque commands for the layers above,
//! and is ended with a disconnect notice.
//!
//! # Message Flow
//!
//! 1. Client connects and sends `AuthenticateRequest` with the session token
//! 2. Service validates the token and responds with `AuthenticateAck`
//!    (a rejected client receives `DisconnectNotice` and the channel closes)
//! 3. Both sides send `Heartbeat` on a fixed interval
//! 4. Either side may send `Command`; the peer answers with `CommandAck`
//! 5. Session end: `DisconnectNotice` (can be sent by either side)

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::token::{SessionToken, TOKEN_LEN};

/// Message type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Client presents its session token
    AuthenticateRequest = 0x01,
    /// Service accepted the token
    AuthenticateAck = 0x02,
    /// Liveness probe
    Heartbeat = 0x03,
    /// Opaque command for the peer
    Command = 0x04,
    /// Reply to a command
    CommandAck = 0x05,
    /// Sender is ending the session
    DisconnectNotice = 0x06,
}

impl MessageType {
    /// Convert to u8
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::AuthenticateRequest),
            0x02 => Some(Self::AuthenticateAck),
            0x03 => Some(Self::Heartbeat),
            0x04 => Some(Self::Command),
            0x05 => Some(Self::CommandAck),
            0x06 => Some(Self::DisconnectNotice),
            _ => None,
        }
    }

    /// Payload length required by this message type, if it is fixed
    pub fn fixed_payload_len(&self) -> Option<usize> {
        match self {
            Self::AuthenticateRequest => Some(TOKEN_LEN),
            Self::AuthenticateAck | Self::Heartbeat | Self::DisconnectNotice => Some(0),
            Self::Command | Self::CommandAck => None,
        }
    }
}

/// Protocol messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Present the session token
    AuthenticateRequest(SessionToken),

    /// Token accepted
    AuthenticateAck,

    /// Liveness probe
    Heartbeat,

    /// Command payload, owned by the layers above
    Command(Bytes),

    /// Command reply payload, owned by the layers above
    CommandAck(Bytes),

    /// Sender is ending the session
    DisconnectNotice,
}

impl Message {
    /// Get the message type for this message
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::AuthenticateRequest(_) => MessageType::AuthenticateRequest,
            Message::AuthenticateAck => MessageType::AuthenticateAck,
            Message::Heartbeat => MessageType::Heartbeat,
            Message::Command(_) => MessageType::Command,
            Message::CommandAck(_) => MessageType::CommandAck,
            Message::DisconnectNotice => MessageType::DisconnectNotice,
        }
    }

    /// Length of the encoded payload in bytes
    pub fn payload_len(&self) -> usize {
        match self {
            Message::AuthenticateRequest(_) => TOKEN_LEN,
            Message::Command(payload) | Message::CommandAck(payload) => payload.len(),
            Message::AuthenticateAck | Message::Heartbeat | Message::DisconnectNotice => 0,
        }
    }

    /// Append the payload bytes to `dst`
    pub fn encode_payload(&self, dst: &mut BytesMut) {
        match self {
            Message::AuthenticateRequest(token) => dst.put_slice(token.as_bytes()),
            Message::Command(payload) | Message::CommandAck(payload) => dst.put_slice(payload),
            Message::AuthenticateAck | Message::Heartbeat | Message::DisconnectNotice => {}
        }
    }

    /// Rebuild a message from its type tag and a complete payload
    pub fn from_parts(message_type: MessageType, payload: Bytes) -> Result<Self, ProtocolError> {
        if let Some(expected) = message_type.fixed_payload_len() {
            if payload.len() != expected {
                return Err(ProtocolError::InvalidPayloadLength {
                    message_type,
                    expected,
                    actual: payload.len(),
                });
            }
        }

        Ok(match message_type {
            MessageType::AuthenticateRequest => {
                let token = SessionToken::from_slice(&payload).ok_or(
                    ProtocolError::InvalidPayloadLength {
                        message_type,
                        expected: TOKEN_LEN,
                        actual: payload.len(),
                    },
                )?;
                Message::AuthenticateRequest(token)
            }
            MessageType::AuthenticateAck => Message::AuthenticateAck,
            MessageType::Heartbeat => Message::Heartbeat,
            MessageType::Command => Message::Command(payload),
            MessageType::CommandAck => Message::CommandAck(payload),
            MessageType::DisconnectNotice => Message::DisconnectNotice,
        })
    }
}
