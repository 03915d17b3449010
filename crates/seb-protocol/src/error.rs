//! Protocol error types

use thiserror::Error;

use crate::message::MessageType;

/// Errors that can occur during protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Unknown message type tag
    #[error("Unknown message type: {0:#04x}")]
    UnknownMessageType(u8),

    /// Payload exceeds maximum size
    #[error("Payload too large: {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// A fixed-size message arrived with the wrong payload length
    #[error("Invalid payload length for {message_type:?}: expected {expected} bytes, got {actual}")]
    InvalidPayloadLength {
        message_type: MessageType,
        expected: usize,
        actual: usize,
    },

    /// Token text could not be decoded
    #[error("Invalid token encoding")]
    InvalidTokenEncoding,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
