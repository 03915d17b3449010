//! Core error types for the exam session channel

use std::path::PathBuf;

use seb_protocol::ProtocolError;
use thiserror::Error;

/// Transport channel errors
#[derive(Error, Debug)]
pub enum ChannelError {
    /// The channel was closed locally or by the peer
    #[error("Channel closed")]
    Closed,

    /// The operation did not complete within its timeout
    #[error("Channel operation timed out")]
    Timeout,

    /// The peer sent bytes that do not form a valid message
    #[error("Malformed frame: {0}")]
    Protocol(ProtocolError),

    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ProtocolError> for ChannelError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(e) => ChannelError::Io(e),
            other => ChannelError::Protocol(other),
        }
    }
}

/// Session-level outcomes surfaced to callers of connect/command operations
#[derive(Error, Debug)]
pub enum SessionError {
    /// Wrong or replayed credential
    #[error("Invalid session token")]
    InvalidToken,

    /// The transport was torn down
    #[error("Channel closed")]
    ChannelClosed,

    /// No response within the authentication or command window
    #[error("Timed out")]
    Timeout,

    /// Malformed or out-of-order message
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// A session is already established or in progress
    #[error("A client is already connected")]
    AlreadyConnected,

    /// Too many failed authentication attempts for this session
    #[error("Too many failed authentication attempts")]
    AttemptsExhausted,

    /// The attempt was cancelled by a concurrent disconnect or shutdown
    #[error("Connection attempt cancelled")]
    Cancelled,

    /// No established session to operate on
    #[error("Not connected")]
    NotConnected,

    /// The service endpoint could not be reached
    #[error("Service unreachable: {0}")]
    Unreachable(String),
}

impl From<ChannelError> for SessionError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Closed | ChannelError::Io(_) => SessionError::ChannelClosed,
            ChannelError::Timeout => SessionError::Timeout,
            ChannelError::Protocol(e) => SessionError::ProtocolViolation(e.to_string()),
        }
    }
}

impl SessionError {
    /// Whether a fresh connection attempt could succeed after this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SessionError::ChannelClosed | SessionError::Timeout | SessionError::Unreachable(_)
        )
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Errors reading the credentials handed over at client launch
#[derive(Error, Debug)]
pub enum LaunchError {
    /// A required launch variable is absent
    #[error("Missing launch variable {0}")]
    Missing(&'static str),

    /// The service address could not be parsed
    #[error("Invalid service address: {0}")]
    InvalidAddress(String),

    /// The token could not be decoded
    #[error("Invalid session token encoding")]
    InvalidToken,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_error_maps_to_session_error() {
        assert!(matches!(
            SessionError::from(ChannelError::Closed),
            SessionError::ChannelClosed
        ));
        assert!(matches!(
            SessionError::from(ChannelError::Timeout),
            SessionError::Timeout
        ));
        assert!(matches!(
            SessionError::from(ChannelError::Protocol(ProtocolError::UnknownMessageType(9))),
            SessionError::ProtocolViolation(_)
        ));
    }

    #[test]
    fn test_protocol_io_error_becomes_channel_io() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        assert!(matches!(
            ChannelError::from(ProtocolError::Io(io)),
            ChannelError::Io(_)
        ));
    }

    #[test]
    fn test_retryable_errors() {
        assert!(SessionError::Timeout.is_retryable());
        assert!(SessionError::Unreachable("refused".into()).is_retryable());
        assert!(!SessionError::InvalidToken.is_retryable());
        assert!(!SessionError::AttemptsExhausted.is_retryable());
    }
}
