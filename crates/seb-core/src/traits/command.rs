//! Command handling trait

use async_trait::async_trait;
use bytes::Bytes;

/// Handles `Command` payloads sent by the peer
///
/// Payloads are opaque to the session layer. The returned bytes are sent
/// back as the `CommandAck` payload.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Handle one command and produce its acknowledgement payload
    async fn handle_command(&self, payload: Bytes) -> Bytes;
}
