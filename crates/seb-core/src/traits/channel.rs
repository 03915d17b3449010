//! Transport channel trait

use std::time::Duration;

use async_trait::async_trait;
use seb_protocol::Message;

use crate::error::ChannelError;

/// A bidirectional, message-oriented connection to the peer process
///
/// Messages are delivered whole or not at all. Once `close` has been called
/// (by either side or by a failure handler) every pending and future
/// `send`/`recv` fails with [`ChannelError::Closed`]. The channel performs
/// no authentication.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Send one message, bounded by the channel's I/O timeout
    async fn send(&self, message: Message) -> Result<(), ChannelError>;

    /// Receive the next complete message.
    ///
    /// Waits until a message arrives or the channel closes. Cancel safe.
    async fn recv(&self) -> Result<Message, ChannelError>;

    /// Receive the next message within `timeout`
    async fn recv_timeout(&self, timeout: Duration) -> Result<Message, ChannelError> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(result) => result,
            Err(_) => Err(ChannelError::Timeout),
        }
    }

    /// Close the channel. Idempotent.
    async fn close(&self);

    /// Whether the channel has been closed
    fn is_closed(&self) -> bool;

    /// Peer description for logs
    fn peer(&self) -> &str;
}
