//! Established-session driver
//!
//! A `SessionLink` binds one authenticated channel to one connection
//! attempt (its epoch). Once the session reaches `Connected`, [`run`]
//! exchanges heartbeats, answers inbound commands, matches command
//! acknowledgements and returns the reason the link ended. It never touches
//! the state machine itself; the owning [`Session`](crate::Session) maps
//! the outcome onto a transition.
//!
//! [`run`]: SessionLink::run

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use seb_protocol::Message;

use crate::config::HeartbeatConfig;
use crate::error::{ChannelError, SessionError};
use crate::heartbeat::HeartbeatVerdict;
use crate::monitor::ConnectionMonitor;
use crate::traits::{CommandHandler, MessageChannel};

/// Why a link stopped running
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOutcome {
    /// Shut down locally
    Cancelled,
    /// The peer sent `DisconnectNotice`
    PeerDisconnected,
    /// The peer missed this many consecutive heartbeat windows
    HeartbeatExpired(u32),
    /// The channel closed or failed without a notice
    ChannelLost,
    /// The peer sent something the session does not allow
    ProtocolViolation(String),
}

/// One authenticated channel and the bookkeeping for its commands
pub struct SessionLink {
    epoch: u64,
    channel: Arc<dyn MessageChannel>,
    pending_ack: Mutex<Option<oneshot::Sender<Bytes>>>,
    abandoned_acks: AtomicU32,
    command_lock: Mutex<()>,
    cancel: CancellationToken,
}

impl SessionLink {
    pub fn new(epoch: u64, channel: Arc<dyn MessageChannel>) -> Self {
        Self {
            epoch,
            channel,
            pending_ack: Mutex::new(None),
            abandoned_acks: AtomicU32::new(0),
            command_lock: Mutex::new(()),
            cancel: CancellationToken::new(),
        }
    }

    /// Connection attempt this link belongs to
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Underlying channel
    pub fn channel(&self) -> &Arc<dyn MessageChannel> {
        &self.channel
    }

    /// Peer description for logs
    pub fn peer(&self) -> &str {
        self.channel.peer()
    }

    /// Whether the link has been shut down
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Drive the established session until it ends
    pub async fn run(
        &self,
        heartbeat: HeartbeatConfig,
        handler: Option<Arc<dyn CommandHandler>>,
        command_timeout: Duration,
    ) -> LinkOutcome {
        let mut monitor = ConnectionMonitor::new(heartbeat);

        // Cover the peer's first window straight away
        let outcome = match self.channel.send(Message::Heartbeat).await {
            Ok(()) => self.drive(&mut monitor, handler, command_timeout).await,
            Err(e) => self.channel_failure(e),
        };

        // Wake any command still waiting for its acknowledgement
        self.pending_ack.lock().await.take();
        tracing::debug!(
            "Link to {} (epoch {}) ended: {:?}",
            self.peer(),
            self.epoch,
            outcome
        );
        outcome
    }

    async fn drive(
        &self,
        monitor: &mut ConnectionMonitor,
        handler: Option<Arc<dyn CommandHandler>>,
        command_timeout: Duration,
    ) -> LinkOutcome {
        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => return LinkOutcome::Cancelled,

                verdict = monitor.tick() => {
                    if let HeartbeatVerdict::Expired(misses) = verdict {
                        return LinkOutcome::HeartbeatExpired(misses);
                    }
                    if let Err(e) = self.channel.send(Message::Heartbeat).await {
                        return self.channel_failure(e);
                    }
                    tracing::trace!("Heartbeat sent to {}", self.peer());
                }

                received = self.channel.recv() => {
                    let message = match received {
                        Ok(message) => message,
                        Err(e) => return self.channel_failure(e),
                    };
                    if let Some(outcome) = self
                        .dispatch(message, monitor, handler.as_ref(), command_timeout)
                        .await
                    {
                        return outcome;
                    }
                }
            }
        }
    }

    async fn dispatch(
        &self,
        message: Message,
        monitor: &mut ConnectionMonitor,
        handler: Option<&Arc<dyn CommandHandler>>,
        command_timeout: Duration,
    ) -> Option<LinkOutcome> {
        match message {
            Message::Heartbeat => {
                monitor.heartbeat_received();
                None
            }
            Message::Command(payload) => {
                let Some(handler) = handler else {
                    return Some(LinkOutcome::ProtocolViolation(
                        "command received but no handler is registered".to_string(),
                    ));
                };
                // Run off the loop so heartbeats keep flowing while it works
                let handler = Arc::clone(handler);
                let channel = Arc::clone(&self.channel);
                tokio::spawn(async move {
                    match tokio::time::timeout(command_timeout, handler.handle_command(payload))
                        .await
                    {
                        Ok(reply) => {
                            if let Err(e) = channel.send(Message::CommandAck(reply)).await {
                                tracing::debug!("Failed to acknowledge command: {}", e);
                            }
                        }
                        Err(_) => {
                            tracing::warn!("Command handler timed out after {:?}", command_timeout)
                        }
                    }
                });
                None
            }
            Message::CommandAck(payload) => {
                if let Some(waiter) = self.pending_ack.lock().await.take() {
                    let _ = waiter.send(payload);
                    return None;
                }
                // A late reply to a command we stopped waiting for
                let late = self
                    .abandoned_acks
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if late {
                    tracing::debug!("Discarded late command acknowledgement");
                    None
                } else {
                    Some(LinkOutcome::ProtocolViolation(
                        "unsolicited command acknowledgement".to_string(),
                    ))
                }
            }
            Message::DisconnectNotice => {
                tracing::info!("Peer {} requested disconnect", self.peer());
                Some(LinkOutcome::PeerDisconnected)
            }
            Message::AuthenticateRequest(_) | Message::AuthenticateAck => {
                Some(LinkOutcome::ProtocolViolation(format!(
                    "{:?} on an established session",
                    message.message_type()
                )))
            }
        }
    }

    fn channel_failure(&self, error: ChannelError) -> LinkOutcome {
        if self.cancel.is_cancelled() {
            return LinkOutcome::Cancelled;
        }
        match error {
            ChannelError::Protocol(e) => LinkOutcome::ProtocolViolation(e.to_string()),
            ChannelError::Closed | ChannelError::Timeout | ChannelError::Io(_) => {
                LinkOutcome::ChannelLost
            }
        }
    }

    /// Send a command and wait for its acknowledgement.
    ///
    /// Commands are serialized: a second caller waits until the first has
    /// its reply or gives up.
    pub async fn send_command(
        &self,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, SessionError> {
        let _serial = self.command_lock.lock().await;
        if self.cancel.is_cancelled() {
            return Err(SessionError::NotConnected);
        }

        let (tx, rx) = oneshot::channel();
        *self.pending_ack.lock().await = Some(tx);

        if let Err(e) = self.channel.send(Message::Command(payload)).await {
            self.pending_ack.lock().await.take();
            return Err(e.into());
        }

        let waited = tokio::select! {
            _ = self.cancel.cancelled() => return Err(SessionError::ChannelClosed),
            waited = tokio::time::timeout(timeout, rx) => waited,
        };

        match waited {
            Ok(Ok(reply)) => Ok(reply),
            // Link ended and dropped the waiter
            Ok(Err(_)) => Err(SessionError::ChannelClosed),
            Err(_) => {
                if self.pending_ack.lock().await.take().is_some() {
                    self.abandoned_acks.fetch_add(1, Ordering::SeqCst);
                }
                tracing::warn!("Command to {} timed out after {:?}", self.peer(), timeout);
                Err(SessionError::Timeout)
            }
        }
    }

    /// Stop the link without touching the channel
    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Stop the link and close its channel. Idempotent.
    ///
    /// With `notify_peer`, a `DisconnectNotice` is sent first so the peer
    /// can tell a requested disconnect from a crash.
    pub async fn shutdown(&self, notify_peer: bool) {
        self.cancel.cancel();
        if notify_peer && !self.channel.is_closed() {
            if let Err(e) = self.channel.send(Message::DisconnectNotice).await {
                tracing::debug!("Failed to notify {} of disconnect: {}", self.peer(), e);
            }
        }
        self.channel.close().await;
        self.pending_ack.lock().await.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::FramedChannel;
    use async_trait::async_trait;
    use seb_protocol::{SessionToken, TOKEN_LEN};

    const IO_TIMEOUT: Duration = Duration::from_secs(1);
    const COMMAND_TIMEOUT: Duration = Duration::from_millis(500);

    fn heartbeat() -> HeartbeatConfig {
        HeartbeatConfig {
            interval: Duration::from_millis(100),
            miss_threshold: 3,
        }
    }

    fn pair() -> (Arc<SessionLink>, Arc<FramedChannel>) {
        let (a, b) = tokio::io::duplex(4096);
        let local: Arc<dyn MessageChannel> = Arc::new(FramedChannel::new(a, IO_TIMEOUT, "peer"));
        (
            Arc::new(SessionLink::new(1, local)),
            Arc::new(FramedChannel::new(b, IO_TIMEOUT, "local")),
        )
    }

    fn spawn_run(
        link: &Arc<SessionLink>,
        handler: Option<Arc<dyn CommandHandler>>,
    ) -> tokio::task::JoinHandle<LinkOutcome> {
        let link = Arc::clone(link);
        tokio::spawn(async move { link.run(heartbeat(), handler, COMMAND_TIMEOUT).await })
    }

    struct Upper;

    #[async_trait]
    impl CommandHandler for Upper {
        async fn handle_command(&self, payload: Bytes) -> Bytes {
            Bytes::from(payload.to_ascii_uppercase())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_expires() {
        let (link, _remote) = pair();
        let outcome = spawn_run(&link, None).await.unwrap();
        assert_eq!(outcome, LinkOutcome::HeartbeatExpired(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_keep_link_alive() {
        let (link, remote) = pair();
        let running = spawn_run(&link, None);

        for _ in 0..10 {
            remote.send(Message::Heartbeat).await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(!running.is_finished());

        link.shutdown(false).await;
        assert_eq!(running.await.unwrap(), LinkOutcome::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_sends_heartbeats() {
        let (link, remote) = pair();
        let _running = spawn_run(&link, None);

        assert_eq!(remote.recv().await.unwrap(), Message::Heartbeat);
        assert_eq!(remote.recv().await.unwrap(), Message::Heartbeat);
    }

    #[tokio::test]
    async fn test_disconnect_notice_ends_link() {
        let (link, remote) = pair();
        let running = spawn_run(&link, None);

        remote.send(Message::DisconnectNotice).await.unwrap();
        assert_eq!(running.await.unwrap(), LinkOutcome::PeerDisconnected);
    }

    #[tokio::test]
    async fn test_eof_is_channel_lost() {
        let (link, remote) = pair();
        let running = spawn_run(&link, None);

        remote.close().await;
        assert_eq!(running.await.unwrap(), LinkOutcome::ChannelLost);
    }

    #[tokio::test]
    async fn test_authenticate_after_connect_is_violation() {
        let (link, remote) = pair();
        let running = spawn_run(&link, None);

        remote
            .send(Message::AuthenticateRequest(SessionToken::from_bytes(
                [1; TOKEN_LEN],
            )))
            .await
            .unwrap();
        assert!(matches!(
            running.await.unwrap(),
            LinkOutcome::ProtocolViolation(_)
        ));
    }

    #[tokio::test]
    async fn test_command_without_handler_is_violation() {
        let (link, remote) = pair();
        let running = spawn_run(&link, None);

        remote
            .send(Message::Command(Bytes::from_static(b"lock")))
            .await
            .unwrap();
        assert!(matches!(
            running.await.unwrap(),
            LinkOutcome::ProtocolViolation(_)
        ));
    }

    #[tokio::test]
    async fn test_unsolicited_ack_is_violation() {
        let (link, remote) = pair();
        let running = spawn_run(&link, None);

        remote
            .send(Message::CommandAck(Bytes::from_static(b"?")))
            .await
            .unwrap();
        assert!(matches!(
            running.await.unwrap(),
            LinkOutcome::ProtocolViolation(_)
        ));
    }

    #[tokio::test]
    async fn test_inbound_command_is_answered() {
        let (link, remote) = pair();
        let _running = spawn_run(&link, Some(Arc::new(Upper)));

        remote
            .send(Message::Command(Bytes::from_static(b"quit")))
            .await
            .unwrap();
        loop {
            match remote.recv().await.unwrap() {
                Message::Heartbeat => continue,
                other => {
                    assert_eq!(other, Message::CommandAck(Bytes::from_static(b"QUIT")));
                    break;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_send_command_gets_reply() {
        let (link, remote) = pair();
        let _running = spawn_run(&link, None);

        let responder = tokio::spawn(async move {
            loop {
                match remote.recv().await.unwrap() {
                    Message::Command(payload) => {
                        remote.send(Message::CommandAck(payload)).await.unwrap();
                        return remote;
                    }
                    _ => continue,
                }
            }
        });

        let reply = link
            .send_command(Bytes::from_static(b"ping"), COMMAND_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(reply, Bytes::from_static(b"ping"));
        responder.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_ack_after_timeout_is_discarded() {
        let (link, remote) = pair();
        let running = spawn_run(&link, None);

        let result = link
            .send_command(Bytes::from_static(b"slow"), Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(SessionError::Timeout)));

        remote
            .send(Message::CommandAck(Bytes::from_static(b"slow")))
            .await
            .unwrap();
        remote.send(Message::Heartbeat).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!running.is_finished());
    }

    #[tokio::test]
    async fn test_shutdown_notifies_peer() {
        let (link, remote) = pair();
        let running = spawn_run(&link, None);

        link.shutdown(true).await;
        assert_eq!(running.await.unwrap(), LinkOutcome::Cancelled);

        let mut saw_notice = false;
        while let Ok(message) = remote.recv().await {
            if message == Message::DisconnectNotice {
                saw_notice = true;
            }
        }
        assert!(saw_notice);
    }

    #[tokio::test]
    async fn test_send_command_after_shutdown() {
        let (link, _remote) = pair();
        link.shutdown(false).await;
        let result = link
            .send_command(Bytes::from_static(b"x"), COMMAND_TIMEOUT)
            .await;
        assert!(matches!(result, Err(SessionError::NotConnected)));
    }
}
