//! Outbound connector to the lockdown service
//!
//! Dials the service on loopback, presents the session token and, once the
//! service acknowledges it, supervises the session with the same state
//! machine and link driver the service runs. On this side `Authenticating`
//! means the token is on the wire and the verdict is outstanding.

use std::sync::Arc;

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};

use seb_core::channel::FramedChannel;
use seb_core::config::ClientConfig;
use seb_core::launch::LaunchCredentials;
use seb_core::link::SessionLink;
use seb_core::traits::{CommandHandler, MessageChannel};
use seb_core::{
    ChannelError, ConnectionState, Session, SessionError, SessionEvent, StateSnapshot,
    Transition,
};
use seb_protocol::Message;

use super::reconnect::ExponentialBackoff;

const ROLE: &str = "client";

/// Browser-side endpoint for the lockdown service
pub struct ServiceConnector {
    session: Arc<Session>,
    credentials: LaunchCredentials,
    config: ClientConfig,
}

impl ServiceConnector {
    pub fn new(credentials: LaunchCredentials, config: ClientConfig) -> Self {
        Self {
            session: Arc::new(Session::new(ROLE, config.session_settings())),
            credentials,
            config,
        }
    }

    /// Answer commands sent by the service. Call before the first `connect`.
    pub fn with_command_handler(mut self, handler: Arc<dyn CommandHandler>) -> Self {
        self.session = Arc::new(
            Session::new(ROLE, self.config.session_settings()).with_command_handler(handler),
        );
        self
    }

    /// Underlying session
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Current state; may be stale by the time it is read
    pub fn state(&self) -> ConnectionState {
        self.session.state()
    }

    /// Receiver that always holds the latest state (for display)
    pub fn watch_state(&self) -> watch::Receiver<StateSnapshot> {
        self.session.watch_state()
    }

    /// Subscribe to service connected / lost events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.session.subscribe()
    }

    /// Subscribe to every applied state transition
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<Transition> {
        self.session.subscribe_transitions()
    }

    /// Dial the service once and authenticate.
    ///
    /// Cancel safe: dropping the future mid-handshake leaves the connector
    /// `Disconnected`.
    pub async fn connect(&self) -> Result<(), SessionError> {
        if self.session.state() != ConnectionState::Disconnected {
            return Err(SessionError::AlreadyConnected);
        }

        let address = self.credentials.address;
        tracing::debug!("Connecting to service at {}", address);
        let stream = match tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(address),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(SessionError::Unreachable(format!("{}: {}", address, e))),
            Err(_) => {
                return Err(SessionError::Unreachable(format!(
                    "{}: connect timed out after {:?}",
                    address, self.config.connect_timeout
                )))
            }
        };

        let channel = Arc::new(FramedChannel::from_tcp(stream, self.config.io_timeout));
        self.connect_over(channel).await
    }

    /// Authenticate over an already open channel
    pub async fn connect_over(&self, channel: Arc<dyn MessageChannel>) -> Result<(), SessionError> {
        let link = match self.session.begin(Arc::clone(&channel)) {
            Ok(link) => link,
            Err(e) => {
                channel.close().await;
                return Err(e);
            }
        };
        let _guard = self.session.guard_attempt(&link);

        let request = Message::AuthenticateRequest(self.credentials.token.clone());
        if let Err(e) = link.channel().send(request).await {
            return Err(self.fail(&link, e).await);
        }
        if let Err(e) = self.session.authenticate(&link) {
            self.session.abandon(&link, true).await;
            return Err(e);
        }

        match link.channel().recv_timeout(self.config.auth_timeout).await {
            Ok(Message::AuthenticateAck) => {
                if let Err(e) = self.session.establish(&link) {
                    self.session.abandon(&link, true).await;
                    return Err(e);
                }
                Ok(())
            }
            Ok(Message::DisconnectNotice) => {
                tracing::warn!("Service rejected the session token");
                self.session.abandon(&link, false).await;
                Err(SessionError::InvalidToken)
            }
            Ok(other) => {
                let detail = format!("expected AuthenticateAck, got {:?}", other.message_type());
                tracing::warn!("Service broke the handshake: {}", detail);
                self.session.abandon(&link, true).await;
                Err(SessionError::ProtocolViolation(detail))
            }
            Err(ChannelError::Timeout) => {
                tracing::warn!(
                    "Service did not answer within {:?}",
                    self.config.auth_timeout
                );
                self.session.abandon(&link, true).await;
                Err(SessionError::Timeout)
            }
            Err(e) => Err(self.fail(&link, e).await),
        }
    }

    async fn fail(&self, link: &SessionLink, error: ChannelError) -> SessionError {
        if link.is_cancelled() {
            return SessionError::Cancelled;
        }
        self.session.abandon(link, false).await;
        error.into()
    }

    /// Connect, retrying transient failures with exponential backoff.
    ///
    /// A rejected token is final and is not retried.
    pub async fn connect_with_retry(&self) -> Result<(), SessionError> {
        let mut backoff = ExponentialBackoff::from_config(&self.config.backoff);
        let max_attempts = self.config.max_connect_attempts;
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        "Connection attempt {}/{} failed: {}; retrying in {:?}",
                        attempt,
                        max_attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_retryable() => {
                    tracing::error!("Giving up after {} attempts: {}", attempt, e);
                    return Err(SessionError::AttemptsExhausted);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Disconnect from the service, whatever the state. Idempotent.
    pub async fn disconnect(&self) {
        self.session.disconnect().await;
    }

    /// Send a command to the service and wait for its reply
    pub async fn send_command(&self, payload: Bytes) -> Result<Bytes, SessionError> {
        self.session.send_command(payload).await
    }
}
