//! Client proxy
//!
//! The service's handle on "the current client, if any". It checks the
//! token a client presents, drives the session through the handshake and
//! forwards commands once the client is connected. At most one client is
//! connected at a time; a second `connect` while a session exists is
//! refused without touching it.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::{broadcast, watch};

use seb_core::auth::{validate_token, AttemptGate};
use seb_core::config::ServiceConfig;
use seb_core::traits::{CommandHandler, MessageChannel};
use seb_core::{
    ConnectionState, Session, SessionError, SessionEvent, SessionSettings, StateSnapshot,
    Transition,
};
use seb_protocol::{Message, SessionToken};

const ROLE: &str = "service";

/// Service-side endpoint for the browser client
pub struct ClientProxy {
    session: Arc<Session>,
    token: Mutex<Option<SessionToken>>,
    gate: AttemptGate,
}

impl ClientProxy {
    /// Create a proxy that accepts `token` for this exam session
    pub fn new(token: SessionToken, settings: SessionSettings, max_failed_attempts: u32) -> Self {
        Self {
            session: Arc::new(Session::new(ROLE, settings)),
            token: Mutex::new(Some(token)),
            gate: AttemptGate::new(max_failed_attempts),
        }
    }

    /// Create a proxy from the service configuration
    pub fn from_config(token: SessionToken, config: &ServiceConfig) -> Self {
        Self::new(token, config.session_settings(), config.max_failed_attempts)
    }

    /// Answer commands sent by the client. Call before the first `connect`.
    pub fn with_command_handler(mut self, handler: Arc<dyn CommandHandler>) -> Self {
        let settings = self.session.settings().clone();
        self.session = Arc::new(Session::new(ROLE, settings).with_command_handler(handler));
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

    /// Subscribe to client connected / lost events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.session.subscribe()
    }

    /// Subscribe to every applied state transition
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<Transition> {
        self.session.subscribe_transitions()
    }

    /// Whether too many bad tokens have been presented
    pub fn is_locked_out(&self) -> bool {
        self.gate.is_locked()
    }

    /// Bad tokens presented since the last successful authentication
    pub fn failed_attempts(&self) -> u32 {
        self.gate.failures()
    }

    /// Whether `candidate` would be accepted right now.
    ///
    /// True only if it equals the session token and no client is connected
    /// (state `Disconnected` or `Connecting`).
    pub fn validate(&self, candidate: &SessionToken) -> bool {
        let state = self.session.state();
        if !matches!(
            state,
            ConnectionState::Disconnected | ConnectionState::Connecting
        ) {
            return false;
        }
        let token = self.token.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match token.as_ref() {
            Some(expected) => validate_token(candidate, expected),
            None => false,
        }
    }

    /// Authenticate a client over `channel`; true only on reaching `Connected`
    pub async fn connect(&self, candidate: &SessionToken, channel: Arc<dyn MessageChannel>) -> bool {
        self.try_connect(candidate, channel).await.is_ok()
    }

    /// Authenticate a client over `channel`.
    ///
    /// On `AlreadyConnected` and `AttemptsExhausted` the channel is left
    /// untouched for the caller to dispose of. On any other failure the
    /// channel has been closed. Dropping the future before it completes
    /// returns the proxy to `Disconnected`.
    pub async fn try_connect(
        &self,
        candidate: &SessionToken,
        channel: Arc<dyn MessageChannel>,
    ) -> Result<(), SessionError> {
        if self.gate.is_locked() {
            tracing::warn!("Refusing client {}: too many failed attempts", channel.peer());
            return Err(SessionError::AttemptsExhausted);
        }

        let link = self.session.begin(channel)?;
        let _guard = self.session.guard_attempt(&link);

        if !self.validate(candidate) {
            let failures = self.gate.record_failure();
            tracing::warn!(
                "Client {} presented an invalid token ({}/{} failed attempts)",
                link.peer(),
                failures,
                self.gate.limit()
            );
            self.session.abandon(&link, true).await;
            return Err(SessionError::InvalidToken);
        }
        self.gate.reset();

        if let Err(e) = self.session.authenticate(&link) {
            self.session.abandon(&link, true).await;
            return Err(e);
        }

        if let Err(e) = link.channel().send(Message::AuthenticateAck).await {
            tracing::warn!("Failed to acknowledge client {}: {}", link.peer(), e);
            self.session.abandon(&link, false).await;
            return Err(e.into());
        }

        if let Err(e) = self.session.establish(&link) {
            self.session.abandon(&link, true).await;
            return Err(e);
        }
        Ok(())
    }

    /// Disconnect the client, whatever the state. Idempotent; ends in
    /// `Disconnected`.
    pub async fn disconnect(&self) {
        self.session.disconnect().await;
    }

    /// Disconnect on behalf of the user interface
    pub async fn request_disconnect(&self) {
        tracing::info!("Disconnect requested");
        self.disconnect().await;
    }

    /// Forward a command to the connected client and wait for its reply
    pub async fn send_command(&self, payload: Bytes) -> Result<Bytes, SessionError> {
        self.session.send_command(payload).await
    }

    /// End the exam session: disconnect and discard the token for good
    pub async fn end_session(&self) {
        self.disconnect().await;
        // Dropping the token zeroes it
        let discarded = self
            .token
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if discarded.is_some() {
            tracing::info!("Session ended, token discarded");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use seb_core::channel::FramedChannel;
    use seb_protocol::TOKEN_LEN;
    use std::time::Duration;

    fn token() -> SessionToken {
        SessionToken::from_bytes([0x42; TOKEN_LEN])
    }

    fn channel() -> (Arc<dyn MessageChannel>, FramedChannel) {
        let (a, b) = tokio::io::duplex(4096);
        (
            Arc::new(FramedChannel::new(a, Duration::from_secs(1), "client")),
            FramedChannel::new(b, Duration::from_secs(1), "service"),
        )
    }

    #[test]
    fn test_validate_checks_token() {
        let proxy = ClientProxy::new(token(), SessionSettings::default(), 3);
        assert!(proxy.validate(&token()));
        assert!(!proxy.validate(&SessionToken::from_bytes([0; TOKEN_LEN])));
    }

    #[tokio::test]
    async fn test_validate_rejects_while_connected() {
        let proxy = ClientProxy::new(token(), SessionSettings::default(), 3);
        let (local, _remote) = channel();
        assert!(proxy.connect(&token(), local).await);
        assert!(!proxy.validate(&token()));
    }

    #[tokio::test]
    async fn test_end_session_discards_token() {
        let proxy = ClientProxy::new(token(), SessionSettings::default(), 3);
        proxy.end_session().await;
        assert!(!proxy.validate(&token()));

        let (local, _remote) = channel();
        assert!(!proxy.connect(&token(), local).await);
        assert_eq!(proxy.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_successful_connect_resets_failures() {
        let proxy = ClientProxy::new(token(), SessionSettings::default(), 3);
        let (bad, _r1) = channel();
        assert!(!proxy.connect(&SessionToken::from_bytes([1; TOKEN_LEN]), bad).await);
        assert_eq!(proxy.failed_attempts(), 1);

        let (good, _r2) = channel();
        assert!(proxy.connect(&token(), good).await);
        assert_eq!(proxy.failed_attempts(), 0);
    }
}
