//! Session lifecycle
//!
//! `Session` owns one [`StateMachine`] and the link of the current
//! connection attempt. Both ends of the channel use it: the service's
//! `ClientProxy` and the browser's `ServiceConnector` drive the handshake
//! through [`begin`], [`authenticate`] and [`establish`], after which a
//! background driver supervises the link until it ends.
//!
//! Events are published inside the state machine's critical section, so
//! `Connected` always precedes the matching `Lost`, and `Lost` is raised
//! exactly once per established session.
//!
//! [`begin`]: Session::begin
//! [`authenticate`]: Session::authenticate
//! [`establish`]: Session::establish

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, watch};

use crate::config::HeartbeatConfig;
use crate::error::SessionError;
use crate::events::{LostReason, SessionEvent};
use crate::link::{LinkOutcome, SessionLink};
use crate::state::{ConnectionState, StateMachine, StateSnapshot, Transition};
use crate::traits::{CommandHandler, MessageChannel};

/// Capacity of the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Timing for an established session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    /// Heartbeat policy
    pub heartbeat: HeartbeatConfig,
    /// Bound on channel sends
    pub io_timeout: Duration,
    /// How long to wait for a `CommandAck`
    pub command_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            heartbeat: HeartbeatConfig::default(),
            io_timeout: Duration::from_millis(2000),
            command_timeout: Duration::from_millis(5000),
        }
    }
}

/// One exam session as seen from one end of the channel
pub struct Session {
    role: &'static str,
    settings: SessionSettings,
    state: StateMachine,
    events: broadcast::Sender<SessionEvent>,
    link: Mutex<Option<Arc<SessionLink>>>,
    handler: Option<Arc<dyn CommandHandler>>,
}

impl Session {
    /// Create a session in `Disconnected`. `role` names this end in logs.
    ///
    /// A heartbeat policy that fails validation is clamped to the nearest
    /// valid one.
    pub fn new(role: &'static str, mut settings: SessionSettings) -> Self {
        if let Err(e) = settings.heartbeat.validate() {
            tracing::warn!("{}: {}; clamping heartbeat policy", role, e);
            settings.heartbeat = settings.heartbeat.clamped();
        }
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            role,
            settings,
            state: StateMachine::new(),
            events,
            link: Mutex::new(None),
            handler: None,
        }
    }

    /// Answer the peer's commands with `handler`
    pub fn with_command_handler(mut self, handler: Arc<dyn CommandHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Session timing
    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Current state; may be stale by the time it is read
    pub fn state(&self) -> ConnectionState {
        self.state.state()
    }

    /// Current state and epoch; may be stale by the time it is read
    pub fn snapshot(&self) -> StateSnapshot {
        self.state.snapshot()
    }

    /// Receiver that always holds the latest state
    pub fn watch_state(&self) -> watch::Receiver<StateSnapshot> {
        self.state.watch()
    }

    /// Subscribe to `Connected` / `Lost` events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Subscribe to every applied state transition
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<Transition> {
        self.state.subscribe_transitions()
    }

    /// Link of the current attempt, if any
    pub fn link(&self) -> Option<Arc<SessionLink>> {
        self.lock_link().clone()
    }

    /// Start a connection attempt over `channel`: `Disconnected -> Connecting`.
    ///
    /// Fails with `AlreadyConnected` in any other state; the channel is left
    /// to the caller in that case.
    pub fn begin(&self, channel: Arc<dyn MessageChannel>) -> Result<Arc<SessionLink>, SessionError> {
        // Held across the transition so a concurrent disconnect finds the link
        let mut slot = self.lock_link();
        let epoch = self.state.begin().map_err(|current| {
            tracing::debug!(
                "{}: refusing new attempt while {}",
                self.role,
                current.state
            );
            SessionError::AlreadyConnected
        })?;
        let link = Arc::new(SessionLink::new(epoch, channel));
        *slot = Some(Arc::clone(&link));
        tracing::debug!("{}: attempt {} started with {}", self.role, epoch, link.peer());
        Ok(link)
    }

    /// Guard the attempt on `link` until it is established or abandoned.
    ///
    /// If the handshake future is dropped while the attempt is still
    /// pending, the guard moves the session back to `Disconnected` and shuts
    /// the link down.
    pub fn guard_attempt(&self, link: &Arc<SessionLink>) -> AttemptGuard<'_> {
        AttemptGuard {
            session: self,
            link: Arc::clone(link),
        }
    }

    /// Token accepted (or presented): `Connecting -> Authenticating`
    pub fn authenticate(&self, link: &SessionLink) -> Result<(), SessionError> {
        self.state
            .transition(
                link.epoch(),
                &[ConnectionState::Connecting],
                ConnectionState::Authenticating,
            )
            .map(|_| ())
            .map_err(|_| SessionError::Cancelled)
    }

    /// Acknowledgement exchanged: `Authenticating -> Connected`.
    ///
    /// Publishes `Connected` and spawns the link driver.
    pub fn establish(self: &Arc<Self>, link: &Arc<SessionLink>) -> Result<(), SessionError> {
        let epoch = link.epoch();
        self.state
            .apply(
                |current| {
                    (current.epoch == epoch && current.state == ConnectionState::Authenticating)
                        .then_some(ConnectionState::Connected)
                },
                |_| self.emit(SessionEvent::Connected),
            )
            .map_err(|_| SessionError::Cancelled)?;

        tracing::info!("{}: session established with {}", self.role, link.peer());

        let session = Arc::clone(self);
        let link = Arc::clone(link);
        tokio::spawn(async move {
            let outcome = link
                .run(
                    session.settings.heartbeat.clone(),
                    session.handler.clone(),
                    session.settings.command_timeout,
                )
                .await;
            session.finish(link.epoch(), outcome).await;
        });
        Ok(())
    }

    /// Give up on a pending attempt: `Connecting/Authenticating -> Disconnected`.
    ///
    /// The link is shut down whether or not the transition applied.
    pub async fn abandon(&self, link: &SessionLink, notify_peer: bool) {
        let epoch = link.epoch();
        let _ = self.state.transition_with(|current| {
            (current.epoch == epoch && current.state.is_pending())
                .then_some(ConnectionState::Disconnected)
        });
        self.take_link(epoch);
        link.shutdown(notify_peer).await;
    }

    /// Disconnect from whatever state the session is in. Idempotent.
    ///
    /// - `Connected`: notify the peer, publish `Lost(Requested)`, pass
    ///   through `Disconnecting`
    /// - `Connecting`/`Authenticating`: cancel the attempt
    /// - `Faulted`: reset
    /// - `Disconnecting`: wait for the teardown in progress
    ///
    /// Returns once the session has reached `Disconnected`.
    pub async fn disconnect(&self) {
        let applied = self.state.apply(
            |current| match current.state {
                ConnectionState::Connected => Some(ConnectionState::Disconnecting),
                ConnectionState::Connecting
                | ConnectionState::Authenticating
                | ConnectionState::Faulted => Some(ConnectionState::Disconnected),
                ConnectionState::Disconnecting | ConnectionState::Disconnected => None,
            },
            |transition| {
                if transition.from == ConnectionState::Connected {
                    self.emit(SessionEvent::Lost(LostReason::Requested));
                }
            },
        );

        match applied {
            Ok(previous) => {
                let link = self.take_link(previous.epoch);
                match previous.state {
                    ConnectionState::Connected => {
                        tracing::info!("{}: disconnecting", self.role);
                        if let Some(link) = link {
                            link.shutdown(true).await;
                        }
                        let _ = self.state.transition(
                            previous.epoch,
                            &[ConnectionState::Disconnecting],
                            ConnectionState::Disconnected,
                        );
                    }
                    ConnectionState::Faulted => {
                        tracing::info!("{}: faulted session reset", self.role);
                        if let Some(link) = link {
                            link.shutdown(false).await;
                        }
                    }
                    _ => {
                        tracing::info!("{}: pending attempt cancelled", self.role);
                        if let Some(link) = link {
                            link.shutdown(true).await;
                        }
                    }
                }
            }
            Err(current) if current.state == ConnectionState::Disconnecting => {
                self.state.settled().await;
            }
            Err(_) => {}
        }
    }

    /// Send a command to the peer and wait for its acknowledgement
    pub async fn send_command(&self, payload: Bytes) -> Result<Bytes, SessionError> {
        let snapshot = self.state.snapshot();
        if snapshot.state != ConnectionState::Connected {
            return Err(SessionError::NotConnected);
        }
        let link = self
            .link()
            .filter(|link| link.epoch() == snapshot.epoch)
            .ok_or(SessionError::NotConnected)?;
        link.send_command(payload, self.settings.command_timeout)
            .await
    }

    /// Map a finished link onto the state machine
    async fn finish(&self, epoch: u64, outcome: LinkOutcome) {
        match outcome {
            // Whoever cancelled owns the transition
            LinkOutcome::Cancelled => {}
            LinkOutcome::PeerDisconnected => {
                let applied = self.state.apply(
                    |current| {
                        (current.epoch == epoch && current.state == ConnectionState::Connected)
                            .then_some(ConnectionState::Disconnecting)
                    },
                    |_| self.emit(SessionEvent::Lost(LostReason::Requested)),
                );
                if applied.is_ok() {
                    tracing::info!("{}: peer disconnected", self.role);
                    if let Some(link) = self.take_link(epoch) {
                        link.shutdown(false).await;
                    }
                    let _ = self.state.transition(
                        epoch,
                        &[ConnectionState::Disconnecting],
                        ConnectionState::Disconnected,
                    );
                }
            }
            LinkOutcome::HeartbeatExpired(misses) => {
                tracing::warn!(
                    "{}: peer missed {} heartbeats, session faulted",
                    self.role,
                    misses
                );
                self.fault(epoch, LostReason::Timeout).await;
            }
            // Severed without a notice counts as lost liveness
            LinkOutcome::ChannelLost => {
                tracing::warn!("{}: channel lost without notice, session faulted", self.role);
                self.fault(epoch, LostReason::Timeout).await;
            }
            LinkOutcome::ProtocolViolation(detail) => {
                tracing::warn!("{}: protocol violation ({}), session faulted", self.role, detail);
                self.fault(epoch, LostReason::Faulted).await;
            }
        }
    }

    async fn fault(&self, epoch: u64, reason: LostReason) {
        let applied = self.state.apply(
            |current| {
                (current.epoch == epoch && current.state == ConnectionState::Connected)
                    .then_some(ConnectionState::Faulted)
            },
            |_| self.emit(SessionEvent::Lost(reason)),
        );
        if applied.is_ok() {
            if let Some(link) = self.take_link(epoch) {
                link.shutdown(false).await;
            }
        }
    }

    /// Synchronous half of [`abandon`](Self::abandon), for drop paths
    fn drop_attempt(&self, link: &Arc<SessionLink>) {
        let epoch = link.epoch();
        let applied = self.state.transition_with(|current| {
            (current.epoch == epoch && current.state.is_pending())
                .then_some(ConnectionState::Disconnected)
        });
        if applied.is_err() {
            return;
        }

        tracing::info!("{}: attempt {} dropped before completing", self.role, epoch);
        self.take_link(epoch);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let link = Arc::clone(link);
                // A write may have been cut off mid-frame, so no notice
                handle.spawn(async move { link.shutdown(false).await });
            }
            Err(_) => link.cancel(),
        }
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn take_link(&self, epoch: u64) -> Option<Arc<SessionLink>> {
        let mut slot = self.lock_link();
        if slot.as_ref().is_some_and(|link| link.epoch() == epoch) {
            slot.take()
        } else {
            None
        }
    }

    fn lock_link(&self) -> MutexGuard<'_, Option<Arc<SessionLink>>> {
        self.link.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Abandons a pending connection attempt when dropped.
///
/// Does nothing once the attempt has left `Connecting`/`Authenticating`
/// or a newer attempt has begun.
pub struct AttemptGuard<'a> {
    session: &'a Session,
    link: Arc<SessionLink>,
}

impl AttemptGuard<'_> {
    /// Link of the guarded attempt
    pub fn link(&self) -> &Arc<SessionLink> {
        &self.link
    }
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        self.session.drop_attempt(&self.link);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::FramedChannel;
    use seb_protocol::Message;

    fn settings() -> SessionSettings {
        SessionSettings {
            heartbeat: HeartbeatConfig {
                interval: Duration::from_millis(100),
                miss_threshold: 3,
            },
            io_timeout: Duration::from_secs(1),
            command_timeout: Duration::from_millis(500),
        }
    }

    fn channel_pair() -> (Arc<dyn MessageChannel>, Arc<FramedChannel>) {
        let (a, b) = tokio::io::duplex(4096);
        (
            Arc::new(FramedChannel::new(a, Duration::from_secs(1), "peer")),
            Arc::new(FramedChannel::new(b, Duration::from_secs(1), "session")),
        )
    }

    async fn connected() -> (Arc<Session>, Arc<FramedChannel>) {
        let session = Arc::new(Session::new("test", settings()));
        let (local, remote) = channel_pair();
        let link = session.begin(local).unwrap();
        session.authenticate(&link).unwrap();
        session.establish(&link).unwrap();
        (session, remote)
    }

    #[tokio::test]
    async fn test_establish_publishes_connected() {
        let session = Arc::new(Session::new("test", settings()));
        let mut events = session.subscribe();
        let (local, _remote) = channel_pair();

        let link = session.begin(local).unwrap();
        assert_eq!(session.state(), ConnectionState::Connecting);
        session.authenticate(&link).unwrap();
        assert_eq!(session.state(), ConnectionState::Authenticating);
        session.establish(&link).unwrap();
        assert_eq!(session.state(), ConnectionState::Connected);
        assert_eq!(events.try_recv().unwrap(), SessionEvent::Connected);
    }

    #[tokio::test]
    async fn test_begin_refused_unless_disconnected() {
        let (session, _remote) = connected().await;
        let (other, _other_remote) = channel_pair();
        assert!(matches!(
            session.begin(other),
            Err(SessionError::AlreadyConnected)
        ));
        assert_eq!(session.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_disconnect_from_connected() {
        let (session, remote) = connected().await;
        let mut events = session.subscribe();

        session.disconnect().await;
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::Lost(LostReason::Requested)
        );

        let mut saw_notice = false;
        while let Ok(message) = remote.recv().await {
            saw_notice |= message == Message::DisconnectNotice;
        }
        assert!(saw_notice);
    }

    #[tokio::test]
    async fn test_disconnect_twice_is_quiet() {
        let (session, _remote) = connected().await;
        let mut events = session.subscribe();

        session.disconnect().await;
        session.disconnect().await;
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(events.try_recv().is_ok());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_cancels_pending_attempt() {
        let session = Arc::new(Session::new("test", settings()));
        let (local, _remote) = channel_pair();
        let link = session.begin(local).unwrap();

        session.disconnect().await;
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(link.is_cancelled());
        assert!(matches!(
            session.authenticate(&link),
            Err(SessionError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_abandon_pending_attempt() {
        let session = Arc::new(Session::new("test", settings()));
        let (local, _remote) = channel_pair();
        let link = session.begin(local).unwrap();
        session.authenticate(&link).unwrap();

        session.abandon(&link, false).await;
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(link.channel().is_closed());
    }

    #[tokio::test]
    async fn test_peer_notice_is_requested_loss() {
        let (session, remote) = connected().await;
        let mut events = session.subscribe();
        let mut state = session.watch_state();

        remote.send(Message::DisconnectNotice).await.unwrap();
        state
            .wait_for(|s| s.state == ConnectionState::Disconnected)
            .await
            .unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::Lost(LostReason::Requested)
        );
    }

    #[tokio::test]
    async fn test_eof_faults_session() {
        let (session, remote) = connected().await;
        let mut events = session.subscribe();
        let mut state = session.watch_state();

        remote.close().await;
        state
            .wait_for(|s| s.state == ConnectionState::Faulted)
            .await
            .unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::Lost(LostReason::Timeout)
        );
        assert!(events.try_recv().is_err());

        // Faulted holds until an explicit reset
        session.disconnect().await;
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_times_out() {
        let (session, _remote) = connected().await;
        let mut events = session.subscribe();

        tokio::time::sleep(settings().heartbeat.detection_window()).await;
        assert_eq!(session.state(), ConnectionState::Faulted);
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::Lost(LostReason::Timeout)
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_command_requires_connected() {
        let session = Session::new("test", settings());
        let result = session.send_command(Bytes::from_static(b"x")).await;
        assert!(matches!(result, Err(SessionError::NotConnected)));
    }

    #[tokio::test]
    async fn test_new_attempt_after_fault_reset() {
        let (session, remote) = connected().await;
        let mut state = session.watch_state();
        remote.close().await;
        state
            .wait_for(|s| s.state == ConnectionState::Faulted)
            .await
            .unwrap();

        session.disconnect().await;
        let (local, _remote) = channel_pair();
        let link = session.begin(local).unwrap();
        assert!(link.epoch() > 1);
    }

    #[tokio::test]
    async fn test_dropped_guard_resets_pending_attempt() {
        let session = Arc::new(Session::new("test", settings()));
        let (local, remote) = channel_pair();
        let link = session.begin(local).unwrap();
        session.authenticate(&link).unwrap();

        drop(session.guard_attempt(&link));
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(session.link().is_none());

        // The peer sees the channel close
        assert!(remote.recv().await.is_err());
        assert!(link.is_cancelled());

        let (fresh, _fresh_remote) = channel_pair();
        assert!(session.begin(fresh).is_ok());
    }

    #[tokio::test]
    async fn test_guard_is_inert_after_establish() {
        let session = Arc::new(Session::new("test", settings()));
        let (local, _remote) = channel_pair();
        let link = session.begin(local).unwrap();
        let guard = session.guard_attempt(&link);
        session.authenticate(&link).unwrap();
        session.establish(&link).unwrap();

        drop(guard);
        assert_eq!(session.state(), ConnectionState::Connected);
        assert!(!link.is_cancelled());
    }

    #[tokio::test]
    async fn test_stale_guard_leaves_newer_attempt_alone() {
        let session = Arc::new(Session::new("test", settings()));
        let (local, _remote) = channel_pair();
        let old = session.begin(local).unwrap();
        let guard = session.guard_attempt(&old);
        session.abandon(&old, false).await;

        let (fresh, _fresh_remote) = channel_pair();
        let current = session.begin(fresh).unwrap();
        drop(guard);
        assert_eq!(session.state(), ConnectionState::Connecting);
        assert!(!current.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_heartbeat_policy_is_clamped() {
        let session = Arc::new(Session::new(
            "test",
            SessionSettings {
                heartbeat: HeartbeatConfig {
                    interval: Duration::ZERO,
                    miss_threshold: 0,
                },
                ..settings()
            },
        ));
        assert!(session.settings().heartbeat.validate().is_ok());

        let mut events = session.subscribe();
        let mut state = session.watch_state();
        let (local, _remote) = channel_pair();
        let link = session.begin(local).unwrap();
        session.authenticate(&link).unwrap();
        session.establish(&link).unwrap();

        // The silent peer still faults instead of killing the driver
        state
            .wait_for(|s| s.state == ConnectionState::Faulted)
            .await
            .unwrap();
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Connected);
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::Lost(LostReason::Timeout)
        );
    }
}
