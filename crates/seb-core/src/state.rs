//! Session state machine
//!
//! `StateMachine` is the single authority over a session's
//! [`ConnectionState`]. Every transition runs inside the write side of a
//! `tokio::sync::watch` channel (`send_if_modified`), so the precondition
//! check and the store form one critical section and no two transitions
//! interleave. The critical section never awaits.
//!
//! Each connection attempt is stamped with an epoch. Operations that belong
//! to one attempt (its heartbeat driver, its handshake) name that epoch, so
//! a late fault from an old channel can never tear down a newer session.
//!
//! # Legal edges
//!
//! ```text
//! Disconnected   -> Connecting
//! Connecting     -> Authenticating | Disconnected
//! Authenticating -> Connected      | Disconnected
//! Connected      -> Disconnecting  | Faulted
//! Disconnecting  -> Disconnected
//! Faulted        -> Disconnected
//! ```

use std::fmt;

use tokio::sync::{broadcast, watch};

/// Capacity of the transition log channel
const TRANSITION_CHANNEL_CAPACITY: usize = 1024;

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No client; ready for a connection attempt
    Disconnected,
    /// A token has been presented and is being checked
    Connecting,
    /// Token accepted, acknowledgement in flight
    Authenticating,
    /// Session established and supervised by heartbeats
    Connected,
    /// Clean teardown in progress
    Disconnecting,
    /// Session lost abnormally; needs an explicit reset
    Faulted,
}

impl ConnectionState {
    /// Whether `next` is reachable from `self` in a single step
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Authenticating)
                | (Connecting, Disconnected)
                | (Authenticating, Connected)
                | (Authenticating, Disconnected)
                | (Connected, Disconnecting)
                | (Connected, Faulted)
                | (Disconnecting, Disconnected)
                | (Faulted, Disconnected)
        )
    }

    /// A connection attempt has started but not yet completed
    pub fn is_pending(self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Authenticating)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Authenticating => write!(f, "authenticating"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnecting => write!(f, "disconnecting"),
            ConnectionState::Faulted => write!(f, "faulted"),
        }
    }
}

/// Point-in-time view of the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateSnapshot {
    /// Current state
    pub state: ConnectionState,
    /// Epoch of the most recent connection attempt
    pub epoch: u64,
}

/// A transition that was applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// State before
    pub from: ConnectionState,
    /// State after
    pub to: ConnectionState,
    /// Epoch the transition applied to
    pub epoch: u64,
}

/// Single-writer owner of a session's `ConnectionState`
pub struct StateMachine {
    state_tx: watch::Sender<StateSnapshot>,
    transition_tx: broadcast::Sender<Transition>,
}

impl StateMachine {
    /// Create a state machine in `Disconnected`
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(StateSnapshot {
            state: ConnectionState::Disconnected,
            epoch: 0,
        });
        let (transition_tx, _) = broadcast::channel(TRANSITION_CHANNEL_CAPACITY);
        Self {
            state_tx,
            transition_tx,
        }
    }

    /// Snapshot of the current state; may be stale by the time it is read
    pub fn snapshot(&self) -> StateSnapshot {
        *self.state_tx.borrow()
    }

    /// Current state; may be stale by the time it is read
    pub fn state(&self) -> ConnectionState {
        self.snapshot().state
    }

    /// Receiver that observes the latest state (for display)
    pub fn watch(&self) -> watch::Receiver<StateSnapshot> {
        self.state_tx.subscribe()
    }

    /// Receiver that observes every applied transition, in order
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<Transition> {
        self.transition_tx.subscribe()
    }

    /// Start a new attempt: `Disconnected -> Connecting` under a fresh epoch.
    ///
    /// Returns the new epoch, or the snapshot that prevented the transition.
    pub fn begin(&self) -> Result<u64, StateSnapshot> {
        let mut outcome = Err(self.snapshot());
        self.state_tx.send_if_modified(|current| {
            if current.state != ConnectionState::Disconnected {
                outcome = Err(*current);
                return false;
            }
            let epoch = current.epoch.wrapping_add(1);
            *current = StateSnapshot {
                state: ConnectionState::Connecting,
                epoch,
            };
            self.record(ConnectionState::Disconnected, ConnectionState::Connecting, epoch);
            outcome = Ok(epoch);
            true
        });
        outcome
    }

    /// Move attempt `epoch` from one of `from` to `to`.
    ///
    /// Fails without side effects if the epoch is stale, the current state is
    /// not in `from`, or the edge is not legal. Returns the previous state.
    pub fn transition(
        &self,
        epoch: u64,
        from: &[ConnectionState],
        to: ConnectionState,
    ) -> Result<ConnectionState, StateSnapshot> {
        self.transition_with(|current| {
            (current.epoch == epoch && from.contains(&current.state)).then_some(to)
        })
        .map(|previous| previous.state)
    }

    /// Apply the transition chosen by `decide` for the current snapshot.
    ///
    /// `decide` runs inside the critical section and returns `None` to leave
    /// the state untouched. Illegal choices are refused. On success the
    /// previous snapshot is returned; otherwise the current one.
    pub fn transition_with<F>(&self, decide: F) -> Result<StateSnapshot, StateSnapshot>
    where
        F: FnOnce(StateSnapshot) -> Option<ConnectionState>,
    {
        self.apply(decide, |_| {})
    }

    /// Like [`transition_with`](Self::transition_with), additionally running
    /// `on_applied` inside the critical section once the transition is stored.
    ///
    /// Used to publish events that must be ordered with the transition
    /// itself. `on_applied` must not block.
    pub fn apply<F, A>(&self, decide: F, on_applied: A) -> Result<StateSnapshot, StateSnapshot>
    where
        F: FnOnce(StateSnapshot) -> Option<ConnectionState>,
        A: FnOnce(Transition),
    {
        let mut outcome = Err(self.snapshot());
        self.state_tx.send_if_modified(|current| {
            let previous = *current;
            match decide(previous) {
                Some(next) if previous.state.can_transition_to(next) => {
                    current.state = next;
                    let transition = self.record(previous.state, next, previous.epoch);
                    on_applied(transition);
                    outcome = Ok(previous);
                    true
                }
                Some(next) => {
                    tracing::warn!(
                        "Refused illegal transition {} -> {} (epoch {})",
                        previous.state,
                        next,
                        previous.epoch
                    );
                    outcome = Err(previous);
                    false
                }
                None => {
                    outcome = Err(previous);
                    false
                }
            }
        });
        outcome
    }

    /// Wait until the state leaves `Disconnecting`
    pub async fn settled(&self) -> StateSnapshot {
        let mut rx = self.state_tx.subscribe();
        let settled = rx
            .wait_for(|s| s.state != ConnectionState::Disconnecting)
            .await
            .map(|snapshot| *snapshot);
        // The sender lives in `self`, so the error arm is unreachable in practice
        settled.unwrap_or_else(|_| self.snapshot())
    }

    fn record(&self, from: ConnectionState, to: ConnectionState, epoch: u64) -> Transition {
        tracing::debug!("Session state {} -> {} (epoch {})", from, to, epoch);
        let transition = Transition { from, to, epoch };
        let _ = self.transition_tx.send(transition);
        transition
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
