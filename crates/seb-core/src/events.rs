//! Session events published to the application layer
//!
//! These are the only signals the surrounding application needs: the peer
//! became available, or the peer went away and why. On the service side
//! they are the "client connected" and "client lost" notifications.

use std::fmt;

/// Why an established session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LostReason {
    /// Either side asked to disconnect
    Requested,
    /// The peer went silent or the channel was severed without notice
    Timeout,
    /// The peer broke the protocol
    Faulted,
}

impl LostReason {
    /// Whether the loss is abnormal and needs a reaction (abort the exam,
    /// alert an invigilator) rather than routine shutdown handling
    pub fn is_abnormal(&self) -> bool {
        !matches!(self, LostReason::Requested)
    }
}

impl fmt::Display for LostReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LostReason::Requested => write!(f, "requested"),
            LostReason::Timeout => write!(f, "timeout"),
            LostReason::Faulted => write!(f, "faulted"),
        }
    }
}

/// Event raised by a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// The session reached `Connected`
    Connected,
    /// The session left `Connected`
    Lost(LostReason),
}
