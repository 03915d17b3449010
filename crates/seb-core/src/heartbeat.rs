//! Heartbeat bookkeeping

use tokio::time::Instant;

/// Result of closing one detection window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatVerdict {
    /// At least one heartbeat arrived during the window
    Healthy,
    /// No heartbeat this window; below the threshold
    Missed(u32),
    /// Consecutive misses reached the threshold
    Expired(u32),
}

/// Last-seen time and consecutive-miss counter for the peer's heartbeats
#[derive(Debug, Clone)]
pub struct HeartbeatRecord {
    last_seen: Instant,
    seen_this_window: bool,
    consecutive_misses: u32,
}

impl HeartbeatRecord {
    /// Start a record as if the peer was just heard from
    pub fn new(now: Instant) -> Self {
        Self {
            last_seen: now,
            seen_this_window: false,
            consecutive_misses: 0,
        }
    }

    /// A heartbeat arrived; clears the miss counter
    pub fn record_heartbeat(&mut self, now: Instant) {
        self.last_seen = now;
        self.seen_this_window = true;
        self.consecutive_misses = 0;
    }

    /// Close the current window and judge it against `threshold`
    pub fn close_window(&mut self, threshold: u32) -> HeartbeatVerdict {
        if std::mem::take(&mut self.seen_this_window) {
            return HeartbeatVerdict::Healthy;
        }

        self.consecutive_misses = self.consecutive_misses.saturating_add(1);
        if self.consecutive_misses >= threshold {
            HeartbeatVerdict::Expired(self.consecutive_misses)
        } else {
            HeartbeatVerdict::Missed(self.consecutive_misses)
        }
    }

    /// When the last heartbeat arrived
    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    /// Current run of empty windows
    pub fn consecutive_misses(&self) -> u32 {
        self.consecutive_misses
    }
}
