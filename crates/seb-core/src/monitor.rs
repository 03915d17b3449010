//! Connection health monitoring

use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use crate::config::HeartbeatConfig;
use crate::heartbeat::{HeartbeatRecord, HeartbeatVerdict};

/// Supervises the peer's heartbeats for one established session
///
/// The monitor does not own the channel. The session link feeds it received
/// heartbeats and, on every tick, sends its own heartbeat and acts on the
/// verdict.
pub struct ConnectionMonitor {
    config: HeartbeatConfig,
    record: HeartbeatRecord,
    ticker: Interval,
}

impl ConnectionMonitor {
    /// Create a monitor whose first window closes one interval from now
    pub fn new(config: HeartbeatConfig) -> Self {
        let config = config.clamped();
        let now = Instant::now();
        let mut ticker = interval_at(now + config.interval, config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            record: HeartbeatRecord::new(now),
            config,
            ticker,
        }
    }

    /// Note a heartbeat from the peer
    pub fn heartbeat_received(&mut self) {
        self.record.record_heartbeat(Instant::now());
        tracing::trace!("Heartbeat received");
    }

    /// Wait for the current window to close and judge it.
    ///
    /// Cancel safe: dropping the future before it completes leaves the
    /// window open.
    pub async fn tick(&mut self) -> HeartbeatVerdict {
        self.ticker.tick().await;
        let verdict = self.record.close_window(self.config.miss_threshold);
        match verdict {
            HeartbeatVerdict::Healthy => {}
            HeartbeatVerdict::Missed(n) => {
                tracing::debug!(
                    "Missed heartbeat window ({}/{})",
                    n,
                    self.config.miss_threshold
                );
            }
            HeartbeatVerdict::Expired(n) => {
                tracing::warn!(
                    "Peer silent for {} consecutive windows (last seen {:?} ago)",
                    n,
                    self.record.last_seen().elapsed()
                );
            }
        }
        verdict
    }

    /// Heartbeat record, for inspection
    pub fn record(&self) -> &HeartbeatRecord {
        &self.record
    }
}
