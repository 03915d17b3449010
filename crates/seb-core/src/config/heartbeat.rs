//! Heartbeat policy

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::duration_millis;
use crate::error::ConfigError;

/// Shortest interval a running monitor will tick at
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Heartbeat policy shared by both ends of the channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Interval between heartbeats, and length of one detection window
    #[serde(with = "duration_millis")]
    pub interval: Duration,

    /// Consecutive empty windows before the session is declared faulted
    pub miss_threshold: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1000),
            miss_threshold: 3,
        }
    }
}

impl HeartbeatConfig {
    /// Upper bound on the time between the last heartbeat seen and the fault
    pub fn detection_window(&self) -> Duration {
        self.interval.saturating_mul(self.miss_threshold.saturating_add(1))
    }

    /// The nearest policy that passes [`validate`](Self::validate)
    pub fn clamped(&self) -> Self {
        Self {
            interval: self.interval.max(MIN_INTERVAL),
            miss_threshold: self.miss_threshold.max(1),
        }
    }

    /// Reject policies that could never or would always fault
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval.is_zero() {
            return Err(ConfigError::Invalid(
                "heartbeat.interval must be greater than zero".to_string(),
            ));
        }
        if self.miss_threshold == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat.miss_threshold must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_tolerates_jitter() {
        let config = HeartbeatConfig::default();
        assert!(config.miss_threshold > 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_detection_window() {
        let config = HeartbeatConfig {
            interval: Duration::from_millis(200),
            miss_threshold: 3,
        };
        assert_eq!(config.detection_window(), Duration::from_millis(800));
    }

    #[test]
    fn test_detection_window_saturates() {
        let config = HeartbeatConfig {
            interval: Duration::from_secs(1),
            miss_threshold: u32::MAX,
        };
        assert_eq!(
            config.detection_window(),
            Duration::from_secs(u64::from(u32::MAX) + 1)
        );

        let huge = HeartbeatConfig {
            interval: Duration::MAX,
            miss_threshold: 3,
        };
        assert_eq!(huge.detection_window(), Duration::MAX);
    }

    #[test]
    fn test_clamped_passes_validation() {
        let broken = HeartbeatConfig {
            interval: Duration::ZERO,
            miss_threshold: 0,
        };
        let clamped = broken.clamped();
        assert!(clamped.validate().is_ok());
        assert_eq!(clamped.interval, MIN_INTERVAL);
        assert_eq!(clamped.miss_threshold, 1);

        let sane = HeartbeatConfig::default();
        assert_eq!(sane.clamped(), sane);
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let zero_interval = HeartbeatConfig {
            interval: Duration::ZERO,
            miss_threshold: 3,
        };
        assert!(zero_interval.validate().is_err());

        let zero_threshold = HeartbeatConfig {
            interval: Duration::from_secs(1),
            miss_threshold: 0,
        };
        assert!(zero_threshold.validate().is_err());
    }
}
