//! Browser client configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::heartbeat::HeartbeatConfig;
use super::serde_utils::duration_millis;
use crate::error::ConfigError;
use crate::session::SessionSettings;

/// Configuration for the browser client side of the channel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Timeout for opening the transport to the service
    #[serde(with = "duration_millis")]
    pub connect_timeout: Duration,

    /// How long to wait for the service's verdict on the token
    #[serde(with = "duration_millis")]
    pub auth_timeout: Duration,

    /// Bound on every individual send on the channel
    #[serde(with = "duration_millis")]
    pub io_timeout: Duration,

    /// How long to wait for a `CommandAck`
    #[serde(with = "duration_millis")]
    pub command_timeout: Duration,

    /// Heartbeat policy (should match the service's)
    pub heartbeat: HeartbeatConfig,

    /// Backoff between connection attempts
    pub backoff: BackoffConfig,

    /// Connection attempts before giving up
    pub max_connect_attempts: u32,

    /// Start a fresh connection after the session is lost
    pub reconnect: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(3000),
            auth_timeout: Duration::from_millis(5000),
            io_timeout: Duration::from_millis(2000),
            command_timeout: Duration::from_millis(5000),
            heartbeat: HeartbeatConfig::default(),
            backoff: BackoffConfig::default(),
            max_connect_attempts: 5,
            reconnect: false,
        }
    }
}

impl ClientConfig {
    /// Session timing derived from this configuration
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            heartbeat: self.heartbeat.clone(),
            io_timeout: self.io_timeout,
            command_timeout: self.command_timeout,
        }
    }

    /// Check the configuration for values the session cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.heartbeat.validate()?;
        if self.max_connect_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max_connect_attempts must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.backoff.jitter) {
            return Err(ConfigError::Invalid(
                "backoff.jitter must be between 0.0 and 1.0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Exponential backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Initial delay
    #[serde(with = "duration_millis")]
    pub initial: Duration,

    /// Maximum delay
    #[serde(with = "duration_millis")]
    pub max: Duration,

    /// Multiplier for each retry
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(2),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}
