//! Service configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::heartbeat::HeartbeatConfig;
use super::serde_utils::duration_millis;
use crate::error::ConfigError;
use crate::session::SessionSettings;

/// Configuration for the lockdown service side of the channel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Loopback address to accept the client on (port 0 picks a free port)
    pub bind_address: String,

    /// How long a freshly accepted client has to present its token
    #[serde(with = "duration_millis")]
    pub auth_timeout: Duration,

    /// Bound on every individual send on the channel
    #[serde(with = "duration_millis")]
    pub io_timeout: Duration,

    /// How long to wait for a `CommandAck`
    #[serde(with = "duration_millis")]
    pub command_timeout: Duration,

    /// Heartbeat policy
    pub heartbeat: HeartbeatConfig,

    /// Failed token presentations before the listener refuses the session
    pub max_failed_attempts: u32,

    /// Reset a faulted session so the client may authenticate again
    pub allow_reconnect: bool,

    /// Browser client executable to launch (None = client started externally)
    pub client_executable: Option<PathBuf>,

    /// Extra arguments for the client executable
    pub client_args: Vec<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:0".to_string(),
            auth_timeout: Duration::from_millis(5000),
            io_timeout: Duration::from_millis(2000),
            command_timeout: Duration::from_millis(5000),
            heartbeat: HeartbeatConfig::default(),
            max_failed_attempts: 5,
            allow_reconnect: false,
            client_executable: None,
            client_args: vec![],
        }
    }
}

impl ServiceConfig {
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
        if self.max_failed_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max_failed_attempts must be at least 1".to_string(),
            ));
        }
        for (name, value) in [
            ("auth_timeout", self.auth_timeout),
            ("io_timeout", self.io_timeout),
            ("command_timeout", self.command_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Invalid(format!("{} must be greater than zero", name)));
            }
        }
        Ok(())
    }
}
