//! Browser client process launcher

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::process::{Child, Command};

use seb_core::config::ServiceConfig;
use seb_core::launch::LaunchCredentials;

/// Starts the browser client with the session's launch credentials
#[derive(Debug, Clone)]
pub struct ClientLauncher {
    executable: PathBuf,
    args: Vec<String>,
}

impl ClientLauncher {
    pub fn new(executable: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            executable: executable.into(),
            args,
        }
    }

    /// Launcher for the configured client, if one is configured
    pub fn from_config(config: &ServiceConfig) -> Option<Self> {
        config
            .client_executable
            .as_ref()
            .map(|executable| Self::new(executable.clone(), config.client_args.clone()))
    }

    /// Client executable
    pub fn executable(&self) -> &PathBuf {
        &self.executable
    }

    /// Build the client command. Credentials travel only in the child's
    /// environment, never in its arguments.
    pub fn command(&self, credentials: &LaunchCredentials) -> Command {
        let mut command = Command::new(&self.executable);
        command
            .args(&self.args)
            .envs(credentials.env_vars())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        command
    }

    /// Spawn the client
    pub fn spawn(&self, credentials: &LaunchCredentials) -> Result<Child> {
        let child = self
            .command(credentials)
            .spawn()
            .with_context(|| format!("Failed to launch client {:?}", self.executable))?;
        tracing::info!(
            "Launched client {:?} (pid {:?})",
            self.executable,
            child.id()
        );
        Ok(child)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use seb_core::launch::{ADDRESS_ENV, TOKEN_ENV};
    use seb_protocol::{SessionToken, TOKEN_LEN};
    use std::ffi::OsStr;

    fn credentials() -> LaunchCredentials {
        LaunchCredentials::new(
            "127.0.0.1:40000".parse().unwrap(),
            SessionToken::from_bytes([0x11; TOKEN_LEN]),
        )
    }

    #[test]
    fn test_from_config_requires_executable() {
        assert!(ClientLauncher::from_config(&ServiceConfig::default()).is_none());

        let config = ServiceConfig {
            client_executable: Some(PathBuf::from("/opt/seb/browser")),
            client_args: vec!["--kiosk".to_string()],
            ..Default::default()
        };
        let launcher = ClientLauncher::from_config(&config).unwrap();
        assert_eq!(launcher.executable(), &PathBuf::from("/opt/seb/browser"));
    }

    #[test]
    fn test_credentials_only_in_environment() {
        let launcher = ClientLauncher::new("/opt/seb/browser", vec!["--kiosk".to_string()]);
        let command = launcher.command(&credentials());
        let std_command = command.as_std();

        let token_hex = "11".repeat(TOKEN_LEN);
        assert!(std_command
            .get_args()
            .all(|arg| arg != OsStr::new(&token_hex)));

        let token_env = std_command
            .get_envs()
            .find(|(key, _)| *key == OsStr::new(TOKEN_ENV))
            .and_then(|(_, value)| value);
        assert_eq!(token_env, Some(OsStr::new(&token_hex)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawned_client_sees_credentials() {
        let script = format!(
            "test \"${}\" = \"{}\" && test -n \"${}\"",
            TOKEN_ENV,
            "11".repeat(TOKEN_LEN),
            ADDRESS_ENV
        );
        let launcher = ClientLauncher::new("/bin/sh", vec!["-c".to_string(), script]);
        let mut child = launcher.spawn(&credentials()).unwrap();
        assert!(child.wait().await.unwrap().success());
    }
}
