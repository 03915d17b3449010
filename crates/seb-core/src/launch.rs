//! Out-of-band launch credentials
//!
//! The service starts the browser client as a child process and passes it
//! the channel address and the session token through the child's
//! environment. Nothing is written to disk or placed on the command line,
//! where other users could read it from the process table.

use std::net::SocketAddr;

use seb_protocol::SessionToken;

use crate::error::LaunchError;

/// Environment variable carrying the service's loopback address
pub const ADDRESS_ENV: &str = "SEB_SERVICE_ADDRESS";

/// Environment variable carrying the hex-encoded session token
pub const TOKEN_ENV: &str = "SEB_SESSION_TOKEN";

/// What a launched client needs to reach and authenticate to the service
#[derive(Debug, Clone)]
pub struct LaunchCredentials {
    /// Service address
    pub address: SocketAddr,
    /// Session token minted for this exam session
    pub token: SessionToken,
}

impl LaunchCredentials {
    pub fn new(address: SocketAddr, token: SessionToken) -> Self {
        Self { address, token }
    }

    /// Environment variables to set on the child process
    pub fn env_vars(&self) -> [(&'static str, String); 2] {
        [
            (ADDRESS_ENV, self.address.to_string()),
            (TOKEN_ENV, self.token.to_hex()),
        ]
    }

    /// Parse credentials from a variable lookup
    pub fn from_vars<F>(lookup: F) -> Result<Self, LaunchError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let address = lookup(ADDRESS_ENV).ok_or(LaunchError::Missing(ADDRESS_ENV))?;
        let address: SocketAddr = address
            .trim()
            .parse()
            .map_err(|_| LaunchError::InvalidAddress(address.clone()))?;

        let token = lookup(TOKEN_ENV).ok_or(LaunchError::Missing(TOKEN_ENV))?;
        let token =
            SessionToken::from_hex(token.trim()).map_err(|_| LaunchError::InvalidToken)?;

        Ok(Self { address, token })
    }

    /// Read credentials from this process's environment.
    ///
    /// The token variable is removed afterwards so child processes of the
    /// client do not inherit it.
    pub fn from_env() -> Result<Self, LaunchError> {
        let credentials = Self::from_vars(|name| std::env::var(name).ok());
        std::env::remove_var(TOKEN_ENV);
        credentials
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn credentials() -> LaunchCredentials {
        LaunchCredentials::new(
            "127.0.0.1:41234".parse().unwrap(),
            SessionToken::from_bytes([0xA5; 16]),
        )
    }

    #[test]
    fn test_env_vars_roundtrip() {
        let original = credentials();
        let vars: HashMap<&str, String> = original.env_vars().into_iter().collect();

        let parsed = LaunchCredentials::from_vars(|name| vars.get(name).cloned()).unwrap();
        assert_eq!(parsed.address, original.address);
        assert_eq!(parsed.token, original.token);
    }

    #[test]
    fn test_missing_token() {
        let result = LaunchCredentials::from_vars(|name| {
            (name == ADDRESS_ENV).then(|| "127.0.0.1:1".to_string())
        });
        assert!(matches!(result, Err(LaunchError::Missing(TOKEN_ENV))));
    }

    #[test]
    fn test_invalid_address() {
        let result = LaunchCredentials::from_vars(|name| match name {
            ADDRESS_ENV => Some("not-an-address".to_string()),
            _ => Some("00".repeat(16)),
        });
        assert!(matches!(result, Err(LaunchError::InvalidAddress(_))));
    }

    #[test]
    fn test_invalid_token() {
        let result = LaunchCredentials::from_vars(|name| match name {
            ADDRESS_ENV => Some("127.0.0.1:1".to_string()),
            _ => Some("zz".to_string()),
        });
        assert!(matches!(result, Err(LaunchError::InvalidToken)));
    }

    #[test]
    fn test_debug_does_not_leak_token() {
        let text = format!("{:?}", credentials());
        assert!(!text.contains(&"a5".repeat(16)));
    }
}
