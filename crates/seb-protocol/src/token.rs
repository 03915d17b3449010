//! Session token type
//!
//! A `SessionToken` is the only credential the client presents. It is a
//! 128-bit value that never appears in `Debug` or `Display` output and is
//! zeroed when dropped.

use std::fmt;

use zeroize::Zeroize;

use crate::error::ProtocolError;

/// Length of a session token in bytes
pub const TOKEN_LEN: usize = 16;

/// 128-bit credential for one exam session
#[derive(Clone)]
pub struct SessionToken([u8; TOKEN_LEN]);

impl SessionToken {
    /// Wrap raw token bytes
    pub fn from_bytes(bytes: [u8; TOKEN_LEN]) -> Self {
        Self(bytes)
    }

    /// Build a token from a wire payload.
    ///
    /// Returns `None` unless `bytes` is exactly `TOKEN_LEN` long.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let raw: [u8; TOKEN_LEN] = bytes.try_into().ok()?;
        Some(Self(raw))
    }

    /// Raw token bytes, for putting on the wire
    pub fn as_bytes(&self) -> &[u8; TOKEN_LEN] {
        &self.0
    }

    /// Hex encoding used for the launch handoff
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse the hex form produced by [`SessionToken::to_hex`]
    pub fn from_hex(text: &str) -> Result<Self, ProtocolError> {
        let mut bytes = hex::decode(text.trim()).map_err(|_| ProtocolError::InvalidTokenEncoding)?;
        let token = Self::from_slice(&bytes).ok_or(ProtocolError::InvalidTokenEncoding);
        bytes.zeroize();
        token
    }

    /// Compare two tokens without short-circuiting on the first differing byte.
    pub fn ct_eq(&self, other: &SessionToken) -> bool {
        let mut diff = 0u8;
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            diff |= a ^ b;
        }
        std::hint::black_box(diff) == 0
    }
}

impl PartialEq for SessionToken {
    fn eq(&self, other: &Self) -> bool {
        self.ct_eq(other)
    }
}

impl Eq for SessionToken {}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionToken([REDACTED])")
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED TOKEN]")
    }
}

impl Drop for SessionToken {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_equality() {
        let a = SessionToken::from_bytes([7; TOKEN_LEN]);
        let b = SessionToken::from_bytes([7; TOKEN_LEN]);
        let mut other = [7; TOKEN_LEN];
        other[TOKEN_LEN - 1] = 8;
        let c = SessionToken::from_bytes(other);

        assert!(a.ct_eq(&b));
        assert!(!a.ct_eq(&c));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_token_hex_roundtrip() {
        let token = SessionToken::from_bytes([0xAB; TOKEN_LEN]);
        let text = token.to_hex();
        assert_eq!(text.len(), TOKEN_LEN * 2);
        assert_eq!(SessionToken::from_hex(&text).unwrap(), token);
    }

    #[test]
    fn test_token_from_hex_rejects_bad_input() {
        assert!(SessionToken::from_hex("not-hex").is_err());
        assert!(SessionToken::from_hex("abcd").is_err());
        assert!(SessionToken::from_hex(&"00".repeat(TOKEN_LEN + 1)).is_err());
    }

    #[test]
    fn test_token_from_slice_length() {
        assert!(SessionToken::from_slice(&[1; TOKEN_LEN]).is_some());
        assert!(SessionToken::from_slice(&[1; TOKEN_LEN - 1]).is_none());
    }

    #[test]
    fn test_token_is_redacted() {
        let token = SessionToken::from_bytes([0x5A; TOKEN_LEN]);
        let debug = format!("{:?}", token);
        let display = format!("{}", token);
        assert!(!debug.contains("5a"));
        assert!(!display.contains("5a"));
        assert!(debug.contains("REDACTED"));
    }
}
