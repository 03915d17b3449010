//! Session token issuance and validation
//!
//! The service mints one token per exam session before it launches the
//! client, and hands the client a copy through the launch environment (see
//! [`crate::launch`]). The service keeps its copy only for comparison.
//!
//! # Security Model
//!
//! - Token is 16 bytes from the thread-local CSPRNG (128 bits)
//! - Comparison never short-circuits on the first differing byte
//! - Repeated failures lock the session against further attempts
//! - The token type redacts itself in logs and zeroes itself on drop

use std::sync::atomic::{AtomicU32, Ordering};

use rand::Rng;
use seb_protocol::{SessionToken, TOKEN_LEN};
use zeroize::Zeroize;

/// Mint a fresh session token
pub fn mint_token() -> SessionToken {
    let mut bytes = [0u8; TOKEN_LEN];
    rand::thread_rng().fill(&mut bytes);
    let token = SessionToken::from_bytes(bytes);
    bytes.zeroize();
    token
}

/// Validate a presented token against the minted one in constant time
pub fn validate_token(candidate: &SessionToken, expected: &SessionToken) -> bool {
    candidate.ct_eq(expected)
}

/// Failed-attempt counter guarding one session against brute force
#[derive(Debug)]
pub struct AttemptGate {
    failures: AtomicU32,
    limit: u32,
}

impl AttemptGate {
    /// Allow up to `limit` failed attempts
    pub fn new(limit: u32) -> Self {
        Self {
            failures: AtomicU32::new(0),
            limit,
        }
    }

    /// Whether the session refuses further attempts
    pub fn is_locked(&self) -> bool {
        self.failures.load(Ordering::SeqCst) >= self.limit
    }

    /// Count a failure, returning the new total
    pub fn record_failure(&self) -> u32 {
        self.failures.fetch_add(1, Ordering::SeqCst).saturating_add(1)
    }

    /// Clear the counter after a successful authentication
    pub fn reset(&self) {
        self.failures.store(0, Ordering::SeqCst);
    }

    /// Failures so far
    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    /// Configured limit
    pub fn limit(&self) -> u32 {
        self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mint_token_unique() {
        let token1 = mint_token();
        let token2 = mint_token();
        assert_ne!(token1, token2);
    }

    #[test]
    fn test_validate_token() {
        let token = mint_token();
        let copy = token.clone();
        assert!(validate_token(&copy, &token));
        assert!(!validate_token(&mint_token(), &token));
    }

    #[test]
    fn test_validate_token_single_byte_difference() {
        let token = SessionToken::from_bytes([9; TOKEN_LEN]);
        let mut near = [9; TOKEN_LEN];
        near[0] = 10;
        assert!(!validate_token(&SessionToken::from_bytes(near), &token));
    }

    #[test]
    fn test_attempt_gate_locks_at_limit() {
        let gate = AttemptGate::new(3);
        assert!(!gate.is_locked());
        assert_eq!(gate.record_failure(), 1);
        assert_eq!(gate.record_failure(), 2);
        assert!(!gate.is_locked());
        assert_eq!(gate.record_failure(), 3);
        assert!(gate.is_locked());
    }

    #[test]
    fn test_attempt_gate_reset() {
        let gate = AttemptGate::new(2);
        gate.record_failure();
        gate.reset();
        assert_eq!(gate.failures(), 0);
        assert!(!gate.is_locked());
    }
}
