//! Leases: advisory, time-bounded locks over named scopes.
//!
//! A lease is a cooperative signal between agents. Nothing in the engine
//! refuses an operation because a lease is held, and several unexpired
//! leases may share a scope.

use std::fmt;
use std::time::Duration;

use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Opaque lease identifier: 128 random bits as hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockId(String);

impl LockId {
    /// Generate a fresh random id.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for LockId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for LockId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A time-bounded advisory lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub lock_id: LockId,
    pub scope: String,
    pub actor: String,
    /// Unix milliseconds.
    pub expires_at: i64,
}

impl Lease {
    /// A new lease on `scope` that expires `ttl` after `now` (Unix ms).
    pub fn new(scope: impl Into<String>, actor: impl Into<String>, ttl: Duration, now: i64) -> Self {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        Self {
            lock_id: LockId::generate(),
            scope: scope.into(),
            actor: actor.into(),
            expires_at: now.saturating_add(ttl_ms),
        }
    }

    /// A lease has expired once `now` reaches `expires_at`.
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_ids_are_unique_hex() {
        let a = LockId::generate();
        let b = LockId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
        assert!(hex::decode(a.as_str()).is_ok());
    }

    #[test]
    fn test_expiry() {
        let lease = Lease::new("global", "agent", Duration::from_secs(1), 1_000);
        assert_eq!(lease.expires_at, 2_000);
        assert!(!lease.is_expired(1_999));
        assert!(lease.is_expired(2_000));
    }

    #[test]
    fn test_huge_ttl_saturates() {
        let lease = Lease::new("s", "a", Duration::from_secs(u64::MAX), 10);
        assert_eq!(lease.expires_at, i64::MAX);
    }

    #[test]
    fn test_lock_id_serializes_as_string() {
        let id = LockId::from("abc");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc\"");
    }
}
