use serde::{Deserialize, Serialize};

use super::LockToken;

/// A live lock as the store sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockEntry {
    /// The locked key
    pub key: String,
    /// Token of the current holder
    pub token: LockToken,
    /// When the lock was taken (unix ms)
    pub acquired_at: u64,
    /// Time-to-live in milliseconds
    pub lease_ms: u64,
    /// When the entry stops being live (acquired_at + lease_ms, moved by refresh)
    pub expires_at: u64,
}

impl LockEntry {
    pub fn new(key: impl Into<String>, token: LockToken, lease_ms: u64, now: u64) -> Self {
        Self {
            key: key.into(),
            token,
            acquired_at: now,
            lease_ms,
            expires_at: now.saturating_add(lease_ms),
        }
    }

    pub fn is_live(&self, now: u64) -> bool {
        now < self.expires_at
    }

    pub fn is_held_by(&self, token: &LockToken, now: u64) -> bool {
        self.is_live(now) && &self.token == token
    }
}

/// Result of a single acquire attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired(LockToken),
    /// Another live entry holds the key
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    /// Entry absent, expired, or held under a different token. Left untouched.
    NotOwner,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed,
    NotOwner,
}
