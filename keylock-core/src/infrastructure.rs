use std::sync::Arc;
use std::time::Duration;

use crate::error::StoreError;
use crate::types::{AcquireOutcome, LockEntry, LockToken, RefreshOutcome, ReleaseOutcome};

/// Defines the contract for lock storage backends.
///
/// Implementations are shared between threads and must make each operation
/// atomic on the store side: concurrent acquires of one key are serialized
/// by the store, never by the caller.
pub trait LockStore: Send + Sync {
    /// Create an entry for `key` living for `lease` if no live entry exists
    fn acquire(&self, key: &str, lease: Duration) -> Result<AcquireOutcome, StoreError>;

    /// Delete the entry for `key` only if it is live and held under `token`
    fn release(&self, key: &str, token: &LockToken) -> Result<ReleaseOutcome, StoreError>;

    /// Push the expiry of a held entry to `now + lease`
    fn refresh(
        &self,
        key: &str,
        token: &LockToken,
        lease: Duration,
    ) -> Result<RefreshOutcome, StoreError>;
}

/// Inspection and housekeeping for stores that can enumerate their entries.
pub trait LockStoreAdmin: LockStore {
    /// Get all currently live entries
    fn active_entries(&self) -> Result<Vec<LockEntry>, StoreError>;

    /// Drop expired entries. Returns how many were removed.
    fn evict_expired(&self) -> Result<usize, StoreError>;

    /// The live entry for `key`, if any
    fn lookup(&self, key: &str) -> Result<Option<LockEntry>, StoreError> {
        Ok(self.active_entries()?.into_iter().find(|e| e.key == key))
    }
}

impl<S: LockStore + ?Sized> LockStore for Arc<S> {
    fn acquire(&self, key: &str, lease: Duration) -> Result<AcquireOutcome, StoreError> {
        (**self).acquire(key, lease)
    }

    fn release(&self, key: &str, token: &LockToken) -> Result<ReleaseOutcome, StoreError> {
        (**self).release(key, token)
    }

    fn refresh(
        &self,
        key: &str,
        token: &LockToken,
        lease: Duration,
    ) -> Result<RefreshOutcome, StoreError> {
        (**self).refresh(key, token, lease)
    }
}

impl<S: LockStoreAdmin + ?Sized> LockStoreAdmin for Arc<S> {
    fn active_entries(&self) -> Result<Vec<LockEntry>, StoreError> {
        (**self).active_entries()
    }

    fn evict_expired(&self) -> Result<usize, StoreError> {
        (**self).evict_expired()
    }

    fn lookup(&self, key: &str) -> Result<Option<LockEntry>, StoreError> {
        (**self).lookup(key)
    }
}

impl<S: LockStore + ?Sized> LockStore for &S {
    fn acquire(&self, key: &str, lease: Duration) -> Result<AcquireOutcome, StoreError> {
        (**self).acquire(key, lease)
    }

    fn release(&self, key: &str, token: &LockToken) -> Result<ReleaseOutcome, StoreError> {
        (**self).release(key, token)
    }

    fn refresh(
        &self,
        key: &str,
        token: &LockToken,
        lease: Duration,
    ) -> Result<RefreshOutcome, StoreError> {
        (**self).refresh(key, token, lease)
    }
}

impl<S: LockStoreAdmin + ?Sized> LockStoreAdmin for &S {
    fn active_entries(&self) -> Result<Vec<LockEntry>, StoreError> {
        (**self).active_entries()
    }

    fn evict_expired(&self) -> Result<usize, StoreError> {
        (**self).evict_expired()
    }

    fn lookup(&self, key: &str) -> Result<Option<LockEntry>, StoreError> {
        (**self).lookup(key)
    }
}

/// Lease as whole milliseconds, rejecting zero.
pub fn lease_millis(lease: Duration) -> Result<u64, StoreError> {
    match u64::try_from(lease.as_millis()).unwrap_or(u64::MAX) {
        0 => Err(StoreError::InvalidLease),
        ms => Ok(ms),
    }
}
