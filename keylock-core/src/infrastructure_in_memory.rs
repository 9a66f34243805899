use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;
use crate::infrastructure::{LockStore, LockStoreAdmin, lease_millis};
use crate::types::{AcquireOutcome, LockEntry, LockToken, RefreshOutcome, ReleaseOutcome};

/// Process-local lock store. Every operation runs under one mutex, which
/// gives the same atomicity a remote store provides per command.
pub struct InMemoryLockStore {
    // Map of key -> current entry (possibly expired until overwritten or evicted)
    entries: Mutex<HashMap<String, LockEntry>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryLockStore {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    pub fn with_clock(clock: impl Clock + 'static) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock: Arc::new(clock),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, LockEntry>> {
        // A panic while holding the map cannot leave an entry half-written.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The live entry for `key`, if any.
    pub fn entry(&self, key: &str) -> Option<LockEntry> {
        let now = self.clock.now_ms();
        self.entries()
            .get(key)
            .filter(|e| e.is_live(now))
            .cloned()
    }
}

impl Default for InMemoryLockStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LockStore for InMemoryLockStore {
    fn acquire(&self, key: &str, lease: Duration) -> Result<AcquireOutcome, StoreError> {
        let lease_ms = lease_millis(lease)?;
        let now = self.clock.now_ms();
        let mut entries = self.entries();

        if entries.get(key).is_some_and(|e| e.is_live(now)) {
            return Ok(AcquireOutcome::Busy);
        }

        let token = LockToken::generate();
        entries.insert(
            key.to_string(),
            LockEntry::new(key, token.clone(), lease_ms, now),
        );
        Ok(AcquireOutcome::Acquired(token))
    }

    fn release(&self, key: &str, token: &LockToken) -> Result<ReleaseOutcome, StoreError> {
        let now = self.clock.now_ms();
        let mut entries = self.entries();

        if entries.get(key).is_some_and(|e| e.is_held_by(token, now)) {
            entries.remove(key);
            Ok(ReleaseOutcome::Released)
        } else {
            Ok(ReleaseOutcome::NotOwner)
        }
    }

    fn refresh(
        &self,
        key: &str,
        token: &LockToken,
        lease: Duration,
    ) -> Result<RefreshOutcome, StoreError> {
        let lease_ms = lease_millis(lease)?;
        let now = self.clock.now_ms();
        let mut entries = self.entries();

        match entries.get_mut(key) {
            Some(entry) if entry.is_held_by(token, now) => {
                entry.lease_ms = lease_ms;
                entry.expires_at = now.saturating_add(lease_ms);
                Ok(RefreshOutcome::Refreshed)
            }
            _ => Ok(RefreshOutcome::NotOwner),
        }
    }
}

impl LockStoreAdmin for InMemoryLockStore {
    fn active_entries(&self) -> Result<Vec<LockEntry>, StoreError> {
        let now = self.clock.now_ms();
        Ok(self
            .entries()
            .values()
            .filter(|e| e.is_live(now))
            .cloned()
            .collect())
    }

    fn evict_expired(&self) -> Result<usize, StoreError> {
        let now = self.clock.now_ms();
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now));
        Ok(before - entries.len())
    }

    fn lookup(&self, key: &str) -> Result<Option<LockEntry>, StoreError> {
        Ok(self.entry(key))
    }
}
