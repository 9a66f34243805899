//! SQLite-backed LockStore implementation.
//! Lets processes on one host (or a shared volume) coordinate through a
//! single database file.
//!
//! Enable with the `sqlite` feature flag:
//! ```toml
//! keylock-core = { path = "../keylock-core", features = ["sqlite"] }
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};

use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;
use crate::infrastructure::{LockStore, LockStoreAdmin, lease_millis};
use crate::types::*;

/// A persistent lock store backed by SQLite.
///
/// Uses WAL mode and `BEGIN IMMEDIATE` so that competing processes
/// serialize on the write lock for each acquire.
pub struct SqliteLockStore {
    conn: Mutex<Connection>,
    clock: Arc<dyn Clock>,
}

impl SqliteLockStore {
    /// Open (or create) a SQLite database at the given path.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        // Other processes may hold the write lock briefly during their acquire.
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS lock_entries (
                key         TEXT PRIMARY KEY,
                token       TEXT NOT NULL,
                acquired_at INTEGER NOT NULL,
                lease_ms    INTEGER NOT NULL,
                expires_at  INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_lock_entries_expiry ON lock_entries(expires_at);",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            clock: Arc::new(SystemClock),
        })
    }

    /// Replace the clock used to stamp and expire entries.
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The live entry for `key`, if any.
    pub fn entry(&self, key: &str) -> Result<Option<LockEntry>, StoreError> {
        let now = self.clock.now_ms();
        let entry = self
            .conn()
            .query_row(
                "SELECT key, token, acquired_at, lease_ms, expires_at
                 FROM lock_entries WHERE key = ?1 AND expires_at > ?2",
                params![key, now],
                Self::row_to_entry,
            )
            .optional()?;
        Ok(entry)
    }

    fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<LockEntry> {
        Ok(LockEntry {
            key: row.get(0)?,
            token: LockToken::from_raw(row.get::<_, String>(1)?),
            acquired_at: row.get(2)?,
            lease_ms: row.get(3)?,
            expires_at: row.get(4)?,
        })
    }
}

impl LockStore for SqliteLockStore {
    fn acquire(&self, key: &str, lease: Duration) -> Result<AcquireOutcome, StoreError> {
        let lease_ms = lease_millis(lease)?;
        let now = self.clock.now_ms();
        let token = LockToken::generate();

        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "DELETE FROM lock_entries WHERE key = ?1 AND expires_at <= ?2",
            params![key, now],
        )?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO lock_entries (key, token, acquired_at, lease_ms, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![key, token.as_str(), now, lease_ms, now.saturating_add(lease_ms)],
        )?;
        tx.commit()?;

        if inserted == 1 {
            Ok(AcquireOutcome::Acquired(token))
        } else {
            Ok(AcquireOutcome::Busy)
        }
    }

    fn release(&self, key: &str, token: &LockToken) -> Result<ReleaseOutcome, StoreError> {
        let now = self.clock.now_ms();
        let rows = self.conn().execute(
            "DELETE FROM lock_entries WHERE key = ?1 AND token = ?2 AND expires_at > ?3",
            params![key, token.as_str(), now],
        )?;
        Ok(if rows > 0 {
            ReleaseOutcome::Released
        } else {
            ReleaseOutcome::NotOwner
        })
    }

    fn refresh(
        &self,
        key: &str,
        token: &LockToken,
        lease: Duration,
    ) -> Result<RefreshOutcome, StoreError> {
        let lease_ms = lease_millis(lease)?;
        let now = self.clock.now_ms();
        let rows = self.conn().execute(
            "UPDATE lock_entries SET lease_ms = ?1, expires_at = ?2
             WHERE key = ?3 AND token = ?4 AND expires_at > ?5",
            params![lease_ms, now.saturating_add(lease_ms), key, token.as_str(), now],
        )?;
        Ok(if rows > 0 {
            RefreshOutcome::Refreshed
        } else {
            RefreshOutcome::NotOwner
        })
    }
}

impl LockStoreAdmin for SqliteLockStore {
    fn active_entries(&self) -> Result<Vec<LockEntry>, StoreError> {
        let now = self.clock.now_ms();
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT key, token, acquired_at, lease_ms, expires_at
             FROM lock_entries WHERE expires_at > ?1",
        )?;
        let entries = stmt
            .query_map(params![now], Self::row_to_entry)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    fn evict_expired(&self) -> Result<usize, StoreError> {
        let now = self.clock.now_ms();
        let rows = self.conn().execute(
            "DELETE FROM lock_entries WHERE expires_at <= ?1",
            params![now],
        )?;
        Ok(rows)
    }

    fn lookup(&self, key: &str) -> Result<Option<LockEntry>, StoreError> {
        self.entry(key)
    }
}
