//! Redis-backed LockStore.
//!
//! Acquire is a single `SET key token NX PX <lease>`. Release and refresh
//! are Lua scripts that compare the stored token before touching the key,
//! so a holder whose lease already expired cannot delete or extend a lock
//! that was re-acquired by someone else.

use std::time::Duration;

use redis::Script;

use crate::error::StoreError;
use crate::infrastructure::{LockStore, lease_millis};
use crate::types::{AcquireOutcome, LockToken, RefreshOutcome, ReleaseOutcome};

const RELEASE_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
"#;

const REFRESH_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('pexpire', KEYS[1], ARGV[2])
else
    return 0
end
"#;

pub struct RedisLockStore {
    client: redis::Client,
    release_script: Script,
    refresh_script: Script,
}

impl RedisLockStore {
    /// `url` is a redis connection string, e.g. `redis://127.0.0.1/`.
    pub fn open(url: &str) -> Result<Self, StoreError> {
        Ok(Self {
            client: redis::Client::open(url)?,
            release_script: Script::new(RELEASE_SCRIPT),
            refresh_script: Script::new(REFRESH_SCRIPT),
        })
    }

    fn connection(&self) -> Result<redis::Connection, StoreError> {
        self.client
            .get_connection()
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }
}

impl LockStore for RedisLockStore {
    fn acquire(&self, key: &str, lease: Duration) -> Result<AcquireOutcome, StoreError> {
        let lease_ms = lease_millis(lease)?;
        let token = LockToken::generate();
        let mut conn = self.connection()?;

        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token.as_str())
            .arg("NX")
            .arg("PX")
            .arg(lease_ms)
            .query(&mut conn)?;

        Ok(match reply {
            Some(_) => AcquireOutcome::Acquired(token),
            None => AcquireOutcome::Busy,
        })
    }

    fn release(&self, key: &str, token: &LockToken) -> Result<ReleaseOutcome, StoreError> {
        let mut conn = self.connection()?;
        let removed: i64 = self
            .release_script
            .key(key)
            .arg(token.as_str())
            .invoke(&mut conn)?;
        Ok(if removed > 0 {
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
        let mut conn = self.connection()?;
        let updated: i64 = self
            .refresh_script
            .key(key)
            .arg(token.as_str())
            .arg(lease_ms)
            .invoke(&mut conn)?;
        Ok(if updated > 0 {
            RefreshOutcome::Refreshed
        } else {
            RefreshOutcome::NotOwner
        })
    }
}
