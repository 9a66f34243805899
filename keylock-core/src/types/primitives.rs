use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::LockError;

/// The unit of mutual exclusion for one protected call.
///
/// Built fresh at entry to each protected invocation and dropped once the
/// matching exit has released it. Never persisted, never shared between
/// threads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockRecord {
    key: String,
    wait_seconds: u64,
    lease_seconds: u64,
    message: String,
}

impl LockRecord {
    /// Rejects an empty key and a zero lease. A lock without a lease would
    /// never expire if its holder crashed.
    pub fn new(
        key: impl Into<String>,
        wait_seconds: u64,
        lease_seconds: u64,
        message: impl Into<String>,
    ) -> Result<Self, LockError> {
        let key = key.into();
        if key.is_empty() {
            return Err(LockError::malformed("lock key must not be empty"));
        }
        if lease_seconds == 0 {
            return Err(LockError::malformed(format!(
                "lease_seconds must be greater than 0 (key '{}')",
                key
            )));
        }
        Ok(Self {
            key,
            wait_seconds,
            lease_seconds,
            message: message.into(),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn wait_seconds(&self) -> u64 {
        self.wait_seconds
    }

    pub fn lease_seconds(&self) -> u64 {
        self.lease_seconds
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Maximum time to keep retrying acquisition.
    pub fn wait(&self) -> Duration {
        Duration::from_secs(self.wait_seconds)
    }

    /// Time-to-live of the store entry once acquired.
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_seconds)
    }
}

/// Opaque proof of ownership handed out by a successful acquire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockToken(String);

impl LockToken {
    pub fn generate() -> Self {
        Self(nanoid::nanoid!())
    }

    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
