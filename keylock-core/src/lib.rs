//! # keylock-core
//!
//! Lease-bounded mutual exclusion for idempotency-sensitive operations.
//! A protected call derives a lock key from its target and arguments,
//! acquires it from a shared [`infrastructure::LockStore`] with a bounded
//! wait, runs, and releases it on every exit path. Nested protected calls
//! on one thread compose through a per-thread LIFO reentrancy stack.

pub mod backoff;
pub mod clock;
pub mod coordinator;
pub mod error;
pub mod infrastructure;
#[cfg(feature = "http")]
#[path = "infrastructure_http.rs"]
pub mod infrastructure_http;
#[path = "infrastructure_in_memory.rs"]
pub mod infrastructure_in_memory;
#[cfg(feature = "redis")]
#[path = "infrastructure_redis.rs"]
pub mod infrastructure_redis;
#[cfg(feature = "sqlite")]
#[path = "infrastructure_sqlite.rs"]
pub mod infrastructure_sqlite;
pub mod key;
pub mod tracker;
pub mod types;

pub use coordinator::{CancelToken, CoordinatorSettings, LockCoordinator, LockGuard};
pub use error::{ExitOutcome, LockError, StoreError};
pub use key::KeyDeriver;
pub use types::{CallContext, LockConfig, LockRecord, LockToken, TargetIdentity};

#[cfg(test)]
mod coordinator_test;
