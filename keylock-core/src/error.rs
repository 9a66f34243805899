use thiserror::Error;

/// Failures surfaced to the caller of a protected operation.
#[derive(Debug, Error)]
pub enum LockError {
    /// The lock could not be acquired within the wait budget. The protected
    /// operation was not run. Displays as the configured denial message.
    #[error("{message}")]
    Busy { key: String, message: String },

    /// Invalid lease, empty key, or a key template that cannot be resolved
    /// against the call arguments. Raised before the store is contacted.
    #[error("malformed lock configuration: {0}")]
    MalformedConfiguration(String),

    /// Every attempt inside the wait budget ended with the store unreachable.
    #[error("lock store unavailable for '{key}': {source}")]
    StoreUnavailable {
        key: String,
        #[source]
        source: StoreError,
    },

    /// The caller cancelled while waiting. No lock was taken.
    #[error("lock acquisition for '{key}' was cancelled")]
    Cancelled { key: String },

    /// A lease refresh was requested while this thread holds no lock.
    #[error("no lock is held on the current thread")]
    NotHeld,
}

impl LockError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        LockError::MalformedConfiguration(reason.into())
    }

    /// True for the "duplicate / concurrent request" condition.
    pub fn is_busy(&self) -> bool {
        matches!(self, LockError::Busy { .. })
    }

    /// The configured denial message, when this is a busy failure.
    pub fn busy_message(&self) -> Option<&str> {
        match self {
            LockError::Busy { message, .. } => Some(message),
            _ => None,
        }
    }
}

/// Errors raised by a lock store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unreachable: {0}")]
    Unavailable(String),

    #[error("unexpected store response: {0}")]
    Protocol(String),

    #[error("lease must be greater than zero")]
    InvalidLease,

    #[cfg(feature = "sqlite")]
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[cfg(feature = "redis")]
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),
}

/// What happened when a held lock was released on the way out of a
/// protected call. Exit never fails the caller; anything other than
/// `Released` is logged and reported here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    Released,
    /// The entry was gone or held under another token, usually because the
    /// lease expired while the protected operation was still running.
    NotOwner,
    /// Exit was called with nothing on this thread's stack.
    TrackerUnderflow,
    StoreUnavailable(String),
}
