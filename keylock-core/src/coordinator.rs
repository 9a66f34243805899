//! The lock protocol around one protected call.
//!
//! Entry derives a [`LockRecord`], retries the store until the lock is taken
//! or the wait budget runs out, and pushes the held lock onto the calling
//! thread's stack. Exit pops the most recent lock and releases it; a
//! [`LockGuard`] instead releases exactly the lock it was created for, so
//! guards dropped out of nesting order never release each other's locks.
//! Exit never fails the caller: by then the protected work has already
//! finished.

use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use crate::backoff::Backoff;
use crate::error::{ExitOutcome, LockError};
use crate::infrastructure::LockStore;
use crate::key::KeyDeriver;
use crate::tracker::{CurrentContext, HeldLock, TrackerScope};
use crate::types::{
    AcquireOutcome, CallContext, LockConfig, LockRecord, LockToken, RefreshOutcome, ReleaseOutcome,
};

// Upper bound for wait budgets too large to add to an Instant.
const MAX_WAIT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Lets another thread abandon a waiting acquire.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CoordinatorSettings {
    pub backoff: Backoff,
    /// Prepended to every derived key
    pub key_prefix: String,
}

pub struct LockCoordinator<S> {
    store: S,
    deriver: KeyDeriver,
    backoff: Backoff,
    scope: TrackerScope,
}

impl<S: LockStore> LockCoordinator<S> {
    pub fn new(store: S) -> Self {
        Self::with_settings(store, CoordinatorSettings::default())
    }

    pub fn with_settings(store: S, settings: CoordinatorSettings) -> Self {
        Self {
            store,
            deriver: KeyDeriver::with_prefix(settings.key_prefix),
            backoff: settings.backoff,
            scope: TrackerScope::next(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn deriver(&self) -> &KeyDeriver {
        &self.deriver
    }

    /// Acquire the lock for `call` and push it on this thread's stack.
    ///
    /// Fails with [`LockError::Busy`] once `wait_seconds` have elapsed
    /// without success; `wait_seconds == 0` makes exactly one attempt.
    pub fn enter(&self, call: &CallContext, config: &LockConfig) -> Result<(), LockError> {
        self.enter_inner(call, config, None).map(|_| ())
    }

    /// Like [`enter`](Self::enter), but gives up with
    /// [`LockError::Cancelled`] as soon as `cancel` fires between attempts.
    pub fn enter_cancellable(
        &self,
        call: &CallContext,
        config: &LockConfig,
        cancel: &CancelToken,
    ) -> Result<(), LockError> {
        self.enter_inner(call, config, Some(cancel)).map(|_| ())
    }

    fn enter_inner(
        &self,
        call: &CallContext,
        config: &LockConfig,
        cancel: Option<&CancelToken>,
    ) -> Result<(String, LockToken), LockError> {
        let record = self.deriver.derive(call, config)?;
        let token = self.acquire_record(&record, cancel)?;
        let key = record.key().to_string();
        CurrentContext::push(self.scope, HeldLock::new(record, token.clone()));
        Ok((key, token))
    }

    /// Retry the store until `record` is acquired or its wait budget is spent.
    /// Does not touch the reentrancy stack.
    pub fn acquire_record(
        &self,
        record: &LockRecord,
        cancel: Option<&CancelToken>,
    ) -> Result<LockToken, LockError> {
        let started = Instant::now();
        let deadline = started
            .checked_add(record.wait())
            .unwrap_or_else(|| started + MAX_WAIT);
        let mut delays = self.backoff.delays();
        let mut attempts = 0u32;

        loop {
            if cancel.is_some_and(CancelToken::is_cancelled) {
                debug!(key = record.key(), attempts, "lock wait cancelled");
                return Err(LockError::Cancelled {
                    key: record.key().to_string(),
                });
            }

            attempts += 1;
            let store_failure = match self.store.acquire(record.key(), record.lease()) {
                Ok(AcquireOutcome::Acquired(token)) => {
                    debug!(
                        key = record.key(),
                        attempts,
                        lease_seconds = record.lease_seconds(),
                        "lock acquired"
                    );
                    return Ok(token);
                }
                Ok(AcquireOutcome::Busy) => None,
                Err(e) => {
                    warn!(key = record.key(), attempts, error = %e, "lock store unavailable during acquire");
                    Some(e)
                }
            };

            let now = Instant::now();
            if now >= deadline {
                return Err(match store_failure {
                    Some(source) => LockError::StoreUnavailable {
                        key: record.key().to_string(),
                        source,
                    },
                    None => {
                        warn!(
                            key = record.key(),
                            attempts,
                            waited_ms = started.elapsed().as_millis() as u64,
                            "lock busy, rejecting concurrent request"
                        );
                        LockError::Busy {
                            key: record.key().to_string(),
                            message: record.message().to_string(),
                        }
                    }
                });
            }

            let delay = delays.next().unwrap_or_default().min(deadline - now);
            thread::sleep(delay);
        }
    }

    /// Release the most recently acquired lock on this thread.
    pub fn exit(&self) -> ExitOutcome {
        match CurrentContext::pop_last(self.scope) {
            Some(held) => self.release_held(held),
            None => {
                warn!("lock exit without a matching entry on this thread");
                ExitOutcome::TrackerUnderflow
            }
        }
    }

    fn exit_guard(&self, key: &str, token: &LockToken) -> ExitOutcome {
        let innermost = CurrentContext::peek_last(self.scope).is_some_and(|h| &h.token == token);
        match CurrentContext::take(self.scope, token) {
            Some(held) => {
                if !innermost {
                    debug!(key, "lock guard released out of nesting order");
                }
                self.release_held(held)
            }
            None => {
                warn!(key, "lock guard outlived its entry on this thread");
                ExitOutcome::TrackerUnderflow
            }
        }
    }

    fn release_held(&self, held: HeldLock) -> ExitOutcome {
        let held_ms = held.acquired_at.elapsed().as_millis() as u64;
        match self.store.release(held.key(), &held.token) {
            Ok(ReleaseOutcome::Released) => {
                debug!(key = held.key(), held_ms, "lock released");
                ExitOutcome::Released
            }
            Ok(ReleaseOutcome::NotOwner) => {
                warn!(
                    key = held.key(),
                    held_ms,
                    lease_seconds = held.record.lease_seconds(),
                    "lock no longer owned at release, lease expired before the call finished"
                );
                ExitOutcome::NotOwner
            }
            Err(e) => {
                error!(key = held.key(), error = %e, "failed to release lock");
                ExitOutcome::StoreUnavailable(e.to_string())
            }
        }
    }

    /// Acquire and return a guard that releases when dropped.
    pub fn lock(&self, call: &CallContext, config: &LockConfig) -> Result<LockGuard<'_, S>, LockError> {
        let (key, token) = self.enter_inner(call, config, None)?;
        Ok(LockGuard::new(self, key, token))
    }

    pub fn lock_cancellable(
        &self,
        call: &CallContext,
        config: &LockConfig,
        cancel: &CancelToken,
    ) -> Result<LockGuard<'_, S>, LockError> {
        let (key, token) = self.enter_inner(call, config, Some(cancel))?;
        Ok(LockGuard::new(self, key, token))
    }

    /// Run `body` while holding the lock for `call`. The lock is released on
    /// every way out of `body`, including a panic.
    pub fn with_lock<T>(
        &self,
        call: &CallContext,
        config: &LockConfig,
        body: impl FnOnce() -> T,
    ) -> Result<T, LockError> {
        let _guard = self.lock(call, config)?;
        Ok(body())
    }

    /// Extend the lease of the innermost lock held on this thread.
    pub fn refresh_current(&self) -> Result<RefreshOutcome, LockError> {
        let held = CurrentContext::peek_last(self.scope).ok_or(LockError::NotHeld)?;
        let outcome = self
            .store
            .refresh(held.key(), &held.token, held.record.lease())
            .map_err(|source| LockError::StoreUnavailable {
                key: held.key().to_string(),
                source,
            })?;
        if outcome == RefreshOutcome::NotOwner {
            warn!(key = held.key(), "lease refresh refused, lock no longer owned");
        }
        Ok(outcome)
    }

    /// Number of locks this coordinator holds on the calling thread.
    pub fn held_depth(&self) -> usize {
        CurrentContext::depth(self.scope)
    }

    /// Keys held on the calling thread, outermost first.
    pub fn held_keys(&self) -> Vec<String> {
        CurrentContext::held_keys(self.scope)
    }

    /// Whether the calling thread has reentrancy storage for this coordinator.
    pub fn has_tracker(&self) -> bool {
        CurrentContext::is_allocated(self.scope)
    }
}

/// Holds one lock for the current scope. Bound to the thread that acquired
/// it, because the reentrancy stack it removes itself from is thread-local.
/// Releases only its own lock, whatever order guards are dropped in.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard<'a, S: LockStore> {
    coordinator: &'a LockCoordinator<S>,
    key: String,
    token: LockToken,
    finished: bool,
    _not_send: PhantomData<*const ()>,
}

impl<'a, S: LockStore> LockGuard<'a, S> {
    fn new(coordinator: &'a LockCoordinator<S>, key: String, token: LockToken) -> Self {
        Self {
            coordinator,
            key,
            token,
            finished: false,
            _not_send: PhantomData,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release now and report what the store said.
    pub fn release(mut self) -> ExitOutcome {
        self.finished = true;
        self.coordinator.exit_guard(&self.key, &self.token)
    }
}

impl<S: LockStore> Drop for LockGuard<'_, S> {
    fn drop(&mut self) {
        if !self.finished {
            self.finished = true;
            self.coordinator.exit_guard(&self.key, &self.token);
        }
    }
}
