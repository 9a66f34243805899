//! Per-thread reentrancy stacks.
//!
//! Each thread keeps one LIFO stack of held locks per coordinator. Stacks are
//! allocated on the first push and dropped by the pop that empties them, so a
//! pooled worker thread carries nothing over into unrelated later work.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::types::{LockRecord, LockToken};

/// A lock this thread currently holds.
#[derive(Debug, Clone)]
pub struct HeldLock {
    pub record: LockRecord,
    pub token: LockToken,
    pub acquired_at: Instant,
}

impl HeldLock {
    pub fn new(record: LockRecord, token: LockToken) -> Self {
        Self {
            record,
            token,
            acquired_at: Instant::now(),
        }
    }

    pub fn key(&self) -> &str {
        self.record.key()
    }
}

/// Ordered stack of held locks for one execution context.
#[derive(Debug, Default)]
pub struct ReentrancyTracker {
    stack: Vec<HeldLock>,
}

impl ReentrancyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, held: HeldLock) {
        self.stack.push(held);
    }

    pub fn pop_last(&mut self) -> Option<HeldLock> {
        self.stack.pop()
    }

    pub fn peek_last(&self) -> Option<&HeldLock> {
        self.stack.last()
    }

    /// Remove the lock acquired under `token`, wherever it sits.
    pub fn remove(&mut self, token: &LockToken) -> Option<HeldLock> {
        let at = self.stack.iter().rposition(|h| &h.token == token)?;
        Some(self.stack.remove(at))
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    pub fn len(&self) -> usize {
        self.stack.len()
    }

    /// Held keys, outermost first.
    pub fn keys(&self) -> Vec<String> {
        self.stack.iter().map(|h| h.key().to_string()).collect()
    }
}

/// Identifies whose stacks these are. Two coordinators on one thread never
/// see each other's locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrackerScope(u64);

impl TrackerScope {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

thread_local! {
    static TRACKERS: RefCell<HashMap<TrackerScope, ReentrancyTracker>> = RefCell::new(HashMap::new());
}

/// The calling thread's trackers.
pub struct CurrentContext;

impl CurrentContext {
    /// Push onto this thread's stack for `scope`, creating it if needed.
    pub fn push(scope: TrackerScope, held: HeldLock) {
        TRACKERS.with(|trackers| {
            trackers
                .borrow_mut()
                .entry(scope)
                .or_default()
                .push(held);
        });
    }

    /// Pop the most recent lock. Drops the stack when this empties it.
    pub fn pop_last(scope: TrackerScope) -> Option<HeldLock> {
        TRACKERS.with(|trackers| {
            let mut trackers = trackers.borrow_mut();
            let tracker = trackers.get_mut(&scope)?;
            let held = tracker.pop_last();
            if tracker.is_empty() {
                trackers.remove(&scope);
            }
            held
        })
    }

    /// Take the lock held under `token` out of the stack for `scope`. Drops
    /// the stack when this empties it.
    pub fn take(scope: TrackerScope, token: &LockToken) -> Option<HeldLock> {
        TRACKERS.with(|trackers| {
            let mut trackers = trackers.borrow_mut();
            let tracker = trackers.get_mut(&scope)?;
            let held = tracker.remove(token);
            if tracker.is_empty() {
                trackers.remove(&scope);
            }
            held
        })
    }

    pub fn peek_last(scope: TrackerScope) -> Option<HeldLock> {
        TRACKERS.with(|trackers| {
            trackers
                .borrow()
                .get(&scope)
                .and_then(|t| t.peek_last().cloned())
        })
    }

    pub fn depth(scope: TrackerScope) -> usize {
        TRACKERS.with(|trackers| trackers.borrow().get(&scope).map_or(0, ReentrancyTracker::len))
    }

    pub fn held_keys(scope: TrackerScope) -> Vec<String> {
        TRACKERS.with(|trackers| {
            trackers
                .borrow()
                .get(&scope)
                .map(ReentrancyTracker::keys)
                .unwrap_or_default()
        })
    }

    /// Whether this thread currently has storage for `scope`.
    pub fn is_allocated(scope: TrackerScope) -> bool {
        TRACKERS.with(|trackers| trackers.borrow().contains_key(&scope))
    }
}
