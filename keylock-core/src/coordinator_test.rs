#[cfg(test)]
mod tests {
    use crate::backoff::Backoff;
    use crate::clock::ManualClock;
    use crate::coordinator::{CancelToken, CoordinatorSettings, LockCoordinator};
    use crate::error::{ExitOutcome, LockError, StoreError};
    use crate::infrastructure::LockStore;
    use crate::infrastructure_in_memory::InMemoryLockStore;
    use crate::types::{
        AcquireOutcome, CallContext, LockConfig, LockToken, RefreshOutcome, ReleaseOutcome,
    };
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier, Mutex, mpsc};
    use std::thread;
    use std::time::{Duration, Instant};

    // =========================================================================
    // Helpers
    // =========================================================================

    /// In-memory store that counts acquire attempts and logs releases.
    #[derive(Default)]
    struct RecordingStore {
        inner: InMemoryLockStore,
        attempts: AtomicUsize,
        released: Mutex<Vec<String>>,
    }

    impl RecordingStore {
        fn with_clock(clock: ManualClock) -> Self {
            Self {
                inner: InMemoryLockStore::with_clock(clock),
                ..Self::default()
            }
        }

        fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }

        fn released(&self) -> Vec<String> {
            self.released.lock().unwrap().clone()
        }
    }

    impl LockStore for RecordingStore {
        fn acquire(&self, key: &str, lease: Duration) -> Result<AcquireOutcome, StoreError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            self.inner.acquire(key, lease)
        }

        fn release(&self, key: &str, token: &LockToken) -> Result<ReleaseOutcome, StoreError> {
            self.released.lock().unwrap().push(key.to_string());
            self.inner.release(key, token)
        }

        fn refresh(
            &self,
            key: &str,
            token: &LockToken,
            lease: Duration,
        ) -> Result<RefreshOutcome, StoreError> {
            self.inner.refresh(key, token, lease)
        }
    }

    /// A store whose network is down until `up` is set.
    #[derive(Default)]
    struct FlakyStore {
        inner: InMemoryLockStore,
        up: AtomicBool,
    }

    impl FlakyStore {
        fn check(&self) -> Result<(), StoreError> {
            if self.up.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(StoreError::Unavailable("connection refused".into()))
            }
        }
    }

    impl LockStore for FlakyStore {
        fn acquire(&self, key: &str, lease: Duration) -> Result<AcquireOutcome, StoreError> {
            self.check()?;
            self.inner.acquire(key, lease)
        }

        fn release(&self, key: &str, token: &LockToken) -> Result<ReleaseOutcome, StoreError> {
            self.check()?;
            self.inner.release(key, token)
        }

        fn refresh(
            &self,
            key: &str,
            token: &LockToken,
            lease: Duration,
        ) -> Result<RefreshOutcome, StoreError> {
            self.check()?;
            self.inner.refresh(key, token, lease)
        }
    }

    fn fast_settings() -> CoordinatorSettings {
        CoordinatorSettings {
            backoff: Backoff::new(Duration::from_millis(1), Duration::from_millis(10), 2),
            key_prefix: String::new(),
        }
    }

    fn order_call(order_id: u64) -> CallContext {
        CallContext::new("OrderService", "pay").arg("orderId", order_id)
    }

    fn order_config() -> LockConfig {
        LockConfig::keyed("order.pay.{orderId}")
            .wait_seconds(2)
            .lease_seconds(5)
            .message("duplicate request")
    }

    // =========================================================================
    // Mutual exclusion
    // =========================================================================

    #[test]
    fn concurrent_callers_never_overlap() {
        let coordinator = LockCoordinator::with_settings(InMemoryLockStore::new(), fast_settings());
        let active = AtomicUsize::new(0);
        let max_active = AtomicUsize::new(0);
        let completed = AtomicUsize::new(0);
        let start = Barrier::new(8);

        thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    start.wait();
                    coordinator
                        .with_lock(&order_call(42), &order_config(), || {
                            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                            max_active.fetch_max(now, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(5));
                            active.fetch_sub(1, Ordering::SeqCst);
                            completed.fetch_add(1, Ordering::SeqCst);
                        })
                        .unwrap();
                });
            }
        });

        assert_eq!(max_active.load(Ordering::SeqCst), 1);
        assert_eq!(completed.load(Ordering::SeqCst), 8);
        assert!(coordinator.store().entry("order.pay.42").is_none());
    }

    #[test]
    fn distinct_keys_run_in_parallel() {
        let coordinator = LockCoordinator::with_settings(InMemoryLockStore::new(), fast_settings());
        let both_inside = Barrier::new(2);

        thread::scope(|s| {
            for order_id in [1, 2] {
                let coordinator = &coordinator;
                let both_inside = &both_inside;
                s.spawn(move || {
                    coordinator
                        .with_lock(&order_call(order_id), &order_config().wait_seconds(0), || {
                            // Deadlocks unless both holders are inside at once
                            both_inside.wait();
                        })
                        .unwrap();
                });
            }
        });
    }

    // =========================================================================
    // Reentrancy
    // =========================================================================

    #[test]
    fn nested_calls_release_inner_first() {
        let coordinator = LockCoordinator::with_settings(RecordingStore::default(), fast_settings());

        coordinator.enter(&order_call(1), &order_config()).unwrap();
        coordinator
            .enter(&CallContext::new("Inventory", "reserve"), &LockConfig::default())
            .unwrap();
        assert_eq!(coordinator.held_keys(), vec!["order.pay.1", "Inventory.reserve"]);

        assert_eq!(coordinator.exit(), ExitOutcome::Released);
        assert_eq!(coordinator.held_depth(), 1);
        assert!(coordinator.has_tracker());

        assert_eq!(coordinator.exit(), ExitOutcome::Released);
        assert!(!coordinator.has_tracker());
        assert_eq!(
            coordinator.store().released(),
            vec!["Inventory.reserve", "order.pay.1"]
        );
    }

    #[test]
    fn nested_guards_unwind_in_order() {
        let coordinator = LockCoordinator::with_settings(RecordingStore::default(), fast_settings());

        coordinator
            .with_lock(&order_call(1), &order_config(), || {
                coordinator
                    .with_lock(&order_call(2), &order_config(), || {
                        assert_eq!(coordinator.held_depth(), 2);
                    })
                    .unwrap();
                assert_eq!(coordinator.held_depth(), 1);
            })
            .unwrap();

        assert!(!coordinator.has_tracker());
        assert_eq!(coordinator.store().released(), vec!["order.pay.2", "order.pay.1"]);
    }

    #[test]
    fn guard_dropped_out_of_order_releases_only_its_own_lock() {
        let store = Arc::new(InMemoryLockStore::new());
        let coordinator = LockCoordinator::with_settings(store.clone(), fast_settings());
        let rival = LockCoordinator::with_settings(store.clone(), fast_settings());

        let outer = coordinator.lock(&order_call(1), &order_config()).unwrap();
        let inner = coordinator.lock(&order_call(2), &order_config()).unwrap();

        drop(outer);
        assert!(store.entry("order.pay.1").is_none());
        assert!(store.entry("order.pay.2").is_some());
        assert_eq!(coordinator.held_keys(), vec!["order.pay.2"]);

        let denied = rival.lock(&order_call(2), &order_config().wait_seconds(0));
        assert!(matches!(denied, Err(LockError::Busy { .. })));

        assert_eq!(inner.release(), ExitOutcome::Released);
        assert!(store.entry("order.pay.2").is_none());
        assert!(!coordinator.has_tracker());
    }

    #[test]
    fn explicit_outer_release_leaves_inner_guard_holding() {
        let coordinator = LockCoordinator::with_settings(RecordingStore::default(), fast_settings());

        let outer = coordinator.lock(&order_call(1), &order_config()).unwrap();
        let _inner = coordinator.lock(&order_call(2), &order_config()).unwrap();

        assert_eq!(outer.release(), ExitOutcome::Released);
        assert_eq!(coordinator.store().released(), vec!["order.pay.1"]);
        assert_eq!(coordinator.held_keys(), vec!["order.pay.2"]);
    }

    #[test]
    fn guard_whose_entry_was_popped_by_exit_is_a_no_op() {
        let coordinator = LockCoordinator::with_settings(RecordingStore::default(), fast_settings());

        let outer = coordinator.lock(&order_call(1), &order_config()).unwrap();
        assert_eq!(coordinator.exit(), ExitOutcome::Released);
        assert_eq!(outer.release(), ExitOutcome::TrackerUnderflow);
        assert_eq!(coordinator.store().released(), vec!["order.pay.1"]);
    }

    #[test]
    fn reentering_the_same_key_fails_fast() {
        let coordinator = LockCoordinator::with_settings(InMemoryLockStore::new(), fast_settings());
        let _outer = coordinator.lock(&order_call(1), &order_config()).unwrap();

        let inner = coordinator.lock(&order_call(1), &order_config().wait_seconds(0));
        assert!(matches!(inner, Err(LockError::Busy { .. })));
        assert_eq!(coordinator.held_depth(), 1);
    }

    #[test]
    fn exit_without_entry_is_a_diagnosed_no_op() {
        let coordinator = LockCoordinator::with_settings(RecordingStore::default(), fast_settings());
        assert_eq!(coordinator.exit(), ExitOutcome::TrackerUnderflow);
        assert!(!coordinator.has_tracker());
        assert!(coordinator.store().released().is_empty());
    }

    #[test]
    fn coordinators_keep_separate_stacks() {
        let first = LockCoordinator::with_settings(RecordingStore::default(), fast_settings());
        let second = LockCoordinator::with_settings(RecordingStore::default(), fast_settings());

        first.enter(&order_call(1), &order_config()).unwrap();
        assert_eq!(second.exit(), ExitOutcome::TrackerUnderflow);
        assert_eq!(first.exit(), ExitOutcome::Released);
    }

    // =========================================================================
    // Guaranteed release
    // =========================================================================

    #[test]
    fn panic_in_body_still_releases() {
        let coordinator = LockCoordinator::with_settings(InMemoryLockStore::new(), fast_settings());

        let result = catch_unwind(AssertUnwindSafe(|| {
            coordinator.with_lock(&order_call(9), &order_config(), || {
                panic!("payment gateway exploded");
            })
        }));

        assert!(result.is_err());
        assert!(!coordinator.has_tracker());
        assert!(coordinator.store().entry("order.pay.9").is_none());
    }

    #[test]
    fn explicit_guard_release_reports_outcome() {
        let coordinator = LockCoordinator::with_settings(InMemoryLockStore::new(), fast_settings());
        let guard = coordinator.lock(&order_call(3), &order_config()).unwrap();
        assert_eq!(guard.key(), "order.pay.3");
        assert_eq!(guard.release(), ExitOutcome::Released);
        assert!(!coordinator.has_tracker());
    }

    #[test]
    fn body_error_values_pass_through() {
        let coordinator = LockCoordinator::with_settings(InMemoryLockStore::new(), fast_settings());
        let outcome: Result<Result<(), String>, LockError> =
            coordinator.with_lock(&order_call(4), &order_config(), || Err("declined".to_string()));
        assert_eq!(outcome.unwrap(), Err("declined".to_string()));
        assert!(coordinator.store().entry("order.pay.4").is_none());
    }

    // =========================================================================
    // Waiting
    // =========================================================================

    #[test]
    fn zero_wait_makes_exactly_one_attempt() {
        let coordinator = LockCoordinator::with_settings(
            RecordingStore::default(),
            CoordinatorSettings {
                backoff: Backoff::fixed(Duration::from_millis(500)),
                key_prefix: String::new(),
            },
        );
        let token = match coordinator.store().acquire("order.pay.42", Duration::from_secs(5)).unwrap() {
            AcquireOutcome::Acquired(token) => token,
            AcquireOutcome::Busy => panic!("key should be free"),
        };
        let before = coordinator.store().attempts();

        let started = Instant::now();
        let err = coordinator
            .enter(&order_call(42), &order_config().wait_seconds(0))
            .unwrap_err();

        assert!(started.elapsed() < Duration::from_millis(250));
        assert_eq!(coordinator.store().attempts() - before, 1);
        assert_eq!(err.busy_message(), Some("duplicate request"));
        assert!(!coordinator.has_tracker());

        coordinator.store().release("order.pay.42", &token).unwrap();
    }

    #[test]
    fn waiter_acquires_after_holder_releases() {
        let coordinator = LockCoordinator::with_settings(InMemoryLockStore::new(), fast_settings());
        let (held_tx, held_rx) = mpsc::channel();

        thread::scope(|s| {
            let holder = &coordinator;
            s.spawn(move || {
                holder
                    .with_lock(&order_call(42), &order_config(), || {
                        held_tx.send(()).unwrap();
                        thread::sleep(Duration::from_millis(100));
                    })
                    .unwrap();
            });

            held_rx.recv().unwrap();
            let started = Instant::now();
            let ran = coordinator
                .with_lock(&order_call(42), &order_config(), || true)
                .unwrap();
            assert!(ran);
            assert!(started.elapsed() >= Duration::from_millis(50));
        });
    }

    #[test]
    fn waiter_gives_up_with_configured_message() {
        let coordinator = LockCoordinator::with_settings(InMemoryLockStore::new(), fast_settings());
        let (held_tx, held_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let second_ran = AtomicBool::new(false);

        thread::scope(|s| {
            let holder = &coordinator;
            s.spawn(move || {
                holder
                    .with_lock(&order_call(42), &order_config(), || {
                        held_tx.send(()).unwrap();
                        done_rx.recv().unwrap();
                    })
                    .unwrap();
            });

            held_rx.recv().unwrap();
            let started = Instant::now();
            let err = coordinator
                .with_lock(&order_call(42), &order_config().wait_seconds(1), || {
                    second_ran.store(true, Ordering::SeqCst);
                })
                .unwrap_err();

            assert!(started.elapsed() >= Duration::from_secs(1));
            assert!(err.is_busy());
            assert_eq!(err.to_string(), "duplicate request");
            done_tx.send(()).unwrap();
        });

        assert!(!second_ran.load(Ordering::SeqCst));
    }

    #[test]
    fn cancellation_abandons_the_wait() {
        let coordinator = LockCoordinator::with_settings(InMemoryLockStore::new(), fast_settings());
        let _held = coordinator.store().acquire("order.pay.42", Duration::from_secs(30)).unwrap();
        let cancel = CancelToken::new();

        thread::scope(|s| {
            let waiter = s.spawn(|| {
                let result = coordinator.enter_cancellable(
                    &order_call(42),
                    &order_config().wait_seconds(30),
                    &cancel,
                );
                (result, coordinator.has_tracker())
            });

            thread::sleep(Duration::from_millis(30));
            cancel.cancel();
            let (result, has_tracker) = waiter.join().unwrap();
            assert!(matches!(result, Err(LockError::Cancelled { .. })));
            assert!(!has_tracker);
        });
    }

    // =========================================================================
    // Configuration and store failures
    // =========================================================================

    #[test]
    fn malformed_config_never_reaches_the_store() {
        let coordinator = LockCoordinator::with_settings(RecordingStore::default(), fast_settings());

        let zero_lease = coordinator.enter(&order_call(1), &order_config().lease_seconds(0));
        assert!(matches!(zero_lease, Err(LockError::MalformedConfiguration(_))));

        let unresolved = coordinator.enter(&order_call(1), &LockConfig::keyed("order.{missing}"));
        assert!(matches!(unresolved, Err(LockError::MalformedConfiguration(_))));

        assert_eq!(coordinator.store().attempts(), 0);
        assert!(!coordinator.has_tracker());
    }

    #[test]
    fn unreachable_store_surfaces_as_store_unavailable() {
        let coordinator = LockCoordinator::with_settings(FlakyStore::default(), fast_settings());
        let err = coordinator
            .enter(&order_call(1), &order_config().wait_seconds(0))
            .unwrap_err();
        assert!(matches!(err, LockError::StoreUnavailable { .. }));
        assert!(!coordinator.has_tracker());
    }

    #[test]
    fn release_failure_is_absorbed() {
        let coordinator = LockCoordinator::with_settings(FlakyStore::default(), fast_settings());
        coordinator.store().up.store(true, Ordering::SeqCst);
        coordinator.enter(&order_call(1), &order_config()).unwrap();

        coordinator.store().up.store(false, Ordering::SeqCst);
        assert!(matches!(coordinator.exit(), ExitOutcome::StoreUnavailable(_)));
        assert!(!coordinator.has_tracker());
    }

    // =========================================================================
    // Lease expiry
    // =========================================================================

    #[test]
    fn release_after_lease_expiry_leaves_new_holder_alone() {
        let clock = ManualClock::new(0);
        let coordinator = LockCoordinator::with_settings(
            InMemoryLockStore::with_clock(clock.clone()),
            fast_settings(),
        );

        coordinator.enter(&order_call(42), &order_config()).unwrap();
        clock.advance(5_000);

        let newcomer = match coordinator.store().acquire("order.pay.42", Duration::from_secs(5)).unwrap() {
            AcquireOutcome::Acquired(token) => token,
            AcquireOutcome::Busy => panic!("lease should have expired"),
        };

        assert_eq!(coordinator.exit(), ExitOutcome::NotOwner);
        assert_eq!(coordinator.store().entry("order.pay.42").unwrap().token, newcomer);
        assert!(!coordinator.has_tracker());
    }

    #[test]
    fn refresh_extends_the_innermost_lease() {
        let clock = ManualClock::new(0);
        let coordinator = LockCoordinator::with_settings(
            RecordingStore::with_clock(clock.clone()),
            fast_settings(),
        );

        assert!(matches!(coordinator.refresh_current(), Err(LockError::NotHeld)));

        coordinator.enter(&order_call(42), &order_config()).unwrap();
        clock.advance(4_000);
        assert_eq!(coordinator.refresh_current().unwrap(), RefreshOutcome::Refreshed);
        clock.advance(4_000);
        assert_eq!(coordinator.exit(), ExitOutcome::Released);
    }

    #[test]
    fn coordinator_works_over_shared_store() {
        let store = Arc::new(InMemoryLockStore::new());
        let a = LockCoordinator::with_settings(store.clone(), fast_settings());
        let b = LockCoordinator::with_settings(store.clone(), fast_settings());

        let _held = a.lock(&order_call(5), &order_config()).unwrap();
        let denied = b.lock(&order_call(5), &order_config().wait_seconds(0));
        assert!(matches!(denied, Err(LockError::Busy { .. })));
    }

    #[test]
    fn coordinator_works_over_borrowed_store() {
        let store = InMemoryLockStore::new();
        let a = LockCoordinator::with_settings(&store, fast_settings());
        let b = LockCoordinator::with_settings(&store, fast_settings());

        let held = a.lock(&order_call(6), &order_config()).unwrap();
        assert!(store.entry("order.pay.6").is_some());
        let denied = b.lock(&order_call(6), &order_config().wait_seconds(0));
        assert!(matches!(denied, Err(LockError::Busy { .. })));

        drop(held);
        assert!(b.with_lock(&order_call(6), &order_config(), || ()).is_ok());
    }

    #[test]
    fn key_prefix_namespaces_store_keys() {
        let coordinator = LockCoordinator::with_settings(
            InMemoryLockStore::new(),
            CoordinatorSettings {
                key_prefix: "keylock:".to_string(),
                ..fast_settings()
            },
        );
        let guard = coordinator.lock(&order_call(8), &order_config()).unwrap();
        assert!(coordinator.store().entry("keylock:order.pay.8").is_some());
        drop(guard);
        assert!(coordinator.store().entry("keylock:order.pay.8").is_none());
    }
}
