//! # comprehensive synchronization tests
//!
//! why: verify ordering and race guarantees of the wait queue under real concurrency
//! relations: tests raft-sync crate
//! what: fifo fairness, cancellation races, pooling, mass cancellation, disposal

use raft_sync::{
    AsyncExclusiveLock, CompletionPool, CompletionSource, IndexGate, LockManager, QueuedSynchronizer,
    WaitError,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// closed until opened, records the order of grants
#[derive(Default)]
struct Turnstile {
    open: bool,
    granted: Vec<usize>,
}

impl LockManager for Turnstile {
    type Args = usize;

    fn is_lock_allowed(&self, _: &usize) -> bool {
        self.open
    }

    fn acquire_lock(&mut self, id: &usize) {
        self.granted.push(*id);
    }

    fn revert_lock(&mut self, id: &usize) {
        self.granted.retain(|g| g != id);
    }
}

/// counting semaphore
struct Permits {
    available: usize,
    held: usize,
}

impl LockManager for Permits {
    type Args = ();

    fn is_lock_allowed(&self, _: &()) -> bool {
        self.available > 0
    }

    fn acquire_lock(&mut self, _: &()) {
        self.available -= 1;
        self.held += 1;
    }

    fn revert_lock(&mut self, _: &()) {
        self.available += 1;
        self.held -= 1;
    }
}

// =============================================================================
// SECTION 1: FIFO FAIRNESS
// =============================================================================

mod fifo {
    use super::*;

    #[tokio::test]
    async fn resumption_order_equals_enqueue_order() {
        let sync = QueuedSynchronizer::new(Turnstile::default());
        let waiters: Vec<_> = (0..10).map(|id| sync.acquire(id, None, None)).collect();

        sync.release_with(|m| m.open = true);

        for waiter in waiters {
            waiter.await.unwrap();
        }
        assert_eq!(sync.inspect(|m| m.granted.clone()), (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn lock_handoff_is_fifo() {
        let lock = Arc::new(AsyncExclusiveLock::new(Vec::new()));
        let held = lock.lock().await.unwrap();

        let mut tasks = Vec::new();
        for id in 0..8 {
            let lock = Arc::clone(&lock);
            tasks.push(tokio::spawn(async move {
                lock.lock().await.unwrap().push(id);
            }));
            // let the task enqueue before the next one is spawned
            for _ in 0..4 {
                tokio::task::yield_now().await;
            }
        }
        drop(held);

        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(*lock.lock().await.unwrap(), (0..8).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_head_unblocks_followers() {
        let sync = QueuedSynchronizer::new(Permits { available: 0, held: 0 });
        let head = sync.acquire((), Some(Duration::from_millis(10)), None);
        let follower = sync.acquire((), None, None);

        assert!(matches!(head.await, Err(WaitError::Timeout)));
        sync.release_with(|m| m.available = 1);
        follower.await.unwrap();
        assert_eq!(sync.inspect(|m| m.held), 1);
    }
}

// =============================================================================
// SECTION 2: CANCELLATION RACES
// =============================================================================

mod races {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cancel_and_complete_resolve_once() {
        let pool: Arc<CompletionPool<u32>> = CompletionPool::new(8);
        for round in 0..500 {
            let source = pool.rent();
            let generation = source.generation();
            let token = CancellationToken::new();
            let wait = source.wait(generation, None, Some(token.clone())).unwrap();

            let completer = {
                let source = source.clone();
                tokio::spawn(async move { source.try_set_result(generation, round) })
            };
            let canceler = tokio::spawn(async move { token.cancel() });

            let outcome = wait.await;
            let completed = completer.await.unwrap();
            canceler.await.unwrap();

            match outcome {
                Ok(value) => {
                    assert!(completed, "round {round}: value without completion");
                    assert_eq!(value, round);
                }
                Err(WaitError::Canceled) => assert!(!completed, "round {round}: both outcomes"),
                Err(other) => panic!("round {round}: unexpected {other}"),
            }
            // the handle was re-armed for the next user
            assert!(!source.try_set_result(generation, 0));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn grants_are_never_leaked() {
        init_tracing();
        let sync = Arc::new(QueuedSynchronizer::new(Permits { available: 0, held: 0 }));
        let acquired = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();
        let mut tokens = Vec::new();

        for _ in 0..64 {
            let token = CancellationToken::new();
            tokens.push(token.clone());
            let sync = Arc::clone(&sync);
            let acquired = Arc::clone(&acquired);
            tasks.push(tokio::spawn(async move {
                if sync.acquire((), None, Some(token)).await.is_ok() {
                    acquired.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }

        let releaser = {
            let sync = Arc::clone(&sync);
            tokio::spawn(async move {
                for _ in 0..32 {
                    sync.release_with(|m| m.available += 1);
                    tokio::task::yield_now().await;
                }
            })
        };
        for token in tokens {
            token.cancel();
            tokio::task::yield_now().await;
        }

        releaser.await.unwrap();
        for task in tasks {
            task.await.unwrap();
        }
        let held = sync.inspect(|m| m.held);
        assert_eq!(held, acquired.load(Ordering::SeqCst));
        assert_eq!(sync.inspect(|m| m.available + m.held), 32);
    }

    #[tokio::test]
    async fn canceled_token_fails_fast() {
        let sync = QueuedSynchronizer::new(Permits { available: 0, held: 0 });
        let token = CancellationToken::new();
        token.cancel();
        let result = sync.acquire((), None, Some(token)).await;
        assert!(matches!(result, Err(WaitError::Canceled)));
        assert_eq!(sync.queue_len(), 0);
    }
}

// =============================================================================
// SECTION 3: MASS CANCELLATION AND DISPOSAL
// =============================================================================

mod shutdown {
    use super::*;

    #[tokio::test]
    async fn cancel_suspended_callers_fails_everyone() {
        init_tracing();
        let sync = QueuedSynchronizer::new(Turnstile::default());
        let waiters: Vec<_> = (0..5).map(|id| sync.acquire(id, None, None)).collect();

        assert_eq!(sync.cancel_suspended_callers(WaitError::Canceled), 5);
        for waiter in waiters {
            assert!(matches!(waiter.await, Err(WaitError::Canceled)));
        }
        // still usable afterwards
        sync.release_with(|m| m.open = true);
        sync.acquire(9, None, None).await.unwrap();
    }

    #[tokio::test]
    async fn disposed_gate_fails_commit_waiters() {
        let gate = Arc::new(IndexGate::new(0));
        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.wait_for(5, None, None).await })
        };
        while gate.pending() == 0 {
            tokio::task::yield_now().await;
        }
        gate.dispose();
        assert!(matches!(waiter.await.unwrap(), Err(WaitError::Disposed)));
    }

    #[tokio::test]
    async fn lock_dispose_async_waits_for_holder() {
        init_tracing();
        let lock = Arc::new(AsyncExclusiveLock::new(()));
        let guard = lock.lock().await.unwrap();
        let disposer = {
            let lock = Arc::clone(&lock);
            tokio::spawn(async move { lock.dispose_async().await })
        };
        tokio::task::yield_now().await;
        assert!(!disposer.is_finished());

        drop(guard);
        disposer.await.unwrap().unwrap();
        assert!(matches!(lock.lock().await, Err(WaitError::Disposed)));
    }
}

// =============================================================================
// SECTION 4: COMPLETION SOURCE REUSE
// =============================================================================

mod reuse {
    use super::*;

    #[tokio::test]
    async fn reset_is_a_completion_barrier() {
        let source: CompletionSource<&str> = CompletionSource::new();
        let old = source.generation();
        let token = CancellationToken::new();
        let stale = source.wait(old, None, Some(token.clone())).unwrap();
        drop(stale);

        let new = source.reset();
        token.cancel();
        assert!(!source.try_set_canceled(old));

        let wait = source.wait(new, None, None).unwrap();
        assert!(source.try_set_result(new, "fresh"));
        assert_eq!(wait.await.unwrap(), "fresh");
    }

    #[tokio::test]
    async fn pool_bounds_its_free_list() {
        let pool: Arc<CompletionPool<()>> = CompletionPool::new(2);
        let sources: Vec<_> = (0..4).map(|_| pool.rent()).collect();
        for source in &sources {
            let generation = source.generation();
            let wait = source.wait(generation, None, None).unwrap();
            source.try_set_result(generation, ());
            wait.await.unwrap();
        }
        assert_eq!(pool.available(), 2);
    }
}

// =============================================================================
// SECTION 5: PROPERTIES
// =============================================================================

mod properties {
    use super::*;
    use proptest::prelude::*;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    proptest! {
        #[test]
        fn surviving_waiters_resume_in_order(dropped in proptest::collection::vec(any::<bool>(), 1..24)) {
            let granted = runtime().block_on(async {
                let sync = QueuedSynchronizer::new(Turnstile::default());
                let mut kept = Vec::new();
                for (id, drop_it) in dropped.iter().enumerate() {
                    let waiter = sync.acquire(id, None, None);
                    if !drop_it {
                        kept.push(waiter);
                    }
                }
                sync.release_with(|m| m.open = true);
                for waiter in kept {
                    waiter.await.unwrap();
                }
                sync.inspect(|m| m.granted.clone())
            });
            let expected: Vec<usize> = dropped
                .iter()
                .enumerate()
                .filter(|(_, d)| !**d)
                .map(|(id, _)| id)
                .collect();
            prop_assert_eq!(granted, expected);
        }
    }
}
