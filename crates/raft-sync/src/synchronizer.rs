//! # synchronizer
//!
//! why: admit asynchronous callers to a shared resource first-come-first-served
//! relations: uses completion.rs for suspended callers; specialized by lock.rs, rwlock.rs, gate.rs
//! what: LockManager policy trait, QueuedSynchronizer, Acquire future
//!
//! Waiters live in a slab arena linked by index. Admission and drain run under
//! one private mutex; a suspended caller is resumed by completing its pooled
//! CompletionSource while that mutex is held, so a grant and a concurrent
//! timeout or cancellation always resolve to exactly one outcome.

use crate::{CompletionPool, CompletionSource, Wait, WaitError};
use parking_lot::Mutex;
use pin_project_lite::pin_project;
use slab::Slab;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const POOL_CAPACITY: usize = 64;

/// Admission policy of a synchronizer
pub trait LockManager: Send + 'static {
    /// per-waiter request, e.g. read vs write or a target index
    type Args: Clone + Send + Unpin + 'static;

    /// when true a blocked waiter also blocks everyone queued behind it
    const STRICT_FIFO: bool = true;

    fn is_lock_allowed(&self, args: &Self::Args) -> bool;

    fn acquire_lock(&mut self, args: &Self::Args);

    /// undo a grant that no caller observed
    fn revert_lock(&mut self, args: &Self::Args);

    /// queue position hint: true places `new` ahead of an already queued waiter
    fn precedes(&self, _new: &Self::Args, _queued: &Self::Args) -> bool {
        false
    }

    fn is_ready_to_dispose(&self) -> bool {
        true
    }
}

struct WaitNode<A> {
    prev: Option<usize>,
    next: Option<usize>,
    source: CompletionSource<()>,
    generation: u64,
    args: A,
}

impl<A> WaitNode<A> {
    fn is_completed(&self) -> bool {
        self.source.is_completed(self.generation)
    }
}

struct Queue<M: LockManager> {
    manager: M,
    nodes: Slab<WaitNode<M::Args>>,
    head: Option<usize>,
    tail: Option<usize>,
    disposed: bool,
    dispose_waiters: Vec<(CompletionSource<()>, u64)>,
}

impl<M: LockManager> Queue<M> {
    fn admits(&self, args: &M::Args) -> bool {
        (self.head.is_none() || !M::STRICT_FIFO) && self.manager.is_lock_allowed(args)
    }

    fn enqueue(&mut self, source: CompletionSource<()>, generation: u64, args: M::Args) -> usize {
        let mut after = self.tail;
        while let Some(key) = after {
            if !self.manager.precedes(&args, &self.nodes[key].args) {
                break;
            }
            after = self.nodes[key].prev;
        }

        let next = match after {
            Some(key) => self.nodes[key].next,
            None => self.head,
        };
        let key = self.nodes.insert(WaitNode {
            prev: after,
            next,
            source,
            generation,
            args,
        });
        match after {
            Some(prev) => self.nodes[prev].next = Some(key),
            None => self.head = Some(key),
        }
        match next {
            Some(next) => self.nodes[next].prev = Some(key),
            None => self.tail = Some(key),
        }
        key
    }

    fn unlink(&mut self, key: usize) -> WaitNode<M::Args> {
        let node = self.nodes.remove(key);
        match node.prev {
            Some(prev) => self.nodes[prev].next = node.next,
            None => self.head = node.next,
        }
        match node.next {
            Some(next) => self.nodes[next].prev = node.prev,
            None => self.tail = node.prev,
        }
        node
    }

    /// unlink `key` only if it still holds the given wait
    fn forget(&mut self, key: usize, source: &CompletionSource<()>, generation: u64) {
        let owned = self
            .nodes
            .get(key)
            .is_some_and(|node| node.generation == generation && node.source.ptr_eq(source));
        if owned {
            self.unlink(key);
        }
    }

    fn prune_head(&mut self) {
        while let Some(key) = self.head {
            if !self.nodes[key].is_completed() {
                break;
            }
            self.unlink(key);
        }
    }

    fn drain(&mut self) {
        let mut cursor = self.head;
        while let Some(key) = cursor {
            let node = &self.nodes[key];
            cursor = node.next;
            if node.is_completed() {
                self.unlink(key);
            } else if self.manager.is_lock_allowed(&node.args) {
                let node = self.unlink(key);
                if node.source.try_set_result(node.generation, ()) {
                    self.manager.acquire_lock(&node.args);
                }
            } else if M::STRICT_FIFO {
                break;
            }
        }
        self.notify_dispose_waiters();
    }

    fn fail_all(&mut self, reason: &WaitError) -> usize {
        let mut failed = 0;
        for node in self.nodes.drain() {
            if node.source.try_set_error(node.generation, reason.clone()) {
                failed += 1;
            }
        }
        self.head = None;
        self.tail = None;
        failed
    }

    fn dispose(&mut self) {
        if !self.disposed {
            self.disposed = true;
            self.fail_all(&WaitError::Disposed);
        }
        self.notify_dispose_waiters();
    }

    fn notify_dispose_waiters(&mut self) {
        if self.disposed && self.manager.is_ready_to_dispose() {
            for (source, generation) in self.dispose_waiters.drain(..) {
                source.try_set_result(generation, ());
            }
        }
    }
}

/// FIFO wait queue guarded by a LockManager policy
pub struct QueuedSynchronizer<M: LockManager> {
    queue: Mutex<Queue<M>>,
    pool: Arc<CompletionPool<()>>,
}

impl<M: LockManager> QueuedSynchronizer<M> {
    pub fn new(manager: M) -> Self {
        Self {
            queue: Mutex::new(Queue {
                manager,
                nodes: Slab::new(),
                head: None,
                tail: None,
                disposed: false,
                dispose_waiters: Vec::new(),
            }),
            pool: CompletionPool::new(POOL_CAPACITY),
        }
    }

    /// request admission; the caller's queue position is fixed when this returns
    pub fn acquire(
        &self,
        args: M::Args,
        timeout: Option<Duration>,
        cancellation: Option<CancellationToken>,
    ) -> Acquire<'_, M> {
        let state = self.enqueue(args, timeout, cancellation);
        Acquire { sync: self, state }
    }

    fn enqueue(
        &self,
        args: M::Args,
        timeout: Option<Duration>,
        cancellation: Option<CancellationToken>,
    ) -> AcquireState<M::Args> {
        let mut queue = self.queue.lock();
        if queue.disposed {
            return AcquireState::Done { result: Err(WaitError::Disposed) };
        }
        queue.prune_head();
        if queue.admits(&args) {
            queue.manager.acquire_lock(&args);
            return AcquireState::Done { result: Ok(()) };
        }
        if timeout.is_some_and(|t| t.is_zero()) {
            return AcquireState::Done { result: Err(WaitError::Timeout) };
        }
        if cancellation.as_ref().is_some_and(|t| t.is_cancelled()) {
            return AcquireState::Done { result: Err(WaitError::Canceled) };
        }

        let source = self.pool.rent();
        let generation = source.generation();
        let wait = match source.wait(generation, timeout, cancellation) {
            Ok(wait) => wait,
            Err(err) => return AcquireState::Done { result: Err(err) },
        };
        let key = queue.enqueue(source, generation, args.clone());
        AcquireState::Waiting { key, wait, args }
    }

    /// admit immediately or not at all
    pub fn try_acquire(&self, args: &M::Args) -> Result<bool, WaitError> {
        let mut queue = self.queue.lock();
        if queue.disposed {
            return Err(WaitError::Disposed);
        }
        queue.prune_head();
        if queue.admits(args) {
            queue.manager.acquire_lock(args);
            return Ok(true);
        }
        Ok(false)
    }

    /// change the resource state, then resume whoever became admissible
    pub fn release_with<R>(&self, f: impl FnOnce(&mut M) -> R) -> R {
        let mut queue = self.queue.lock();
        let result = f(&mut queue.manager);
        queue.drain();
        result
    }

    pub fn inspect<R>(&self, f: impl FnOnce(&M) -> R) -> R {
        f(&self.queue.lock().manager)
    }

    /// number of suspended callers, including ones not yet pruned
    pub fn queue_len(&self) -> usize {
        self.queue.lock().nodes.len()
    }

    pub fn is_disposed(&self) -> bool {
        self.queue.lock().disposed
    }

    /// detach every suspended caller, failing it with `reason`
    pub fn cancel_suspended_callers(&self, reason: WaitError) -> usize {
        let failed = self.queue.lock().fail_all(&reason);
        debug!(failed, %reason, "canceled suspended callers");
        failed
    }

    /// reject new callers and fail queued ones with `Disposed`
    pub fn dispose(&self) {
        self.queue.lock().dispose();
    }

    /// dispose, then wait until the policy reports it holds no resources
    pub async fn dispose_async(&self) -> Result<(), WaitError> {
        let wait = {
            let mut queue = self.queue.lock();
            queue.dispose();
            if queue.manager.is_ready_to_dispose() {
                return Ok(());
            }
            let source = self.pool.rent();
            let generation = source.generation();
            let wait = source.wait(generation, None, None)?;
            queue.dispose_waiters.push((source, generation));
            wait
        };
        debug!("waiting for resources to drain before dispose");
        wait.await
    }
}

pin_project! {
    #[project = AcquireStateProj]
    enum AcquireState<A> {
        Done { result: Result<(), WaitError> },
        Waiting { key: usize, #[pin] wait: Wait<()>, args: A },
        Finished,
    }
}

pin_project! {
    /// Future returned by QueuedSynchronizer::acquire
    ///
    /// dropping it before completion gives up the queue position; a grant that
    /// raced with the drop is reverted through the policy.
    pub struct Acquire<'a, M: LockManager> {
        sync: &'a QueuedSynchronizer<M>,
        #[pin]
        state: AcquireState<M::Args>,
    }

    impl<'a, M: LockManager> PinnedDrop for Acquire<'a, M> {
        fn drop(this: Pin<&mut Self>) {
            let this = this.project();
            if let AcquireStateProj::Waiting { key, wait, args } = this.state.project() {
                let mut queue = this.sync.queue.lock();
                if let Some(Ok(())) = wait.source().abandon(wait.generation()) {
                    queue.manager.revert_lock(args);
                }
                queue.forget(*key, wait.source(), wait.generation());
                queue.drain();
            }
        }
    }
}

impl<M: LockManager> Future for Acquire<'_, M> {
    type Output = Result<(), WaitError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();
        let result = match this.state.as_mut().project() {
            AcquireStateProj::Done { result } => mem::replace(result, Ok(())),
            AcquireStateProj::Waiting { key, mut wait, .. } => match wait.as_mut().poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Ok(())) => Ok(()),
                Poll::Ready(Err(err)) => {
                    let mut queue = this.sync.queue.lock();
                    queue.forget(*key, wait.source(), wait.generation());
                    queue.drain();
                    Err(err)
                }
            },
            AcquireStateProj::Finished => panic!("Acquire polled after completion"),
        };
        this.state.set(AcquireState::Finished);
        Poll::Ready(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// admits while fewer than `limit` permits are held
    struct Permits {
        held: usize,
        limit: usize,
    }

    impl LockManager for Permits {
        type Args = ();

        fn is_lock_allowed(&self, _: &()) -> bool {
            self.held < self.limit
        }

        fn acquire_lock(&mut self, _: &()) {
            self.held += 1;
        }

        fn revert_lock(&mut self, _: &()) {
            self.held -= 1;
        }

        fn is_ready_to_dispose(&self) -> bool {
            self.held == 0
        }
    }

    fn permits(limit: usize) -> QueuedSynchronizer<Permits> {
        QueuedSynchronizer::new(Permits { held: 0, limit })
    }

    #[tokio::test]
    async fn fast_path_when_queue_empty() {
        let sync = permits(2);
        sync.acquire((), None, None).await.unwrap();
        sync.acquire((), None, None).await.unwrap();
        assert_eq!(sync.inspect(|m| m.held), 2);
        assert_eq!(sync.queue_len(), 0);
    }

    #[tokio::test]
    async fn zero_timeout_does_not_enqueue() {
        let sync = permits(0);
        let result = sync.acquire((), Some(Duration::ZERO), None).await;
        assert!(matches!(result, Err(WaitError::Timeout)));
        assert_eq!(sync.queue_len(), 0);
    }

    #[tokio::test]
    async fn queued_caller_is_granted_on_release() {
        let sync = permits(1);
        sync.acquire((), None, None).await.unwrap();
        let first = sync.acquire((), None, None);

        sync.release_with(|m| m.limit = 3);
        assert_eq!(sync.inspect(|m| m.held), 2);
        first.await.unwrap();
        assert!(sync.try_acquire(&()).unwrap());
    }

    #[tokio::test]
    async fn dropped_waiter_leaves_queue() {
        let sync = permits(0);
        let waiter = sync.acquire((), None, None);
        assert_eq!(sync.queue_len(), 1);
        drop(waiter);
        assert_eq!(sync.queue_len(), 0);
    }

    #[tokio::test]
    async fn unobserved_grant_is_reverted() {
        let sync = permits(0);
        let waiter = sync.acquire((), None, None);
        sync.release_with(|m| m.limit = 1);
        assert_eq!(sync.inspect(|m| m.held), 1);

        drop(waiter);
        assert_eq!(sync.inspect(|m| m.held), 0);
    }

    #[tokio::test]
    async fn dispose_fails_waiters_and_rejects_new_ones() {
        let sync = permits(0);
        let waiter = sync.acquire((), None, None);
        sync.dispose();

        assert!(matches!(waiter.await, Err(WaitError::Disposed)));
        assert!(matches!(
            sync.acquire((), None, None).await,
            Err(WaitError::Disposed)
        ));
        assert!(matches!(sync.try_acquire(&()), Err(WaitError::Disposed)));
    }

    #[tokio::test]
    async fn dispose_async_waits_for_release() {
        let sync = Arc::new(permits(1));
        sync.acquire((), None, None).await.unwrap();

        let disposer = {
            let sync = Arc::clone(&sync);
            tokio::spawn(async move { sync.dispose_async().await })
        };
        tokio::task::yield_now().await;
        assert!(!disposer.is_finished());

        sync.release_with(|m| m.held -= 1);
        disposer.await.unwrap().unwrap();
    }
}
