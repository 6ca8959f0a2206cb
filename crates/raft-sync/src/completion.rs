//! # completion
//!
//! why: a reusable one-shot result slot that many suspension points can share
//! relations: rented by synchronizer.rs for wait nodes, owned by transport client exchanges
//! what: CompletionSource (generation-guarded slot), Wait future, CompletionPool
//!
//! Each use of a source is identified by its generation. Completion, waiting and
//! abandoning all compare the caller's generation against the current one under
//! the source's private lock, so a completion racing a reset can never leak into
//! the next use.

use crate::WaitError;
use parking_lot::Mutex;
use pin_project_lite::pin_project;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Waker};
use std::time::Duration;
use tokio::time::{Instant, Sleep};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

enum Slot<T> {
    Pending,
    Completed(Result<T, WaitError>),
    Consumed,
}

struct State<T> {
    generation: u64,
    slot: Slot<T>,
    waker: Option<Waker>,
    attached: bool,
    /// timer kept from the previous wait cycle
    timer: Option<Pin<Box<Sleep>>>,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    pool: Weak<CompletionPool<T>>,
}

/// Reusable asynchronous result handle
pub struct CompletionSource<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for CompletionSource<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Default for CompletionSource<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CompletionSource<T> {
    pub fn new() -> Self {
        Self::with_pool(Weak::new())
    }

    fn with_pool(pool: Weak<CompletionPool<T>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    generation: 0,
                    slot: Slot::Pending,
                    waker: None,
                    attached: false,
                    timer: None,
                }),
                pool,
            }),
        }
    }

    pub fn generation(&self) -> u64 {
        self.shared.state.lock().generation
    }

    /// true when `generation` is stale or already has an outcome
    pub fn is_completed(&self, generation: u64) -> bool {
        let state = self.shared.state.lock();
        state.generation != generation || !matches!(state.slot, Slot::Pending)
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub fn try_set_result(&self, generation: u64, value: T) -> bool {
        self.complete(generation, Ok(value))
    }

    pub fn try_set_error(&self, generation: u64, error: WaitError) -> bool {
        self.complete(generation, Err(error))
    }

    pub fn try_set_canceled(&self, generation: u64) -> bool {
        self.complete(generation, Err(WaitError::Canceled))
    }

    fn complete(&self, generation: u64, result: Result<T, WaitError>) -> bool {
        let waker = {
            let mut state = self.shared.state.lock();
            if state.generation != generation || !matches!(state.slot, Slot::Pending) {
                return false;
            }
            state.slot = Slot::Completed(result);
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        true
    }

    /// re-arm for another use; returns the new generation
    pub fn reset(&self) -> u64 {
        let mut state = self.shared.state.lock();
        Self::rearm(&mut state);
        state.generation
    }

    fn reset_if(&self, generation: u64) -> bool {
        let mut state = self.shared.state.lock();
        if state.generation != generation {
            return false;
        }
        Self::rearm(&mut state);
        true
    }

    fn rearm(state: &mut State<T>) {
        state.generation = state.generation.wrapping_add(1);
        state.slot = Slot::Pending;
        state.waker = None;
        state.attached = false;
    }

    /// attach the single waiter for `generation`
    ///
    /// a zero timeout resolves immediately with `Timeout` unless an outcome is
    /// already present.
    pub fn wait(
        &self,
        generation: u64,
        timeout: Option<Duration>,
        cancellation: Option<CancellationToken>,
    ) -> Result<Wait<T>, WaitError> {
        let mut state = self.shared.state.lock();
        if state.generation != generation || state.attached {
            return Err(WaitError::InvalidGeneration(generation));
        }
        state.attached = true;

        let mut timer = None;
        match timeout {
            Some(timeout) if timeout.is_zero() => {
                if matches!(state.slot, Slot::Pending) {
                    state.slot = Slot::Completed(Err(WaitError::Timeout));
                }
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                let mut sleep = state
                    .timer
                    .take()
                    .unwrap_or_else(|| Box::pin(tokio::time::sleep_until(deadline)));
                sleep.as_mut().reset(deadline);
                timer = Some(sleep);
            }
            None => {}
        }
        drop(state);

        Ok(Wait {
            source: self.clone(),
            generation,
            timer,
            cancellation: cancellation.map(CancellationToken::cancelled_owned),
            finished: false,
        })
    }

    /// give up on `generation`, returning an outcome nobody has observed yet
    pub fn abandon(&self, generation: u64) -> Option<Result<T, WaitError>> {
        let mut state = self.shared.state.lock();
        if state.generation != generation {
            return None;
        }
        match mem::replace(&mut state.slot, Slot::Consumed) {
            Slot::Completed(result) => Some(result),
            Slot::Pending | Slot::Consumed => None,
        }
    }

    fn poll_slot(&self, generation: u64, waker: &Waker) -> Option<Result<T, WaitError>> {
        let mut state = self.shared.state.lock();
        if state.generation != generation {
            return Some(Err(WaitError::InvalidGeneration(generation)));
        }
        match mem::replace(&mut state.slot, Slot::Consumed) {
            Slot::Completed(result) => Some(result),
            Slot::Consumed => Some(Err(WaitError::InvalidGeneration(generation))),
            Slot::Pending => {
                state.slot = Slot::Pending;
                match &state.waker {
                    Some(current) if current.will_wake(waker) => {}
                    _ => state.waker = Some(waker.clone()),
                }
                None
            }
        }
    }

    /// after-consumed hook: keep the timer and hand the source back to its pool
    fn recycle(&self, generation: u64, timer: Option<Pin<Box<Sleep>>>) {
        {
            let mut state = self.shared.state.lock();
            if state.generation == generation {
                state.waker = None;
                if timer.is_some() {
                    state.timer = timer;
                }
            }
        }
        if let Some(pool) = self.shared.pool.upgrade() {
            pool.give_back(self.clone(), generation);
        }
    }
}

pin_project! {
    /// Future resolving with the outcome of one generation of a CompletionSource
    pub struct Wait<T> {
        source: CompletionSource<T>,
        generation: u64,
        timer: Option<Pin<Box<Sleep>>>,
        #[pin]
        cancellation: Option<WaitForCancellationFutureOwned>,
        finished: bool,
    }

    impl<T> PinnedDrop for Wait<T> {
        fn drop(this: Pin<&mut Self>) {
            if !this.finished {
                this.source.abandon(this.generation);
                this.finish();
            }
        }
    }
}

impl<T> Wait<T> {
    pub fn source(&self) -> &CompletionSource<T> {
        &self.source
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn finish(self: Pin<&mut Self>) {
        let mut this = self.project();
        if !*this.finished {
            *this.finished = true;
            this.cancellation.set(None);
            this.source.recycle(*this.generation, this.timer.take());
        }
    }
}

impl<T> Future for Wait<T> {
    type Output = Result<T, WaitError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.finished {
            return Poll::Ready(Err(WaitError::InvalidGeneration(self.generation)));
        }
        loop {
            if let Some(result) = self.source.poll_slot(self.generation, cx.waker()) {
                self.as_mut().finish();
                return Poll::Ready(result);
            }
            let this = self.as_mut().project();
            let fired = if this
                .cancellation
                .as_pin_mut()
                .is_some_and(|c| c.poll(cx).is_ready())
            {
                WaitError::Canceled
            } else if this
                .timer
                .as_mut()
                .is_some_and(|t| t.as_mut().poll(cx).is_ready())
            {
                WaitError::Timeout
            } else {
                return Poll::Pending;
            };
            // loses quietly if a natural completion got there first
            this.source.complete(*this.generation, Err(fired));
        }
    }
}

/// Free list of completion sources
pub struct CompletionPool<T> {
    free: Mutex<Vec<CompletionSource<T>>>,
    capacity: usize,
    this: Weak<Self>,
}

impl<T> CompletionPool<T> {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            free: Mutex::new(Vec::new()),
            capacity,
            this: this.clone(),
        })
    }

    /// take a pending source, allocating only when the free list is empty
    pub fn rent(&self) -> CompletionSource<T> {
        self.free
            .lock()
            .pop()
            .unwrap_or_else(|| CompletionSource::with_pool(self.this.clone()))
    }

    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    fn give_back(&self, source: CompletionSource<T>, generation: u64) {
        if source.reset_if(generation) {
            let mut free = self.free.lock();
            if free.len() < self.capacity {
                free.push(source);
            }
        }
    }
}
