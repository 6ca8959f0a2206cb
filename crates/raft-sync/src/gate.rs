//! # gate
//!
//! why: let callers await a monotonically advancing index such as the commit index
//! relations: built on synchronizer.rs; used by raft-storage's wait_for_commit
//! what: IndexGate

use crate::{LockManager, QueuedSynchronizer, WaitError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct IndexWatermark {
    current: i64,
}

impl LockManager for IndexWatermark {
    type Args = i64;

    // a waiter for a far index must not hold back one that is already satisfied
    const STRICT_FIFO: bool = false;

    fn is_lock_allowed(&self, target: &i64) -> bool {
        self.current >= *target
    }

    fn acquire_lock(&mut self, _: &i64) {}

    fn revert_lock(&mut self, _: &i64) {}

    fn precedes(&self, new: &i64, queued: &i64) -> bool {
        new < queued
    }
}

/// Waiters are kept sorted by target index and released in that order
pub struct IndexGate {
    sync: QueuedSynchronizer<IndexWatermark>,
}

impl IndexGate {
    pub fn new(initial: i64) -> Self {
        Self {
            sync: QueuedSynchronizer::new(IndexWatermark { current: initial }),
        }
    }

    pub fn current(&self) -> i64 {
        self.sync.inspect(|m| m.current)
    }

    /// raise the watermark; lower values are ignored
    pub fn advance(&self, index: i64) -> bool {
        self.sync.release_with(|m| {
            let advanced = index > m.current;
            m.current = m.current.max(index);
            advanced
        })
    }

    pub async fn wait_for(
        &self,
        index: i64,
        timeout: Option<Duration>,
        cancellation: Option<CancellationToken>,
    ) -> Result<(), WaitError> {
        self.sync.acquire(index, timeout, cancellation).await
    }

    pub fn pending(&self) -> usize {
        self.sync.queue_len()
    }

    pub fn cancel_suspended_callers(&self, reason: WaitError) -> usize {
        self.sync.cancel_suspended_callers(reason)
    }

    pub fn dispose(&self) {
        self.sync.dispose();
    }
}
