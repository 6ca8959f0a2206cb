//! # lock
//!
//! why: mutual exclusion across await points with fifo fairness
//! relations: built on synchronizer.rs; serializes exchanges on a transport connection
//! what: AsyncExclusiveLock and its guard

use crate::{LockManager, QueuedSynchronizer, WaitError};
use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct Exclusive {
    held: bool,
}

impl LockManager for Exclusive {
    type Args = ();

    fn is_lock_allowed(&self, _: &()) -> bool {
        !self.held
    }

    fn acquire_lock(&mut self, _: &()) {
        self.held = true;
    }

    fn revert_lock(&mut self, _: &()) {
        self.held = false;
    }

    fn is_ready_to_dispose(&self) -> bool {
        !self.held
    }
}

/// Asynchronous mutex that owns its data
pub struct AsyncExclusiveLock<T> {
    sync: QueuedSynchronizer<Exclusive>,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is only handed out through a guard, and the
// synchronizer admits at most one guard at a time.
unsafe impl<T: Send> Send for AsyncExclusiveLock<T> {}
unsafe impl<T: Send> Sync for AsyncExclusiveLock<T> {}

impl<T> AsyncExclusiveLock<T> {
    pub fn new(data: T) -> Self {
        Self {
            sync: QueuedSynchronizer::new(Exclusive { held: false }),
            data: UnsafeCell::new(data),
        }
    }

    pub async fn lock(&self) -> Result<ExclusiveGuard<'_, T>, WaitError> {
        self.lock_with(None, None).await
    }

    pub async fn lock_with(
        &self,
        timeout: Option<Duration>,
        cancellation: Option<CancellationToken>,
    ) -> Result<ExclusiveGuard<'_, T>, WaitError> {
        self.sync.acquire((), timeout, cancellation).await?;
        Ok(ExclusiveGuard::new(self))
    }

    pub fn try_lock(&self) -> Option<ExclusiveGuard<'_, T>> {
        match self.sync.try_acquire(&()) {
            Ok(true) => Some(ExclusiveGuard::new(self)),
            _ => None,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.sync.inspect(|m| m.held)
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    pub fn cancel_suspended_callers(&self, reason: WaitError) -> usize {
        self.sync.cancel_suspended_callers(reason)
    }

    pub fn dispose(&self) {
        self.sync.dispose();
    }

    /// dispose and wait for the current holder to release
    pub async fn dispose_async(&self) -> Result<(), WaitError> {
        self.sync.dispose_async().await
    }
}

pub struct ExclusiveGuard<'a, T> {
    lock: &'a AsyncExclusiveLock<T>,
    _marker: PhantomData<*const ()>,
}

// SAFETY: the guard grants unique access, so moving it needs T: Send and
// sharing it needs T: Sync, as for std::sync::MutexGuard.
unsafe impl<T: Send> Send for ExclusiveGuard<'_, T> {}
unsafe impl<T: Sync> Sync for ExclusiveGuard<'_, T> {}

impl<'a, T> ExclusiveGuard<'a, T> {
    fn new(lock: &'a AsyncExclusiveLock<T>) -> Self {
        Self {
            lock,
            _marker: PhantomData,
        }
    }
}

impl<T> Deref for ExclusiveGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves exclusive admission
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for ExclusiveGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves exclusive admission
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for ExclusiveGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.sync.release_with(|m| m.held = false);
    }
}
