//! # rwlock
//!
//! why: many concurrent readers of the log, one writer at a time
//! relations: built on synchronizer.rs; guards raft-storage's log state
//! what: AsyncReaderWriterLock with read and write guards
//!
//! admission is strictly fifo, so a queued writer holds back readers that
//! arrive after it.

use crate::{LockManager, QueuedSynchronizer, WaitError};
use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Read,
    Write,
}

#[derive(Default)]
struct ReadersWriter {
    readers: usize,
    writer: bool,
}

impl LockManager for ReadersWriter {
    type Args = Access;

    fn is_lock_allowed(&self, access: &Access) -> bool {
        match access {
            Access::Read => !self.writer,
            Access::Write => !self.writer && self.readers == 0,
        }
    }

    fn acquire_lock(&mut self, access: &Access) {
        match access {
            Access::Read => self.readers += 1,
            Access::Write => self.writer = true,
        }
    }

    fn revert_lock(&mut self, access: &Access) {
        match access {
            Access::Read => self.readers -= 1,
            Access::Write => self.writer = false,
        }
    }

    fn is_ready_to_dispose(&self) -> bool {
        self.readers == 0 && !self.writer
    }
}

pub struct AsyncReaderWriterLock<T> {
    sync: QueuedSynchronizer<ReadersWriter>,
    data: UnsafeCell<T>,
}

// SAFETY: readers only get shared references, writers are admitted alone.
unsafe impl<T: Send> Send for AsyncReaderWriterLock<T> {}
unsafe impl<T: Send + Sync> Sync for AsyncReaderWriterLock<T> {}

impl<T> AsyncReaderWriterLock<T> {
    pub fn new(data: T) -> Self {
        Self {
            sync: QueuedSynchronizer::new(ReadersWriter::default()),
            data: UnsafeCell::new(data),
        }
    }

    pub async fn read(&self) -> Result<ReadGuard<'_, T>, WaitError> {
        self.read_with(None, None).await
    }

    pub async fn read_with(
        &self,
        timeout: Option<Duration>,
        cancellation: Option<CancellationToken>,
    ) -> Result<ReadGuard<'_, T>, WaitError> {
        self.sync.acquire(Access::Read, timeout, cancellation).await?;
        Ok(ReadGuard {
            lock: self,
            _marker: PhantomData,
        })
    }

    pub async fn write(&self) -> Result<WriteGuard<'_, T>, WaitError> {
        self.write_with(None, None).await
    }

    pub async fn write_with(
        &self,
        timeout: Option<Duration>,
        cancellation: Option<CancellationToken>,
    ) -> Result<WriteGuard<'_, T>, WaitError> {
        self.sync.acquire(Access::Write, timeout, cancellation).await?;
        Ok(WriteGuard {
            lock: self,
            _marker: PhantomData,
        })
    }

    pub fn try_read(&self) -> Option<ReadGuard<'_, T>> {
        matches!(self.sync.try_acquire(&Access::Read), Ok(true)).then(|| ReadGuard {
            lock: self,
            _marker: PhantomData,
        })
    }

    pub fn try_write(&self) -> Option<WriteGuard<'_, T>> {
        matches!(self.sync.try_acquire(&Access::Write), Ok(true)).then(|| WriteGuard {
            lock: self,
            _marker: PhantomData,
        })
    }

    pub fn readers(&self) -> usize {
        self.sync.inspect(|m| m.readers)
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    pub fn cancel_suspended_callers(&self, reason: WaitError) -> usize {
        self.sync.cancel_suspended_callers(reason)
    }

    pub fn dispose(&self) {
        self.sync.dispose();
    }

    /// dispose and wait until every guard has been dropped
    pub async fn dispose_async(&self) -> Result<(), WaitError> {
        self.sync.dispose_async().await
    }
}

pub struct ReadGuard<'a, T> {
    lock: &'a AsyncReaderWriterLock<T>,
    _marker: PhantomData<*const ()>,
}

// SAFETY: a read guard is a shared reference to T.
unsafe impl<T: Sync> Send for ReadGuard<'_, T> {}
unsafe impl<T: Sync> Sync for ReadGuard<'_, T> {}

impl<T> Deref for ReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: no writer is admitted while a read guard exists
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.sync.release_with(|m| m.readers -= 1);
    }
}

pub struct WriteGuard<'a, T> {
    lock: &'a AsyncReaderWriterLock<T>,
    _marker: PhantomData<*const ()>,
}

// SAFETY: a write guard is a unique reference to T.
unsafe impl<T: Send + Sync> Send for WriteGuard<'_, T> {}
unsafe impl<T: Sync> Sync for WriteGuard<'_, T> {}

impl<T> Deref for WriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the write guard is the only admitted accessor
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the write guard is the only admitted accessor
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for WriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.sync.release_with(|m| m.writer = false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn readers_share() {
        let lock = AsyncReaderWriterLock::new(5);
        let a = lock.read().await.unwrap();
        let b = lock.read().await.unwrap();
        assert_eq!(*a + *b, 10);
        assert_eq!(lock.readers(), 2);
        assert!(lock.try_write().is_none());
    }

    #[tokio::test]
    async fn writer_excludes_readers() {
        let lock = AsyncReaderWriterLock::new(0);
        let mut writer = lock.write().await.unwrap();
        *writer = 3;
        assert!(lock.try_read().is_none());
        drop(writer);
        assert_eq!(*lock.read().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn queued_writer_blocks_later_readers() {
        let lock = AsyncReaderWriterLock::new(());
        let reader = lock.read().await.unwrap();
        let writer = lock.write();
        tokio::pin!(writer);
        assert!(futures::poll!(&mut writer).is_pending());

        // policy alone would admit another reader, the queued writer comes first
        assert!(lock.try_read().is_none());

        drop(reader);
        let _writer = writer.await.unwrap();
        assert_eq!(lock.readers(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn guards_are_held_across_spawned_awaits() {
        let lock = std::sync::Arc::new(AsyncReaderWriterLock::new(0u64));
        let mut tasks = Vec::new();
        for id in 0..8u64 {
            let lock = std::sync::Arc::clone(&lock);
            tasks.push(tokio::spawn(async move {
                if id % 2 == 0 {
                    let mut guard = lock.write().await.unwrap();
                    let value = *guard;
                    tokio::task::yield_now().await;
                    *guard = value + 1;
                } else {
                    let guard = lock.read().await.unwrap();
                    tokio::task::yield_now().await;
                    assert!(*guard <= 4);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(*lock.read().await.unwrap(), 4);
    }
}
