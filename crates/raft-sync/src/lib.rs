//! # raft-sync
//!
//! why: suspend and resume callers in strict arrival order without a heap allocation per wait
//! relations: used by raft-storage for its io lock and commit gate, raft-transport for exchange replies
//! what: CompletionSource, QueuedSynchronizer, exclusive lock, reader/writer lock, index gate

pub mod completion;
pub mod error;
pub mod gate;
pub mod lock;
pub mod rwlock;
pub mod synchronizer;

pub use completion::{CompletionPool, CompletionSource, Wait};
pub use error::WaitError;
pub use gate::IndexGate;
pub use lock::{AsyncExclusiveLock, ExclusiveGuard};
pub use rwlock::{AsyncReaderWriterLock, ReadGuard, WriteGuard};
pub use synchronizer::{Acquire, LockManager, QueuedSynchronizer};
