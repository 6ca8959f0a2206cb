//! # error
//!
//! why: callers must tell contract violations apart from transient waits and io faults
//! relations: returned by every PersistentLog operation
//! what: StorageError, Result alias

use raft_sync::WaitError;
use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid append index {actual}, expected {expected}")]
    InvalidAppendIndex { expected: i64, actual: i64 },

    /// the entry was folded into a snapshot; consult read_snapshot instead
    #[error("entry {index} is covered by the snapshot at {snapshot_index}")]
    SnapshotDetected { index: i64, snapshot_index: i64 },

    #[error("entry {index} is beyond the last index {last_index}")]
    MissingEntry { index: i64, last_index: i64 },

    #[error("entry {index} is committed (commit index {commit_index})")]
    CommittedEntry { index: i64, commit_index: i64 },

    #[error("term cannot move backwards from {current} to {requested}")]
    TermRegression { current: i64, requested: i64 },

    #[error("buffer too small: need {needed} bytes, got {actual}")]
    BufferTooSmall { needed: usize, actual: usize },

    #[error("compaction requires a snapshot builder")]
    NoSnapshotBuilder,

    #[error("corrupted log data: {0}")]
    Corrupted(String),

    #[error("invalid log options: {0}")]
    InvalidOptions(String),

    #[error(transparent)]
    Wait(#[from] WaitError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl StorageError {
    pub fn is_disposed(&self) -> bool {
        matches!(self, Self::Wait(WaitError::Disposed))
    }
}

impl From<raft_core::Error> for StorageError {
    fn from(err: raft_core::Error) -> Self {
        match err {
            raft_core::Error::BufferTooSmall { needed, actual } => Self::BufferTooSmall { needed, actual },
            other => Self::Corrupted(other.to_string()),
        }
    }
}
