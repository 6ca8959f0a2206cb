//! # options
//!
//! why: the log's layout and durability knobs are chosen by the host process
//! relations: consumed by PersistentLog::open, embedded in raft-cluster's ClusterConfig
//! what: LogOptions, StateBackingKind

use crate::error::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// upper bound for partitions compacted after a single commit
pub const MAX_COMPACTION_COUNT: usize = 16;

const MAX_RECORDS_PER_PARTITION: i64 = 1 << 20;

/// how the node state record reaches the disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StateBackingKind {
    /// memory-mapped file
    #[default]
    Mapped,
    /// seek + write on a regular file
    Positioned,
    /// nothing is persisted, for tests
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogOptions {
    /// directory holding node.state, partitions/ and the snapshot
    pub location: PathBuf,
    pub records_per_partition: i64,
    /// partitions folded into the snapshot after each commit, 0 disables
    pub compaction_count: usize,
    /// recently appended payloads kept in memory until committed
    pub max_cached_entries: usize,
    /// sync data and state before append returns
    pub flush_on_append: bool,
    pub state_backing: StateBackingKind,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            location: PathBuf::from("raft-log"),
            records_per_partition: 1024,
            compaction_count: 1,
            max_cached_entries: 1024,
            flush_on_append: true,
            state_backing: StateBackingKind::Mapped,
        }
    }
}

impl LogOptions {
    pub fn new(location: impl Into<PathBuf>) -> Self {
        Self {
            location: location.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.location.as_os_str().is_empty() {
            return Err(StorageError::InvalidOptions("location is empty".into()));
        }
        if !(1..=MAX_RECORDS_PER_PARTITION).contains(&self.records_per_partition) {
            return Err(StorageError::InvalidOptions(format!(
                "records_per_partition must be within 1..={MAX_RECORDS_PER_PARTITION}, got {}",
                self.records_per_partition
            )));
        }
        if self.compaction_count > MAX_COMPACTION_COUNT {
            return Err(StorageError::InvalidOptions(format!(
                "compaction_count must be at most {MAX_COMPACTION_COUNT}, got {}",
                self.compaction_count
            )));
        }
        Ok(())
    }
}
