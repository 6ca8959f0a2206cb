//! # raft-storage
//!
//! why: raft state must survive crashes, and replicas must be able to drop history they no longer need
//! relations: built on raft-core types and raft-sync locks, driven by raft-cluster
//! what: PersistentLog with partitioned entries, fixed-layout node state, snapshots and compaction

mod entry;
mod error;
mod log;
mod options;
mod partition;
mod snapshot;
mod state;

pub use entry::StoredEntry;
pub use error::{Result, StorageError};
pub use log::PersistentLog;
pub use options::{LogOptions, StateBackingKind, MAX_COMPACTION_COUNT};
pub use partition::{EntryMetadata, SegmentReader};
pub use snapshot::SnapshotBuilder;
pub use state::{MappedState, MemoryState, NodeState, NodeStateMirror, PositionedState, StateBacking, STATE_CAPACITY};
