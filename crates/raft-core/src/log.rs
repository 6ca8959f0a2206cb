//! # log
//!
//! why: the unit of replication shared by storage, transport and consensus
//! relations: persisted by raft-storage, carried by AppendEntries and InstallSnapshot
//! what: LogEntry struct, snapshot encoding via negative index

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A single entry in the replicated log
///
/// a negative `index` marks a snapshot that subsumes every entry up to `|index|`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when this entry was created
    pub term: i64,
    /// The index of this entry in the log (1-indexed, negative for snapshots)
    pub index: i64,
    /// Optional application-level identifier of the command
    pub command_id: Option<i32>,
    /// Creation time in milliseconds since the unix epoch
    pub timestamp: i64,
    /// The command to be applied to the state machine
    pub command: Bytes,
}

impl LogEntry {
    /// Create a new log entry stamped with the current time
    pub fn new(term: i64, index: i64, command: impl Into<Bytes>) -> Self {
        Self {
            term,
            index,
            command_id: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
            command: command.into(),
        }
    }

    /// Create a snapshot entry subsuming everything up to `index`
    pub fn snapshot(term: i64, index: i64, state: impl Into<Bytes>) -> Self {
        Self::new(term, -index.saturating_abs(), state)
    }

    pub fn with_command_id(mut self, id: i32) -> Self {
        self.command_id = Some(id);
        self
    }

    pub fn is_snapshot(&self) -> bool {
        self.index < 0
    }

    /// the log position this entry occupies, regardless of snapshot encoding
    pub fn real_index(&self) -> i64 {
        self.index.saturating_abs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regular_entry_is_not_snapshot() {
        let entry = LogEntry::new(1, 5, b"cmd".to_vec());
        assert!(!entry.is_snapshot());
        assert_eq!(entry.real_index(), 5);
    }

    #[test]
    fn snapshot_uses_negative_index() {
        let snap = LogEntry::snapshot(3, 42, Bytes::from_static(b"state"));
        assert!(snap.is_snapshot());
        assert_eq!(snap.index, -42);
        assert_eq!(snap.real_index(), 42);
    }

    #[test]
    fn command_id_is_optional() {
        let entry = LogEntry::new(1, 1, Bytes::new()).with_command_id(7);
        assert_eq!(entry.command_id, Some(7));
    }
}
