//! # snapshot
//!
//! why: compacted history is replaced by a single state image
//! relations: written by log.rs during compaction and install, read back on open
//! what: SnapshotBuilder trait, snapshot file format with atomic replace

use crate::error::{Result, StorageError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use raft_core::LogEntry;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

const HEADER_SIZE: usize = 32;

/// Folds committed entries into a state image
///
/// implemented by the application state machine; the log drives it during
/// compaction and restores it from the stored snapshot on open.
pub trait SnapshotBuilder: Send + Sync {
    /// reset to the state captured by `snapshot`
    fn restore(&mut self, snapshot: &LogEntry);

    fn apply(&mut self, entry: &LogEntry);

    fn build(&self) -> Bytes;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct SnapshotMeta {
    pub term: i64,
    pub index: i64,
    pub timestamp: i64,
    pub command_id: Option<i32>,
}

fn encode_header(meta: &SnapshotMeta, buf: &mut BytesMut) {
    buf.put_i64_le(meta.term);
    buf.put_i64_le(meta.index);
    buf.put_i64_le(meta.timestamp);
    buf.put_u8(u8::from(meta.command_id.is_some()));
    buf.put_bytes(0, 3);
    buf.put_i32_le(meta.command_id.unwrap_or_default());
}

/// replace the snapshot at `path` with `entry`
///
/// written to a temporary file and renamed so a crash leaves either the old or
/// the new snapshot.
pub(crate) fn write(path: &Path, entry: &LogEntry) -> io::Result<SnapshotMeta> {
    let meta = SnapshotMeta {
        term: entry.term,
        index: entry.real_index(),
        timestamp: entry.timestamp,
        command_id: entry.command_id,
    };
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + entry.command.len());
    encode_header(&meta, &mut buf);
    buf.put_slice(&entry.command);

    let temp_path = path.with_extension("tmp");
    let mut file = File::create(&temp_path)?;
    file.write_all(&buf)?;
    file.sync_all()?;
    fs::rename(&temp_path, path)?;
    Ok(meta)
}

/// load the snapshot at `path` as a negative-index entry
pub(crate) fn read(path: &Path) -> Result<Option<LogEntry>> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    if raw.len() < HEADER_SIZE {
        return Err(StorageError::Corrupted(format!(
            "snapshot header holds {} bytes",
            raw.len()
        )));
    }
    let mut raw = Bytes::from(raw);
    let term = raw.get_i64_le();
    let index = raw.get_i64_le();
    let timestamp = raw.get_i64_le();
    let has_command_id = raw.get_u8() != 0;
    raw.advance(3);
    let command_id = raw.get_i32_le();
    if index < 0 || term < 0 {
        return Err(StorageError::Corrupted(format!(
            "snapshot header has index {index} term {term}"
        )));
    }
    Ok(Some(LogEntry {
        term,
        index: -index,
        command_id: has_command_id.then_some(command_id),
        timestamp,
        command: raw,
    }))
}

pub(crate) fn meta_of(entry: &LogEntry) -> SnapshotMeta {
    SnapshotMeta {
        term: entry.term,
        index: entry.real_index(),
        timestamp: entry.timestamp,
        command_id: entry.command_id,
    }
}
