//! # entry
//!
//! why: reading an entry should not copy its payload until the caller asks for it
//! relations: produced by log.rs reads, borrows a partition's SegmentReader
//! what: StoredEntry view over a cached buffer or the partition data file

use crate::error::{Result, StorageError};
use crate::partition::{EntryMetadata, SegmentReader};
use bytes::{Bytes, BytesMut};
use parking_lot::MutexGuard;
use raft_core::LogEntry;

enum Payload<'r> {
    Buffered(Bytes),
    /// holds the partition reader for as long as the view lives
    File(MutexGuard<'r, SegmentReader>),
}

/// transient view of one log entry
///
/// a file-backed view locks its partition's shared reader, so it cannot be
/// kept across an `.await` and must be dropped before reading the next entry
/// of the same partition.
pub struct StoredEntry<'r> {
    index: i64,
    metadata: EntryMetadata,
    payload: Payload<'r>,
}

impl<'r> StoredEntry<'r> {
    pub(crate) fn buffered(index: i64, metadata: EntryMetadata, bytes: Bytes) -> Self {
        Self {
            index,
            metadata,
            payload: Payload::Buffered(bytes),
        }
    }

    pub(crate) fn file(index: i64, metadata: EntryMetadata, reader: MutexGuard<'r, SegmentReader>) -> Self {
        Self {
            index,
            metadata,
            payload: Payload::File(reader),
        }
    }

    pub fn index(&self) -> i64 {
        self.index
    }

    pub fn term(&self) -> i64 {
        self.metadata.term
    }

    pub fn timestamp(&self) -> i64 {
        self.metadata.timestamp
    }

    pub fn command_id(&self) -> Option<i32> {
        self.metadata.command_id
    }

    pub fn len(&self) -> usize {
        self.metadata.length as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// true when served from memory rather than the data file
    pub fn is_buffered(&self) -> bool {
        matches!(self.payload, Payload::Buffered(_))
    }

    /// copy the payload into the front of `dst`
    pub fn read_into(&mut self, dst: &mut [u8]) -> Result<usize> {
        let len = self.len();
        let actual = dst.len();
        let dst = dst.get_mut(..len).ok_or(StorageError::BufferTooSmall { needed: len, actual })?;
        match &mut self.payload {
            Payload::Buffered(bytes) => dst.copy_from_slice(bytes),
            Payload::File(reader) => reader.read_exact_at(self.metadata.offset as u64, dst)?,
        }
        Ok(len)
    }

    pub fn payload(&mut self) -> Result<Bytes> {
        if let Payload::Buffered(bytes) = &self.payload {
            return Ok(bytes.clone());
        }
        let mut buf = BytesMut::zeroed(self.len());
        self.read_into(&mut buf)?;
        Ok(buf.freeze())
    }

    pub fn to_log_entry(&mut self) -> Result<LogEntry> {
        Ok(LogEntry {
            term: self.term(),
            index: self.index,
            command_id: self.command_id(),
            timestamp: self.timestamp(),
            command: self.payload()?,
        })
    }
}
