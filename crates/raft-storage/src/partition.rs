//! # partition
//!
//! why: keep the log append-only on disk while allowing whole prefixes to be dropped cheaply
//! relations: owned by log.rs; payload reads go through SegmentReader
//! what: EntryMetadata record, Partition (metadata + data file pair), SegmentReader

use crate::error::{Result, StorageError};
use bytes::{Buf, BufMut};
use parking_lot::{Mutex, MutexGuard};
use raft_core::LogEntry;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// fixed-size description of one entry, stored apart from its payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EntryMetadata {
    pub term: i64,
    /// byte position of the payload in the partition data file
    pub offset: i64,
    pub length: i64,
    pub timestamp: i64,
    pub command_id: Option<i32>,
}

impl EntryMetadata {
    pub const SIZE: usize = 40;

    pub fn encode(&self, mut buf: impl BufMut) {
        buf.put_i64_le(self.term);
        buf.put_i64_le(self.offset);
        buf.put_i64_le(self.length);
        buf.put_i64_le(self.timestamp);
        buf.put_u8(u8::from(self.command_id.is_some()));
        buf.put_bytes(0, 3);
        buf.put_i32_le(self.command_id.unwrap_or_default());
    }

    pub fn decode(mut buf: impl Buf) -> Result<Self> {
        if buf.remaining() < Self::SIZE {
            return Err(StorageError::BufferTooSmall {
                needed: Self::SIZE,
                actual: buf.remaining(),
            });
        }
        let term = buf.get_i64_le();
        let offset = buf.get_i64_le();
        let length = buf.get_i64_le();
        let timestamp = buf.get_i64_le();
        let has_command_id = buf.get_u8() != 0;
        buf.advance(3);
        let command_id = buf.get_i32_le();
        Ok(Self {
            term,
            offset,
            length,
            timestamp,
            command_id: has_command_id.then_some(command_id),
        })
    }
}

/// buffered reader shared by every read of one partition
///
/// it keeps a window of the data file and only seeks when a request falls
/// outside of it.
pub struct SegmentReader {
    file: File,
    window: Vec<u8>,
    window_start: u64,
    window_len: usize,
    repositions: u64,
}

impl SegmentReader {
    const WINDOW: usize = 64 * 1024;

    fn new(file: File) -> Self {
        Self {
            file,
            window: vec![0u8; Self::WINDOW],
            window_start: 0,
            window_len: 0,
            repositions: 0,
        }
    }

    fn covers(&self, offset: u64, len: usize) -> bool {
        offset >= self.window_start
            && offset + len as u64 <= self.window_start + self.window_len as u64
    }

    pub fn read_exact_at(&mut self, offset: u64, dst: &mut [u8]) -> io::Result<()> {
        if !self.covers(offset, dst.len()) {
            self.repositions += 1;
            self.file.seek(SeekFrom::Start(offset))?;
            if dst.len() > self.window.len() {
                self.window_len = 0;
                return self.file.read_exact(dst);
            }
            let mut filled = 0;
            while filled < self.window.len() {
                match self.file.read(&mut self.window[filled..])? {
                    0 => break,
                    n => filled += n,
                }
            }
            self.window_start = offset;
            self.window_len = filled;
            if filled < dst.len() {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("payload at {offset} is truncated"),
                ));
            }
        }
        let start = (offset - self.window_start) as usize;
        dst.copy_from_slice(&self.window[start..start + dst.len()]);
        Ok(())
    }

    /// number of times the reader had to seek
    pub fn repositions(&self) -> u64 {
        self.repositions
    }

    fn invalidate(&mut self) {
        self.window_len = 0;
    }
}

/// one fixed range of log indices: `{n}.meta` holds metadata slots, `{n}.data` payloads
pub(crate) struct Partition {
    number: i64,
    range_start: i64,
    records: i64,
    metadata: Vec<EntryMetadata>,
    meta_path: PathBuf,
    data_path: PathBuf,
    meta_file: File,
    data_file: File,
    data_len: u64,
    reader: Mutex<SegmentReader>,
}

impl Partition {
    pub(crate) fn number_of(index: i64, records: i64) -> i64 {
        (index - 1) / records
    }

    /// open or create partition `number`, loading its metadata
    pub(crate) fn open(dir: &Path, number: i64, records: i64) -> Result<Self> {
        let meta_path = dir.join(format!("{number}.meta"));
        let data_path = dir.join(format!("{number}.data"));
        let mut meta_file = open_rw(&meta_path)?;
        let data_file = open_rw(&data_path)?;

        let mut raw = Vec::new();
        meta_file.read_to_end(&mut raw)?;
        let whole = raw.len() / EntryMetadata::SIZE;
        if raw.len() % EntryMetadata::SIZE != 0 {
            tracing::warn!(partition = number, "discarding partial metadata record");
            meta_file.set_len((whole * EntryMetadata::SIZE) as u64)?;
        }
        let metadata = raw
            .chunks_exact(EntryMetadata::SIZE)
            .take(records as usize)
            .map(EntryMetadata::decode)
            .collect::<Result<Vec<_>>>()?;

        let data_len = data_file.metadata()?.len();
        let reader = Mutex::new(SegmentReader::new(File::open(&data_path)?));
        Ok(Self {
            number,
            range_start: number * records + 1,
            records,
            metadata,
            meta_path,
            data_path,
            meta_file,
            data_file,
            data_len,
            reader,
        })
    }

    pub(crate) fn number(&self) -> i64 {
        self.number
    }

    pub(crate) fn range_end(&self) -> i64 {
        self.range_start + self.records - 1
    }

    /// highest index with a metadata slot, range_start - 1 when empty
    pub(crate) fn last_index(&self) -> i64 {
        self.range_start + self.metadata.len() as i64 - 1
    }

    pub(crate) fn metadata(&self, index: i64) -> Option<&EntryMetadata> {
        let slot = index.checked_sub(self.range_start)?;
        self.metadata.get(usize::try_from(slot).ok()?)
    }

    /// bytes written to the data file
    pub(crate) fn data_len(&self) -> u64 {
        self.data_len
    }

    pub(crate) fn reader(&self) -> MutexGuard<'_, SegmentReader> {
        self.reader.lock()
    }

    pub(crate) fn append(&mut self, entry: &LogEntry) -> Result<EntryMetadata> {
        let slot = entry.index - self.range_start;
        if slot < 0 || slot >= self.records {
            return Err(StorageError::Corrupted(format!(
                "entry {} does not belong to partition {}",
                entry.index, self.number
            )));
        }
        // slots written by an append whose counter update failed
        if self.metadata.len() as i64 > slot {
            self.truncate_from(entry.index)?;
        }
        // slots skipped after a snapshot install are left empty
        while (self.metadata.len() as i64) < slot {
            self.write_metadata(EntryMetadata::default())?;
        }

        self.data_file.seek(SeekFrom::Start(self.data_len))?;
        self.data_file.write_all(&entry.command)?;
        let metadata = EntryMetadata {
            term: entry.term,
            offset: self.data_len as i64,
            length: entry.command.len() as i64,
            timestamp: entry.timestamp,
            command_id: entry.command_id,
        };
        self.data_len += entry.command.len() as u64;
        self.write_metadata(metadata)?;
        Ok(metadata)
    }

    fn write_metadata(&mut self, metadata: EntryMetadata) -> io::Result<()> {
        let mut record = [0u8; EntryMetadata::SIZE];
        metadata.encode(&mut record[..]);
        let position = (self.metadata.len() * EntryMetadata::SIZE) as u64;
        self.meta_file.seek(SeekFrom::Start(position))?;
        self.meta_file.write_all(&record)?;
        self.metadata.push(metadata);
        Ok(())
    }

    /// drop every slot at or above `index`
    pub(crate) fn truncate_from(&mut self, index: i64) -> io::Result<()> {
        let keep = (index - self.range_start).clamp(0, self.metadata.len() as i64) as usize;
        self.metadata.truncate(keep);
        self.meta_file.set_len((keep * EntryMetadata::SIZE) as u64)?;
        // empty slots sort before any payload, so the last slot marks the end of data
        self.data_len = self
            .metadata
            .last()
            .map(|m| (m.offset + m.length) as u64)
            .unwrap_or(0);
        self.data_file.set_len(self.data_len)?;
        self.reader.lock().invalidate();
        Ok(())
    }

    pub(crate) fn flush(&mut self) -> io::Result<()> {
        self.data_file.sync_data()?;
        self.meta_file.sync_data()
    }

    pub(crate) fn delete(self) -> io::Result<()> {
        let Self {
            meta_path,
            data_path,
            meta_file,
            data_file,
            reader,
            ..
        } = self;
        drop((meta_file, data_file, reader));
        fs::remove_file(meta_path)?;
        fs::remove_file(data_path)
    }
}

fn open_rw(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

/// partition numbers present in `dir`, from `{n}.meta` file names
pub(crate) fn scan(dir: &Path) -> io::Result<Vec<i64>> {
    let mut numbers = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("meta") {
            continue;
        }
        if let Some(number) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<i64>().ok())
        {
            numbers.push(number);
        }
    }
    numbers.sort_unstable();
    Ok(numbers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(index: i64, payload: &[u8]) -> LogEntry {
        LogEntry::new(1, index, payload.to_vec())
    }

    #[test]
    fn metadata_record_is_40_bytes() {
        let metadata = EntryMetadata {
            term: 2,
            offset: 100,
            length: 5,
            timestamp: 77,
            command_id: Some(-3),
        };
        let mut buf = Vec::new();
        metadata.encode(&mut buf);
        assert_eq!(buf.len(), EntryMetadata::SIZE);
        assert_eq!(EntryMetadata::decode(&buf[..]).unwrap(), metadata);
    }

    #[test]
    fn partition_numbers() {
        assert_eq!(Partition::number_of(1, 4), 0);
        assert_eq!(Partition::number_of(4, 4), 0);
        assert_eq!(Partition::number_of(5, 4), 1);
    }

    #[test]
    fn append_then_reopen() {
        let dir = tempdir().unwrap();
        {
            let mut partition = Partition::open(dir.path(), 0, 4).unwrap();
            partition.append(&entry(1, b"one")).unwrap();
            partition.append(&entry(2, b"two")).unwrap();
        }
        let partition = Partition::open(dir.path(), 0, 4).unwrap();
        assert_eq!(partition.last_index(), 2);
        let metadata = *partition.metadata(2).unwrap();
        assert_eq!(metadata.offset, 3);
        let mut buf = vec![0u8; metadata.length as usize];
        partition
            .reader()
            .read_exact_at(metadata.offset as u64, &mut buf)
            .unwrap();
        assert_eq!(buf, b"two");
    }

    #[test]
    fn reader_reuses_window() {
        let dir = tempdir().unwrap();
        let mut partition = Partition::open(dir.path(), 0, 8).unwrap();
        for index in 1..=4 {
            partition.append(&entry(index, b"abcd")).unwrap();
        }
        let mut reader = partition.reader();
        let mut buf = [0u8; 4];
        for offset in [0, 4, 8, 12] {
            reader.read_exact_at(offset, &mut buf).unwrap();
        }
        assert_eq!(reader.repositions(), 1);
    }

    #[test]
    fn truncate_drops_tail() {
        let dir = tempdir().unwrap();
        let mut partition = Partition::open(dir.path(), 0, 8).unwrap();
        for index in 1..=3 {
            partition.append(&entry(index, b"xy")).unwrap();
        }
        partition.truncate_from(2).unwrap();
        assert_eq!(partition.last_index(), 1);
        partition.append(&entry(2, b"zz")).unwrap();
        assert_eq!(partition.metadata(2).unwrap().offset, 2);
    }

    #[test]
    fn rewriting_a_slot_replaces_the_stale_record() {
        let dir = tempdir().unwrap();
        let mut partition = Partition::open(dir.path(), 0, 8).unwrap();
        partition.append(&entry(1, b"a")).unwrap();
        partition.append(&entry(2, b"stale")).unwrap();

        let fresh = LogEntry::new(2, 2, b"new".to_vec());
        let metadata = partition.append(&fresh).unwrap();
        assert_eq!(partition.last_index(), 2);
        assert_eq!(*partition.metadata(2).unwrap(), metadata);
        assert_eq!(metadata.term, 2);
        assert_eq!(metadata.offset, 1);
        assert_eq!(partition.data_len(), 4);
        drop(partition);

        let partition = Partition::open(dir.path(), 0, 8).unwrap();
        assert_eq!(partition.last_index(), 2);
        assert_eq!(partition.metadata(2).unwrap().term, 2);
    }

    #[test]
    fn scan_finds_partitions() {
        let dir = tempdir().unwrap();
        Partition::open(dir.path(), 3, 4).unwrap();
        Partition::open(dir.path(), 1, 4).unwrap();
        assert_eq!(scan(dir.path()).unwrap(), vec![1, 3]);
    }
}
