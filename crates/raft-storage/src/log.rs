//! # log
//!
//! why: the consensus driver needs a durable, ordered log with term/vote persistence
//! relations: built on partition.rs, state.rs and snapshot.rs; guarded by raft-sync's AsyncReaderWriterLock
//! what: PersistentLog (append, replicate, commit, compaction, snapshot install, reads)

use crate::entry::StoredEntry;
use crate::error::{Result, StorageError};
use crate::options::LogOptions;
use crate::partition::{self, EntryMetadata, Partition};
use crate::snapshot::{self, SnapshotBuilder, SnapshotMeta};
use crate::state::{NodeStateMirror, StateFile};
use bytes::Bytes;
use raft_core::{ClusterMemberId, LogEntry};
use raft_sync::{AsyncReaderWriterLock, IndexGate};
use std::collections::btree_map::{BTreeMap, Entry};
use std::fs;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const STATE_FILE: &str = "node.state";
const PARTITIONS_DIR: &str = "partitions";
const SNAPSHOT_FILE: &str = "snapshot";

struct LogInner {
    options: LogOptions,
    partitions_dir: PathBuf,
    snapshot_path: PathBuf,
    state: StateFile,
    partitions: BTreeMap<i64, Partition>,
    /// payloads of appended but not yet committed entries
    cache: BTreeMap<i64, Bytes>,
    snapshot: Option<SnapshotMeta>,
    builder: Option<Box<dyn SnapshotBuilder>>,
}

impl LogInner {
    fn records(&self) -> i64 {
        self.options.records_per_partition
    }

    fn snapshot_index(&self) -> i64 {
        self.snapshot.map_or(0, |s| s.index)
    }

    fn last_index(&self) -> i64 {
        self.state.get().last_index
    }

    fn check_readable(&self, index: i64) -> Result<()> {
        let snapshot_index = self.snapshot_index();
        if snapshot_index > 0 && index <= snapshot_index {
            return Err(StorageError::SnapshotDetected { index, snapshot_index });
        }
        let last_index = self.last_index();
        if index < 0 || index > last_index {
            return Err(StorageError::MissingEntry { index, last_index });
        }
        Ok(())
    }

    fn metadata(&self, index: i64) -> Result<EntryMetadata> {
        self.partitions
            .get(&Partition::number_of(index, self.records()))
            .and_then(|p| p.metadata(index))
            .copied()
            .ok_or_else(|| StorageError::Corrupted(format!("no metadata for entry {index}")))
    }

    fn term_at(&self, index: i64) -> Result<i64> {
        if let Some(snapshot) = self.snapshot.filter(|s| s.index == index) {
            return Ok(snapshot.term);
        }
        self.check_readable(index)?;
        if index == 0 {
            return Ok(0);
        }
        Ok(self.metadata(index)?.term)
    }

    fn entry(&self, index: i64) -> Result<StoredEntry<'_>> {
        self.check_readable(index)?;
        if index == 0 {
            return Ok(StoredEntry::buffered(0, EntryMetadata::default(), Bytes::new()));
        }
        let partition = self
            .partitions
            .get(&Partition::number_of(index, self.records()))
            .ok_or_else(|| StorageError::Corrupted(format!("no partition holds entry {index}")))?;
        let metadata = *partition
            .metadata(index)
            .ok_or_else(|| StorageError::Corrupted(format!("no metadata for entry {index}")))?;
        let end = metadata
            .offset
            .checked_add(metadata.length)
            .filter(|_| metadata.offset >= 0 && metadata.length >= 0);
        if end.map_or(true, |end| end as u64 > partition.data_len()) {
            return Err(StorageError::Corrupted(format!(
                "entry {index} points past the data file ({} bytes at {})",
                metadata.length, metadata.offset
            )));
        }
        if let Some(bytes) = self.cache.get(&index) {
            return Ok(StoredEntry::buffered(index, metadata, bytes.clone()));
        }
        Ok(StoredEntry::file(index, metadata, partition.reader()))
    }

    fn read_owned(&self, index: i64) -> Result<LogEntry> {
        self.entry(index)?.to_log_entry()
    }

    fn append(&mut self, entry: &LogEntry, mirror: &NodeStateMirror) -> Result<()> {
        let expected = self.last_index() + 1;
        if entry.is_snapshot() || entry.index != expected {
            return Err(StorageError::InvalidAppendIndex {
                expected,
                actual: entry.index,
            });
        }
        let number = Partition::number_of(entry.index, self.records());
        let partition = match self.partitions.entry(number) {
            Entry::Occupied(slot) => slot.into_mut(),
            Entry::Vacant(slot) => slot.insert(Partition::open(
                &self.partitions_dir,
                number,
                self.options.records_per_partition,
            )?),
        };
        partition.append(entry)?;
        if self.options.flush_on_append {
            partition.flush()?;
        }
        if self.cache.len() < self.options.max_cached_entries {
            self.cache.insert(entry.index, entry.command.clone());
        }

        self.state.set_last_index(entry.index)?;
        if self.options.flush_on_append {
            self.state.flush()?;
        }
        mirror.set_last_term(entry.term);
        mirror.publish(self.state.get());
        Ok(())
    }

    /// remove every entry at or above `index`, returns how many were dropped
    fn truncate_from(&mut self, index: i64, mirror: &NodeStateMirror) -> Result<i64> {
        let state = *self.state.get();
        if index > state.last_index {
            return Ok(0);
        }
        if index <= state.commit_index {
            return Err(StorageError::CommittedEntry {
                index,
                commit_index: state.commit_index,
            });
        }
        // the counter goes first so a crash mid-way only leaves unreferenced slots
        self.state.set_last_index(index - 1)?;
        self.state.flush()?;

        let first = Partition::number_of(index, self.records());
        let doomed: Vec<i64> = self.partitions.range(first + 1..).map(|(n, _)| *n).collect();
        for number in doomed {
            if let Some(partition) = self.partitions.remove(&number) {
                partition.delete()?;
            }
        }
        if let Some(partition) = self.partitions.get_mut(&first) {
            partition.truncate_from(index)?;
        }
        drop(self.cache.split_off(&index));

        mirror.set_last_term(self.term_at(index - 1)?);
        mirror.publish(self.state.get());
        Ok(state.last_index - index + 1)
    }

    fn flush(&mut self) -> Result<()> {
        for partition in self.partitions.values_mut() {
            partition.flush()?;
        }
        self.state.flush()?;
        Ok(())
    }

    /// returns the new commit index when it moved
    fn commit(&mut self, index: i64, mirror: &NodeStateMirror) -> Result<Option<i64>> {
        let state = *self.state.get();
        let target = index.min(state.last_index);
        if target <= state.commit_index {
            return Ok(None);
        }
        if !self.options.flush_on_append {
            let first = Partition::number_of(state.commit_index + 1, self.records());
            let last = Partition::number_of(target, self.records());
            for (_, partition) in self.partitions.range_mut(first..=last) {
                partition.flush()?;
            }
        }
        self.state.set_commit_index(target)?;
        self.state.flush()?;
        mirror.publish(self.state.get());
        self.cache = self.cache.split_off(&(target + 1));
        Ok(Some(target))
    }

    /// fold whole partitions into the snapshot, at most `max_steps` of them
    fn compact(&mut self, up_to: i64, max_steps: usize, mirror: &NodeStateMirror) -> Result<usize> {
        let target = up_to.min(self.state.get().commit_index);
        if self.builder.is_none() {
            return Err(StorageError::NoSnapshotBuilder);
        }
        let records = self.records();
        let mut steps = 0;
        while steps < max_steps {
            let snapshot_index = self.snapshot_index();
            if snapshot_index >= target {
                break;
            }
            let step_end = ((snapshot_index / records + 1) * records).min(target);
            let entries = (snapshot_index + 1..=step_end)
                .map(|i| self.read_owned(i))
                .collect::<Result<Vec<_>>>()?;
            let term = self.metadata(step_end)?.term;

            let Some(builder) = self.builder.as_mut() else {
                return Err(StorageError::NoSnapshotBuilder);
            };
            for entry in &entries {
                builder.apply(entry);
            }
            let image = LogEntry::snapshot(term, step_end, builder.build());
            self.snapshot = Some(snapshot::write(&self.snapshot_path, &image)?);
            mirror.set_snapshot_index(step_end);

            let covered: Vec<i64> = self
                .partitions
                .values()
                .filter(|p| p.range_end() <= step_end)
                .map(Partition::number)
                .collect();
            for number in covered {
                if let Some(partition) = self.partitions.remove(&number) {
                    partition.delete()?;
                }
            }
            debug!(snapshot_index = step_end, term, "compacted log prefix");
            steps += 1;
        }
        Ok(steps)
    }

    fn compact_committed_partitions(&mut self, mirror: &NodeStateMirror) -> Result<usize> {
        if self.options.compaction_count == 0 || self.builder.is_none() {
            return Ok(0);
        }
        let records = self.records();
        let boundary = self.state.get().commit_index / records * records;
        self.compact(boundary, self.options.compaction_count, mirror)
    }

    fn install_snapshot(&mut self, snapshot: &LogEntry, mirror: &NodeStateMirror) -> Result<bool> {
        let index = snapshot.real_index();
        if index <= self.snapshot_index() {
            return Ok(false);
        }
        let state = *self.state.get();
        let keep_tail = index < state.last_index && self.term_at(index).ok() == Some(snapshot.term);

        let image = LogEntry {
            index: -index,
            ..snapshot.clone()
        };
        self.snapshot = Some(snapshot::write(&self.snapshot_path, &image)?);
        mirror.set_snapshot_index(index);
        if let Some(builder) = self.builder.as_mut() {
            builder.restore(&image);
        }

        let doomed: Vec<i64> = if keep_tail {
            self.partitions
                .values()
                .filter(|p| p.range_end() <= index)
                .map(Partition::number)
                .collect()
        } else {
            self.partitions.keys().copied().collect()
        };
        for number in doomed {
            if let Some(partition) = self.partitions.remove(&number) {
                partition.delete()?;
            }
        }
        if keep_tail {
            self.cache = self.cache.split_off(&(index + 1));
        } else {
            self.cache.clear();
            self.state.set_last_index(index)?;
            mirror.set_last_term(snapshot.term);
        }
        self.state.set_commit_index(state.commit_index.max(index))?;
        self.state.set_last_applied(state.last_applied.max(index))?;
        self.state.flush()?;
        mirror.publish(self.state.get());
        info!(index, term = snapshot.term, kept_tail = keep_tail, "installed snapshot");
        Ok(true)
    }
}

/// Durable Raft log
///
/// Writers are serialized by an async reader/writer lock while the node state
/// is readable without locking through [`NodeStateMirror`].
pub struct PersistentLog {
    inner: AsyncReaderWriterLock<LogInner>,
    mirror: NodeStateMirror,
    commit_gate: IndexGate,
}

impl PersistentLog {
    /// open without compaction support
    pub fn open(options: LogOptions) -> Result<Self> {
        Self::recover(options, None)
    }

    pub fn open_with_builder(options: LogOptions, builder: impl SnapshotBuilder + 'static) -> Result<Self> {
        Self::recover(options, Some(Box::new(builder)))
    }

    fn recover(options: LogOptions, mut builder: Option<Box<dyn SnapshotBuilder>>) -> Result<Self> {
        options.validate()?;
        let partitions_dir = options.location.join(PARTITIONS_DIR);
        fs::create_dir_all(&partitions_dir)?;
        let snapshot_path = options.location.join(SNAPSHOT_FILE);
        let mut state = StateFile::open(&options.location.join(STATE_FILE), options.state_backing)?;
        let records = options.records_per_partition;

        let snapshot_entry = snapshot::read(&snapshot_path)?;
        let snapshot = snapshot_entry.as_ref().map(snapshot::meta_of);
        let snapshot_index = snapshot.map_or(0, |s| s.index);
        if let (Some(builder), Some(image)) = (builder.as_mut(), snapshot_entry.as_ref()) {
            builder.restore(image);
        }

        // a crash after the snapshot rename but before the state update
        if snapshot_index > state.get().last_index {
            warn!(snapshot_index, "node state lags behind snapshot, raising counters");
            state.set_last_index(snapshot_index)?;
        }
        if snapshot_index > state.get().commit_index {
            state.set_commit_index(snapshot_index)?;
        }
        if snapshot_index > state.get().last_applied {
            state.set_last_applied(snapshot_index)?;
        }

        let mut partitions = BTreeMap::new();
        for number in partition::scan(&partitions_dir)? {
            let partition = Partition::open(&partitions_dir, number, records)?;
            if partition.range_end() <= snapshot_index {
                partition.delete()?;
                continue;
            }
            partitions.insert(number, partition);
        }

        // drop slots written after the last durable last_index update
        let last_index = state.get().last_index;
        let doomed: Vec<i64> = partitions
            .values()
            .filter(|p| p.range_end() - records + 1 > last_index)
            .map(Partition::number)
            .collect();
        for number in doomed {
            if let Some(partition) = partitions.remove(&number) {
                partition.delete()?;
            }
        }
        for partition in partitions.values_mut() {
            if partition.last_index() > last_index {
                warn!(partition = partition.number(), last_index, "discarding torn append");
                partition.truncate_from(last_index + 1)?;
            }
        }

        // entries the counter promises but the files lost
        let stored_last = partitions
            .values()
            .next_back()
            .map_or(snapshot_index, Partition::last_index)
            .max(snapshot_index);
        if stored_last < last_index {
            warn!(stored_last, last_index, "log files are shorter than node state");
            let commit = state.get().commit_index;
            if commit > stored_last {
                return Err(StorageError::Corrupted(format!(
                    "committed entries {}..={commit} are missing",
                    stored_last + 1
                )));
            }
            state.set_last_index(stored_last)?;
        }
        state.flush()?;

        let inner = LogInner {
            options,
            partitions_dir,
            snapshot_path,
            state,
            partitions,
            cache: BTreeMap::new(),
            snapshot,
            builder,
        };
        let mirror = NodeStateMirror::default();
        mirror.set_snapshot_index(snapshot_index);
        mirror.set_last_term(inner.term_at(inner.last_index())?);
        mirror.publish(inner.state.get());
        let commit_index = inner.state.get().commit_index;
        info!(
            location = %inner.options.location.display(),
            last_index = inner.last_index(),
            commit_index,
            snapshot_index,
            "opened persistent log"
        );

        Ok(Self {
            inner: AsyncReaderWriterLock::new(inner),
            mirror,
            commit_gate: IndexGate::new(commit_index),
        })
    }

    /// lock-free view of term, vote and counters
    pub fn state(&self) -> &NodeStateMirror {
        &self.mirror
    }

    pub fn term(&self) -> i64 {
        self.mirror.term()
    }

    pub fn commit_index(&self) -> i64 {
        self.mirror.commit_index()
    }

    pub fn last_applied(&self) -> i64 {
        self.mirror.last_applied()
    }

    pub fn last_index(&self) -> i64 {
        self.mirror.last_index()
    }

    pub fn last_term(&self) -> i64 {
        self.mirror.last_term()
    }

    pub fn snapshot_index(&self) -> i64 {
        self.mirror.snapshot_index()
    }

    pub fn last_vote(&self) -> Option<ClusterMemberId> {
        self.mirror.voted_for()
    }

    /// true when no vote was cast in this term or it went to `member`
    pub fn is_voted_for(&self, member: &ClusterMemberId) -> bool {
        self.mirror.voted_for().map_or(true, |v| v == *member)
    }

    // -- term and vote --

    pub async fn update_term(&self, term: i64, reset_vote: bool) -> Result<()> {
        let mut inner = self.inner.write().await?;
        let current = inner.state.get().term;
        if term < current {
            return Err(StorageError::TermRegression {
                current,
                requested: term,
            });
        }
        if term == current && !reset_vote {
            return Ok(());
        }
        inner.state.set_term(term)?;
        if reset_vote {
            inner.state.set_vote(None)?;
        }
        inner.state.flush()?;
        self.mirror.publish(inner.state.get());
        Ok(())
    }

    /// start a new term voting for `self_id`, returns the new term
    pub async fn increment_term(&self, self_id: ClusterMemberId) -> Result<i64> {
        let mut inner = self.inner.write().await?;
        let term = inner.state.get().term + 1;
        inner.state.set_term(term)?;
        inner.state.set_vote(Some(self_id))?;
        inner.state.flush()?;
        self.mirror.publish(inner.state.get());
        Ok(term)
    }

    pub async fn update_vote(&self, member: Option<ClusterMemberId>) -> Result<()> {
        let mut inner = self.inner.write().await?;
        inner.state.set_vote(member)?;
        inner.state.flush()?;
        self.mirror.publish(inner.state.get());
        Ok(())
    }

    // -- writes --

    /// append at `last_index + 1`
    pub async fn append(&self, entry: LogEntry) -> Result<i64> {
        let mut inner = self.inner.write().await?;
        inner.append(&entry, &self.mirror)?;
        Ok(entry.index)
    }

    /// append a new command at the next index, returns that index
    pub async fn append_command(
        &self,
        term: i64,
        command: impl Into<Bytes>,
        command_id: Option<i32>,
    ) -> Result<i64> {
        let mut inner = self.inner.write().await?;
        let mut entry = LogEntry::new(term, inner.last_index() + 1, command);
        entry.command_id = command_id;
        inner.append(&entry, &self.mirror)?;
        Ok(entry.index)
    }

    /// accept entries from a leader
    ///
    /// entries that already match are skipped, a conflicting uncommitted
    /// suffix is dropped before the rest is appended. returns the last index.
    pub async fn replicate(&self, entries: Vec<LogEntry>) -> Result<i64> {
        let mut inner = self.inner.write().await?;
        for entry in entries {
            if entry.index <= inner.snapshot_index() {
                continue;
            }
            if entry.index <= inner.last_index() {
                if inner.term_at(entry.index)? == entry.term {
                    continue;
                }
                let dropped = inner.truncate_from(entry.index, &self.mirror)?;
                debug!(index = entry.index, dropped, "dropped conflicting suffix");
            }
            inner.append(&entry, &self.mirror)?;
        }
        Ok(inner.last_index())
    }

    /// remove uncommitted entries starting at `index`, returns how many were removed
    pub async fn drop_from(&self, index: i64) -> Result<i64> {
        let mut inner = self.inner.write().await?;
        inner.truncate_from(index, &self.mirror)
    }

    /// advance the commit index to `min(index, last_index)`
    ///
    /// commit waiters are released once the new index is durable. a failed
    /// compaction step is logged and retried when the commit index next moves.
    pub async fn commit(&self, index: i64) -> Result<i64> {
        let (committed, compaction) = {
            let mut inner = self.inner.write().await?;
            let committed = inner.commit(index, &self.mirror)?;
            let compaction = match committed {
                Some(_) => inner.compact_committed_partitions(&self.mirror),
                None => Ok(0),
            };
            (committed, compaction)
        };
        if let Some(commit_index) = committed {
            self.commit_gate.advance(commit_index);
        }
        if let Err(err) = compaction {
            warn!(error = %err, "incremental compaction failed");
        }
        Ok(self.mirror.commit_index())
    }

    /// record that the state machine applied everything up to `index`
    pub async fn mark_applied(&self, index: i64) -> Result<i64> {
        let mut inner = self.inner.write().await?;
        let state = *inner.state.get();
        let target = index.min(state.commit_index);
        if target > state.last_applied {
            inner.state.set_last_applied(target)?;
            inner.state.flush()?;
            self.mirror.publish(inner.state.get());
        }
        Ok(inner.state.get().last_applied)
    }

    /// fold committed entries up to `up_to` into the snapshot, returns the snapshot index
    pub async fn force_compaction(&self, up_to: i64) -> Result<i64> {
        let mut inner = self.inner.write().await?;
        inner.compact(up_to, usize::MAX, &self.mirror)?;
        Ok(inner.snapshot_index())
    }

    /// replace the log prefix with a snapshot received from the leader
    ///
    /// returns false when the local snapshot is already at or past it.
    pub async fn install_snapshot(&self, snapshot: LogEntry) -> Result<bool> {
        let installed = {
            let mut inner = self.inner.write().await?;
            inner.install_snapshot(&snapshot, &self.mirror)?
        };
        if installed {
            self.commit_gate.advance(self.mirror.commit_index());
        }
        Ok(installed)
    }

    pub async fn flush(&self) -> Result<()> {
        self.inner.write().await?.flush()
    }

    // -- reads --

    pub async fn term_at(&self, index: i64) -> Result<i64> {
        self.inner.read().await?.term_at(index)
    }

    pub async fn read(&self, index: i64) -> Result<LogEntry> {
        self.inner.read().await?.read_owned(index)
    }

    /// entries in `start..=end`, the end is clamped to the last index
    pub async fn read_range(&self, start: i64, end: i64) -> Result<Vec<LogEntry>> {
        let inner = self.inner.read().await?;
        let end = end.min(inner.last_index());
        (start..=end).map(|i| inner.read_owned(i)).collect()
    }

    /// visit entries in `start..=end` without copying payloads up front
    ///
    /// returns the number of entries visited.
    pub async fn read_with<F>(&self, start: i64, end: i64, mut visit: F) -> Result<usize>
    where
        F: FnMut(StoredEntry<'_>) -> Result<ControlFlow<()>>,
    {
        let inner = self.inner.read().await?;
        let end = end.min(inner.last_index());
        let mut visited = 0;
        for index in start..=end {
            visited += 1;
            if visit(inner.entry(index)?)?.is_break() {
                break;
            }
        }
        Ok(visited)
    }

    pub async fn read_snapshot(&self) -> Result<Option<LogEntry>> {
        let inner = self.inner.read().await?;
        if inner.snapshot.is_none() {
            return Ok(None);
        }
        snapshot::read(&inner.snapshot_path)
    }

    /// suspend until the commit index reaches `index`
    pub async fn wait_for_commit(
        &self,
        index: i64,
        timeout: Option<Duration>,
        cancellation: Option<CancellationToken>,
    ) -> Result<()> {
        self.commit_gate.wait_for(index, timeout, cancellation).await?;
        Ok(())
    }

    /// fail commit waiters and reject later calls without waiting for lock holders
    pub fn dispose(&self) {
        self.commit_gate.dispose();
        self.inner.dispose();
    }

    /// reject every later call with a disposed error, then flush
    ///
    /// callers queued behind the disposal fail instead of writing after the
    /// final flush.
    pub async fn dispose_async(&self) -> Result<()> {
        let flushed = {
            let mut inner = self.inner.write().await?;
            self.inner.dispose();
            self.commit_gate.dispose();
            inner.flush()
        };
        self.inner.dispose_async().await?;
        flushed?;
        info!("closed persistent log");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::StateBackingKind;
    use tempfile::tempdir;

    fn options(dir: &std::path::Path) -> LogOptions {
        LogOptions {
            records_per_partition: 4,
            ..LogOptions::new(dir)
        }
    }

    #[tokio::test]
    async fn empty_log_has_implicit_first_entry() {
        let dir = tempdir().unwrap();
        let log = PersistentLog::open(options(dir.path())).unwrap();
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.term_at(0).await.unwrap(), 0);
        let entry = log.read(0).await.unwrap();
        assert_eq!(entry.term, 0);
        assert!(entry.command.is_empty());
    }

    #[tokio::test]
    async fn cached_and_file_reads_agree() {
        let dir = tempdir().unwrap();
        let log = PersistentLog::open(LogOptions {
            max_cached_entries: 2,
            ..options(dir.path())
        })
        .unwrap();
        for index in 1..=4 {
            log.append(LogEntry::new(1, index, vec![index as u8; 3])).await.unwrap();
        }
        let mut buffered = Vec::new();
        log.read_with(1, 4, |entry| {
            buffered.push(entry.is_buffered());
            Ok(ControlFlow::Continue(()))
        })
        .await
        .unwrap();
        assert_eq!(buffered, vec![true, true, false, false]);

        for index in 1..=4 {
            assert_eq!(&log.read(index).await.unwrap().command[..], &[index as u8; 3]);
        }
    }

    #[tokio::test]
    async fn read_with_stops_on_break() {
        let dir = tempdir().unwrap();
        let log = PersistentLog::open(options(dir.path())).unwrap();
        for index in 1..=3 {
            log.append(LogEntry::new(1, index, b"x".to_vec())).await.unwrap();
        }
        let visited = log
            .read_with(1, 3, |entry| {
                Ok(if entry.index() == 2 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                })
            })
            .await
            .unwrap();
        assert_eq!(visited, 2);
    }

    #[tokio::test]
    async fn small_buffer_is_rejected() {
        let dir = tempdir().unwrap();
        let log = PersistentLog::open(options(dir.path())).unwrap();
        log.append(LogEntry::new(1, 1, b"payload".to_vec())).await.unwrap();
        log.read_with(1, 1, |mut entry| {
            let mut buf = [0u8; 3];
            assert!(matches!(
                entry.read_into(&mut buf),
                Err(StorageError::BufferTooSmall { needed: 7, actual: 3 })
            ));
            Ok(ControlFlow::Continue(()))
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn memory_backing_forgets_state() {
        let dir = tempdir().unwrap();
        let memory = LogOptions {
            state_backing: StateBackingKind::Memory,
            ..options(dir.path())
        };
        {
            let log = PersistentLog::open(memory.clone()).unwrap();
            log.update_term(4, false).await.unwrap();
        }
        let log = PersistentLog::open(memory).unwrap();
        assert_eq!(log.term(), 0);
    }
}
