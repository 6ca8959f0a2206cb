//! # state
//!
//! why: term, vote and the log counters must survive restarts at fixed byte offsets
//! relations: owned by log.rs; published to readers through NodeStateMirror
//! what: NodeState record layout, StateBacking trait with mapped/positioned/memory impls, mirror
//!
//! layout of the 128-byte record, all integers little-endian:
//!
//! | offset | field        |
//! |--------|--------------|
//! | 0      | term         |
//! | 8      | commit index |
//! | 16     | last applied |
//! | 24     | last index   |
//! | 32     | has vote     |
//! | 33..61 | voted for    |

use crate::error::{Result, StorageError};
use crate::options::StateBackingKind;
use memmap2::MmapMut;
use parking_lot::RwLock;
use raft_core::ClusterMemberId;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};

pub const STATE_CAPACITY: usize = 128;

const TERM: usize = 0;
const COMMIT_INDEX: usize = 8;
const LAST_APPLIED: usize = 16;
const LAST_INDEX: usize = 24;
const HAS_VOTE: usize = 32;
const VOTED_FOR: usize = 33;

/// durable counters and vote of a member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeState {
    pub term: i64,
    pub commit_index: i64,
    pub last_applied: i64,
    pub last_index: i64,
    pub voted_for: Option<ClusterMemberId>,
}

impl NodeState {
    pub fn encode(&self) -> [u8; STATE_CAPACITY] {
        let mut buf = [0u8; STATE_CAPACITY];
        buf[TERM..TERM + 8].copy_from_slice(&self.term.to_le_bytes());
        buf[COMMIT_INDEX..COMMIT_INDEX + 8].copy_from_slice(&self.commit_index.to_le_bytes());
        buf[LAST_APPLIED..LAST_APPLIED + 8].copy_from_slice(&self.last_applied.to_le_bytes());
        buf[LAST_INDEX..LAST_INDEX + 8].copy_from_slice(&self.last_index.to_le_bytes());
        if let Some(member) = self.voted_for {
            buf[HAS_VOTE] = 1;
            buf[VOTED_FOR..VOTED_FOR + ClusterMemberId::SIZE].copy_from_slice(member.as_bytes());
        }
        buf
    }

    /// parse and verify a record
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < STATE_CAPACITY {
            return Err(StorageError::BufferTooSmall {
                needed: STATE_CAPACITY,
                actual: buf.len(),
            });
        }
        let state = Self {
            term: read_i64(buf, TERM),
            commit_index: read_i64(buf, COMMIT_INDEX),
            last_applied: read_i64(buf, LAST_APPLIED),
            last_index: read_i64(buf, LAST_INDEX),
            voted_for: match buf[HAS_VOTE] {
                0 => None,
                1 => Some(ClusterMemberId::read_from(&buf[VOTED_FOR..])?),
                flag => return Err(StorageError::Corrupted(format!("invalid vote flag {flag}"))),
            },
        };
        state.verify()?;
        Ok(state)
    }

    fn verify(&self) -> Result<()> {
        let ordered = 0 <= self.last_applied
            && self.last_applied <= self.commit_index
            && self.commit_index <= self.last_index;
        if !ordered || self.term < 0 {
            return Err(StorageError::Corrupted(format!("node state out of order: {self:?}")));
        }
        Ok(())
    }
}

fn read_i64(buf: &[u8], offset: usize) -> i64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    i64::from_le_bytes(bytes)
}

/// byte-addressed storage for the node state record
pub trait StateBacking: Send + Sync {
    fn read(&mut self, buf: &mut [u8; STATE_CAPACITY]) -> io::Result<()>;

    fn write_at(&mut self, offset: usize, bytes: &[u8]) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()>;
}

// -- memory-mapped backing --

pub struct MappedState {
    map: MmapMut,
}

impl MappedState {
    pub fn open(path: &Path) -> Result<Self> {
        let file = open_state_file(path)?;
        // SAFETY: the log owns its directory; nothing else maps or truncates node.state
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self { map })
    }
}

impl StateBacking for MappedState {
    fn read(&mut self, buf: &mut [u8; STATE_CAPACITY]) -> io::Result<()> {
        buf.copy_from_slice(&self.map[..STATE_CAPACITY]);
        Ok(())
    }

    fn write_at(&mut self, offset: usize, bytes: &[u8]) -> io::Result<()> {
        self.map[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.map.flush()
    }
}

// -- positioned file backing --

pub struct PositionedState {
    file: File,
}

impl PositionedState {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            file: open_state_file(path)?,
        })
    }
}

impl StateBacking for PositionedState {
    fn read(&mut self, buf: &mut [u8; STATE_CAPACITY]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_exact(buf)
    }

    fn write_at(&mut self, offset: usize, bytes: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset as u64))?;
        self.file.write_all(bytes)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.sync_data()
    }
}

// -- in-memory backing --

/// volatile backing for tests, nothing survives a restart
pub struct MemoryState {
    bytes: [u8; STATE_CAPACITY],
}

impl Default for MemoryState {
    fn default() -> Self {
        Self {
            bytes: [0u8; STATE_CAPACITY],
        }
    }
}

impl StateBacking for MemoryState {
    fn read(&mut self, buf: &mut [u8; STATE_CAPACITY]) -> io::Result<()> {
        buf.copy_from_slice(&self.bytes);
        Ok(())
    }

    fn write_at(&mut self, offset: usize, bytes: &[u8]) -> io::Result<()> {
        self.bytes[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// create node.state if missing; an existing file must hold a full record
fn open_state_file(path: &Path) -> Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    match file.metadata()?.len() {
        0 => file.set_len(STATE_CAPACITY as u64)?,
        len if len < STATE_CAPACITY as u64 => {
            return Err(StorageError::Corrupted(format!(
                "{} holds {len} bytes, expected {STATE_CAPACITY}",
                path.display()
            )))
        }
        _ => {}
    }
    Ok(file)
}

/// the record plus the backing it is written through
pub(crate) struct StateFile {
    backing: Box<dyn StateBacking>,
    state: NodeState,
}

impl StateFile {
    pub(crate) fn open(path: &Path, kind: StateBackingKind) -> Result<Self> {
        let mut backing: Box<dyn StateBacking> = match kind {
            StateBackingKind::Mapped => Box::new(MappedState::open(path)?),
            StateBackingKind::Positioned => Box::new(PositionedState::open(path)?),
            StateBackingKind::Memory => Box::new(MemoryState::default()),
        };
        let mut buf = [0u8; STATE_CAPACITY];
        backing.read(&mut buf)?;
        let state = NodeState::decode(&buf)?;
        Ok(Self { backing, state })
    }

    pub(crate) fn get(&self) -> &NodeState {
        &self.state
    }

    fn write_i64(&mut self, offset: usize, value: i64) -> io::Result<()> {
        self.backing.write_at(offset, &value.to_le_bytes())
    }

    pub(crate) fn set_term(&mut self, term: i64) -> io::Result<()> {
        self.write_i64(TERM, term)?;
        self.state.term = term;
        Ok(())
    }

    pub(crate) fn set_commit_index(&mut self, index: i64) -> io::Result<()> {
        self.write_i64(COMMIT_INDEX, index)?;
        self.state.commit_index = index;
        Ok(())
    }

    pub(crate) fn set_last_applied(&mut self, index: i64) -> io::Result<()> {
        self.write_i64(LAST_APPLIED, index)?;
        self.state.last_applied = index;
        Ok(())
    }

    pub(crate) fn set_last_index(&mut self, index: i64) -> io::Result<()> {
        self.write_i64(LAST_INDEX, index)?;
        self.state.last_index = index;
        Ok(())
    }

    pub(crate) fn set_vote(&mut self, member: Option<ClusterMemberId>) -> io::Result<()> {
        let mut bytes = [0u8; 1 + ClusterMemberId::SIZE];
        if let Some(member) = member {
            bytes[0] = 1;
            bytes[1..].copy_from_slice(member.as_bytes());
        }
        self.backing.write_at(HAS_VOTE, &bytes)?;
        self.state.voted_for = member;
        Ok(())
    }

    pub(crate) fn flush(&mut self) -> io::Result<()> {
        self.backing.flush()
    }
}

/// lock-free view of the node state
///
/// values are published only after the backing write that produced them.
#[derive(Debug, Default)]
pub struct NodeStateMirror {
    term: AtomicI64,
    commit_index: AtomicI64,
    last_applied: AtomicI64,
    last_index: AtomicI64,
    last_term: AtomicI64,
    snapshot_index: AtomicI64,
    /// the whole record as last published, for readers needing one consistent view
    current: RwLock<NodeState>,
}

impl NodeStateMirror {
    pub fn term(&self) -> i64 {
        self.term.load(Ordering::Acquire)
    }

    pub fn commit_index(&self) -> i64 {
        self.commit_index.load(Ordering::Acquire)
    }

    pub fn last_applied(&self) -> i64 {
        self.last_applied.load(Ordering::Acquire)
    }

    pub fn last_index(&self) -> i64 {
        self.last_index.load(Ordering::Acquire)
    }

    pub fn last_term(&self) -> i64 {
        self.last_term.load(Ordering::Acquire)
    }

    pub fn snapshot_index(&self) -> i64 {
        self.snapshot_index.load(Ordering::Acquire)
    }

    pub fn voted_for(&self) -> Option<ClusterMemberId> {
        self.current.read().voted_for
    }

    /// every field from the same publication
    ///
    /// reading the counters one by one can mix two publications.
    pub fn load(&self) -> NodeState {
        *self.current.read()
    }

    /// copy every field of `state` into the mirror
    ///
    /// counters are stored from last_index down to last_applied; a reader
    /// loading them in the opposite order sees them ordered.
    pub(crate) fn publish(&self, state: &NodeState) {
        let mut current = self.current.write();
        self.last_index.store(state.last_index, Ordering::Release);
        self.commit_index.store(state.commit_index, Ordering::Release);
        self.last_applied.store(state.last_applied, Ordering::Release);
        self.term.store(state.term, Ordering::Release);
        *current = *state;
    }

    pub(crate) fn set_last_term(&self, term: i64) {
        self.last_term.store(term, Ordering::Release);
    }

    pub(crate) fn set_snapshot_index(&self, index: i64) {
        self.snapshot_index.store(index, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tempfile::tempdir;

    fn member() -> ClusterMemberId {
        ClusterMemberId::from("10.0.0.7:3262".parse::<SocketAddr>().unwrap())
    }

    #[test]
    fn encode_uses_fixed_offsets() {
        let state = NodeState {
            term: 0x0102,
            commit_index: 3,
            last_applied: 2,
            last_index: 4,
            voted_for: Some(member()),
        };
        let buf = state.encode();
        assert_eq!(&buf[0..8], &0x0102i64.to_le_bytes());
        assert_eq!(&buf[8..16], &3i64.to_le_bytes());
        assert_eq!(&buf[16..24], &2i64.to_le_bytes());
        assert_eq!(&buf[24..32], &4i64.to_le_bytes());
        assert_eq!(buf[32], 1);
        assert_eq!(&buf[33..61], member().as_bytes());
        assert!(buf[61..].iter().all(|b| *b == 0));
        assert_eq!(NodeState::decode(&buf).unwrap(), state);
    }

    #[test]
    fn decode_rejects_out_of_order_counters() {
        let state = NodeState {
            commit_index: 5,
            last_index: 2,
            ..Default::default()
        };
        assert!(matches!(
            NodeState::decode(&state.encode()),
            Err(StorageError::Corrupted(_))
        ));
    }

    #[test]
    fn decode_rejects_short_buffer() {
        assert!(matches!(
            NodeState::decode(&[0u8; 12]),
            Err(StorageError::BufferTooSmall { needed: 128, actual: 12 })
        ));
    }

    #[test]
    fn backings_agree_on_bytes() {
        let dir = tempdir().unwrap();
        for kind in [StateBackingKind::Mapped, StateBackingKind::Positioned] {
            let path = dir.path().join(format!("{kind:?}.state"));
            {
                let mut file = StateFile::open(&path, kind).unwrap();
                file.set_term(9).unwrap();
                file.set_last_index(4).unwrap();
                file.set_commit_index(3).unwrap();
                file.set_vote(Some(member())).unwrap();
                file.flush().unwrap();
            }
            let bytes = std::fs::read(&path).unwrap();
            assert_eq!(bytes.len(), STATE_CAPACITY);
            let state = NodeState::decode(&bytes).unwrap();
            assert_eq!(state.term, 9);
            assert_eq!(state.voted_for, Some(member()));
            assert_eq!(StateFile::open(&path, kind).unwrap().get(), &state);
        }
    }

    #[test]
    fn mirror_load_matches_the_published_record() {
        let mirror = NodeStateMirror::default();
        let state = NodeState {
            term: 3,
            commit_index: 5,
            last_applied: 4,
            last_index: 7,
            voted_for: Some(member()),
        };
        mirror.publish(&state);
        assert_eq!(mirror.load(), state);
        assert_eq!(mirror.commit_index(), 5);
        assert_eq!(mirror.voted_for(), Some(member()));
    }

    #[test]
    fn truncated_state_file_is_corrupted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("node.state");
        std::fs::write(&path, [0u8; 20]).unwrap();
        assert!(matches!(
            StateFile::open(&path, StateBackingKind::Positioned),
            Err(StorageError::Corrupted(_))
        ));
    }
}
