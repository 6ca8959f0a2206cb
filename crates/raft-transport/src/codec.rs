//! # codec
//!
//! why: requests and replies cross the wire as compact binary payloads, independent of the carrier
//! relations: used by exchange.rs, udp.rs and http.rs
//! what: encode/decode of RaftMessage and RaftReply, little-endian throughout
//!
//! member ids are 28 raw bytes; entries are `term, index, timestamp` (i64),
//! `has command id` (u8), `command id` (i32), `length` (u32), payload.

use crate::error::{Result, TransportError};
use crate::exchange::MAX_MESSAGE_SIZE;
use crate::packet::MessageType;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use raft_core::{ClusterMemberId, LogEntry, RaftMessage, RaftReply, Reply};

pub fn message_type(message: &RaftMessage) -> MessageType {
    match message {
        RaftMessage::Vote { .. } => MessageType::Vote,
        RaftMessage::PreVote { .. } => MessageType::PreVote,
        RaftMessage::Resign { .. } => MessageType::Resign,
        RaftMessage::AppendEntries { .. } => MessageType::AppendEntries,
        RaftMessage::InstallSnapshot { .. } => MessageType::InstallSnapshot,
        RaftMessage::Synchronize { .. } => MessageType::Synchronize,
    }
}

/// refuses messages that would not fit in `MAX_MESSAGE_SIZE`
pub fn encode_message(message: &RaftMessage) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(64);
    match message {
        RaftMessage::Vote {
            sender,
            term,
            last_log_index,
            last_log_term,
        }
        | RaftMessage::PreVote {
            sender,
            term,
            last_log_index,
            last_log_term,
        } => {
            buf.put_slice(sender.as_bytes());
            buf.put_i64_le(*term);
            buf.put_i64_le(*last_log_index);
            buf.put_i64_le(*last_log_term);
        }
        RaftMessage::Resign { sender } | RaftMessage::Synchronize { sender } => {
            buf.put_slice(sender.as_bytes());
        }
        RaftMessage::AppendEntries {
            sender,
            term,
            prev_log_index,
            prev_log_term,
            entries,
            commit_index,
        } => {
            buf.put_slice(sender.as_bytes());
            buf.put_i64_le(*term);
            buf.put_i64_le(*prev_log_index);
            buf.put_i64_le(*prev_log_term);
            buf.put_i64_le(*commit_index);
            buf.put_u32_le(length_field(entries.len())?);
            for entry in entries {
                put_entry(&mut buf, entry)?;
            }
        }
        RaftMessage::InstallSnapshot {
            sender,
            term,
            snapshot,
        } => {
            buf.put_slice(sender.as_bytes());
            buf.put_i64_le(*term);
            put_entry(&mut buf, snapshot)?;
        }
    }
    if buf.len() > MAX_MESSAGE_SIZE {
        return Err(TransportError::PacketTooLarge {
            size: buf.len(),
            limit: MAX_MESSAGE_SIZE,
        });
    }
    Ok(buf.freeze())
}

fn length_field(len: usize) -> Result<u32> {
    u32::try_from(len)
        .ok()
        .filter(|_| len <= MAX_MESSAGE_SIZE)
        .ok_or(TransportError::PacketTooLarge {
            size: len,
            limit: MAX_MESSAGE_SIZE,
        })
}

fn put_entry(buf: &mut BytesMut, entry: &LogEntry) -> Result<()> {
    let length = length_field(entry.command.len())?;
    buf.reserve(33 + entry.command.len());
    buf.put_i64_le(entry.term);
    buf.put_i64_le(entry.index);
    buf.put_i64_le(entry.timestamp);
    buf.put_u8(u8::from(entry.command_id.is_some()));
    buf.put_i32_le(entry.command_id.unwrap_or_default());
    buf.put_u32_le(length);
    buf.put_slice(&entry.command);
    Ok(())
}

/// bounds-checked cursor over a payload
struct Reader {
    buf: Bytes,
}

impl Reader {
    fn need(&self, len: usize) -> Result<()> {
        if self.buf.remaining() < len {
            return Err(TransportError::protocol(format!(
                "payload truncated: need {len} more bytes, have {}",
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    fn i64(&mut self) -> Result<i64> {
        self.need(8)?;
        Ok(self.buf.get_i64_le())
    }

    fn i32(&mut self) -> Result<i32> {
        self.need(4)?;
        Ok(self.buf.get_i32_le())
    }

    fn u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    fn u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn bool(&mut self) -> Result<bool> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(TransportError::protocol(format!("invalid boolean {other}"))),
        }
    }

    fn member(&mut self) -> Result<ClusterMemberId> {
        self.need(ClusterMemberId::SIZE)?;
        let mut bytes = [0u8; ClusterMemberId::SIZE];
        self.buf.copy_to_slice(&mut bytes);
        Ok(ClusterMemberId::from_bytes(bytes))
    }

    fn bytes(&mut self, len: usize) -> Result<Bytes> {
        self.need(len)?;
        Ok(self.buf.split_to(len))
    }

    fn entry(&mut self) -> Result<LogEntry> {
        let term = self.i64()?;
        let index = self.i64()?;
        let timestamp = self.i64()?;
        let has_command_id = self.bool()?;
        let command_id = self.i32()?;
        let len = self.u32()? as usize;
        Ok(LogEntry {
            term,
            index,
            command_id: has_command_id.then_some(command_id),
            timestamp,
            command: self.bytes(len)?,
        })
    }

    fn finish<T>(self, value: T) -> Result<T> {
        if self.buf.has_remaining() {
            return Err(TransportError::protocol(format!(
                "{} trailing bytes after payload",
                self.buf.remaining()
            )));
        }
        Ok(value)
    }
}

pub fn decode_message(message_type: MessageType, payload: Bytes) -> Result<RaftMessage> {
    let mut r = Reader { buf: payload };
    let message = match message_type {
        MessageType::Vote | MessageType::PreVote => {
            let sender = r.member()?;
            let term = r.i64()?;
            let last_log_index = r.i64()?;
            let last_log_term = r.i64()?;
            if message_type == MessageType::Vote {
                RaftMessage::Vote {
                    sender,
                    term,
                    last_log_index,
                    last_log_term,
                }
            } else {
                RaftMessage::PreVote {
                    sender,
                    term,
                    last_log_index,
                    last_log_term,
                }
            }
        }
        MessageType::Resign => RaftMessage::Resign { sender: r.member()? },
        MessageType::Synchronize => RaftMessage::Synchronize { sender: r.member()? },
        MessageType::AppendEntries => {
            let sender = r.member()?;
            let term = r.i64()?;
            let prev_log_index = r.i64()?;
            let prev_log_term = r.i64()?;
            let commit_index = r.i64()?;
            let count = r.u32()? as usize;
            // every entry needs at least its fixed fields
            r.need(count.saturating_mul(33))?;
            let entries = (0..count).map(|_| r.entry()).collect::<Result<Vec<_>>>()?;
            RaftMessage::AppendEntries {
                sender,
                term,
                prev_log_index,
                prev_log_term,
                entries,
                commit_index,
            }
        }
        MessageType::InstallSnapshot => RaftMessage::InstallSnapshot {
            sender: r.member()?,
            term: r.i64()?,
            snapshot: r.entry()?,
        },
    };
    r.finish(message)
}

/// encode a reply; a synchronize reply without a commit index is empty
pub fn encode_reply(reply: &RaftReply) -> Bytes {
    let mut buf = BytesMut::with_capacity(9);
    match reply {
        RaftReply::Vote(r) | RaftReply::PreVote(r) | RaftReply::AppendEntries(r) | RaftReply::InstallSnapshot(r) => {
            buf.put_i64_le(r.term);
            buf.put_u8(u8::from(r.value));
        }
        RaftReply::Resign(accepted) => buf.put_u8(u8::from(*accepted)),
        RaftReply::Synchronize(commit_index) => {
            if let Some(index) = commit_index {
                buf.put_i64_le(*index);
            }
        }
    }
    buf.freeze()
}

pub fn decode_reply(message_type: MessageType, payload: Bytes) -> Result<RaftReply> {
    let mut r = Reader { buf: payload };
    let reply = match message_type {
        MessageType::Vote | MessageType::PreVote | MessageType::AppendEntries | MessageType::InstallSnapshot => {
            let reply = Reply::new(r.i64()?, r.bool()?);
            match message_type {
                MessageType::Vote => RaftReply::Vote(reply),
                MessageType::PreVote => RaftReply::PreVote(reply),
                MessageType::AppendEntries => RaftReply::AppendEntries(reply),
                _ => RaftReply::InstallSnapshot(reply),
            }
        }
        MessageType::Resign => RaftReply::Resign(r.bool()?),
        MessageType::Synchronize => {
            if r.buf.has_remaining() {
                RaftReply::Synchronize(Some(r.i64()?))
            } else {
                RaftReply::Synchronize(None)
            }
        }
    };
    r.finish(reply)
}

/// message type a reply answers
pub fn reply_type(reply: &RaftReply) -> MessageType {
    match reply {
        RaftReply::Vote(_) => MessageType::Vote,
        RaftReply::PreVote(_) => MessageType::PreVote,
        RaftReply::Resign(_) => MessageType::Resign,
        RaftReply::AppendEntries(_) => MessageType::AppendEntries,
        RaftReply::InstallSnapshot(_) => MessageType::InstallSnapshot,
        RaftReply::Synchronize(_) => MessageType::Synchronize,
    }
}
