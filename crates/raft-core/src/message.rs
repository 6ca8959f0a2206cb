//! # message
//!
//! why: define all raft rpc message types for member communication
//! relations: encoded by raft-transport, answered by raft-cluster
//! what: RaftMessage requests, RaftReply responses, Reply<T> term-stamped result

use crate::{ClusterMemberId, LogEntry};
use serde::{Deserialize, Serialize};

/// All requests a member can send to another member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftMessage {
    /// Request a vote during leader election
    Vote {
        sender: ClusterMemberId,
        term: i64,
        last_log_index: i64,
        last_log_term: i64,
    },
    /// Ask whether an election could succeed, without touching terms
    PreVote {
        sender: ClusterMemberId,
        term: i64,
        last_log_index: i64,
        last_log_term: i64,
    },
    /// Ask the receiving leader to step down
    Resign { sender: ClusterMemberId },
    /// Replicate log entries (also serves as heartbeat when entries is empty)
    AppendEntries {
        sender: ClusterMemberId,
        term: i64,
        prev_log_index: i64,
        prev_log_term: i64,
        entries: Vec<LogEntry>,
        commit_index: i64,
    },
    /// Replace the follower's prefix with a snapshot
    InstallSnapshot {
        sender: ClusterMemberId,
        term: i64,
        snapshot: LogEntry,
    },
    /// Ask for the commit index known by the receiver
    Synchronize { sender: ClusterMemberId },
}

impl RaftMessage {
    pub fn sender(&self) -> ClusterMemberId {
        match self {
            Self::Vote { sender, .. }
            | Self::PreVote { sender, .. }
            | Self::Resign { sender }
            | Self::AppendEntries { sender, .. }
            | Self::InstallSnapshot { sender, .. }
            | Self::Synchronize { sender } => *sender,
        }
    }

    /// term carried by the request, if any
    pub fn term(&self) -> Option<i64> {
        match self {
            Self::Vote { term, .. }
            | Self::PreVote { term, .. }
            | Self::AppendEntries { term, .. }
            | Self::InstallSnapshot { term, .. } => Some(*term),
            Self::Resign { .. } | Self::Synchronize { .. } => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Vote { .. } => "vote",
            Self::PreVote { .. } => "pre-vote",
            Self::Resign { .. } => "resign",
            Self::AppendEntries { .. } => "append-entries",
            Self::InstallSnapshot { .. } => "install-snapshot",
            Self::Synchronize { .. } => "synchronize",
        }
    }
}

/// A result stamped with the responder's current term
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply<T> {
    pub term: i64,
    pub value: T,
}

impl<T> Reply<T> {
    pub fn new(term: i64, value: T) -> Self {
        Self { term, value }
    }
}

/// Response to a RaftMessage, one variant per request kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftReply {
    Vote(Reply<bool>),
    PreVote(Reply<bool>),
    Resign(bool),
    AppendEntries(Reply<bool>),
    InstallSnapshot(Reply<bool>),
    /// commit index of the responder, none when it has no authority to report one
    Synchronize(Option<i64>),
}

impl RaftReply {
    /// term of the responder, if the reply carries one
    pub fn term(&self) -> Option<i64> {
        match self {
            Self::Vote(r) | Self::PreVote(r) | Self::AppendEntries(r) | Self::InstallSnapshot(r) => {
                Some(r.term)
            }
            Self::Resign(_) | Self::Synchronize(_) => None,
        }
    }
}
