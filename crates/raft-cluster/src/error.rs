//! # error
//!
//! why: the driver surfaces failures from every layer below it through one type
//! relations: wraps raft-core, raft-sync, raft-storage and raft-transport errors
//! what: ClusterError, Result alias

use raft_core::ClusterMemberId;
use raft_storage::StorageError;
use raft_sync::WaitError;
use raft_transport::TransportError;
use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClusterError>;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error(transparent)]
    Core(#[from] raft_core::Error),

    #[error("storage: {0}")]
    Storage(#[from] StorageError),

    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Wait(#[from] WaitError),

    /// only the leader accepts proposals and drives replication
    #[error("not the leader{}", leader.map(|l| format!(", try {l}")).unwrap_or_default())]
    NotLeader { leader: Option<ClusterMemberId> },

    #[error("cannot read cluster config: {0}")]
    Io(#[from] io::Error),

    #[error("malformed cluster config: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClusterError {
    /// true once the log or the member lock has been disposed
    pub fn is_disposed(&self) -> bool {
        match self {
            Self::Storage(err) => err.is_disposed(),
            Self::Wait(WaitError::Disposed) => true,
            _ => false,
        }
    }
}
