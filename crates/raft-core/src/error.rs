//! # error
//!
//! why: one error type for the pure consensus types
//! relations: wrapped by storage, transport and cluster errors
//! what: Error enum, Result alias

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// destination buffer cannot hold the encoded value
    #[error("buffer too small: need {needed} bytes, got {actual}")]
    BufferTooSmall { needed: usize, actual: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// a peer answered with a newer term; the caller must step down
    #[error("replication rejected by peer at term {term}")]
    ReplicationRejected { term: i64 },

    #[error("no consensus reached in term {term}")]
    NoConsensus { term: i64 },
}
