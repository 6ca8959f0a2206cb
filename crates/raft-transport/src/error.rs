//! # error
//!
//! why: callers retry on transient failures and step down on protocol faults, so both must be distinguishable
//! relations: returned by every transport and client operation
//! what: TransportError, Result alias

use raft_sync::WaitError;
use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Wait(#[from] WaitError),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("packet of {size} bytes exceeds the limit of {limit}")]
    PacketTooLarge { size: usize, limit: usize },

    #[error("expected a {expected} reply")]
    UnexpectedReply { expected: &'static str },

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("http status {0}")]
    HttpStatus(u16),

    /// the remote service failed to produce a reply
    #[error("service error: {0}")]
    Service(String),

    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("invalid transport config: {0}")]
    InvalidConfig(String),
}

impl TransportError {
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// true for outcomes worth retrying against the same peer
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Wait(err) => err.is_transient(),
            Self::Io(_) | Self::Http(_) => true,
            _ => false,
        }
    }
}
