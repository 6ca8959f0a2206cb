//! # error
//!
//! why: every suspension point resolves to one of a handful of outcomes
//! relations: returned by completion.rs and synchronizer.rs, wrapped by storage and transport errors
//! what: WaitError

use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum WaitError {
    #[error("wait timed out")]
    Timeout,

    #[error("wait canceled")]
    Canceled,

    #[error("object has been disposed")]
    Disposed,

    /// the handle was reset or reused behind the caller's back
    #[error("wait token for generation {0} is stale or already in use")]
    InvalidGeneration(u64),

    #[error("faulted: {0}")]
    Faulted(Arc<dyn std::error::Error + Send + Sync>),
}

impl WaitError {
    pub fn faulted(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Faulted(Arc::new(err))
    }

    /// true for outcomes a caller may retry
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::Canceled)
    }
}
