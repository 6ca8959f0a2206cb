//! # service
//!
//! why: the consensus driver must not care which carrier delivers a request
//! relations: RaftService is implemented by raft-cluster; RaftClient by tcp.rs, udp.rs and http.rs
//! what: RaftService, RaftClient with typed request helpers

use crate::error::{Result, TransportError};
use async_trait::async_trait;
use raft_core::{ClusterMemberId, LogEntry, RaftMessage, RaftReply, Reply};
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;

/// Answers requests received by a transport server
#[async_trait]
pub trait RaftService: Send + Sync + 'static {
    async fn handle(&self, message: RaftMessage) -> Result<RaftReply>;
}

/// Caller side of one remote member
#[async_trait]
pub trait RaftClient: Send + Sync {
    fn endpoint(&self) -> SocketAddr;

    /// send `message` and await its reply within the configured timeout
    async fn exchange(&self, message: RaftMessage, cancellation: Option<CancellationToken>) -> Result<RaftReply>;

    async fn vote(
        &self,
        sender: ClusterMemberId,
        term: i64,
        last_log_index: i64,
        last_log_term: i64,
        cancellation: Option<CancellationToken>,
    ) -> Result<Reply<bool>> {
        let message = RaftMessage::Vote {
            sender,
            term,
            last_log_index,
            last_log_term,
        };
        match self.exchange(message, cancellation).await? {
            RaftReply::Vote(reply) => Ok(reply),
            _ => Err(TransportError::UnexpectedReply { expected: "vote" }),
        }
    }

    async fn pre_vote(
        &self,
        sender: ClusterMemberId,
        term: i64,
        last_log_index: i64,
        last_log_term: i64,
        cancellation: Option<CancellationToken>,
    ) -> Result<Reply<bool>> {
        let message = RaftMessage::PreVote {
            sender,
            term,
            last_log_index,
            last_log_term,
        };
        match self.exchange(message, cancellation).await? {
            RaftReply::PreVote(reply) => Ok(reply),
            _ => Err(TransportError::UnexpectedReply { expected: "pre-vote" }),
        }
    }

    async fn resign(&self, sender: ClusterMemberId, cancellation: Option<CancellationToken>) -> Result<bool> {
        match self.exchange(RaftMessage::Resign { sender }, cancellation).await? {
            RaftReply::Resign(accepted) => Ok(accepted),
            _ => Err(TransportError::UnexpectedReply { expected: "resign" }),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn append_entries(
        &self,
        sender: ClusterMemberId,
        term: i64,
        prev_log_index: i64,
        prev_log_term: i64,
        entries: Vec<LogEntry>,
        commit_index: i64,
        cancellation: Option<CancellationToken>,
    ) -> Result<Reply<bool>> {
        let message = RaftMessage::AppendEntries {
            sender,
            term,
            prev_log_index,
            prev_log_term,
            entries,
            commit_index,
        };
        match self.exchange(message, cancellation).await? {
            RaftReply::AppendEntries(reply) => Ok(reply),
            _ => Err(TransportError::UnexpectedReply { expected: "append-entries" }),
        }
    }

    async fn install_snapshot(
        &self,
        sender: ClusterMemberId,
        term: i64,
        snapshot: LogEntry,
        cancellation: Option<CancellationToken>,
    ) -> Result<Reply<bool>> {
        let message = RaftMessage::InstallSnapshot { sender, term, snapshot };
        match self.exchange(message, cancellation).await? {
            RaftReply::InstallSnapshot(reply) => Ok(reply),
            _ => Err(TransportError::UnexpectedReply { expected: "install-snapshot" }),
        }
    }

    /// commit index known by the remote member, none when it cannot vouch for one
    async fn synchronize(&self, sender: ClusterMemberId, cancellation: Option<CancellationToken>) -> Result<Option<i64>> {
        match self.exchange(RaftMessage::Synchronize { sender }, cancellation).await? {
            RaftReply::Synchronize(commit_index) => Ok(commit_index),
            _ => Err(TransportError::UnexpectedReply { expected: "synchronize" }),
        }
    }
}
