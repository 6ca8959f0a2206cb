//! # member
//!
//! why: a cluster member must answer peers from its durable log while it campaigns and replicates on its own
//! relations: answers raft-transport requests, persists through raft-storage, decides roles with raft-core's RaftNode
//! what: RaftMember (RaftService impl, campaign, replicate, propose, run), MemberStatus

use crate::error::{ClusterError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use parking_lot::Mutex;
use raft_core::{ClusterMemberId, LogEntry, MemberRole, RaftConfig, RaftMessage, RaftNode, RaftReply, Reply};
use raft_storage::{PersistentLog, StorageError};
use raft_sync::AsyncExclusiveLock;
use raft_transport::{RaftClient, RaftService, TransportError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// entries sent to one follower per append request
const MAX_BATCH: i64 = 64;

/// append requests per follower in one replication round
const MAX_ROUNDS: usize = 16;

/// Point-in-time view of a member
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberStatus {
    pub role: MemberRole,
    pub term: i64,
    pub leader: Option<ClusterMemberId>,
    pub commit_index: i64,
    pub last_index: i64,
}

/// One member of a raft cluster
///
/// Term, vote and entries live in the [`PersistentLog`]; the role state
/// machine is guarded by an async lock that inbound requests and the driver
/// share, so a decision and the write that records it happen together.
/// Network calls are made without holding that lock.
pub struct RaftMember {
    id: ClusterMemberId,
    log: Arc<PersistentLog>,
    node: AsyncExclusiveLock<RaftNode>,
    peers: Vec<(ClusterMemberId, Arc<dyn RaftClient>)>,
    config: RaftConfig,
    last_contact: Mutex<Instant>,
}

impl RaftMember {
    /// peers are identified by the endpoint their client talks to
    pub fn new(
        id: ClusterMemberId,
        log: Arc<PersistentLog>,
        config: RaftConfig,
        peers: Vec<Arc<dyn RaftClient>>,
    ) -> Result<Self> {
        config.validate()?;
        let peers: Vec<_> = peers
            .into_iter()
            .map(|client| (ClusterMemberId::from(client.endpoint()), client))
            .filter(|(peer, _)| *peer != id)
            .collect();
        let members = std::iter::once(id).chain(peers.iter().map(|(peer, _)| *peer)).collect();
        let mut node = RaftNode::with_config(id, members, config.clone());
        node.term = log.term();
        Ok(Self {
            id,
            log,
            node: AsyncExclusiveLock::new(node),
            peers,
            config,
            last_contact: Mutex::new(Instant::now()),
        })
    }

    pub fn id(&self) -> ClusterMemberId {
        self.id
    }

    pub fn log(&self) -> &Arc<PersistentLog> {
        &self.log
    }

    pub async fn status(&self) -> Result<MemberStatus> {
        let node = self.node.lock().await?;
        Ok(MemberStatus {
            role: node.role,
            term: self.log.term(),
            leader: node.leader,
            commit_index: self.log.commit_index(),
            last_index: self.log.last_index(),
        })
    }

    fn quorum(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    fn touch(&self) {
        *self.last_contact.lock() = Instant::now();
    }

    fn since_contact(&self) -> Duration {
        self.last_contact.lock().elapsed()
    }

    /// a candidate log at least as recent as ours
    fn is_up_to_date(&self, last_log_index: i64, last_log_term: i64) -> bool {
        let last_term = self.log.last_term();
        last_log_term > last_term || (last_log_term == last_term && last_log_index >= self.log.last_index())
    }

    /// adopt a newer term seen on the wire, forgetting the vote cast in the old one
    async fn observe_term(&self, node: &mut RaftNode, term: i64, leader: Option<ClusterMemberId>) -> Result<()> {
        if term > self.log.term() {
            self.log.update_term(term, true).await?;
            if node.role != MemberRole::Follower {
                info!(term, previous = ?node.role, "stepping down");
            }
            node.become_follower(term, leader);
        }
        Ok(())
    }

    // -- inbound requests --

    async fn dispatch(&self, message: RaftMessage) -> Result<RaftReply> {
        Ok(match message {
            RaftMessage::Vote {
                sender,
                term,
                last_log_index,
                last_log_term,
            } => RaftReply::Vote(self.on_vote(sender, term, last_log_index, last_log_term).await?),
            RaftMessage::PreVote {
                term,
                last_log_index,
                last_log_term,
                ..
            } => RaftReply::PreVote(self.on_pre_vote(term, last_log_index, last_log_term).await?),
            RaftMessage::Resign { sender } => RaftReply::Resign(self.on_resign(sender).await?),
            RaftMessage::AppendEntries {
                sender,
                term,
                prev_log_index,
                prev_log_term,
                entries,
                commit_index,
            } => RaftReply::AppendEntries(
                self.on_append_entries(sender, term, prev_log_index, prev_log_term, entries, commit_index)
                    .await?,
            ),
            RaftMessage::InstallSnapshot { sender, term, snapshot } => {
                RaftReply::InstallSnapshot(self.on_install_snapshot(sender, term, snapshot).await?)
            }
            RaftMessage::Synchronize { .. } => {
                let node = self.node.lock().await?;
                RaftReply::Synchronize(node.is_leader().then(|| self.log.commit_index()))
            }
        })
    }

    async fn on_vote(
        &self,
        sender: ClusterMemberId,
        term: i64,
        last_log_index: i64,
        last_log_term: i64,
    ) -> Result<Reply<bool>> {
        let mut node = self.node.lock().await?;
        self.observe_term(&mut node, term, None).await?;
        let current = self.log.term();
        if term < current {
            return Ok(Reply::new(current, false));
        }
        let granted = self.log.is_voted_for(&sender) && self.is_up_to_date(last_log_index, last_log_term);
        if granted {
            self.log.update_vote(Some(sender)).await?;
            self.touch();
        }
        debug!(%sender, term, granted, "vote requested");
        Ok(Reply::new(current, granted))
    }

    /// answers without touching term or vote
    async fn on_pre_vote(&self, term: i64, last_log_index: i64, last_log_term: i64) -> Result<Reply<bool>> {
        let node = self.node.lock().await?;
        let current = self.log.term();
        let leader_alive = node.is_leader()
            || (node.leader.is_some() && self.since_contact() < Duration::from_millis(self.config.election_timeout_min));
        let granted = term >= current && !leader_alive && self.is_up_to_date(last_log_index, last_log_term);
        Ok(Reply::new(current, granted))
    }

    async fn on_resign(&self, sender: ClusterMemberId) -> Result<bool> {
        let mut node = self.node.lock().await?;
        if !node.is_leader() {
            return Ok(false);
        }
        let term = node.term;
        node.become_follower(term, None);
        self.touch();
        info!(%sender, term, "resigned leadership");
        Ok(true)
    }

    async fn on_append_entries(
        &self,
        sender: ClusterMemberId,
        term: i64,
        prev_log_index: i64,
        prev_log_term: i64,
        entries: Vec<LogEntry>,
        commit_index: i64,
    ) -> Result<Reply<bool>> {
        let mut node = self.node.lock().await?;
        self.observe_term(&mut node, term, Some(sender)).await?;
        let current = self.log.term();
        if term < current {
            return Ok(Reply::new(current, false));
        }
        if node.role != MemberRole::Follower || node.leader != Some(sender) {
            node.become_follower(term, Some(sender));
        }
        self.touch();

        if prev_log_index > self.log.last_index() {
            return Ok(Reply::new(current, false));
        }
        match self.log.term_at(prev_log_index).await {
            Ok(found) if found == prev_log_term => {}
            Ok(_) => return Ok(Reply::new(current, false)),
            // folded into our snapshot, so already committed here
            Err(StorageError::SnapshotDetected { .. }) => {}
            Err(err) => return Err(err.into()),
        }

        let last_new = prev_log_index + entries.len() as i64;
        if !entries.is_empty() {
            self.log.replicate(entries).await?;
        }
        let commit = commit_index.min(last_new);
        if commit > self.log.commit_index() {
            self.log.commit(commit).await?;
        }
        Ok(Reply::new(current, true))
    }

    async fn on_install_snapshot(&self, sender: ClusterMemberId, term: i64, snapshot: LogEntry) -> Result<Reply<bool>> {
        let mut node = self.node.lock().await?;
        self.observe_term(&mut node, term, Some(sender)).await?;
        let current = self.log.term();
        if term < current {
            return Ok(Reply::new(current, false));
        }
        if node.role != MemberRole::Follower || node.leader != Some(sender) {
            node.become_follower(term, Some(sender));
        }
        self.touch();
        let index = snapshot.real_index();
        if self.log.install_snapshot(snapshot).await? {
            info!(%sender, index, "installed snapshot from leader");
        }
        Ok(Reply::new(current, true))
    }

    // -- driver --

    /// run a pre-vote round, then an election; returns true when this member leads
    pub async fn campaign(&self) -> Result<bool> {
        let last_index = self.log.last_index();
        let last_term = self.log.last_term();

        let proposed = self.log.term() + 1;
        let ballots = join_all(
            self.peers
                .iter()
                .map(|(_, client)| client.pre_vote(self.id, proposed, last_index, last_term, None)),
        )
        .await;
        let support = 1 + ballots.iter().filter(|r| matches!(r, Ok(reply) if reply.value)).count();
        if support < self.quorum() {
            self.touch();
            debug!(support, quorum = self.quorum(), "pre-vote failed");
            return Ok(false);
        }

        let term = {
            let mut node = self.node.lock().await?;
            if node.is_leader() {
                return Ok(true);
            }
            let term = self.log.increment_term(self.id).await?;
            node.start_election(term);
            term
        };
        self.touch();
        info!(term, "starting election");

        let ballots = join_all(self.peers.iter().map(|(peer, client)| async move {
            (*peer, client.vote(self.id, term, last_index, last_term, None).await)
        }))
        .await;

        let mut node = self.node.lock().await?;
        for (peer, ballot) in ballots {
            match ballot {
                Ok(reply) => {
                    self.observe_term(&mut node, reply.term, None).await?;
                    node.handle_vote_response(reply.term, reply.value, peer);
                }
                Err(err) => debug!(%peer, error = %err, "vote request failed"),
            }
        }
        if node.role != MemberRole::Candidate || node.term != term || !node.has_quorum() {
            debug!(term, votes = node.votes_received.len(), "election lost");
            return Ok(false);
        }

        node.become_leader(self.log.last_index());
        // entries from earlier terms only commit behind one from this term
        self.log.append_command(term, Bytes::new(), None).await?;
        info!(term, "elected leader");
        Ok(true)
    }

    /// one replication round to every follower; returns the commit index
    pub async fn replicate(&self) -> Result<i64> {
        let term = {
            let node = self.node.lock().await?;
            if !node.is_leader() {
                return Err(ClusterError::NotLeader { leader: node.leader });
            }
            node.term
        };
        let rounds = join_all(
            self.peers
                .iter()
                .map(|(peer, client)| self.replicate_to(term, *peer, client.as_ref())),
        )
        .await;
        for round in rounds {
            round?;
        }
        self.advance_commit(term).await
    }

    async fn replicate_to(&self, term: i64, peer: ClusterMemberId, client: &dyn RaftClient) -> Result<()> {
        for _ in 0..MAX_ROUNDS {
            let next = {
                let node = self.node.lock().await?;
                if !node.is_leader() || node.term != term {
                    return Ok(());
                }
                node.next_index.get(&peer).copied().unwrap_or(1)
            };
            let prev = next - 1;
            let prev_term = match self.log.term_at(prev).await {
                Ok(found) => found,
                Err(StorageError::SnapshotDetected { .. }) => {
                    if !self.send_snapshot(term, peer, client).await? {
                        return Ok(());
                    }
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            let entries = match self.log.read_range(next, next + MAX_BATCH - 1).await {
                Ok(entries) => entries,
                Err(StorageError::SnapshotDetected { .. }) => {
                    if !self.send_snapshot(term, peer, client).await? {
                        return Ok(());
                    }
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            let sent = prev + entries.len() as i64;
            let caught_up = sent >= self.log.last_index();
            let commit_index = self.log.commit_index();

            let reply = match client
                .append_entries(self.id, term, prev, prev_term, entries, commit_index, None)
                .await
            {
                Ok(reply) => reply,
                Err(err) => {
                    debug!(%peer, error = %err, "append entries failed");
                    return Ok(());
                }
            };

            let mut node = self.node.lock().await?;
            if reply.term > term {
                self.observe_term(&mut node, reply.term, None).await?;
                return Err(ClusterError::NotLeader { leader: None });
            }
            node.handle_append_entries_response(peer, reply.term, reply.value, sent);
            if reply.value && caught_up {
                return Ok(());
            }
        }
        Ok(())
    }

    /// returns false when the follower could not be reached
    async fn send_snapshot(&self, term: i64, peer: ClusterMemberId, client: &dyn RaftClient) -> Result<bool> {
        let snapshot = self
            .log
            .read_snapshot()
            .await?
            .ok_or_else(|| StorageError::Corrupted("entries are compacted but no snapshot exists".into()))?;
        let index = snapshot.real_index();
        let reply = match client.install_snapshot(self.id, term, snapshot, None).await {
            Ok(reply) => reply,
            Err(err) => {
                debug!(%peer, error = %err, "install snapshot failed");
                return Ok(false);
            }
        };
        let mut node = self.node.lock().await?;
        if reply.term > term {
            self.observe_term(&mut node, reply.term, None).await?;
            return Err(ClusterError::NotLeader { leader: None });
        }
        node.handle_append_entries_response(peer, reply.term, reply.value, index);
        info!(%peer, index, "sent snapshot");
        Ok(reply.value)
    }

    async fn advance_commit(&self, term: i64) -> Result<i64> {
        let node = self.node.lock().await?;
        if !node.is_leader() || node.term != term {
            return Ok(self.log.commit_index());
        }
        let commit_index = self.log.commit_index();
        let last_index = self.log.last_index();
        let matched: Vec<i64> = node
            .peers()
            .filter_map(|p| node.match_index.get(&p).copied())
            .chain([last_index])
            .filter(|i| *i > commit_index)
            .collect();
        let mut terms = HashMap::with_capacity(matched.len());
        for index in matched {
            if let std::collections::hash_map::Entry::Vacant(slot) = terms.entry(index) {
                slot.insert(self.log.term_at(index).await?);
            }
        }
        let Some(candidate) = node.commit_candidate(last_index, commit_index, |i| terms.get(&i).copied()) else {
            return Ok(commit_index);
        };
        drop(node);
        let committed = self.log.commit(candidate).await?;
        debug!(commit_index = committed, "advanced commit index");
        Ok(committed)
    }

    /// append a command as leader and replicate it; returns its index
    ///
    /// the entry is durable locally on return, use the log's commit waiter to
    /// learn when a quorum holds it.
    pub async fn propose(&self, command: impl Into<Bytes>) -> Result<i64> {
        let index = {
            let node = self.node.lock().await?;
            if !node.is_leader() {
                return Err(ClusterError::NotLeader { leader: node.leader });
            }
            self.log.append_command(node.term, command, None).await?
        };
        self.replicate().await?;
        Ok(index)
    }

    /// ask the current leader to step down; true when some peer accepted
    pub async fn request_resignation(&self) -> Result<bool> {
        let leader = self.node.lock().await?.leader;
        let Some(leader) = leader.filter(|l| *l != self.id) else {
            return self.on_resign(self.id).await;
        };
        match self.peers.iter().find(|(peer, _)| *peer == leader) {
            Some((_, client)) => Ok(client.resign(self.id, None).await?),
            None => Ok(false),
        }
    }

    /// drive elections and heartbeats until `shutdown` fires or the log is disposed
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(member = %self.id, peers = self.peers.len(), "consensus driver started");
        loop {
            let (leading, timeout) = match self.node.lock().await {
                Ok(node) => (node.is_leader(), node.random_election_timeout()),
                Err(_) => break,
            };
            let delay = if leading {
                self.config.heartbeat()
            } else {
                timeout.saturating_sub(self.since_contact())
            };
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            let outcome = if leading {
                self.replicate().await.map(drop)
            } else if self.since_contact() >= timeout {
                self.campaign().await.map(drop)
            } else {
                Ok(())
            };
            match outcome {
                Err(err) if err.is_disposed() => break,
                Err(ClusterError::NotLeader { .. }) => debug!("lost leadership during replication"),
                Err(err) => warn!(error = %err, "consensus round failed"),
                Ok(()) => {}
            }
        }
        info!(member = %self.id, "consensus driver stopped");
    }
}

#[async_trait]
impl RaftService for RaftMember {
    async fn handle(&self, message: RaftMessage) -> raft_transport::Result<RaftReply> {
        self.dispatch(message)
            .await
            .map_err(|err| TransportError::Service(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raft_storage::{LogOptions, StateBackingKind};
    use std::net::SocketAddr;

    fn peer(port: u16) -> ClusterMemberId {
        ClusterMemberId::from(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    fn solo(dir: &std::path::Path) -> RaftMember {
        let options = LogOptions {
            state_backing: StateBackingKind::Memory,
            ..LogOptions::new(dir)
        };
        let log = Arc::new(PersistentLog::open(options).unwrap());
        RaftMember::new(peer(1), log, RaftConfig::default(), Vec::new()).unwrap()
    }

    #[tokio::test]
    async fn single_member_elects_itself_and_commits() {
        let dir = tempfile::tempdir().unwrap();
        let member = solo(dir.path());
        assert!(member.campaign().await.unwrap());
        let index = member.propose(&b"x"[..]).await.unwrap();
        assert_eq!(index, 2);
        let status = member.status().await.unwrap();
        assert_eq!(status.role, MemberRole::Leader);
        assert_eq!(status.term, 1);
        assert_eq!(status.commit_index, 2);
    }

    #[tokio::test]
    async fn follower_refuses_proposals() {
        let dir = tempfile::tempdir().unwrap();
        let member = solo(dir.path());
        assert!(matches!(
            member.propose(&b"x"[..]).await,
            Err(ClusterError::NotLeader { leader: None })
        ));
    }

    #[tokio::test]
    async fn stale_vote_is_refused_with_current_term() {
        let dir = tempfile::tempdir().unwrap();
        let member = solo(dir.path());
        member.log().update_term(5, false).await.unwrap();
        let reply = member.on_vote(peer(2), 4, 10, 4).await.unwrap();
        assert_eq!(reply, Reply::new(5, false));
    }

    #[tokio::test]
    async fn one_vote_per_term() {
        let dir = tempfile::tempdir().unwrap();
        let member = solo(dir.path());
        assert!(member.on_vote(peer(2), 1, 0, 0).await.unwrap().value);
        assert!(!member.on_vote(peer(3), 1, 0, 0).await.unwrap().value);
        assert!(member.on_vote(peer(2), 1, 0, 0).await.unwrap().value);
        assert!(member.on_vote(peer(3), 2, 0, 0).await.unwrap().value);
    }

    #[tokio::test]
    async fn resign_only_affects_leaders() {
        let dir = tempfile::tempdir().unwrap();
        let member = solo(dir.path());
        assert!(!member.on_resign(peer(2)).await.unwrap());
        member.campaign().await.unwrap();
        assert!(member.on_resign(peer(2)).await.unwrap());
        assert_eq!(member.status().await.unwrap().role, MemberRole::Follower);
    }
}
