//! # node
//!
//! why: define the raft role state machine and state transitions
//! relations: driven by raft-cluster, durable term/vote/log live in raft-storage
//! what: MemberRole enum, RaftNode volatile state, quorum and commit calculation

use crate::{ClusterMemberId, RaftConfig};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// The three possible roles a member can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum MemberRole {
    /// Passive state - listens for heartbeats, votes when asked
    #[default]
    Follower,
    /// Transitional state - requesting votes to become leader
    Candidate,
    /// Active state - manages log replication, sends heartbeats
    Leader,
}

/// Volatile consensus state of a single member
///
/// term and vote are owned by the persistent log; `term` here mirrors the
/// value the driver last observed so stale responses can be discarded.
#[derive(Debug, Clone)]
pub struct RaftNode {
    pub id: ClusterMemberId,
    pub members: Vec<ClusterMemberId>,
    pub role: MemberRole,
    pub term: i64,
    pub leader: Option<ClusterMemberId>,
    pub votes_received: Vec<ClusterMemberId>,
    /// for each follower, index of the next entry to send
    pub next_index: HashMap<ClusterMemberId, i64>,
    /// for each follower, highest index known to be replicated
    pub match_index: HashMap<ClusterMemberId, i64>,
    pub config: RaftConfig,
}

impl RaftNode {
    /// Create a new member in Follower state
    pub fn new(id: ClusterMemberId, members: Vec<ClusterMemberId>) -> Self {
        Self::with_config(id, members, RaftConfig::default())
    }

    pub fn with_config(id: ClusterMemberId, members: Vec<ClusterMemberId>, config: RaftConfig) -> Self {
        Self {
            id,
            members,
            role: MemberRole::Follower,
            term: 0,
            leader: None,
            votes_received: Vec::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            config,
        }
    }

    /// members other than this one
    pub fn peers(&self) -> impl Iterator<Item = ClusterMemberId> + '_ {
        self.members.iter().copied().filter(move |m| *m != self.id)
    }

    pub fn quorum_size(&self) -> usize {
        self.members.len() / 2 + 1
    }

    pub fn has_quorum(&self) -> bool {
        self.votes_received.len() >= self.quorum_size()
    }

    pub fn is_leader(&self) -> bool {
        self.role == MemberRole::Leader
    }

    /// enter a new election in `term`; the caller has already persisted the self-vote
    pub fn start_election(&mut self, term: i64) {
        self.role = MemberRole::Candidate;
        self.term = term;
        self.leader = None;
        self.votes_received = vec![self.id];
        self.next_index.clear();
        self.match_index.clear();
    }

    /// count a vote; returns true once a quorum is reached
    pub fn handle_vote_response(&mut self, term: i64, granted: bool, from: ClusterMemberId) -> bool {
        if term > self.term {
            self.become_follower(term, None);
            return false;
        }
        if self.role != MemberRole::Candidate || term < self.term {
            return false;
        }
        if granted && !self.votes_received.contains(&from) {
            self.votes_received.push(from);
        }
        self.has_quorum()
    }

    pub fn become_leader(&mut self, last_log_index: i64) {
        self.role = MemberRole::Leader;
        self.leader = Some(self.id);
        let peers: Vec<_> = self.peers().collect();
        self.next_index = peers.iter().map(|p| (*p, last_log_index + 1)).collect();
        self.match_index = peers.iter().map(|p| (*p, 0)).collect();
    }

    pub fn become_follower(&mut self, term: i64, leader: Option<ClusterMemberId>) {
        self.role = MemberRole::Follower;
        self.term = self.term.max(term);
        self.leader = leader;
        self.votes_received.clear();
        self.next_index.clear();
        self.match_index.clear();
    }

    /// update replication progress for `from`; returns true when match_index advanced
    pub fn handle_append_entries_response(
        &mut self,
        from: ClusterMemberId,
        term: i64,
        success: bool,
        last_sent_index: i64,
    ) -> bool {
        if term > self.term {
            self.become_follower(term, None);
            return false;
        }
        if self.role != MemberRole::Leader {
            return false;
        }
        if success {
            let matched = self.match_index.entry(from).or_insert(0);
            let advanced = last_sent_index > *matched;
            *matched = (*matched).max(last_sent_index);
            self.next_index.insert(from, *matched + 1);
            advanced
        } else {
            let next = self.next_index.entry(from).or_insert(1);
            *next = (*next - 1).max(1);
            false
        }
    }

    /// highest index replicated on a quorum that may be committed now
    ///
    /// entries from earlier terms are only committed indirectly, so the
    /// candidate must carry the current term.
    pub fn commit_candidate(
        &self,
        leader_last_index: i64,
        commit_index: i64,
        term_at: impl Fn(i64) -> Option<i64>,
    ) -> Option<i64> {
        if self.role != MemberRole::Leader {
            return None;
        }
        let mut matched: Vec<i64> = self.peers().map(|p| self.match_index.get(&p).copied().unwrap_or(0)).collect();
        matched.push(leader_last_index);
        matched.sort_unstable_by(|a, b| b.cmp(a));
        let candidate = *matched.get(self.quorum_size() - 1)?;
        (candidate > commit_index && term_at(candidate) == Some(self.term)).then_some(candidate)
    }

    pub fn random_election_timeout(&self) -> Duration {
        let min = self.config.election_timeout_min;
        let max = self.config.election_timeout_max.max(min);
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}
