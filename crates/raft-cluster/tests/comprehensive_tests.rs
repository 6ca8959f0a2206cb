//! # comprehensive cluster tests
//!
//! why: verify members agree on leaders and entries through elections, outages and compaction
//! relations: tests raft-cluster crate over an in-process network and over tcp
//! what: elections, replication, catch-up by snapshot, term safety, service surface, running members

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use raft_cluster::{ClusterConfig, ClusterError, ClusterHandle, RaftMember};
use raft_core::{ClusterMemberId, LogEntry, MemberRole, RaftConfig, RaftMessage, RaftReply};
use raft_storage::{LogOptions, PersistentLog, SnapshotBuilder};
use raft_transport::{RaftClient, RaftService, TransportConfig, TransportError};
use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn addr(i: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 5000 + i))
}

/// in-process network with switchable outages
#[derive(Clone, Default)]
struct Network {
    members: Arc<RwLock<HashMap<SocketAddr, Arc<RaftMember>>>>,
    down: Arc<RwLock<HashSet<SocketAddr>>>,
}

impl Network {
    fn isolate(&self, endpoint: SocketAddr) {
        self.down.write().insert(endpoint);
    }

    fn heal(&self, endpoint: SocketAddr) {
        self.down.write().remove(&endpoint);
    }
}

struct Loopback {
    endpoint: SocketAddr,
    from: SocketAddr,
    network: Network,
}

#[async_trait]
impl RaftClient for Loopback {
    fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    async fn exchange(&self, message: RaftMessage, _: Option<CancellationToken>) -> raft_transport::Result<RaftReply> {
        let target = {
            let down = self.network.down.read();
            if down.contains(&self.endpoint) || down.contains(&self.from) {
                None
            } else {
                self.network.members.read().get(&self.endpoint).cloned()
            }
        };
        match target {
            Some(member) => member.handle(message).await,
            None => Err(TransportError::Io(io::ErrorKind::ConnectionRefused.into())),
        }
    }
}

/// counts applied entries
#[derive(Default)]
struct Counter(u64);

impl SnapshotBuilder for Counter {
    fn restore(&mut self, snapshot: &LogEntry) {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&snapshot.command[..8]);
        self.0 = u64::from_le_bytes(bytes);
    }

    fn apply(&mut self, _: &LogEntry) {
        self.0 += 1;
    }

    fn build(&self) -> Bytes {
        Bytes::copy_from_slice(&self.0.to_le_bytes())
    }
}

fn log_options(dir: &Path) -> LogOptions {
    LogOptions {
        records_per_partition: 4,
        compaction_count: 0,
        ..LogOptions::new(dir)
    }
}

struct Cluster {
    network: Network,
    members: Vec<Arc<RaftMember>>,
    _dirs: Vec<TempDir>,
}

impl Cluster {
    fn new(size: u16) -> Self {
        init_tracing();
        let network = Network::default();
        let endpoints: Vec<_> = (1..=size).map(addr).collect();
        let mut members = Vec::new();
        let mut dirs = Vec::new();
        for endpoint in &endpoints {
            let dir = tempfile::tempdir().unwrap();
            let log = PersistentLog::open_with_builder(log_options(dir.path()), Counter::default()).unwrap();
            let peers = endpoints
                .iter()
                .filter(|e| *e != endpoint)
                .map(|e| {
                    Arc::new(Loopback {
                        endpoint: *e,
                        from: *endpoint,
                        network: network.clone(),
                    }) as Arc<dyn RaftClient>
                })
                .collect();
            let member = Arc::new(
                RaftMember::new(ClusterMemberId::from(*endpoint), Arc::new(log), RaftConfig::default(), peers).unwrap(),
            );
            network.members.write().insert(*endpoint, member.clone());
            members.push(member);
            dirs.push(dir);
        }
        Self {
            network,
            members,
            _dirs: dirs,
        }
    }

    fn member(&self, i: usize) -> &Arc<RaftMember> {
        &self.members[i]
    }

    async fn roles(&self) -> Vec<MemberRole> {
        let mut roles = Vec::new();
        for member in &self.members {
            roles.push(member.status().await.unwrap().role);
        }
        roles
    }
}

// =============================================================================
// SECTION 1: ELECTIONS
// =============================================================================

mod elections {
    use super::*;

    #[tokio::test]
    async fn campaign_wins_a_quiet_cluster() {
        let cluster = Cluster::new(3);
        assert!(cluster.member(0).campaign().await.unwrap());
        assert_eq!(
            cluster.roles().await,
            vec![MemberRole::Leader, MemberRole::Follower, MemberRole::Follower]
        );
        let status = cluster.member(0).status().await.unwrap();
        assert_eq!(status.term, 1);
        // the no-op entry of the new term
        assert_eq!(status.last_index, 1);
        assert_eq!(cluster.member(1).log().last_vote(), Some(cluster.member(0).id()));
    }

    #[tokio::test]
    async fn followers_learn_the_leader_from_heartbeats() {
        let cluster = Cluster::new(3);
        cluster.member(0).campaign().await.unwrap();
        cluster.member(0).replicate().await.unwrap();
        // the commit index travels with the following heartbeat
        assert_eq!(cluster.member(1).log().commit_index(), 0);
        cluster.member(0).replicate().await.unwrap();
        for i in 1..3 {
            let status = cluster.member(i).status().await.unwrap();
            assert_eq!(status.leader, Some(cluster.member(0).id()));
            assert_eq!(status.commit_index, 1);
        }
    }

    #[tokio::test]
    async fn pre_vote_keeps_a_live_leader_in_place() {
        let cluster = Cluster::new(3);
        cluster.member(0).campaign().await.unwrap();
        cluster.member(0).replicate().await.unwrap();

        assert!(!cluster.member(2).campaign().await.unwrap());
        // the failed pre-vote does not bump anyone's term
        for member in &cluster.members {
            assert_eq!(member.log().term(), 1);
        }
        assert_eq!(cluster.roles().await[0], MemberRole::Leader);
    }

    #[tokio::test]
    async fn minority_cannot_elect() {
        let cluster = Cluster::new(3);
        cluster.network.isolate(addr(1));
        assert!(!cluster.member(0).campaign().await.unwrap());
        assert_eq!(cluster.member(0).log().term(), 0);
        assert_eq!(cluster.roles().await[0], MemberRole::Follower);
    }

    #[tokio::test]
    async fn outdated_log_loses_the_vote() {
        let cluster = Cluster::new(3);
        cluster.member(0).campaign().await.unwrap();
        cluster.network.isolate(addr(3));
        cluster.member(0).propose(&b"a"[..]).await.unwrap();
        cluster.member(0).propose(&b"b"[..]).await.unwrap();
        cluster.network.isolate(addr(1));
        cluster.network.heal(addr(3));

        // member 3 missed two entries, member 2 refuses it
        let reply = cluster
            .member(1)
            .handle(RaftMessage::Vote {
                sender: cluster.member(2).id(),
                term: 5,
                last_log_index: 1,
                last_log_term: 1,
            })
            .await
            .unwrap();
        assert_eq!(reply, RaftReply::Vote(raft_core::Reply::new(5, false)));
    }
}

// =============================================================================
// SECTION 2: REPLICATION
// =============================================================================

mod replication {
    use super::*;

    #[tokio::test]
    async fn proposals_reach_every_log() {
        let cluster = Cluster::new(3);
        cluster.member(0).campaign().await.unwrap();
        let mut last = 0;
        for i in 0..5u8 {
            last = cluster.member(0).propose(vec![i]).await.unwrap();
        }
        assert_eq!(last, 6);
        cluster.member(0).replicate().await.unwrap();
        for member in &cluster.members {
            assert_eq!(member.log().last_index(), 6);
            assert_eq!(member.log().commit_index(), 6);
            assert_eq!(&member.log().read(4).await.unwrap().command[..], &[2]);
        }
    }

    #[tokio::test]
    async fn lagging_follower_catches_up() {
        let cluster = Cluster::new(3);
        cluster.member(0).campaign().await.unwrap();
        cluster.network.isolate(addr(3));
        for i in 0..10u8 {
            cluster.member(0).propose(vec![i]).await.unwrap();
        }
        assert_eq!(cluster.member(0).log().commit_index(), 11);
        assert_eq!(cluster.member(2).log().last_index(), 0);

        cluster.network.heal(addr(3));
        cluster.member(0).replicate().await.unwrap();
        assert_eq!(cluster.member(2).log().last_index(), 11);
        assert_eq!(cluster.member(2).log().commit_index(), 11);
    }

    #[tokio::test]
    async fn commit_waiters_are_released() {
        let cluster = Cluster::new(3);
        cluster.member(0).campaign().await.unwrap();
        let follower = cluster.member(1).clone();
        let waiter = tokio::spawn(async move {
            follower
                .log()
                .wait_for_commit(3, Some(Duration::from_secs(5)), None)
                .await
        });
        cluster.member(0).propose(&b"one"[..]).await.unwrap();
        cluster.member(0).propose(&b"two"[..]).await.unwrap();
        // followers learn the commit index on the next heartbeat
        cluster.member(0).replicate().await.unwrap();
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn uncommitted_suffix_of_a_deposed_leader_is_replaced() {
        let cluster = Cluster::new(3);
        cluster.member(0).campaign().await.unwrap();
        cluster.member(0).replicate().await.unwrap();

        // the old leader appends alone
        cluster.network.isolate(addr(1));
        let _ = cluster.member(0).propose(&b"lost"[..]).await;
        assert_eq!(cluster.member(0).log().last_index(), 2);
        assert_eq!(cluster.member(0).log().commit_index(), 1);

        // a new leader takes over in the majority
        tokio::time::sleep(Duration::from_millis(160)).await;
        assert!(cluster.member(1).campaign().await.unwrap());
        cluster.member(1).propose(&b"kept"[..]).await.unwrap();

        cluster.network.heal(addr(1));
        cluster.member(1).replicate().await.unwrap();
        let entry = cluster.member(0).log().read(3).await.unwrap();
        assert_eq!(&entry.command[..], b"kept");
        assert_eq!(cluster.member(0).log().read(2).await.unwrap().term, 2);
        assert_eq!(cluster.member(0).status().await.unwrap().role, MemberRole::Follower);
    }
}

// =============================================================================
// SECTION 3: CATCH-UP BY SNAPSHOT
// =============================================================================

mod snapshots {
    use super::*;

    #[tokio::test]
    async fn compacted_leader_installs_its_snapshot() {
        let cluster = Cluster::new(3);
        cluster.member(0).campaign().await.unwrap();
        cluster.network.isolate(addr(3));
        for i in 0..10u8 {
            cluster.member(0).propose(vec![i]).await.unwrap();
        }
        let snapshot_index = cluster.member(0).log().force_compaction(8).await.unwrap();
        assert_eq!(snapshot_index, 8);

        cluster.network.heal(addr(3));
        cluster.member(0).replicate().await.unwrap();
        let follower = cluster.member(2).log();
        assert_eq!(follower.snapshot_index(), 8);
        assert_eq!(follower.last_index(), 11);
        assert_eq!(follower.commit_index(), 11);
        let snapshot = follower.read_snapshot().await.unwrap().unwrap();
        assert_eq!(&snapshot.command[..], &8u64.to_le_bytes());
    }
}

// =============================================================================
// SECTION 4: TERM SAFETY
// =============================================================================

mod term_safety {
    use super::*;

    #[tokio::test]
    async fn stale_leader_steps_down_on_higher_term() {
        let cluster = Cluster::new(3);
        cluster.member(0).campaign().await.unwrap();
        cluster.member(1).log().update_term(7, true).await.unwrap();

        let result = cluster.member(0).replicate().await;
        assert!(matches!(result, Err(ClusterError::NotLeader { .. })));
        let status = cluster.member(0).status().await.unwrap();
        assert_eq!(status.role, MemberRole::Follower);
        assert_eq!(status.term, 7);
    }

    #[tokio::test]
    async fn append_from_old_term_is_rejected() {
        let cluster = Cluster::new(3);
        cluster.member(1).log().update_term(3, false).await.unwrap();
        let reply = cluster
            .member(1)
            .handle(RaftMessage::AppendEntries {
                sender: cluster.member(0).id(),
                term: 2,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![LogEntry::new(2, 1, vec![1])],
                commit_index: 1,
            })
            .await
            .unwrap();
        assert_eq!(reply, RaftReply::AppendEntries(raft_core::Reply::new(3, false)));
        assert_eq!(cluster.member(1).log().last_index(), 0);
    }

    #[tokio::test]
    async fn gap_in_the_log_is_refused() {
        let cluster = Cluster::new(3);
        let reply = cluster
            .member(1)
            .handle(RaftMessage::AppendEntries {
                sender: cluster.member(0).id(),
                term: 1,
                prev_log_index: 4,
                prev_log_term: 1,
                entries: Vec::new(),
                commit_index: 4,
            })
            .await
            .unwrap();
        assert_eq!(reply, RaftReply::AppendEntries(raft_core::Reply::new(1, false)));
        // the leader is still recognized
        assert_eq!(
            cluster.member(1).status().await.unwrap().leader,
            Some(cluster.member(0).id())
        );
    }
}

// =============================================================================
// SECTION 5: SERVICE SURFACE
// =============================================================================

mod service_surface {
    use super::*;

    #[tokio::test]
    async fn synchronize_answers_only_from_the_leader() {
        let cluster = Cluster::new(3);
        cluster.member(0).campaign().await.unwrap();
        cluster.member(0).replicate().await.unwrap();
        let ask = |i: usize| {
            let member = cluster.member(i).clone();
            async move {
                member
                    .handle(RaftMessage::Synchronize {
                        sender: ClusterMemberId::default(),
                    })
                    .await
                    .unwrap()
            }
        };
        assert_eq!(ask(0).await, RaftReply::Synchronize(Some(1)));
        assert_eq!(ask(1).await, RaftReply::Synchronize(None));
    }

    #[tokio::test]
    async fn follower_can_ask_the_leader_to_resign() {
        let cluster = Cluster::new(3);
        cluster.member(0).campaign().await.unwrap();
        cluster.member(0).replicate().await.unwrap();
        assert!(cluster.member(1).request_resignation().await.unwrap());
        assert_eq!(cluster.roles().await[0], MemberRole::Follower);
        assert!(matches!(
            cluster.member(0).propose(&b"x"[..]).await,
            Err(ClusterError::NotLeader { .. })
        ));
    }
}

// =============================================================================
// SECTION 6: RUNNING MEMBERS OVER TCP
// =============================================================================

mod running {
    use super::*;

    fn free_ports(count: usize) -> Vec<SocketAddr> {
        let listeners: Vec<_> = (0..count)
            .map(|_| std::net::TcpListener::bind("127.0.0.1:0").unwrap())
            .collect();
        listeners.iter().map(|l| l.local_addr().unwrap()).collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn three_members_elect_and_commit() {
        init_tracing();
        let endpoints = free_ports(3);
        let dirs: Vec<_> = (0..3).map(|_| tempfile::tempdir().unwrap()).collect();
        let mut handles = Vec::new();
        for (endpoint, dir) in endpoints.iter().zip(&dirs) {
            let config = ClusterConfig {
                endpoint: *endpoint,
                members: endpoints.clone(),
                raft: RaftConfig::default(),
                transport: TransportConfig::default(),
                log: LogOptions::new(dir.path()),
            };
            handles.push(ClusterHandle::start(config).await.unwrap());
        }

        let index = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                for handle in &handles {
                    if let Ok(index) = handle.member().propose(&b"hello"[..]).await {
                        return index;
                    }
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .unwrap();

        for handle in &handles {
            handle
                .member()
                .log()
                .wait_for_commit(index, Some(Duration::from_secs(5)), None)
                .await
                .unwrap();
        }
        let leaders = {
            let mut count = 0;
            for handle in &handles {
                if handle.member().status().await.unwrap().role == MemberRole::Leader {
                    count += 1;
                }
            }
            count
        };
        assert!(leaders <= 1);

        for handle in handles {
            handle.shutdown().await.unwrap();
        }
    }
}
