//! # launch
//!
//! why: a configured member needs its log, peer clients, listener and driver wired and torn down in order
//! relations: reads ClusterConfig, opens raft-storage's log, serves over raft-transport's tcp server
//! what: ClusterHandle

use crate::config::ClusterConfig;
use crate::error::Result;
use crate::member::RaftMember;
use raft_storage::PersistentLog;
use raft_transport::{RaftClient, TcpClient, TcpServer};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// A running member: tcp listener plus consensus driver
pub struct ClusterHandle {
    member: Arc<RaftMember>,
    server: TcpServer,
    driver: JoinHandle<()>,
    shutdown: CancellationToken,
}

impl ClusterHandle {
    pub async fn start(config: ClusterConfig) -> Result<Self> {
        config.validate()?;
        let log = PersistentLog::open(config.log.clone())?;
        Self::start_with_log(config, log).await
    }

    /// start over an already opened log, e.g. one with a snapshot builder
    pub async fn start_with_log(config: ClusterConfig, log: PersistentLog) -> Result<Self> {
        config.validate()?;
        let peers = config
            .peers()
            .map(|peer| TcpClient::new(peer, config.transport).map(|c| Arc::new(c) as Arc<dyn RaftClient>))
            .collect::<raft_transport::Result<Vec<_>>>()?;
        let member = Arc::new(RaftMember::new(config.id(), Arc::new(log), config.raft.clone(), peers)?);
        let server = TcpServer::bind(config.endpoint, config.transport, member.clone(), None).await?;

        let shutdown = CancellationToken::new();
        let driver = tokio::spawn(Arc::clone(&member).run(shutdown.clone()));
        info!(endpoint = %config.endpoint, members = config.members.len(), "member started");
        Ok(Self {
            member,
            server,
            driver,
            shutdown,
        })
    }

    pub fn member(&self) -> &Arc<RaftMember> {
        &self.member
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    /// stop the driver and listener, then flush and close the log
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown.cancel();
        let _ = self.driver.await;
        self.server.shutdown().await;
        self.member.log().dispose_async().await?;
        info!(member = %self.member.id(), "member stopped");
        Ok(())
    }
}
