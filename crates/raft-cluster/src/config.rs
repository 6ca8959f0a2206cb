//! # config
//!
//! why: one file describes a member: who it is, who its peers are, and how each layer is tuned
//! relations: aggregates RaftConfig, TransportConfig and LogOptions; consumed by launch.rs
//! what: ClusterConfig with json loading and validation

use crate::error::Result;
use raft_core::{ClusterMemberId, RaftConfig};
use raft_storage::LogOptions;
use raft_transport::TransportConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// address this member listens on, also its identity
    pub endpoint: SocketAddr,
    /// every member of the cluster, including this one
    pub members: Vec<SocketAddr>,
    #[serde(default)]
    pub raft: RaftConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub log: LogOptions,
}

impl ClusterConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.raft.validate()?;
        self.transport.validate()?;
        self.log.validate()?;
        if !self.members.contains(&self.endpoint) {
            return Err(invalid(format!("members do not include the local endpoint {}", self.endpoint)));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = self.members.iter().find(|m| !seen.insert(**m)) {
            return Err(invalid(format!("member {dup} is listed twice")));
        }
        Ok(())
    }

    pub fn id(&self) -> ClusterMemberId {
        ClusterMemberId::from(self.endpoint)
    }

    pub fn peers(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        self.members.iter().copied().filter(move |m| *m != self.endpoint)
    }
}

fn invalid(message: String) -> crate::ClusterError {
    raft_core::Error::InvalidConfig(message).into()
}
