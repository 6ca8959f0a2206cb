//! # raft-cluster
//!
//! why: the log, the synchronizers and the transports only become consensus once something drives them
//! relations: consumes raft-core, raft-storage and raft-transport
//! what: RaftMember service and driver, ClusterConfig, ClusterHandle

mod config;
mod error;
mod launch;
mod member;

pub use config::ClusterConfig;
pub use error::{ClusterError, Result};
pub use launch::ClusterHandle;
pub use member::{MemberStatus, RaftMember};
