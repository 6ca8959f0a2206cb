//! # raft-core
//!
//! why: shared vocabulary for every layer of the replicated log
//! relations: used by raft-storage for persistence, raft-transport for the wire, raft-cluster for consensus
//! what: member ids, log entries, rpc messages, role state machine, configuration

pub mod config;
pub mod error;
pub mod log;
pub mod member;
pub mod message;
pub mod node;

pub use config::RaftConfig;
pub use error::{Error, Result};
pub use log::LogEntry;
pub use member::ClusterMemberId;
pub use message::{RaftMessage, RaftReply, Reply};
pub use node::{MemberRole, RaftNode};
