//! # config
//!
//! why: timing knobs for elections and heartbeats
//! relations: consumed by node.rs for randomized timeouts and by raft-cluster's driver loop
//! what: RaftConfig with validation

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Election and heartbeat timing, all values in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    pub election_timeout_min: u64,
    pub election_timeout_max: u64,
    pub heartbeat_interval: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
        }
    }
}

impl RaftConfig {
    /// reject timings that would make elections unstable
    pub fn validate(&self) -> Result<()> {
        if self.election_timeout_min == 0 {
            return Err(Error::InvalidConfig(
                "election_timeout_min must be positive".into(),
            ));
        }
        if self.election_timeout_min > self.election_timeout_max {
            return Err(Error::InvalidConfig(format!(
                "election timeout bounds are inverted: {} > {}",
                self.election_timeout_min, self.election_timeout_max
            )));
        }
        if self.heartbeat_interval == 0 || self.heartbeat_interval >= self.election_timeout_min {
            return Err(Error::InvalidConfig(format!(
                "heartbeat_interval {} must be positive and below election_timeout_min {}",
                self.heartbeat_interval, self.election_timeout_min
            )));
        }
        Ok(())
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert!(RaftConfig::default().validate().is_ok());
    }

    #[test]
    fn inverted_bounds_rejected() {
        let config = RaftConfig {
            election_timeout_min: 300,
            election_timeout_max: 150,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn heartbeat_must_be_below_election_timeout() {
        let config = RaftConfig {
            heartbeat_interval: 200,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
