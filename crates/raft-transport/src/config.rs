//! # config
//!
//! why: framing and timeouts must agree between peers and be checked before any socket opens
//! relations: shared by tcp.rs, udp.rs and http.rs; embedded in raft-cluster's ClusterConfig
//! what: TransportConfig, ByteOrder

use crate::error::{Result, TransportError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// smallest accepted transmission block
pub const MIN_TRANSMISSION_BLOCK_SIZE: usize = 300;

/// byte order of the 4-byte payload length in the packet prologue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    #[default]
    Big,
    Little,
}

impl ByteOrder {
    pub fn encode_u32(self, value: u32) -> [u8; 4] {
        match self {
            Self::Big => value.to_be_bytes(),
            Self::Little => value.to_le_bytes(),
        }
    }

    pub fn decode_u32(self, bytes: [u8; 4]) -> u32 {
        match self {
            Self::Big => u32::from_be_bytes(bytes),
            Self::Little => u32::from_le_bytes(bytes),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// largest payload carried by a single packet
    pub transmission_block_size: usize,
    pub length_order: ByteOrder,
    /// time allowed for one request/reply exchange
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            transmission_block_size: 1400,
            length_order: ByteOrder::Big,
            request_timeout_ms: 1000,
            connect_timeout_ms: 500,
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> Result<()> {
        if self.transmission_block_size < MIN_TRANSMISSION_BLOCK_SIZE {
            return Err(TransportError::InvalidConfig(format!(
                "transmission_block_size must be at least {MIN_TRANSMISSION_BLOCK_SIZE}, got {}",
                self.transmission_block_size
            )));
        }
        if u32::try_from(self.transmission_block_size).is_err() {
            return Err(TransportError::InvalidConfig(
                "transmission_block_size does not fit the length field".into(),
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err(TransportError::InvalidConfig("request_timeout_ms must be > 0".into()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_size_has_a_floor() {
        let config = TransportConfig {
            transmission_block_size: 299,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(TransportError::InvalidConfig(_))));
        let config = TransportConfig {
            transmission_block_size: 300,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn length_order_round_trips() {
        assert_eq!(ByteOrder::Big.encode_u32(1), [0, 0, 0, 1]);
        assert_eq!(ByteOrder::Little.encode_u32(1), [1, 0, 0, 0]);
        assert_eq!(ByteOrder::Little.decode_u32([0, 1, 0, 0]), 256);
    }

    #[test]
    fn loads_from_json() {
        let config: TransportConfig =
            serde_json::from_str(r#"{"length_order": "little", "request_timeout_ms": 20}"#).unwrap();
        assert_eq!(config.length_order, ByteOrder::Little);
        assert_eq!(config.transmission_block_size, 1400);
        assert_eq!(config.request_timeout(), Duration::from_millis(20));
    }
}
