//! # member
//!
//! why: members need a compact identity that is stable across restarts
//! relations: stored in the node state record as the vote, sent as exchange sender identity
//! what: ClusterMemberId derived from a socket address

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

const FAMILY_INET: i32 = 2;
const FAMILY_INET6: i32 = 23;

/// fixed-size identifier of a cluster member
///
/// layout (little-endian):
/// - [0, 16)  address, ipv4 stored as ipv4-mapped ipv6
/// - [16, 20) port
/// - [20, 24) length of the original address in bytes
/// - [24, 28) address family
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterMemberId([u8; ClusterMemberId::SIZE]);

impl ClusterMemberId {
    pub const SIZE: usize = 28;

    pub fn from_bytes(bytes: [u8; Self::SIZE]) -> Self {
        Self(bytes)
    }

    /// read an id from the front of `buf`
    pub fn read_from(buf: &[u8]) -> Result<Self> {
        let bytes: [u8; Self::SIZE] = buf
            .get(..Self::SIZE)
            .and_then(|s| s.try_into().ok())
            .ok_or(Error::BufferTooSmall {
                needed: Self::SIZE,
                actual: buf.len(),
            })?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; Self::SIZE] {
        &self.0
    }

    /// copy the id into `buf`, returning the number of bytes written
    pub fn write_to(&self, buf: &mut [u8]) -> Result<usize> {
        let actual = buf.len();
        let dest = buf.get_mut(..Self::SIZE).ok_or(Error::BufferTooSmall {
            needed: Self::SIZE,
            actual,
        })?;
        dest.copy_from_slice(&self.0);
        Ok(Self::SIZE)
    }

    /// recover the endpoint this id was derived from
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        let octets: [u8; 16] = self.0[..16].try_into().ok()?;
        let port = i32::from_le_bytes(self.0[16..20].try_into().ok()?);
        let family = i32::from_le_bytes(self.0[24..28].try_into().ok()?);
        let port = u16::try_from(port).ok()?;
        let v6 = Ipv6Addr::from(octets);
        let ip = match family {
            FAMILY_INET => IpAddr::V4(v6.to_ipv4_mapped()?),
            FAMILY_INET6 => IpAddr::V6(v6),
            _ => return None,
        };
        Some(SocketAddr::new(ip, port))
    }
}

impl From<SocketAddr> for ClusterMemberId {
    fn from(addr: SocketAddr) -> Self {
        let (octets, len, family) = match addr.ip() {
            IpAddr::V4(v4) => (v4.to_ipv6_mapped().octets(), 4i32, FAMILY_INET),
            IpAddr::V6(v6) => (v6.octets(), 16i32, FAMILY_INET6),
        };
        let mut bytes = [0u8; Self::SIZE];
        bytes[..16].copy_from_slice(&octets);
        bytes[16..20].copy_from_slice(&i32::from(addr.port()).to_le_bytes());
        bytes[20..24].copy_from_slice(&len.to_le_bytes());
        bytes[24..28].copy_from_slice(&family.to_le_bytes());
        Self(bytes)
    }
}

impl Default for ClusterMemberId {
    fn default() -> Self {
        Self::from(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
    }
}

impl fmt::Display for ClusterMemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_socket_addr() {
            Some(addr) => write!(f, "{addr}"),
            None => {
                for byte in self.0 {
                    write!(f, "{byte:02X}")?;
                }
                Ok(())
            }
        }
    }
}

impl fmt::Debug for ClusterMemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClusterMemberId({self})")
    }
}
