//! # raft-transport
//!
//! why: members exchange raft requests over whichever carrier the deployment allows
//! relations: encodes raft-core messages, awaits replies through raft-sync, served by raft-cluster
//! what: packet framing, exchange state machines, tcp (optionally tls), udp and http transports

pub mod codec;
mod config;
mod error;
pub mod exchange;
pub mod http;
pub mod packet;
mod service;
mod tcp;
mod udp;

pub use config::{ByteOrder, TransportConfig, MIN_TRANSMISSION_BLOCK_SIZE};
pub use error::{Result, TransportError};
pub use exchange::{ClientExchange, ClientState, ServerExchange, ServerState, MAX_MESSAGE_SIZE};
pub use http::{router, HttpClient};
pub use packet::{FlowControl, MessageType, Packet, PacketHeaders, PacketStream, PACKET_PROLOGUE_SIZE};
pub use service::{RaftClient, RaftService};
pub use tcp::{TcpClient, TcpServer, TlsClientOptions};
pub use udp::{UdpClient, UdpServer};

// re-exported so callers can build tls configs against the same version
pub use rustls;
