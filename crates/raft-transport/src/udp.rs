//! # udp
//!
//! why: small vote and heartbeat requests fit a single datagram and need no connection state
//! relations: frames with packet.rs and codec.rs, pending replies use raft-sync's CompletionPool
//! what: UdpServer, UdpClient; datagram = [correlation u64 LE][packet]

use crate::codec;
use crate::config::TransportConfig;
use crate::error::{Result, TransportError};
use crate::exchange::complete_from_packet;
use crate::packet::{decode_packet, encode_packet, FlowControl, MessageType, PacketHeaders, PACKET_PROLOGUE_SIZE};
use crate::service::{RaftClient, RaftService};
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use raft_core::{RaftMessage, RaftReply};
use raft_sync::{CompletionPool, CompletionSource, WaitError};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const CORRELATION_SIZE: usize = 8;

fn datagram_capacity(config: &TransportConfig) -> usize {
    CORRELATION_SIZE + PACKET_PROLOGUE_SIZE + config.transmission_block_size
}

fn encode_datagram(
    correlation: u64,
    headers: PacketHeaders,
    payload: &[u8],
    config: &TransportConfig,
) -> Result<Bytes> {
    if payload.len() > config.transmission_block_size {
        return Err(TransportError::PacketTooLarge {
            size: payload.len(),
            limit: config.transmission_block_size,
        });
    }
    let mut buf = BytesMut::with_capacity(CORRELATION_SIZE + PACKET_PROLOGUE_SIZE + payload.len());
    buf.put_u64_le(correlation);
    encode_packet(headers, payload, config.length_order, &mut buf)?;
    Ok(buf.freeze())
}

fn split_datagram(mut raw: Bytes) -> Result<(u64, Bytes)> {
    if raw.len() < CORRELATION_SIZE {
        return Err(TransportError::protocol("datagram shorter than its correlation id"));
    }
    let correlation = raw.get_u64_le();
    Ok((correlation, raw))
}

// -- server --

pub struct UdpServer {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl UdpServer {
    pub async fn bind(addr: SocketAddr, config: TransportConfig, service: Arc<dyn RaftService>) -> Result<Self> {
        config.validate()?;
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;
        info!(%local_addr, "udp transport listening");
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(serve(socket, config, service, shutdown.clone()));
        Ok(Self {
            local_addr,
            shutdown,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        let _ = (&mut self.task).await;
    }
}

impl Drop for UdpServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn serve(socket: Arc<UdpSocket>, config: TransportConfig, service: Arc<dyn RaftService>, shutdown: CancellationToken) {
    let mut buf = vec![0u8; datagram_capacity(&config)];
    loop {
        let received = tokio::select! {
            received = socket.recv_from(&mut buf) => received,
            _ = shutdown.cancelled() => break,
        };
        let (len, peer) = match received {
            Ok(received) => received,
            Err(err) => {
                warn!(error = %err, "udp receive failed");
                continue;
            }
        };
        let datagram = Bytes::copy_from_slice(&buf[..len]);
        let socket = Arc::clone(&socket);
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            if let Err(err) = answer(&socket, peer, datagram, config, service).await {
                debug!(%peer, error = %err, "dropped udp request");
            }
        });
    }
    info!("udp transport stopped");
}

async fn answer(
    socket: &UdpSocket,
    peer: SocketAddr,
    datagram: Bytes,
    config: TransportConfig,
    service: Arc<dyn RaftService>,
) -> Result<()> {
    let (correlation, raw) = split_datagram(datagram)?;
    let packet = decode_packet(raw, config.length_order, config.transmission_block_size)?;
    if packet.headers.control != FlowControl::None {
        return Err(TransportError::protocol(format!(
            "{:?} packets are not supported over udp",
            packet.headers.control
        )));
    }
    let kind = packet.headers.message_type;
    let message = codec::decode_message(kind, packet.payload)?;
    let (control, payload) = match service.handle(message).await {
        Ok(reply) if codec::reply_type(&reply) == kind => (FlowControl::Ack, codec::encode_reply(&reply)),
        Ok(_) => (FlowControl::Cancel, Bytes::from_static(b"mismatched reply")),
        Err(err) => {
            warn!(%peer, error = %err, "service failed");
            let reason = err.to_string();
            let len = reason.len().min(config.transmission_block_size);
            (FlowControl::Cancel, Bytes::copy_from_slice(&reason.as_bytes()[..len]))
        }
    };
    let reply = encode_datagram(correlation, PacketHeaders::new(kind, control), &payload, &config)?;
    socket.send_to(&reply, peer).await?;
    Ok(())
}

// -- client --

struct PendingReply {
    source: CompletionSource<Bytes>,
    generation: u64,
    expected: MessageType,
}

type PendingMap = Arc<Mutex<HashMap<u64, PendingReply>>>;

/// frees a correlation id when its exchange finishes or is dropped
struct PendingSlot<'a> {
    pending: &'a Mutex<HashMap<u64, PendingReply>>,
    correlation: u64,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.correlation);
    }
}

/// Datagram client for one member
///
/// Requests are independent; replies are matched by correlation id, and a
/// lost datagram surfaces as a timeout.
pub struct UdpClient {
    endpoint: SocketAddr,
    config: TransportConfig,
    socket: Arc<UdpSocket>,
    pending: PendingMap,
    next_correlation: AtomicU64,
    pool: Arc<CompletionPool<Bytes>>,
    reader: JoinHandle<()>,
}

impl UdpClient {
    pub async fn connect(endpoint: SocketAddr, config: TransportConfig) -> Result<Self> {
        config.validate()?;
        let local: SocketAddr = if endpoint.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = Arc::new(UdpSocket::bind(local).await?);
        socket.connect(endpoint).await?;
        let pending: PendingMap = Arc::default();
        let reader = tokio::spawn(read_replies(Arc::clone(&socket), Arc::clone(&pending), config));
        Ok(Self {
            endpoint,
            config,
            socket,
            pending,
            next_correlation: AtomicU64::new(1),
            pool: CompletionPool::new(16),
            reader,
        })
    }

    /// exchanges still waiting for a reply
    pub fn in_flight(&self) -> usize {
        self.pending.lock().len()
    }
}

impl Drop for UdpClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_replies(socket: Arc<UdpSocket>, pending: PendingMap, config: TransportConfig) {
    let mut buf = vec![0u8; datagram_capacity(&config)];
    loop {
        let len = match socket.recv(&mut buf).await {
            Ok(len) => len,
            Err(err) => {
                // an unreachable peer surfaces here on some platforms; the request times out
                debug!(error = %err, "udp receive failed");
                continue;
            }
        };
        let parsed = split_datagram(Bytes::copy_from_slice(&buf[..len])).and_then(|(correlation, raw)| {
            decode_packet(raw, config.length_order, config.transmission_block_size).map(|p| (correlation, p))
        });
        let (correlation, packet) = match parsed {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(error = %err, "discarding malformed reply");
                continue;
            }
        };
        let waiting = pending.lock().remove(&correlation);
        match waiting {
            Some(waiting) => {
                complete_from_packet(&waiting.source, waiting.generation, waiting.expected, packet);
            }
            None => debug!(correlation, "late reply"),
        }
    }
}

#[async_trait]
impl RaftClient for UdpClient {
    fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    async fn exchange(&self, message: RaftMessage, cancellation: Option<CancellationToken>) -> Result<RaftReply> {
        let kind = codec::message_type(&message);
        let correlation = self.next_correlation.fetch_add(1, Ordering::Relaxed);
        let datagram = encode_datagram(
            correlation,
            PacketHeaders::new(kind, FlowControl::None),
            &codec::encode_message(&message)?,
            &self.config,
        )?;

        let source = self.pool.rent();
        let generation = source.generation();
        let wait = source.wait(generation, Some(self.config.request_timeout()), cancellation)?;
        self.pending.lock().insert(
            correlation,
            PendingReply {
                source,
                generation,
                expected: kind,
            },
        );
        let slot = PendingSlot {
            pending: &self.pending,
            correlation,
        };

        let outcome = match self.socket.send(&datagram).await {
            Ok(_) => wait.await.map_err(TransportError::from),
            Err(err) => Err(err.into()),
        };
        drop(slot);
        let payload = match outcome {
            Ok(payload) => payload,
            Err(TransportError::Wait(WaitError::Timeout)) => {
                debug!(endpoint = %self.endpoint, request = message.name(), "udp request timed out");
                return Err(TransportError::Wait(WaitError::Timeout));
            }
            Err(err) => return Err(err),
        };
        codec::decode_reply(kind, payload)
    }
}
