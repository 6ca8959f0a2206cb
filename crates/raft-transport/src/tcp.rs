//! # tcp
//!
//! why: members keep one long-lived stream per peer for vote and replication traffic
//! relations: frames with packet.rs, runs exchange.rs state machines, serves a RaftService
//! what: TcpServer (optionally TLS), TcpClient with a lock-guarded persistent connection

use crate::config::TransportConfig;
use crate::error::{Result, TransportError};
use crate::exchange::{complete_from_packet, ClientExchange, ServerExchange};
use crate::packet::{MessageType, PacketHeaders, PacketStream};
use crate::service::{RaftClient, RaftService};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use raft_core::{RaftMessage, RaftReply};
use raft_sync::{AsyncExclusiveLock, CompletionPool, CompletionSource, WaitError};
use rustls::pki_types::ServerName;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for S {}

type BoxStream = Box<dyn AsyncStream>;

/// run `future` under a timeout and an optional cancellation token
async fn bounded<T>(
    future: impl Future<Output = Result<T>>,
    timeout: Duration,
    cancellation: Option<&CancellationToken>,
) -> Result<T> {
    let timed = async {
        tokio::time::timeout(timeout, future)
            .await
            .map_err(|_| TransportError::Wait(WaitError::Timeout))?
    };
    match cancellation {
        Some(token) => tokio::select! {
            result = timed => result,
            _ = token.cancelled() => Err(TransportError::Wait(WaitError::Canceled)),
        },
        None => timed.await,
    }
}

// -- server --

/// Accepts member connections and answers their requests
pub struct TcpServer {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl TcpServer {
    pub async fn bind(
        addr: SocketAddr,
        config: TransportConfig,
        service: Arc<dyn RaftService>,
        tls: Option<Arc<rustls::ServerConfig>>,
    ) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, tls = tls.is_some(), "tcp transport listening");

        let shutdown = CancellationToken::new();
        let acceptor = tls.map(TlsAcceptor::from);
        let task = tokio::spawn(accept_loop(listener, config, service, acceptor, shutdown.clone()));
        Ok(Self {
            local_addr,
            shutdown,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// stop accepting and close every served connection
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        let _ = (&mut self.task).await;
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    config: TransportConfig,
    service: Arc<dyn RaftService>,
    acceptor: Option<TlsAcceptor>,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.cancelled() => break,
        };
        match accepted {
            Ok((stream, peer)) => {
                debug!(%peer, "accepted connection");
                let service = Arc::clone(&service);
                let acceptor = acceptor.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(err) = serve_connection(stream, config, service, acceptor, shutdown).await {
                        warn!(%peer, error = %err, "connection closed with error");
                    }
                });
            }
            Err(err) => warn!(error = %err, "failed to accept connection"),
        }
    }
    info!("tcp transport stopped");
}

async fn serve_connection(
    stream: TcpStream,
    config: TransportConfig,
    service: Arc<dyn RaftService>,
    acceptor: Option<TlsAcceptor>,
    shutdown: CancellationToken,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let stream: BoxStream = match acceptor {
        Some(acceptor) => Box::new(acceptor.accept(stream).await?),
        None => Box::new(stream),
    };
    let mut packets = PacketStream::new(stream, config.length_order, config.transmission_block_size);
    let mut exchange = ServerExchange::new();
    loop {
        let packet = tokio::select! {
            packet = packets.read_packet() => packet?,
            _ = shutdown.cancelled() => return Ok(()),
        };
        let Some(packet) = packet else {
            return Ok(());
        };
        let Some(message) = exchange.on_packet(packet)? else {
            continue;
        };
        let name = message.name();
        let (headers, payload) = match service.handle(message).await {
            Ok(reply) => exchange.reply(&reply)?,
            Err(err) => {
                warn!(request = name, error = %err, "service failed");
                exchange
                    .reject(&err.to_string())
                    .ok_or_else(|| TransportError::protocol("no request to reject"))?
            }
        };
        packets.write_packet(headers, &payload).await?;
    }
}

// -- client --

/// client-side TLS settings; the config is built by the caller
#[derive(Clone)]
pub struct TlsClientOptions {
    pub config: Arc<rustls::ClientConfig>,
    pub server_name: ServerName<'static>,
}

struct PendingReply {
    source: CompletionSource<Bytes>,
    generation: u64,
    expected: MessageType,
}

type PendingSlot = Arc<Mutex<Option<PendingReply>>>;

struct Connection {
    writer: PacketStream<WriteHalf<BoxStream>>,
    pending: PendingSlot,
    reader: JoinHandle<()>,
}

impl Connection {
    fn is_alive(&self) -> bool {
        !self.reader.is_finished()
    }

    async fn send(&mut self, packets: Vec<(PacketHeaders, Bytes)>) -> Result<()> {
        for (headers, payload) in packets {
            self.writer.write_packet(headers, &payload).await?;
        }
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// dispatch inbound packets to the pending exchange until the stream ends
async fn read_replies(mut reader: PacketStream<ReadHalf<BoxStream>>, pending: PendingSlot) {
    loop {
        let result = reader.read_packet().await;
        let waiting = pending.lock().take();
        let packet = match result {
            Ok(Some(packet)) => packet,
            Ok(None) => {
                let closed = io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by peer");
                if let Some(waiting) = waiting {
                    waiting
                        .source
                        .try_set_error(waiting.generation, WaitError::faulted(TransportError::Io(closed)));
                }
                return;
            }
            Err(err) => {
                if let Some(waiting) = waiting {
                    waiting.source.try_set_error(waiting.generation, WaitError::faulted(err));
                }
                return;
            }
        };
        match waiting {
            Some(waiting) => {
                complete_from_packet(&waiting.source, waiting.generation, waiting.expected, packet);
            }
            None => warn!(control = ?packet.headers.control, "dropping unsolicited packet"),
        }
    }
}

/// Persistent stream connection to one member
///
/// The connection is guarded by an async lock, so exchanges on one client run
/// one at a time in arrival order. A failed or abandoned exchange drops the
/// connection and the next call reconnects.
pub struct TcpClient {
    endpoint: SocketAddr,
    config: TransportConfig,
    tls: Option<TlsClientOptions>,
    connection: AsyncExclusiveLock<Option<Connection>>,
    pool: Arc<CompletionPool<Bytes>>,
}

impl TcpClient {
    pub fn new(endpoint: SocketAddr, config: TransportConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            endpoint,
            config,
            tls: None,
            connection: AsyncExclusiveLock::new(None),
            pool: CompletionPool::new(4),
        })
    }

    pub fn with_tls(endpoint: SocketAddr, config: TransportConfig, tls: TlsClientOptions) -> Result<Self> {
        Ok(Self {
            tls: Some(tls),
            ..Self::new(endpoint, config)?
        })
    }

    /// true when a live connection is cached and not in use
    pub fn is_connected(&self) -> bool {
        self.connection
            .try_lock()
            .is_some_and(|guard| guard.as_ref().is_some_and(Connection::is_alive))
    }

    /// drop the cached connection, waiting for an exchange in flight
    pub async fn disconnect(&self) -> Result<()> {
        *self.connection.lock().await? = None;
        Ok(())
    }

    async fn connect(&self) -> Result<Connection> {
        let stream = TcpStream::connect(self.endpoint).await?;
        stream.set_nodelay(true)?;
        let stream: BoxStream = match &self.tls {
            Some(tls) => Box::new(
                TlsConnector::from(Arc::clone(&tls.config))
                    .connect(tls.server_name.clone(), stream)
                    .await?,
            ),
            None => Box::new(stream),
        };
        let (read, write) = tokio::io::split(stream);
        let order = self.config.length_order;
        let block = self.config.transmission_block_size;
        let pending: PendingSlot = Arc::new(Mutex::new(None));
        let reader = tokio::spawn(read_replies(PacketStream::new(read, order, block), Arc::clone(&pending)));
        debug!(endpoint = %self.endpoint, tls = self.tls.is_some(), "connected");
        Ok(Connection {
            writer: PacketStream::new(write, order, block),
            pending,
            reader,
        })
    }
}

#[async_trait]
impl RaftClient for TcpClient {
    fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    async fn exchange(&self, message: RaftMessage, cancellation: Option<CancellationToken>) -> Result<RaftReply> {
        let mut exchange = ClientExchange::new(&message, self.pool.rent())?;
        let timeout = self.config.request_timeout();
        let mut guard = self.connection.lock_with(Some(timeout), cancellation.clone()).await?;
        let connection = match &mut *guard {
            Some(connection) if connection.is_alive() => connection,
            slot => slot.insert(bounded(self.connect(), self.config.connect_timeout(), cancellation.as_ref()).await?),
        };

        let wait = exchange.wait(Some(timeout), cancellation.clone())?;
        let (source, generation) = exchange.completion();
        *connection.pending.lock() = Some(PendingReply {
            source,
            generation,
            expected: exchange.message_type(),
        });

        let packets = exchange.packets(self.config.transmission_block_size);
        let outcome = match bounded(connection.send(packets), timeout, cancellation.as_ref()).await {
            Ok(()) => wait.await.map_err(TransportError::from),
            Err(err) => Err(err),
        };
        match outcome {
            Ok(payload) => exchange.decode_reply(payload),
            Err(err) => {
                // the peer may still answer later, so the stream cannot be reused
                *guard = None;
                debug!(endpoint = %self.endpoint, request = message.name(), error = %err, "dropped connection");
                Err(err)
            }
        }
    }
}
