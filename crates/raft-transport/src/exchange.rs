//! # exchange
//!
//! why: one request/reply round trip spans several packets and must resolve exactly once
//! relations: client side awaits through raft-sync's CompletionSource; driven by tcp.rs
//! what: ClientExchange (Created -> AwaitingReply -> Completed), ServerExchange (Received -> ProcessingPayload -> ReplySent)

use crate::codec;
use crate::error::{Result, TransportError};
use crate::packet::{FlowControl, MessageType, Packet, PacketHeaders};
use bytes::{Bytes, BytesMut};
use raft_core::{RaftMessage, RaftReply};
use raft_sync::{CompletionSource, Wait, WaitError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// upper bound for a reassembled request
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

const MAX_REJECT_REASON: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Created,
    AwaitingReply,
    Completed,
}

/// Outbound request waiting for its Ack
pub struct ClientExchange {
    message_type: MessageType,
    request: Bytes,
    source: CompletionSource<Bytes>,
    generation: u64,
    state: ClientState,
}

impl ClientExchange {
    /// `source` must be freshly rented or reset
    pub fn new(message: &RaftMessage, source: CompletionSource<Bytes>) -> Result<Self> {
        let generation = source.generation();
        Ok(Self {
            message_type: codec::message_type(message),
            request: codec::encode_message(message)?,
            source,
            generation,
            state: ClientState::Created,
        })
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// handle that completes this exchange, for a reader task
    pub fn completion(&self) -> (CompletionSource<Bytes>, u64) {
        (self.source.clone(), self.generation)
    }

    /// split the request into packets of at most `block_size` payload bytes
    pub fn packets(&mut self, block_size: usize) -> Vec<(PacketHeaders, Bytes)> {
        self.state = ClientState::AwaitingReply;
        let block_size = block_size.max(1);
        if self.request.len() <= block_size {
            return vec![(
                PacketHeaders::new(self.message_type, FlowControl::None),
                self.request.clone(),
            )];
        }
        let count = self.request.len().div_ceil(block_size);
        (0..count)
            .map(|i| {
                let control = match i {
                    0 => FlowControl::StreamStart,
                    i if i + 1 == count => FlowControl::StreamEnd,
                    _ => FlowControl::Fragment,
                };
                let end = ((i + 1) * block_size).min(self.request.len());
                (
                    PacketHeaders::new(self.message_type, control),
                    self.request.slice(i * block_size..end),
                )
            })
            .collect()
    }

    /// register the waiter before any packet leaves
    pub fn wait(&self, timeout: Option<Duration>, cancellation: Option<CancellationToken>) -> Result<Wait<Bytes>> {
        Ok(self.source.wait(self.generation, timeout, cancellation)?)
    }

    /// feed an inbound packet; returns true when it resolved the exchange
    pub fn on_packet(&mut self, packet: Packet) -> bool {
        let resolved = complete_from_packet(&self.source, self.generation, self.message_type, packet);
        if resolved {
            self.state = ClientState::Completed;
        }
        resolved
    }

    pub fn fail(&mut self, error: WaitError) -> bool {
        self.state = ClientState::Completed;
        self.source.try_set_error(self.generation, error)
    }

    pub fn decode_reply(&self, payload: Bytes) -> Result<RaftReply> {
        codec::decode_reply(self.message_type, payload)
    }
}

/// resolve a pending exchange from a reply packet
///
/// `Ack` completes it with the payload, `Cancel` faults it; anything else is a
/// protocol fault.
pub(crate) fn complete_from_packet(
    source: &CompletionSource<Bytes>,
    generation: u64,
    expected: MessageType,
    packet: Packet,
) -> bool {
    match (packet.headers.control, packet.headers.message_type == expected) {
        (FlowControl::Ack, true) => source.try_set_result(generation, packet.payload),
        (FlowControl::Cancel, _) => {
            let reason = String::from_utf8_lossy(&packet.payload).into_owned();
            source.try_set_error(generation, WaitError::faulted(TransportError::Service(reason)))
        }
        (control, _) => source.try_set_error(
            generation,
            WaitError::faulted(TransportError::protocol(format!(
                "unexpected {control:?} packet of type {:?} while awaiting {expected:?}",
                packet.headers.message_type
            ))),
        ),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Received,
    ProcessingPayload,
    ReplySent,
}

/// Inbound request being reassembled
pub struct ServerExchange {
    message_type: Option<MessageType>,
    buffer: BytesMut,
    state: ServerState,
}

impl Default for ServerExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerExchange {
    pub fn new() -> Self {
        Self {
            message_type: None,
            buffer: BytesMut::new(),
            state: ServerState::ReplySent,
        }
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    /// feed a packet; returns the request once it is complete
    pub fn on_packet(&mut self, packet: Packet) -> Result<Option<RaftMessage>> {
        let kind = packet.headers.message_type;
        match packet.headers.control {
            FlowControl::None => {
                self.begin(kind);
                self.finish(kind, packet.payload).map(Some)
            }
            FlowControl::StreamStart => {
                self.begin(kind);
                self.push(&packet.payload)?;
                Ok(None)
            }
            FlowControl::Fragment | FlowControl::StreamEnd => {
                if self.state != ServerState::Received || self.message_type != Some(kind) {
                    return Err(TransportError::protocol(format!("{:?} without a stream start", packet.headers.control)));
                }
                self.push(&packet.payload)?;
                if packet.headers.control == FlowControl::Fragment {
                    return Ok(None);
                }
                let payload = self.buffer.split().freeze();
                self.finish(kind, payload).map(Some)
            }
            FlowControl::Cancel => {
                self.buffer.clear();
                self.message_type = None;
                self.state = ServerState::ReplySent;
                Ok(None)
            }
            FlowControl::Ack => Err(TransportError::protocol("ack sent to a server")),
        }
    }

    fn begin(&mut self, kind: MessageType) {
        self.buffer.clear();
        self.message_type = Some(kind);
        self.state = ServerState::Received;
    }

    fn push(&mut self, payload: &[u8]) -> Result<()> {
        let size = self.buffer.len() + payload.len();
        if size > MAX_MESSAGE_SIZE {
            return Err(TransportError::PacketTooLarge {
                size,
                limit: MAX_MESSAGE_SIZE,
            });
        }
        self.buffer.extend_from_slice(payload);
        Ok(())
    }

    fn finish(&mut self, kind: MessageType, payload: Bytes) -> Result<RaftMessage> {
        self.state = ServerState::ProcessingPayload;
        codec::decode_message(kind, payload)
    }

    /// the single Ack packet answering the current request
    pub fn reply(&mut self, reply: &RaftReply) -> Result<(PacketHeaders, Bytes)> {
        let kind = self
            .message_type
            .take()
            .ok_or_else(|| TransportError::protocol("reply without a request"))?;
        if codec::reply_type(reply) != kind {
            return Err(TransportError::UnexpectedReply { expected: kind.path() });
        }
        self.state = ServerState::ReplySent;
        Ok((PacketHeaders::new(kind, FlowControl::Ack), codec::encode_reply(reply)))
    }

    /// the Cancel packet reporting that the service failed
    ///
    /// the reason is cut to fit the smallest transmission block.
    pub fn reject(&mut self, reason: &str) -> Option<(PacketHeaders, Bytes)> {
        let kind = self.message_type.take()?;
        self.state = ServerState::ReplySent;
        let reason = &reason.as_bytes()[..reason.len().min(MAX_REJECT_REASON)];
        Some((
            PacketHeaders::new(kind, FlowControl::Cancel),
            Bytes::copy_from_slice(reason),
        ))
    }
}
