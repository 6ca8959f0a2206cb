//! # packet
//!
//! why: every transport carries the same framed packets, only the carrier differs
//! relations: used by exchange.rs for splitting, tcp.rs for streams, udp.rs for datagrams
//! what: MessageType, FlowControl, PacketHeaders, Packet, PacketStream
//!
//! a packet is `[message type u8][flow control u8][payload length u32][payload]`.

use crate::config::ByteOrder;
use crate::error::{Result, TransportError};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const PACKET_PROLOGUE_SIZE: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Vote = 1,
    PreVote = 2,
    Resign = 3,
    AppendEntries = 4,
    InstallSnapshot = 5,
    Synchronize = 6,
}

impl MessageType {
    pub const ALL: [Self; 6] = [
        Self::Vote,
        Self::PreVote,
        Self::Resign,
        Self::AppendEntries,
        Self::InstallSnapshot,
        Self::Synchronize,
    ];

    /// route segment used by the http transport
    pub fn path(self) -> &'static str {
        match self {
            Self::Vote => "vote",
            Self::PreVote => "pre-vote",
            Self::Resign => "resign",
            Self::AppendEntries => "append-entries",
            Self::InstallSnapshot => "install-snapshot",
            Self::Synchronize => "synchronize",
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = TransportError;

    fn try_from(value: u8) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|t| *t as u8 == value)
            .ok_or_else(|| TransportError::protocol(format!("unknown message type {value}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum FlowControl {
    /// the whole message fits in this packet
    #[default]
    None = 0,
    /// reply to a completed request
    Ack = 1,
    StreamStart = 2,
    Fragment = 3,
    StreamEnd = 4,
    /// the exchange was abandoned by the sender
    Cancel = 5,
}

impl TryFrom<u8> for FlowControl {
    type Error = TransportError;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => Self::None,
            1 => Self::Ack,
            2 => Self::StreamStart,
            3 => Self::Fragment,
            4 => Self::StreamEnd,
            5 => Self::Cancel,
            other => return Err(TransportError::protocol(format!("unknown flow control {other}"))),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeaders {
    pub message_type: MessageType,
    pub control: FlowControl,
}

impl PacketHeaders {
    pub fn new(message_type: MessageType, control: FlowControl) -> Self {
        Self {
            message_type,
            control,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub headers: PacketHeaders,
    pub payload: Bytes,
}

/// append the prologue and payload of one packet to `buf`
pub fn encode_packet(headers: PacketHeaders, payload: &[u8], order: ByteOrder, buf: &mut BytesMut) -> Result<()> {
    let len = u32::try_from(payload.len()).map_err(|_| TransportError::PacketTooLarge {
        size: payload.len(),
        limit: u32::MAX as usize,
    })?;
    buf.reserve(PACKET_PROLOGUE_SIZE + payload.len());
    buf.put_u8(headers.message_type as u8);
    buf.put_u8(headers.control as u8);
    buf.put_slice(&order.encode_u32(len));
    buf.put_slice(payload);
    Ok(())
}

/// parse a prologue, validating the declared length against `max_payload`
pub fn decode_prologue(
    prologue: [u8; PACKET_PROLOGUE_SIZE],
    order: ByteOrder,
    max_payload: usize,
) -> Result<(PacketHeaders, usize)> {
    let headers = PacketHeaders::new(
        MessageType::try_from(prologue[0])?,
        FlowControl::try_from(prologue[1])?,
    );
    let len = order.decode_u32([prologue[2], prologue[3], prologue[4], prologue[5]]) as usize;
    if len > max_payload {
        return Err(TransportError::PacketTooLarge {
            size: len,
            limit: max_payload,
        });
    }
    Ok((headers, len))
}

/// parse a whole packet held in one buffer, as received in a datagram
pub fn decode_packet(mut raw: Bytes, order: ByteOrder, max_payload: usize) -> Result<Packet> {
    if raw.len() < PACKET_PROLOGUE_SIZE {
        return Err(TransportError::protocol(format!(
            "packet of {} bytes is shorter than its prologue",
            raw.len()
        )));
    }
    let mut prologue = [0u8; PACKET_PROLOGUE_SIZE];
    prologue.copy_from_slice(&raw[..PACKET_PROLOGUE_SIZE]);
    let (headers, len) = decode_prologue(prologue, order, max_payload)?;
    let payload = raw.split_off(PACKET_PROLOGUE_SIZE);
    if payload.len() != len {
        return Err(TransportError::protocol(format!(
            "packet declares {len} payload bytes but carries {}",
            payload.len()
        )));
    }
    Ok(Packet { headers, payload })
}

/// Packet framing over a byte stream with reused buffers
pub struct PacketStream<S> {
    stream: S,
    order: ByteOrder,
    max_payload: usize,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl<S> PacketStream<S> {
    pub fn new(stream: S, order: ByteOrder, max_payload: usize) -> Self {
        Self {
            stream,
            order,
            max_payload,
            read_buf: BytesMut::new(),
            write_buf: BytesMut::new(),
        }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S: AsyncRead + Unpin> PacketStream<S> {
    /// read the next packet, `None` when the peer closed between packets
    pub async fn read_packet(&mut self) -> Result<Option<Packet>> {
        let mut prologue = [0u8; PACKET_PROLOGUE_SIZE];
        let first = self.stream.read(&mut prologue).await?;
        if first == 0 {
            return Ok(None);
        }
        self.stream.read_exact(&mut prologue[first..]).await?;
        let (headers, len) = decode_prologue(prologue, self.order, self.max_payload)?;

        self.read_buf.clear();
        self.read_buf.resize(len, 0);
        self.stream.read_exact(&mut self.read_buf).await?;
        Ok(Some(Packet {
            headers,
            payload: self.read_buf.split().freeze(),
        }))
    }
}

impl<S: AsyncWrite + Unpin> PacketStream<S> {
    /// write one packet with a single write call
    pub async fn write_packet(&mut self, headers: PacketHeaders, payload: &[u8]) -> Result<()> {
        if payload.len() > self.max_payload {
            return Err(TransportError::PacketTooLarge {
                size: payload.len(),
                limit: self.max_payload,
            });
        }
        self.write_buf.clear();
        encode_packet(headers, payload, self.order, &mut self.write_buf)?;
        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers() -> PacketHeaders {
        PacketHeaders::new(MessageType::AppendEntries, FlowControl::Fragment)
    }

    #[test]
    fn prologue_layout() {
        let mut buf = BytesMut::new();
        encode_packet(headers(), b"abc", ByteOrder::Big, &mut buf).unwrap();
        assert_eq!(&buf[..], &[4, 3, 0, 0, 0, 3, b'a', b'b', b'c']);

        buf.clear();
        encode_packet(headers(), b"abc", ByteOrder::Little, &mut buf).unwrap();
        assert_eq!(&buf[..PACKET_PROLOGUE_SIZE], &[4, 3, 3, 0, 0, 0]);
    }

    #[test]
    fn declared_length_is_checked_before_reading() {
        let prologue = [1, 0, 0, 0, 0x10, 0];
        assert!(matches!(
            decode_prologue(prologue, ByteOrder::Big, 300),
            Err(TransportError::PacketTooLarge { size: 4096, limit: 300 })
        ));
    }

    #[test]
    fn unknown_codes_are_rejected() {
        assert!(MessageType::try_from(0).is_err());
        assert!(MessageType::try_from(7).is_err());
        assert!(FlowControl::try_from(6).is_err());
        assert_eq!(MessageType::try_from(6).unwrap(), MessageType::Synchronize);
    }

    #[test]
    fn datagram_length_must_match() {
        let mut buf = BytesMut::new();
        encode_packet(headers(), b"abcd", ByteOrder::Big, &mut buf).unwrap();
        buf.truncate(buf.len() - 1);
        assert!(decode_packet(buf.freeze(), ByteOrder::Big, 300).is_err());
    }

    #[tokio::test]
    async fn stream_reads_what_was_written() {
        let (client, server) = tokio::io::duplex(64);
        let mut writer = PacketStream::new(client, ByteOrder::Big, 1400);
        let mut reader = PacketStream::new(server, ByteOrder::Big, 1400);

        let payload = vec![7u8; 1400];
        let write = async {
            for len in [0, 1, 1400] {
                writer.write_packet(headers(), &payload[..len]).await.unwrap();
            }
            writer.shutdown().await.unwrap();
        };
        let read = async {
            let mut lens = Vec::new();
            while let Some(packet) = reader.read_packet().await.unwrap() {
                assert_eq!(packet.headers, headers());
                lens.push(packet.payload.len());
            }
            lens
        };
        let ((), lens) = tokio::join!(write, read);
        assert_eq!(lens, vec![0, 1, 1400]);
    }

    #[tokio::test]
    async fn oversize_write_is_refused() {
        let (client, _server) = tokio::io::duplex(64);
        let mut writer = PacketStream::new(client, ByteOrder::Big, 300);
        assert!(matches!(
            writer.write_packet(headers(), &[0u8; 301]).await,
            Err(TransportError::PacketTooLarge { size: 301, limit: 300 })
        ));
    }
}
