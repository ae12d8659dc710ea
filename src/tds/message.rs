//! Message I/O: splits logical messages into packets and reassembles them.
//!
//! One logical message is in flight per direction at a time. Writing chunks
//! the payload by the negotiated packet size and marks the last packet with
//! END_OF_MESSAGE; reading collects packets until that marker is seen.
//!
//! Reads are buffered and resumable. A read abandoned by a timeout or
//! cancellation leaves the bytes it already received in place, so the next
//! `read_message` continues the same message instead of starting mid-packet.

use std::io;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::error::{ConnectionError, ConnectionResult};
use super::protocol::{
    packet_status, FrontendMessage, PacketHeader, DEFAULT_PACKET_SIZE, HEADER_SIZE, MAX_PACKET_SIZE,
};

/// Largest reassembled message accepted by default.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// A reassembled logical message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub message_type: u8,
    pub payload: Bytes,
}

/// Packet framing over an exclusively owned byte stream.
pub struct MessageIo<S> {
    stream: S,
    packet_size: usize,
    max_message_size: usize,
    /// Received bytes not yet consumed as whole packets
    inbound: BytesMut,
    /// Payload of the message currently being assembled
    read_buffer: BytesMut,
    /// Packet type of the message currently being assembled
    partial_type: Option<u8>,
}

impl<S> MessageIo<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            packet_size: DEFAULT_PACKET_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            inbound: BytesMut::with_capacity(DEFAULT_PACKET_SIZE),
            read_buffer: BytesMut::with_capacity(DEFAULT_PACKET_SIZE),
            partial_type: None,
        }
    }

    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// Apply the packet size negotiated through ENVCHANGE.
    pub fn set_packet_size(&mut self, packet_size: usize) {
        debug!("Packet size set to {}", packet_size);
        self.packet_size = packet_size.clamp(HEADER_SIZE + 1, MAX_PACKET_SIZE);
    }

    pub fn set_max_message_size(&mut self, max_message_size: usize) {
        self.max_message_size = max_message_size;
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Bytes read from the stream but not yet returned as a message.
    pub fn has_buffered_input(&self) -> bool {
        !self.inbound.is_empty() || self.partial_type.is_some()
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Encode and write a client message.
    pub async fn send<M: FrontendMessage>(&mut self, msg: &M) -> ConnectionResult<()> {
        let payload = msg.encode();
        self.write_message(msg.message_type(), &payload).await
    }

    /// Write one logical message, split into as many packets as needed.
    pub async fn write_message(&mut self, message_type: u8, payload: &[u8]) -> ConnectionResult<()> {
        let max_payload = self.packet_size - HEADER_SIZE;
        let packets = payload.len().div_ceil(max_payload).max(1);
        let mut buf = BytesMut::with_capacity(payload.len() + packets * HEADER_SIZE);

        let mut packet_id: u8 = 1;
        let mut chunks = payload.chunks(max_payload).peekable();
        if chunks.peek().is_none() {
            // Empty payloads (attention) still go out as one packet
            PacketHeader::new(message_type, packet_status::END_OF_MESSAGE, HEADER_SIZE as u16, packet_id)
                .encode(&mut buf);
        }
        while let Some(chunk) = chunks.next() {
            let status = if chunks.peek().is_none() {
                packet_status::END_OF_MESSAGE
            } else {
                packet_status::NORMAL
            };
            PacketHeader::new(message_type, status, (HEADER_SIZE + chunk.len()) as u16, packet_id)
                .encode(&mut buf);
            buf.extend_from_slice(chunk);
            packet_id = packet_id.wrapping_add(1);
        }

        trace!(
            "Writing message type 0x{:02x}: {} bytes in {} packet(s)",
            message_type,
            payload.len(),
            packets
        );
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Read packets until END_OF_MESSAGE and return the reassembled message.
    ///
    /// Cancel-safe: the only suspension point is the buffered socket read.
    pub async fn read_message(&mut self) -> ConnectionResult<Message> {
        loop {
            if let Some(message) = self.take_message()? {
                return Ok(message);
            }
            let n = self.stream.read_buf(&mut self.inbound).await?;
            if n == 0 {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
            }
        }
    }

    /// Move whole packets from `inbound` into the message being assembled.
    fn take_message(&mut self) -> ConnectionResult<Option<Message>> {
        while self.inbound.len() >= HEADER_SIZE {
            let header = PacketHeader::decode(&self.inbound[..HEADER_SIZE])?;
            let length = header.length as usize;
            if self.inbound.len() < length {
                return Ok(None);
            }

            let message_type = *self.partial_type.get_or_insert(header.packet_type);
            if message_type != header.packet_type {
                return Err(ConnectionError::protocol(format!(
                    "Packet type changed mid-message: 0x{:02x} -> 0x{:02x}",
                    message_type, header.packet_type
                )));
            }
            if self.read_buffer.len() + header.payload_len() > self.max_message_size {
                return Err(ConnectionError::protocol(format!(
                    "Message exceeds the {} byte limit",
                    self.max_message_size
                )));
            }

            let packet = self.inbound.split_to(length);
            self.read_buffer.extend_from_slice(&packet[HEADER_SIZE..]);

            if header.is_end_of_message() {
                self.partial_type = None;
                let payload = self.read_buffer.split().freeze();
                trace!("Read message type 0x{:02x}: {} bytes", message_type, payload.len());
                return Ok(Some(Message { message_type, payload }));
            }
        }
        Ok(None)
    }

    /// Shut down the write side of the stream.
    pub async fn shutdown(&mut self) -> ConnectionResult<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tds::protocol::packet_type;
    use std::time::Duration;

    #[tokio::test]
    async fn test_large_message_is_split_into_packets() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let mut io = MessageIo::new(client);
        io.set_packet_size(512);

        let payload: Vec<u8> = (0..1200u32).map(|i| (i % 251) as u8).collect();
        io.write_message(packet_type::SQL_BATCH, &payload).await.unwrap();

        // 504 bytes of payload per packet: 504 + 504 + 192
        let mut raw = vec![0u8; 1200 + 3 * HEADER_SIZE];
        server.read_exact(&mut raw).await.unwrap();

        let first = PacketHeader::decode(&raw[0..8]).unwrap();
        assert_eq!(first.length, 512);
        assert!(!first.is_end_of_message());
        assert_eq!(first.packet_id, 1);

        let second = PacketHeader::decode(&raw[512..520]).unwrap();
        assert!(!second.is_end_of_message());
        assert_eq!(second.packet_id, 2);

        let third = PacketHeader::decode(&raw[1024..1032]).unwrap();
        assert_eq!(third.length as usize, 192 + HEADER_SIZE);
        assert!(third.is_end_of_message());
        assert_eq!(third.packet_id, 3);
    }

    #[tokio::test]
    async fn test_reassembles_multi_packet_message() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let mut writer = MessageIo::new(server);
        writer.set_packet_size(512);
        let mut reader = MessageIo::new(client);

        let payload: Vec<u8> = (0..3000u32).map(|i| (i % 7) as u8).collect();
        writer.write_message(packet_type::TABULAR_RESULT, &payload).await.unwrap();

        let message = reader.read_message().await.unwrap();
        assert_eq!(message.message_type, packet_type::TABULAR_RESULT);
        assert_eq!(&message.payload[..], &payload[..]);
    }

    #[tokio::test]
    async fn test_empty_message_is_single_packet() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut io = MessageIo::new(client);
        io.write_message(packet_type::ATTENTION, &[]).await.unwrap();

        let mut raw = [0u8; HEADER_SIZE];
        server.read_exact(&mut raw).await.unwrap();
        assert_eq!(raw, [0x06, 0x01, 0x00, 0x08, 0x00, 0x00, 0x01, 0x00]);
    }

    #[tokio::test]
    async fn test_type_change_mid_message_is_protocol_error() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut io = MessageIo::new(client);

        server
            .write_all(&[0x04, 0x00, 0x00, 0x09, 0, 0, 1, 0, 0xAA, 0x12, 0x01, 0x00, 0x09, 0, 0, 2, 0, 0xBB])
            .await
            .unwrap();

        let err = io.read_message().await.unwrap_err();
        assert_eq!(err.code(), "EPROTOCOL");
    }

    fn packet(status: u8, packet_id: u8, payload: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        PacketHeader::new(packet_type::TABULAR_RESULT, status, (HEADER_SIZE + payload.len()) as u16, packet_id)
            .encode(&mut buf);
        buf.extend_from_slice(payload);
        buf.to_vec()
    }

    #[tokio::test]
    async fn test_abandoned_read_resumes_mid_packet() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut io = MessageIo::new(client);

        let first = packet(packet_status::NORMAL, 1, b"first-");
        let second = packet(packet_status::END_OF_MESSAGE, 2, b"second");
        // A whole packet, then half of the next one
        server.write_all(&first).await.unwrap();
        server.write_all(&second[..HEADER_SIZE + 2]).await.unwrap();

        let stalled = tokio::time::timeout(Duration::from_millis(20), io.read_message()).await;
        assert!(stalled.is_err());

        server.write_all(&second[HEADER_SIZE + 2..]).await.unwrap();
        let message = io.read_message().await.unwrap();
        assert_eq!(message.message_type, packet_type::TABULAR_RESULT);
        assert_eq!(&message.payload[..], b"first-second");
    }

    #[tokio::test]
    async fn test_back_to_back_messages_in_one_read() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut io = MessageIo::new(client);

        let mut raw = packet(packet_status::END_OF_MESSAGE, 1, b"one");
        raw.extend(packet(packet_status::END_OF_MESSAGE, 1, b"two"));
        server.write_all(&raw).await.unwrap();

        assert_eq!(&io.read_message().await.unwrap().payload[..], b"one");
        assert_eq!(&io.read_message().await.unwrap().payload[..], b"two");
    }

    #[tokio::test]
    async fn test_buffered_input_is_reported() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut io = MessageIo::new(client);
        assert!(!io.has_buffered_input());

        let mut wire = packet(packet_status::END_OF_MESSAGE, 1, b"one");
        wire.extend_from_slice(&packet(packet_status::END_OF_MESSAGE, 1, b"two")[..4]);
        server.write_all(&wire).await.unwrap();

        assert_eq!(&io.read_message().await.unwrap().payload[..], b"one");
        assert!(io.has_buffered_input());
    }

    #[tokio::test]
    async fn test_oversized_message_is_protocol_error() {
        let (client, mut server) = tokio::io::duplex(4096);
        let mut io = MessageIo::new(client);
        io.set_max_message_size(16);

        let mut raw = packet(packet_status::NORMAL, 1, &[0xAB; 10]);
        raw.extend(packet(packet_status::END_OF_MESSAGE, 2, &[0xCD; 10]));
        server.write_all(&raw).await.unwrap();

        let err = io.read_message().await.unwrap_err();
        assert_eq!(err.code(), "EPROTOCOL");
        assert_eq!(err.message(), "Message exceeds the 16 byte limit");
    }

    #[test]
    fn test_packet_size_is_clamped() {
        let (client, _server) = tokio::io::duplex(64);
        let mut io = MessageIo::new(client);
        io.set_packet_size(70_000);
        assert_eq!(io.packet_size(), MAX_PACKET_SIZE);
    }

    #[tokio::test]
    async fn test_eof_is_transport_error() {
        let (client, server) = tokio::io::duplex(1024);
        drop(server);
        let mut io = MessageIo::new(client);
        let err = io.read_message().await.unwrap_err();
        assert_eq!(err.code(), "ESOCKET");
    }
}
