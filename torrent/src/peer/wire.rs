//! Handshake, framing, and the per-connection send/receive halves of a
//! peer-wire TCP connection.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::peer::message::Message;

const PROTOCOL_ID: &[u8; 19] = b"BitTorrent protocol";
pub const HANDSHAKE_LEN: usize = 68;

/// Maximum accepted message body length (length prefix value). Anything
/// past this aborts the connection rather than risk a malicious peer
/// making us allocate an unbounded buffer.
pub const MAX_MESSAGE_LEN: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReservedBits(pub [u8; 8]);

impl ReservedBits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_extension_protocol(mut self) -> Self {
        self.0[0] |= 0x01;
        self
    }

    pub fn supports_extension_protocol(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    pub fn with_dht(mut self) -> Self {
        self.0[7] |= 0x01;
        self
    }

    pub fn supports_dht(&self) -> bool {
        self.0[7] & 0x01 != 0
    }

    pub fn with_fast_peers(mut self) -> Self {
        self.0[7] |= 0x04;
        self
    }

    pub fn supports_fast_peers(&self) -> bool {
        self.0[7] & 0x04 != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: ReservedBits,
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20], reserved: ReservedBits) -> Self {
        Self {
            reserved,
            info_hash,
            peer_id,
        }
    }

    pub fn encode(&self) -> [u8; HANDSHAKE_LEN] {
        let mut out = [0u8; HANDSHAKE_LEN];
        out[0] = 19;
        out[1..20].copy_from_slice(PROTOCOL_ID);
        out[20..28].copy_from_slice(&self.reserved.0);
        out[28..48].copy_from_slice(&self.info_hash);
        out[48..68].copy_from_slice(&self.peer_id);
        out
    }

    pub fn decode(buf: &[u8; HANDSHAKE_LEN]) -> Result<Self> {
        if buf[0] != 19 || &buf[1..20] != PROTOCOL_ID {
            return Err(Error::ProtocolViolation("unrecognized handshake protocol string".into()));
        }
        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&buf[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[48..68]);
        Ok(Self {
            reserved: ReservedBits(reserved),
            info_hash,
            peer_id,
        })
    }
}

/// A connected, handshaken peer-wire socket. Both halves sit behind a mutex
/// so the wire can be shared as `Arc<PeerWire>` between the task that reads
/// incoming messages and whichever tasks queue outgoing ones; in practice
/// exactly one task ever calls `recv`, so that lock is never contended.
pub struct PeerWire {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
}

impl PeerWire {
    /// Performs the outbound handshake (we speak first) over an already
    /// connected socket and returns the wire plus the peer's handshake.
    pub async fn connect(mut stream: TcpStream, our_handshake: &Handshake) -> Result<(Self, Handshake)> {
        stream.write_all(&our_handshake.encode()).await?;
        let their_handshake = read_handshake(&mut stream).await?;
        if their_handshake.info_hash != our_handshake.info_hash {
            return Err(Error::ProtocolViolation("info-hash mismatch on handshake".into()));
        }
        let (reader, writer) = stream.into_split();
        Ok((
            Self {
                reader: Mutex::new(reader),
                writer: Mutex::new(writer),
            },
            their_handshake,
        ))
    }

    /// Accepts an inbound connection: reads their handshake first, then
    /// replies with ours once the caller has confirmed the info-hash is one
    /// we're serving.
    pub async fn accept(mut stream: TcpStream, our_handshake: &Handshake) -> Result<(Self, Handshake)> {
        let their_handshake = read_handshake(&mut stream).await?;
        stream.write_all(&our_handshake.encode()).await?;
        let (reader, writer) = stream.into_split();
        Ok((
            Self {
                reader: Mutex::new(reader),
                writer: Mutex::new(writer),
            },
            their_handshake,
        ))
    }

    pub async fn send(&self, message: &Message) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(&message.encode()).await?;
        Ok(())
    }

    /// Reads one framed message, returning `Message::KeepAlive` for a
    /// zero-length frame. `piece_count` is needed to validate an incoming
    /// bitfield's length.
    pub async fn recv(&self, piece_count: usize) -> Result<Message> {
        let mut reader = self.reader.lock().await;
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf);
        if len == 0 {
            return Ok(Message::KeepAlive);
        }
        if len > MAX_MESSAGE_LEN {
            return Err(Error::ProtocolViolation(format!(
                "message length {len} exceeds max {MAX_MESSAGE_LEN}"
            )));
        }
        let mut body = vec![0u8; len as usize];
        reader.read_exact(&mut body).await?;
        Message::decode(&body, piece_count)
    }
}

async fn read_handshake(stream: &mut TcpStream) -> Result<Handshake> {
    let mut buf = [0u8; HANDSHAKE_LEN];
    stream.read_exact(&mut buf).await?;
    Handshake::decode(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_round_trips() {
        let handshake = Handshake::new([1u8; 20], [2u8; 20], ReservedBits::new().with_extension_protocol().with_dht());
        let encoded = handshake.encode();
        let decoded = Handshake::decode(&encoded).unwrap();
        assert_eq!(decoded, handshake);
        assert!(decoded.reserved.supports_extension_protocol());
        assert!(decoded.reserved.supports_dht());
        assert!(!decoded.reserved.supports_fast_peers());
    }

    #[test]
    fn rejects_wrong_protocol_string() {
        let mut buf = Handshake::new([0u8; 20], [0u8; 20], ReservedBits::new()).encode();
        buf[0] = 18;
        assert!(Handshake::decode(&buf).is_err());
    }

    #[tokio::test]
    async fn connect_and_accept_exchange_handshakes_over_loopback() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let info_hash = [5u8; 20];

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let our = Handshake::new(info_hash, [9u8; 20], ReservedBits::new());
            PeerWire::accept(stream, &our).await.unwrap()
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let our = Handshake::new(info_hash, [8u8; 20], ReservedBits::new());
        let (client_wire, their_handshake) = PeerWire::connect(stream, &our).await.unwrap();
        assert_eq!(their_handshake.peer_id, [9u8; 20]);

        let (_, _server_handshake) = server.await.unwrap();
        drop(client_wire);
    }

    #[tokio::test]
    async fn send_recv_round_trip_over_loopback() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let info_hash = [3u8; 20];

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let our = Handshake::new(info_hash, [1u8; 20], ReservedBits::new());
            let (wire, _) = PeerWire::accept(stream, &our).await.unwrap();
            wire.recv(0).await.unwrap()
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let our = Handshake::new(info_hash, [2u8; 20], ReservedBits::new());
        let (client_wire, _) = PeerWire::connect(stream, &our).await.unwrap();
        client_wire.send(&Message::Interested).await.unwrap();

        let received = server.await.unwrap();
        assert_eq!(received, Message::Interested);
    }
}
