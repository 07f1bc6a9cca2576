//! UDP tracker announce (BEP 15), built on `aquatic_udp_protocol`'s wire
//! types rather than hand-rolled byte layouts, the same way
//! `udp-tracker-core` uses it on the server side.

use std::net::Ipv4Addr;
use std::time::Duration;

use aquatic_udp_protocol::{
    AnnounceEvent, AnnounceRequest, AnnounceResponse, ConnectRequest, ConnectResponse, ConnectionId, InfoHash,
    NumberOfBytes, NumberOfPeers, PeerId, PeerKey, Port, Request, Response, TransactionId,
};
use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::tracker::{AnnounceEventKind, AnnounceParams, AnnounceResult};

const MAGIC_PROTOCOL_ID: i64 = 0x41727101980;
const MAX_RETRIES: u32 = 8;
const BASE_TIMEOUT_SECS: u64 = 15;
const CONNECT_RETRIES: u32 = 3;
const CONNECT_TIMEOUT_SECS: u64 = 5;

pub async fn announce(tracker_addr: &str, params: &AnnounceParams) -> Result<AnnounceResult> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(tracker_addr).await?;

    let transaction_id = TransactionId(rand::random::<i32>());
    let connection_id = connect(&socket, transaction_id).await?;

    let request = Request::Announce(AnnounceRequest {
        connection_id,
        transaction_id,
        info_hash: InfoHash(params.info_hash),
        peer_id: PeerId(params.peer_id),
        bytes_downloaded: NumberOfBytes(params.downloaded as i64),
        bytes_left: NumberOfBytes(params.left as i64),
        bytes_uploaded: NumberOfBytes(params.uploaded as i64),
        event: map_event(params.event),
        ip_address: Ipv4Addr::UNSPECIFIED,
        key: PeerKey(rand::random::<i32>()),
        peers_wanted: NumberOfPeers(params.numwant as i32),
        port: Port(params.listen_port),
    });

    let mut buf = Vec::new();
    request
        .write(&mut buf)
        .map_err(|e| Error::ProtocolViolation(format!("encoding udp announce request: {e}")))?;

    let mut response_buf = vec![0u8; 2048];
    for attempt in 0..MAX_RETRIES {
        socket.send(&buf).await?;
        let wait = Duration::from_secs(BASE_TIMEOUT_SECS << attempt);
        match timeout(wait, socket.recv(&mut response_buf)).await {
            Ok(Ok(n)) => {
                let response = Response::from_bytes(&response_buf[..n], false)
                    .map_err(|e| Error::ProtocolViolation(format!("decoding udp announce response: {e}")))?;
                return match response {
                    Response::Announce(announce) => Ok(from_announce_response(announce)),
                    Response::Error(err) => {
                        Err(Error::ProtocolViolation(format!("udp tracker error: {}", err.message)))
                    }
                    _ => Err(Error::ProtocolViolation("expected announce response".into())),
                };
            }
            Ok(Err(io_err)) => return Err(Error::Io(io_err)),
            Err(_) => continue,
        }
    }
    Err(Error::Timeout(format!("udp tracker {tracker_addr} did not respond")))
}

async fn connect(socket: &UdpSocket, transaction_id: TransactionId) -> Result<ConnectionId> {
    let request = Request::Connect(ConnectRequest { transaction_id });
    let mut buf = Vec::new();
    request
        .write(&mut buf)
        .map_err(|e| Error::ProtocolViolation(format!("encoding udp connect request: {e}")))?;

    let mut response_buf = vec![0u8; 16];
    let wait = Duration::from_secs(CONNECT_TIMEOUT_SECS);
    for _attempt in 0..CONNECT_RETRIES {
        socket.send(&buf).await?;
        match timeout(wait, socket.recv(&mut response_buf)).await {
            Ok(Ok(n)) => {
                let response = Response::from_bytes(&response_buf[..n], false)
                    .map_err(|e| Error::ProtocolViolation(format!("decoding udp connect response: {e}")))?;
                return match response {
                    Response::Connect(ConnectResponse { connection_id, .. }) => Ok(connection_id),
                    Response::Error(err) => {
                        Err(Error::ProtocolViolation(format!("udp tracker error: {}", err.message)))
                    }
                    _ => Err(Error::ProtocolViolation("expected connect response".into())),
                };
            }
            Ok(Err(io_err)) => return Err(Error::Io(io_err)),
            Err(_) => continue,
        }
    }
    Err(Error::Timeout("udp tracker connect handshake".into()))
}

fn map_event(event: AnnounceEventKind) -> AnnounceEvent {
    match event {
        AnnounceEventKind::Started => AnnounceEvent::Started,
        AnnounceEventKind::Stopped => AnnounceEvent::Stopped,
        AnnounceEventKind::Completed => AnnounceEvent::Completed,
        AnnounceEventKind::None => AnnounceEvent::None,
    }
}

fn from_announce_response(response: AnnounceResponse<Ipv4Addr>) -> AnnounceResult {
    let peers = response
        .peers
        .into_iter()
        .map(|peer| std::net::SocketAddr::new(peer.ip_address.into(), peer.port.0))
        .collect();
    AnnounceResult {
        interval: response.announce_interval.0 as u64,
        min_interval: None,
        leechers: response.leechers.0 as u64,
        seeders: response.seeders.0 as u64,
        peers,
    }
}
