//! Local Service Discovery (BEP 14): multicast UDP announce/listen for
//! peers on the same LAN.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use rand::Rng;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::error::Result;

pub const MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(239, 192, 152, 143);
pub const MULTICAST_PORT: u16 = 6771;
const HOST: &str = "239.192.152.143:6771";

/// Builds the literal `BT-SEARCH` datagram BEP 14 specifies, with a random
/// cookie so a later announce/listen pass could recognize its own traffic
/// if it needed to.
pub fn build_announce(info_hash_hex: &str, listen_port: u16) -> Vec<u8> {
    let cookie: u32 = rand::thread_rng().gen();
    format!(
        "BT-SEARCH * HTTP/1.1\r\n\
         Host: {HOST}\r\n\
         Port: {listen_port}\r\n\
         Infohash: {info_hash_hex}\r\n\
         cookie: {cookie:08x}\r\n\
         \r\n\r\n"
    )
    .into_bytes()
}

/// A parsed `BT-SEARCH` announce from another LAN peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LsdAnnounce {
    pub info_hash_hex: String,
    pub port: u16,
}

pub fn parse_announce(datagram: &[u8]) -> Option<LsdAnnounce> {
    let text = std::str::from_utf8(datagram).ok()?;
    if !text.starts_with("BT-SEARCH") {
        return None;
    }
    let mut info_hash_hex = None;
    let mut port = None;
    for line in text.lines() {
        if let Some(value) = line.strip_prefix("Infohash: ") {
            info_hash_hex = Some(value.trim().to_lowercase());
        } else if let Some(value) = line.strip_prefix("Port: ") {
            port = value.trim().parse().ok();
        }
    }
    Some(LsdAnnounce {
        info_hash_hex: info_hash_hex?,
        port: port?,
    })
}

/// Opens a multicast socket joined to the LSD group, bound for both sending
/// announces and receiving peers' own announces.
pub async fn bind_multicast() -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, MULTICAST_PORT).into())?;
    socket.join_multicast_v4(&MULTICAST_ADDR, &Ipv4Addr::UNSPECIFIED)?;
    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}

pub async fn announce(socket: &UdpSocket, info_hash_hex: &str, listen_port: u16) -> Result<()> {
    let datagram = build_announce(info_hash_hex, listen_port);
    let dest: SocketAddr = SocketAddrV4::new(MULTICAST_ADDR, MULTICAST_PORT).into();
    socket.send_to(&datagram, dest).await?;
    debug!(%info_hash_hex, "lsd announce sent");
    Ok(())
}

/// Listens for one incoming LSD announce, ignoring anything that doesn't
/// parse as a well-formed `BT-SEARCH` message.
pub async fn recv_one(socket: &UdpSocket) -> Result<Option<(LsdAnnounce, SocketAddr)>> {
    let mut buf = vec![0u8; 1024];
    let (n, src) = socket.recv_from(&mut buf).await?;
    match parse_announce(&buf[..n]) {
        Some(announce) => Ok(Some((announce, src))),
        None => {
            warn!("ignoring malformed lsd datagram");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_and_parse_round_trip() {
        let datagram = build_announce("0123456789abcdef0123456789abcdef01234567", 6881);
        let parsed = parse_announce(&datagram).unwrap();
        assert_eq!(parsed.info_hash_hex, "0123456789abcdef0123456789abcdef01234567");
        assert_eq!(parsed.port, 6881);
    }

    #[test]
    fn rejects_non_bt_search_datagram() {
        assert!(parse_announce(b"GET / HTTP/1.1\r\n\r\n").is_none());
    }

    #[test]
    fn rejects_missing_fields() {
        assert!(parse_announce(b"BT-SEARCH * HTTP/1.1\r\nHost: x\r\n\r\n\r\n").is_none());
    }
}
