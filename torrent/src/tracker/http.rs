//! HTTP(S) tracker announce (BEP 3).

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use percent_encoding::{percent_encode, AsciiSet, CONTROLS};

use crate::bencode::{self, Value};
use crate::error::{Error, Result};
use crate::tracker::{AnnounceEventKind, AnnounceParams, AnnounceResult};

/// Bytes that must be percent-encoded in a tracker query string, beyond the
/// baseline `CONTROLS` set: BEP 3 requires raw 20-byte hashes in
/// `info_hash`/`peer_id` to go through as `%XX` escapes for everything
/// outside unreserved characters.
const QUERY_UNSAFE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'&')
    .add(b'+')
    .add(b'/')
    .add(b':')
    .add(b';')
    .add(b'<')
    .add(b'=')
    .add(b'>')
    .add(b'?')
    .add(b'@')
    .add(b'[')
    .add(b'\\')
    .add(b']')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}');

pub async fn announce(client: &reqwest::Client, base_url: &str, params: &AnnounceParams) -> Result<AnnounceResult> {
    let url = build_url(base_url, params);
    let response = client
        .get(&url)
        .timeout(Duration::from_secs(30))
        .send()
        .await
        .map_err(|e| Error::ProtocolViolation(format!("http tracker request failed: {e}")))?;
    let bytes = response
        .bytes()
        .await
        .map_err(|e| Error::ProtocolViolation(format!("http tracker response read failed: {e}")))?;
    parse_response(&bytes)
}

fn build_url(base_url: &str, params: &AnnounceParams) -> String {
    let separator = if base_url.contains('?') { '&' } else { '?' };
    let info_hash = percent_encode(&params.info_hash, QUERY_UNSAFE);
    let peer_id = percent_encode(&params.peer_id, QUERY_UNSAFE);
    let mut url = format!(
        "{base_url}{separator}info_hash={info_hash}&peer_id={peer_id}&port={port}&uploaded={uploaded}&downloaded={downloaded}&left={left}&compact=1&numwant={numwant}",
        port = params.listen_port,
        uploaded = params.uploaded,
        downloaded = params.downloaded,
        left = params.left,
        numwant = params.numwant,
    );
    if let Some(event) = event_query_value(params.event) {
        url.push_str("&event=");
        url.push_str(event);
    }
    url
}

fn event_query_value(event: AnnounceEventKind) -> Option<&'static str> {
    match event {
        AnnounceEventKind::None => None,
        AnnounceEventKind::Started => Some("started"),
        AnnounceEventKind::Stopped => Some("stopped"),
        AnnounceEventKind::Completed => Some("completed"),
    }
}

fn parse_response(bytes: &[u8]) -> Result<AnnounceResult> {
    let value = bencode::decode(bytes)?;
    if let Some(reason) = value.get("failure reason").and_then(Value::as_str) {
        return Err(Error::ProtocolViolation(format!("tracker failure: {reason}")));
    }
    let interval = value
        .get("interval")
        .and_then(Value::as_int)
        .ok_or_else(|| Error::InvalidFormat("tracker response missing 'interval'".into()))?;
    let min_interval = value.get("min interval").and_then(Value::as_int).map(|v| v as u64);
    let leechers = value.get("incomplete").and_then(Value::as_int).unwrap_or(0);
    let seeders = value.get("complete").and_then(Value::as_int).unwrap_or(0);

    let mut peers = match value.get("peers") {
        Some(Value::Bytes(compact)) => decode_compact_peers(compact),
        Some(Value::List(list)) => decode_dict_peers(list),
        _ => Vec::new(),
    };
    if let Some(Value::Bytes(compact6)) = value.get("peers6") {
        peers.extend(decode_compact_peers6(compact6));
    }

    Ok(AnnounceResult {
        interval: interval as u64,
        min_interval,
        leechers: leechers as u64,
        seeders: seeders as u64,
        peers,
    })
}

fn decode_compact_peers(bytes: &[u8]) -> Vec<SocketAddr> {
    bytes
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::new(IpAddr::V4(ip), port)
        })
        .collect()
}

fn decode_compact_peers6(bytes: &[u8]) -> Vec<SocketAddr> {
    bytes
        .chunks_exact(18)
        .map(|chunk| {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&chunk[0..16]);
            let ip = std::net::Ipv6Addr::from(octets);
            let port = u16::from_be_bytes([chunk[16], chunk[17]]);
            SocketAddr::new(IpAddr::V6(ip), port)
        })
        .collect()
}

fn decode_dict_peers(list: &[Value]) -> Vec<SocketAddr> {
    list.iter()
        .filter_map(|entry| {
            let ip = entry.get("ip").and_then(Value::as_str)?;
            let port = entry.get("port").and_then(Value::as_int)?;
            let ip: IpAddr = ip.parse().ok()?;
            Some(SocketAddr::new(ip, port as u16))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_compact_peer_list() {
        let mut dict = Vec::new();
        dict.extend_from_slice(b"d8:intervali1800e5:peers12:");
        dict.extend_from_slice(&[127, 0, 0, 1, 0x1A, 0xE1]);
        dict.extend_from_slice(&[127, 0, 0, 2, 0x1A, 0xE2]);
        dict.push(b'e');
        let result = parse_response(&dict).unwrap();
        assert_eq!(result.interval, 1800);
        assert_eq!(result.peers.len(), 2);
        assert_eq!(result.peers[0].port(), 6881);
    }

    #[test]
    fn failure_reason_becomes_error() {
        let body = b"d14:failure reason17:unregistered infoe";
        assert!(parse_response(body).is_err());
    }

    #[test]
    fn build_url_percent_encodes_binary_hash() {
        let params = AnnounceParams {
            info_hash: [0xFFu8; 20],
            peer_id: [b'a'; 20],
            listen_port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 100,
            event: AnnounceEventKind::Started,
            numwant: 50,
        };
        let url = build_url("http://tracker.example/announce", &params);
        assert!(url.contains("info_hash=%FF%FF%FF"));
        assert!(url.contains("event=started"));
    }
}
