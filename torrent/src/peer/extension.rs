//! BEP 10 extension protocol handshake and BEP 11 peer exchange (PEX).

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use bytes::Bytes;

use crate::bencode::{self, Value};
use crate::error::{Error, Result};
use crate::peer::message::Message;

pub const EXTENDED_HANDSHAKE_ID: u8 = 0;
pub const UT_PEX_NAME: &str = "ut_pex";

/// Our side's `m` dictionary: extension name -> local message id we'll
/// recognize it as. Only `ut_pex` is offered; unknown extensions a peer
/// advertises are simply never invoked.
#[derive(Debug, Clone)]
pub struct LocalExtensions {
    pub ut_pex_id: u8,
}

impl Default for LocalExtensions {
    fn default() -> Self {
        Self { ut_pex_id: 1 }
    }
}

impl LocalExtensions {
    pub fn handshake_message(&self) -> Message {
        let m = Value::Dict(vec![(
            UT_PEX_NAME.as_bytes().to_vec(),
            Value::Int(i64::from(self.ut_pex_id)),
        )]);
        let dict = Value::Dict(vec![(b"m".to_vec(), m)]);
        Message::Extended {
            id: EXTENDED_HANDSHAKE_ID,
            payload: Bytes::from(bencode::encode(&dict)),
        }
    }
}

/// The remote peer's advertised extension id table, parsed from their
/// extended handshake payload.
#[derive(Debug, Clone, Default)]
pub struct RemoteExtensions {
    ids_by_name: HashMap<String, u8>,
}

impl RemoteExtensions {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let value = bencode::decode(payload)?;
        let m = value
            .get("m")
            .and_then(Value::as_dict)
            .ok_or_else(|| Error::ProtocolViolation("extended handshake missing 'm' dict".into()))?;
        let mut ids_by_name = HashMap::new();
        for (key, val) in m {
            if let Some(id) = val.as_int() {
                if let Ok(name) = String::from_utf8(key.clone()) {
                    ids_by_name.insert(name, id as u8);
                }
            }
        }
        Ok(Self { ids_by_name })
    }

    pub fn id_for(&self, name: &str) -> Option<u8> {
        self.ids_by_name.get(name).copied()
    }

    pub fn supports_pex(&self) -> bool {
        self.ids_by_name.contains_key(UT_PEX_NAME)
    }
}

/// One `ut_pex` message: peers newly seen (`added`) and peers that dropped
/// off the sender's swarm view (`dropped`) since the last PEX message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PexMessage {
    pub added: Vec<SocketAddr>,
    pub dropped: Vec<SocketAddr>,
}

impl PexMessage {
    pub fn encode(&self, local_ext_id: u8) -> Message {
        let added_bytes = encode_compact_peers(&self.added);
        let dropped_bytes = encode_compact_peers(&self.dropped);
        let dict = Value::Dict(vec![
            (b"added".to_vec(), Value::bytes(added_bytes)),
            (b"added.f".to_vec(), Value::bytes(vec![0u8; self.added.len()])),
            (b"dropped".to_vec(), Value::bytes(dropped_bytes)),
        ]);
        Message::Extended {
            id: local_ext_id,
            payload: Bytes::from(bencode::encode(&dict)),
        }
    }

    pub fn parse(payload: &[u8]) -> Result<Self> {
        let value = bencode::decode(payload)?;
        let added = value
            .get("added")
            .and_then(Value::as_bytes)
            .map(decode_compact_peers)
            .unwrap_or_default();
        let dropped = value
            .get("dropped")
            .and_then(Value::as_bytes)
            .map(decode_compact_peers)
            .unwrap_or_default();
        Ok(Self { added, dropped })
    }
}

fn encode_compact_peers(peers: &[SocketAddr]) -> Vec<u8> {
    let mut out = Vec::with_capacity(peers.len() * 6);
    for addr in peers {
        if let SocketAddr::V4(v4) = addr {
            out.extend_from_slice(&v4.ip().octets());
            out.extend_from_slice(&v4.port().to_be_bytes());
        }
    }
    out
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_handshake_advertises_ut_pex() {
        let local = LocalExtensions::default();
        let msg = local.handshake_message();
        if let Message::Extended { id, payload } = msg {
            assert_eq!(id, EXTENDED_HANDSHAKE_ID);
            let parsed = RemoteExtensions::parse(&payload).unwrap();
            assert!(parsed.supports_pex());
            assert_eq!(parsed.id_for(UT_PEX_NAME), Some(local.ut_pex_id));
        } else {
            panic!("expected Extended message");
        }
    }

    #[test]
    fn pex_message_round_trips_compact_peers() {
        let added: Vec<SocketAddr> = vec!["1.2.3.4:6881".parse().unwrap(), "5.6.7.8:51413".parse().unwrap()];
        let dropped: Vec<SocketAddr> = vec!["9.9.9.9:1000".parse().unwrap()];
        let pex = PexMessage {
            added: added.clone(),
            dropped: dropped.clone(),
        };
        let encoded = pex.encode(3);
        if let Message::Extended { id, payload } = encoded {
            assert_eq!(id, 3);
            let decoded = PexMessage::parse(&payload).unwrap();
            assert_eq!(decoded.added, added);
            assert_eq!(decoded.dropped, dropped);
        } else {
            panic!("expected Extended message");
        }
    }
}
