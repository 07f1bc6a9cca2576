//! KRPC message encoding (BEP 5): the bencoded query/response/error
//! envelope every DHT message uses.

use bytes::Bytes;

use crate::bencode::{self, Value};
use crate::error::{Error, Result};

pub type NodeId = [u8; 20];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KrpcMessage {
    Query { transaction_id: Bytes, query: Query },
    Response { transaction_id: Bytes, response: Response },
    Error { transaction_id: Bytes, code: i64, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    Ping { id: NodeId },
    FindNode { id: NodeId, target: NodeId },
    GetPeers { id: NodeId, info_hash: [u8; 20] },
    AnnouncePeer {
        id: NodeId,
        info_hash: [u8; 20],
        port: u16,
        token: Bytes,
        implied_port: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ping { id: NodeId },
    FindNode { id: NodeId, nodes: Vec<(NodeId, std::net::SocketAddr)> },
    GetPeers {
        id: NodeId,
        token: Bytes,
        peers: Vec<std::net::SocketAddr>,
        nodes: Vec<(NodeId, std::net::SocketAddr)>,
    },
    AnnouncePeer { id: NodeId },
}

impl KrpcMessage {
    pub fn encode(&self) -> Vec<u8> {
        let value = match self {
            KrpcMessage::Query { transaction_id, query } => {
                let (name, args) = encode_query(query);
                Value::Dict(vec![
                    (b"t".to_vec(), Value::bytes(transaction_id.to_vec())),
                    (b"y".to_vec(), Value::string("q")),
                    (b"q".to_vec(), Value::string(name)),
                    (b"a".to_vec(), args),
                ])
            }
            KrpcMessage::Response { transaction_id, response } => Value::Dict(vec![
                (b"t".to_vec(), Value::bytes(transaction_id.to_vec())),
                (b"y".to_vec(), Value::string("r")),
                (b"r".to_vec(), encode_response(response)),
            ]),
            KrpcMessage::Error { transaction_id, code, message } => Value::Dict(vec![
                (b"t".to_vec(), Value::bytes(transaction_id.to_vec())),
                (b"y".to_vec(), Value::string("e")),
                (
                    b"e".to_vec(),
                    Value::List(vec![Value::Int(*code), Value::string(message)]),
                ),
            ]),
        };
        bencode::encode(&value)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let value = bencode::decode(bytes)?;
        let transaction_id = value
            .get("t")
            .and_then(Value::as_bytes)
            .ok_or_else(|| Error::ProtocolViolation("krpc message missing 't'".into()))?;
        let transaction_id = Bytes::copy_from_slice(transaction_id);
        let kind = value
            .get("y")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::ProtocolViolation("krpc message missing 'y'".into()))?;
        match kind {
            "q" => {
                let name = value
                    .get("q")
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::ProtocolViolation("query missing 'q'".into()))?;
                let args = value
                    .get("a")
                    .ok_or_else(|| Error::ProtocolViolation("query missing 'a'".into()))?;
                Ok(KrpcMessage::Query {
                    transaction_id,
                    query: decode_query(name, args)?,
                })
            }
            "r" => {
                let r = value
                    .get("r")
                    .ok_or_else(|| Error::ProtocolViolation("response missing 'r'".into()))?;
                Ok(KrpcMessage::Response {
                    transaction_id,
                    response: decode_response(r)?,
                })
            }
            "e" => {
                let list = value
                    .get("e")
                    .and_then(Value::as_list)
                    .ok_or_else(|| Error::ProtocolViolation("error missing 'e' list".into()))?;
                let code = list.first().and_then(Value::as_int).unwrap_or(0);
                let message = list.get(1).and_then(Value::as_str).unwrap_or_default().to_string();
                Ok(KrpcMessage::Error {
                    transaction_id,
                    code,
                    message,
                })
            }
            other => Err(Error::ProtocolViolation(format!("unknown krpc message type {other}"))),
        }
    }
}

fn node_id_value(id: &NodeId) -> Value {
    Value::bytes(id.to_vec())
}

fn read_node_id(value: &Value, key: &str) -> Result<NodeId> {
    let bytes = value
        .get(key)
        .and_then(Value::as_bytes)
        .ok_or_else(|| Error::ProtocolViolation(format!("missing '{key}'")))?;
    bytes
        .try_into()
        .map_err(|_| Error::ProtocolViolation(format!("'{key}' is not 20 bytes")))
}

fn encode_query(query: &Query) -> (&'static str, Value) {
    match query {
        Query::Ping { id } => ("ping", Value::Dict(vec![(b"id".to_vec(), node_id_value(id))])),
        Query::FindNode { id, target } => (
            "find_node",
            Value::Dict(vec![
                (b"id".to_vec(), node_id_value(id)),
                (b"target".to_vec(), node_id_value(target)),
            ]),
        ),
        Query::GetPeers { id, info_hash } => (
            "get_peers",
            Value::Dict(vec![
                (b"id".to_vec(), node_id_value(id)),
                (b"info_hash".to_vec(), Value::bytes(info_hash.to_vec())),
            ]),
        ),
        Query::AnnouncePeer {
            id,
            info_hash,
            port,
            token,
            implied_port,
        } => (
            "announce_peer",
            Value::Dict(vec![
                (b"id".to_vec(), node_id_value(id)),
                (b"info_hash".to_vec(), Value::bytes(info_hash.to_vec())),
                (b"port".to_vec(), Value::Int(i64::from(*port))),
                (b"token".to_vec(), Value::bytes(token.to_vec())),
                (b"implied_port".to_vec(), Value::Int(i64::from(*implied_port))),
            ]),
        ),
    }
}

fn decode_query(name: &str, args: &Value) -> Result<Query> {
    match name {
        "ping" => Ok(Query::Ping { id: read_node_id(args, "id")? }),
        "find_node" => Ok(Query::FindNode {
            id: read_node_id(args, "id")?,
            target: read_node_id(args, "target")?,
        }),
        "get_peers" => {
            let info_hash = args
                .get("info_hash")
                .and_then(Value::as_bytes)
                .ok_or_else(|| Error::ProtocolViolation("missing 'info_hash'".into()))?;
            Ok(Query::GetPeers {
                id: read_node_id(args, "id")?,
                info_hash: info_hash.try_into().map_err(|_| Error::ProtocolViolation("bad info_hash len".into()))?,
            })
        }
        "announce_peer" => {
            let info_hash = args
                .get("info_hash")
                .and_then(Value::as_bytes)
                .ok_or_else(|| Error::ProtocolViolation("missing 'info_hash'".into()))?;
            let port = args.get("port").and_then(Value::as_int).unwrap_or(0) as u16;
            let token = args.get("token").and_then(Value::as_bytes).unwrap_or_default();
            let implied_port = args.get("implied_port").and_then(Value::as_int).unwrap_or(0) != 0;
            Ok(Query::AnnouncePeer {
                id: read_node_id(args, "id")?,
                info_hash: info_hash.try_into().map_err(|_| Error::ProtocolViolation("bad info_hash len".into()))?,
                port,
                token: Bytes::copy_from_slice(token),
                implied_port,
            })
        }
        other => Err(Error::ProtocolViolation(format!("unknown query type {other}"))),
    }
}

fn encode_response(response: &Response) -> Value {
    match response {
        Response::Ping { id } => Value::Dict(vec![(b"id".to_vec(), node_id_value(id))]),
        Response::FindNode { id, nodes } => Value::Dict(vec![
            (b"id".to_vec(), node_id_value(id)),
            (b"nodes".to_vec(), Value::bytes(encode_compact_nodes(nodes))),
        ]),
        Response::GetPeers { id, token, peers, nodes } => {
            let mut entries = vec![
                (b"id".to_vec(), node_id_value(id)),
                (b"token".to_vec(), Value::bytes(token.to_vec())),
            ];
            if !peers.is_empty() {
                entries.push((
                    b"values".to_vec(),
                    Value::List(peers.iter().map(|p| Value::bytes(encode_compact_peer(p))).collect()),
                ));
            }
            if !nodes.is_empty() {
                entries.push((b"nodes".to_vec(), Value::bytes(encode_compact_nodes(nodes))));
            }
            Value::Dict(entries)
        }
        Response::AnnouncePeer { id } => Value::Dict(vec![(b"id".to_vec(), node_id_value(id))]),
    }
}

fn decode_response(value: &Value) -> Result<Response> {
    let id = read_node_id(value, "id")?;
    if let Some(token) = value.get("token").and_then(Value::as_bytes) {
        let peers = value
            .get("values")
            .and_then(Value::as_list)
            .map(|list| list.iter().filter_map(|v| v.as_bytes().map(decode_compact_peer)).collect())
            .unwrap_or_default();
        let nodes = value
            .get("nodes")
            .and_then(Value::as_bytes)
            .map(decode_compact_nodes)
            .unwrap_or_default();
        return Ok(Response::GetPeers {
            id,
            token: Bytes::copy_from_slice(token),
            peers,
            nodes,
        });
    }
    if let Some(nodes) = value.get("nodes").and_then(Value::as_bytes) {
        return Ok(Response::FindNode {
            id,
            nodes: decode_compact_nodes(nodes),
        });
    }
    Ok(Response::Ping { id })
}

fn encode_compact_peer(addr: &std::net::SocketAddr) -> Vec<u8> {
    let mut out = Vec::with_capacity(6);
    if let std::net::SocketAddr::V4(v4) = addr {
        out.extend_from_slice(&v4.ip().octets());
        out.extend_from_slice(&v4.port().to_be_bytes());
    }
    out
}

fn decode_compact_peer(bytes: &[u8]) -> std::net::SocketAddr {
    let ip = std::net::Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
    let port = u16::from_be_bytes([bytes[4], bytes[5]]);
    std::net::SocketAddr::new(std::net::IpAddr::V4(ip), port)
}

fn encode_compact_nodes(nodes: &[(NodeId, std::net::SocketAddr)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nodes.len() * 26);
    for (id, addr) in nodes {
        out.extend_from_slice(id);
        out.extend_from_slice(&encode_compact_peer(addr));
    }
    out
}

fn decode_compact_nodes(bytes: &[u8]) -> Vec<(NodeId, std::net::SocketAddr)> {
    bytes
        .chunks_exact(26)
        .map(|chunk| {
            let mut id = [0u8; 20];
            id.copy_from_slice(&chunk[0..20]);
            (id, decode_compact_peer(&chunk[20..26]))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_query_round_trips() {
        let msg = KrpcMessage::Query {
            transaction_id: Bytes::from_static(b"aa"),
            query: Query::Ping { id: [1u8; 20] },
        };
        let encoded = msg.encode();
        assert_eq!(KrpcMessage::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn get_peers_response_round_trips_with_values() {
        let msg = KrpcMessage::Response {
            transaction_id: Bytes::from_static(b"bb"),
            response: Response::GetPeers {
                id: [2u8; 20],
                token: Bytes::from_static(b"tok"),
                peers: vec!["1.2.3.4:6881".parse().unwrap()],
                nodes: vec![],
            },
        };
        let encoded = msg.encode();
        assert_eq!(KrpcMessage::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn find_node_response_round_trips_with_compact_nodes() {
        let msg = KrpcMessage::Response {
            transaction_id: Bytes::from_static(b"cc"),
            response: Response::FindNode {
                id: [3u8; 20],
                nodes: vec![([4u8; 20], "5.6.7.8:51413".parse().unwrap())],
            },
        };
        let encoded = msg.encode();
        assert_eq!(KrpcMessage::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn error_message_round_trips() {
        let msg = KrpcMessage::Error {
            transaction_id: Bytes::from_static(b"dd"),
            code: 201,
            message: "Generic Error".to_string(),
        };
        let encoded = msg.encode();
        assert_eq!(KrpcMessage::decode(&encoded).unwrap(), msg);
    }
}
