//! Peer-wire protocol message types (BEP 3 core messages plus the BEP 10
//! extended message).

use bytes::Bytes;

use crate::bitfield::Bitfield;
use crate::error::{Error, Result};

pub const MSG_CHOKE: u8 = 0;
pub const MSG_UNCHOKE: u8 = 1;
pub const MSG_INTERESTED: u8 = 2;
pub const MSG_NOT_INTERESTED: u8 = 3;
pub const MSG_HAVE: u8 = 4;
pub const MSG_BITFIELD: u8 = 5;
pub const MSG_REQUEST: u8 = 6;
pub const MSG_PIECE: u8 = 7;
pub const MSG_CANCEL: u8 = 8;
pub const MSG_EXTENDED: u8 = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { index: u32 },
    Bitfield(Bitfield),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Bytes },
    Cancel { index: u32, begin: u32, length: u32 },
    Extended { id: u8, payload: Bytes },
}

impl Message {
    /// Serializes this message including its 4-byte length prefix.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        match self {
            Message::KeepAlive => return 0u32.to_be_bytes().to_vec(),
            Message::Choke => body.push(MSG_CHOKE),
            Message::Unchoke => body.push(MSG_UNCHOKE),
            Message::Interested => body.push(MSG_INTERESTED),
            Message::NotInterested => body.push(MSG_NOT_INTERESTED),
            Message::Have { index } => {
                body.push(MSG_HAVE);
                body.extend_from_slice(&index.to_be_bytes());
            }
            Message::Bitfield(bitfield) => {
                body.push(MSG_BITFIELD);
                body.extend_from_slice(bitfield.as_bytes());
            }
            Message::Request { index, begin, length } | Message::Cancel { index, begin, length } => {
                body.push(if matches!(self, Message::Request { .. }) {
                    MSG_REQUEST
                } else {
                    MSG_CANCEL
                });
                body.extend_from_slice(&index.to_be_bytes());
                body.extend_from_slice(&begin.to_be_bytes());
                body.extend_from_slice(&length.to_be_bytes());
            }
            Message::Piece { index, begin, block } => {
                body.push(MSG_PIECE);
                body.extend_from_slice(&index.to_be_bytes());
                body.extend_from_slice(&begin.to_be_bytes());
                body.extend_from_slice(block);
            }
            Message::Extended { id, payload } => {
                body.push(MSG_EXTENDED);
                body.push(*id);
                body.extend_from_slice(payload);
            }
        }
        let mut out = Vec::with_capacity(4 + body.len());
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(&body);
        out
    }

    /// Parses a message body (without the length prefix, which the caller
    /// has already consumed while framing). An empty body is a keep-alive.
    pub fn decode(body: &[u8], piece_count: usize) -> Result<Message> {
        let Some(&id) = body.first() else {
            return Ok(Message::KeepAlive);
        };
        let rest = &body[1..];
        match id {
            MSG_CHOKE => Ok(Message::Choke),
            MSG_UNCHOKE => Ok(Message::Unchoke),
            MSG_INTERESTED => Ok(Message::Interested),
            MSG_NOT_INTERESTED => Ok(Message::NotInterested),
            MSG_HAVE => Ok(Message::Have {
                index: read_u32(rest, 0)?,
            }),
            MSG_BITFIELD => Bitfield::from_bytes(rest, piece_count)
                .map(Message::Bitfield)
                .ok_or_else(|| Error::ProtocolViolation("bitfield length mismatch".into())),
            MSG_REQUEST => Ok(Message::Request {
                index: read_u32(rest, 0)?,
                begin: read_u32(rest, 4)?,
                length: read_u32(rest, 8)?,
            }),
            MSG_PIECE => {
                if rest.len() < 8 {
                    return Err(Error::ProtocolViolation("piece message too short".into()));
                }
                Ok(Message::Piece {
                    index: read_u32(rest, 0)?,
                    begin: read_u32(rest, 4)?,
                    block: Bytes::copy_from_slice(&rest[8..]),
                })
            }
            MSG_CANCEL => Ok(Message::Cancel {
                index: read_u32(rest, 0)?,
                begin: read_u32(rest, 4)?,
                length: read_u32(rest, 8)?,
            }),
            MSG_EXTENDED => {
                let Some(&ext_id) = rest.first() else {
                    return Err(Error::ProtocolViolation("extended message missing id".into()));
                };
                Ok(Message::Extended {
                    id: ext_id,
                    payload: Bytes::copy_from_slice(&rest[1..]),
                })
            }
            other => Err(Error::ProtocolViolation(format!("unknown message id {other}"))),
        }
    }
}

fn read_u32(buf: &[u8], offset: usize) -> Result<u32> {
    let slice = buf
        .get(offset..offset + 4)
        .ok_or_else(|| Error::ProtocolViolation("message truncated".into()))?;
    let mut array = [0u8; 4];
    array.copy_from_slice(slice);
    Ok(u32::from_be_bytes(array))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_alive_round_trips() {
        let encoded = Message::KeepAlive.encode();
        assert_eq!(encoded, vec![0, 0, 0, 0]);
        assert_eq!(Message::decode(&[], 0).unwrap(), Message::KeepAlive);
    }

    #[test]
    fn request_round_trips() {
        let msg = Message::Request {
            index: 1,
            begin: 16384,
            length: 16384,
        };
        let encoded = msg.encode();
        let body = &encoded[4..];
        assert_eq!(Message::decode(body, 0).unwrap(), msg);
    }

    #[test]
    fn piece_round_trips_with_block_payload() {
        let msg = Message::Piece {
            index: 2,
            begin: 0,
            block: Bytes::from_static(&[1, 2, 3, 4]),
        };
        let encoded = msg.encode();
        let body = &encoded[4..];
        assert_eq!(Message::decode(body, 0).unwrap(), msg);
    }

    #[test]
    fn bitfield_decode_validates_length() {
        let body = [MSG_BITFIELD, 0xFF];
        assert!(Message::decode(&body, 20).is_err());
        assert!(Message::decode(&body, 8).is_ok());
    }

    #[test]
    fn unknown_message_id_is_protocol_violation() {
        assert!(Message::decode(&[99], 0).is_err());
    }
}
