//! Bencode encoding and decoding.
//!
//! This is a hand-rolled codec rather than a wrapper around `serde_bencode`.
//! The metadata parser (`crate::metainfo`) needs to locate the exact raw byte
//! span of the `info` dictionary to compute the info-hash, and that is only
//! correct if decoding never reserializes what it read. A decode-then-encode
//! roundtrip over an `info` dict with unusual key ordering or extra unknown
//! keys would produce different bytes than the original, and the info-hash
//! would silently disagree with every other client on the swarm.

use std::collections::BTreeMap;
use std::fmt;

mod decode;
mod encode;

pub use decode::{decode, scan_value_span};
pub use encode::encode;

/// A decoded bencoded value.
///
/// Dictionaries preserve insertion (i.e. on-the-wire) key order rather than
/// sorting, since BEP 3 requires dict keys to already be sorted in valid
/// input and we want encode to reproduce what we decoded bit-for-bit when
/// asked to (tests rely on this for the round-trip property).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(Vec<(Vec<u8>, Value)>),
}

impl Value {
    pub fn bytes<B: Into<Vec<u8>>>(b: B) -> Self {
        Value::Bytes(b.into())
    }

    pub fn string<S: AsRef<str>>(s: S) -> Self {
        Value::Bytes(s.as_ref().as_bytes().to_vec())
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&[(Vec<u8>, Value)]> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Looks up a dict key by exact byte match. `None` on non-dict values or
    /// a missing key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_dict()?
            .iter()
            .find(|(k, _)| k.as_slice() == key.as_bytes())
            .map(|(_, v)| v)
    }

    /// Collects a dict's entries into a `BTreeMap` for convenience callers
    /// that don't care about original ordering (diagnostics, tests).
    pub fn to_sorted_map(&self) -> Option<BTreeMap<Vec<u8>, &Value>> {
        Some(
            self.as_dict()?
                .iter()
                .map(|(k, v)| (k.clone(), v))
                .collect(),
        )
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{n}"),
            Value::Bytes(b) => match std::str::from_utf8(b) {
                Ok(s) if s.chars().all(|c| !c.is_control()) => write!(f, "{s:?}"),
                _ => write!(f, "<{} bytes>", b.len()),
            },
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Dict(entries) => {
                write!(f, "{{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{:?}: {v}", String::from_utf8_lossy(k))?;
                }
                write!(f, "}}")
            }
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone)]
pub enum DecodeError {
    #[error("unexpected end of input at byte {pos}")]
    UnexpectedEof { pos: usize },
    #[error("invalid byte {byte:#04x} at {pos}, expected one of 'i', 'l', 'd', or a digit")]
    InvalidLeadByte { pos: usize, byte: u8 },
    #[error("integer at {pos} has no terminating 'e'")]
    UnterminatedInt { pos: usize },
    #[error("integer at {pos} is not valid ascii decimal: {text:?}")]
    MalformedInt { pos: usize, text: Vec<u8> },
    #[error("integer at {pos} has a leading zero or is negative zero")]
    NonCanonicalInt { pos: usize },
    #[error("string length prefix at {pos} overflows usize")]
    LengthOverflow { pos: usize },
    #[error("string at {pos} declares length {declared} but only {remaining} bytes remain")]
    StringTooLong {
        pos: usize,
        declared: usize,
        remaining: usize,
    },
    #[error("nesting depth exceeded {max} at {pos}")]
    RecursionLimit { pos: usize, max: usize },
    #[error("trailing bytes after top-level value: {count} byte(s) unconsumed")]
    TrailingBytes { count: usize },
}

/// Bencoded dictionaries and lists may nest at most this deep. `.torrent`
/// files and KRPC messages never come close; this exists purely to bound
/// recursion against adversarial input.
pub const MAX_DEPTH: usize = 64;
