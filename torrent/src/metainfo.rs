//! `.torrent` file parsing (BEP 3 "metainfo").
//!
//! Supersedes the teacher crate's `meta_info.rs`/`lib.rs` stubs, which
//! decoded via `serde_bencode` and computed the info-hash by re-encoding the
//! `info` struct. Re-encoding is wrong in general: BEP 3 defines the
//! info-hash as the SHA-1 of the *exact bytes* the `info` dictionary
//! occupied in the original file, and a decode-then-encode roundtrip is not
//! guaranteed to reproduce those bytes (unknown keys, non-canonical-but-
//! tolerated input, a bencode library with different dict key ordering).
//! This parser locates and hashes the original span instead.

use std::path::PathBuf;

use sha1_smol::Sha1;

use crate::bencode::{self, Value};
use crate::error::{Error, Result};

pub const SHA1_LEN: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path relative to the torrent's download directory, already joined
    /// with `Metadata::name` for multi-file torrents.
    pub path: PathBuf,
    pub length: u64,
    /// Byte offset of this file's first byte within the concatenated
    /// logical file the piece hashes describe.
    pub offset: u64,
}

#[derive(Debug, Clone)]
pub struct Metadata {
    pub name: String,
    pub info_hash: [u8; SHA1_LEN],
    pub total_length: u64,
    pub piece_length: u32,
    piece_hashes: Vec<[u8; SHA1_LEN]>,
    pub files: Vec<FileEntry>,
    pub trackers: Vec<String>,
    pub comment: Option<String>,
    pub created_by: Option<String>,
    pub creation_date: Option<i64>,
    pub is_private: bool,
}

impl Metadata {
    /// Parses the raw bytes of a `.torrent` file.
    pub fn parse(bytes: &[u8]) -> Result<Metadata> {
        let top = bencode::decode(bytes)?;
        let top_dict = top
            .as_dict()
            .ok_or_else(|| Error::InvalidFormat("top-level value is not a dict".into()))?;

        let info_value = top
            .get("info")
            .ok_or_else(|| Error::InvalidFormat("missing 'info' dict".into()))?;
        let info_dict = info_value
            .as_dict()
            .ok_or_else(|| Error::InvalidFormat("'info' is not a dict".into()))?;

        let info_hash = compute_info_hash(bytes)?;

        let name = info_value
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::InvalidFormat("'info.name' missing or not a string".into()))?
            .to_string();

        let piece_length = info_value
            .get("piece length")
            .and_then(Value::as_int)
            .ok_or_else(|| Error::InvalidFormat("'info.piece length' missing or not an int".into()))?;
        if piece_length <= 0 {
            return Err(Error::InvalidFormat("'info.piece length' must be positive".into()));
        }
        let piece_length = piece_length as u32;

        let pieces_raw = info_value
            .get("pieces")
            .and_then(Value::as_bytes)
            .ok_or_else(|| Error::InvalidFormat("'info.pieces' missing or not a byte string".into()))?;
        let piece_hashes = chunk_piece_hashes(pieces_raw);
        if piece_hashes.is_empty() {
            return Err(Error::InvalidFormat("'info.pieces' is empty".into()));
        }

        let is_private = info_value
            .get("private")
            .and_then(Value::as_int)
            .map(|n| n != 0)
            .unwrap_or(false);

        let (files, total_length) = parse_files(info_dict, &name)?;

        let expected_piece_count = total_length.div_ceil(u64::from(piece_length));
        if piece_hashes.len() as u64 != expected_piece_count {
            return Err(Error::InvalidFormat(format!(
                "piece count mismatch: {} hashes for {} expected pieces",
                piece_hashes.len(),
                expected_piece_count
            )));
        }

        let trackers = collect_trackers(top_dict, &top);

        let comment = top.get("comment").and_then(Value::as_str).map(str::to_string);
        let created_by = top.get("created by").and_then(Value::as_str).map(str::to_string);
        let creation_date = top.get("creation date").and_then(Value::as_int);

        Ok(Metadata {
            name,
            info_hash,
            total_length,
            piece_length,
            piece_hashes,
            files,
            trackers,
            comment,
            created_by,
            creation_date,
            is_private,
        })
    }

    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    pub fn piece_hash(&self, index: u32) -> Option<&[u8; SHA1_LEN]> {
        self.piece_hashes.get(index as usize)
    }

    /// Length in bytes of the piece at `index`, accounting for the last
    /// (possibly truncated) piece.
    pub fn piece_len(&self, index: u32) -> u32 {
        let last_index = self.piece_count() as u32 - 1;
        if index == last_index {
            let consumed_by_prior = u64::from(index) * u64::from(self.piece_length);
            (self.total_length - consumed_by_prior) as u32
        } else {
            self.piece_length
        }
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    /// The inclusive piece-index range a file occupies, for mapping
    /// per-file priorities onto the piece picker. Returns `None` for an
    /// out-of-range file index.
    pub fn piece_range_for_file(&self, file_index: usize) -> Option<(u32, u32)> {
        let file = self.files.get(file_index)?;
        if file.length == 0 {
            let piece = (file.offset / u64::from(self.piece_length)) as u32;
            return Some((piece, piece));
        }
        let last_byte = file.offset + file.length - 1;
        let start = (file.offset / u64::from(self.piece_length)) as u32;
        let end = (last_byte / u64::from(self.piece_length)) as u32;
        Some((start, end))
    }
}

fn chunk_piece_hashes(raw: &[u8]) -> Vec<[u8; SHA1_LEN]> {
    raw.chunks_exact(SHA1_LEN)
        .map(|chunk| {
            let mut array = [0u8; SHA1_LEN];
            array.copy_from_slice(chunk);
            array
        })
        .collect()
}

fn parse_files(info_dict: &[(Vec<u8>, Value)], name: &str) -> Result<(Vec<FileEntry>, u64)> {
    let files_key = info_dict.iter().find(|(k, _)| k.as_slice() == b"files");
    let length_key = info_dict.iter().find(|(k, _)| k.as_slice() == b"length");

    match (files_key, length_key) {
        (Some((_, files_value)), _) => {
            let list = files_value
                .as_list()
                .ok_or_else(|| Error::InvalidFormat("'info.files' is not a list".into()))?;
            let mut files = Vec::with_capacity(list.len());
            let mut offset = 0u64;
            for entry in list {
                let length = entry
                    .get("length")
                    .and_then(Value::as_int)
                    .ok_or_else(|| Error::InvalidFormat("file entry missing 'length'".into()))?;
                if length < 0 {
                    return Err(Error::InvalidFormat("file length negative".into()));
                }
                let path_parts = entry
                    .get("path")
                    .and_then(Value::as_list)
                    .ok_or_else(|| Error::InvalidFormat("file entry missing 'path'".into()))?;
                if path_parts.is_empty() {
                    return Err(Error::InvalidFormat("file entry has empty path".into()));
                }
                let mut path = PathBuf::from(name);
                for part in path_parts {
                    let part = part
                        .as_str()
                        .ok_or_else(|| Error::InvalidFormat("path component is not a string".into()))?;
                    path.push(part);
                }
                files.push(FileEntry {
                    path,
                    length: length as u64,
                    offset,
                });
                offset += length as u64;
            }
            Ok((files, offset))
        }
        (None, Some((_, length_value))) => {
            let length = length_value
                .as_int()
                .ok_or_else(|| Error::InvalidFormat("'info.length' is not an int".into()))?;
            if length < 0 {
                return Err(Error::InvalidFormat("'info.length' negative".into()));
            }
            let length = length as u64;
            Ok((
                vec![FileEntry {
                    path: PathBuf::from(name),
                    length,
                    offset: 0,
                }],
                length,
            ))
        }
        (None, None) => Err(Error::InvalidFormat(
            "'info' has neither 'length' nor 'files'".into(),
        )),
    }
}

/// Flattens `announce` plus every tier of `announce-list` into one
/// deduplicated, first-seen-order list, per the open-question decision in
/// DESIGN.md: strict BEP 12 tiered fallback is not implemented, matching the
/// reference client's observed flattening behavior.
fn collect_trackers(top_dict: &[(Vec<u8>, Value)], top: &Value) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();

    let mut push = |url: &str, seen: &mut std::collections::HashSet<String>, out: &mut Vec<String>| {
        if seen.insert(url.to_string()) {
            out.push(url.to_string());
        }
    };

    if let Some(announce) = top.get("announce").and_then(Value::as_str) {
        push(announce, &mut seen, &mut out);
    }

    if let Some((_, list_value)) = top_dict.iter().find(|(k, _)| k.as_slice() == b"announce-list") {
        if let Some(tiers) = list_value.as_list() {
            for tier in tiers {
                if let Some(urls) = tier.as_list() {
                    for url in urls {
                        if let Some(url) = url.as_str() {
                            push(url, &mut seen, &mut out);
                        }
                    }
                }
            }
        }
    }

    out
}

/// Computes the SHA-1 info-hash over the raw bytes the `info` dictionary
/// occupied in the original input, per BEP 3.
fn compute_info_hash(input: &[u8]) -> Result<[u8; SHA1_LEN]> {
    let (start, end) = locate_info_span(input)?;
    let mut hasher = Sha1::new();
    hasher.update(&input[start..end]);
    Ok(hasher.digest().bytes())
}

/// Walks the top-level dict's grammar (without building a `Value`) to find
/// the byte span of the value under the `info` key. Equivalent to "scan for
/// the literal key `4:info` at top-level depth" but robust against that
/// literal appearing as part of some other key or nested data, since it
/// only considers keys actually parsed at depth 0.
fn locate_info_span(input: &[u8]) -> Result<(usize, usize)> {
    if input.first() != Some(&b'd') {
        return Err(Error::InvalidFormat("top-level value is not a dict".into()));
    }
    let mut cursor = 1usize;
    loop {
        match input.get(cursor) {
            None => return Err(Error::InvalidFormat("unexpected end of input".into())),
            Some(b'e') => {
                return Err(Error::InvalidFormat("missing 'info' dict".into()));
            }
            Some(_) => {
                let key_end = bencode::scan_value_span(input, cursor)?;
                let key_is_info = {
                    let decoded = bencode::decode(&input[cursor..key_end])?;
                    decoded.as_bytes().map(|b| b == b"info").unwrap_or(false)
                };
                let value_start = key_end;
                let value_end = bencode::scan_value_span(input, value_start)?;
                if key_is_info {
                    return Ok((value_start, value_end));
                }
                cursor = value_end;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::Value;

    fn dict(entries: Vec<(&str, Value)>) -> Value {
        Value::Dict(entries.into_iter().map(|(k, v)| (k.as_bytes().to_vec(), v)).collect())
    }

    fn single_file_torrent(piece_length: i64, total_length: i64, piece_hashes: &[[u8; 20]]) -> Vec<u8> {
        let mut pieces = Vec::new();
        for h in piece_hashes {
            pieces.extend_from_slice(h);
        }
        let info = dict(vec![
            ("name", Value::string("file.bin")),
            ("piece length", Value::Int(piece_length)),
            ("pieces", Value::bytes(pieces)),
            ("length", Value::Int(total_length)),
        ]);
        let top = dict(vec![
            ("announce", Value::string("http://tracker.example/announce")),
            ("info", info),
        ]);
        bencode::encode(&top)
    }

    #[test]
    fn parses_single_file_torrent() {
        let hash = [7u8; 20];
        let bytes = single_file_torrent(16384, 32768, &[hash, hash]);
        let meta = Metadata::parse(&bytes).unwrap();
        assert_eq!(meta.name, "file.bin");
        assert_eq!(meta.total_length, 32768);
        assert_eq!(meta.piece_count(), 2);
        assert_eq!(meta.files.len(), 1);
        assert_eq!(meta.files[0].length, 32768);
        assert_eq!(meta.trackers, vec!["http://tracker.example/announce"]);
    }

    #[test]
    fn info_hash_is_independent_of_unknown_sibling_keys() {
        let hash = [1u8; 20];
        let bytes = single_file_torrent(16384, 16384, &[hash]);
        let meta_a = Metadata::parse(&bytes).unwrap();

        // Re-encode with an extra top-level key inserted before `info`: the
        // info-hash must not change since the `info` bytes are untouched.
        let mut top = bencode::decode(&bytes).unwrap();
        if let Value::Dict(entries) = &mut top {
            entries.insert(0, (b"comment".to_vec(), Value::string("hello")));
        }
        let bytes_b = bencode::encode(&top);
        let meta_b = Metadata::parse(&bytes_b).unwrap();

        assert_eq!(meta_a.info_hash, meta_b.info_hash);
    }

    #[test]
    fn rejects_piece_count_mismatch() {
        let hash = [2u8; 20];
        // total_length implies 2 pieces but only one hash is provided.
        let bytes = single_file_torrent(16384, 32768, &[hash]);
        assert!(Metadata::parse(&bytes).is_err());
    }

    #[test]
    fn multi_file_offsets_accumulate() {
        let file_a = dict(vec![("length", Value::Int(10_000)), ("path", Value::List(vec![Value::string("a.bin")]))]);
        let file_b = dict(vec![("length", Value::Int(20_000)), ("path", Value::List(vec![Value::string("b.bin")]))]);
        let piece_count = (30_000f64 / 16384f64).ceil() as usize;
        let pieces: Vec<u8> = (0..piece_count).flat_map(|_| [9u8; 20]).collect();
        let info = dict(vec![
            ("name", Value::string("multi")),
            ("piece length", Value::Int(16384)),
            ("pieces", Value::bytes(pieces)),
            ("files", Value::List(vec![file_a, file_b])),
        ]);
        let top = dict(vec![("announce", Value::string("udp://t/announce")), ("info", info)]);
        let bytes = bencode::encode(&top);
        let meta = Metadata::parse(&bytes).unwrap();
        assert_eq!(meta.files[0].offset, 0);
        assert_eq!(meta.files[1].offset, 10_000);
        assert_eq!(meta.total_length, 30_000);
    }

    #[test]
    fn piece_range_for_file_spans_a_boundary() {
        let file_a = dict(vec![("length", Value::Int(10_000)), ("path", Value::List(vec![Value::string("a.bin")]))]);
        let file_b = dict(vec![("length", Value::Int(20_000)), ("path", Value::List(vec![Value::string("b.bin")]))]);
        let piece_count = (30_000f64 / 16384f64).ceil() as usize;
        let pieces: Vec<u8> = (0..piece_count).flat_map(|_| [9u8; 20]).collect();
        let info = dict(vec![
            ("name", Value::string("multi")),
            ("piece length", Value::Int(16384)),
            ("pieces", Value::bytes(pieces)),
            ("files", Value::List(vec![file_a, file_b])),
        ]);
        let top = dict(vec![("announce", Value::string("udp://t/announce")), ("info", info)]);
        let bytes = bencode::encode(&top);
        let meta = Metadata::parse(&bytes).unwrap();

        // file a: bytes 0..10_000, inside piece 0 only.
        assert_eq!(meta.piece_range_for_file(0), Some((0, 0)));
        // file b: bytes 10_000..30_000, spans pieces 0 (6 384 bytes) through 1.
        assert_eq!(meta.piece_range_for_file(1), Some((0, 1)));
        assert_eq!(meta.piece_range_for_file(2), None);
    }

    #[test]
    fn announce_list_tiers_flatten_and_dedup() {
        let hash = [3u8; 20];
        let info = dict(vec![
            ("name", Value::string("x")),
            ("piece length", Value::Int(16384)),
            ("pieces", Value::bytes(hash.to_vec())),
            ("length", Value::Int(16384)),
        ]);
        let top = dict(vec![
            ("announce", Value::string("http://a")),
            (
                "announce-list",
                Value::List(vec![
                    Value::List(vec![Value::string("http://a"), Value::string("http://b")]),
                    Value::List(vec![Value::string("http://c")]),
                ]),
            ),
            ("info", info),
        ]);
        let bytes = bencode::encode(&top);
        let meta = Metadata::parse(&bytes).unwrap();
        assert_eq!(meta.trackers, vec!["http://a", "http://b", "http://c"]);
    }
}
