//! Maps pieces onto the on-disk files of a (possibly multi-file) torrent,
//! with SHA-1 verification before any write is accepted.
//!
//! Grounded on the teacher's plain `std::fs` usage elsewhere in the crate,
//! generalized to the multi-file spanning case and switched to `tokio::fs`
//! since all I/O in the engine now happens off worker tasks, not a blocking
//! CLI command.

use std::path::{Path, PathBuf};

use sha1_smol::Sha1;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};

use crate::bitfield::Bitfield;
use crate::error::{Error, Result};
use crate::metainfo::{FileEntry, Metadata};

/// A (file index, byte range within that file) slice of a piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileSlice {
    file_index: usize,
    file_offset: u64,
    piece_offset: u32,
    len: u32,
}

/// Owns the on-disk layout for one torrent's data and serves piece-aligned
/// reads/writes against it.
pub struct Storage {
    root: PathBuf,
    files: Vec<FileEntry>,
    piece_length: u32,
    total_length: u64,
}

impl Storage {
    pub fn new(root: impl Into<PathBuf>, metadata: &Metadata) -> Self {
        Self {
            root: root.into(),
            files: metadata.files.clone(),
            piece_length: metadata.piece_length,
            total_length: metadata.total_length,
        }
    }

    /// Creates every file at its final length (sparse where the filesystem
    /// supports it) and every parent directory, so piece writes never need
    /// to extend a file mid-download.
    pub async fn initialize(&self) -> Result<()> {
        for entry in &self.files {
            let path = self.root.join(&entry.path);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&path)
                .await?;
            file.set_len(entry.length).await?;
        }
        Ok(())
    }

    /// Hashes every piece already on disk and returns a bitfield of which
    /// ones are already complete and valid. Used on resume so a
    /// partially-downloaded torrent doesn't re-fetch data it already has.
    pub async fn verify_existing_pieces(&self, metadata: &Metadata) -> Result<Bitfield> {
        let mut have = Bitfield::new(metadata.piece_count());
        for index in 0..metadata.piece_count() as u32 {
            let len = metadata.piece_len(index);
            let data = match self.read_piece(index, len).await {
                Ok(data) => data,
                Err(_) => continue,
            };
            let Some(expected) = metadata.piece_hash(index) else {
                continue;
            };
            if &sha1(&data) == expected {
                have.set(index as usize);
            }
        }
        Ok(have)
    }

    fn slices_for_piece(&self, index: u32, len: u32) -> Vec<FileSlice> {
        let piece_start = u64::from(index) * u64::from(self.piece_length);
        let piece_end = piece_start + u64::from(len);
        let mut slices = Vec::new();

        for (file_index, entry) in self.files.iter().enumerate() {
            let file_start = entry.offset;
            let file_end = entry.offset + entry.length;
            let overlap_start = piece_start.max(file_start);
            let overlap_end = piece_end.min(file_end);
            if overlap_start >= overlap_end {
                continue;
            }
            slices.push(FileSlice {
                file_index,
                file_offset: overlap_start - file_start,
                piece_offset: (overlap_start - piece_start) as u32,
                len: (overlap_end - overlap_start) as u32,
            });
        }
        slices
    }

    /// Reads a single block (sub-range) of a piece, for serving an
    /// incoming `request` message without re-reading the whole piece twice.
    pub async fn read_block(&self, index: u32, begin: u32, length: u32, metadata: &Metadata) -> Result<Vec<u8>> {
        let piece_len = metadata.piece_len(index);
        let piece = self.read_piece(index, piece_len).await?;
        let end = (begin + length) as usize;
        piece
            .get(begin as usize..end)
            .map(|slice| slice.to_vec())
            .ok_or_else(|| Error::ProtocolViolation(format!("block range out of bounds for piece {index}")))
    }

    pub async fn read_piece(&self, index: u32, len: u32) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len as usize];
        for slice in self.slices_for_piece(index, len) {
            let path = self.file_path(slice.file_index);
            let mut file = File::open(&path).await?;
            file.seek(SeekFrom::Start(slice.file_offset)).await?;
            let dest = &mut buf[slice.piece_offset as usize..(slice.piece_offset + slice.len) as usize];
            file.read_exact(dest).await?;
        }
        Ok(buf)
    }

    /// Verifies `data` against the piece's expected hash and, only if it
    /// matches, writes it across whichever files it spans. Returns
    /// [`Error::HashMismatch`] without touching disk on a mismatch.
    pub async fn write_piece(&self, index: u32, data: &[u8], metadata: &Metadata) -> Result<()> {
        let expected = metadata
            .piece_hash(index)
            .ok_or_else(|| Error::ProtocolViolation(format!("piece index {index} out of range")))?;
        if &sha1(data) != expected {
            return Err(Error::HashMismatch { index });
        }
        for slice in self.slices_for_piece(index, data.len() as u32) {
            let path = self.file_path(slice.file_index);
            let mut file = OpenOptions::new().write(true).open(&path).await?;
            file.seek(SeekFrom::Start(slice.file_offset)).await?;
            let src = &data[slice.piece_offset as usize..(slice.piece_offset + slice.len) as usize];
            file.write_all(src).await?;
        }
        Ok(())
    }

    fn file_path(&self, index: usize) -> PathBuf {
        self.root.join(&self.files[index].path)
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn sha1(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.digest().bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::{self, Value};

    fn dict(entries: Vec<(&str, Value)>) -> Value {
        Value::Dict(entries.into_iter().map(|(k, v)| (k.as_bytes().to_vec(), v)).collect())
    }

    fn build_metadata(files: Vec<(&str, u64)>, piece_length: u32, data: &[u8]) -> Metadata {
        let total: u64 = files.iter().map(|(_, l)| l).sum();
        let piece_count = (total as f64 / piece_length as f64).ceil() as usize;
        let pieces: Vec<u8> = (0..piece_count)
            .map(|i| {
                let start = i * piece_length as usize;
                let end = ((i + 1) * piece_length as usize).min(data.len());
                let mut hasher = Sha1::new();
                hasher.update(&data[start..end]);
                hasher.digest().bytes()
            })
            .flat_map(|h: [u8; 20]| h)
            .collect();

        let file_list: Vec<Value> = files
            .iter()
            .map(|(name, len)| {
                dict(vec![
                    ("length", Value::Int(*len as i64)),
                    ("path", Value::List(vec![Value::string(*name)])),
                ])
            })
            .collect();

        let info = dict(vec![
            ("name", Value::string("root")),
            ("piece length", Value::Int(piece_length as i64)),
            ("pieces", Value::bytes(pieces)),
            ("files", Value::List(file_list)),
        ]);
        let top = dict(vec![("announce", Value::string("http://t")), ("info", info)]);
        let bytes = bencode::encode(&top);
        Metadata::parse(&bytes).unwrap()
    }

    #[tokio::test]
    async fn single_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let data = vec![42u8; 32];
        let metadata = build_metadata(vec![("a.bin", 32)], 16, &data);
        let storage = Storage::new(dir.path(), &metadata);
        storage.initialize().await.unwrap();

        storage.write_piece(0, &data[0..16], &metadata).await.unwrap();
        storage.write_piece(1, &data[16..32], &metadata).await.unwrap();

        let read_back = storage.read_piece(0, 16).await.unwrap();
        assert_eq!(read_back, data[0..16]);
    }

    #[tokio::test]
    async fn piece_spanning_two_files_writes_and_reads_correctly() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..40u8).collect();
        // file a = bytes[0..20), file b = bytes[20..40), piece length 16:
        // piece 1 (bytes[16..32)) spans both files.
        let metadata = build_metadata(vec![("a.bin", 20), ("b.bin", 20)], 16, &data);
        let storage = Storage::new(dir.path(), &metadata);
        storage.initialize().await.unwrap();

        storage.write_piece(0, &data[0..16], &metadata).await.unwrap();
        storage.write_piece(1, &data[16..32], &metadata).await.unwrap();
        storage.write_piece(2, &data[32..40], &metadata).await.unwrap();

        let a_contents = tokio::fs::read(dir.path().join("root/a.bin")).await.unwrap();
        let b_contents = tokio::fs::read(dir.path().join("root/b.bin")).await.unwrap();
        assert_eq!(a_contents, data[0..20]);
        assert_eq!(b_contents, data[20..40]);

        let spanning = storage.read_piece(1, 16).await.unwrap();
        assert_eq!(spanning, data[16..32]);
    }

    #[tokio::test]
    async fn rejects_mismatched_piece_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let data = vec![1u8; 16];
        let metadata = build_metadata(vec![("a.bin", 16)], 16, &data);
        let storage = Storage::new(dir.path(), &metadata);
        storage.initialize().await.unwrap();

        let bad = vec![0u8; 16];
        let err = storage.write_piece(0, &bad, &metadata).await.unwrap_err();
        assert!(matches!(err, Error::HashMismatch { index: 0 }));

        let on_disk = tokio::fs::read(dir.path().join("root/a.bin")).await.unwrap();
        assert_eq!(on_disk, vec![0u8; 16]);
    }

    #[tokio::test]
    async fn verify_existing_pieces_detects_already_complete_data() {
        let dir = tempfile::tempdir().unwrap();
        let data = vec![9u8; 32];
        let metadata = build_metadata(vec![("a.bin", 32)], 16, &data);
        let storage = Storage::new(dir.path(), &metadata);
        storage.initialize().await.unwrap();
        storage.write_piece(0, &data[0..16], &metadata).await.unwrap();

        let have = storage.verify_existing_pieces(&metadata).await.unwrap();
        assert!(have.get(0));
        assert!(!have.get(1));
    }
}
