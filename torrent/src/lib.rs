//! BitTorrent client engine: metadata parsing, peer-wire protocol, swarm
//! scheduling, and tracker/DHT/LSD/PEX peer discovery.
//!
//! `flud` (the reference binary in this workspace) is a thin consumer of
//! this crate; nothing in here depends on it.

pub mod bencode;
pub mod bitfield;
pub mod callbacks;
pub mod config;
pub mod dht;
pub mod discovery;
pub mod error;
pub mod lsd;
pub mod metainfo;
pub mod peer;
pub mod rate_limiter;
pub mod storage;
pub mod supervisor;
pub mod swarm;
pub mod tracker;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::callbacks::ProgressSink;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::metainfo::Metadata;
use crate::rate_limiter::TokenBucket;
use crate::supervisor::TorrentSupervisor;

/// Top-level handle for running zero or more torrents under one shared
/// configuration. This is the crate's intended public entry point;
/// `flud` holds one `Engine` for its whole process lifetime.
pub struct Engine {
    config: EngineConfig,
    torrents: DashMap<[u8; 20], Arc<TorrentSupervisor>>,
    sink: Arc<dyn ProgressSink>,
    global_download_limiter: Arc<TokenBucket>,
    global_upload_limiter: Arc<TokenBucket>,
}

impl Engine {
    pub fn new(config: EngineConfig, sink: Arc<dyn ProgressSink>) -> Self {
        let global_download_limiter = Arc::new(TokenBucket::global(config.global_download_rate_limit));
        let global_upload_limiter = Arc::new(TokenBucket::global(config.global_upload_rate_limit));
        Self {
            config,
            torrents: DashMap::new(),
            sink,
            global_download_limiter,
            global_upload_limiter,
        }
    }

    /// Parses `.torrent` bytes and begins downloading/seeding it into
    /// `download_dir`. Returns the info-hash identifying the running
    /// torrent for later lookups.
    pub async fn add_torrent(&self, torrent_bytes: &[u8], download_dir: impl Into<PathBuf>) -> Result<[u8; 20]> {
        let metadata = Metadata::parse(torrent_bytes)?;
        let info_hash = metadata.info_hash;
        let supervisor = TorrentSupervisor::start(
            metadata,
            download_dir,
            self.config.clone(),
            Arc::clone(&self.global_download_limiter),
            Arc::clone(&self.global_upload_limiter),
            Arc::clone(&self.sink),
        )
        .await?;
        self.torrents.insert(info_hash, supervisor);
        Ok(info_hash)
    }

    pub fn torrent(&self, info_hash: &[u8; 20]) -> Option<Arc<TorrentSupervisor>> {
        self.torrents.get(info_hash).map(|entry| Arc::clone(&entry))
    }

    pub async fn remove_torrent(&self, info_hash: &[u8; 20], grace_period: Duration) {
        if let Some((_, supervisor)) = self.torrents.remove(info_hash) {
            supervisor.shutdown(grace_period).await;
        }
    }

    /// Shuts every running torrent down, waiting up to `grace_period` per
    /// torrent for its tasks to exit before abandoning them.
    pub async fn shutdown(&self, grace_period: Duration) {
        let hashes: Vec<[u8; 20]> = self.torrents.iter().map(|e| *e.key()).collect();
        for hash in hashes {
            self.remove_torrent(&hash, grace_period).await;
        }
    }

    pub fn torrent_count(&self) -> usize {
        self.torrents.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::ChannelSink;

    #[tokio::test]
    async fn add_torrent_parses_metadata_and_starts_supervisor() {
        use crate::bencode::{self, Value};
        use sha1_smol::Sha1;

        let data = vec![0u8; 16384];
        let mut hasher = Sha1::new();
        hasher.update(&data);
        let hash = hasher.digest().bytes();
        let info = Value::Dict(vec![
            (b"name".to_vec(), Value::string("x.bin")),
            (b"piece length".to_vec(), Value::Int(16384)),
            (b"pieces".to_vec(), Value::bytes(hash.to_vec())),
            (b"length".to_vec(), Value::Int(16384)),
        ]);
        let top = Value::Dict(vec![
            (b"announce".to_vec(), Value::string("http://t.example/announce")),
            (b"info".to_vec(), info),
        ]);
        let bytes = bencode::encode(&top);

        let dir = tempfile::tempdir().unwrap();
        let (sink, _rx) = ChannelSink::new();
        let engine = Engine::new(
            EngineConfig { listen_port: 0, enable_dht: false, enable_lsd: false, ..EngineConfig::default() },
            Arc::new(sink),
        );
        let info_hash = engine.add_torrent(&bytes, dir.path()).await.unwrap();
        assert_eq!(engine.torrent_count(), 1);
        assert!(engine.torrent(&info_hash).is_some());
        engine.shutdown(Duration::from_secs(1)).await;
    }
}
