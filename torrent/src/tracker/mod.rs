//! Tracker client: HTTP (BEP 3) and UDP (BEP 15) announce, fanned out
//! across every tracker URL a torrent carries.

pub mod http;
pub mod udp;

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEventKind {
    None,
    Started,
    Stopped,
    Completed,
}

/// How many peers a tracker is asked to hand back per announce.
pub const DEFAULT_NUMWANT: u32 = 50;

#[derive(Debug, Clone)]
pub struct AnnounceParams {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub listen_port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: AnnounceEventKind,
    pub numwant: u32,
}

#[derive(Debug, Clone)]
pub struct AnnounceResult {
    pub interval: u64,
    pub min_interval: Option<u64>,
    pub leechers: u64,
    pub seeders: u64,
    pub peers: Vec<SocketAddr>,
}

/// Announces to a single tracker URL, dispatching to the HTTP or UDP
/// client based on the URL scheme.
pub async fn announce_one(client: &reqwest::Client, url: &str, params: &AnnounceParams) -> Result<AnnounceResult> {
    if let Some(addr) = url.strip_prefix("udp://") {
        let addr = addr.split('/').next().unwrap_or(addr);
        udp::announce(addr, params).await
    } else {
        http::announce(client, url, params).await
    }
}

/// Fans an announce out across every tracker a torrent knows about,
/// following the cadence the reference client uses: immediately, again at
/// +5s and +10s while no tracker has answered, then steady-state every 15s
/// (trackers may raise this via their own `interval`, handled by the
/// supervisor that owns this manager's retry loop). Deduplicates peers
/// already seen across announces within a bounded set so long-running
/// torrents don't grow it unbounded.
pub struct TrackerManager {
    client: reqwest::Client,
    trackers: Vec<String>,
    seen_peers: HashSet<SocketAddr>,
    seen_order: VecDeque<SocketAddr>,
    max_seen: usize,
}

impl TrackerManager {
    pub fn new(trackers: Vec<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            trackers,
            seen_peers: HashSet::new(),
            seen_order: VecDeque::new(),
            max_seen: 5_000,
        }
    }

    /// Announces to every tracker concurrently, returning only peers not
    /// already returned by a previous call.
    pub async fn announce_all(&mut self, params: &AnnounceParams) -> Vec<SocketAddr> {
        let mut handles = Vec::new();
        for url in &self.trackers {
            let client = self.client.clone();
            let url = url.clone();
            let params = params.clone();
            handles.push(tokio::spawn(async move { (url.clone(), announce_one(&client, &url, &params).await) }));
        }

        let mut fresh = Vec::new();
        for handle in handles {
            let (url, result) = match handle.await {
                Ok(pair) => pair,
                Err(_) => continue,
            };
            match result {
                Ok(response) => {
                    debug!(tracker = %url, peers = response.peers.len(), "announce succeeded");
                    for peer in response.peers {
                        if self.seen_peers.insert(peer) {
                            self.seen_order.push_back(peer);
                            if self.seen_order.len() > self.max_seen {
                                if let Some(oldest) = self.seen_order.pop_front() {
                                    self.seen_peers.remove(&oldest);
                                }
                            }
                            fresh.push(peer);
                        }
                    }
                }
                Err(err) => warn!(tracker = %url, error = %err, "announce failed"),
            }
        }
        fresh
    }

    /// Initial announce cadence: immediate, then retries at +5s and +10s if
    /// nothing has come back yet, per the spec's external-interface notes.
    pub fn retry_backoff(attempt: u32) -> Duration {
        match attempt {
            0 => Duration::ZERO,
            1 => Duration::from_secs(5),
            2 => Duration::from_secs(10),
            _ => Duration::from_secs(15),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_backoff_matches_announce_cadence() {
        assert_eq!(TrackerManager::retry_backoff(0), Duration::ZERO);
        assert_eq!(TrackerManager::retry_backoff(1), Duration::from_secs(5));
        assert_eq!(TrackerManager::retry_backoff(2), Duration::from_secs(10));
        assert_eq!(TrackerManager::retry_backoff(3), Duration::from_secs(15));
        assert_eq!(TrackerManager::retry_backoff(99), Duration::from_secs(15));
    }

    #[test]
    fn announce_one_routes_udp_scheme_to_udp_client() {
        // Can't exercise network I/O here; this just documents the URL
        // scheme dispatch contract exercised by the integration tests.
        assert!("udp://tracker.example:80/announce".starts_with("udp://"));
    }
}
