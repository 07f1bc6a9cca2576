//! Aggregates peer candidates surfacing from trackers, DHT, LSD, and PEX
//! into one deduplicated stream for the swarm scheduler to consume.

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;

use tokio::sync::mpsc;
use tracing::debug;

/// Where a candidate peer address was learned from, kept for logging and
/// metrics rather than affecting admission (the swarm treats every source
/// equally once deduplicated).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSource {
    Tracker,
    Dht,
    Lsd,
    Pex,
}

#[derive(Debug, Clone)]
pub struct PeerCandidate {
    pub addr: SocketAddr,
    pub source: PeerSource,
}

/// Fan-in point for every discovery mechanism. Each mechanism holds a
/// cloned `mpsc::Sender` and pushes candidates as it finds them; the
/// aggregator task drains the receiver, dedups against everything already
/// forwarded, and republishes only genuinely new addresses.
/// Cap on `discovered_peers`; long-lived swarm-heavy torrents shouldn't
/// grow this without bound, so the oldest entries fall off once it fills.
const MAX_DISCOVERED: usize = 10_000;

pub struct DiscoveryAggregator {
    inbound: mpsc::Receiver<PeerCandidate>,
    seen: HashSet<SocketAddr>,
    seen_order: VecDeque<SocketAddr>,
}

impl DiscoveryAggregator {
    pub fn new(inbound: mpsc::Receiver<PeerCandidate>) -> Self {
        Self {
            inbound,
            seen: HashSet::new(),
            seen_order: VecDeque::new(),
        }
    }

    /// Returns the next never-before-seen peer candidate, or `None` once
    /// every discovery source has dropped its sender.
    pub async fn next_unique(&mut self) -> Option<PeerCandidate> {
        while let Some(candidate) = self.inbound.recv().await {
            if self.seen.insert(candidate.addr) {
                self.seen_order.push_back(candidate.addr);
                if self.seen_order.len() > MAX_DISCOVERED {
                    if let Some(oldest) = self.seen_order.pop_front() {
                        self.seen.remove(&oldest);
                    }
                }
                debug!(addr = %candidate.addr, source = ?candidate.source, "new peer candidate");
                return Some(candidate);
            }
        }
        None
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }
}

/// Creates the aggregator plus a sender handle each discovery source
/// should clone and feed.
pub fn channel(buffer: usize) -> (mpsc::Sender<PeerCandidate>, DiscoveryAggregator) {
    let (tx, rx) = mpsc::channel(buffer);
    (tx, DiscoveryAggregator::new(rx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dedupes_across_sources() {
        let (tx, mut aggregator) = channel(16);
        let addr: SocketAddr = "127.0.0.1:6881".parse().unwrap();
        tx.send(PeerCandidate { addr, source: PeerSource::Tracker }).await.unwrap();
        tx.send(PeerCandidate { addr, source: PeerSource::Dht }).await.unwrap();
        drop(tx);

        let first = aggregator.next_unique().await.unwrap();
        assert_eq!(first.addr, addr);
        assert!(aggregator.next_unique().await.is_none());
        assert_eq!(aggregator.seen_count(), 1);
    }

    #[tokio::test]
    async fn seen_set_evicts_oldest_once_bound_is_exceeded() {
        let (tx, mut aggregator) = channel(MAX_DISCOVERED + 8);
        for i in 0..MAX_DISCOVERED + 1 {
            let addr: SocketAddr = format!("10.{}.{}.{}:6881", (i >> 16) & 0xff, (i >> 8) & 0xff, i & 0xff)
                .parse()
                .unwrap();
            tx.send(PeerCandidate { addr, source: PeerSource::Dht }).await.unwrap();
        }
        drop(tx);

        let mut count = 0;
        while aggregator.next_unique().await.is_some() {
            count += 1;
        }
        assert_eq!(count, MAX_DISCOVERED + 1);
        assert_eq!(aggregator.seen_count(), MAX_DISCOVERED);
    }
}
