//! Choke/unchoke decisions: tit-for-tat ranking by recent upload rate to
//! peers that reciprocate, plus a FIFO-rotating block of optimistic
//! unchoke slots so every interested peer eventually gets a turn.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::Duration;

/// How often the choke controller re-evaluates who's unchoked.
pub const ROTATION_INTERVAL: Duration = Duration::from_secs(5);
/// Default count of unchoke slots reserved for optimistic picks rather
/// than tit-for-tat ranking.
pub const DEFAULT_OPTIMISTIC_SLOTS: usize = 8;

#[derive(Debug, Clone, Copy, Default)]
pub struct PeerStats {
    pub downloaded_from_us: u64,
    pub uploaded_to_us: u64,
    pub is_interested: bool,
    pub is_choking_us: bool,
}

pub struct ChokeController {
    /// Floor on the unchoked-peer count used while the swarm is small
    /// enough (<=30 connected peers) that the percentage scaling in
    /// `max_unchoked` would otherwise track the connected count exactly.
    base_unchoked: usize,
    choke_upper_bound: usize,
    optimistic_slots: usize,
    /// FIFO queue of interested peers due for an optimistic-unchoke turn.
    /// Refreshed each round: newcomers are appended, peers that dropped
    /// out are removed, and everyone else keeps their place in line.
    rotation: VecDeque<SocketAddr>,
}

impl ChokeController {
    pub fn new(base_unchoked: usize, choke_upper_bound: usize) -> Self {
        Self::with_optimistic_slots(base_unchoked, choke_upper_bound, DEFAULT_OPTIMISTIC_SLOTS)
    }

    pub fn with_optimistic_slots(base_unchoked: usize, choke_upper_bound: usize, optimistic_slots: usize) -> Self {
        Self {
            base_unchoked,
            choke_upper_bound,
            optimistic_slots,
            rotation: VecDeque::new(),
        }
    }

    /// Scales the unchoked slot count with how many peers are connected:
    /// 80% of them if there are more than 50, 75% if more than 30,
    /// otherwise all of them — bounded by `choke_upper_bound` so a single
    /// torrent can't unchoke everyone on a very large swarm.
    pub fn max_unchoked(&self, connected_peers: usize) -> usize {
        let scaled = if connected_peers > 50 {
            connected_peers * 8 / 10
        } else if connected_peers > 30 {
            connected_peers * 75 / 100
        } else {
            connected_peers.max(self.base_unchoked)
        };
        scaled.min(self.choke_upper_bound).max(1)
    }

    /// Re-ranks peers and returns the set that should be unchoked this
    /// round. `max_unchoked` slots split into a tit-for-tat block (ranked
    /// by upload received) and an optimistic block drawn round-robin from
    /// the rotation queue, so a peer that never reciprocates still gets
    /// occasional chances rather than starving forever.
    pub fn choose_unchoked(&mut self, peers: &HashMap<SocketAddr, PeerStats>) -> Vec<SocketAddr> {
        let max_unchoked = self.max_unchoked(peers.len());
        let optimistic_cap = self.optimistic_slots.min(max_unchoked);
        let tit_for_tat_cap = max_unchoked - optimistic_cap;

        let mut interested: Vec<(&SocketAddr, &PeerStats)> =
            peers.iter().filter(|(_, stats)| stats.is_interested).collect();
        interested.sort_by(|a, b| b.1.uploaded_to_us.cmp(&a.1.uploaded_to_us));

        let mut unchoked: Vec<SocketAddr> = interested
            .iter()
            .take(tit_for_tat_cap)
            .map(|(addr, _)| **addr)
            .collect();

        for (addr, _) in &interested {
            if !self.rotation.contains(addr) {
                self.rotation.push_back(**addr);
            }
        }
        self.rotation
            .retain(|addr| peers.get(addr).map(|stats| stats.is_interested).unwrap_or(false));

        let mut picked = 0;
        let mut attempts = 0;
        let rotation_len = self.rotation.len();
        while picked < optimistic_cap && attempts < rotation_len {
            attempts += 1;
            let Some(candidate) = self.rotation.pop_front() else { break };
            self.rotation.push_back(candidate);
            if !unchoked.contains(&candidate) {
                unchoked.push(candidate);
                picked += 1;
            }
        }
        unchoked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> SocketAddr {
        format!("127.0.0.{n}:6881").parse().unwrap()
    }

    #[test]
    fn max_unchoked_scales_with_connected_peer_count_and_caps() {
        let controller = ChokeController::new(4, 1000);
        assert_eq!(controller.max_unchoked(10), 10);
        assert_eq!(controller.max_unchoked(40), 30); // > 30: 75%
        assert_eq!(controller.max_unchoked(100), 80); // > 50: 80%
        let capped = ChokeController::new(4, 10);
        assert_eq!(capped.max_unchoked(100), 10);
    }

    #[test]
    fn ranks_interested_peers_by_reciprocation() {
        let mut controller = ChokeController::new(2, 10);
        let mut peers = HashMap::new();
        peers.insert(
            addr(1),
            PeerStats { is_interested: true, uploaded_to_us: 100, ..Default::default() },
        );
        peers.insert(
            addr(2),
            PeerStats { is_interested: true, uploaded_to_us: 500, ..Default::default() },
        );
        peers.insert(addr(3), PeerStats { is_interested: false, ..Default::default() });

        let unchoked = controller.choose_unchoked(&peers);
        assert!(unchoked.contains(&addr(2)));
        assert!(!unchoked.contains(&addr(3)));
    }

    #[test]
    fn uninterested_peers_are_never_unchoked() {
        let mut controller = ChokeController::new(5, 10);
        let mut peers = HashMap::new();
        peers.insert(addr(1), PeerStats { is_interested: false, ..Default::default() });
        let unchoked = controller.choose_unchoked(&peers);
        assert!(unchoked.is_empty());
    }
}
