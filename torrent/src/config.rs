//! Engine-wide configuration. `flud` (the reference CLI) layers this over
//! a TOML file and environment variables; the engine itself just needs a
//! `EngineConfig` value and never reads the filesystem or environment
//! itself.

use std::collections::HashMap;
use std::time::Duration;

use crate::swarm::picker::Priority;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub listen_port: u16,
    pub max_peers_per_torrent: usize,
    /// Cap on simultaneous in-flight (not yet handshaked) outbound dials per
    /// torrent, independent of `max_peers_per_torrent`.
    pub max_half_open_per_torrent: usize,
    /// How long a failed dial keeps an address out of admission before it's
    /// eligible to be retried.
    pub peer_retry_delay: Duration,
    /// Timeout applied to the outbound TCP connect, separate from the
    /// handshake itself.
    pub connect_timeout: Duration,
    /// Cap on how many distinct pieces the picker will have in flight at
    /// once, independent of how many peers are connected.
    pub max_pieces_to_request: usize,
    /// Cap on outstanding block requests per wire (request pipelining
    /// depth).
    pub max_requests_per_wire: usize,
    pub global_download_rate_limit: u64,
    pub global_upload_rate_limit: u64,
    pub per_torrent_download_rate_limit: u64,
    pub per_torrent_upload_rate_limit: u64,
    pub choke_rotation_interval: Duration,
    /// Upper bound on unchoked peers per torrent, regardless of how upload
    /// rate scaling would otherwise grow the slot count (see
    /// `swarm::choke::ChokeController::max_unchoked`).
    pub choke_upper_bound: usize,
    pub enable_dht: bool,
    pub enable_lsd: bool,
    pub enable_pex: bool,
    pub dht_bind_addr: String,
    /// Per-file download priority, keyed by index into `Metadata::files`.
    /// Files absent from this map default to `Priority::Normal`.
    pub file_priorities: HashMap<usize, Priority>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            listen_port: 6881,
            max_peers_per_torrent: crate::swarm::DEFAULT_MAX_PEERS,
            max_half_open_per_torrent: 50,
            peer_retry_delay: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(30),
            max_pieces_to_request: 100,
            max_requests_per_wire: 128,
            global_download_rate_limit: 0,
            global_upload_rate_limit: 0,
            per_torrent_download_rate_limit: 0,
            per_torrent_upload_rate_limit: 0,
            choke_rotation_interval: crate::swarm::choke::ROTATION_INTERVAL,
            choke_upper_bound: 20,
            enable_dht: true,
            enable_lsd: true,
            enable_pex: true,
            dht_bind_addr: "0.0.0.0:6881".to_string(),
            file_priorities: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = EngineConfig::default();
        assert_eq!(config.listen_port, 6881);
        assert!(config.enable_dht);
        assert!(config.max_peers_per_torrent > 0);
    }
}
