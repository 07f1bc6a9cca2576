//! Loads `flud`'s on-disk config, layering (in increasing priority)
//! built-in defaults, `~/.config/flud/config.toml`, and `FLUD_*`
//! environment variables, then turns the result into a `torrent::config::EngineConfig`.

use std::path::PathBuf;

use serde::Deserialize;
use torrent::config::EngineConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error reading config: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config toml: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("config directory not found")]
    NoConfigDir,
}

/// On-disk shape of `config.toml`. Every field is optional so a user's file
/// only needs to mention what they want to override; missing fields fall
/// back to `EngineConfig::default()`.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    listen_port: Option<u16>,
    max_peers_per_torrent: Option<usize>,
    max_half_open_per_torrent: Option<usize>,
    max_pieces_to_request: Option<usize>,
    peer_retry_delay_secs: Option<u64>,
    connect_timeout_secs: Option<u64>,
    global_download_rate_limit: Option<u64>,
    global_upload_rate_limit: Option<u64>,
    per_torrent_download_rate_limit: Option<u64>,
    per_torrent_upload_rate_limit: Option<u64>,
    enable_dht: Option<bool>,
    enable_lsd: Option<bool>,
    enable_pex: Option<bool>,
}

pub fn config_dir() -> Result<PathBuf, ConfigError> {
    let mut dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
    dir.push(env!("CARGO_PKG_NAME"));
    Ok(dir)
}

pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    let mut path = config_dir()?;
    path.push("config.toml");
    Ok(path)
}

/// Loads the layered config, creating `~/.config/flud/` (but not the TOML
/// file itself) if it doesn't exist yet.
pub fn load() -> Result<EngineConfig, ConfigError> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir)?;

    let path = config_file_path()?;
    let file_config = if path.exists() {
        let contents = std::fs::read_to_string(&path)?;
        toml::from_str(&contents)?
    } else {
        FileConfig::default()
    };

    let mut config = EngineConfig::default();
    if let Some(v) = file_config.listen_port {
        config.listen_port = v;
    }
    if let Some(v) = file_config.max_peers_per_torrent {
        config.max_peers_per_torrent = v;
    }
    if let Some(v) = file_config.max_half_open_per_torrent {
        config.max_half_open_per_torrent = v;
    }
    if let Some(v) = file_config.max_pieces_to_request {
        config.max_pieces_to_request = v;
    }
    if let Some(v) = file_config.peer_retry_delay_secs {
        config.peer_retry_delay = std::time::Duration::from_secs(v);
    }
    if let Some(v) = file_config.connect_timeout_secs {
        config.connect_timeout = std::time::Duration::from_secs(v);
    }
    if let Some(v) = file_config.global_download_rate_limit {
        config.global_download_rate_limit = v;
    }
    if let Some(v) = file_config.global_upload_rate_limit {
        config.global_upload_rate_limit = v;
    }
    if let Some(v) = file_config.per_torrent_download_rate_limit {
        config.per_torrent_download_rate_limit = v;
    }
    if let Some(v) = file_config.per_torrent_upload_rate_limit {
        config.per_torrent_upload_rate_limit = v;
    }
    if let Some(v) = file_config.enable_dht {
        config.enable_dht = v;
    }
    if let Some(v) = file_config.enable_lsd {
        config.enable_lsd = v;
    }
    if let Some(v) = file_config.enable_pex {
        config.enable_pex = v;
    }

    apply_env_overrides(&mut config);
    Ok(config)
}

fn apply_env_overrides(config: &mut EngineConfig) {
    if let Ok(port) = std::env::var("FLUD_LISTEN_PORT") {
        if let Ok(port) = port.parse() {
            config.listen_port = port;
        }
    }
    if let Ok(max_peers) = std::env::var("FLUD_MAX_PEERS_PER_TORRENT") {
        if let Ok(max_peers) = max_peers.parse() {
            config.max_peers_per_torrent = max_peers;
        }
    }
    if let Ok(enable_dht) = std::env::var("FLUD_ENABLE_DHT") {
        if let Ok(enable_dht) = enable_dht.parse() {
            config.enable_dht = enable_dht;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_config_overrides_layer_onto_defaults() {
        let mut config = EngineConfig::default();
        let file_config = FileConfig {
            listen_port: Some(7000),
            enable_dht: Some(false),
            ..Default::default()
        };
        if let Some(v) = file_config.listen_port {
            config.listen_port = v;
        }
        if let Some(v) = file_config.enable_dht {
            config.enable_dht = v;
        }
        assert_eq!(config.listen_port, 7000);
        assert!(!config.enable_dht);
    }
}
