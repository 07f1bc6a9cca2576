use crate::bencode::DecodeError;

/// The single error type crossing the engine's public API boundary.
///
/// Internal modules may define narrower error enums where it helps call
/// sites (e.g. [`crate::tracker::AnnounceError`]); those convert into this
/// one via `#[from]` at the seam where they cross into swarm/supervisor
/// code, following the decorator style of `bittorrent-tracker-core`'s
/// error module.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid torrent metadata: {0}")]
    InvalidFormat(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("piece {index} failed hash verification")]
    HashMismatch { index: u32 },

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
}

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        Error::InvalidFormat(value.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
