//! Progress reporting: an event enum delivered over an mpsc channel, plus a
//! trait collaborators can implement instead of matching on the channel
//! directly.

use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TorrentState {
    Stopped,
    Downloading,
    Seeding,
    Error,
}

#[derive(Debug, Clone)]
pub enum EngineEvent {
    StateChanged {
        info_hash: [u8; 20],
        state: TorrentState,
    },
    PieceVerified {
        info_hash: [u8; 20],
        index: u32,
    },
    PieceFailed {
        info_hash: [u8; 20],
        index: u32,
    },
    PeerConnected {
        info_hash: [u8; 20],
        addr: std::net::SocketAddr,
    },
    PeerDisconnected {
        info_hash: [u8; 20],
        addr: std::net::SocketAddr,
    },
    Progress {
        info_hash: [u8; 20],
        bytes_downloaded: u64,
        bytes_uploaded: u64,
        download_rate: u64,
        upload_rate: u64,
    },
    DownloadComplete {
        info_hash: [u8; 20],
    },
    Error {
        info_hash: [u8; 20],
        message: String,
    },
}

/// Implemented by anything that wants torrent progress without matching on
/// `EngineEvent` directly. Every method has a no-op default so a
/// collaborator only needs to override the events it cares about.
pub trait ProgressSink: Send + Sync {
    fn on_state_changed(&self, _info_hash: [u8; 20], _state: TorrentState) {}
    fn on_piece_verified(&self, _info_hash: [u8; 20], _index: u32) {}
    fn on_piece_failed(&self, _info_hash: [u8; 20], _index: u32) {}
    fn on_peer_connected(&self, _info_hash: [u8; 20], _addr: std::net::SocketAddr) {}
    fn on_peer_disconnected(&self, _info_hash: [u8; 20], _addr: std::net::SocketAddr) {}
    fn on_progress(&self, _info_hash: [u8; 20], _downloaded: u64, _uploaded: u64, _down_rate: u64, _up_rate: u64) {}
    fn on_download_complete(&self, _info_hash: [u8; 20]) {}
    fn on_error(&self, _info_hash: [u8; 20], _message: &str) {}
}

/// Forwards every `EngineEvent` into a channel. Lets callers pass a
/// `ChannelSink` anywhere a `ProgressSink` is expected and receive events on
/// an `mpsc::Receiver<EngineEvent>` instead of implementing the trait.
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<EngineEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl ProgressSink for ChannelSink {
    fn on_state_changed(&self, info_hash: [u8; 20], state: TorrentState) {
        let _ = self.sender.send(EngineEvent::StateChanged { info_hash, state });
    }

    fn on_piece_verified(&self, info_hash: [u8; 20], index: u32) {
        let _ = self.sender.send(EngineEvent::PieceVerified { info_hash, index });
    }

    fn on_piece_failed(&self, info_hash: [u8; 20], index: u32) {
        let _ = self.sender.send(EngineEvent::PieceFailed { info_hash, index });
    }

    fn on_peer_connected(&self, info_hash: [u8; 20], addr: std::net::SocketAddr) {
        let _ = self.sender.send(EngineEvent::PeerConnected { info_hash, addr });
    }

    fn on_peer_disconnected(&self, info_hash: [u8; 20], addr: std::net::SocketAddr) {
        let _ = self.sender.send(EngineEvent::PeerDisconnected { info_hash, addr });
    }

    fn on_progress(&self, info_hash: [u8; 20], downloaded: u64, uploaded: u64, down_rate: u64, up_rate: u64) {
        let _ = self.sender.send(EngineEvent::Progress {
            info_hash,
            bytes_downloaded: downloaded,
            bytes_uploaded: uploaded,
            download_rate: down_rate,
            upload_rate: up_rate,
        });
    }

    fn on_download_complete(&self, info_hash: [u8; 20]) {
        let _ = self.sender.send(EngineEvent::DownloadComplete { info_hash });
    }

    fn on_error(&self, info_hash: [u8; 20], message: &str) {
        let _ = self.sender.send(EngineEvent::Error {
            info_hash,
            message: message.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_sink_forwards_events() {
        let (sink, mut rx) = ChannelSink::new();
        sink.on_download_complete([1u8; 20]);
        let event = rx.try_recv().unwrap();
        assert!(matches!(event, EngineEvent::DownloadComplete { info_hash } if info_hash == [1u8; 20]));
    }

    #[test]
    fn default_progress_sink_methods_are_no_ops() {
        struct Noop;
        impl ProgressSink for Noop {}
        let sink = Noop;
        sink.on_progress([0u8; 20], 0, 0, 0, 0);
    }
}
