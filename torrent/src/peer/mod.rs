//! Peer-wire protocol: handshake/framing, message types, and the BEP 10/11
//! extension layer.

pub mod extension;
pub mod message;
pub mod wire;

pub use extension::{LocalExtensions, PexMessage, RemoteExtensions};
pub use message::Message;
pub use wire::{Handshake, PeerWire, ReservedBits, HANDSHAKE_LEN};

use rand::Rng;

/// Generates a peer id in Azureus-style convention (`-XX0001-` followed by
/// random bytes), matching what the teacher crate's stub already sketched.
pub fn generate_peer_id() -> [u8; 20] {
    let mut id = [0u8; 20];
    id[0..8].copy_from_slice(b"-FL0001-");
    rand::thread_rng().fill(&mut id[8..]);
    id
}
