//! Swarm scheduler: connection admission, the piece/block picker, the
//! choke controller, and the buffer pool pieces are assembled into before
//! being handed to storage.

pub mod choke;
pub mod picker;
pub mod piece_state;

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::bitfield::Bitfield;
use crate::error::{Error, Result};
use crate::metainfo::Metadata;
use crate::peer::extension::RemoteExtensions;
use crate::peer::{Message, PeerWire};
use crate::rate_limiter::{self, TokenBucket};
use crate::swarm::choke::{ChokeController, PeerStats};
use crate::swarm::picker::{PiecePicker, Priority};

/// Maximum simultaneous peer connections per torrent, the default the
/// connection admission rule enforces before it will dial or accept
/// another.
pub const DEFAULT_MAX_PEERS: usize = 200;
/// Bound on the recently-failed-dial set; past this, entries are evicted
/// without regard to insertion order rather than tracked FIFO, since the
/// only purpose of the set is to avoid hammering a dead peer.
const FAILED_SET_CAP: usize = 1000;

/// Per-peer connection state the swarm tracks alongside its wire.
pub struct PeerConnection {
    pub wire: Arc<PeerWire>,
    pub bitfield: RwLock<Bitfield>,
    pub we_are_choking: std::sync::atomic::AtomicBool,
    pub we_are_interested: std::sync::atomic::AtomicBool,
    pub peer_is_choking: std::sync::atomic::AtomicBool,
    pub peer_is_interested: std::sync::atomic::AtomicBool,
    pub outstanding_requests: Mutex<usize>,
    pub remote_extensions: RwLock<Option<RemoteExtensions>>,
    /// Bytes this peer has sent us (piece payload only), feeding the choke
    /// controller's tit-for-tat ranking.
    pub uploaded_to_us: AtomicU64,
    /// Bytes we've sent this peer (piece payload only).
    pub downloaded_from_us: AtomicU64,
}

/// Recycles piece-sized `BytesMut` buffers rather than allocating fresh
/// ones per piece, scoped so a buffer is always returned even if the
/// holding task errors out.
pub struct BufferPool {
    buffers: Mutex<VecDeque<BytesMut>>,
    buffer_len: usize,
}

impl BufferPool {
    pub fn new(buffer_len: usize) -> Self {
        Self {
            buffers: Mutex::new(VecDeque::new()),
            buffer_len,
        }
    }

    pub async fn acquire(self: &Arc<Self>) -> PooledBuffer {
        let mut buf = {
            let mut pool = self.buffers.lock().await;
            pool.pop_front().unwrap_or_else(|| BytesMut::with_capacity(self.buffer_len))
        };
        buf.clear();
        buf.resize(self.buffer_len, 0);
        PooledBuffer {
            buf: Some(buf),
            pool: Arc::clone(self),
        }
    }
}

/// Owns a buffer checked out of a [`BufferPool`] and returns it on drop, so
/// a panic or early return along any code path can't leak it.
pub struct PooledBuffer {
    buf: Option<BytesMut>,
    pool: Arc<BufferPool>,
}

impl std::ops::Deref for PooledBuffer {
    type Target = BytesMut;
    fn deref(&self) -> &BytesMut {
        self.buf.as_ref().expect("buffer taken before drop")
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut BytesMut {
        self.buf.as_mut().expect("buffer taken before drop")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            if let Ok(mut pool) = self.pool.buffers.try_lock() {
                pool.push_back(buf);
            }
        }
    }
}

/// Coordinates every peer connection for a single torrent: picks what to
/// request from whom, tracks choke state, and enforces the rate limiter
/// before handing bytes to the wire.
pub struct Swarm {
    metadata: Arc<Metadata>,
    connections: DashMap<SocketAddr, Arc<PeerConnection>>,
    picker: Mutex<PiecePicker>,
    choke: Mutex<ChokeController>,
    global_download_limiter: Arc<TokenBucket>,
    per_torrent_limiter: Arc<TokenBucket>,
    buffer_pool: Arc<BufferPool>,
    max_peers: usize,
    failed: DashMap<SocketAddr, Instant>,
    peer_retry_delay: Duration,
    half_open: AtomicUsize,
    max_half_open: usize,
    max_requests_per_wire: usize,
}

impl Swarm {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        metadata: Arc<Metadata>,
        global_download_limiter: Arc<TokenBucket>,
        per_torrent_limiter: Arc<TokenBucket>,
        max_peers: usize,
        max_pieces_to_request: usize,
        max_half_open: usize,
        peer_retry_delay: Duration,
        max_requests_per_wire: usize,
        choke_upper_bound: usize,
    ) -> Self {
        let picker = PiecePicker::new(
            metadata.piece_count(),
            metadata.piece_length,
            metadata.total_length,
            max_pieces_to_request,
        );
        Self {
            buffer_pool: Arc::new(BufferPool::new(metadata.piece_length as usize)),
            metadata,
            connections: DashMap::new(),
            picker: Mutex::new(picker),
            choke: Mutex::new(ChokeController::new(4, choke_upper_bound)),
            global_download_limiter,
            per_torrent_limiter,
            max_peers,
            failed: DashMap::new(),
            peer_retry_delay,
            half_open: AtomicUsize::new(0),
            max_half_open,
            max_requests_per_wire,
        }
    }

    pub fn set_priority(&self, index: u32, priority: Priority) {
        if let Ok(mut picker) = self.picker.try_lock() {
            picker.set_priority(index, priority);
        }
    }

    /// Connection admission: rejects a new peer once the torrent already
    /// has `max_peers` connections, refuses a second connection to an
    /// address we're already talking to, and refuses an address whose last
    /// dial failed less than `peer_retry_delay` ago.
    pub fn admit(&self, addr: SocketAddr) -> Result<()> {
        if self.connections.contains_key(&addr) {
            return Err(Error::ProtocolViolation(format!("already connected to {addr}")));
        }
        if self.connections.len() >= self.max_peers {
            return Err(Error::ResourceExhausted(format!("max peer count {} reached", self.max_peers)));
        }
        if let Some(failed_at) = self.failed.get(&addr) {
            if failed_at.elapsed() < self.peer_retry_delay {
                return Err(Error::ResourceExhausted(format!("{addr} is in retry backoff")));
            }
        }
        Ok(())
    }

    /// Reserves one of `max_half_open` outbound-dial slots; the caller must
    /// release it via [`Swarm::end_half_open`] once the dial resolves
    /// (success or failure).
    pub fn try_begin_half_open(&self) -> bool {
        loop {
            let current = self.half_open.load(Ordering::Relaxed);
            if current >= self.max_half_open {
                return false;
            }
            if self
                .half_open
                .compare_exchange(current, current + 1, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }

    pub fn end_half_open(&self) {
        self.half_open.fetch_sub(1, Ordering::Relaxed);
    }

    /// Records a failed dial so `admit` rejects the same address for
    /// `peer_retry_delay`.
    pub fn record_dial_failure(&self, addr: SocketAddr) {
        if self.failed.len() >= FAILED_SET_CAP {
            if let Some(stale) = self.failed.iter().next().map(|e| *e.key()) {
                self.failed.remove(&stale);
            }
        }
        self.failed.insert(addr, Instant::now());
    }

    pub async fn register(&self, addr: SocketAddr, wire: Arc<PeerWire>) {
        let connection = Arc::new(PeerConnection {
            wire,
            bitfield: RwLock::new(Bitfield::new(self.metadata.piece_count())),
            we_are_choking: std::sync::atomic::AtomicBool::new(true),
            we_are_interested: std::sync::atomic::AtomicBool::new(false),
            peer_is_choking: std::sync::atomic::AtomicBool::new(true),
            peer_is_interested: std::sync::atomic::AtomicBool::new(false),
            outstanding_requests: Mutex::new(0),
            remote_extensions: RwLock::new(None),
            uploaded_to_us: AtomicU64::new(0),
            downloaded_from_us: AtomicU64::new(0),
        });
        self.connections.insert(addr, connection);
        info!(%addr, peers = self.connections.len(), "peer registered");
    }

    /// Looks up one peer's shared connection state, for the task pumping
    /// its incoming messages.
    pub fn connection(&self, addr: SocketAddr) -> Option<Arc<PeerConnection>> {
        self.connections.get(&addr).map(|c| Arc::clone(&c))
    }

    /// Snapshot of every currently connected peer, for PEX fan-out and
    /// similar sweeps that need the full connection list at a point in time.
    pub fn connected_addrs(&self) -> Vec<SocketAddr> {
        self.connections.iter().map(|entry| *entry.key()).collect()
    }

    pub fn metadata(&self) -> &Arc<Metadata> {
        &self.metadata
    }

    pub async fn completed_bitfield(&self) -> Bitfield {
        self.picker.lock().await.completed_bitfield().clone()
    }

    pub async fn unregister(&self, addr: SocketAddr) {
        if let Some((_, connection)) = self.connections.remove(&addr) {
            let bitfield = connection.bitfield.read().await;
            let mut picker = self.picker.lock().await;
            picker.remove_peer_bitfield(&bitfield);
        }
    }

    pub async fn on_bitfield(&self, addr: SocketAddr, bitfield: Bitfield) {
        if let Some(connection) = self.connections.get(&addr) {
            let mut picker = self.picker.lock().await;
            picker.add_peer_bitfield(&bitfield);
            *connection.bitfield.write().await = bitfield;
        }
    }

    pub async fn on_have(&self, addr: SocketAddr, index: u32) {
        if let Some(connection) = self.connections.get(&addr) {
            let mut bitfield = connection.bitfield.write().await;
            bitfield.set(index as usize);
        }
    }

    /// Requests as many blocks as the pipeline depth and rate limiter
    /// allow from one unchoked, interesting peer.
    pub async fn fill_pipeline(&self, addr: SocketAddr) -> Result<()> {
        let Some(connection) = self.connections.get(&addr).map(|c| Arc::clone(&c)) else {
            return Ok(());
        };
        if connection.peer_is_choking.load(std::sync::atomic::Ordering::Relaxed) {
            return Ok(());
        }
        loop {
            {
                let outstanding = connection.outstanding_requests.lock().await;
                if *outstanding >= self.max_requests_per_wire {
                    return Ok(());
                }
            }
            let bitfield = connection.bitfield.read().await.clone();
            let picked = {
                let mut picker = self.picker.lock().await;
                picker.pick_block(&bitfield)
            };
            let Some((index, begin, length)) = picked else {
                return Ok(());
            };
            if !rate_limiter::try_consume_both(&self.global_download_limiter, &self.per_torrent_limiter, u64::from(length)) {
                return Ok(());
            }
            connection.wire.send(&Message::Request { index, begin, length }).await?;
            *connection.outstanding_requests.lock().await += 1;
        }
    }

    /// Handles an arrived `piece` message: feeds it to the picker, and
    /// returns the completed piece's bytes once every block has arrived.
    pub async fn on_piece(&self, addr: SocketAddr, index: u32, begin: u32, block: &[u8]) -> Option<Vec<u8>> {
        if let Some(connection) = self.connections.get(&addr) {
            let mut outstanding = connection.outstanding_requests.lock().await;
            *outstanding = outstanding.saturating_sub(1);
        }
        let mut picker = self.picker.lock().await;
        picker.receive_block(index, begin, block)
    }

    pub fn mark_piece_complete(&self, index: u32) {
        if let Ok(mut picker) = self.picker.try_lock() {
            picker.mark_complete(index);
        }
    }

    pub fn is_complete(&self) -> bool {
        self.picker.try_lock().map(|p| p.is_complete()).unwrap_or(false)
    }

    /// Recomputes unchoke decisions and pushes `choke`/`unchoke` messages
    /// to any peer whose state changed. Intended to run on
    /// [`choke::ROTATION_INTERVAL`]. `max_unchoked` scales with how many
    /// peers are connected (see `ChokeController::max_unchoked`), so this
    /// needs no external rate input.
    pub async fn run_choke_round(&self) {
        let mut stats = HashMap::new();
        for entry in self.connections.iter() {
            stats.insert(
                *entry.key(),
                PeerStats {
                    is_interested: entry.value().peer_is_interested.load(std::sync::atomic::Ordering::Relaxed),
                    is_choking_us: entry.value().peer_is_choking.load(std::sync::atomic::Ordering::Relaxed),
                    uploaded_to_us: entry.value().uploaded_to_us.load(std::sync::atomic::Ordering::Relaxed),
                    downloaded_from_us: entry.value().downloaded_from_us.load(std::sync::atomic::Ordering::Relaxed),
                },
            );
        }
        let unchoked = {
            let mut choke = self.choke.lock().await;
            choke.choose_unchoked(&stats)
        };
        for entry in self.connections.iter() {
            let addr = *entry.key();
            let connection = entry.value();
            let should_unchoke = unchoked.contains(&addr);
            let was_choking = connection.we_are_choking.load(std::sync::atomic::Ordering::Relaxed);
            if should_unchoke == was_choking {
                connection.we_are_choking.store(!should_unchoke, std::sync::atomic::Ordering::Relaxed);
                let message = if should_unchoke { Message::Unchoke } else { Message::Choke };
                if let Err(err) = connection.wire.send(&message).await {
                    warn!(%addr, error = %err, "failed to send choke state");
                }
            }
        }
    }

    /// Reclaims stale outstanding block requests so their blocks can be
    /// re-requested from another peer, and drops any piece that's been
    /// downloading too long without making enough progress.
    pub async fn reclaim_stale(&self) -> usize {
        let mut picker = self.picker.lock().await;
        let reclaimed = picker.reclaim_stale_requests();
        if reclaimed > 0 {
            debug!(reclaimed, "reclaimed stale block requests");
        }
        let evicted = picker.evict_stuck_pieces();
        if evicted > 0 {
            debug!(evicted, "reset stuck pieces back to the pool");
        }
        reclaimed
    }

    pub fn peer_count(&self) -> usize {
        self.connections.len()
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.buffer_pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn buffer_pool_recycles_returned_buffers() {
        let pool = Arc::new(BufferPool::new(1024));
        {
            let buf = pool.acquire().await;
            assert_eq!(buf.len(), 1024);
        }
        let buf2 = pool.acquire().await;
        assert_eq!(buf2.len(), 1024);
        assert_eq!(pool.buffers.lock().await.len(), 0);
    }

    fn single_piece_metadata() -> Metadata {
        use crate::bencode::{self, Value};
        use sha1_smol::Sha1;

        let data = vec![7u8; 16];
        let mut hasher = Sha1::new();
        hasher.update(&data);
        let hash = hasher.digest().bytes();
        let info = Value::Dict(vec![
            (b"name".to_vec(), Value::string("x.bin")),
            (b"piece length".to_vec(), Value::Int(16)),
            (b"pieces".to_vec(), Value::bytes(hash.to_vec())),
            (b"length".to_vec(), Value::Int(16)),
        ]);
        let top = Value::Dict(vec![
            (b"announce".to_vec(), Value::string("http://t.example/announce")),
            (b"info".to_vec(), info),
        ]);
        Metadata::parse(&bencode::encode(&top)).unwrap()
    }

    async fn dummy_wire() -> Arc<PeerWire> {
        use crate::peer::{Handshake, ReservedBits};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let our = Handshake::new([0u8; 20], [1u8; 20], ReservedBits::new());
            PeerWire::accept(stream, &our).await.unwrap().0
        });
        let stream = tokio::net::TcpStream::connect(server_addr).await.unwrap();
        let our = Handshake::new([0u8; 20], [2u8; 20], ReservedBits::new());
        let (client_wire, _) = PeerWire::connect(stream, &our).await.unwrap();
        let _server_wire = server.await.unwrap();
        Arc::new(client_wire)
    }

    #[tokio::test]
    async fn admission_rejects_duplicate_and_over_capacity() {
        let metadata = Arc::new(single_piece_metadata());
        let global_limiter = Arc::new(TokenBucket::global(0));
        let local_limiter = Arc::new(TokenBucket::per_torrent(0));
        let swarm = Swarm::new(metadata, global_limiter, local_limiter, 1, 100, 50, std::time::Duration::from_secs(60), 128, 20);

        let addr_a: SocketAddr = "127.0.0.1:6001".parse().unwrap();
        let addr_b: SocketAddr = "127.0.0.1:6002".parse().unwrap();

        assert!(swarm.admit(addr_a).is_ok());
        swarm.register(addr_a, dummy_wire().await).await;

        assert!(swarm.admit(addr_a).is_err(), "duplicate address must be rejected");
        assert!(swarm.admit(addr_b).is_err(), "over capacity must be rejected");
    }

    #[test]
    fn admit_rejects_addr_in_retry_backoff() {
        let metadata = Arc::new(single_piece_metadata());
        let global_limiter = Arc::new(TokenBucket::global(0));
        let local_limiter = Arc::new(TokenBucket::per_torrent(0));
        let swarm = Swarm::new(metadata, global_limiter, local_limiter, 10, 100, 50, std::time::Duration::from_secs(60), 128, 20);

        let addr: SocketAddr = "127.0.0.1:6003".parse().unwrap();
        assert!(swarm.admit(addr).is_ok());
        swarm.record_dial_failure(addr);
        assert!(swarm.admit(addr).is_err(), "recently-failed address must stay backed off");
    }

    #[test]
    fn half_open_slots_are_bounded_and_released() {
        let metadata = Arc::new(single_piece_metadata());
        let global_limiter = Arc::new(TokenBucket::global(0));
        let local_limiter = Arc::new(TokenBucket::per_torrent(0));
        let swarm = Swarm::new(metadata, global_limiter, local_limiter, 10, 100, 1, std::time::Duration::from_secs(60), 128, 20);

        assert!(swarm.try_begin_half_open());
        assert!(!swarm.try_begin_half_open(), "only one half-open slot was configured");
        swarm.end_half_open();
        assert!(swarm.try_begin_half_open());
    }
}
