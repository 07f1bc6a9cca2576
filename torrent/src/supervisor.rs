//! Wires storage, the swarm, tracker/DHT/LSD discovery, and peer dialing
//! together into one torrent's lifecycle, and tracks the spawned tasks so
//! shutdown can wait on all of them with a grace period before forcing
//! them closed. The task-tracking shape follows the job manager pattern
//! used for tracker background jobs in the pack (bootstrap jobs spawned
//! with their own cancellation token, joined with a timeout on shutdown).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tokio::sync::mpsc;

use crate::callbacks::{ProgressSink, TorrentState};
use crate::config::EngineConfig;
use crate::discovery::{self, DiscoveryAggregator, PeerCandidate, PeerSource};
use crate::error::Result;
use crate::metainfo::Metadata;
use crate::peer::{generate_peer_id, Handshake, Message, PeerWire, ReservedBits};
use crate::rate_limiter::TokenBucket;
use crate::storage::Storage;
use crate::swarm::Swarm;
use crate::tracker::{AnnounceEventKind, AnnounceParams, TrackerManager};

const DISCOVERY_CHANNEL_BUFFER: usize = 256;

struct Job {
    name: &'static str,
    handle: JoinHandle<()>,
}

/// One torrent's running state: the swarm, storage, and every background
/// task feeding it peers.
pub struct TorrentSupervisor {
    metadata: Arc<Metadata>,
    swarm: Arc<Swarm>,
    storage: Arc<Storage>,
    peer_id: [u8; 20],
    config: EngineConfig,
    cancellation: CancellationToken,
    discovery_tx: mpsc::Sender<PeerCandidate>,
    global_upload_limiter: Arc<TokenBucket>,
    per_torrent_upload_limiter: Arc<TokenBucket>,
    listen_addr: tokio::sync::watch::Sender<Option<SocketAddr>>,
    jobs: Mutex<Vec<Job>>,
    downloaded: AtomicU64,
    uploaded: AtomicU64,
    state: Mutex<TorrentState>,
    sink: Arc<dyn ProgressSink>,
}

impl TorrentSupervisor {
    pub async fn start(
        metadata: Metadata,
        root_dir: impl Into<std::path::PathBuf>,
        config: EngineConfig,
        global_download_limiter: Arc<TokenBucket>,
        global_upload_limiter: Arc<TokenBucket>,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<Arc<Self>> {
        let metadata = Arc::new(metadata);
        let storage = Arc::new(Storage::new(root_dir, &metadata));
        storage.initialize().await?;
        let have = storage.verify_existing_pieces(&metadata).await?;

        let per_torrent_download_limiter = Arc::new(TokenBucket::per_torrent(config.per_torrent_download_rate_limit));
        let per_torrent_upload_limiter = Arc::new(TokenBucket::per_torrent(config.per_torrent_upload_rate_limit));
        let swarm = Arc::new(Swarm::new(
            Arc::clone(&metadata),
            Arc::clone(&global_download_limiter),
            per_torrent_download_limiter,
            config.max_peers_per_torrent,
            config.max_pieces_to_request,
            config.max_half_open_per_torrent,
            config.peer_retry_delay,
            config.max_requests_per_wire,
            config.choke_upper_bound,
        ));
        for index in have.iter_set() {
            swarm.mark_piece_complete(index as u32);
        }
        for (&file_index, &priority) in &config.file_priorities {
            if let Some((start, end)) = metadata.piece_range_for_file(file_index) {
                for index in start..=end {
                    swarm.set_priority(index, priority);
                }
            }
        }

        let (discovery_tx, aggregator) = discovery::channel(DISCOVERY_CHANNEL_BUFFER);
        let (listen_addr, _) = tokio::sync::watch::channel(None);

        let supervisor = Arc::new(Self {
            metadata,
            swarm,
            storage,
            peer_id: generate_peer_id(),
            config,
            cancellation: CancellationToken::new(),
            discovery_tx,
            global_upload_limiter,
            per_torrent_upload_limiter,
            listen_addr,
            jobs: Mutex::new(Vec::new()),
            downloaded: AtomicU64::new(0),
            uploaded: AtomicU64::new(0),
            state: Mutex::new(TorrentState::Downloading),
            sink,
        });

        supervisor.set_state(TorrentState::Downloading).await;
        supervisor.spawn_listener_loop().await;
        supervisor.spawn_discovery_consumer(aggregator).await;
        supervisor.spawn_tracker_loop().await;
        if supervisor.config.enable_lsd {
            supervisor.spawn_lsd_loop().await;
        }
        if supervisor.config.enable_dht {
            supervisor.spawn_dht_loop().await;
        }
        if supervisor.config.enable_pex {
            supervisor.spawn_pex_loop().await;
        }
        supervisor.spawn_maintenance_loop().await;
        supervisor.spawn_stats_loop().await;

        Ok(supervisor)
    }

    async fn set_state(&self, state: TorrentState) {
        *self.state.lock().await = state.clone();
        self.sink.on_state_changed(self.metadata.info_hash, state);
    }

    async fn spawn_job(&self, name: &'static str, handle: JoinHandle<()>) {
        self.jobs.lock().await.push(Job { name, handle });
    }

    /// Drains the discovery aggregator and dials every address it hasn't
    /// already seen, regardless of which mechanism surfaced it.
    async fn spawn_discovery_consumer(self: &Arc<Self>, mut aggregator: DiscoveryAggregator) {
        let supervisor = Arc::clone(self);
        let cancellation = self.cancellation.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancellation.cancelled() => return,
                    candidate = aggregator.next_unique() => {
                        match candidate {
                            Some(candidate) => supervisor.try_dial(candidate.addr).await,
                            None => return,
                        }
                    }
                }
            }
        });
        self.spawn_job("discovery", handle).await;
    }

    async fn spawn_tracker_loop(self: &Arc<Self>) {
        let supervisor = Arc::clone(self);
        let cancellation = self.cancellation.clone();
        let handle = tokio::spawn(async move {
            let mut manager = TrackerManager::new(supervisor.metadata.trackers.clone());
            let mut attempt = 0u32;
            loop {
                let wait = TrackerManager::retry_backoff(attempt);
                tokio::select! {
                    _ = cancellation.cancelled() => return,
                    _ = tokio::time::sleep(wait) => {}
                }
                let params = AnnounceParams {
                    info_hash: supervisor.metadata.info_hash,
                    peer_id: supervisor.peer_id,
                    listen_port: supervisor.config.listen_port,
                    uploaded: supervisor.uploaded.load(Ordering::Relaxed),
                    downloaded: supervisor.downloaded.load(Ordering::Relaxed),
                    left: supervisor.metadata.total_length.saturating_sub(supervisor.downloaded.load(Ordering::Relaxed)),
                    event: if attempt == 0 { AnnounceEventKind::Started } else { AnnounceEventKind::None },
                    numwant: crate::tracker::DEFAULT_NUMWANT,
                };
                let peers = manager.announce_all(&params).await;
                for addr in peers {
                    let _ = supervisor.discovery_tx.send(PeerCandidate { addr, source: PeerSource::Tracker }).await;
                }
                attempt = (attempt + 1).min(3);
            }
        });
        self.spawn_job("tracker", handle).await;
    }

    async fn spawn_lsd_loop(self: &Arc<Self>) {
        let supervisor = Arc::clone(self);
        let cancellation = self.cancellation.clone();
        let handle = tokio::spawn(async move {
            let socket = match crate::lsd::bind_multicast().await {
                Ok(socket) => socket,
                Err(err) => {
                    warn!(error = %err, "lsd bind failed, disabling local discovery");
                    return;
                }
            };
            let info_hash_hex = supervisor.metadata.info_hash_hex();
            loop {
                tokio::select! {
                    _ = cancellation.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(60)) => {
                        let _ = crate::lsd::announce(&socket, &info_hash_hex, supervisor.config.listen_port).await;
                    }
                    received = crate::lsd::recv_one(&socket) => {
                        if let Ok(Some((announce, src))) = received {
                            if announce.info_hash_hex == info_hash_hex {
                                let addr = SocketAddr::new(src.ip(), announce.port);
                                let _ = supervisor.discovery_tx.send(PeerCandidate { addr, source: PeerSource::Lsd }).await;
                            }
                        }
                    }
                }
            }
        });
        self.spawn_job("lsd", handle).await;
    }

    async fn spawn_dht_loop(self: &Arc<Self>) {
        let supervisor = Arc::clone(self);
        let cancellation = self.cancellation.clone();
        let handle = tokio::spawn(async move {
            let local_id = {
                let peer_id = supervisor.peer_id;
                let mut id = [0u8; 20];
                id.copy_from_slice(&peer_id);
                id
            };
            let client = match crate::dht::DhtClient::bind(local_id, &supervisor.config.dht_bind_addr).await {
                Ok(client) => Arc::new(client),
                Err(err) => {
                    warn!(error = %err, "dht bind failed, disabling dht discovery");
                    return;
                }
            };
            let receiver = {
                let client = Arc::clone(&client);
                tokio::spawn(async move {
                    let _ = client.run_receive_loop().await;
                })
            };

            let mut table = crate::dht::NodeTable::new(2000);
            let _ = client.bootstrap(&mut table).await;

            let mut interval = tokio::time::interval(Duration::from_secs(300));
            loop {
                tokio::select! {
                    _ = cancellation.cancelled() => {
                        receiver.abort();
                        return;
                    }
                    _ = interval.tick() => {
                        let peers = client.get_peers_from_table(&table, supervisor.metadata.info_hash).await;
                        for addr in peers {
                            let _ = supervisor.discovery_tx.send(PeerCandidate { addr, source: PeerSource::Dht }).await;
                        }
                    }
                }
            }
        });
        self.spawn_job("dht", handle).await;
    }

    /// Every `PEX_INTERVAL`, tells each peer that negotiated `ut_pex` about
    /// up to `PEX_MAX_PEERS` other peers currently connected to this
    /// torrent. We don't yet track per-peer "dropped since last message"
    /// state, so every message's `dropped` list is empty.
    async fn spawn_pex_loop(self: &Arc<Self>) {
        const PEX_INTERVAL: Duration = Duration::from_secs(30);
        const PEX_MAX_PEERS: usize = 50;

        let supervisor = Arc::clone(self);
        let cancellation = self.cancellation.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(PEX_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancellation.cancelled() => return,
                    _ = interval.tick() => {
                        let connected = supervisor.swarm.connected_addrs();
                        for &addr in &connected {
                            let Some(connection) = supervisor.swarm.connection(addr) else { continue };
                            let remote_pex_id = {
                                let remote = connection.remote_extensions.read().await;
                                remote.as_ref().and_then(|r| r.id_for(crate::peer::extension::UT_PEX_NAME))
                            };
                            let Some(remote_pex_id) = remote_pex_id else { continue };

                            let added: Vec<SocketAddr> = connected
                                .iter()
                                .filter(|&&other| other != addr)
                                .take(PEX_MAX_PEERS)
                                .copied()
                                .collect();
                            if added.is_empty() {
                                continue;
                            }
                            let message = crate::peer::extension::PexMessage { added, dropped: Vec::new() };
                            let _ = connection.wire.send(&message.encode(remote_pex_id)).await;
                        }
                    }
                }
            }
        });
        self.spawn_job("pex", handle).await;
    }

    async fn spawn_maintenance_loop(self: &Arc<Self>) {
        let supervisor = Arc::clone(self);
        let cancellation = self.cancellation.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(supervisor.config.choke_rotation_interval);
            loop {
                tokio::select! {
                    _ = cancellation.cancelled() => return,
                    _ = interval.tick() => {
                        supervisor.swarm.run_choke_round().await;
                        supervisor.swarm.reclaim_stale().await;
                        let already_seeding = *supervisor.state.lock().await == TorrentState::Seeding;
                        if supervisor.swarm.is_complete() && !already_seeding {
                            supervisor.sink.on_download_complete(supervisor.metadata.info_hash);
                            supervisor.set_state(TorrentState::Seeding).await;
                        }
                    }
                }
            }
        });
        self.spawn_job("maintenance", handle).await;
    }

    /// Reports `downloaded`/`uploaded` totals and their instantaneous rates
    /// to the sink every `STATS_INTERVAL`, satisfying the "at most once per
    /// 250 ms" cadence on `on_progress`.
    async fn spawn_stats_loop(self: &Arc<Self>) {
        const STATS_INTERVAL: Duration = Duration::from_millis(250);

        let supervisor = Arc::clone(self);
        let cancellation = self.cancellation.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(STATS_INTERVAL);
            let mut last_downloaded = 0u64;
            let mut last_uploaded = 0u64;
            loop {
                tokio::select! {
                    _ = cancellation.cancelled() => return,
                    _ = interval.tick() => {
                        let downloaded = supervisor.downloaded.load(Ordering::Relaxed);
                        let uploaded = supervisor.uploaded.load(Ordering::Relaxed);
                        let millis = STATS_INTERVAL.as_millis() as u64;
                        let download_rate = downloaded.saturating_sub(last_downloaded) * 1000 / millis;
                        let upload_rate = uploaded.saturating_sub(last_uploaded) * 1000 / millis;
                        last_downloaded = downloaded;
                        last_uploaded = uploaded;
                        supervisor
                            .sink
                            .on_progress(supervisor.metadata.info_hash, downloaded, uploaded, download_rate, upload_rate);
                    }
                }
            }
        });
        self.spawn_job("stats", handle).await;
    }

    /// Binds the configured listen port and accepts inbound peer
    /// connections for the lifetime of the torrent.
    async fn spawn_listener_loop(self: &Arc<Self>) {
        let supervisor = Arc::clone(self);
        let cancellation = self.cancellation.clone();
        let handle = tokio::spawn(async move {
            let listener = match tokio::net::TcpListener::bind(("0.0.0.0", supervisor.config.listen_port)).await {
                Ok(listener) => listener,
                Err(err) => {
                    warn!(error = %err, "listen port bind failed, inbound peers disabled");
                    supervisor
                        .sink
                        .on_error(supervisor.metadata.info_hash, &format!("listen bind failed: {err}"));
                    let _ = supervisor.listen_addr.send(None);
                    return;
                }
            };
            let bound = listener.local_addr().ok();
            info!(addr = ?bound, "listening for inbound peers");
            let _ = supervisor.listen_addr.send(bound);
            loop {
                tokio::select! {
                    _ = cancellation.cancelled() => return,
                    accepted = listener.accept() => {
                        let Ok((stream, addr)) = accepted else { continue };
                        if supervisor.swarm.admit(addr).is_err() {
                            continue;
                        }
                        let supervisor = Arc::clone(&supervisor);
                        tokio::spawn(async move {
                            let reserved = ReservedBits::new().with_extension_protocol().with_dht();
                            let handshake = Handshake::new(supervisor.metadata.info_hash, supervisor.peer_id, reserved);
                            match PeerWire::accept(stream, &handshake).await {
                                Ok((_, their_handshake)) if their_handshake.peer_id == supervisor.peer_id => {
                                    debug!(%addr, "dropping self-connection");
                                }
                                Ok((wire, their_handshake)) if their_handshake.info_hash == supervisor.metadata.info_hash => {
                                    let remote_supports_extensions = their_handshake.reserved.supports_extension_protocol();
                                    supervisor.on_connection_ready(addr, wire, remote_supports_extensions).await;
                                }
                                Ok(_) => warn!(%addr, "inbound handshake for a different torrent"),
                                Err(err) => warn!(%addr, error = %err, "inbound handshake failed"),
                            }
                        });
                    }
                }
            }
        });
        self.spawn_job("listener", handle).await;
    }

    /// Dials a candidate peer address, performs the handshake, and on
    /// success registers the connection with the swarm. Bounded by both the
    /// swarm's admission rules and a separate half-open-connection cap, and
    /// subject to `connect_timeout`.
    async fn try_dial(self: &Arc<Self>, addr: SocketAddr) {
        if self.swarm.admit(addr).is_err() {
            return;
        }
        if !self.swarm.try_begin_half_open() {
            return;
        }
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let stream = match dial_tuned(addr, supervisor.config.connect_timeout).await {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(%addr, error = %err, "dial failed");
                    supervisor.swarm.record_dial_failure(addr);
                    supervisor.swarm.end_half_open();
                    return;
                }
            };
            supervisor.swarm.end_half_open();
            let reserved = ReservedBits::new().with_extension_protocol().with_dht();
            let handshake = Handshake::new(supervisor.metadata.info_hash, supervisor.peer_id, reserved);
            match PeerWire::connect(stream, &handshake).await {
                Ok((_, their_handshake)) if their_handshake.peer_id == supervisor.peer_id => {
                    debug!(%addr, "dropping self-connection");
                }
                Ok((wire, their_handshake)) => {
                    let remote_supports_extensions = their_handshake.reserved.supports_extension_protocol();
                    supervisor.on_connection_ready(addr, wire, remote_supports_extensions).await;
                }
                Err(err) => {
                    warn!(%addr, error = %err, "handshake failed");
                }
            }
        });
    }

    /// Common post-handshake setup shared by inbound and outbound
    /// connections: registers with the swarm, advertises our bitfield and
    /// extension handshake, and spawns the task pumping this peer's
    /// incoming messages.
    async fn on_connection_ready(self: &Arc<Self>, addr: SocketAddr, wire: PeerWire, remote_supports_extensions: bool) {
        let wire = Arc::new(wire);
        self.swarm.register(addr, Arc::clone(&wire)).await;
        self.sink.on_peer_connected(self.metadata.info_hash, addr);

        if remote_supports_extensions {
            let _ = wire.send(&crate::peer::extension::LocalExtensions::default().handshake_message()).await;
        }
        // Always advertise our bitfield, even an all-zero one, so the peer
        // doesn't have to guess whether we simply have nothing yet.
        let bitfield = self.swarm.completed_bitfield().await;
        let _ = wire.send(&Message::Bitfield(bitfield)).await;

        self.spawn_peer_loop(addr, wire).await;
    }

    /// Pumps one peer's incoming messages for the life of the connection,
    /// dispatching each to the swarm, storage, and discovery aggregator as
    /// appropriate. Exits (and unregisters the peer) on any read error,
    /// protocol violation, or supervisor shutdown.
    async fn spawn_peer_loop(self: &Arc<Self>, addr: SocketAddr, wire: Arc<PeerWire>) {
        let supervisor = Arc::clone(self);
        let cancellation = self.cancellation.clone();
        let handle = tokio::spawn(async move {
            let piece_count = supervisor.metadata.piece_count();
            loop {
                let message = tokio::select! {
                    _ = cancellation.cancelled() => break,
                    message = wire.recv(piece_count) => message,
                };
                match message {
                    Ok(message) => {
                        if let Err(err) = supervisor.handle_peer_message(addr, &wire, message).await {
                            warn!(%addr, error = %err, "dropping peer after message handling error");
                            break;
                        }
                    }
                    Err(err) => {
                        debug!(%addr, error = %err, "peer connection closed");
                        break;
                    }
                }
            }
            supervisor.swarm.unregister(addr).await;
            supervisor.sink.on_peer_disconnected(supervisor.metadata.info_hash, addr);
        });
        self.spawn_job("peer", handle).await;
    }

    async fn handle_peer_message(self: &Arc<Self>, addr: SocketAddr, wire: &Arc<PeerWire>, message: Message) -> Result<()> {
        let Some(connection) = self.swarm.connection(addr) else {
            return Ok(());
        };
        match message {
            Message::KeepAlive => {}
            Message::Choke => {
                connection.peer_is_choking.store(true, Ordering::Relaxed);
            }
            Message::Unchoke => {
                connection.peer_is_choking.store(false, Ordering::Relaxed);
                self.swarm.fill_pipeline(addr).await?;
            }
            Message::Interested => {
                connection.peer_is_interested.store(true, Ordering::Relaxed);
            }
            Message::NotInterested => {
                connection.peer_is_interested.store(false, Ordering::Relaxed);
            }
            Message::Have { index } => {
                self.swarm.on_have(addr, index).await;
                self.swarm.fill_pipeline(addr).await?;
            }
            Message::Bitfield(bitfield) => {
                self.swarm.on_bitfield(addr, bitfield).await;
                wire.send(&Message::Interested).await?;
                connection.we_are_interested.store(true, Ordering::Relaxed);
                self.swarm.fill_pipeline(addr).await?;
            }
            Message::Request { index, begin, length } => {
                if !connection.we_are_choking.load(Ordering::Relaxed) {
                    if let Ok(block) = self.storage.read_block(index, begin, length, &self.metadata).await {
                        self.global_upload_limiter.wait_for(u64::from(length)).await;
                        self.per_torrent_upload_limiter.wait_for(u64::from(length)).await;
                        wire.send(&Message::Piece { index, begin, block: block.into() }).await?;
                        self.uploaded.fetch_add(u64::from(length), Ordering::Relaxed);
                        connection.downloaded_from_us.fetch_add(u64::from(length), Ordering::Relaxed);
                    }
                }
            }
            Message::Piece { index, begin, block } => {
                connection.uploaded_to_us.fetch_add(block.len() as u64, Ordering::Relaxed);
                if let Some(data) = self.swarm.on_piece(addr, index, begin, &block).await {
                    match self.storage.write_piece(index, &data, &self.metadata).await {
                        Ok(()) => {
                            self.swarm.mark_piece_complete(index);
                            self.downloaded.fetch_add(data.len() as u64, Ordering::Relaxed);
                            self.sink.on_piece_verified(self.metadata.info_hash, index);
                        }
                        Err(err @ crate::error::Error::HashMismatch { .. }) => {
                            self.sink.on_piece_failed(self.metadata.info_hash, index);
                            warn!(index, error = %err, "piece failed verification, will be re-requested");
                        }
                        Err(err) => {
                            error!(index, error = %err, "storage write failed, transitioning torrent to error state");
                            self.sink
                                .on_error(self.metadata.info_hash, &format!("storage write failed: {err}"));
                            self.set_state(TorrentState::Error).await;
                        }
                    }
                }
                self.swarm.fill_pipeline(addr).await?;
            }
            Message::Cancel { .. } => {}
            Message::Extended { id, payload } => {
                self.handle_extended_message(&connection, id, &payload).await?;
            }
        }
        Ok(())
    }

    async fn handle_extended_message(
        self: &Arc<Self>,
        connection: &Arc<crate::swarm::PeerConnection>,
        id: u8,
        payload: &[u8],
    ) -> Result<()> {
        use crate::peer::extension::{LocalExtensions, RemoteExtensions};

        if id == crate::peer::extension::EXTENDED_HANDSHAKE_ID {
            if let Ok(remote) = RemoteExtensions::parse(payload) {
                *connection.remote_extensions.write().await = Some(remote);
            }
            return Ok(());
        }

        let local = LocalExtensions::default();
        if id == local.ut_pex_id {
            if let Ok(pex) = crate::peer::extension::PexMessage::parse(payload) {
                for candidate_addr in pex.added {
                    let _ = self
                        .discovery_tx
                        .send(PeerCandidate { addr: candidate_addr, source: PeerSource::Pex })
                        .await;
                }
            }
        }
        Ok(())
    }

    /// Cancels every background task and waits up to `grace_period` for
    /// them to exit cleanly before abandoning the stragglers.
    pub async fn shutdown(&self, grace_period: Duration) {
        self.cancellation.cancel();
        let mut jobs = self.jobs.lock().await;
        for job in jobs.drain(..) {
            match tokio::time::timeout(grace_period, job.handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!(job = job.name, error = %err, "job panicked"),
                Err(_) => warn!(job = job.name, "job did not exit within grace period, abandoning"),
            }
        }
    }

    pub fn peer_count(&self) -> usize {
        self.swarm.peer_count()
    }

    pub fn info_hash(&self) -> [u8; 20] {
        self.metadata.info_hash
    }

    pub fn is_complete(&self) -> bool {
        self.swarm.is_complete()
    }

    /// Waits for the inbound listener to bind and returns its address, or
    /// `None` if the listener failed to bind at all.
    pub async fn listen_addr(&self) -> Option<SocketAddr> {
        let mut rx = self.listen_addr.subscribe();
        if let Some(addr) = *rx.borrow() {
            return Some(addr);
        }
        loop {
            if rx.changed().await.is_err() {
                return None;
            }
            if let Some(addr) = *rx.borrow() {
                return Some(addr);
            }
        }
    }

    /// Manually connects to a peer at `addr`, bypassing discovery. Useful
    /// for tests and for a user-supplied "add peer" action.
    pub async fn dial(self: &Arc<Self>, addr: SocketAddr) {
        self.try_dial(addr).await;
    }
}

/// Builds an outbound socket with zero linger (so a reset peer doesn't
/// leave us in `TIME_WAIT`) and 256 KiB send/recv buffers, connects it
/// within `timeout`, then disables Nagle on the resulting stream.
async fn dial_tuned(addr: SocketAddr, timeout: Duration) -> std::io::Result<tokio::net::TcpStream> {
    let socket = if addr.is_ipv4() {
        tokio::net::TcpSocket::new_v4()?
    } else {
        tokio::net::TcpSocket::new_v6()?
    };
    socket.set_linger(Some(Duration::ZERO))?;
    socket.set_recv_buffer_size(256 * 1024)?;
    socket.set_send_buffer_size(256 * 1024)?;

    let stream = match tokio::time::timeout(timeout, socket.connect(addr)).await {
        Ok(result) => result?,
        Err(_) => return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out")),
    };
    stream.set_nodelay(true)?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lifecycle_starts_and_shuts_down_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let data = vec![1u8; 16384];
        let metadata = build_single_file_metadata(&data);
        let (sink, _rx) = crate::callbacks::ChannelSink::new();
        let supervisor = TorrentSupervisor::start(
            metadata,
            dir.path(),
            EngineConfig {
                listen_port: 0,
                enable_dht: false,
                enable_lsd: false,
                ..EngineConfig::default()
            },
            Arc::new(TokenBucket::global(0)),
            Arc::new(TokenBucket::global(0)),
            Arc::new(sink),
        )
        .await
        .unwrap();

        assert_eq!(supervisor.peer_count(), 0);
        supervisor.shutdown(Duration::from_secs(1)).await;
    }

    fn build_single_file_metadata(data: &[u8]) -> Metadata {
        use crate::bencode::{self, Value};
        use sha1_smol::Sha1;

        let mut hasher = Sha1::new();
        hasher.update(data);
        let hash = hasher.digest().bytes();
        let info = Value::Dict(vec![
            (b"name".to_vec(), Value::string("file.bin")),
            (b"piece length".to_vec(), Value::Int(data.len() as i64)),
            (b"pieces".to_vec(), Value::bytes(hash.to_vec())),
            (b"length".to_vec(), Value::Int(data.len() as i64)),
        ]);
        let top = Value::Dict(vec![
            (b"announce".to_vec(), Value::string("http://tracker.example/announce")),
            (b"info".to_vec(), info),
        ]);
        Metadata::parse(&bencode::encode(&top)).unwrap()
    }
}
