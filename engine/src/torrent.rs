use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use futures::stream::{self, StreamExt};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
    time,
};

use crate::{
    config::{ClientIdentity, EngineConfig},
    crypto::Digest,
    descriptor::{Descriptor, DescriptorError},
    layout::TorrentLayout,
    p2p::{state::SessionState, PeerCommand, PeerHandle},
    picker::Picker,
    piece_store::{PieceStore, PieceStoreError},
    stats::{PeerStats, PieceStats, ThroughputStats, TorrentStats},
    tracker::{AnnounceParams, Event, Tracker},
};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),

    #[error(transparent)]
    PieceStore(#[from] PieceStoreError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("piece {0} failed verification from {1} distinct peers; giving up on it")]
    IrrecoverablePiece(usize, u32),

    #[error("internal command channel closed")]
    ChannelClosed,
}

impl<T> From<mpsc::error::SendError<T>> for EngineError {
    fn from(_: mpsc::error::SendError<T>) -> Self {
        EngineError::ChannelClosed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TorrentState {
    Connecting,
    Downloading,
    Seeding,
    Error,
}

impl Default for TorrentState {
    fn default() -> Self {
        TorrentState::Connecting
    }
}

// Out-of-band notifications sessions (or the dialer) raise to the torrent task.
pub enum TorrentCommand {
    PeerConnected { address: SocketAddr, id: [u8; 20] },
    PeerState { address: SocketAddr, state: SessionState },
    BadPiece { idx: usize, peer: SocketAddr },
    Uploaded(u64),
    Peers(Vec<SocketAddr>),
    Shutdown,
}

pub type TorrentTx = mpsc::UnboundedSender<TorrentCommand>;
type TorrentRx = mpsc::UnboundedReceiver<TorrentCommand>;

// Read-mostly state shared by every peer session belonging to this torrent.
pub struct TorrentContext {
    pub descriptor_id: [u8; 32],
    pub client_id: [u8; 20],
    pub picker: Picker,
    pub torrent_tx: TorrentTx,
    pub store: Arc<PieceStore>,
    pub layout: TorrentLayout,
    pub config: Arc<EngineConfig>,

    // Once every piece is held, sessions stop issuing INTERESTED/REQUEST
    // entirely; set exactly once, the moment the last piece commits.
    pub is_seed: AtomicBool,
}

struct TrackerEntry {
    tracker: Box<dyn Tracker>,
    last_announce: Option<Instant>,
    interval: Duration,
}

pub struct Torrent {
    ctx: Arc<TorrentContext>,
    torrent_tx: TorrentTx,
    torrent_rx: TorrentRx,
    dial_tx: mpsc::UnboundedSender<(SocketAddr, TcpStream)>,
    dial_rx: mpsc::UnboundedReceiver<(SocketAddr, TcpStream)>,
    peers: HashMap<SocketAddr, PeerHandle>,
    trackers: Vec<Vec<TrackerEntry>>,
    bad_piece_peers: HashMap<usize, HashSet<SocketAddr>>,
    uploaded: u64,
    downloaded: u64,
    completed_announced: bool,
    start_time: Option<Instant>,
}

impl Torrent {
    pub async fn new(
        descriptor: Descriptor,
        config: EngineConfig,
        identity: ClientIdentity,
        digest: Arc<dyn Digest>,
        trackers: Vec<Vec<Box<dyn Tracker>>>,
    ) -> Result<Self, EngineError> {
        let config = Arc::new(config);
        let layout = TorrentLayout::new(&descriptor);
        let store = Arc::new(PieceStore::new(&descriptor, layout.clone(), &config.output_dir, digest)?);

        let resumed = store.recompute_bitfield();
        let is_seed = resumed.all();
        tracing::info!(
            have = resumed.count_ones(),
            total = layout.num_pieces,
            "resumed piece ownership from disk"
        );

        let picker = Picker::new(layout.num_pieces, layout.piece_len, layout.last_piece_len);
        picker.piece_picker.write().await.set_own_bitfield(resumed);

        let (torrent_tx, torrent_rx) = mpsc::unbounded_channel();
        let (dial_tx, dial_rx) = mpsc::unbounded_channel();
        let client_id = identity.generate_peer_id();

        let ctx = Arc::new(TorrentContext {
            descriptor_id: descriptor.descriptor_id,
            client_id,
            picker,
            torrent_tx: torrent_tx.clone(),
            store,
            layout,
            config,
            is_seed: AtomicBool::new(is_seed),
        });

        let trackers = trackers
            .into_iter()
            .map(|tier| {
                tier.into_iter()
                    .map(|tracker| TrackerEntry { tracker, last_announce: None, interval: Duration::ZERO })
                    .collect()
            })
            .collect();

        Ok(Self {
            ctx,
            torrent_tx,
            torrent_rx,
            dial_tx,
            dial_rx,
            peers: HashMap::new(),
            trackers,
            bad_piece_peers: HashMap::new(),
            uploaded: 0,
            downloaded: 0,
            completed_announced: is_seed,
            start_time: None,
        })
    }

    pub fn sender(&self) -> TorrentTx {
        self.torrent_tx.clone()
    }

    #[tracing::instrument(name = "torrent", skip(self), fields(descriptor_id = %hex::encode(self.ctx.descriptor_id)))]
    pub async fn run(&mut self) -> Result<(), EngineError> {
        self.start_time = Some(Instant::now());

        let listener = TcpListener::bind(self.ctx.config.listen_address).await?;
        tracing::info!(address = %self.ctx.config.listen_address, "listening for inbound peers");

        let mut commits_rx = self.ctx.store.subscribe_commits();
        let mut announce_ticker = time::interval(Duration::from_secs(30));

        self.announce(Event::Started).await;

        let result = loop {
            tokio::select! {

                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, address)) => {
                            tracing::info!(%address, "inbound connection");
                            self.connect_peer(address, Some(stream), true);
                        }
                        Err(e) => tracing::warn!(error = %e, "failed to accept inbound connection"),
                    }
                }

                Some((address, stream)) = self.dial_rx.recv() => {
                    if !self.peers.contains_key(&address) {
                        tracing::debug!(%address, "outbound connection successful");
                        self.connect_peer(address, Some(stream), false);
                    }
                }

                Some(cmd) = self.torrent_rx.recv() => {
                    match self.handle_command(cmd).await {
                        Ok(true) => {}
                        Ok(false) => break Ok(()),
                        Err(e) => break Err(e),
                    }
                }

                Ok(idx) = commits_rx.recv() => {
                    if let Err(e) = self.handle_committed_piece(idx).await {
                        break Err(e);
                    }
                }

                _ = announce_ticker.tick() => self.announce(Event::Started).await,
            }
        };

        self.shutdown().await;
        result
    }

    fn connect_peer(&mut self, address: SocketAddr, stream: Option<TcpStream>, inbound: bool) {
        if self.peers.len() >= self.ctx.config.max_peers as usize || self.peers.contains_key(&address) {
            return;
        }
        let handle = PeerHandle::start_session(address, self.ctx.clone(), stream, inbound);
        self.peers.insert(address, handle);
    }

    async fn handle_command(&mut self, cmd: TorrentCommand) -> Result<bool, EngineError> {
        match cmd {
            TorrentCommand::PeerConnected { address, id } => {
                if let Some(handle) = self.peers.get_mut(&address) {
                    handle.id = Some(id);
                }
            }

            TorrentCommand::PeerState { address, state } => {
                if let Some(handle) = self.peers.get_mut(&address) {
                    handle.state = state;
                }
            }

            TorrentCommand::BadPiece { idx, peer } => {
                let culprits = self.bad_piece_peers.entry(idx).or_default();
                culprits.insert(peer);
                tracing::warn!(idx, peers = culprits.len(), "piece reported bad");
                if culprits.len() as u32 >= self.ctx.config.max_bad_piece_peers {
                    return Err(EngineError::IrrecoverablePiece(idx, culprits.len() as u32));
                }
            }

            TorrentCommand::Uploaded(bytes) => {
                self.uploaded += bytes;
            }

            TorrentCommand::Peers(addrs) => {
                if self.peers.len() < self.ctx.config.max_peers as usize {
                    let candidates: Vec<SocketAddr> =
                        addrs.into_iter().filter(|a| !self.peers.contains_key(a)).collect();
                    if !candidates.is_empty() {
                        tracing::debug!(count = candidates.len(), "dialing candidate peers");
                        spawn_dialer(candidates, self.ctx.config.clone(), self.dial_tx.clone());
                    }
                }
            }

            TorrentCommand::Shutdown => return Ok(false),
        }
        Ok(true)
    }

    // A piece committed (by any peer's session): update central picker
    // bookkeeping and detect the downloading -> seeding transition.
    async fn handle_committed_piece(&mut self, idx: usize) -> Result<(), EngineError> {
        self.downloaded += self.ctx.layout.piece_len(idx) as u64;
        self.ctx.picker.piece_picker.write().await.received_piece(idx);
        self.ctx.picker.partial_pieces.write().await.remove(&idx);
        self.bad_piece_peers.remove(&idx);

        if !self.ctx.is_seed.load(Ordering::Relaxed)
            && self.ctx.picker.piece_picker.read().await.all()
        {
            self.ctx.is_seed.store(true, Ordering::Relaxed);
            tracing::info!("all pieces verified; switching to seed-only mode");
            if !self.completed_announced {
                self.completed_announced = true;
                self.announce(Event::Completed).await;
            }
        }

        Ok(())
    }

    async fn bytes_left(&self) -> u64 {
        let missing = self.ctx.picker.piece_picker.read().await.own_bitfield().count_zeros();
        missing as u64 * self.ctx.layout.piece_len as u64
    }

    // Tries each tracker in a tier in order, falling through to the next
    // tier only if every tracker in the current one fails (BEP 12-style
    // multi-tier announce). A tracker that answers is moved to the front of
    // its tier so it's tried first next time.
    async fn announce(&mut self, event: Event) {
        let params = AnnounceParams {
            descriptor_id: self.ctx.descriptor_id,
            peer_id: self.ctx.client_id,
            port: self.ctx.config.listen_address.port(),
            uploaded: self.uploaded,
            downloaded: self.downloaded,
            left: self.bytes_left().await,
            event: Some(event),
            num_want: Some(50),
        };

        // Only Started is subject to the announce-interval throttle; Completed
        // and Stopped are one-shot notifications that must always go out.
        let forced = event != Event::Started;

        for tier in self.trackers.iter_mut() {
            for i in 0..tier.len() {
                let entry = &tier[i];
                if !forced {
                    if let Some(last) = entry.last_announce {
                        if last.elapsed() < entry.interval {
                            continue;
                        }
                    }
                }

                match tier[i].tracker.announce(params.clone()).await {
                    Ok(response) => {
                        tier[i].last_announce = Some(Instant::now());
                        tier[i].interval = Duration::from_secs(response.min_interval.unwrap_or(response.interval));
                        tracing::info!(peers = response.peers.len(), "tracker announce succeeded");
                        if !response.peers.is_empty() {
                            let _ = self.torrent_tx.send(TorrentCommand::Peers(response.peers));
                        }
                        if i > 0 {
                            tier.swap(0, i);
                        }
                        return;
                    }
                    Err(e) => tracing::warn!(error = %e, "tracker announce failed, trying next in tier"),
                }
            }
        }
    }

    async fn shutdown(&mut self) {
        tracing::info!("shutting down torrent");
        let peers = std::mem::take(&mut self.peers);
        for (_, handle) in peers {
            let _ = handle.peer_tx.send(PeerCommand::Shutdown);
            let _ = handle.session_handle.await;
        }
        self.announce(Event::Stopped).await;
    }

    pub async fn stats(&self) -> TorrentStats {
        let num_downloaded = {
            let piece_picker = self.ctx.picker.piece_picker.read().await;
            piece_picker.own_bitfield().count_ones()
        };
        let num_pending = self.ctx.picker.partial_pieces.read().await.len();

        let mut throughput = ThroughputStats::default();
        let peer_stats: Vec<PeerStats> = self
            .peers
            .iter()
            .map(|(address, handle)| {
                throughput += &handle.state.throughput;
                PeerStats { address: *address, state: handle.state }
            })
            .collect();

        TorrentStats {
            start_time: self.start_time,
            time_elapsed: self.start_time.map(|t| t.elapsed()).unwrap_or_default(),
            state: if self.ctx.is_seed.load(Ordering::Relaxed) {
                TorrentState::Seeding
            } else {
                TorrentState::Downloading
            },
            piece_stats: PieceStats {
                num_pieces: self.ctx.layout.num_pieces as usize,
                num_pending,
                num_downloaded,
            },
            peer_stats,
            throughput,
        }
    }
}

// Dials every candidate concurrently (bounded by `dial_concurrency`),
// retrying each with capped exponential backoff, and reports every
// successful connection back to the torrent's main loop; `Torrent::run`
// owns `peers` centrally rather than the dialer constructing sessions itself.
fn spawn_dialer(
    candidates: Vec<SocketAddr>,
    config: Arc<EngineConfig>,
    tx: mpsc::UnboundedSender<(SocketAddr, TcpStream)>,
) {
    tokio::spawn(async move {
        stream::iter(candidates)
            .for_each_concurrent(config.dial_concurrency, |address| {
                let config = config.clone();
                let tx = tx.clone();
                async move {
                    if let Some(stream) = dial_with_backoff(address, &config).await {
                        let _ = tx.send((address, stream));
                    }
                }
            })
            .await;
    });
}

async fn dial_with_backoff(address: SocketAddr, config: &EngineConfig) -> Option<TcpStream> {
    for attempt in 0..=config.dial_retry_cap {
        match time::timeout(Duration::from_secs(10), TcpStream::connect(address)).await {
            Ok(Ok(stream)) => return Some(stream),
            Ok(Err(e)) => tracing::debug!(%address, attempt, error = %e, "dial failed"),
            Err(_) => tracing::debug!(%address, attempt, "dial timed out"),
        }

        if attempt == config.dial_retry_cap {
            break;
        }
        let backoff = config
            .dial_backoff
            .get(attempt as usize)
            .copied()
            .unwrap_or_else(|| *config.dial_backoff.last().expect("dial_backoff is non-empty"));
        time::sleep(backoff).await;
    }

    tracing::debug!(%address, "exhausted dial attempts, giving up");
    None
}
