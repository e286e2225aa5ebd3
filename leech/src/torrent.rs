use std::{
    collections::{BTreeSet, HashMap},
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, watch},
    task,
    time::{self, Instant},
};
use crate::{
    config::Config,
    metainfo::{MetaInfo, MetaInfoError},
    p2p::{PeerCommand, PeerHandle, PeerSession},
    registry,
    store::{PieceStore, StoreInfo},
    tracker::{Announce, AnnounceParams, Event, Tracker, TrackerError},
    Bitfield, ID,
};

#[derive(Debug, thiserror::Error)]
pub enum TorrentError {

    #[error(transparent)]
    MetaInfo(#[from] MetaInfoError),

    #[error("tracker error: {0}")]
    Tracker(#[from] TrackerError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("channel error: {0}")]
    Channel(String),

}

impl<T> From<mpsc::error::SendError<T>> for TorrentError {
    fn from(e: mpsc::error::SendError<T>) -> Self {
        TorrentError::Channel(e.to_string())
    }
}

// Terminal state reported through the torrent handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TorrentStatus {

    // Every piece verified and on disk.
    Complete,

    // Stopped on request before completing.
    Stopped,

    Failed(String),

}

pub enum CommandToTorrent {

    // Sent by a peer task once its handshake succeeds.
    PeerConnected { address: SocketAddr, id: ID },

    // A peer session ended, whichever way.
    PeerDisconnected { address: SocketAddr },

    // Sent by a peer task after a piece was verified and written.
    PieceDownloaded { idx: usize },

    // A session hit an IO error writing to the store; not survivable.
    StorageFailure(String),

    Shutdown,

}

pub type Result<T> = std::result::Result<T, TorrentError>;
pub type TorrentTx = mpsc::UnboundedSender<CommandToTorrent>;
pub type TorrentRx = mpsc::UnboundedReceiver<CommandToTorrent>;

// Read-only state shared with every peer session of this torrent.
#[derive(Debug)]
pub struct TorrentContext {

    pub info_hash: ID,

    pub client_id: ID,

    pub store: Arc<PieceStore>,

    pub torrent_tx: TorrentTx,

    pub upload_bps: u64,

    // Session byte counters feeding the tracker announces. Eventually
    // consistent is good enough.
    pub uploaded: AtomicU64,

    pub downloaded: AtomicU64,

}

pub struct TorrentParams {

    pub metainfo: MetaInfo,

    pub config: Config,

    pub torrent_tx: TorrentTx,

    pub torrent_rx: TorrentRx,

}

// Coordinator for a single torrent: owns the have/missing sets, the live
// peer sessions and the tracker cadence.
pub struct Torrent {

    ctx: Arc<TorrentContext>,

    // Pieces we own and have verified.
    have: Bitfield,

    // Complement of have; empty means complete.
    missing: BTreeSet<usize>,

    // Peers we have active sessions with.
    peers: HashMap<SocketAddr, PeerHandle>,

    // Peers we know about but have no session with.
    available: Vec<SocketAddr>,

    tracker: Tracker,

    torrent_rx: TorrentRx,

    config: Config,

}

impl Torrent {

    pub async fn new(params: TorrentParams) -> Result<Torrent> {

        let TorrentParams { metainfo, config, torrent_tx, torrent_rx } = params;

        let info = StoreInfo::new(&metainfo);
        let piece_hashes = metainfo.piece_hashes();
        let dir = config.dir.clone();
        let name = metainfo.name().to_owned();

        // The resume scan hashes the whole file; keep it off the runtime
        // workers.
        let (store, have) = task::spawn_blocking(move || {
            PieceStore::open(&dir, &name, info, piece_hashes)
        })
        .await
        .map_err(|e| TorrentError::Channel(e.to_string()))??;

        let missing = have.iter_zeros().collect();

        Ok(Torrent {
            ctx: Arc::new(TorrentContext {
                info_hash: metainfo.info_hash(),
                client_id: config.client_id,
                store: Arc::new(store),
                torrent_tx,
                upload_bps: config.upload_bps,
                uploaded: AtomicU64::new(0),
                downloaded: AtomicU64::new(0),
            }),
            have,
            missing,
            peers: HashMap::new(),
            available: Vec::new(),
            tracker: Tracker::new(metainfo.announce().clone()),
            torrent_rx,
            config,
        })
    }

    // Runs the torrent to its end and reports the final status through the
    // watch channel, cleaning up the registry either way.
    pub async fn start(&mut self, done_tx: watch::Sender<Option<TorrentStatus>>) {
        let status = match self.run().await {
            Ok(status) => status,
            Err(e) => {
                tracing::error!("torrent error: {}", e);
                TorrentStatus::Failed(e.to_string())
            }
        };
        self.disconnect_peers().await;
        registry::remove(&self.ctx.info_hash);
        done_tx.send(Some(status)).ok();
    }

    #[tracing::instrument(skip(self), name = "torrent", fields(info_hash = %hex::encode(self.ctx.info_hash)))]
    async fn run(&mut self) -> Result<TorrentStatus> {

        if self.missing.is_empty() {
            tracing::info!("torrent complete on open");
            return Ok(TorrentStatus::Complete);
        }
        tracing::info!(
            "starting torrent, {}/{} pieces to fetch",
            self.missing.len(),
            self.ctx.store.info().num_pieces,
        );

        let listener = TcpListener::bind(self.config.listen_address).await?;
        let listen_port = listener.local_addr()?.port();
        tracing::info!("listening on {}", listener.local_addr()?);

        let mut next_announce = Instant::now();
        let mut interval = self.config.announce_interval;
        let mut event = Some(Event::Started);

        // Top level torrent loop.
        loop { tokio::select! {

            _ = time::sleep_until(next_announce) => {
                match self.announce(event, listen_port).await {
                    Ok(announce) => {
                        event = None;
                        if let Some(i) = announce.interval {
                            interval = i;
                        } else if announce.peers.is_empty() {
                            // Empty response: poll again soon.
                            interval = self.config.announce_retry;
                        }
                        next_announce = Instant::now() + interval;
                        self.connect_to_peers();
                    }
                    Err(e) => {
                        tracing::warn!("announce failed: {}", e);
                        next_announce = Instant::now() + self.config.announce_retry;
                    }
                }
            }

            conn = listener.accept() => match conn {
                Ok((stream, address)) => {
                    if self.peers.len() < self.config.max_peers {
                        self.spawn_session(address, Some(stream));
                    }
                }
                Err(e) => tracing::warn!("inbound peer connection error: {}", e),
            },

            Some(cmd) = self.torrent_rx.recv() => match cmd {

                CommandToTorrent::PeerConnected { address, id } => {
                    if let Some(peer) = self.peers.get_mut(&address) {
                        tracing::debug!("peer {} identified as {:?}", address, String::from_utf8_lossy(&id));
                        peer.id = Some(id);
                    }
                }

                CommandToTorrent::PeerDisconnected { address } => {
                    self.peers.remove(&address);
                }

                CommandToTorrent::PieceDownloaded { idx } => {
                    if self.handle_piece_downloaded(idx) {
                        if let Err(e) = self.ctx.store.finalize() {
                            tracing::warn!("could not finalize download file: {}", e);
                        }
                        self.announce(Some(Event::Stopped), listen_port).await.ok();
                        tracing::info!("torrent download complete");
                        return Ok(TorrentStatus::Complete);
                    }
                }

                CommandToTorrent::StorageFailure(e) => {
                    // Leave the .download in place for the next run's resume.
                    return Err(TorrentError::Storage(e));
                }

                CommandToTorrent::Shutdown => {
                    self.announce(Some(Event::Stopped), listen_port).await.ok();
                    return Ok(TorrentStatus::Stopped);
                }
            },
        }}
    }

    // Moves a completed piece out of missing and fans the news out to every
    // session. Idempotent: duplicate completions from racing sessions are
    // dropped. Returns whether the torrent just completed.
    fn handle_piece_downloaded(&mut self, idx: usize) -> bool {

        if !self.missing.remove(&idx) {
            tracing::debug!("ignoring duplicate completion of piece {}", idx);
            return false;
        }
        self.have.set(idx, true);
        tracing::info!("piece {} downloaded, {} pieces remain", idx, self.missing.len());

        for peer in self.peers.values() {
            peer.peer_tx.send(PeerCommand::HavePiece(idx)).ok();
        }

        self.missing.is_empty()
    }

    async fn announce(&mut self, event: Option<Event>, port: u16) -> Result<Announce> {

        // Exact byte count still to fetch; the last piece may be short.
        let left: u64 = self.missing
            .iter()
            .map(|&idx| self.ctx.store.info().piece_length(idx) as u64)
            .sum();

        let params = AnnounceParams {
            info_hash: self.ctx.info_hash,
            client_id: self.ctx.client_id,
            port,
            uploaded: self.ctx.uploaded.load(Ordering::Relaxed),
            downloaded: self.ctx.downloaded.load(Ordering::Relaxed),
            left,
            event,
        };

        let announce = self.tracker.announce(&params).await?;
        tracing::debug!("tracker returned {} peers", announce.peers.len());

        for address in &announce.peers {
            if !self.peers.contains_key(address) && !self.available.contains(address) {
                self.available.push(*address);
            }
        }
        Ok(announce)
    }

    fn connect_to_peers(&mut self) {
        let count = self.available
            .len()
            .min(self.config.max_peers.saturating_sub(self.peers.len()));
        if count == 0 {
            return;
        }
        tracing::info!("connecting to {} peers", count);
        for address in self.available.drain(0..count).collect::<Vec<_>>() {
            self.spawn_session(address, None);
        }
    }

    fn spawn_session(&mut self, address: SocketAddr, stream: Option<TcpStream>) {
        if self.peers.contains_key(&address) {
            return;
        }
        let (mut session, peer_tx) =
            PeerSession::new(address, Arc::clone(&self.ctx), self.have.clone());
        let session_handle = tokio::spawn(async move { session.start(stream).await });
        self.peers.insert(
            address,
            PeerHandle {
                id: None,
                peer_tx,
                session_handle: Some(session_handle),
            },
        );
    }

    async fn disconnect_peers(&mut self) {
        if self.peers.is_empty() {
            return;
        }
        tracing::info!("disconnecting from {} peers", self.peers.len());
        for peer in self.peers.values() {
            peer.peer_tx.send(PeerCommand::Shutdown).ok();
        }
        for (_, mut peer) in self.peers.drain() {
            if let Some(handle) = peer.session_handle.take() {
                handle.await.ok();
            }
        }
    }
}
