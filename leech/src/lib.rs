use std::path::Path;
use tokio::sync::{mpsc, watch};

mod block;
mod config;
mod metainfo;
mod p2p;
mod piece;
mod registry;
mod store;
mod torrent;
mod tracker;

// Most commonly used block size - 16KB.
pub const BLOCK_SIZE: usize = 0x4000;

// Upper bound on requests outstanding on the wire per peer session.
pub const MAX_INFLIGHT: usize = 8;

type Bitfield = bitvec::vec::BitVec<u8, bitvec::order::Msb0>;

// 20 byte SHA1 hash, used for info hashes and peer ids.
pub type ID = [u8; 20];

// Re-exports
pub use config::Config;
pub use metainfo::{MetaInfo, MetaInfoError};
pub use torrent::{TorrentError, TorrentStatus};

use torrent::{CommandToTorrent, Torrent, TorrentParams, TorrentTx};

// Handle to a running torrent. Cloneable; every clone observes the same
// coordinator through the process registry.
#[derive(Debug, Clone)]
pub struct TorrentHandle {

    info_hash: ID,

    torrent_tx: TorrentTx,

    done: watch::Receiver<Option<TorrentStatus>>,

}

impl TorrentHandle {

    pub fn info_hash(&self) -> ID {
        self.info_hash
    }

    // Ask the coordinator to stop. The final status arrives through wait().
    pub fn shutdown(&self) {
        self.torrent_tx.send(CommandToTorrent::Shutdown).ok();
    }

    // Resolves once the coordinator has exited.
    pub async fn wait(&mut self) -> TorrentStatus {
        loop {
            if let Some(status) = self.done.borrow().clone() {
                return status;
            }
            if self.done.changed().await.is_err() {
                return TorrentStatus::Failed("torrent task dropped".into());
            }
        }
    }
}

// Starts downloading (and seeding) the torrent described by a .torrent file.
// Idempotent by info-hash: if a coordinator for this torrent is already
// running in the process, its handle is returned instead of starting a second
// one. Must be called from within a tokio runtime.
pub fn download<P: AsRef<Path>>(path: P, config: Config) -> Result<TorrentHandle, TorrentError> {

    let metainfo = MetaInfo::new(path.as_ref())?;
    let info_hash = metainfo.info_hash();

    if let Some(handle) = registry::find(&info_hash) {
        tracing::info!("torrent {} already running", hex::encode(info_hash));
        return Ok(handle);
    }

    let (torrent_tx, torrent_rx) = mpsc::unbounded_channel();
    let (done_tx, done_rx) = watch::channel(None);
    let handle = TorrentHandle {
        info_hash,
        torrent_tx: torrent_tx.clone(),
        done: done_rx,
    };
    registry::insert(info_hash, handle.clone());

    tokio::spawn(async move {
        let params = TorrentParams {
            metainfo,
            config,
            torrent_tx,
            torrent_rx,
        };
        match Torrent::new(params).await {
            Ok(mut torrent) => torrent.start(done_tx).await,
            Err(e) => {
                tracing::error!("failed to start torrent: {}", e);
                registry::remove(&info_hash);
                done_tx.send(Some(TorrentStatus::Failed(e.to_string()))).ok();
            }
        }
    });

    Ok(handle)
}

// Looks up the running coordinator for an info-hash.
pub fn find(info_hash: &ID) -> Option<TorrentHandle> {
    registry::find(info_hash)
}
