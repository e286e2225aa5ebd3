use tokio::sync::mpsc;
use crate::ID;

mod handshake;
mod message;
mod session;

pub use session::PeerSession;

type Result<T, E = PeerError> = std::result::Result<T, E>;
pub type PeerTx = mpsc::UnboundedSender<PeerCommand>;
pub type PeerRx = mpsc::UnboundedReceiver<PeerCommand>;

#[derive(thiserror::Error, Debug)]
pub enum PeerError {

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake provided incorrect protocol")]
    IncorrectProtocol,

    #[error("handshake provided incorrect info-hash")]
    IncorrectInfoHash,

    #[error("no handshake received")]
    NoHandshake,

    #[error("frame of {0} bytes exceeds maximum")]
    FrameTooLong(usize),

    #[error("invalid message payload")]
    InvalidMessage,

    #[error("bitfield sent after introduction")]
    UnexpectedBitfield,

    #[error("inbound request queue overflow")]
    RequestOverflow,

    #[error("channel error: {0}")]
    Channel(String),

    #[error("connection timeout")]
    Timeout,

}

impl<T> From<mpsc::error::SendError<T>> for PeerError {
    fn from(e: mpsc::error::SendError<T>) -> Self {
        PeerError::Channel(e.to_string())
    }
}

// Commands from the coordinator to a peer session.
pub enum PeerCommand {

    // A piece completed locally: forward have, drop it from want, and cancel
    // any in-flight requests for it.
    HavePiece(usize),

    // End the peer session safely.
    Shutdown,

}

// The coordinator's view of a spawned session.
#[derive(Debug)]
pub struct PeerHandle {

    // Remote peer id, known once the handshake completes.
    pub id: Option<ID>,

    pub peer_tx: PeerTx,

    pub session_handle: Option<tokio::task::JoinHandle<()>>,

}
