use std::{net::SocketAddr, sync::Arc};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::Instrument;
use crate::torrent::TorrentContext;

mod handshake;
mod message;
mod session;
pub mod state;

pub use session::PeerSession;
use state::SessionState;

type Result<T> = std::result::Result<T, PeerError>;
type PeerRx = mpsc::UnboundedReceiver<PeerCommand>;
pub type PeerTx = mpsc::UnboundedSender<PeerCommand>;

#[derive(thiserror::Error, Debug)]
pub enum PeerError {

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake provided incorrect protocol")]
    IncorrectProtocol,

    #[error("handshake descriptor id does not match the expected torrent")]
    HandshakeIdMismatch,

    #[error("no handshake received")]
    NoHandshake,

    #[error("invalid message ID: {0}")]
    InvalidMessageId(u8),

    #[error("bitfield sent after the first post-handshake message")]
    UnexpectedBitfield,

    #[error("invalid message payload")]
    InvalidMessage,

    #[error("peer timed out")]
    Timeout,
}

// Out-of-band commands that can be sent to a running peer session.
pub enum PeerCommand {
    Shutdown,
}

#[derive(Debug)]
pub struct PeerHandle {

    // Sends commands to the session.
    pub peer_tx: PeerTx,

    // Handle to the running session task.
    pub session_handle: JoinHandle<()>,

    // The peer's 20-byte id, learned once the handshake completes.
    pub id: Option<[u8; 20]>,

    // Tracks the state of the peer session.
    pub state: SessionState,

}

impl PeerHandle {
    // `inbound` decides handshake direction (who speaks first); `socket` is
    // `Some` whenever a stream is already connected, whether from our own
    // listener's accept or from the dialer having connected outbound.
    pub fn start_session(
        address: SocketAddr,
        ctx: Arc<TorrentContext>,
        socket: Option<tokio::net::TcpStream>,
        inbound: bool,
    ) -> Self {

        let (mut session, peer_tx) = PeerSession::new(address, ctx);
        let session_handle = tokio::spawn(async move {
            if let Err(e) = session.start_session(socket, inbound).await {
                tracing::warn!("session closed: {}", e);
            }
            session.disconnect().await;
        }.instrument(tracing::info_span!("peer", addr = %address)));

        PeerHandle {
            peer_tx,
            session_handle,
            id: None,
            state: SessionState::default(),
        }
    }
}
