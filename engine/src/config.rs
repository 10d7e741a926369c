use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

// Piece length bounds, in bytes: 16 KiB .. 2 MiB.
pub const MIN_PIECE_LENGTH: u32 = 16 * 1024;
pub const MAX_PIECE_LENGTH: u32 = 2 * 1024 * 1024;

pub const DEFAULT_LISTEN_PORT: u16 = 6881;

#[derive(Debug, Clone)]
pub struct EngineConfig {

    // Directory downloaded files are written into.
    pub output_dir: PathBuf,

    // Address the listener binds to.
    pub listen_address: SocketAddr,

    // Allowed piece-length interval for descriptors this engine will load.
    pub min_piece_length: u32,
    pub max_piece_length: u32,

    // Dialer: how many outbound connection attempts may be in flight at once.
    pub dial_concurrency: usize,

    // Dialer: attempts per candidate before giving up.
    pub dial_retry_cap: u32,

    // Dialer: base backoff schedule, one entry per retry (1s, 2s, 4s by default).
    pub dial_backoff: Vec<Duration>,

    // Scheduler: max in-flight block requests per peer.
    pub max_requests_per_peer: usize,

    // Scheduler: deadline for an in-flight request before it's considered timed out.
    pub request_timeout: Duration,

    // Consecutive request timeouts before a session is closed.
    pub max_consecutive_timeouts: u32,

    // Distinct peers yielding a bad piece before it's deemed irrecoverable.
    pub max_bad_piece_peers: u32,

    pub min_peers: u32,
    pub max_peers: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("downloads"),
            listen_address: SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), DEFAULT_LISTEN_PORT),
            min_piece_length: MIN_PIECE_LENGTH,
            max_piece_length: MAX_PIECE_LENGTH,
            dial_concurrency: 10,
            dial_retry_cap: 3,
            dial_backoff: vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
            ],
            max_requests_per_peer: 10,
            request_timeout: Duration::from_secs(30),
            max_consecutive_timeouts: 3,
            max_bad_piece_peers: 3,
            min_peers: 5,
            max_peers: 100,
        }
    }
}

// The fixed prefix minted into every peer id this engine generates, padded
// with random digits up to 20 bytes (e.g. azureus-style `-XX0001-xxxxxxxxxxxx`).
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub peer_id_prefix: [u8; 8],
}

const DEFAULT_PEER_ID_PREFIX: [u8; 8] = *b"-CE0100-";

impl Default for ClientIdentity {
    fn default() -> Self {
        Self { peer_id_prefix: DEFAULT_PEER_ID_PREFIX }
    }
}

impl ClientIdentity {
    // Generates a fresh 20-byte peer id: the fixed prefix followed by random digits.
    pub fn generate_peer_id(&self) -> [u8; 20] {
        use rand::Rng;
        let mut id = [0u8; 20];
        id[..8].copy_from_slice(&self.peer_id_prefix);
        let mut rng = rand::thread_rng();
        for byte in id[8..].iter_mut() {
            *byte = rng.gen_range(b'0'..=b'9');
        }
        id
    }
}
