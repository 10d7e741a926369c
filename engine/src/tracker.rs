// The tracker is an external collaborator: this crate neither speaks HTTP
// nor UDP to one. What lives here is the narrow boundary the engine depends
// on, an announce request/response shape and a trait a caller implements
// against whatever transport it likes, plus the one piece of wire format
// that is genuinely part of the protocol: decoding a tracker's compact peer
// list.
use std::net::{Ipv4Addr, SocketAddr};

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("tracker unreachable: {0}")]
    Unreachable(String),

    #[error("tracker returned a failure: {0}")]
    Failure(String),
}

pub type Result<T> = std::result::Result<T, TrackerError>;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum Event {
    #[default]
    Started,
    Completed,
    Stopped,
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::Started => write!(f, "started"),
            Event::Completed => write!(f, "completed"),
            Event::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnnounceParams {
    pub descriptor_id: [u8; 32],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: Option<Event>,
    pub num_want: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct AnnounceResponse {
    pub interval: u64,
    pub min_interval: Option<u64>,
    pub tracker_id: Option<String>,
    pub peers: Vec<SocketAddr>,
}

// Implemented by whatever transport a caller composes the engine with (HTTP,
// UDP, or a test double). The engine only ever calls `announce`; it never
// constructs an implementation itself.
#[async_trait::async_trait]
pub trait Tracker: Send + Sync {
    async fn announce(&mut self, params: AnnounceParams) -> Result<AnnounceResponse>;
}

// Decodes the compact peer format: a flat sequence of 6-byte records, each a
// big-endian IPv4 address followed by a big-endian port. Trailing bytes that
// don't form a full record are ignored rather than erroring, matching how
// trackers in the wild sometimes pad responses.
pub fn decode_compact_peers(bytes: &[u8]) -> Vec<SocketAddr> {
    bytes
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::from((ip, port))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_compact_peers() {
        let bytes = [127, 0, 0, 1, 0x1A, 0xE1, 10, 0, 0, 5, 0x1A, 0xE2];
        let peers = decode_compact_peers(&bytes);
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0], "127.0.0.1:6881".parse().unwrap());
        assert_eq!(peers[1], "10.0.0.5:6882".parse().unwrap());
    }

    #[test]
    fn ignores_trailing_partial_record() {
        let bytes = [127, 0, 0, 1, 0x1A, 0xE1, 9, 9];
        let peers = decode_compact_peers(&bytes);
        assert_eq!(peers.len(), 1);
    }

    #[test]
    fn event_display_matches_tracker_vocabulary() {
        assert_eq!(Event::Started.to_string(), "started");
        assert_eq!(Event::Completed.to_string(), "completed");
        assert_eq!(Event::Stopped.to_string(), "stopped");
    }
}
