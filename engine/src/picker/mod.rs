use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use crate::{block::BlockRequest, Bitfield};

pub mod partial_piece;
pub mod piece_picker;

use partial_piece::PartialPiece;
use piece_picker::PiecePicker;

#[derive(Debug)]
pub struct Picker {
    pub piece_picker: RwLock<PiecePicker>,
    pub partial_pieces: RwLock<HashMap<usize, RwLock<PartialPiece>>>,
    num_pieces: u32,
    piece_len: usize,
    last_piece_len: usize,
}

impl Picker {

    pub fn new(num_pieces: u32, piece_len: usize, last_piece_len: usize) -> Self {
        Self {
            piece_picker: RwLock::new(PiecePicker::new(num_pieces as usize)),
            partial_pieces: RwLock::new(HashMap::new()),
            num_pieces,
            piece_len,
            last_piece_len,
        }
    }

    // Fills a peer's request queue up to `target_queue_len`, first topping up
    // blocks from pieces already partially in flight (so pieces finish
    // before new ones start), then starting new pieces in rarest-first
    // order. Returns fewer than requested once every remaining piece the
    // peer has is held, saturated or exhausted; this is never made up with
    // duplicate requests.
    pub async fn pick_blocks(
        &self,
        current_requests: &HashSet<BlockRequest>,
        target_queue_len: usize,
        bf: &Bitfield,
    ) -> Vec<BlockRequest> {

        let mut requests = vec![];
        let mut remaining = target_queue_len.saturating_sub(current_requests.len());
        if remaining == 0 {
            return vec![];
        }

        // Top up blocks from pieces already partially downloaded.
        for partial_piece in self.partial_pieces.write().await.values_mut() {
            if remaining == 0 {
                break;
            }

            // Skip pieces that peer does not have.
            if !bf[partial_piece.read().await.idx] {
                continue;
            }

            remaining -= partial_piece.write().await.pick_next_blocks(remaining, &mut requests);
        }

        // Start new pieces, rarest-first, until the queue is full or the
        // peer has nothing more we both want and can assign.
        while remaining != 0 {
            let Some(idx) = self.piece_picker.write().await.pick_new_piece(bf) else {
                break;
            };

            tracing::trace!("picked piece {}", idx);
            let len = if idx as u32 == self.num_pieces - 1 { self.last_piece_len } else { self.piece_len };
            let mut partial_piece = PartialPiece::new(idx, len);
            remaining -= partial_piece.pick_next_blocks(remaining, &mut requests);
            self.partial_pieces.write().await.insert(idx, partial_piece.into());
        }

        requests
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitvec::prelude::*;

    #[tokio::test]
    async fn test_pick_blocks() {
        let picker = Picker::new(1028, 32_768, 32_768);
        let bf = BitVec::repeat(true, 1028);
        picker.piece_picker.write().await.bitfield_update(&bf);
        let requests_1 = picker.pick_blocks(&HashSet::new(), 4, &bf).await;
        assert_eq!(requests_1.len(), 4);
        let requests_2 = picker.pick_blocks(&HashSet::new(), 4, &bf).await;
        assert_eq!(requests_2.len(), 4);
    }

    #[tokio::test]
    async fn exhausted_peer_yields_fewer_requests_than_asked() {
        // Two one-block pieces: once both are picked, no more requests can
        // be manufactured without duplicating an in-flight one.
        let picker = Picker::new(2, 32_768, 32_768);
        let bf = BitVec::repeat(true, 2);
        picker.piece_picker.write().await.bitfield_update(&bf);

        let requests_1 = picker.pick_blocks(&HashSet::new(), 4, &bf).await;
        assert_eq!(requests_1.len(), 2);

        let requests_2 = picker.pick_blocks(&HashSet::new(), 4, &bf).await;
        assert!(requests_2.is_empty());
    }
}
