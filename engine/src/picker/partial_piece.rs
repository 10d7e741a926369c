use crate::{block::*, BLOCK_SIZE};

#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub enum BlockState {

    // Block has not been requested.
    #[default]
    Free,

    // Block has been requested from a peer.
    Requested,

    // Block has been received.
    Received,

}

#[derive(Debug)]
pub struct PartialPiece {

    // Piece index.
    pub idx: usize,

    // Length of piece.
    pub len: usize,

    // State of all blocks within this piece.
    pub blocks_states: Vec<BlockState>

}

impl PartialPiece {

    pub fn new(idx: usize, len: usize) -> Self {
        Self {
            idx,
            len,
            blocks_states: vec![BlockState::default(); num_blocks(len) as usize],
        }
    }

    pub fn free_block(&mut self, block: &BlockRequest) {
        assert!(block.piece_idx == self.idx);
        self.blocks_states[block.idx_in_piece()] = BlockState::Free
    }

    // Called when the piece fails hash verification: every block it was
    // assembled from must be re-requested from scratch.
    pub fn free_all_blocks(&mut self) {
        self.blocks_states.iter_mut().for_each(|b| *b = BlockState::Free)
    }

    // Returns whether the block is a duplicate (already received).
    pub fn received_block(&mut self, block: &BlockRequest) -> bool {
        let block_state = &mut self.blocks_states[block.idx_in_piece()];
        // If we received a block, it must have been requested.
        match *block_state {
            BlockState::Free => unreachable!("can't receive a block that wasn't requested"),
            BlockState::Requested => {
                *block_state = BlockState::Received;
                false
            }
            BlockState::Received => true,
        }
    }

    // Picks up to `num` still-free blocks within this piece, in ascending
    // offset order, and marks them Requested.
    pub fn pick_next_blocks(&mut self, num: usize, buf: &mut Vec<BlockRequest>) -> usize {
        let mut num_picked = 0;
        for (i, block) in self.blocks_states.iter_mut().enumerate() {
            if num_picked == num {
                break;
            }

            if *block == BlockState::Free {
                buf.push(BlockRequest {
                    piece_idx: self.idx,
                    offset: i * BLOCK_SIZE,
                    len: block_len(self.len, i),
                });
                *block = BlockState::Requested;
                num_picked += 1;
            }
        }
        num_picked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_only_free_blocks_in_order() {
        let mut piece = PartialPiece::new(0, BLOCK_SIZE * 3);
        let mut buf = Vec::new();
        assert_eq!(piece.pick_next_blocks(2, &mut buf), 2);
        assert_eq!(buf[0].offset, 0);
        assert_eq!(buf[1].offset, BLOCK_SIZE);

        // Only the last block remains free.
        let picked = piece.pick_next_blocks(5, &mut buf);
        assert_eq!(picked, 1);
        assert_eq!(buf[2].offset, BLOCK_SIZE * 2);
    }

    #[test]
    fn free_all_blocks_resets_state_after_bad_piece() {
        let mut piece = PartialPiece::new(0, BLOCK_SIZE * 2);
        let mut buf = Vec::new();
        piece.pick_next_blocks(2, &mut buf);
        assert!(piece.blocks_states.iter().all(|b| *b == BlockState::Requested));

        piece.free_all_blocks();
        assert!(piece.blocks_states.iter().all(|b| *b == BlockState::Free));
    }

    #[test]
    #[should_panic(expected = "can't receive a block that wasn't requested")]
    fn receiving_an_unrequested_block_panics() {
        let mut piece = PartialPiece::new(0, BLOCK_SIZE);
        piece.received_block(&BlockRequest { piece_idx: 0, offset: 0, len: BLOCK_SIZE });
    }
}
