use crate::Bitfield;

// Tracks, for every piece, how many connected peers advertise it and whether
// it is currently being downloaded, so the scheduler can select new pieces
// in rarest-first order: the piece held by the fewest peers is chosen next,
// with the piece index as a stable tie-break between equally rare pieces.
#[derive(Clone, Copy, Default, Debug)]
struct PieceInfo {
    // Number of peers that have this piece.
    frequency: usize,
    // Is the piece already assigned to a partial download.
    is_partial: bool,
}

#[derive(Debug)]
pub struct PiecePicker {
    // All pieces in the torrent, idx aligned.
    pieces: Vec<PieceInfo>,
    // The pieces that we have.
    have: Bitfield,
}

impl PiecePicker {

    pub fn new(num_pieces: usize) -> Self {
        let mut have = Bitfield::new();
        have.resize(num_pieces, false);
        Self {
            pieces: vec![PieceInfo::default(); num_pieces],
            have,
        }
    }

    pub fn own_bitfield(&self) -> &Bitfield {
        &self.have
    }

    pub fn all(&self) -> bool {
        self.have.all()
    }

    pub fn set_own_bitfield(&mut self, bf: Bitfield) {
        debug_assert_eq!(bf.len(), self.have.len());
        self.have = bf;
    }

    pub fn increment_piece(&mut self, idx: usize) -> bool {
        assert!(idx < self.pieces.len());
        self.pieces[idx].frequency += 1;
        self.have[idx]
    }

    pub fn received_piece(&mut self, idx: usize) {
        assert!(idx < self.pieces.len());
        self.have.set(idx, true);
        self.pieces[idx].is_partial = false;
    }

    // Reverts a piece to freshly-missing, e.g. after it failed verification.
    pub fn release_piece(&mut self, idx: usize) {
        assert!(idx < self.pieces.len());
        self.pieces[idx].is_partial = false;
    }

    // Will return true if there is at least one piece that peer has and we don't.
    pub fn bitfield_update(&mut self, bf: &Bitfield) -> bool {
        debug_assert_eq!(bf.len(), self.have.len());
        let mut interested = false;
        bf
            .iter()
            .enumerate()
            .filter(|(_, b)| **b)
            .for_each(|(i, _)| {
                self.pieces[i].frequency += 1;
                if !self.have[i] {
                    interested = true;
                }
            });
        interested
    }

    // Selects the rarest piece the peer has that we neither hold nor have
    // already assigned to some other partial download. Ties (equal rarity)
    // break on ascending piece index so selection is deterministic.
    pub fn pick_new_piece(&mut self, bf: &Bitfield) -> Option<usize> {
        let idx = self.pieces
            .iter()
            .enumerate()
            .filter(|(i, piece)| {
                !self.have[*i] && !piece.is_partial && piece.frequency > 0 && bf[*i]
            })
            .min_by_key(|(i, piece)| (piece.frequency, *i))
            .map(|(i, _)| i)?;

        self.pieces[idx].is_partial = true;
        Some(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitvec::prelude::*;

    #[test]
    fn picks_rarest_piece_first() {
        let mut picker = PiecePicker::new(4);
        // Peer A has every piece; peer B has only piece 2.
        picker.bitfield_update(&BitVec::<u8, Msb0>::repeat(true, 4));
        let mut peer_b = BitVec::<u8, Msb0>::repeat(false, 4);
        peer_b.set(2, true);
        picker.bitfield_update(&peer_b);

        // Piece 2 is now held by two peers, the rest by one; rarest is any
        // of {0, 1, 3}, and the tie-break picks the lowest index, 0.
        let bf = BitVec::<u8, Msb0>::repeat(true, 4);
        assert_eq!(picker.pick_new_piece(&bf), Some(0));
        assert_eq!(picker.pick_new_piece(&bf), Some(1));
        assert_eq!(picker.pick_new_piece(&bf), Some(3));
        // Piece 2 is the rarest remaining even though it was seen later,
        // because it is held by strictly more peers than 0/1/3 were.
        assert_eq!(picker.pick_new_piece(&bf), Some(2));
    }

    #[test]
    fn skips_pieces_we_already_have_or_already_picked() {
        let mut picker = PiecePicker::new(2);
        let bf = BitVec::<u8, Msb0>::repeat(true, 2);
        picker.bitfield_update(&bf);

        assert_eq!(picker.pick_new_piece(&bf), Some(0));
        // Piece 0 is now partial: picking again must not return it twice.
        assert_eq!(picker.pick_new_piece(&bf), Some(1));
        assert_eq!(picker.pick_new_piece(&bf), None);

        picker.received_piece(0);
        assert!(picker.own_bitfield()[0]);
    }

    #[test]
    fn ignores_pieces_the_peer_does_not_have() {
        let mut picker = PiecePicker::new(2);
        picker.bitfield_update(&BitVec::<u8, Msb0>::repeat(true, 2));

        let mut peer_bf = BitVec::<u8, Msb0>::repeat(false, 2);
        peer_bf.set(1, true);
        assert_eq!(picker.pick_new_piece(&peer_bf), Some(1));
    }
}
