use std::{ops::Range, path::PathBuf};

use crate::descriptor::Descriptor;

// A single payload file as it sits under the download directory, with its
// byte offset in the logical, concatenated payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSlice {
    pub path: PathBuf,
    pub length: usize,
    pub offset: usize,
}

impl FileSlice {
    // Global byte range this file occupies within the concatenated payload.
    pub fn byte_range(&self) -> Range<usize> {
        self.offset..(self.offset + self.length)
    }
}

// Piece/file geometry derived from a loaded descriptor. Cheap to clone and
// shared read-only between every session and the piece store.
#[derive(Debug, Clone)]
pub struct TorrentLayout {
    pub total_len: u64,
    pub piece_len: usize,
    pub last_piece_len: usize,
    pub num_pieces: u32,
    pub files: Vec<FileSlice>,
}

impl TorrentLayout {
    pub fn new(descriptor: &Descriptor) -> Self {
        let total_len = descriptor.total_len();
        let num_pieces = descriptor.num_pieces();
        let piece_len = descriptor.piece_len();
        let last_piece_len = if num_pieces == 0 {
            0
        } else {
            (total_len - (piece_len as u64 * (num_pieces as u64 - 1))) as usize
        };

        let mut offset = 0usize;
        let files = descriptor.files()
            .iter()
            .map(|f| {
                let slice = FileSlice { path: f.path.clone(), length: f.length as usize, offset };
                offset += f.length as usize;
                slice
            })
            .collect();

        Self { total_len, piece_len, last_piece_len, num_pieces, files }
    }

    // Length of piece given its index; the final piece may be shorter.
    pub fn piece_len(&self, idx: usize) -> usize {
        if self.num_pieces == 0 {
            return 0;
        }
        if idx as u32 == self.num_pieces - 1 {
            self.last_piece_len
        } else {
            self.piece_len
        }
    }

    pub fn piece_byte_offset(&self, piece_idx: usize) -> usize {
        piece_idx * self.piece_len
    }

    // Indices of the first and last file a piece overlaps, as a half-open range.
    pub fn piece_file_intersections(&self, piece_idx: usize) -> Range<usize> {
        debug_assert!((piece_idx as u32) < self.num_pieces, "piece index out of bounds");

        if self.files.len() <= 1 {
            return 0..self.files.len();
        }

        let offset = self.piece_byte_offset(piece_idx);
        let end = offset + self.piece_len(piece_idx);

        // A zero-width piece (possible only if the whole payload is empty)
        // has no intersections.
        if offset == end {
            return 0..0;
        }

        let start_file = self.files
            .iter()
            .position(|f| f.byte_range().contains(&offset))
            .expect("piece byte offset exceeds file length");

        let end_file = self.files[start_file..]
            .iter()
            .position(|f| f.byte_range().contains(&(end - 1)))
            .map(|i| start_file + i)
            .expect("piece last byte exceeds torrent length");

        start_file..(end_file + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(files: Vec<(&str, usize)>, piece_len: usize) -> TorrentLayout {
        let mut offset = 0;
        let slices: Vec<FileSlice> = files.into_iter().map(|(p, l)| {
            let s = FileSlice { path: PathBuf::from(p), length: l, offset };
            offset += l;
            s
        }).collect();
        let total_len: u64 = offset as u64;
        let num_pieces = ((total_len as usize + piece_len - 1) / piece_len) as u32;
        let last_piece_len = (total_len as usize) - piece_len * (num_pieces as usize - 1);
        TorrentLayout { total_len, piece_len, last_piece_len, num_pieces, files: slices }
    }

    #[test]
    fn single_file_has_trivial_intersection() {
        let l = layout(vec![("f.bin", 8)], 4);
        assert_eq!(l.piece_file_intersections(0), 0..1);
        assert_eq!(l.piece_file_intersections(1), 0..1);
    }

    #[test]
    fn piece_spanning_two_files() {
        // a.bin = "AB" (2), b.bin = "CDEF" (4); piece_len=4 => piece 0 = a[0..2]+b[0..2].
        let l = layout(vec![("a.bin", 2), ("b.bin", 4)], 4);
        assert_eq!(l.num_pieces, 2);
        assert_eq!(l.piece_len(1), 2);
        assert_eq!(l.piece_file_intersections(0), 0..2);
        assert_eq!(l.piece_file_intersections(1), 1..2);
    }
}
