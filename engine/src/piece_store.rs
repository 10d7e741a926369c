use std::{
    collections::HashMap,
    io::{Read, Seek, Write},
    num::NonZeroUsize,
    path::Path,
    sync::{Arc, Mutex, RwLock},
};

use tokio::sync::broadcast;

use crate::{
    block::{num_blocks, Block, BlockRequest},
    crypto::Digest,
    descriptor::Descriptor,
    layout::{FileSlice, TorrentLayout},
    Bitfield, BLOCK_SIZE,
};

#[derive(Debug, thiserror::Error)]
pub enum PieceStoreError {
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error("io error: expected {expected} bytes, got {actual}")]
    IoSizeError { expected: usize, actual: usize },

    #[error("lock poisoned: {0}")]
    SyncError(String),

    #[error("piece index {0} out of range")]
    PieceOutOfRange(usize),
}

impl<T> From<std::sync::PoisonError<T>> for PieceStoreError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        PieceStoreError::SyncError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PieceStoreError>;

// Outcome of depositing a single block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceOutcome {
    // The piece this block belongs to still has blocks outstanding.
    Incomplete,
    // A block occupying an already-filled slot; dropped, not an error.
    Duplicate,
    // The piece is now complete and matched its digest; written to disk.
    Verified,
    // The piece is now complete but failed hash verification; discarded.
    BadPiece,
}

struct OpenFile {
    slice: FileSlice,
    handle: RwLock<std::fs::File>,
}

struct PieceBuf {
    data: Vec<u8>,
    blocks_received: Vec<bool>,
    num_blocks_received: u32,
}

impl PieceBuf {
    fn new(len: usize) -> Self {
        Self {
            data: vec![0; len],
            blocks_received: vec![false; num_blocks(len) as usize],
            num_blocks_received: 0,
        }
    }

    // Returns false for a duplicate (already-filled) block slot.
    fn add_block(&mut self, block: &Block) -> bool {
        let idx = block.offset / BLOCK_SIZE;
        if self.blocks_received[idx] {
            return false;
        }
        self.blocks_received[idx] = true;
        self.num_blocks_received += 1;
        self.data[block.offset..block.offset + block.data.len()].copy_from_slice(&block.data);
        true
    }

    fn is_complete(&self) -> bool {
        self.num_blocks_received == self.blocks_received.len() as u32
    }
}

// Owns every on-disk file belonging to a single download, tracks partially
// received pieces in memory, verifies completed pieces against their
// digest, and caches recently-read pieces for serving to peers.
//
// Every method takes `&self`: callers wrap a `PieceStore` in an `Arc` and
// invoke its blocking methods from `tokio::task::spawn_blocking`, the same
// way disk I/O is kept off the reactor elsewhere in this crate.
pub struct PieceStore {
    layout: TorrentLayout,
    piece_hashes: Vec<[u8; 32]>,
    digest: Arc<dyn Digest>,
    files: Vec<OpenFile>,
    write_buf: Mutex<HashMap<usize, PieceBuf>>,
    read_cache: Mutex<lru::LruCache<usize, Vec<Arc<Vec<u8>>>>>,
    have: Mutex<Bitfield>,
    commits: broadcast::Sender<usize>,
}

impl PieceStore {
    pub fn new(
        descriptor: &Descriptor,
        layout: TorrentLayout,
        output_dir: &Path,
        digest: Arc<dyn Digest>,
    ) -> Result<Self> {
        if !output_dir.is_dir() {
            std::fs::create_dir_all(output_dir)?;
            tracing::info!("created missing output directory: {:?}", output_dir);
        }

        let mut files = Vec::with_capacity(layout.files.len());
        for slice in &layout.files {
            let full_path = output_dir.join(&slice.path);
            if let Some(parent) = full_path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let handle = std::fs::OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(&full_path)?;
            tracing::debug!(path = ?full_path, "opened output file");
            files.push(OpenFile { slice: slice.clone(), handle: RwLock::new(handle) });
        }

        let (commits, _rx) = broadcast::channel(256);
        let num_pieces = layout.num_pieces as usize;

        Ok(Self {
            layout,
            piece_hashes: descriptor.piece_hashes(),
            digest,
            files,
            write_buf: Mutex::new(HashMap::new()),
            read_cache: Mutex::new(lru::LruCache::new(NonZeroUsize::new(64).unwrap())),
            have: Mutex::new(Bitfield::repeat(false, num_pieces)),
            commits,
        })
    }

    pub fn layout(&self) -> &TorrentLayout { &self.layout }

    // A commit fires once per piece, the moment it passes verification and
    // lands on disk. The scheduler and session layer both subscribe to
    // drive HAVE broadcasts and completion tracking.
    pub fn subscribe_commits(&self) -> broadcast::Receiver<usize> {
        self.commits.subscribe()
    }

    pub fn deposit_block(&self, block: Block) -> Result<PieceOutcome> {
        let piece_idx = block.piece_idx;
        if piece_idx >= self.layout.num_pieces as usize {
            return Err(PieceStoreError::PieceOutOfRange(piece_idx));
        }
        if self.have.lock()?[piece_idx] {
            tracing::trace!(piece_idx, "block for already-held piece dropped");
            return Ok(PieceOutcome::Duplicate);
        }

        let piece = {
            let mut write_buf = self.write_buf.lock()?;
            let entry = write_buf
                .entry(piece_idx)
                .or_insert_with(|| PieceBuf::new(self.layout.piece_len(piece_idx)));

            if !entry.add_block(&block) {
                tracing::trace!(piece_idx, offset = block.offset, "duplicate block dropped");
                return Ok(PieceOutcome::Duplicate);
            }
            if !entry.is_complete() {
                return Ok(PieceOutcome::Incomplete);
            }
            write_buf.remove(&piece_idx).expect("piece present after completeness check")
        };

        let hash = self.digest.digest(&piece.data);
        if hash.as_slice() != self.piece_hashes[piece_idx].as_slice() {
            tracing::warn!(piece_idx, "piece failed hash verification");
            return Ok(PieceOutcome::BadPiece);
        }

        self.write_piece(piece_idx, &piece.data)?;
        self.read_cache.lock()?.put(piece_idx, chunk_into_blocks(&piece.data));
        self.have.lock()?.set(piece_idx, true);
        let _ = self.commits.send(piece_idx);
        Ok(PieceOutcome::Verified)
    }

    pub fn read_block(&self, request: BlockRequest) -> Result<Arc<Vec<u8>>> {
        let block_idx = request.idx_in_piece();

        if let Some(cached) = self.read_cache.lock()?.get(&request.piece_idx) {
            if let Some(block) = cached.get(block_idx) {
                return Ok(Arc::clone(block));
            }
        }

        let piece = self.read_piece_from_disk(request.piece_idx)?;
        let block = Arc::clone(piece.get(block_idx).ok_or(PieceStoreError::IoSizeError {
            expected: block_idx + 1,
            actual: piece.len(),
        })?);
        self.read_cache.lock()?.put(request.piece_idx, piece);
        Ok(block)
    }

    // Re-derives an ownership bitfield by rehashing every piece already on
    // disk, used when resuming a download without a separate resume file.
    // The store's own held-pieces bitfield is updated to match, so a
    // subsequent deposit_block sees the resumed pieces as already Have.
    pub fn recompute_bitfield(&self) -> Bitfield {
        let mut bitfield = Bitfield::repeat(false, self.layout.num_pieces as usize);
        for piece_idx in 0..self.layout.num_pieces as usize {
            let chunks = match self.read_piece_from_disk(piece_idx) {
                Ok(chunks) => chunks,
                Err(_) => continue,
            };
            let mut buf = Vec::with_capacity(self.layout.piece_len(piece_idx));
            for chunk in &chunks {
                buf.extend_from_slice(chunk);
            }
            if self.digest.digest(&buf).as_slice() == self.piece_hashes[piece_idx].as_slice() {
                bitfield.set(piece_idx, true);
            }
        }
        *self.have.lock().expect("lock poisoned") = bitfield.clone();
        bitfield
    }

    fn write_piece(&self, piece_idx: usize, data: &[u8]) -> Result<()> {
        let range = self.layout.piece_file_intersections(piece_idx);
        let mut total_offset = self.layout.piece_byte_offset(piece_idx);
        let mut bytes_written = 0;

        for file in &self.files[range] {
            let mut f = file.handle.write()?;
            let byte_range = file.slice.byte_range();
            let file_offset = total_offset - byte_range.start;
            let piece_remaining = data.len() - bytes_written;
            let file_remaining = byte_range.end - total_offset;
            let n = piece_remaining.min(file_remaining);

            f.seek(std::io::SeekFrom::Start(file_offset as u64))?;
            f.write_all(&data[bytes_written..bytes_written + n])?;

            total_offset += n;
            bytes_written += n;
        }

        if bytes_written != data.len() {
            return Err(PieceStoreError::IoSizeError { expected: data.len(), actual: bytes_written });
        }
        Ok(())
    }

    fn read_piece_from_disk(&self, piece_idx: usize) -> Result<Vec<Arc<Vec<u8>>>> {
        let range = self.layout.piece_file_intersections(piece_idx);
        let len = self.layout.piece_len(piece_idx);
        let mut total_offset = self.layout.piece_byte_offset(piece_idx);
        let mut buf = vec![0u8; len];
        let mut bytes_read = 0;

        for file in &self.files[range] {
            let mut f = file.handle.write()?;
            let byte_range = file.slice.byte_range();
            let file_offset = total_offset - byte_range.start;
            let piece_remaining = len - bytes_read;
            let file_remaining = byte_range.end - total_offset;
            let n = piece_remaining.min(file_remaining);

            f.seek(std::io::SeekFrom::Start(file_offset as u64))?;
            f.read_exact(&mut buf[bytes_read..bytes_read + n])?;

            bytes_read += n;
            total_offset += n;
        }

        if bytes_read != len {
            return Err(PieceStoreError::IoSizeError { expected: len, actual: bytes_read });
        }

        Ok(chunk_into_blocks(&buf))
    }
}

fn chunk_into_blocks(data: &[u8]) -> Vec<Arc<Vec<u8>>> {
    data.chunks(BLOCK_SIZE).map(|c| Arc::new(c.to_vec())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Sha256Digest;

    fn build_store(tmp: &Path, payload: &[u8], piece_length: u32) -> (Descriptor, PieceStore) {
        let src_dir = tmp.join("src");
        std::fs::create_dir_all(&src_dir).unwrap();
        std::fs::write(src_dir.join("f.bin"), payload).unwrap();

        let descriptor = Descriptor::create(&src_dir.join("f.bin"), vec![], piece_length, false, None, &Sha256Digest).unwrap();
        let layout = TorrentLayout::new(&descriptor);
        let out_dir = tmp.join("out");
        let store = PieceStore::new(&descriptor, layout, &out_dir, Arc::new(Sha256Digest)).unwrap();
        (descriptor, store)
    }

    #[test]
    fn deposit_whole_piece_verifies_and_commits() {
        let tmp = tempfile::tempdir().unwrap();
        let (_descriptor, store) = build_store(tmp.path(), b"ABCDxyz!", 4);
        let mut commits = store.subscribe_commits();

        let outcome = store.deposit_block(Block { piece_idx: 0, offset: 0, data: b"ABCD".to_vec() }).unwrap();
        assert_eq!(outcome, PieceOutcome::Verified);
        assert_eq!(commits.try_recv().unwrap(), 0);
    }

    #[test]
    fn duplicate_block_is_reported_and_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let (_descriptor, store) = build_store(tmp.path(), b"ABCDxyz!", 4);

        store.deposit_block(Block { piece_idx: 0, offset: 0, data: b"ABCD".to_vec() }).unwrap();
        let outcome = store.deposit_block(Block { piece_idx: 0, offset: 0, data: b"ABCD".to_vec() }).unwrap();
        assert_eq!(outcome, PieceOutcome::Duplicate);
    }

    #[test]
    fn corrupt_piece_is_detected_and_discarded() {
        let tmp = tempfile::tempdir().unwrap();
        let (_descriptor, store) = build_store(tmp.path(), b"ABCDxyz!", 4);

        let outcome = store.deposit_block(Block { piece_idx: 0, offset: 0, data: b"XXXX".to_vec() }).unwrap();
        assert_eq!(outcome, PieceOutcome::BadPiece);
    }

    #[test]
    fn read_block_round_trips_after_write() {
        let tmp = tempfile::tempdir().unwrap();
        let (_descriptor, store) = build_store(tmp.path(), b"ABCDxyz!", 4);

        store.deposit_block(Block { piece_idx: 0, offset: 0, data: b"ABCD".to_vec() }).unwrap();
        let read = store.read_block(BlockRequest { piece_idx: 0, offset: 0, len: 4 }).unwrap();
        assert_eq!(read.as_slice(), b"ABCD");
    }

    #[test]
    fn deposit_block_for_already_held_piece_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let (_descriptor, store) = build_store(tmp.path(), b"ABCDxyz!", 4);
        let mut commits = store.subscribe_commits();

        let outcome = store.deposit_block(Block { piece_idx: 0, offset: 0, data: b"ABCD".to_vec() }).unwrap();
        assert_eq!(outcome, PieceOutcome::Verified);
        assert_eq!(commits.try_recv().unwrap(), 0);

        let outcome = store.deposit_block(Block { piece_idx: 0, offset: 0, data: b"ABCD".to_vec() }).unwrap();
        assert_eq!(outcome, PieceOutcome::Duplicate);
        assert!(commits.try_recv().is_err());
    }

    #[test]
    fn recompute_bitfield_finds_verified_pieces_on_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let (_descriptor, store) = build_store(tmp.path(), b"ABCDxyz!", 4);

        store.deposit_block(Block { piece_idx: 0, offset: 0, data: b"ABCD".to_vec() }).unwrap();
        let bitfield = store.recompute_bitfield();
        assert!(bitfield[0]);
        assert!(!bitfield[1]);
    }
}
