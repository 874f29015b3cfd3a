use super::{BlockInfo, BlockState, Piece, PeerKey};
use crate::error::{BittorrentError, Result};
use crate::peer::bitfield;
use crate::storage::StorageManager;
use crate::torrent::Torrent;
use sha1::{Digest, Sha1};
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// Result of delivering a block to the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockWrite {
    /// Block stored; its piece still has outstanding blocks
    Accepted,
    /// Block or piece was already complete, data dropped
    Duplicate,
    /// This block finished the piece and the hash verified
    PieceCompleted(u32),
}

/// Owns all piece and block state for one torrent.
///
/// Every piece sits behind its own lock, so sessions working on different
/// pieces never contend and claims on the same piece are serialized.
pub struct PieceStore {
    piece_length: u64,
    pieces: Vec<Mutex<Piece>>,
    storage: StorageManager,
    progress: watch::Sender<usize>,
}

impl PieceStore {
    /// Pre-allocate the torrent's files under `download_dir` and build the store
    pub async fn open<P: AsRef<Path>>(download_dir: P, torrent: &Torrent) -> Result<Self> {
        let storage = StorageManager::new(download_dir, torrent).await?;
        Ok(Self::new(torrent, storage))
    }

    pub fn new(torrent: &Torrent, storage: StorageManager) -> Self {
        let pieces = torrent
            .piece_hashes
            .iter()
            .enumerate()
            .map(|(index, hash)| {
                Mutex::new(Piece::new(
                    index as u32,
                    *hash,
                    torrent.piece_len(index) as u32,
                ))
            })
            .collect();

        let (progress, _) = watch::channel(0);

        Self {
            piece_length: torrent.piece_length,
            pieces,
            storage,
            progress,
        }
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn completed_count(&self) -> usize {
        *self.progress.borrow()
    }

    pub fn is_complete(&self) -> bool {
        self.completed_count() == self.piece_count()
    }

    /// Resolve once every piece has been verified
    pub async fn wait_complete(&self) {
        let total = self.piece_count();
        let mut rx = self.progress.subscribe();
        let _ = rx.wait_for(|&done| done >= total).await;
    }

    fn piece(&self, index: u32) -> Result<&Mutex<Piece>> {
        self.pieces.get(index as usize).ok_or_else(|| {
            BittorrentError::ProtocolError(format!(
                "Piece index {} out of range ({} pieces)",
                index,
                self.pieces.len()
            ))
        })
    }

    fn global_offset(&self, piece_index: u32, offset: u32) -> u64 {
        piece_index as u64 * self.piece_length + offset as u64
    }

    fn mark_completed(&self) {
        self.progress.send_modify(|done| *done += 1);
    }

    /// Record that `peer` has piece `index`; repeated calls are no-ops
    pub async fn register_ownership(&self, index: u32, peer: PeerKey) -> Result<()> {
        self.piece(index)?.lock().await.owners.insert(peer);
        Ok(())
    }

    /// Atomically hand one `Missing` block of piece `index` to `peer`
    pub async fn claim_block(&self, index: u32, peer: PeerKey) -> Option<BlockInfo> {
        let mut piece = self.piece(index).ok()?.lock().await;
        if piece.completed || !piece.owners.contains(&peer) {
            return None;
        }

        let block = piece
            .blocks
            .iter_mut()
            .find(|b| b.state == BlockState::Missing)?;
        block.state = BlockState::Pending {
            peer,
            requested_at: Instant::now(),
        };
        Some(block.info)
    }

    /// Claim the first available block across all pieces `peer` owns,
    /// lowest piece index first
    pub async fn claim_next(&self, peer: PeerKey) -> Option<BlockInfo> {
        for index in 0..self.pieces.len() as u32 {
            if let Some(block) = self.claim_block(index, peer).await {
                return Some(block);
            }
        }
        None
    }

    /// Store one block of data.
    ///
    /// The first delivery of a block moves it to `Writing` under the piece
    /// lock; any other delivery of the same block is a duplicate from then
    /// on. The disk write happens outside the lock and the block only
    /// becomes `Completed` once its bytes are on disk, so the bytes hashed
    /// are the bytes stored.
    pub async fn write_block(&self, index: u32, offset: u32, data: &[u8]) -> Result<BlockWrite> {
        let slot = {
            let mut piece = self.piece(index)?.lock().await;
            if piece.completed {
                return Ok(BlockWrite::Duplicate);
            }
            let slot = piece.block_at(offset).ok_or_else(|| {
                BittorrentError::ProtocolError(format!(
                    "Offset {} is not a block boundary of piece {}",
                    offset, index
                ))
            })?;
            let block = &mut piece.blocks[slot];
            if block.info.length as usize != data.len() {
                return Err(BittorrentError::SizeMismatch {
                    piece: index,
                    offset,
                    expected: block.info.length as usize,
                    actual: data.len(),
                });
            }
            if matches!(block.state, BlockState::Writing | BlockState::Completed) {
                return Ok(BlockWrite::Duplicate);
            }
            block.state = BlockState::Writing;
            slot
        };

        if let Err(e) = self
            .storage
            .write_at(self.global_offset(index, offset), data)
            .await
        {
            self.piece(index)?.lock().await.blocks[slot].state = BlockState::Missing;
            return Err(e);
        }

        let mut piece = self.piece(index)?.lock().await;
        if piece.completed || piece.blocks[slot].state != BlockState::Writing {
            return Ok(BlockWrite::Duplicate);
        }

        let piece_len = piece.length as usize;
        let start = offset as usize;
        piece.buffer.get_or_insert_with(|| vec![0u8; piece_len])[start..start + data.len()]
            .copy_from_slice(data);
        piece.blocks[slot].state = BlockState::Completed;
        debug!("Stored block {}+{} ({} bytes)", index, offset, data.len());

        if !piece.all_blocks_completed() {
            return Ok(BlockWrite::Accepted);
        }

        let verified = piece
            .buffer
            .as_deref()
            .map(|buf| Sha1::digest(buf).as_slice() == piece.hash)
            .unwrap_or(false);

        if verified {
            piece.completed = true;
            piece.buffer = None;
            drop(piece);
            self.mark_completed();
            info!(
                "Piece {} verified ({}/{})",
                index,
                self.completed_count(),
                self.piece_count()
            );
            Ok(BlockWrite::PieceCompleted(index))
        } else {
            piece.reset();
            warn!("Piece {} failed verification, re-downloading", index);
            Err(BittorrentError::PieceCorrupt(index))
        }
    }

    /// Return every block `peer` has pending to `Missing`
    pub async fn release_peer(&self, peer: PeerKey) -> usize {
        let mut released = 0;
        for piece in &self.pieces {
            let mut piece = piece.lock().await;
            for block in &mut piece.blocks {
                if matches!(block.state, BlockState::Pending { peer: p, .. } if p == peer) {
                    block.state = BlockState::Missing;
                    released += 1;
                }
            }
        }
        if released > 0 {
            debug!("Released {} pending blocks of {}", released, peer);
        }
        released
    }

    /// Return blocks pending for longer than `older_than` to `Missing`
    pub async fn release_stuck_blocks(&self, older_than: Duration) -> usize {
        let mut released = 0;
        for piece in &self.pieces {
            let mut piece = piece.lock().await;
            for block in &mut piece.blocks {
                if let BlockState::Pending { requested_at, .. } = block.state {
                    if requested_at.elapsed() >= older_than {
                        block.state = BlockState::Missing;
                        released += 1;
                    }
                }
            }
        }
        if released > 0 {
            debug!("Released {} stuck blocks", released);
        }
        released
    }

    pub async fn is_piece_completed(&self, index: u32) -> bool {
        match self.piece(index) {
            Ok(piece) => piece.lock().await.completed,
            Err(_) => false,
        }
    }

    /// Verified pieces, indexed by piece
    pub async fn owned_pieces(&self) -> Vec<bool> {
        let mut owned = Vec::with_capacity(self.pieces.len());
        for piece in &self.pieces {
            owned.push(piece.lock().await.completed);
        }
        owned
    }

    /// Owned pieces as a wire bitfield
    pub async fn bitfield(&self) -> Vec<u8> {
        bitfield::encode(&self.owned_pieces().await)
    }

    pub async fn block_states(&self, index: u32) -> Vec<BlockState> {
        match self.piece(index) {
            Ok(piece) => piece.lock().await.blocks.iter().map(|b| b.state).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Bytes belonging to pieces not yet verified
    pub async fn remaining_bytes(&self) -> u64 {
        let mut left = 0;
        for piece in &self.pieces {
            let piece = piece.lock().await;
            if !piece.completed {
                left += piece.length as u64;
            }
        }
        left
    }

    /// Read a block of a verified piece for upload
    pub async fn read_block(&self, block: BlockInfo) -> Result<Vec<u8>> {
        {
            let piece = self.piece(block.piece_index)?.lock().await;
            if !piece.completed {
                return Err(BittorrentError::ProtocolError(format!(
                    "Requested piece {} is not complete",
                    block.piece_index
                )));
            }
            if block.offset as u64 + block.length as u64 > piece.length as u64 {
                return Err(BittorrentError::ProtocolError(format!(
                    "Request {}+{} exceeds piece {} length {}",
                    block.offset, block.length, block.piece_index, piece.length
                )));
            }
        }

        self.storage
            .read_at(
                self.global_offset(block.piece_index, block.offset),
                block.length as usize,
            )
            .await
    }

    /// Hash data already on disk and mark matching pieces completed.
    /// Returns the number of pieces found intact.
    pub async fn verify_existing(&self) -> Result<usize> {
        let mut found = 0;
        for piece in &self.pieces {
            let (index, length, hash) = {
                let piece = piece.lock().await;
                if piece.completed {
                    continue;
                }
                (piece.index, piece.length, piece.hash)
            };

            let data = self
                .storage
                .read_at(self.global_offset(index, 0), length as usize)
                .await?;
            if Sha1::digest(&data).as_slice() != hash {
                continue;
            }

            let mut piece = piece.lock().await;
            if piece.completed {
                continue;
            }
            for block in &mut piece.blocks {
                block.state = BlockState::Completed;
            }
            piece.completed = true;
            piece.buffer = None;
            drop(piece);
            found += 1;
            self.mark_completed();
        }
        info!(
            "Verified existing data: {}/{} pieces intact",
            found,
            self.piece_count()
        );
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::piece::BLOCK_SIZE;
    use crate::torrent::tests::torrent_for;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn peer(n: u16) -> PeerKey {
        format!("10.0.0.1:{}", 6000 + n).parse().unwrap()
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_piece_completes_with_correct_data() {
        let dir = tempfile::tempdir().unwrap();
        let data = sample(3 * BLOCK_SIZE as usize);
        let torrent = torrent_for(&data, 2 * BLOCK_SIZE as u64, &[("f", data.len() as u64)]);
        let store = PieceStore::open(dir.path(), &torrent).await.unwrap();

        let b = BLOCK_SIZE as usize;
        assert_eq!(
            store.write_block(0, 0, &data[..b]).await.unwrap(),
            BlockWrite::Accepted
        );
        assert_eq!(
            store.write_block(0, BLOCK_SIZE, &data[b..2 * b]).await.unwrap(),
            BlockWrite::PieceCompleted(0)
        );
        assert!(store.is_piece_completed(0).await);
        assert_eq!(
            store.write_block(0, 0, &data[..b]).await.unwrap(),
            BlockWrite::Duplicate
        );
        assert_eq!(store.completed_count(), 1);
        assert_eq!(store.remaining_bytes().await, b as u64);
        assert_eq!(std::fs::read(dir.path().join("f")).unwrap()[..2 * b], data[..2 * b]);
    }

    #[tokio::test]
    async fn test_corrupt_piece_reverts_every_block() {
        let dir = tempfile::tempdir().unwrap();
        let data = sample(2 * BLOCK_SIZE as usize);
        let torrent = torrent_for(&data, data.len() as u64, &[("f", data.len() as u64)]);
        let store = PieceStore::open(dir.path(), &torrent).await.unwrap();

        let b = BLOCK_SIZE as usize;
        let mut tampered = data[b..].to_vec();
        tampered[17] ^= 0xff;
        store.write_block(0, 0, &data[..b]).await.unwrap();
        let err = store.write_block(0, BLOCK_SIZE, &tampered).await.unwrap_err();

        assert!(matches!(err, BittorrentError::PieceCorrupt(0)));
        assert!(!store.is_piece_completed(0).await);
        assert!(store
            .block_states(0)
            .await
            .iter()
            .all(|s| *s == BlockState::Missing));

        store.write_block(0, 0, &data[..b]).await.unwrap();
        assert_eq!(
            store.write_block(0, BLOCK_SIZE, &data[b..]).await.unwrap(),
            BlockWrite::PieceCompleted(0)
        );
    }

    #[tokio::test]
    async fn test_size_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let data = sample(24384);
        let torrent = torrent_for(&data, 16384, &[("f", 24384)]);
        let store = PieceStore::open(dir.path(), &torrent).await.unwrap();

        let err = store.write_block(1, 0, &data[16384..24000]).await.unwrap_err();
        assert!(matches!(
            err,
            BittorrentError::SizeMismatch {
                piece: 1,
                expected: 8000,
                actual: 7616,
                ..
            }
        ));
        assert!(matches!(
            store.write_block(1, 5, &data[..10]).await,
            Err(BittorrentError::ProtocolError(_))
        ));
        assert!(matches!(
            store.write_block(9, 0, &data[..10]).await,
            Err(BittorrentError::ProtocolError(_))
        ));
    }

    #[tokio::test]
    async fn test_claim_requires_ownership_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let data = sample(2 * BLOCK_SIZE as usize);
        let torrent = torrent_for(&data, data.len() as u64, &[("f", data.len() as u64)]);
        let store = PieceStore::open(dir.path(), &torrent).await.unwrap();

        assert!(store.claim_block(0, peer(1)).await.is_none());
        store.register_ownership(0, peer(1)).await.unwrap();
        store.register_ownership(0, peer(1)).await.unwrap();
        assert!(store.register_ownership(5, peer(1)).await.is_err());

        let first = store.claim_block(0, peer(1)).await.unwrap();
        let second = store.claim_block(0, peer(1)).await.unwrap();
        assert_ne!(first, second);
        assert!(store.claim_block(0, peer(1)).await.is_none());

        assert_eq!(store.release_peer(peer(1)).await, 2);
        assert_eq!(store.claim_block(0, peer(1)).await, Some(first));
    }

    #[tokio::test]
    async fn test_stuck_blocks_swept() {
        let dir = tempfile::tempdir().unwrap();
        let data = sample(BLOCK_SIZE as usize);
        let torrent = torrent_for(&data, data.len() as u64, &[("f", data.len() as u64)]);
        let store = PieceStore::open(dir.path(), &torrent).await.unwrap();

        store.register_ownership(0, peer(1)).await.unwrap();
        store.register_ownership(0, peer(2)).await.unwrap();
        store.claim_block(0, peer(1)).await.unwrap();
        assert!(store.claim_block(0, peer(2)).await.is_none());

        assert_eq!(store.release_stuck_blocks(Duration::from_secs(60)).await, 0);
        assert_eq!(store.release_stuck_blocks(Duration::ZERO).await, 1);
        assert!(store.claim_block(0, peer(2)).await.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_never_double_assign() {
        const BLOCKS: usize = 24;
        const CLAIMERS: u16 = 8;

        let dir = tempfile::tempdir().unwrap();
        let data = sample(BLOCKS * BLOCK_SIZE as usize);
        let torrent = torrent_for(&data, data.len() as u64, &[("f", data.len() as u64)]);
        let store = Arc::new(PieceStore::open(dir.path(), &torrent).await.unwrap());

        for n in 0..CLAIMERS {
            store.register_ownership(0, peer(n)).await.unwrap();
        }

        let handles: Vec<_> = (0..CLAIMERS)
            .map(|n| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    let mut claimed = Vec::new();
                    while let Some(block) = store.claim_block(0, peer(n)).await {
                        claimed.push(block.offset);
                        tokio::task::yield_now().await;
                    }
                    claimed
                })
            })
            .collect();

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }

        let unique: HashSet<_> = all.iter().copied().collect();
        assert_eq!(all.len(), BLOCKS);
        assert_eq!(unique.len(), BLOCKS);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_deliveries_keep_disk_and_hash_in_step() {
        let data = sample(1000);
        let mut bad = data.clone();
        bad[500] ^= 0xff;
        let torrent = torrent_for(&data, 1000, &[("f", 1000)]);

        for _ in 0..100 {
            let dir = tempfile::tempdir().unwrap();
            let store = Arc::new(PieceStore::open(dir.path(), &torrent).await.unwrap());

            let good_write = {
                let (store, data) = (Arc::clone(&store), data.clone());
                tokio::spawn(async move { store.write_block(0, 0, &data).await })
            };
            let bad_write = {
                let (store, bad) = (Arc::clone(&store), bad.clone());
                tokio::spawn(async move { store.write_block(0, 0, &bad).await })
            };
            let good_result = good_write.await.unwrap();
            let bad_result = bad_write.await.unwrap();

            // Exactly one delivery is taken
            let duplicates = [&good_result, &bad_result]
                .iter()
                .filter(|r| matches!(r, Ok(BlockWrite::Duplicate)))
                .count();
            assert_eq!(duplicates, 1);

            if store.is_piece_completed(0).await {
                assert!(matches!(good_result, Ok(BlockWrite::PieceCompleted(0))));
                let on_disk = store.read_block(BlockInfo::new(0, 0, 1000)).await.unwrap();
                assert_eq!(on_disk, data);
            } else {
                assert!(matches!(bad_result, Err(BittorrentError::PieceCorrupt(0))));
                assert_eq!(store.block_states(0).await, vec![BlockState::Missing]);
            }
        }
    }

    #[tokio::test]
    async fn test_verify_existing_and_read_block() {
        let dir = tempfile::tempdir().unwrap();
        let data = sample(24384);
        std::fs::write(dir.path().join("f"), &data).unwrap();
        let torrent = torrent_for(&data, 16384, &[("f", 24384)]);
        let store = PieceStore::open(dir.path(), &torrent).await.unwrap();

        assert!(store.read_block(BlockInfo::new(0, 0, 16)).await.is_err());
        assert_eq!(store.verify_existing().await.unwrap(), 2);
        assert!(store.is_complete());
        assert_eq!(store.owned_pieces().await, vec![true, true]);
        assert_eq!(store.bitfield().await, vec![0b1100_0000]);
        assert!(store
            .block_states(1)
            .await
            .iter()
            .all(|s| *s == BlockState::Completed));
        // Already verified pieces are not read again
        assert_eq!(store.verify_existing().await.unwrap(), 0);
        assert_eq!(store.completed_count(), 2);

        let block = store.read_block(BlockInfo::new(1, 100, 50)).await.unwrap();
        assert_eq!(block, &data[16484..16534]);
        assert!(store.read_block(BlockInfo::new(1, 7990, 20)).await.is_err());
    }
}
