mod store;

pub use store::{BlockWrite, PieceStore};

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Instant;

/// Standard block size (16 KB)
pub const BLOCK_SIZE: u32 = 16 * 1024;

/// Peer identity for ownership and request bookkeeping is `(ip, port)`
pub type PeerKey = SocketAddr;

/// Address of a block within a piece
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockInfo {
    pub piece_index: u32,
    /// Byte offset within the piece
    pub offset: u32,
    pub length: u32,
}

impl BlockInfo {
    pub fn new(piece_index: u32, offset: u32, length: u32) -> Self {
        Self {
            piece_index,
            offset,
            length,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Missing,
    /// Requested from `peer` at `requested_at`, not yet received
    Pending { peer: PeerKey, requested_at: Instant },
    /// Data accepted and being written to disk; later deliveries are duplicates
    Writing,
    Completed,
}

#[derive(Debug, Clone)]
pub struct Block {
    pub info: BlockInfo,
    pub state: BlockState,
}

/// Mutable state of one piece; only `PieceStore` touches it
#[derive(Debug)]
pub(crate) struct Piece {
    pub index: u32,
    pub hash: [u8; 20],
    pub length: u32,
    pub owners: HashSet<PeerKey>,
    pub blocks: Vec<Block>,
    /// Set only after every block arrived and the SHA-1 matched
    pub completed: bool,
    /// Assembly buffer, allocated on the first block and dropped on completion
    pub buffer: Option<Vec<u8>>,
}

impl Piece {
    /// Lay out blocks of `BLOCK_SIZE`; the last block of any piece may be short
    pub fn new(index: u32, hash: [u8; 20], length: u32) -> Self {
        let blocks = (0..length)
            .step_by(BLOCK_SIZE as usize)
            .map(|offset| Block {
                info: BlockInfo::new(index, offset, BLOCK_SIZE.min(length - offset)),
                state: BlockState::Missing,
            })
            .collect();

        Self {
            index,
            hash,
            length,
            owners: HashSet::new(),
            blocks,
            completed: false,
            buffer: None,
        }
    }

    pub fn block_at(&self, offset: u32) -> Option<usize> {
        if offset % BLOCK_SIZE != 0 {
            return None;
        }
        let index = (offset / BLOCK_SIZE) as usize;
        (index < self.blocks.len()).then_some(index)
    }

    pub fn all_blocks_completed(&self) -> bool {
        self.blocks
            .iter()
            .all(|b| b.state == BlockState::Completed)
    }

    /// Revert every block to `Missing` and discard assembled data
    pub fn reset(&mut self) {
        for block in &mut self.blocks {
            block.state = BlockState::Missing;
        }
        self.buffer = None;
    }
}
