use sha1::{Digest, Sha1};
use crate::{
    block::{num_blocks, BlockData},
    BLOCK_SIZE, ID,
};

// Accumulates the blocks of one in-progress piece until it can be verified.
#[derive(Debug)]
pub struct PieceBuf {

    // Piece hash originally given in the metainfo.
    hash: ID,

    len: usize,

    data: Vec<u8>,

    // Which blocks have arrived, to detect duplicates.
    blocks_received: Vec<bool>,

    num_blocks_received: usize,

}

impl PieceBuf {

    pub fn new(hash: ID, len: usize) -> Self {
        Self {
            hash,
            len,
            data: vec![0; len],
            blocks_received: vec![false; num_blocks(len)],
            num_blocks_received: 0,
        }
    }

    // Copies a block into place. Returns false for a duplicate, which is left
    // untouched. Block bounds are validated by the peer session.
    pub fn add_block(&mut self, block: &BlockData) -> bool {
        let block_idx = block.offset / BLOCK_SIZE;
        debug_assert!(block.offset + block.data.len() <= self.len);
        if self.blocks_received[block_idx] {
            return false;
        }
        self.blocks_received[block_idx] = true;
        self.num_blocks_received += 1;
        self.data[block.offset..block.offset + block.data.len()].copy_from_slice(&block.data);
        true
    }

    pub fn is_complete(&self) -> bool {
        self.num_blocks_received == self.blocks_received.len()
    }

    // Hash the piece data and compare with the metainfo hash (computationally
    // expensive).
    pub fn verify_hash(&self) -> bool {
        let mut hasher = Sha1::new();
        hasher.update(&self.data);
        hasher.finalize().as_slice() == self.hash
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}
