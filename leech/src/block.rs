use crate::{store::StoreInfo, BLOCK_SIZE};

// A block payload travelling over the wire, in either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockData {

    // Index of piece that the block is contained in.
    pub piece_idx: usize,

    // Offset in bytes of block within piece.
    pub offset: usize,

    pub data: Vec<u8>,

}

// Identifies a block: piece index, byte offset within the piece, length.
#[derive(Debug, Hash, PartialEq, Eq, Clone, Copy)]
pub struct BlockInfo {

    pub piece_idx: usize,

    pub offset: usize,

    pub len: usize,

}

impl BlockInfo {

    pub fn of(block: &BlockData) -> Self {
        Self {
            piece_idx: block.piece_idx,
            offset: block.offset,
            len: block.data.len(),
        }
    }

    #[inline]
    pub fn idx_in_piece(&self) -> usize {
        self.offset / BLOCK_SIZE
    }

    // A block must be offset-aligned and exactly block-sized, short only when
    // it is the tail of the piece.
    pub fn is_valid(&self, info: &StoreInfo) -> bool {
        if self.piece_idx >= info.num_pieces || self.offset % BLOCK_SIZE != 0 {
            return false;
        }
        let piece_len = info.piece_length(self.piece_idx);
        self.idx_in_piece() < num_blocks(piece_len)
            && self.len == block_len(piece_len, self.idx_in_piece())
    }
}

pub fn block_len(piece_len: usize, block_idx: usize) -> usize {
    BLOCK_SIZE.min(piece_len - (block_idx * BLOCK_SIZE))
}

pub fn num_blocks(piece_len: usize) -> usize {
    (piece_len + (BLOCK_SIZE - 1)) / BLOCK_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_len() {
        let normal_piece_len = 32_768;
        let last_piece_len = 24_930;
        assert_eq!(block_len(normal_piece_len, 0), BLOCK_SIZE);
        assert_eq!(block_len(normal_piece_len, 1), BLOCK_SIZE);
        assert_eq!(block_len(last_piece_len, 0), BLOCK_SIZE);
        assert_eq!(block_len(last_piece_len, 1), 8546);
    }

    #[test]
    fn test_num_blocks() {
        (0..12).for_each(|i| assert_eq!(num_blocks(BLOCK_SIZE * i), i));
        assert_eq!(num_blocks(BLOCK_SIZE + 500), 2);
        assert_eq!(num_blocks(BLOCK_SIZE * 5 + 1000), 6);
        assert_eq!(num_blocks(0), 0);
    }

    #[test]
    fn test_request_validity() {
        let info = StoreInfo {
            total_len: 3 * 32_768 + 5_000,
            piece_len: 32_768,
            last_piece_len: 5_000,
            num_pieces: 4,
        };

        // Interior blocks must be exactly BLOCK_SIZE.
        assert!(BlockInfo { piece_idx: 0, offset: 0, len: BLOCK_SIZE }.is_valid(&info));
        assert!(BlockInfo { piece_idx: 2, offset: BLOCK_SIZE, len: BLOCK_SIZE }.is_valid(&info));
        assert!(!BlockInfo { piece_idx: 0, offset: 0, len: 100 }.is_valid(&info));
        assert!(!BlockInfo { piece_idx: 0, offset: 7, len: BLOCK_SIZE }.is_valid(&info));

        // Last piece is a single short block.
        assert!(BlockInfo { piece_idx: 3, offset: 0, len: 5_000 }.is_valid(&info));
        assert!(!BlockInfo { piece_idx: 3, offset: 0, len: BLOCK_SIZE }.is_valid(&info));
        assert!(!BlockInfo { piece_idx: 3, offset: BLOCK_SIZE, len: 1 }.is_valid(&info));

        // Out of range piece.
        assert!(!BlockInfo { piece_idx: 4, offset: 0, len: BLOCK_SIZE }.is_valid(&info));
    }
}
