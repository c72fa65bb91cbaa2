//! Splitting oversized blocks

use crate::block::DataBlock;

/// Strategy for breaking a block into smaller ones
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockSplitter {
    /// Never split
    NoOp,
    /// Split into row ranges whose estimated size fits the limit
    #[default]
    ByMemorySize,
}

impl BlockSplitter {
    /// Split `block` so that each piece stays within `max_size` bytes
    ///
    /// Pieces are zero-copy row ranges of the original batch, in order.
    /// A block already within the limit is yielded unchanged. A single row
    /// larger than the limit cannot be split further and is yielded whole.
    pub fn split(&self, block: DataBlock, max_size: usize) -> SplitBlocks {
        let num_rows = block.num_rows();
        let size = block.size_bytes();

        if *self == BlockSplitter::NoOp || size <= max_size || num_rows <= 1 || max_size == 0 {
            return SplitBlocks {
                block,
                rows_per_piece: num_rows.max(1),
                offset: 0,
                remaining: 1,
                whole: true,
            };
        }

        let pieces = size.div_ceil(max_size).min(num_rows);
        let rows_per_piece = num_rows.div_ceil(pieces);
        SplitBlocks {
            block,
            rows_per_piece,
            offset: 0,
            remaining: num_rows.div_ceil(rows_per_piece),
            whole: false,
        }
    }
}

/// Lazy sequence of pieces produced by [`BlockSplitter::split`]
#[derive(Debug)]
pub struct SplitBlocks {
    block: DataBlock,
    rows_per_piece: usize,
    offset: usize,
    remaining: usize,
    whole: bool,
}

impl SplitBlocks {
    /// Whether the block was actually split
    pub fn is_split(&self) -> bool {
        !self.whole
    }
}

impl Iterator for SplitBlocks {
    type Item = DataBlock;

    fn next(&mut self) -> Option<DataBlock> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        if self.whole {
            return Some(self.block.clone());
        }

        let batch = self.block.batch();
        let len = self.rows_per_piece.min(batch.num_rows() - self.offset);
        let piece = batch.slice(self.offset, len);
        self.offset += len;
        Some(DataBlock::new(piece))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for SplitBlocks {}
