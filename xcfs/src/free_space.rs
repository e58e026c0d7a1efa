use crate::error::{Result, XcfsError};
use crate::BlockNumber;

const WORDS: usize = 32;
/// Number of ranges the index can describe.
pub const RANGES: u32 = (WORDS * 64) as u32;
const MIN_SHIFT: u32 = 6;

/// Coarse "this range has no free blocks" summary used by the allocators to
/// jump over exhausted stretches of the chain table or hash tree.
///
/// A set bit is a promise made by the allocator: it only marks a range after
/// walking every entry of it and finding none free. Any free inside the range
/// clears the bit again. The index never learns about free blocks on its own,
/// so a clear bit only means "might have a free block".
#[derive(Debug, Clone)]
pub struct FreeSpaceIndex {
    words: [u64; WORDS],
    shift: u32,
}

/// Decompose a range number into (word, bit).
fn decomposition(range: u32) -> (usize, u32) {
    ((range / 64) as usize, range % 64)
}

impl FreeSpaceIndex {
    /// Sizes the ranges so that `span` block numbers fit in the index.
    pub fn new(span: u32) -> Self {
        let per_range = (span as u64 + RANGES as u64 - 1) / RANGES as u64;
        let mut shift = MIN_SHIFT;
        while (1u64 << shift) < per_range {
            shift += 1;
        }
        FreeSpaceIndex {
            words: [0; WORDS],
            shift,
        }
    }

    pub fn shift(&self) -> u32 {
        self.shift
    }

    /// Number of blocks covered by one range bit.
    pub fn range_len(&self) -> u32 {
        1 << self.shift
    }

    /// One past the highest block number the index can describe.
    pub fn span(&self) -> u64 {
        (RANGES as u64) << self.shift
    }

    fn range_of(&self, block: BlockNumber) -> Result<u32> {
        if block as u64 >= self.span() {
            return Err(XcfsError::corruption(
                block,
                format!("block outside free space index span {:#x}", self.span()),
            ));
        }
        Ok(block >> self.shift)
    }

    /// True when `block` is the final entry of its range.
    pub fn is_range_end(&self, block: BlockNumber) -> bool {
        (block as u64 + 1) % self.range_len() as u64 == 0
    }

    pub fn mark_range(&mut self, block: BlockNumber) -> Result<()> {
        let (word, bit) = decomposition(self.range_of(block)?);
        self.words[word] |= 1u64 << bit;
        Ok(())
    }

    pub fn clear_range(&mut self, block: BlockNumber) -> Result<()> {
        let (word, bit) = decomposition(self.range_of(block)?);
        self.words[word] &= !(1u64 << bit);
        Ok(())
    }

    pub fn is_exhausted(&self, block: BlockNumber) -> Result<bool> {
        let (word, bit) = decomposition(self.range_of(block)?);
        Ok(self.words[word] & (1u64 << bit) != 0)
    }

    /// First block at or after `start` that is not inside an exhausted range.
    /// Returns `start` itself when its range is clear and `None` when every
    /// remaining range is exhausted.
    pub fn skip_to_free(&self, start: BlockNumber) -> Result<Option<BlockNumber>> {
        let range = self.range_of(start)?;
        let (mut word, bit) = decomposition(range);
        // Clear bits at or above the starting range in the first word.
        let mut open = !self.words[word] & (!0u64 << bit);
        loop {
            if open != 0 {
                let found = word as u32 * 64 + open.trailing_zeros();
                if found == range {
                    return Ok(Some(start));
                }
                return Ok(Some(found << self.shift));
            }
            word += 1;
            if word == WORDS {
                return Ok(None);
            }
            open = !self.words[word];
        }
    }

    /// Forget every mark. Always safe: marks are only an optimisation.
    pub fn clear_all(&mut self) {
        self.words = [0; WORDS];
    }

    /// Re-sizes the index for a larger volume. Existing marks are dropped when
    /// the range width changes.
    pub fn resize(&mut self, span: u32) {
        let resized = FreeSpaceIndex::new(span);
        if resized.shift != self.shift {
            *self = resized;
        }
    }

    pub fn exhausted_ranges(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_volumes_use_minimum_range_width() {
        let index = FreeSpaceIndex::new(1000);
        assert_eq!(index.shift(), 6);
        assert_eq!(index.range_len(), 64);
    }

    #[test]
    fn range_width_grows_to_cover_large_volumes() {
        // 2048 ranges of 128 blocks cover 262144 blocks.
        let index = FreeSpaceIndex::new(200_000);
        assert_eq!(index.shift(), 7);
        assert!(index.span() >= 200_000);
    }

    #[test]
    fn skip_jumps_over_marked_ranges() {
        let mut index = FreeSpaceIndex::new(10_000);
        index.mark_range(0).unwrap();
        index.mark_range(64).unwrap();
        index.mark_range(130).unwrap();
        assert_eq!(index.skip_to_free(5).unwrap(), Some(192));
        assert_eq!(index.skip_to_free(200).unwrap(), Some(200));
    }

    #[test]
    fn skip_crosses_word_boundaries() {
        let mut index = FreeSpaceIndex::new(10_000);
        for range in 0..70 {
            index.mark_range(range * 64).unwrap();
        }
        assert_eq!(index.skip_to_free(0).unwrap(), Some(70 * 64));
    }

    #[test]
    fn clearing_a_range_makes_it_visible_again() {
        let mut index = FreeSpaceIndex::new(1000);
        index.mark_range(10).unwrap();
        assert!(index.is_exhausted(63).unwrap());
        index.clear_range(63).unwrap();
        assert!(!index.is_exhausted(10).unwrap());
        assert_eq!(index.skip_to_free(10).unwrap(), Some(10));
    }

    #[test]
    fn fully_marked_index_has_no_free_candidate() {
        let mut index = FreeSpaceIndex::new(64);
        for range in 0..RANGES {
            index.mark_range(range << index.shift()).unwrap();
        }
        assert_eq!(index.skip_to_free(0).unwrap(), None);
        assert_eq!(index.exhausted_ranges(), RANGES);
    }

    #[test]
    fn out_of_span_block_is_corruption() {
        let index = FreeSpaceIndex::new(64);
        let err = index.is_exhausted(RANGES << 6).unwrap_err();
        assert!(matches!(err, XcfsError::Corruption { .. }));
    }

    #[test]
    fn range_end_detection() {
        let index = FreeSpaceIndex::new(64);
        assert!(index.is_range_end(63));
        assert!(!index.is_range_end(64));
    }
}
