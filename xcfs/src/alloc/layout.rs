//! Placement of STFS data blocks and hash nodes on the backing store.
//!
//! Every group of 170 data blocks is preceded by its level-0 node, every
//! group of 170 level-0 groups by a level-1 node, and the single level-2 node
//! sits after the first level-1 group. Each node occupies `copies` backing
//! blocks (one per mirror). The positions never depend on the number of
//! tree levels in use, so growing a volume never moves existing blocks.

use crate::BlockNumber;

/// Entries per hash node.
pub const FANOUT: u32 = 0xAA;
/// Data blocks covered by one level-1 node.
pub const LEVEL1_SPAN: u32 = FANOUT * FANOUT;
/// Data blocks covered by the level-2 node.
pub const LEVEL2_SPAN: u32 = LEVEL1_SPAN * FANOUT;

/// How many mirror copies each hash node has.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    shift: u32,
}

impl Geometry {
    pub fn single_copy() -> Self {
        Geometry { shift: 0 }
    }

    pub fn double_copy() -> Self {
        Geometry { shift: 1 }
    }

    pub fn copies(self) -> u32 {
        1 << self.shift
    }

    pub fn is_single_copy(self) -> bool {
        self.shift == 0
    }

    /// Backing blocks between consecutive level-0 nodes and between
    /// consecutive level-1 nodes.
    fn steps(self) -> [u32; 2] {
        if self.is_single_copy() {
            [0xAB, 0x718F]
        } else {
            [0xAC, 0x723A]
        }
    }

    /// Backing block of data block `n`.
    pub fn data_block(self, n: BlockNumber) -> u32 {
        let s = self.shift;
        let base = (((n + FANOUT) / FANOUT) << s) + n;
        if n < FANOUT {
            base
        } else if n < LEVEL1_SPAN {
            base + (((n + LEVEL1_SPAN) / LEVEL1_SPAN) << s)
        } else {
            (1 << s) + base + (((n + LEVEL1_SPAN) / LEVEL1_SPAN) << s)
        }
    }

    /// Backing block of the first copy of the node at `level` that covers
    /// data block `n`.
    pub fn node_block(self, level: usize, n: BlockNumber) -> u32 {
        let s = self.shift;
        let [step0, step1] = self.steps();
        match level {
            0 => {
                if n < FANOUT {
                    return 0;
                }
                let mut block = (n / FANOUT) * step0 + (((n / LEVEL1_SPAN) + 1) << s);
                if n >= LEVEL1_SPAN {
                    block += 1 << s;
                }
                block
            }
            1 => {
                if n < LEVEL1_SPAN {
                    step0
                } else {
                    (1 << s) + (n / LEVEL1_SPAN) * step1
                }
            }
            _ => step1,
        }
    }

    /// Backing blocks needed to hold `total` data blocks and the nodes of a
    /// tree with `levels` levels.
    pub fn backing_blocks(self, total: u32, levels: usize) -> u32 {
        let copies = self.copies();
        let mut end = copies;
        if total > 0 {
            let last = total - 1;
            end = end.max(self.data_block(last) + 1);
            for level in 0..levels {
                end = end.max(self.node_block(level, last) + copies);
            }
        }
        end
    }
}

/// Number of tree levels needed for `total` data blocks.
pub fn levels_for(total: u32) -> usize {
    if total <= FANOUT {
        1
    } else if total <= LEVEL1_SPAN {
        2
    } else {
        3
    }
}

/// Data blocks covered by one node at `level`.
pub fn span(level: usize) -> u32 {
    match level {
        0 => FANOUT,
        1 => LEVEL1_SPAN,
        _ => LEVEL2_SPAN,
    }
}
