//! Maps byte offsets within a file to the blocks holding them.
//!
//! Chains are walked one run of consecutive blocks at a time, and the run
//! that satisfied the last lookup is remembered. Sequential access inside a
//! run is pure arithmetic; moving past it continues from the run's end rather
//! than from the start of the file.

use crate::alloc::{AllocationMetadata, Link, MetaEnv};
use crate::error::{Result, XcfsError};
use crate::BlockNumber;
use fileblock::BLOCK_SIZE;
use log::trace;

/// Where a file's chain starts and ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Anchor {
    pub first: BlockNumber,
    pub last: BlockNumber,
    pub block_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    pub block: BlockNumber,
    /// Blocks in the run from `block` on, `block` included.
    pub run_remaining: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Memo {
    logical: u32,
    physical: BlockNumber,
    len: u32,
}

impl Memo {
    fn covers(&self, logical: u32) -> bool {
        logical >= self.logical && logical - self.logical < self.len
    }
}

#[derive(Debug, Default, Clone)]
pub struct OffsetTranslator {
    memo: Option<Memo>,
}

impl OffsetTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Finds the block holding byte `offset` of the file.
    pub fn resolve<M: AllocationMetadata + ?Sized>(
        &mut self,
        meta: &mut M,
        env: &mut MetaEnv<'_>,
        anchor: Anchor,
        offset: u64,
    ) -> Result<Resolved> {
        let logical = offset / BLOCK_SIZE as u64;
        if logical >= anchor.block_count as u64 {
            return Err(XcfsError::InvalidArgument(format!(
                "offset {:#x} is past the {} blocks allocated",
                offset, anchor.block_count
            )));
        }
        let logical = logical as u32;
        if let Some(memo) = self.memo.filter(|m| m.covers(logical)) {
            let skip = logical - memo.logical;
            return Ok(Resolved {
                block: memo.physical + skip,
                run_remaining: memo.len - skip,
            });
        }
        if logical + 1 == anchor.block_count {
            return Ok(Resolved {
                block: anchor.last,
                run_remaining: 1,
            });
        }

        let (mut index, mut block) = match self.memo {
            Some(memo) if memo.logical + memo.len <= logical => {
                match meta.next(env, memo.physical + memo.len - 1)? {
                    Link::Next(next) => (memo.logical + memo.len, next),
                    Link::EndOfChain => return Err(short_chain(anchor, logical)),
                }
            }
            _ => (0, anchor.first),
        };
        loop {
            let run = meta.run_length(env, block, anchor.block_count - index)?;
            if logical - index < run.len {
                trace!(
                    "logical block {} in run {:#x}+{} at index {}",
                    logical,
                    block,
                    run.len,
                    index
                );
                self.memo = Some(Memo {
                    logical: index,
                    physical: block,
                    len: run.len,
                });
                let skip = logical - index;
                return Ok(Resolved {
                    block: block + skip,
                    run_remaining: run.len - skip,
                });
            }
            index += run.len;
            match run.next {
                Link::Next(next) if index < anchor.block_count => block = next,
                _ => return Err(short_chain(anchor, logical)),
            }
        }
    }

    pub fn invalidate(&mut self) {
        self.memo = None;
    }

    /// Forgets everything known about logical blocks at or after `logical`.
    pub fn invalidate_from(&mut self, logical: u32) {
        if let Some(memo) = self.memo.as_mut() {
            if memo.logical >= logical {
                self.memo = None;
            } else if memo.logical + memo.len > logical {
                memo.len = logical - memo.logical;
            }
        }
    }
}

fn short_chain(anchor: Anchor, logical: u32) -> XcfsError {
    XcfsError::corruption(
        anchor.first,
        format!(
            "chain ends before logical block {} of {}",
            logical, anchor.block_count
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::chain::ChainGeometry;
    use crate::alloc::{chain_extent, ChainTable};
    use crate::cache::BlockCache;
    use fileblock::MemoryBlockStorage;

    const MIB: u64 = 1024 * 1024;

    struct Fixture {
        io: MemoryBlockStorage,
        cache: BlockCache,
        table: ChainTable,
    }

    impl Fixture {
        fn new() -> Self {
            Fixture {
                io: MemoryBlockStorage::new(MIB as usize / BLOCK_SIZE),
                cache: BlockCache::new(8),
                table: ChainTable::format(ChainGeometry::for_length(MIB).unwrap()),
            }
        }

        fn env(&mut self) -> (MetaEnv<'_>, &mut ChainTable) {
            (
                MetaEnv {
                    cache: &mut self.cache,
                    io: &mut self.io,
                },
                &mut self.table,
            )
        }
    }

    fn at(logical: u32) -> u64 {
        logical as u64 * BLOCK_SIZE as u64
    }

    /// Builds the chain 2,3,4,7,8,9,5,6.
    fn fragmented(fx: &mut Fixture) -> Anchor {
        let (mut env, table) = fx.env();
        let head = table.allocate(&mut env, 3, None).unwrap();
        let gap = table.allocate(&mut env, 2, None).unwrap();
        let middle = table.allocate(&mut env, 3, Some(head.last)).unwrap();
        table.free(&mut env, gap.first, false).unwrap();
        let tail = table.allocate(&mut env, 2, Some(middle.last)).unwrap();
        assert_eq!((tail.first, tail.last), (5, 6));
        let (block_count, last) = chain_extent(table, &mut env, head.first).unwrap();
        Anchor {
            first: head.first,
            last,
            block_count,
        }
    }

    fn linear_walk(table: &mut ChainTable, env: &mut MetaEnv<'_>, first: BlockNumber) -> Vec<BlockNumber> {
        let mut blocks = vec![first];
        while let Link::Next(next) = table.next(env, *blocks.last().unwrap()).unwrap() {
            blocks.push(next);
        }
        blocks
    }

    #[test]
    fn agrees_with_a_linear_walk_in_any_order() {
        let mut fx = Fixture::new();
        let anchor = fragmented(&mut fx);
        let (mut env, table) = fx.env();
        let expected = linear_walk(table, &mut env, anchor.first);
        assert_eq!(expected, vec![2, 3, 4, 7, 8, 9, 5, 6]);

        let mut translator = OffsetTranslator::new();
        for &logical in [0u32, 5, 1, 7, 6, 2, 3, 4, 0].iter() {
            let resolved = translator
                .resolve(table, &mut env, anchor, at(logical))
                .unwrap();
            assert_eq!(resolved.block, expected[logical as usize], "logical {}", logical);
        }
    }

    #[test]
    fn reports_remaining_run_length() {
        let mut fx = Fixture::new();
        let anchor = fragmented(&mut fx);
        let (mut env, table) = fx.env();
        let mut translator = OffsetTranslator::new();
        let resolved = translator.resolve(table, &mut env, anchor, at(3)).unwrap();
        assert_eq!(resolved, Resolved { block: 7, run_remaining: 3 });
        let resolved = translator.resolve(table, &mut env, anchor, at(4)).unwrap();
        assert_eq!(resolved, Resolved { block: 8, run_remaining: 2 });
    }

    #[test]
    fn sequential_access_inside_a_run_reads_no_links() {
        let mut fx = Fixture::new();
        let (mut env, table) = fx.env();
        let extent = table.allocate(&mut env, 40, None).unwrap();
        let anchor = Anchor {
            first: extent.first,
            last: extent.last,
            block_count: extent.count,
        };
        let mut translator = OffsetTranslator::new();
        translator.resolve(table, &mut env, anchor, 0).unwrap();
        // Corrupt a link inside the run; the memo must answer without it.
        table.link(&mut env, extent.first + 10, Link::EndOfChain).unwrap();
        for logical in 1..39 {
            let resolved = translator.resolve(table, &mut env, anchor, at(logical)).unwrap();
            assert_eq!(resolved.block, extent.first + logical);
        }
    }

    #[test]
    fn last_block_comes_from_the_anchor() {
        let mut fx = Fixture::new();
        let anchor = fragmented(&mut fx);
        let (mut env, table) = fx.env();
        let mut translator = OffsetTranslator::new();
        let resolved = translator.resolve(table, &mut env, anchor, at(7)).unwrap();
        assert_eq!(resolved, Resolved { block: 6, run_remaining: 1 });
    }

    #[test]
    fn truncated_chain_is_corruption() {
        let mut fx = Fixture::new();
        let anchor = fragmented(&mut fx);
        let (mut env, table) = fx.env();
        table.link(&mut env, 4, Link::EndOfChain).unwrap();
        let mut translator = OffsetTranslator::new();
        assert!(matches!(
            translator.resolve(table, &mut env, anchor, at(5)),
            Err(XcfsError::Corruption { .. })
        ));
    }

    #[test]
    fn invalidation_trims_the_memo() {
        let mut fx = Fixture::new();
        let anchor = fragmented(&mut fx);
        let (mut env, table) = fx.env();
        let mut translator = OffsetTranslator::new();
        translator.resolve(table, &mut env, anchor, at(4)).unwrap();
        translator.invalidate_from(4);
        assert_eq!(
            translator.memo,
            Some(Memo {
                logical: 3,
                physical: 7,
                len: 1
            })
        );
        translator.invalidate_from(2);
        assert_eq!(translator.memo, None);
    }

    #[test]
    fn index_past_allocation_is_rejected() {
        let mut fx = Fixture::new();
        let anchor = fragmented(&mut fx);
        let (mut env, table) = fx.env();
        assert!(OffsetTranslator::new()
            .resolve(table, &mut env, anchor, at(8))
            .is_err());
    }
}
