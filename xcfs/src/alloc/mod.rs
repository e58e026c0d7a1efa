//! Block allocation metadata.
//!
//! Both volume formats describe a file as a singly linked chain of blocks; they
//! differ in where the links live. FATX keeps them in a flat [`ChainTable`];
//! STFS keeps them in the leaves of a [`HashTree`] whose interior nodes also
//! carry free counters and content digests. Everything above this module
//! (translation, file I/O, directories) is written once against
//! [`AllocationMetadata`].

pub mod chain;
pub mod hash_tree;
pub mod layout;

pub use chain::ChainTable;
pub use hash_tree::HashTree;

use crate::cache::{BlockCache, WriteBack};
use crate::error::{Result, XcfsError};
use crate::hasher::Digest;
use crate::BlockNumber;
use fileblock::BlockStorage;

/// The cache and medium an operation works through.
pub struct MetaEnv<'a> {
    pub cache: &'a mut BlockCache,
    pub io: &'a mut dyn BlockStorage,
}

/// Successor of a block in its chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link {
    Next(BlockNumber),
    EndOfChain,
}

/// Blocks handed out by one allocation, already chained first to last.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub first: BlockNumber,
    pub last: BlockNumber,
    pub count: u32,
}

/// A stretch of physically consecutive blocks inside a chain, and the link
/// that follows its final block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Run {
    pub len: u32,
    pub next: Link,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AllocStats {
    pub total: u32,
    pub free: u32,
    pub free_pending: u32,
    /// Lowest block that may still be free.
    pub hint: BlockNumber,
    /// Entries examined one at a time by allocation walks.
    pub scan_steps: u64,
}

impl AllocStats {
    pub fn allocated(&self) -> u32 {
        self.total - self.free - self.free_pending
    }
}

pub trait AllocationMetadata: WriteBack {
    /// Claims `count` blocks, chains them together and, when given, links
    /// `link_after` to the first of them.
    fn allocate(
        &mut self,
        env: &mut MetaEnv<'_>,
        count: u32,
        link_after: Option<BlockNumber>,
    ) -> Result<Extent>;

    /// Releases the chain starting at `first` and returns how many blocks were
    /// freed. With `keep_first`, `first` stays allocated as the new end of the
    /// chain and only its successors are released.
    fn free(&mut self, env: &mut MetaEnv<'_>, first: BlockNumber, keep_first: bool) -> Result<u32>;

    fn link(&mut self, env: &mut MetaEnv<'_>, block: BlockNumber, to: Link) -> Result<()>;

    fn next(&mut self, env: &mut MetaEnv<'_>, block: BlockNumber) -> Result<Link>;

    /// Length of the consecutive run beginning at `start`, capped at `max`.
    fn run_length(&mut self, env: &mut MetaEnv<'_>, start: BlockNumber, max: u32) -> Result<Run> {
        let mut len = 1;
        let mut current = start;
        loop {
            let link = self.next(env, current)?;
            if len >= max {
                return Ok(Run { len, next: link });
            }
            match link {
                Link::Next(next) if Some(next) == current.checked_add(1) => {
                    len += 1;
                    current = next;
                }
                other => return Ok(Run { len, next: other }),
            }
        }
    }

    /// Byte offset of a data block on the medium.
    fn physical_offset(&self, block: BlockNumber) -> Result<u64>;

    /// Digest a data block must match when it is read, if the format keeps one
    /// and verification is on.
    fn data_digest(&mut self, _env: &mut MetaEnv<'_>, _block: BlockNumber) -> Result<Option<Digest>> {
        Ok(None)
    }

    /// Whether data blocks run the write-back hook.
    fn data_hashable(&self) -> bool {
        false
    }

    /// Called before `block` is overwritten. Formats that never overwrite
    /// committed data move it to a fresh block and return the new number;
    /// `prev` is its predecessor in the chain.
    fn relocate(
        &mut self,
        _env: &mut MetaEnv<'_>,
        _prev: Option<BlockNumber>,
        _block: BlockNumber,
    ) -> Result<Option<BlockNumber>> {
        Ok(None)
    }

    fn stats(&self) -> AllocStats;
}

/// Walks a whole chain and returns its length and final block.
pub fn chain_extent<M: AllocationMetadata + ?Sized>(
    meta: &mut M,
    env: &mut MetaEnv<'_>,
    first: BlockNumber,
) -> Result<(u32, BlockNumber)> {
    let limit = meta.stats().total;
    let mut count = 0u32;
    let mut start = first;
    loop {
        let run = meta.run_length(env, start, limit.saturating_sub(count).max(1))?;
        count += run.len;
        if count > limit {
            return Err(XcfsError::corruption(first, "chain longer than the volume"));
        }
        let last = start + run.len - 1;
        match run.next {
            Link::EndOfChain => return Ok((count, last)),
            Link::Next(next) => {
                if count == limit {
                    return Err(XcfsError::corruption(first, "chain longer than the volume"));
                }
                start = next;
            }
        }
    }
}
