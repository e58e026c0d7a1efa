//! Reading, writing and resizing a file's data through its Fcb.
//!
//! Everything here is shared by both volume formats and goes through the
//! translator and the block cache.

use crate::alloc::{AllocationMetadata, MetaEnv};
use crate::cache::ElementKind;
use crate::dirent::FatTimestamp;
use crate::error::{Result, XcfsError};
use crate::fcb::{Fcb, FcbFlags};
use crate::translate::Resolved;
use crate::BlockNumber;
use fileblock::BLOCK_SIZE;
use log::debug;

const BLOCK: u64 = BLOCK_SIZE as u64;
const MAX_FILE_SIZE: u64 = u32::MAX as u64;

fn blocks_for(size: u64) -> u64 {
    (size + BLOCK - 1) / BLOCK
}

fn resolve<M: AllocationMetadata>(
    meta: &mut M,
    env: &mut MetaEnv<'_>,
    fcb: &mut Fcb,
    offset: u64,
) -> Result<Resolved> {
    let anchor = fcb.anchor().ok_or_else(|| {
        XcfsError::InvalidState(format!("{:?} has no blocks at offset {:#x}", fcb.name, offset))
    })?;
    fcb.translator.resolve(meta, env, anchor, offset)
}

/// Reads up to `buf.len()` bytes at `offset`, stopping at end of file.
pub fn read<M: AllocationMetadata>(
    meta: &mut M,
    env: &mut MetaEnv<'_>,
    fcb: &mut Fcb,
    offset: u64,
    buf: &mut [u8],
) -> Result<usize> {
    let size = fcb.file_size as u64;
    if offset >= size {
        return Ok(0);
    }
    let len = (buf.len() as u64).min(size - offset) as usize;
    let valid = fcb.valid_size as u64;
    let mut done = 0;
    while done < len {
        let pos = offset + done as u64;
        let within = (pos % BLOCK) as usize;
        let chunk = (BLOCK_SIZE - within).min(len - done);
        let out = &mut buf[done..done + chunk];
        let block_start = pos - within as u64;
        if block_start >= valid {
            out.iter_mut().for_each(|b| *b = 0);
        } else {
            let block = resolve(meta, env, fcb, pos)?.block;
            let expected = meta.data_digest(env, block)?;
            let physical = meta.physical_offset(block)?;
            let index = env
                .cache
                .map_new(&mut *env.io, meta, block, ElementKind::Data, physical, expected)?;
            out.copy_from_slice(&env.cache.data(index)[within..within + chunk]);
            // Bytes past the valid length were never written.
            if pos + chunk as u64 > valid {
                let keep = (valid - pos.min(valid)) as usize;
                out[keep..].iter_mut().for_each(|b| *b = 0);
            }
        }
        done += chunk;
    }
    Ok(len)
}

/// Writes `data` at `offset`, growing the allocation and zero-filling any
/// gap between the old valid length and `offset`.
pub fn write<M: AllocationMetadata>(
    meta: &mut M,
    env: &mut MetaEnv<'_>,
    fcb: &mut Fcb,
    offset: u64,
    data: &[u8],
) -> Result<()> {
    if data.is_empty() {
        return Ok(());
    }
    let end = offset + data.len() as u64;
    if end > MAX_FILE_SIZE {
        return Err(XcfsError::InvalidArgument(format!(
            "write ending at {:#x} exceeds the file size limit",
            end
        )));
    }
    if end > fcb.allocation_size {
        set_allocation_size(meta, env, fcb, end, true)?;
    }
    let valid = fcb.valid_size as u64;
    if offset > valid {
        write_span(meta, env, fcb, valid, Source::Zeros((offset - valid) as usize))?;
    }
    write_span(meta, env, fcb, offset, Source::Bytes(data))?;
    fcb.valid_size = fcb.valid_size.max(end as u32);
    fcb.file_size = fcb.file_size.max(end as u32);
    fcb.written = FatTimestamp::now();
    fcb.flags |= FcbFlags::DIRTY;
    Ok(())
}

#[derive(Clone, Copy)]
enum Source<'a> {
    Bytes(&'a [u8]),
    Zeros(usize),
}

impl Source<'_> {
    fn len(&self) -> usize {
        match self {
            Source::Bytes(bytes) => bytes.len(),
            Source::Zeros(len) => *len,
        }
    }
}

fn write_span<M: AllocationMetadata>(
    meta: &mut M,
    env: &mut MetaEnv<'_>,
    fcb: &mut Fcb,
    offset: u64,
    source: Source<'_>,
) -> Result<()> {
    let len = source.len();
    let mut done = 0;
    while done < len {
        let pos = offset + done as u64;
        let within = (pos % BLOCK) as usize;
        let chunk = (BLOCK_SIZE - within).min(len - done);
        let block_start = pos - within as u64;
        let block = writable_block(meta, env, fcb, pos)?;
        let physical = meta.physical_offset(block)?;
        let fresh = block_start >= fcb.valid_size as u64 || chunk == BLOCK_SIZE;
        let index = if fresh {
            env.cache
                .map_empty(&mut *env.io, meta, block, ElementKind::Data, physical)?
        } else {
            let expected = meta.data_digest(env, block)?;
            env.cache
                .map_new(&mut *env.io, meta, block, ElementKind::Data, physical, expected)?
        };
        let target = &mut env.cache.data_mut(index)[within..within + chunk];
        match source {
            Source::Bytes(bytes) => target.copy_from_slice(&bytes[done..done + chunk]),
            Source::Zeros(_) => target.iter_mut().for_each(|b| *b = 0),
        }
        env.cache.mark_dirty(index);
        env.cache.set_hashable(index, meta.data_hashable());
        done += chunk;
    }
    Ok(())
}

/// Resolves the block holding `offset` and gives the metadata a chance to
/// move it before it is overwritten.
fn writable_block<M: AllocationMetadata>(
    meta: &mut M,
    env: &mut MetaEnv<'_>,
    fcb: &mut Fcb,
    offset: u64,
) -> Result<BlockNumber> {
    let logical = (offset / BLOCK) as u32;
    let block = resolve(meta, env, fcb, offset)?.block;
    let prev = if logical == 0 {
        None
    } else {
        Some(resolve(meta, env, fcb, offset - BLOCK)?.block)
    };
    let moved = match meta.relocate(env, prev, block)? {
        Some(moved) => moved,
        None => return Ok(block),
    };
    if logical == 0 {
        fcb.first_block = Some(moved);
    }
    if logical + 1 == fcb.block_count() {
        fcb.last_block = Some(moved);
    }
    fcb.flags.remove(FcbFlags::CONTIGUOUS);
    fcb.translator.invalidate_from(logical);
    fcb.flags |= FcbFlags::DIRTY;
    Ok(moved)
}

/// Grows or shrinks the chain to cover `size` bytes, rounded up to whole
/// blocks. With `disable_truncate` a smaller size leaves the chain alone.
pub fn set_allocation_size<M: AllocationMetadata>(
    meta: &mut M,
    env: &mut MetaEnv<'_>,
    fcb: &mut Fcb,
    size: u64,
    disable_truncate: bool,
) -> Result<()> {
    if size > MAX_FILE_SIZE {
        return Err(XcfsError::InvalidArgument(format!(
            "allocation of {:#x} bytes exceeds the file size limit",
            size
        )));
    }
    let wanted = blocks_for(size) as u32;
    let current = fcb.block_count();
    if wanted > current {
        let extent = meta.allocate(env, wanted - current, fcb.last_block)?;
        let consecutive = extent
            .last
            .checked_sub(extent.first)
            .map_or(false, |span| span + 1 == extent.count);
        let joined = match fcb.last_block {
            None => true,
            Some(last) => fcb.flags.contains(FcbFlags::CONTIGUOUS) && extent.first == last + 1,
        };
        fcb.flags.set(FcbFlags::CONTIGUOUS, consecutive && joined);
        if fcb.first_block.is_none() {
            fcb.first_block = Some(extent.first);
        }
        fcb.last_block = Some(extent.last);
        debug!(
            "{:?}: allocation grew {} -> {} blocks",
            fcb.name, current, wanted
        );
    } else if wanted < current && !disable_truncate {
        let first = fcb.first_block.ok_or_else(|| {
            XcfsError::InvalidState(format!("{:?} has blocks but no chain", fcb.name))
        })?;
        let freed = if wanted == 0 {
            let freed = meta.free(env, first, false)?;
            fcb.first_block = None;
            fcb.last_block = None;
            freed
        } else {
            let keep = resolve(meta, env, fcb, (wanted as u64 - 1) * BLOCK)?.block;
            let freed = meta.free(env, keep, true)?;
            fcb.last_block = Some(keep);
            freed
        };
        if freed != current - wanted {
            return Err(XcfsError::corruption(
                first,
                format!(
                    "freed {} blocks truncating {} -> {}",
                    freed, current, wanted
                ),
            ));
        }
        fcb.translator.invalidate_from(wanted);
        debug!(
            "{:?}: allocation shrank {} -> {} blocks",
            fcb.name, current, wanted
        );
    } else {
        return Ok(());
    }
    fcb.allocation_size = wanted as u64 * BLOCK;
    if (fcb.file_size as u64) > fcb.allocation_size {
        fcb.file_size = fcb.allocation_size as u32;
    }
    fcb.valid_size = fcb.valid_size.min(fcb.file_size);
    fcb.flags |= FcbFlags::DIRTY;
    Ok(())
}

/// Sets the logical length. Growing reserves blocks without writing them;
/// shrinking releases every block past the new end.
pub fn set_end_of_file<M: AllocationMetadata>(
    meta: &mut M,
    env: &mut MetaEnv<'_>,
    fcb: &mut Fcb,
    size: u64,
) -> Result<()> {
    if size > MAX_FILE_SIZE {
        return Err(XcfsError::InvalidArgument(format!(
            "end of file {:#x} exceeds the file size limit",
            size
        )));
    }
    if size > fcb.allocation_size || size < fcb.file_size as u64 {
        set_allocation_size(meta, env, fcb, size, false)?;
    }
    fcb.file_size = size as u32;
    fcb.valid_size = fcb.valid_size.min(fcb.file_size);
    fcb.written = FatTimestamp::now();
    fcb.flags |= FcbFlags::DIRTY;
    Ok(())
}

/// Appends `blocks` zeroed blocks to a directory stream.
pub fn extend_zeroed<M: AllocationMetadata>(
    meta: &mut M,
    env: &mut MetaEnv<'_>,
    fcb: &mut Fcb,
    blocks: u32,
) -> Result<()> {
    let start = fcb.allocation_size;
    set_allocation_size(meta, env, fcb, start + blocks as u64 * BLOCK, false)?;
    for n in 0..blocks as u64 {
        let block = resolve(meta, env, fcb, start + n * BLOCK)?.block;
        let physical = meta.physical_offset(block)?;
        let index = env
            .cache
            .map_empty(&mut *env.io, meta, block, ElementKind::Data, physical)?;
        env.cache.set_hashable(index, meta.data_hashable());
    }
    fcb.cover_allocation();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::chain::ChainGeometry;
    use crate::alloc::ChainTable;
    use crate::cache::BlockCache;
    use crate::dirent::Attributes;
    use fileblock::{BlockStorage, MemoryBlockStorage};

    const MIB: u64 = 1024 * 1024;

    struct Fixture {
        io: MemoryBlockStorage,
        cache: BlockCache,
        table: ChainTable,
        file: Fcb,
    }

    impl Fixture {
        fn new() -> Self {
            Fixture {
                io: MemoryBlockStorage::new(MIB as usize / BLOCK_SIZE),
                cache: BlockCache::new(8),
                table: ChainTable::format(ChainGeometry::for_length(MIB).unwrap()),
                file: Fcb::new("f", None, Attributes::empty(), FatTimestamp::default()),
            }
        }

        fn parts(&mut self) -> (&mut ChainTable, MetaEnv<'_>, &mut Fcb) {
            (
                &mut self.table,
                MetaEnv {
                    cache: &mut self.cache,
                    io: &mut self.io,
                },
                &mut self.file,
            )
        }
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn write_then_read_across_blocks() {
        let mut fx = Fixture::new();
        let (table, mut env, file) = fx.parts();
        let data = pattern(10_000);
        write(table, &mut env, file, 0, &data).unwrap();
        assert_eq!(file.allocation_size, 12_288);
        assert_eq!(file.file_size, 10_000);

        let mut back = vec![0; 10_000];
        assert_eq!(read(table, &mut env, file, 0, &mut back).unwrap(), 10_000);
        assert_eq!(back, data);
    }

    #[test]
    fn shrinking_end_of_file_frees_whole_blocks() {
        let mut fx = Fixture::new();
        let (table, mut env, file) = fx.parts();
        write(table, &mut env, file, 0, &pattern(10_000)).unwrap();
        let free = table.stats().free;
        set_end_of_file(table, &mut env, file, 6000).unwrap();
        assert_eq!(file.allocation_size, 8192);
        assert_eq!(table.stats().free, free + 1);

        let mut back = vec![0; 8192];
        assert_eq!(read(table, &mut env, file, 0, &mut back).unwrap(), 6000);
        assert_eq!(&back[..6000], &pattern(10_000)[..6000]);
    }

    #[test]
    fn gap_before_write_reads_as_zeros() {
        let mut fx = Fixture::new();
        let (table, mut env, file) = fx.parts();
        // Leave stale bytes on the medium where the file will land.
        let stale = vec![0xAB; BLOCK_SIZE];
        env.io
            .write_at(table.physical_offset(2).unwrap(), &stale)
            .unwrap();
        write(table, &mut env, file, 5000, b"tail").unwrap();
        let mut back = vec![0xFF; 5004];
        read(table, &mut env, file, 0, &mut back).unwrap();
        assert!(back[..5000].iter().all(|&b| b == 0));
        assert_eq!(&back[5000..], b"tail");
    }

    #[test]
    fn extending_end_of_file_reads_zeros() {
        let mut fx = Fixture::new();
        let (table, mut env, file) = fx.parts();
        write(table, &mut env, file, 0, b"abc").unwrap();
        set_end_of_file(table, &mut env, file, 9000).unwrap();
        assert_eq!(file.allocation_size, 12_288);
        let mut back = vec![0xFF; 9000];
        assert_eq!(read(table, &mut env, file, 0, &mut back).unwrap(), 9000);
        assert_eq!(&back[..3], b"abc");
        assert!(back[3..].iter().all(|&b| b == 0));
    }

    #[test]
    fn disable_truncate_keeps_blocks() {
        let mut fx = Fixture::new();
        let (table, mut env, file) = fx.parts();
        set_allocation_size(table, &mut env, file, 5 * BLOCK, false).unwrap();
        set_allocation_size(table, &mut env, file, BLOCK, true).unwrap();
        assert_eq!(file.block_count(), 5);
        set_allocation_size(table, &mut env, file, 0, false).unwrap();
        assert_eq!(file.first_block, None);
        assert_eq!(file.anchor(), None);
    }

    #[test]
    fn contiguous_flag_tracks_the_chain() {
        let mut fx = Fixture::new();
        let (table, mut env, file) = fx.parts();
        set_allocation_size(table, &mut env, file, 2 * BLOCK, false).unwrap();
        assert!(file.flags.contains(FcbFlags::CONTIGUOUS));
        // Something else takes the next block.
        table.allocate(&mut env, 1, None).unwrap();
        set_allocation_size(table, &mut env, file, 3 * BLOCK, false).unwrap();
        assert!(!file.flags.contains(FcbFlags::CONTIGUOUS));
    }

    #[test]
    fn read_past_end_returns_nothing() {
        let mut fx = Fixture::new();
        let (table, mut env, file) = fx.parts();
        write(table, &mut env, file, 0, b"abc").unwrap();
        let mut back = [0; 8];
        assert_eq!(read(table, &mut env, file, 3, &mut back).unwrap(), 0);
        assert_eq!(read(table, &mut env, file, 1, &mut back).unwrap(), 2);
    }
}
