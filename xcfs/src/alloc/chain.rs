use super::{AllocStats, AllocationMetadata, Extent, Link, MetaEnv};
use crate::cache::{BlockCache, ElementKind, WriteBack};
use crate::error::{Result, XcfsError};
use crate::free_space::FreeSpaceIndex;
use crate::BlockNumber;
use fileblock::{BlockStorage, BLOCK_SIZE};
use log::{debug, trace};
use std::collections::BTreeSet;

/// The chain table starts right after the volume header block.
pub const TABLE_OFFSET: u64 = 0x1000;
/// Volumes with at least this many clusters use 32-bit entries.
const WIDE_THRESHOLD: u32 = 0xFFF0;
const FREE: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryWidth {
    Narrow,
    Wide,
}

impl EntryWidth {
    fn for_clusters(clusters: u32) -> Self {
        if clusters < WIDE_THRESHOLD {
            EntryWidth::Narrow
        } else {
            EntryWidth::Wide
        }
    }

    pub fn bytes(self) -> usize {
        match self {
            EntryWidth::Narrow => 2,
            EntryWidth::Wide => 4,
        }
    }

    pub fn end_of_chain(self) -> u32 {
        match self {
            EntryWidth::Narrow => 0xFFFF,
            EntryWidth::Wide => 0xFFFF_FFFF,
        }
    }

    /// Value stored in entry 0.
    pub fn media_descriptor(self) -> u32 {
        match self {
            EntryWidth::Narrow => 0xFFF8,
            EntryWidth::Wide => 0xFFFF_FFF8,
        }
    }

    /// Values at or above this terminate a chain.
    fn end_threshold(self) -> u32 {
        self.media_descriptor()
    }
}

/// Placement of the chain table and the data area, derived from the medium
/// length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainGeometry {
    pub clusters: u32,
    pub width: EntryWidth,
    pub table_bytes: u64,
    pub data_offset: u64,
}

fn table_bytes(clusters: u32) -> u64 {
    let raw = (clusters as u64 + 1) * EntryWidth::for_clusters(clusters).bytes() as u64;
    let block = BLOCK_SIZE as u64;
    (raw + block - 1) / block * block
}

impl ChainGeometry {
    /// Largest cluster count whose table and data area fit in `len` bytes.
    pub fn for_length(len: u64) -> Result<Self> {
        let block = BLOCK_SIZE as u64;
        let usable = len.saturating_sub(TABLE_OFFSET);
        let upper = (usable / block).min(u32::MAX as u64 - 1) as u32;
        // Start from a count that certainly fits and walk up to the largest one.
        let mut clusters = (usable.saturating_sub(table_bytes(upper)) / block) as u32;
        while clusters < upper
            && table_bytes(clusters + 1) + (clusters as u64 + 1) * block <= usable
        {
            clusters += 1;
        }
        if clusters < 2 {
            return Err(XcfsError::InvalidArgument(format!(
                "medium of {:#x} bytes is too small for a chain table volume",
                len
            )));
        }
        let table_bytes = table_bytes(clusters);
        Ok(ChainGeometry {
            clusters,
            width: EntryWidth::for_clusters(clusters),
            table_bytes,
            data_offset: TABLE_OFFSET + table_bytes,
        })
    }

    /// Clusters are numbered from 1.
    pub fn cluster_offset(&self, cluster: BlockNumber) -> u64 {
        self.data_offset + (cluster as u64 - 1) * BLOCK_SIZE as u64
    }
}

fn page_offset(page: u32) -> u64 {
    TABLE_OFFSET + page as u64 * BLOCK_SIZE as u64
}

fn read_raw(buf: &[u8], width: EntryWidth, at: usize) -> u32 {
    match width {
        EntryWidth::Narrow => u16::from_be_bytes([buf[at], buf[at + 1]]) as u32,
        EntryWidth::Wide => u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]),
    }
}

fn write_raw(buf: &mut [u8], width: EntryWidth, at: usize, value: u32) {
    match width {
        EntryWidth::Narrow => buf[at..at + 2].copy_from_slice(&(value as u16).to_be_bytes()),
        EntryWidth::Wide => buf[at..at + 4].copy_from_slice(&value.to_be_bytes()),
    }
}

/// The FATX file allocation table. Its pages are mapped through the block
/// cache as [`ElementKind::TablePage`] elements, so they are evicted and
/// written back like every other block.
pub struct ChainTable {
    geometry: ChainGeometry,
    /// Pages of a freshly formatted table that were never mapped. They are
    /// created zeroed instead of being read.
    blank: BTreeSet<u32>,
    free: u32,
    hint: BlockNumber,
    index: FreeSpaceIndex,
    scan_steps: u64,
}

impl ChainTable {
    /// A fresh table: every cluster free except cluster 1, which holds the
    /// root directory.
    pub fn format(geometry: ChainGeometry) -> Self {
        let pages = (geometry.table_bytes / BLOCK_SIZE as u64) as u32;
        ChainTable {
            geometry,
            blank: (0..pages).collect(),
            free: geometry.clusters - 1,
            hint: 2,
            index: FreeSpaceIndex::new(geometry.clusters + 1),
            scan_steps: 0,
        }
    }

    pub fn load(env: &mut MetaEnv<'_>, geometry: ChainGeometry) -> Result<Self> {
        let mut table = ChainTable {
            geometry,
            blank: BTreeSet::new(),
            free: 0,
            hint: 1,
            index: FreeSpaceIndex::new(geometry.clusters + 1),
            scan_steps: 0,
        };
        let media = table.entry(env, 0)?;
        if media != geometry.width.media_descriptor() {
            return Err(XcfsError::corruption(
                0,
                format!("bad media descriptor {:#x} in chain table", media),
            ));
        }
        table.free = table.count_free(env)?;
        debug!(
            "loaded chain table: {} clusters, {} free, {}-bit entries",
            geometry.clusters,
            table.free,
            geometry.width.bytes() * 8
        );
        Ok(table)
    }

    pub fn geometry(&self) -> &ChainGeometry {
        &self.geometry
    }

    fn page_count(&self) -> u32 {
        (self.geometry.table_bytes / BLOCK_SIZE as u64) as u32
    }

    fn map_page(&mut self, env: &mut MetaEnv<'_>, page: u32) -> Result<usize> {
        let physical = page_offset(page);
        if !self.blank.contains(&page) {
            return env
                .cache
                .map_new(&mut *env.io, self, page, ElementKind::TablePage, physical, None);
        }
        let index = env
            .cache
            .map_empty(&mut *env.io, self, page, ElementKind::TablePage, physical)?;
        self.blank.remove(&page);
        if page == 0 {
            let width = self.geometry.width;
            let buf = env.cache.data_mut(index);
            write_raw(buf, width, 0, width.media_descriptor());
            write_raw(buf, width, width.bytes(), width.end_of_chain());
        }
        trace!("created chain table page {}", page);
        Ok(index)
    }

    /// Page and byte offset of a cluster's entry.
    fn locate(&self, cluster: BlockNumber) -> (u32, usize) {
        let at = cluster as usize * self.geometry.width.bytes();
        ((at / BLOCK_SIZE) as u32, at % BLOCK_SIZE)
    }

    fn entry(&mut self, env: &mut MetaEnv<'_>, cluster: BlockNumber) -> Result<u32> {
        let (page, at) = self.locate(cluster);
        let index = self.map_page(env, page)?;
        Ok(read_raw(env.cache.data(index), self.geometry.width, at))
    }

    fn set_entry(&mut self, env: &mut MetaEnv<'_>, cluster: BlockNumber, value: u32) -> Result<()> {
        let (page, at) = self.locate(cluster);
        let index = self.map_page(env, page)?;
        write_raw(env.cache.data_mut(index), self.geometry.width, at, value);
        env.cache.mark_dirty(index);
        Ok(())
    }

    fn check_cluster(&self, cluster: BlockNumber) -> Result<()> {
        if cluster == 0 || cluster > self.geometry.clusters {
            return Err(XcfsError::BlockOutOfRange(cluster));
        }
        Ok(())
    }

    fn decode(&mut self, env: &mut MetaEnv<'_>, cluster: BlockNumber) -> Result<Link> {
        let raw = self.entry(env, cluster)?;
        if raw == FREE {
            return Err(XcfsError::corruption(cluster, "chain runs into a free cluster"));
        }
        if raw >= self.geometry.width.end_threshold() {
            return Ok(Link::EndOfChain);
        }
        if raw > self.geometry.clusters {
            return Err(XcfsError::corruption(
                cluster,
                format!("link to cluster {:#x} outside the volume", raw),
            ));
        }
        Ok(Link::Next(raw))
    }

    /// Maps every page that has no content on the medium yet, so the next
    /// cache flush writes the whole table.
    pub fn create_blank_pages(&mut self, env: &mut MetaEnv<'_>) -> Result<()> {
        let blank: Vec<u32> = self.blank.iter().copied().collect();
        for page in blank {
            self.map_page(env, page)?;
        }
        Ok(())
    }

    /// Counts free entries from scratch, one page at a time. Used to
    /// cross-check the running counter.
    pub fn count_free(&mut self, env: &mut MetaEnv<'_>) -> Result<u32> {
        let width = self.geometry.width;
        let per_page = (BLOCK_SIZE / width.bytes()) as u32;
        let mut free = 0;
        for page in 0..self.page_count() {
            let base = page * per_page;
            let first = base.max(1);
            let last = (base + per_page - 1).min(self.geometry.clusters);
            if first > last {
                continue;
            }
            let index = self.map_page(env, page)?;
            let buf = env.cache.data(index);
            free += (first..=last)
                .filter(|&c| read_raw(buf, width, (c - base) as usize * width.bytes()) == FREE)
                .count() as u32;
        }
        Ok(free)
    }
}

/// Table pages carry no digests.
impl WriteBack for ChainTable {
    fn before_flush(&mut self, _: &mut BlockCache, _: &mut dyn BlockStorage, _: usize) -> Result<()> {
        Ok(())
    }
}

impl AllocationMetadata for ChainTable {
    fn allocate(
        &mut self,
        env: &mut MetaEnv<'_>,
        count: u32,
        link_after: Option<BlockNumber>,
    ) -> Result<Extent> {
        if count == 0 {
            return Err(XcfsError::InvalidArgument(
                "cannot allocate zero clusters".to_string(),
            ));
        }
        if count > self.free {
            return Err(XcfsError::DiskFull);
        }
        if let Some(after) = link_after {
            self.check_cluster(after)?;
        }
        let end_of_chain = self.geometry.width.end_of_chain();
        let mut first = None;
        let mut prev = link_after;
        let mut claimed = 0;
        let mut cluster = self.hint.max(1);
        while claimed < count {
            if cluster > self.geometry.clusters {
                return Err(XcfsError::corruption(
                    cluster,
                    "free counter exceeds free table entries",
                ));
            }
            if self.index.is_exhausted(cluster)? {
                match self.index.skip_to_free(cluster)? {
                    Some(next) => {
                        cluster = next;
                        continue;
                    }
                    None => {
                        return Err(XcfsError::corruption(
                            cluster,
                            "free counter exceeds free table entries",
                        ))
                    }
                }
            }
            self.scan_steps += 1;
            if self.entry(env, cluster)? == FREE {
                self.set_entry(env, cluster, end_of_chain)?;
                if let Some(p) = prev {
                    self.set_entry(env, p, cluster)?;
                }
                first.get_or_insert(cluster);
                prev = Some(cluster);
                claimed += 1;
            }
            // Everything below the walk start was already allocated, so a
            // walk that reaches the end of a range has seen it full.
            if self.index.is_range_end(cluster) {
                self.index.mark_range(cluster)?;
            }
            cluster += 1;
        }
        self.free -= count;
        self.hint = cluster;
        match (first, prev) {
            (Some(first), Some(last)) => {
                debug!(
                    "allocated {} clusters {:#x}..{:#x}, {} free",
                    count, first, last, self.free
                );
                Ok(Extent { first, last, count })
            }
            _ => Err(XcfsError::InvalidState(
                "allocation walk claimed nothing".to_string(),
            )),
        }
    }

    fn free(&mut self, env: &mut MetaEnv<'_>, first: BlockNumber, keep_first: bool) -> Result<u32> {
        self.check_cluster(first)?;
        let mut current = if keep_first {
            let link = self.decode(env, first)?;
            let end_of_chain = self.geometry.width.end_of_chain();
            self.set_entry(env, first, end_of_chain)?;
            match link {
                Link::EndOfChain => return Ok(0),
                Link::Next(next) => next,
            }
        } else {
            first
        };
        let mut freed = 0;
        loop {
            self.check_cluster(current)?;
            // Entries are cleared as the walk goes, so a cycle shows up as a
            // free cluster.
            let link = self.decode(env, current)?;
            self.set_entry(env, current, FREE)?;
            self.index.clear_range(current)?;
            self.hint = self.hint.min(current);
            env.cache.invalidate(current, ElementKind::Data)?;
            freed += 1;
            match link {
                Link::EndOfChain => break,
                Link::Next(next) => current = next,
            }
        }
        self.free += freed;
        debug!(
            "freed {} clusters from {:#x}, {} free",
            freed, first, self.free
        );
        Ok(freed)
    }

    fn link(&mut self, env: &mut MetaEnv<'_>, block: BlockNumber, to: Link) -> Result<()> {
        self.check_cluster(block)?;
        let value = match to {
            Link::Next(next) => {
                self.check_cluster(next)?;
                next
            }
            Link::EndOfChain => self.geometry.width.end_of_chain(),
        };
        self.set_entry(env, block, value)
    }

    fn next(&mut self, env: &mut MetaEnv<'_>, block: BlockNumber) -> Result<Link> {
        self.check_cluster(block)?;
        self.decode(env, block)
    }

    fn physical_offset(&self, block: BlockNumber) -> Result<u64> {
        self.check_cluster(block)?;
        Ok(self.geometry.cluster_offset(block))
    }

    fn stats(&self) -> AllocStats {
        AllocStats {
            total: self.geometry.clusters,
            free: self.free,
            free_pending: 0,
            hint: self.hint,
            scan_steps: self.scan_steps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{chain_extent, Run};
    use fileblock::MemoryBlockStorage;

    const MIB: u64 = 1024 * 1024;

    struct Fixture {
        io: MemoryBlockStorage,
        cache: BlockCache,
    }

    impl Fixture {
        fn new(len: u64) -> Self {
            Fixture {
                io: MemoryBlockStorage::new(len as usize / BLOCK_SIZE),
                cache: BlockCache::new(8),
            }
        }

        fn env(&mut self) -> MetaEnv<'_> {
            MetaEnv {
                cache: &mut self.cache,
                io: &mut self.io,
            }
        }
    }

    #[test]
    fn geometry_of_one_mebibyte_volume() {
        let geometry = ChainGeometry::for_length(MIB).unwrap();
        assert_eq!(geometry.clusters, 254);
        assert_eq!(geometry.width, EntryWidth::Narrow);
        assert_eq!(geometry.data_offset, 0x2000);
        assert_eq!(geometry.cluster_offset(254) + 4096, MIB);
    }

    #[test]
    fn large_volumes_switch_to_wide_entries() {
        let geometry = ChainGeometry::for_length(512 * MIB).unwrap();
        assert_eq!(geometry.width, EntryWidth::Wide);
        let used = geometry.data_offset + geometry.clusters as u64 * 4096;
        assert!(used <= 512 * MIB);
        assert!(512 * MIB - used < 4096 * 2);
    }

    #[test]
    fn tiny_medium_is_rejected() {
        assert!(ChainGeometry::for_length(8192).is_err());
    }

    #[test]
    fn allocate_and_free_round_trip_restores_counters() {
        let mut fx = Fixture::new(MIB);
        let mut table = ChainTable::format(ChainGeometry::for_length(MIB).unwrap());
        let before = table.stats();

        let extent = table.allocate(&mut fx.env(), 10, None).unwrap();
        assert_eq!(extent, Extent { first: 2, last: 11, count: 10 });
        assert_eq!(table.stats().free, before.free - 10);

        let freed = table.free(&mut fx.env(), extent.first, false).unwrap();
        assert_eq!(freed, 10);
        assert_eq!(table.stats().free, before.free);
        assert_eq!(table.stats().hint, before.hint);
    }

    #[test]
    fn allocation_threads_after_existing_chain() {
        let mut fx = Fixture::new(MIB);
        let mut table = ChainTable::format(ChainGeometry::for_length(MIB).unwrap());
        let a = table.allocate(&mut fx.env(), 2, None).unwrap();
        let _gap = table.allocate(&mut fx.env(), 1, None).unwrap();
        let b = table.allocate(&mut fx.env(), 2, Some(a.last)).unwrap();

        assert_eq!(table.next(&mut fx.env(), a.last).unwrap(), Link::Next(b.first));
        let (count, last) = chain_extent(&mut table, &mut fx.env(), a.first).unwrap();
        assert_eq!(count, 4);
        assert_eq!(last, b.last);
        let run = table.run_length(&mut fx.env(), a.first, 10).unwrap();
        assert_eq!(run, Run { len: 2, next: Link::Next(b.first) });
    }

    #[test]
    fn keep_first_truncates_to_one_cluster() {
        let mut fx = Fixture::new(MIB);
        let mut table = ChainTable::format(ChainGeometry::for_length(MIB).unwrap());
        let extent = table.allocate(&mut fx.env(), 4, None).unwrap();
        let freed = table.free(&mut fx.env(), extent.first, true).unwrap();
        assert_eq!(freed, 3);
        assert_eq!(table.next(&mut fx.env(), extent.first).unwrap(), Link::EndOfChain);
        assert_eq!(table.count_free(&mut fx.env()).unwrap(), table.stats().free);
    }

    #[test]
    fn freeing_a_free_cluster_is_corruption() {
        let mut fx = Fixture::new(MIB);
        let mut table = ChainTable::format(ChainGeometry::for_length(MIB).unwrap());
        let err = table.free(&mut fx.env(), 40, false).unwrap_err();
        assert!(matches!(err, XcfsError::Corruption { block: 40, .. }));
    }

    #[test]
    fn exhausting_the_volume_reports_disk_full() {
        let mut fx = Fixture::new(MIB);
        let mut table = ChainTable::format(ChainGeometry::for_length(MIB).unwrap());
        let free = table.stats().free;
        table.allocate(&mut fx.env(), free, None).unwrap();
        assert!(matches!(
            table.allocate(&mut fx.env(), 1, None),
            Err(XcfsError::DiskFull)
        ));
    }

    #[test]
    fn exhausted_ranges_are_skipped_without_scanning() {
        let mut fx = Fixture::new(4 * MIB);
        let mut table = ChainTable::format(ChainGeometry::for_length(4 * MIB).unwrap());
        // Fill ranges 0..=2 (clusters 0..=191; 0 and 1 are reserved).
        let a = table.allocate(&mut fx.env(), 62, None).unwrap();
        table.allocate(&mut fx.env(), 64, None).unwrap();
        table.allocate(&mut fx.env(), 64, None).unwrap();
        table.free(&mut fx.env(), a.first, false).unwrap();
        table.allocate(&mut fx.env(), 62, None).unwrap();

        let steps = table.stats().scan_steps;
        let next = table.allocate(&mut fx.env(), 1, None).unwrap();
        assert_eq!(next.first, 192);
        assert_eq!(table.stats().scan_steps - steps, 1);
    }

    #[test]
    fn table_survives_write_back_and_reload() {
        let mut fx = Fixture::new(MIB);
        let geometry = ChainGeometry::for_length(MIB).unwrap();
        let mut table = ChainTable::format(geometry);
        let extent = table.allocate(&mut fx.env(), 3, None).unwrap();
        assert!(fx.cache.contains(0, ElementKind::TablePage));
        fx.cache.flush_all(&mut fx.io, &mut table).unwrap();
        assert_eq!(fx.cache.dirty_count(), 0);

        fx.cache = BlockCache::new(8);
        let mut loaded = ChainTable::load(&mut fx.env(), geometry).unwrap();
        assert_eq!(loaded.stats().free, table.stats().free);
        let (count, _) = chain_extent(&mut loaded, &mut fx.env(), extent.first).unwrap();
        assert_eq!(count, 3);
    }

    #[test]
    fn table_pages_are_evicted_and_reread() {
        let len = 32 * MIB;
        let mut fx = Fixture::new(len);
        fx.cache = BlockCache::new(2);
        let geometry = ChainGeometry::for_length(len).unwrap();
        assert_eq!(geometry.table_bytes, 4 * BLOCK_SIZE as u64);
        let mut table = ChainTable::format(geometry);
        let free = table.stats().free;

        // Claiming every cluster walks all four pages through a two-slot cache.
        let extent = table.allocate(&mut fx.env(), free, None).unwrap();
        assert!(fx.cache.stats().evictions > 0);
        let (count, last) = chain_extent(&mut table, &mut fx.env(), extent.first).unwrap();
        assert_eq!((count, last), (free, geometry.clusters));
        fx.cache.flush_all(&mut fx.io, &mut table).unwrap();

        let raw = &fx.io.as_bytes()[TABLE_OFFSET as usize..];
        assert_eq!(&raw[0..4], &[0xFF, 0xF8, 0xFF, 0xFF]);
        assert_eq!(&raw[4..6], &[0x00, 0x03]);

        fx.cache = BlockCache::new(2);
        let mut loaded = ChainTable::load(&mut fx.env(), geometry).unwrap();
        assert_eq!(loaded.stats().free, 0);
        assert_eq!(loaded.count_free(&mut fx.env()).unwrap(), 0);
    }

    #[test]
    fn load_rejects_bad_media_descriptor() {
        let mut fx = Fixture::new(MIB);
        let geometry = ChainGeometry::for_length(MIB).unwrap();
        assert!(matches!(
            ChainTable::load(&mut fx.env(), geometry),
            Err(XcfsError::Corruption { block: 0, .. })
        ));
    }

    #[test]
    fn link_to_out_of_range_cluster_is_corruption() {
        let mut fx = Fixture::new(MIB);
        let mut table = ChainTable::format(ChainGeometry::for_length(MIB).unwrap());
        table.allocate(&mut fx.env(), 1, None).unwrap();
        table.set_entry(&mut fx.env(), 2, 0x4000).unwrap();
        assert!(matches!(
            table.next(&mut fx.env(), 2),
            Err(XcfsError::Corruption { .. })
        ));
    }
}
