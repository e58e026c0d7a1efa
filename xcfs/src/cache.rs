use crate::error::{Result, XcfsError};
use crate::hasher::{BlockHasher, Digest};
use crate::BlockNumber;
use fileblock::{BlockStorage, BLOCK_SIZE};
use log::{debug, trace};
use std::collections::HashMap;
use std::sync::Arc;

/// What a cached block holds. Data blocks, hash-tree nodes and chain table
/// pages share block numbers, so the kind is part of the cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ElementKind {
    Data,
    Level0,
    Level1,
    Level2,
    /// A page of the FATX chain table, numbered from the start of the table.
    TablePage,
}

impl ElementKind {
    /// Write-back order: children before the nodes that hash them.
    pub const FLUSH_ORDER: [ElementKind; 5] = [
        ElementKind::Data,
        ElementKind::Level0,
        ElementKind::Level1,
        ElementKind::Level2,
        ElementKind::TablePage,
    ];

    pub fn node(level: usize) -> Option<ElementKind> {
        match level {
            0 => Some(ElementKind::Level0),
            1 => Some(ElementKind::Level1),
            2 => Some(ElementKind::Level2),
            _ => None,
        }
    }

    pub fn node_level(self) -> Option<usize> {
        match self {
            ElementKind::Data | ElementKind::TablePage => None,
            ElementKind::Level0 => Some(0),
            ElementKind::Level1 => Some(1),
            ElementKind::Level2 => Some(2),
        }
    }
}

/// Hook run before a dirty, hashable element is written to the medium. The
/// element is pinned while the hook runs. A hook that needs a slot of its
/// own can starve eviction when every other element is dirty too, so hooks
/// only touch resident blocks.
pub trait WriteBack {
    fn before_flush(
        &mut self,
        cache: &mut BlockCache,
        io: &mut dyn BlockStorage,
        index: usize,
    ) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub writes: u64,
}

struct CacheElement {
    block: BlockNumber,
    kind: ElementKind,
    /// Byte offset the element is written back to.
    physical: u64,
    refs: u32,
    dirty: bool,
    hashable: bool,
    valid: bool,
    prev: usize,
    next: usize,
    buf: Vec<u8>,
}

impl CacheElement {
    fn empty(index: usize, capacity: usize) -> Self {
        CacheElement {
            block: 0,
            kind: ElementKind::Data,
            physical: 0,
            refs: 0,
            dirty: false,
            hashable: false,
            valid: false,
            prev: (index + capacity - 1) % capacity,
            next: (index + 1) % capacity,
            buf: vec![0; BLOCK_SIZE],
        }
    }
}

/// Fixed-size LRU cache of 4 KiB blocks.
///
/// Elements live in an arena and are threaded on a circular doubly-linked
/// list by index; `head` is the most recently used element and `head.prev`
/// the least. Callers hold an element with [`BlockCache::reference`] while
/// they work on its buffer; referenced elements are never reused.
pub struct BlockCache {
    elements: Vec<CacheElement>,
    head: usize,
    map: HashMap<(BlockNumber, ElementKind), usize>,
    verifier: Option<Arc<dyn BlockHasher>>,
    stats: CacheStats,
}

impl BlockCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        BlockCache {
            elements: (0..capacity)
                .map(|i| CacheElement::empty(i, capacity))
                .collect(),
            head: 0,
            map: HashMap::with_capacity(capacity),
            verifier: None,
            stats: CacheStats::default(),
        }
    }

    /// Check the content of every block read through `map_new` against the
    /// digest the caller expects.
    pub fn with_verifier(mut self, hasher: Arc<dyn BlockHasher>) -> Self {
        self.verifier = Some(hasher);
        self
    }

    pub fn capacity(&self) -> usize {
        self.elements.len()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn dirty_count(&self) -> usize {
        self.elements.iter().filter(|e| e.valid && e.dirty).count()
    }

    pub fn referenced_count(&self) -> usize {
        self.elements.iter().filter(|e| e.refs > 0).count()
    }

    /// Whether the block is resident, without touching the LRU order.
    pub fn contains(&self, block: BlockNumber, kind: ElementKind) -> bool {
        self.map.contains_key(&(block, kind))
    }

    fn unlink(&mut self, index: usize) {
        let (prev, next) = (self.elements[index].prev, self.elements[index].next);
        self.elements[prev].next = next;
        self.elements[next].prev = prev;
        if self.head == index {
            self.head = next;
        }
    }

    /// Inserts `index` just before the head, i.e. at the tail position.
    fn insert_before_head(&mut self, index: usize) {
        let head = self.head;
        let tail = self.elements[head].prev;
        self.elements[index].prev = tail;
        self.elements[index].next = head;
        self.elements[tail].next = index;
        self.elements[head].prev = index;
    }

    fn move_to_head(&mut self, index: usize) {
        if self.head == index {
            return;
        }
        self.unlink(index);
        self.insert_before_head(index);
        self.head = index;
    }

    fn move_to_tail(&mut self, index: usize) {
        if self.elements[self.head].prev == index {
            return;
        }
        self.unlink(index);
        self.insert_before_head(index);
    }

    /// Finds a resident block and makes it the most recently used.
    pub fn lookup(&mut self, block: BlockNumber, kind: ElementKind) -> Option<usize> {
        let index = *self.map.get(&(block, kind))?;
        self.move_to_head(index);
        self.stats.hits += 1;
        trace!("cache hit {:?} {:#x} at slot {}", kind, block, index);
        Some(index)
    }

    /// Maps a block, reading it from `physical` when it is not resident.
    ///
    /// When the cache was built with a verifier and `expected` is given, the
    /// content read from the medium must hash to it.
    pub fn map_new(
        &mut self,
        io: &mut dyn BlockStorage,
        wb: &mut dyn WriteBack,
        block: BlockNumber,
        kind: ElementKind,
        physical: u64,
        expected: Option<Digest>,
    ) -> Result<usize> {
        if let Some(index) = self.lookup(block, kind) {
            return Ok(index);
        }
        self.stats.misses += 1;
        let slot = self.acquire_slot(io, wb)?;
        // Write-back of a victim may have mapped this block already.
        if let Some(index) = self.lookup(block, kind) {
            return Ok(index);
        }
        io.read_at(physical, &mut self.elements[slot].buf)?;
        if let (Some(verifier), Some(expected)) = (&self.verifier, expected) {
            if verifier.digest(&self.elements[slot].buf) != expected {
                debug!("hash mismatch reading {:?} {:#x}", kind, block);
                return Err(XcfsError::HashMismatch { block });
            }
        }
        self.install(slot, block, kind, physical, false);
        Ok(slot)
    }

    /// Maps a block whose previous content is irrelevant: the buffer is
    /// zero-filled and dirty, and nothing is read.
    pub fn map_empty(
        &mut self,
        io: &mut dyn BlockStorage,
        wb: &mut dyn WriteBack,
        block: BlockNumber,
        kind: ElementKind,
        physical: u64,
    ) -> Result<usize> {
        let index = match self.lookup(block, kind) {
            Some(index) => index,
            None => {
                self.stats.misses += 1;
                let slot = self.acquire_slot(io, wb)?;
                match self.lookup(block, kind) {
                    Some(index) => index,
                    None => {
                        self.install(slot, block, kind, physical, true);
                        slot
                    }
                }
            }
        };
        let element = &mut self.elements[index];
        element.buf.iter_mut().for_each(|b| *b = 0);
        element.dirty = true;
        Ok(index)
    }

    fn install(
        &mut self,
        slot: usize,
        block: BlockNumber,
        kind: ElementKind,
        physical: u64,
        dirty: bool,
    ) {
        let element = &mut self.elements[slot];
        element.block = block;
        element.kind = kind;
        element.physical = physical;
        element.refs = 0;
        element.dirty = dirty;
        element.hashable = false;
        element.valid = true;
        self.map.insert((block, kind), slot);
        self.move_to_head(slot);
    }

    /// Returns an invalid, unreferenced slot, evicting the least recently used
    /// unreferenced element when needed.
    fn acquire_slot(&mut self, io: &mut dyn BlockStorage, wb: &mut dyn WriteBack) -> Result<usize> {
        let capacity = self.elements.len();
        // Each restart follows a write-back, which can only dirty nodes of a
        // higher level than the element it wrote.
        for _ in 0..=capacity * 4 {
            let mut candidate = None;
            let mut index = self.elements[self.head].prev;
            for _ in 0..capacity {
                if self.elements[index].refs == 0 {
                    candidate = Some(index);
                    break;
                }
                index = self.elements[index].prev;
            }
            let victim = candidate.ok_or(XcfsError::CacheOvercommitted)?;
            if !self.elements[victim].valid {
                return Ok(victim);
            }
            if self.elements[victim].dirty {
                self.flush_element(io, wb, victim)?;
                continue;
            }
            let element = &mut self.elements[victim];
            debug!(
                "evicting {:?} {:#x} from slot {}",
                element.kind, element.block, victim
            );
            self.map.remove(&(element.block, element.kind));
            element.valid = false;
            self.stats.evictions += 1;
            return Ok(victim);
        }
        Err(XcfsError::CacheOvercommitted)
    }

    pub fn reference(&mut self, index: usize) {
        self.elements[index].refs += 1;
    }

    pub fn dereference(&mut self, index: usize) -> Result<()> {
        let element = &mut self.elements[index];
        if element.refs == 0 {
            return Err(XcfsError::InvalidState(format!(
                "cache slot {} ({:?} {:#x}) is not referenced",
                index, element.kind, element.block
            )));
        }
        element.refs -= 1;
        Ok(())
    }

    pub fn refs(&self, index: usize) -> u32 {
        self.elements[index].refs
    }

    pub fn data(&self, index: usize) -> &[u8] {
        &self.elements[index].buf
    }

    /// Mutable access to the buffer. The caller marks the element dirty.
    pub fn data_mut(&mut self, index: usize) -> &mut [u8] {
        &mut self.elements[index].buf
    }

    pub fn mark_dirty(&mut self, index: usize) {
        self.elements[index].dirty = true;
    }

    pub fn is_dirty(&self, index: usize) -> bool {
        self.elements[index].dirty
    }

    /// Hashable elements run the write-back hook before they are written.
    pub fn set_hashable(&mut self, index: usize, hashable: bool) {
        self.elements[index].hashable = hashable;
    }

    pub fn key(&self, index: usize) -> (BlockNumber, ElementKind) {
        (self.elements[index].block, self.elements[index].kind)
    }

    pub fn physical(&self, index: usize) -> u64 {
        self.elements[index].physical
    }

    /// Points the element at a new write-back location.
    pub fn retarget(&mut self, index: usize, physical: u64) {
        self.elements[index].physical = physical;
    }

    pub fn flush_element(
        &mut self,
        io: &mut dyn BlockStorage,
        wb: &mut dyn WriteBack,
        index: usize,
    ) -> Result<()> {
        if !self.elements[index].valid || !self.elements[index].dirty {
            return Ok(());
        }
        self.elements[index].refs += 1;
        let result = self.write_element(io, wb, index);
        self.elements[index].refs -= 1;
        result
    }

    fn write_element(
        &mut self,
        io: &mut dyn BlockStorage,
        wb: &mut dyn WriteBack,
        index: usize,
    ) -> Result<()> {
        if self.elements[index].hashable {
            wb.before_flush(self, io, index)?;
        }
        let element = &mut self.elements[index];
        trace!(
            "writing {:?} {:#x} to {:#x}",
            element.kind,
            element.block,
            element.physical
        );
        io.write_at(element.physical, &element.buf)?;
        element.dirty = false;
        self.stats.writes += 1;
        Ok(())
    }

    /// Writes back every dirty element of `kind` with a block number in
    /// `low..=high`, in ascending block order.
    pub fn flush_range(
        &mut self,
        io: &mut dyn BlockStorage,
        wb: &mut dyn WriteBack,
        low: BlockNumber,
        high: BlockNumber,
        kind: ElementKind,
    ) -> Result<()> {
        let elements = &self.elements;
        let mut blocks: Vec<BlockNumber> = self
            .map
            .iter()
            .filter(|&(&(block, k), &i)| {
                k == kind && block >= low && block <= high && elements[i].dirty
            })
            .map(|(&(block, _), _)| block)
            .collect();
        blocks.sort_unstable();
        for block in blocks {
            if let Some(&index) = self.map.get(&(block, kind)) {
                self.flush_element(io, wb, index)?;
            }
        }
        Ok(())
    }

    /// Writes back everything, data first and then each node level bottom-up.
    pub fn flush_all(&mut self, io: &mut dyn BlockStorage, wb: &mut dyn WriteBack) -> Result<()> {
        for _ in 0..ElementKind::FLUSH_ORDER.len() {
            for kind in ElementKind::FLUSH_ORDER.iter() {
                self.flush_range(io, wb, 0, BlockNumber::MAX, *kind)?;
            }
            if self.dirty_count() == 0 {
                return Ok(());
            }
        }
        Err(XcfsError::InvalidState(
            "cache still dirty after repeated write-back".to_string(),
        ))
    }

    /// Drops a resident block without writing it back.
    pub fn invalidate(&mut self, block: BlockNumber, kind: ElementKind) -> Result<()> {
        let index = match self.map.get(&(block, kind)) {
            Some(&index) => index,
            None => return Ok(()),
        };
        if self.elements[index].refs > 0 {
            return Err(XcfsError::InvalidState(format!(
                "cannot invalidate referenced {:?} {:#x}",
                kind, block
            )));
        }
        self.map.remove(&(block, kind));
        let element = &mut self.elements[index];
        element.valid = false;
        element.dirty = false;
        self.move_to_tail(index);
        Ok(())
    }

    /// Forgets every element, dirty or not. Used to abandon a transaction.
    pub fn discard_all(&mut self) {
        for element in self.elements.iter_mut() {
            element.valid = false;
            element.dirty = false;
            element.refs = 0;
        }
        self.map.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fileblock::MemoryBlockStorage;

    struct PlainWriteBack;

    impl WriteBack for PlainWriteBack {
        fn before_flush(&mut self, _: &mut BlockCache, _: &mut dyn BlockStorage, _: usize) -> Result<()> {
            Ok(())
        }
    }

    fn offset(block: BlockNumber) -> u64 {
        block as u64 * BLOCK_SIZE as u64
    }

    fn map(cache: &mut BlockCache, io: &mut MemoryBlockStorage, block: BlockNumber) -> usize {
        cache
            .map_new(io, &mut PlainWriteBack, block, ElementKind::Data, offset(block), None)
            .unwrap()
    }

    #[test]
    fn lookup_after_map_hits() {
        let mut io = MemoryBlockStorage::new(16);
        let mut cache = BlockCache::new(8);
        let index = map(&mut cache, &mut io, 3);
        assert_eq!(cache.lookup(3, ElementKind::Data), Some(index));
        assert_eq!(cache.lookup(3, ElementKind::Level0), None);
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn least_recently_used_block_is_evicted() {
        let mut io = MemoryBlockStorage::new(16);
        let mut cache = BlockCache::new(4);
        for block in 0..4 {
            map(&mut cache, &mut io, block);
        }
        // Touch block 0 so block 1 becomes the oldest.
        cache.lookup(0, ElementKind::Data).unwrap();
        map(&mut cache, &mut io, 9);
        assert!(cache.contains(0, ElementKind::Data));
        assert!(!cache.contains(1, ElementKind::Data));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn referenced_elements_are_never_evicted() {
        let mut io = MemoryBlockStorage::new(16);
        let mut cache = BlockCache::new(4);
        let pinned = map(&mut cache, &mut io, 0);
        cache.reference(pinned);
        for block in 1..10 {
            map(&mut cache, &mut io, block);
        }
        assert!(cache.contains(0, ElementKind::Data));
        cache.dereference(pinned).unwrap();
    }

    #[test]
    fn all_referenced_cache_is_overcommitted() {
        let mut io = MemoryBlockStorage::new(16);
        let mut cache = BlockCache::new(2);
        for block in 0..2 {
            let index = map(&mut cache, &mut io, block);
            cache.reference(index);
        }
        let err = cache
            .map_new(&mut io, &mut PlainWriteBack, 5, ElementKind::Data, offset(5), None)
            .unwrap_err();
        assert!(matches!(err, XcfsError::CacheOvercommitted));
    }

    #[test]
    fn dereference_below_zero_is_invalid_state() {
        let mut io = MemoryBlockStorage::new(4);
        let mut cache = BlockCache::new(4);
        let index = map(&mut cache, &mut io, 1);
        cache.reference(index);
        cache.dereference(index).unwrap();
        assert!(matches!(
            cache.dereference(index),
            Err(XcfsError::InvalidState(_))
        ));
    }

    #[test]
    fn dirty_victims_are_written_before_reuse() {
        let mut io = MemoryBlockStorage::new(16);
        let mut cache = BlockCache::new(2);
        let index = cache
            .map_empty(&mut io, &mut PlainWriteBack, 7, ElementKind::Data, offset(7))
            .unwrap();
        cache.data_mut(index)[0] = 0xAB;
        map(&mut cache, &mut io, 1);
        map(&mut cache, &mut io, 2);
        assert!(!cache.contains(7, ElementKind::Data));
        assert_eq!(io.as_bytes()[offset(7) as usize], 0xAB);
    }

    #[test]
    fn flush_range_only_writes_matching_elements() {
        let mut io = MemoryBlockStorage::new(16);
        let mut cache = BlockCache::new(8);
        for block in [2, 5, 9].iter() {
            let index = cache
                .map_empty(&mut io, &mut PlainWriteBack, *block, ElementKind::Data, offset(*block))
                .unwrap();
            cache.data_mut(index)[0] = *block as u8;
        }
        cache
            .flush_range(&mut io, &mut PlainWriteBack, 0, 5, ElementKind::Data)
            .unwrap();
        assert_eq!(cache.dirty_count(), 1);
        assert_eq!(io.as_bytes()[offset(5) as usize], 5);
        assert_eq!(io.as_bytes()[offset(9) as usize], 0);
    }

    struct CountingHook {
        calls: Vec<BlockNumber>,
    }

    impl WriteBack for CountingHook {
        fn before_flush(
            &mut self,
            cache: &mut BlockCache,
            _: &mut dyn BlockStorage,
            index: usize,
        ) -> Result<()> {
            assert!(cache.refs(index) > 0, "element must be pinned during flush");
            self.calls.push(cache.key(index).0);
            Ok(())
        }
    }

    #[test]
    fn hook_runs_only_for_hashable_elements() {
        let mut io = MemoryBlockStorage::new(16);
        let mut cache = BlockCache::new(8);
        let mut hook = CountingHook { calls: Vec::new() };
        let a = cache
            .map_empty(&mut io, &mut hook, 1, ElementKind::Data, offset(1))
            .unwrap();
        cache.set_hashable(a, true);
        cache
            .map_empty(&mut io, &mut hook, 2, ElementKind::Data, offset(2))
            .unwrap();
        cache.flush_all(&mut io, &mut hook).unwrap();
        assert_eq!(hook.calls, vec![1]);
        assert_eq!(cache.stats().writes, 2);
    }

    #[test]
    fn verifier_rejects_unexpected_content() {
        use crate::hasher::Blake3Hasher;
        let mut io = MemoryBlockStorage::new(4);
        io.as_bytes_mut()[4096] = 1;
        let mut cache = BlockCache::new(4).with_verifier(Arc::new(Blake3Hasher));
        let expected = Blake3Hasher.digest(&[0; BLOCK_SIZE]);
        let err = cache
            .map_new(&mut io, &mut PlainWriteBack, 1, ElementKind::Data, 4096, Some(expected))
            .unwrap_err();
        assert!(matches!(err, XcfsError::HashMismatch { block: 1 }));
        assert!(cache
            .map_new(&mut io, &mut PlainWriteBack, 2, ElementKind::Data, 8192, Some(expected))
            .is_ok());
    }

    #[test]
    fn invalidate_drops_dirty_content() {
        let mut io = MemoryBlockStorage::new(4);
        let mut cache = BlockCache::new(4);
        let index = cache
            .map_empty(&mut io, &mut PlainWriteBack, 3, ElementKind::Data, offset(3))
            .unwrap();
        cache.data_mut(index)[0] = 0xFF;
        cache.invalidate(3, ElementKind::Data).unwrap();
        cache.flush_all(&mut io, &mut PlainWriteBack).unwrap();
        assert_eq!(io.write_count(), 0);
    }
}
