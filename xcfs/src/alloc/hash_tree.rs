use super::layout::{self, Geometry, FANOUT};
use super::{AllocStats, AllocationMetadata, Extent, Link, MetaEnv};
use crate::cache::{BlockCache, ElementKind, WriteBack};
use crate::error::{Result, XcfsError};
use crate::free_space::FreeSpaceIndex;
use crate::hasher::{BlockHasher, Digest, DIGEST_LEN};
use crate::BlockNumber;
use fileblock::{BlockStorage, BLOCK_SIZE};
use log::{debug, info, trace};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use zerocopy::byteorder::{BigEndian, U32};
use zerocopy::{AsBytes, FromBytes, LayoutVerified, Unaligned};

const ENTRY_SIZE: usize = 24;
/// Offset of the committed-block counter that follows the entries.
const COMMITTED_OFFSET: usize = FANOUT as usize * ENTRY_SIZE;
const END_OF_CHAIN: u32 = 0xFF_FFFF;
const COUNTER_MAX: u32 = 0x7FFF;

/// One slot of a hash node: the digest of the child and its packed state.
#[repr(C)]
#[derive(AsBytes, FromBytes, Unaligned, Clone, Copy)]
struct HashEntry {
    hash: [u8; DIGEST_LEN],
    info: U32<BigEndian>,
}

/// Which of a node's two backing copies is current.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mirror {
    A,
    B,
}

impl Mirror {
    pub fn from_bit(bit: bool) -> Self {
        if bit {
            Mirror::B
        } else {
            Mirror::A
        }
    }

    pub fn bit(self) -> bool {
        self == Mirror::B
    }

    pub fn flip(self) -> Self {
        match self {
            Mirror::A => Mirror::B,
            Mirror::B => Mirror::A,
        }
    }

    fn index(self) -> u32 {
        self.bit() as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Unallocated,
    /// Released in the open transaction; reusable after commit.
    FreePending,
    Allocated,
    /// Claimed in the open transaction.
    Pending,
}

impl BlockState {
    fn from_bits(bits: u32) -> Self {
        match bits & 0b11 {
            0 => BlockState::Unallocated,
            1 => BlockState::FreePending,
            2 => BlockState::Allocated,
            _ => BlockState::Pending,
        }
    }

    fn bits(self) -> u32 {
        match self {
            BlockState::Unallocated => 0,
            BlockState::FreePending => 1,
            BlockState::Allocated => 2,
            BlockState::Pending => 3,
        }
    }
}

/// Info word of a level-0 entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LeafInfo {
    state: BlockState,
    next: u32,
}

impl LeafInfo {
    fn decode(raw: u32) -> Self {
        LeafInfo {
            state: BlockState::from_bits(raw >> 30),
            next: raw & END_OF_CHAIN,
        }
    }

    fn encode(self) -> u32 {
        (self.state.bits() << 30) | (self.next & END_OF_CHAIN)
    }
}

/// Info word of an interior entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Counters {
    active: Mirror,
    free_pending: u32,
    free: u32,
}

impl Counters {
    fn decode(raw: u32) -> Self {
        Counters {
            active: Mirror::from_bit(raw >> 31 != 0),
            free_pending: (raw >> 15) & COUNTER_MAX,
            free: raw & COUNTER_MAX,
        }
    }

    fn encode(self) -> u32 {
        ((self.active.index()) << 31)
            | ((self.free_pending & COUNTER_MAX) << 15)
            | (self.free & COUNTER_MAX)
    }
}

fn node_entries(buf: &[u8]) -> Result<&[HashEntry]> {
    LayoutVerified::<_, [HashEntry]>::new_slice_unaligned(&buf[..COMMITTED_OFFSET])
        .map(|entries| entries.into_slice())
        .ok_or_else(|| XcfsError::InvalidState("hash node buffer has the wrong size".to_string()))
}

fn node_entries_mut(buf: &mut [u8]) -> Result<&mut [HashEntry]> {
    LayoutVerified::<_, [HashEntry]>::new_slice_unaligned(&mut buf[..COMMITTED_OFFSET])
        .map(|entries| entries.into_mut_slice())
        .ok_or_else(|| XcfsError::InvalidState("hash node buffer has the wrong size".to_string()))
}

fn read_entry(cache: &BlockCache, index: usize, slot: usize) -> Result<HashEntry> {
    Ok(node_entries(cache.data(index))?[slot])
}

fn write_info(cache: &mut BlockCache, index: usize, slot: usize, info: u32) -> Result<()> {
    node_entries_mut(cache.data_mut(index))?[slot].info.set(info);
    Ok(())
}

fn read_committed(cache: &BlockCache, index: usize) -> u32 {
    let mut raw = [0; 4];
    raw.copy_from_slice(&cache.data(index)[COMMITTED_OFFSET..COMMITTED_OFFSET + 4]);
    u32::from_be_bytes(raw)
}

fn write_committed(cache: &mut BlockCache, index: usize, committed: u32) {
    cache.data_mut(index)[COMMITTED_OFFSET..COMMITTED_OFFSET + 4]
        .copy_from_slice(&committed.to_be_bytes());
}

fn apply_delta(value: u32, delta: i64, max: u32, node: u32, what: &str) -> Result<u32> {
    let updated = value as i64 + delta;
    if updated < 0 || updated > max as i64 {
        return Err(XcfsError::corruption(
            node,
            format!("{} counter {} cannot change by {}", what, value, delta),
        ));
    }
    Ok(updated as u32)
}

/// Turns the pending states of one level-0 node into their committed
/// states. Returns the change in committed blocks and the blocks released.
fn settle_leaves(
    cache: &mut BlockCache,
    index: usize,
    node: u32,
) -> Result<(i64, Vec<BlockNumber>)> {
    let mut promoted = 0i64;
    let mut released = Vec::new();
    for slot in 0..FANOUT as usize {
        let info = LeafInfo::decode(read_entry(cache, index, slot)?.info.get());
        let state = match info.state {
            BlockState::Pending => {
                promoted += 1;
                BlockState::Allocated
            }
            BlockState::FreePending => {
                released.push(node * FANOUT + slot as u32);
                BlockState::Unallocated
            }
            other => other,
        };
        if state != info.state {
            write_info(cache, index, slot, LeafInfo { state, ..info }.encode())?;
        }
    }
    let committed = promoted - released.len() as i64;
    let value = apply_delta(read_committed(cache, index), committed, FANOUT, node, "committed")?;
    write_committed(cache, index, value);
    Ok((committed, released))
}

/// Counters and digest the descriptor keeps for the top node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootState {
    pub active: Mirror,
    pub hash: Digest,
    pub total: u32,
    pub free: u32,
    pub free_pending: u32,
}

pub struct TreeOptions {
    pub verify: bool,
    pub growable: bool,
    pub max_blocks: u32,
    pub hasher: Arc<dyn BlockHasher>,
}

/// Allocation state of an in-progress walk.
struct Claim {
    want: u32,
    got: u32,
    prev: Option<BlockNumber>,
    first: Option<BlockNumber>,
    /// Everything below the cursor is known to be unavailable.
    cursor: BlockNumber,
}

/// Totals found by a full recount of a subtree.
#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    free: u32,
    free_pending: u32,
    committed: u32,
}

/// The STFS allocation tree.
///
/// Leaves (level 0) carry the state and chain link of each data block;
/// interior entries carry free and free-pending counters for the subtree
/// below them. Every entry also holds the digest of what it points to, so the
/// descriptor's root digest covers the whole volume.
///
/// Nodes are double buffered. The first change to a node inside a transaction
/// flips the active bit in its parent (or the root) and retargets the cached
/// node at its other copy, so the committed tree is never overwritten. The
/// transaction becomes durable when the caller persists the new root.
///
/// Writing a block back stores its digest in the parent entry when the parent
/// is resident. Otherwise the digest is held in `held_digests` and applied the
/// next time the parent is mapped, so write-back never needs a cache slot.
pub struct HashTree {
    geometry: Geometry,
    backing_offset: u64,
    levels: usize,
    root: RootState,
    durable: RootState,
    shadowed: HashSet<(usize, u32)>,
    touched: BTreeSet<u32>,
    /// Digests waiting for their parent, keyed by the parent's level and the
    /// child's number at the level below (data block or node).
    held_digests: BTreeMap<(usize, u32), Digest>,
    /// A single-copy tree wrote over its only copy since the last commit.
    overwritten: bool,
    hint: BlockNumber,
    index: FreeSpaceIndex,
    scan_steps: u64,
    hasher: Arc<dyn BlockHasher>,
    verify: bool,
    growable: bool,
    max_blocks: u32,
}

impl HashTree {
    /// Attaches to a tree described by a persisted root.
    pub fn mount(
        geometry: Geometry,
        backing_offset: u64,
        root: RootState,
        options: TreeOptions,
    ) -> Result<Self> {
        if root.total == 0 || root.free > root.total {
            return Err(XcfsError::corruption(
                0,
                format!("root counters {}/{} are inconsistent", root.free, root.total),
            ));
        }
        Ok(HashTree {
            geometry,
            backing_offset,
            levels: layout::levels_for(root.total),
            root,
            durable: root,
            shadowed: HashSet::new(),
            touched: BTreeSet::new(),
            held_digests: BTreeMap::new(),
            overwritten: false,
            hint: 0,
            index: FreeSpaceIndex::new(root.total),
            scan_steps: 0,
            hasher: options.hasher,
            verify: options.verify,
            growable: options.growable,
            max_blocks: options.max_blocks,
        })
    }

    /// Builds and commits an empty tree of `total` blocks.
    pub fn format(
        env: &mut MetaEnv<'_>,
        geometry: Geometry,
        backing_offset: u64,
        total: u32,
        options: TreeOptions,
    ) -> Result<Self> {
        if total == 0 || total > options.max_blocks {
            return Err(XcfsError::InvalidArgument(format!(
                "cannot format a tree of {} blocks",
                total
            )));
        }
        let levels = layout::levels_for(total);
        let root = RootState {
            active: Mirror::A,
            hash: [0; DIGEST_LEN],
            total: 0,
            free: 0,
            free_pending: 0,
        };
        let mut tree = HashTree {
            geometry,
            backing_offset,
            levels,
            root,
            durable: root,
            shadowed: HashSet::new(),
            touched: BTreeSet::new(),
            held_digests: BTreeMap::new(),
            overwritten: false,
            hint: 0,
            index: FreeSpaceIndex::new(total),
            scan_steps: 0,
            hasher: options.hasher,
            verify: options.verify,
            growable: options.growable,
            max_blocks: options.max_blocks,
        };
        tree.extend_backing(env, total, levels)?;
        tree.create_node(env, levels - 1, 0)?;
        tree.add_blocks(env, total)?;
        tree.commit_dirty_buffers(env)?;
        info!(
            "formatted hash tree: {} blocks, {} levels, {} copies",
            total,
            levels,
            geometry.copies()
        );
        Ok(tree)
    }

    pub fn levels(&self) -> usize {
        self.levels
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Root as of the last commit.
    pub fn durable_root(&self) -> RootState {
        self.durable
    }

    /// Root including uncommitted changes.
    pub fn working_root(&self) -> RootState {
        self.root
    }

    /// Whether anything changed since the last commit.
    pub fn in_transaction(&self) -> bool {
        !self.touched.is_empty() || !self.shadowed.is_empty() || self.root != self.durable
    }

    /// Whether the open transaction can still be dropped. A single-copy tree
    /// loses that once any block of the transaction reached the medium.
    pub fn can_reset(&self) -> bool {
        !self.overwritten
    }

    fn check_block(&self, block: BlockNumber) -> Result<()> {
        if block >= self.root.total {
            return Err(XcfsError::BlockOutOfRange(block));
        }
        Ok(())
    }

    fn node_physical(&self, level: usize, node: u32, mirror: Mirror) -> u64 {
        let first_block = node * layout::span(level);
        let copy = mirror.index() % self.geometry.copies();
        self.backing_offset
            + (self.geometry.node_block(level, first_block) + copy) as u64 * BLOCK_SIZE as u64
    }

    fn node_kind(level: usize) -> Result<ElementKind> {
        ElementKind::node(level)
            .ok_or_else(|| XcfsError::InvalidState(format!("no hash tree level {}", level)))
    }

    fn extend_backing(&mut self, env: &mut MetaEnv<'_>, total: u32, levels: usize) -> Result<()> {
        let needed = self.backing_offset
            + self.geometry.backing_blocks(total, levels) as u64 * BLOCK_SIZE as u64;
        if needed > env.io.len() {
            debug!("extending backing store to {:#x} bytes", needed);
            env.io.extend(needed)?;
        }
        Ok(())
    }

    /// Maps a node and takes a reference on it.
    fn map_node(&mut self, env: &mut MetaEnv<'_>, level: usize, node: u32) -> Result<usize> {
        let kind = Self::node_kind(level)?;
        let index = match env.cache.lookup(node, kind) {
            Some(index) => index,
            None => self.read_node(env, level, node)?,
        };
        env.cache.reference(index);
        if let Err(err) = self.apply_held_digests(env, level, node, index) {
            env.cache.dereference(index)?;
            return Err(err);
        }
        Ok(index)
    }

    fn read_node(&mut self, env: &mut MetaEnv<'_>, level: usize, node: u32) -> Result<usize> {
        let kind = Self::node_kind(level)?;
        let (mirror, expected) = if level + 1 == self.levels {
            (self.root.active, self.root.hash)
        } else {
            let parent = self.map_node(env, level + 1, node / FANOUT)?;
            let entry = read_entry(env.cache, parent, (node % FANOUT) as usize);
            env.cache.dereference(parent)?;
            let entry = entry?;
            (Counters::decode(entry.info.get()).active, entry.hash)
        };
        let physical = self.node_physical(level, node, mirror);
        let expected = if self.verify { Some(expected) } else { None };
        let index = env
            .cache
            .map_new(&mut *env.io, self, node, kind, physical, expected)?;
        env.cache.set_hashable(index, true);
        Ok(index)
    }

    /// Moves digests held for the entries of a node into the node. The node
    /// is referenced by the caller.
    fn apply_held_digests(
        &mut self,
        env: &mut MetaEnv<'_>,
        level: usize,
        node: u32,
        index: usize,
    ) -> Result<()> {
        let first = node * FANOUT;
        let held: Vec<(u32, Digest)> = self
            .held_digests
            .range((level, first)..=(level, first + FANOUT - 1))
            .map(|(&(_, child), &digest)| (child, digest))
            .collect();
        if held.is_empty() {
            return Ok(());
        }
        self.shadow(env, level, node, index)?;
        let entries = node_entries_mut(env.cache.data_mut(index))?;
        for &(child, digest) in held.iter() {
            entries[(child % FANOUT) as usize].hash = digest;
        }
        env.cache.mark_dirty(index);
        for (child, _) in held {
            self.held_digests.remove(&(level, child));
        }
        trace!("applied held digests to level {} node {}", level, node);
        Ok(())
    }

    /// Maps a node for modification: shadows it on first change in the
    /// transaction and marks it dirty. The node is returned referenced.
    fn modify_node(&mut self, env: &mut MetaEnv<'_>, level: usize, node: u32) -> Result<usize> {
        let index = self.map_node(env, level, node)?;
        if let Err(err) = self.shadow(env, level, node, index) {
            env.cache.dereference(index)?;
            return Err(err);
        }
        env.cache.mark_dirty(index);
        Ok(index)
    }

    fn shadow(&mut self, env: &mut MetaEnv<'_>, level: usize, node: u32, index: usize) -> Result<()> {
        if self.geometry.is_single_copy() || !self.shadowed.insert((level, node)) {
            return Ok(());
        }
        let mirror = if level + 1 == self.levels {
            self.root.active = self.root.active.flip();
            self.root.active
        } else {
            let parent = self.modify_node(env, level + 1, node / FANOUT)?;
            let slot = (node % FANOUT) as usize;
            let flipped = read_entry(env.cache, parent, slot).and_then(|entry| {
                let mut counters = Counters::decode(entry.info.get());
                counters.active = counters.active.flip();
                write_info(env.cache, parent, slot, counters.encode())?;
                Ok(counters.active)
            });
            env.cache.dereference(parent)?;
            flipped?
        };
        trace!("shadowing level {} node {} to {:?}", level, node, mirror);
        env.cache.retarget(index, self.node_physical(level, node, mirror));
        env.cache.mark_dirty(index);
        Ok(())
    }

    /// Creates a zeroed node that has no committed copy yet.
    fn create_node(&mut self, env: &mut MetaEnv<'_>, level: usize, node: u32) -> Result<()> {
        let kind = Self::node_kind(level)?;
        let physical = self.node_physical(level, node, Mirror::A);
        let index = env
            .cache
            .map_empty(&mut *env.io, self, node, kind, physical)?;
        env.cache.set_hashable(index, true);
        // Nothing durable points at the new node, so it is written in place.
        self.shadowed.insert((level, node));
        trace!("created level {} node {}", level, node);
        Ok(())
    }

    fn leaf(&mut self, env: &mut MetaEnv<'_>, block: BlockNumber) -> Result<LeafInfo> {
        let index = self.map_node(env, 0, block / FANOUT)?;
        let entry = read_entry(env.cache, index, (block % FANOUT) as usize);
        env.cache.dereference(index)?;
        Ok(LeafInfo::decode(entry?.info.get()))
    }

    fn set_next(&mut self, env: &mut MetaEnv<'_>, block: BlockNumber, next: u32) -> Result<()> {
        let slot = (block % FANOUT) as usize;
        let index = self.modify_node(env, 0, block / FANOUT)?;
        let result = read_entry(env.cache, index, slot).and_then(|entry| {
            let mut info = LeafInfo::decode(entry.info.get());
            info.next = next;
            write_info(env.cache, index, slot, info.encode())
        });
        env.cache.dereference(index)?;
        result
    }

    /// Applies counter deltas to every interior entry above `block`, and to
    /// the root. `committed` adjusts the committed-block trailer of each
    /// interior node on the path.
    fn adjust_path(
        &mut self,
        env: &mut MetaEnv<'_>,
        block: BlockNumber,
        free: i64,
        free_pending: i64,
        committed: i64,
    ) -> Result<()> {
        for level in 1..self.levels {
            let node = block / layout::span(level);
            let slot = ((block / layout::span(level - 1)) % FANOUT) as usize;
            let index = self.modify_node(env, level, node)?;
            let result = read_entry(env.cache, index, slot).and_then(|entry| {
                let mut counters = Counters::decode(entry.info.get());
                counters.free = apply_delta(counters.free, free, COUNTER_MAX, node, "free")?;
                counters.free_pending = apply_delta(
                    counters.free_pending,
                    free_pending,
                    COUNTER_MAX,
                    node,
                    "free-pending",
                )?;
                write_info(env.cache, index, slot, counters.encode())?;
                if committed != 0 {
                    let value = apply_delta(
                        read_committed(env.cache, index),
                        committed,
                        u32::MAX,
                        node,
                        "committed",
                    )?;
                    write_committed(env.cache, index, value);
                }
                Ok(())
            });
            env.cache.dereference(index)?;
            result?;
        }
        self.root.free = apply_delta(self.root.free, free, u32::MAX, 0, "root free")?;
        self.root.free_pending =
            apply_delta(self.root.free_pending, free_pending, u32::MAX, 0, "root free-pending")?;
        Ok(())
    }

    /// Counts `count` new blocks after the current end of the tree, creating
    /// the nodes that cover them.
    fn add_blocks(&mut self, env: &mut MetaEnv<'_>, count: u32) -> Result<()> {
        let end = self.root.total + count;
        let mut block = self.root.total;
        while block < end {
            for level in (0..self.levels - 1).rev() {
                let span = layout::span(level);
                if block % span == 0 {
                    self.create_node(env, level, block / span)?;
                }
            }
            let chunk_end = ((block / FANOUT + 1) * FANOUT).min(end);
            self.adjust_path(env, block, (chunk_end - block) as i64, 0, 0)?;
            block = chunk_end;
        }
        self.root.total = end;
        self.index.resize(end);
        Ok(())
    }

    /// Moves the tree one level up: a new top node whose first entry
    /// describes the old root.
    fn promote_root(&mut self, env: &mut MetaEnv<'_>) -> Result<()> {
        let old_level = self.levels - 1;
        let new_level = self.levels;
        let old = self.map_node(env, old_level, 0)?;
        let committed = read_committed(env.cache, old);
        env.cache.dereference(old)?;

        let kind = Self::node_kind(new_level)?;
        let physical = self.node_physical(new_level, 0, Mirror::A);
        let index = env
            .cache
            .map_empty(&mut *env.io, self, 0, kind, physical)?;
        env.cache.set_hashable(index, true);
        env.cache.reference(index);
        // Any write-back of the old root while mapping has already updated
        // `self.root`, so it is read only now.
        let counters = Counters {
            active: self.root.active,
            free_pending: self.root.free_pending,
            free: self.root.free,
        };
        let hash = self.root.hash;
        let result = node_entries_mut(env.cache.data_mut(index)).map(|entries| {
            entries[0].hash = hash;
            entries[0].info.set(counters.encode());
        });
        write_committed(env.cache, index, committed);
        env.cache.dereference(index)?;
        result?;

        self.levels += 1;
        self.root.active = Mirror::A;
        self.shadowed.insert((new_level, 0));
        info!("promoted hash tree root to level {}", new_level);
        Ok(())
    }

    fn grow(&mut self, env: &mut MetaEnv<'_>, shortfall: u32) -> Result<()> {
        let total = self
            .root
            .total
            .checked_add(shortfall)
            .filter(|&total| total <= self.max_blocks)
            .ok_or(XcfsError::DiskFull)?;
        let levels = layout::levels_for(total);
        self.extend_backing(env, total, levels)?;
        while self.levels < levels {
            self.promote_root(env)?;
        }
        self.add_blocks(env, shortfall)?;
        debug!("grew hash tree by {} blocks to {}", shortfall, total);
        Ok(())
    }

    fn claim_in(
        &mut self,
        env: &mut MetaEnv<'_>,
        level: usize,
        node: u32,
        claim: &mut Claim,
    ) -> Result<u32> {
        if level == 0 {
            return self.claim_leaves(env, node, claim);
        }
        let child_span = layout::span(level - 1) as u64;
        let total = self.root.total as u64;
        let mut taken = 0;
        for slot in 0..FANOUT {
            if claim.got == claim.want {
                break;
            }
            let child = node * FANOUT + slot;
            let child_start = child as u64 * child_span;
            if child_start >= total {
                break;
            }
            let child_end = (child_start + child_span).min(total);
            if child_end <= claim.cursor as u64 {
                continue;
            }
            let index = self.map_node(env, level, node)?;
            let entry = read_entry(env.cache, index, slot as usize);
            env.cache.dereference(index)?;
            if Counters::decode(entry?.info.get()).free == 0 {
                claim.cursor = claim.cursor.max(child_end as u32);
                continue;
            }
            let claimed = self.claim_in(env, level - 1, child, claim)?;
            if claimed > 0 {
                let index = self.modify_node(env, level, node)?;
                let result = read_entry(env.cache, index, slot as usize).and_then(|entry| {
                    let mut counters = Counters::decode(entry.info.get());
                    counters.free =
                        apply_delta(counters.free, -(claimed as i64), COUNTER_MAX, node, "free")?;
                    write_info(env.cache, index, slot as usize, counters.encode())
                });
                env.cache.dereference(index)?;
                result?;
                taken += claimed;
            }
        }
        Ok(taken)
    }

    fn claim_leaves(&mut self, env: &mut MetaEnv<'_>, node: u32, claim: &mut Claim) -> Result<u32> {
        let index = self.map_node(env, 0, node)?;
        let result = self.claim_leaves_pinned(env, node, index, claim);
        env.cache.dereference(index)?;
        result
    }

    fn claim_leaves_pinned(
        &mut self,
        env: &mut MetaEnv<'_>,
        node: u32,
        index: usize,
        claim: &mut Claim,
    ) -> Result<u32> {
        let base = node * FANOUT;
        let end = (base + FANOUT).min(self.root.total);
        let mut block = claim.cursor.max(base);
        let mut taken = 0;
        while block < end && claim.got < claim.want {
            if self.index.is_exhausted(block)? {
                match self.index.skip_to_free(block)? {
                    Some(next) if next < end => block = next,
                    Some(next) => {
                        claim.cursor = claim.cursor.max(next);
                        block = end;
                    }
                    None => {
                        claim.cursor = self.root.total;
                        block = end;
                    }
                }
                continue;
            }
            self.scan_steps += 1;
            let slot = (block - base) as usize;
            let info = LeafInfo::decode(read_entry(env.cache, index, slot)?.info.get());
            if info.state == BlockState::Unallocated {
                self.shadow(env, 0, node, index)?;
                env.cache.mark_dirty(index);
                let claimed = LeafInfo {
                    state: BlockState::Pending,
                    next: END_OF_CHAIN,
                };
                write_info(env.cache, index, slot, claimed.encode())?;
                if let Some(prev) = claim.prev {
                    self.set_next(env, prev, block)?;
                }
                claim.first.get_or_insert(block);
                claim.prev = Some(block);
                claim.got += 1;
                taken += 1;
                self.touched.insert(node);
            }
            // Everything below the walk start is unavailable, so reaching
            // the end of a range means the whole range is.
            if self.index.is_range_end(block) {
                self.index.mark_range(block)?;
            }
            block += 1;
        }
        claim.cursor = claim.cursor.max(block);
        Ok(taken)
    }

    /// Releases one block and returns the link it held.
    fn release_block(&mut self, env: &mut MetaEnv<'_>, block: BlockNumber) -> Result<u32> {
        let node = block / FANOUT;
        let slot = (block % FANOUT) as usize;
        let index = self.modify_node(env, 0, node)?;
        let result = read_entry(env.cache, index, slot).and_then(|entry| {
            let info = LeafInfo::decode(entry.info.get());
            // A block claimed in this transaction counts as committed while it
            // is free-pending, so the commit that releases it balances out.
            let committed = match info.state {
                BlockState::Allocated => 0,
                BlockState::Pending => 1,
                other => {
                    return Err(XcfsError::corruption(
                        block,
                        format!("freeing a block in state {:?}", other),
                    ))
                }
            };
            let released = LeafInfo {
                state: BlockState::FreePending,
                next: 0,
            };
            write_info(env.cache, index, slot, released.encode())?;
            if committed != 0 {
                let value =
                    apply_delta(read_committed(env.cache, index), committed, FANOUT, node, "committed")?;
                write_committed(env.cache, index, value);
            }
            Ok((info.next, committed))
        });
        env.cache.dereference(index)?;
        let (next, committed) = result?;
        self.touched.insert(node);
        self.adjust_path(env, block, 0, 1, committed)?;
        Ok(next)
    }

    /// Makes the open transaction's allocation changes permanent in the tree
    /// and writes every dirty block. The caller persists the new root.
    pub fn commit_dirty_buffers(&mut self, env: &mut MetaEnv<'_>) -> Result<()> {
        let touched = std::mem::take(&mut self.touched);
        for node in touched {
            self.commit_leaves(env, node)?;
        }
        env.cache.flush_all(&mut *env.io, self)?;
        // Lowest level first: mapping a node applies what is held for it, and
        // writing it back may hold a digest one level up.
        while let Some(&(level, child)) = self.held_digests.keys().next() {
            let index = self.map_node(env, level, child / FANOUT)?;
            env.cache.dereference(index)?;
            env.cache.flush_all(&mut *env.io, self)?;
        }
        self.shadowed.clear();
        self.overwritten = false;
        self.durable = self.root;
        debug!(
            "committed hash tree: {} free of {}, root {:?}",
            self.root.free, self.root.total, self.root.active
        );
        Ok(())
    }

    fn commit_leaves(&mut self, env: &mut MetaEnv<'_>, node: u32) -> Result<()> {
        let index = self.modify_node(env, 0, node)?;
        let result = settle_leaves(env.cache, index, node);
        env.cache.dereference(index)?;
        let (committed, released) = result?;
        let count = released.len() as i64;
        if count != 0 || committed != 0 {
            self.adjust_path(env, node * FANOUT, count, -count, committed)?;
        }
        for block in released {
            self.index.clear_range(block)?;
            self.hint = self.hint.min(block);
        }
        Ok(())
    }

    /// Abandons the open transaction. Cached state is dropped without being
    /// written, and the tree returns to the last committed root.
    ///
    /// Fails with `InvalidState` on a single-copy tree that already wrote part
    /// of the transaction over committed blocks; only a commit is left then.
    pub fn reset_write_state(&mut self, env: &mut MetaEnv<'_>) -> Result<()> {
        if !self.can_reset() {
            return Err(XcfsError::InvalidState(
                "single-copy blocks were overwritten since the last commit".to_string(),
            ));
        }
        env.cache.discard_all();
        self.root = self.durable;
        self.levels = layout::levels_for(self.root.total);
        self.shadowed.clear();
        self.touched.clear();
        self.held_digests.clear();
        self.hint = 0;
        self.index = FreeSpaceIndex::new(self.root.total);
        info!("aborted hash tree transaction, {} free", self.root.free);
        Ok(())
    }

    /// Recounts every node and checks interior counters, committed trailers
    /// and the root totals against the leaves.
    pub fn verify_counters(&mut self, env: &mut MetaEnv<'_>) -> Result<()> {
        let tally = self.tally(env, self.levels - 1, 0)?;
        if tally.free != self.root.free || tally.free_pending != self.root.free_pending {
            return Err(XcfsError::corruption(
                0,
                format!(
                    "root counters {}/{} disagree with tree {}/{}",
                    self.root.free, self.root.free_pending, tally.free, tally.free_pending
                ),
            ));
        }
        Ok(())
    }

    fn tally(&mut self, env: &mut MetaEnv<'_>, level: usize, node: u32) -> Result<Tally> {
        let total = self.root.total;
        let index = self.map_node(env, level, node)?;
        let entries: Result<Vec<HashEntry>> = node_entries(env.cache.data(index)).map(|e| e.to_vec());
        let recorded = read_committed(env.cache, index);
        env.cache.dereference(index)?;
        let entries = entries?;

        let mut tally = Tally::default();
        if level == 0 {
            let base = node * FANOUT;
            for (slot, entry) in entries.iter().enumerate() {
                if base + slot as u32 >= total {
                    break;
                }
                match LeafInfo::decode(entry.info.get()).state {
                    BlockState::Unallocated => tally.free += 1,
                    BlockState::FreePending => {
                        tally.free_pending += 1;
                        tally.committed += 1;
                    }
                    BlockState::Allocated => tally.committed += 1,
                    BlockState::Pending => {}
                }
            }
        } else {
            let child_span = layout::span(level - 1) as u64;
            for (slot, entry) in entries.iter().enumerate() {
                let child = node * FANOUT + slot as u32;
                if child as u64 * child_span >= total as u64 {
                    break;
                }
                let below = self.tally(env, level - 1, child)?;
                let counters = Counters::decode(entry.info.get());
                if counters.free != below.free || counters.free_pending != below.free_pending {
                    return Err(XcfsError::corruption(
                        node,
                        format!(
                            "level {} entry {} records {}/{} but subtree has {}/{}",
                            level,
                            slot,
                            counters.free,
                            counters.free_pending,
                            below.free,
                            below.free_pending
                        ),
                    ));
                }
                tally.free += below.free;
                tally.free_pending += below.free_pending;
                tally.committed += below.committed;
            }
        }
        if recorded != tally.committed {
            return Err(XcfsError::corruption(
                node,
                format!(
                    "level {} committed counter {} but subtree has {}",
                    level, recorded, tally.committed
                ),
            ));
        }
        Ok(tally)
    }
}

impl WriteBack for HashTree {
    /// Stores the digest of the block being written in the entry that points
    /// at it. The top node's digest goes to the root.
    fn before_flush(
        &mut self,
        cache: &mut BlockCache,
        _: &mut dyn BlockStorage,
        index: usize,
    ) -> Result<()> {
        let (block, kind) = cache.key(index);
        let digest = self.hasher.digest(cache.data(index));
        if self.geometry.is_single_copy() {
            self.overwritten = true;
        }
        let parent_level = match kind.node_level() {
            None => 0,
            Some(level) if level + 1 >= self.levels => {
                self.root.hash = digest;
                return Ok(());
            }
            Some(level) => level + 1,
        };
        let parent = block / FANOUT;
        // An unshadowed parent would need its own parent mapped first.
        let writable =
            self.geometry.is_single_copy() || self.shadowed.contains(&(parent_level, parent));
        match cache.lookup(parent, Self::node_kind(parent_level)?) {
            Some(slot) if writable => {
                node_entries_mut(cache.data_mut(slot))?[(block % FANOUT) as usize].hash = digest;
                cache.mark_dirty(slot);
            }
            _ => {
                trace!("holding digest of {:?} {:#x}", kind, block);
                self.held_digests.insert((parent_level, block), digest);
            }
        }
        Ok(())
    }
}

impl AllocationMetadata for HashTree {
    fn allocate(
        &mut self,
        env: &mut MetaEnv<'_>,
        count: u32,
        link_after: Option<BlockNumber>,
    ) -> Result<Extent> {
        if count == 0 {
            return Err(XcfsError::InvalidArgument(
                "cannot allocate zero blocks".to_string(),
            ));
        }
        if let Some(after) = link_after {
            self.check_block(after)?;
        }
        if count > self.root.free {
            if !self.growable {
                return Err(XcfsError::DiskFull);
            }
            self.grow(env, count - self.root.free)?;
        }
        let mut claim = Claim {
            want: count,
            got: 0,
            prev: link_after,
            first: None,
            cursor: self.hint,
        };
        let top = self.levels - 1;
        self.claim_in(env, top, 0, &mut claim)?;
        self.root.free =
            apply_delta(self.root.free, -(claim.got as i64), u32::MAX, 0, "root free")?;
        self.hint = claim.cursor;
        match (claim.first, claim.prev) {
            (Some(first), Some(last)) if claim.got == count => {
                debug!(
                    "allocated {} blocks {:#x}..{:#x}, {} free",
                    count, first, last, self.root.free
                );
                Ok(Extent { first, last, count })
            }
            _ => Err(XcfsError::corruption(
                claim.cursor,
                format!(
                    "counters promised {} free blocks but the walk found {}",
                    count, claim.got
                ),
            )),
        }
    }

    fn free(&mut self, env: &mut MetaEnv<'_>, first: BlockNumber, keep_first: bool) -> Result<u32> {
        self.check_block(first)?;
        let mut current = if keep_first {
            let info = self.leaf(env, first)?;
            self.set_next(env, first, END_OF_CHAIN)?;
            if info.next == END_OF_CHAIN {
                return Ok(0);
            }
            info.next
        } else {
            first
        };
        let mut freed = 0;
        loop {
            self.check_block(current)?;
            let next = self.release_block(env, current)?;
            env.cache.invalidate(current, ElementKind::Data)?;
            freed += 1;
            if next == END_OF_CHAIN {
                break;
            }
            current = next;
        }
        debug!(
            "freed {} blocks from {:#x}, {} free, {} pending",
            freed, first, self.root.free, self.root.free_pending
        );
        Ok(freed)
    }

    fn link(&mut self, env: &mut MetaEnv<'_>, block: BlockNumber, to: Link) -> Result<()> {
        self.check_block(block)?;
        let next = match to {
            Link::Next(next) => {
                self.check_block(next)?;
                next
            }
            Link::EndOfChain => END_OF_CHAIN,
        };
        self.set_next(env, block, next)
    }

    fn next(&mut self, env: &mut MetaEnv<'_>, block: BlockNumber) -> Result<Link> {
        self.check_block(block)?;
        let info = self.leaf(env, block)?;
        match info.state {
            BlockState::Allocated | BlockState::Pending => {}
            other => {
                return Err(XcfsError::corruption(
                    block,
                    format!("chain runs into a block in state {:?}", other),
                ))
            }
        }
        if info.next == END_OF_CHAIN {
            return Ok(Link::EndOfChain);
        }
        if info.next >= self.root.total {
            return Err(XcfsError::corruption(
                block,
                format!("link to block {:#x} outside the volume", info.next),
            ));
        }
        Ok(Link::Next(info.next))
    }

    fn physical_offset(&self, block: BlockNumber) -> Result<u64> {
        self.check_block(block)?;
        Ok(self.backing_offset + self.geometry.data_block(block) as u64 * BLOCK_SIZE as u64)
    }

    fn data_digest(&mut self, env: &mut MetaEnv<'_>, block: BlockNumber) -> Result<Option<Digest>> {
        if !self.verify {
            return Ok(None);
        }
        let index = self.map_node(env, 0, block / FANOUT)?;
        let entry = read_entry(env.cache, index, (block % FANOUT) as usize);
        env.cache.dereference(index)?;
        Ok(Some(entry?.hash))
    }

    fn data_hashable(&self) -> bool {
        true
    }

    fn relocate(
        &mut self,
        env: &mut MetaEnv<'_>,
        prev: Option<BlockNumber>,
        block: BlockNumber,
    ) -> Result<Option<BlockNumber>> {
        // Mapped in both modes: the leaf takes the digest when this block is
        // written back.
        let info = self.leaf(env, block)?;
        if self.geometry.is_single_copy() || info.state != BlockState::Allocated {
            return Ok(None);
        }
        let expected = self.data_digest(env, block)?;
        let physical = self.physical_offset(block)?;
        let old = env
            .cache
            .map_new(&mut *env.io, self, block, ElementKind::Data, physical, expected)?;
        let content = env.cache.data(old).to_vec();

        let extent = self.allocate(env, 1, prev)?;
        let moved = extent.first;
        let next = if info.next == END_OF_CHAIN {
            Link::EndOfChain
        } else {
            Link::Next(info.next)
        };
        self.link(env, moved, next)?;
        self.release_block(env, block)?;
        env.cache.invalidate(block, ElementKind::Data)?;

        let physical = self.physical_offset(moved)?;
        let index = env
            .cache
            .map_empty(&mut *env.io, self, moved, ElementKind::Data, physical)?;
        env.cache.data_mut(index).copy_from_slice(&content);
        env.cache.set_hashable(index, true);
        trace!("relocated committed block {:#x} to {:#x}", block, moved);
        Ok(Some(moved))
    }

    fn stats(&self) -> AllocStats {
        AllocStats {
            total: self.root.total,
            free: self.root.free,
            free_pending: self.root.free_pending,
            hint: self.hint,
            scan_steps: self.scan_steps,
        }
    }
}
