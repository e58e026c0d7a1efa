//! STFS: a hash tree of allocation state over the data blocks, one flat
//! directory table, and a descriptor that names the committed root.
//!
//! # Layout
//! =====================================================================
//! | Descriptor (block 0) | Backing store: hash nodes and data blocks |
//! =====================================================================
//!
//! Changes accumulate in the cache and in shadow copies of the hash nodes.
//! `commit` writes them and then the descriptor; `abort` drops them and
//! returns to the descriptor on the medium.

mod descriptor;

pub use descriptor::{VolumeDescriptor, DESCRIPTOR_SIZE};

use crate::alloc::hash_tree::{RootState, TreeOptions};
use crate::alloc::layout::Geometry;
use crate::alloc::{HashTree, MetaEnv};
use crate::cache::BlockCache;
use crate::config::VolumeConfig;
use crate::dirent::{Attributes, DirectoryEntry, FatTimestamp, StfsRecord};
use crate::error::{Result, XcfsError};
use crate::fcb::{Fcb, FcbFlags, FcbId};
use crate::file_io;
use crate::volume::{FileInfo, Volume, VolumeCore, VolumeStats};
use fileblock::{BlockStorage, BLOCK_SIZE};
use log::{info, warn};
use std::convert::TryFrom;

/// Byte offset of the backing store. Block 0 holds the descriptor.
pub const BACKING_OFFSET: u64 = BLOCK_SIZE as u64;

pub struct StfsVolume<T: BlockStorage> {
    core: VolumeCore<T, HashTree, StfsRecord>,
    table: FcbId,
    descriptor: VolumeDescriptor,
}

fn tree_options(config: &VolumeConfig) -> TreeOptions {
    TreeOptions {
        verify: config.verify_hashes(),
        growable: config.growable(),
        max_blocks: config.max_blocks(),
        hasher: config.hasher(),
    }
}

fn new_cache(config: &VolumeConfig) -> BlockCache {
    let cache = BlockCache::new(config.cache_capacity());
    if config.verify_hashes() {
        cache.with_verifier(config.hasher())
    } else {
        cache
    }
}

fn root_fcb() -> Fcb {
    Fcb::new("", None, Attributes::DIRECTORY, FatTimestamp::default())
}

fn table_fcb() -> Fcb {
    Fcb::new("", None, Attributes::empty(), FatTimestamp::default())
}

/// The descriptor for the committed state of `tree` with `table` as the
/// directory table.
fn describe(tree: &HashTree, table: &Fcb) -> Result<VolumeDescriptor> {
    let root = tree.durable_root();
    if root.free_pending != 0 {
        warn!("{} free-pending blocks survive the commit", root.free_pending);
    }
    let dir_block_count = u16::try_from(table.block_count()).map_err(|_| {
        XcfsError::InvalidState(format!(
            "directory table of {} blocks does not fit the descriptor",
            table.block_count()
        ))
    })?;
    Ok(VolumeDescriptor {
        single_copy: tree.geometry().is_single_copy(),
        root_active: root.active,
        dir_block_count,
        dir_first_block: table.first_block.unwrap_or(0),
        root_hash: root.hash,
        total_blocks: root.total,
        free_blocks: root.free,
    })
}

/// Writes the descriptor after everything it points at is on the medium.
fn persist(io: &mut dyn BlockStorage, descriptor: &VolumeDescriptor) -> Result<()> {
    io.sync_disk()?;
    io.write_at(0, &descriptor.to_block())?;
    io.sync_disk()?;
    Ok(())
}

impl<T: BlockStorage> StfsVolume<T> {
    /// Builds an empty volume of `total_blocks` data blocks with a one-block
    /// directory table. The medium is extended as needed.
    pub fn format(mut io: T, total_blocks: u32, config: VolumeConfig) -> Result<Self> {
        if config.read_only() {
            return Err(XcfsError::ReadOnly);
        }
        let geometry = if config.single_copy() {
            Geometry::single_copy()
        } else {
            Geometry::double_copy()
        };
        let mut cache = new_cache(&config);
        let mut table = table_fcb();
        let mut env = MetaEnv {
            cache: &mut cache,
            io: &mut io,
        };
        let mut tree = HashTree::format(
            &mut env,
            geometry,
            BACKING_OFFSET,
            total_blocks,
            tree_options(&config),
        )?;
        file_io::extend_zeroed(&mut tree, &mut env, &mut table, 1)?;
        tree.commit_dirty_buffers(&mut env)?;
        let descriptor = describe(&tree, &table)?;
        persist(env.io, &descriptor)?;
        info!(
            "formatted STFS volume: {} blocks, {} copies",
            total_blocks,
            geometry.copies()
        );
        Ok(Self::attach(io, cache, tree, config, table, descriptor))
    }

    pub fn mount(mut io: T, config: VolumeConfig) -> Result<Self> {
        let mut block = vec![0; BLOCK_SIZE];
        io.read_at(0, &mut block)?;
        let descriptor = VolumeDescriptor::parse(&block)?;
        let geometry = if descriptor.single_copy {
            Geometry::single_copy()
        } else {
            Geometry::double_copy()
        };
        let root = RootState {
            active: descriptor.root_active,
            hash: descriptor.root_hash,
            total: descriptor.total_blocks,
            free: descriptor.free_blocks,
            free_pending: 0,
        };
        let tree = HashTree::mount(geometry, BACKING_OFFSET, root, tree_options(&config))?;
        let cache = new_cache(&config);
        let mut volume = Self::attach(io, cache, tree, config, table_fcb(), descriptor);
        let table = volume.load_table()?;
        *volume.core.fcbs.get_mut(volume.table)? = table;
        info!(
            "mounted STFS volume: {} of {} blocks free, {} directory blocks",
            descriptor.free_blocks, descriptor.total_blocks, descriptor.dir_block_count
        );
        Ok(volume)
    }

    fn attach(
        io: T,
        cache: BlockCache,
        tree: HashTree,
        config: VolumeConfig,
        table: Fcb,
        descriptor: VolumeDescriptor,
    ) -> Self {
        let mut core = VolumeCore::new(io, cache, tree, config, root_fcb());
        let table = core.install_table(table);
        StfsVolume {
            core,
            table,
            descriptor,
        }
    }

    /// Rebuilds the directory table Fcb from the committed descriptor.
    fn load_table(&mut self) -> Result<Fcb> {
        let descriptor = self.descriptor;
        let mut table = table_fcb();
        if descriptor.dir_block_count > 0 {
            let first = descriptor.dir_first_block;
            let (count, last) = self
                .core
                .measure_chain(first, Some(descriptor.dir_block_count as u32))?;
            table.first_block = Some(first);
            table.last_block = Some(last);
            table.allocation_size = count as u64 * BLOCK_SIZE as u64;
        } else {
            warn!("volume has no directory table");
        }
        table.cover_allocation();
        let slot = self.core.fcbs.get(self.table)?;
        table.flags = slot.flags - FcbFlags::DIRTY;
        table.refs = slot.refs;
        Ok(table)
    }

    /// The descriptor as last written.
    pub fn descriptor(&self) -> &VolumeDescriptor {
        &self.descriptor
    }

    pub fn in_transaction(&self) -> bool {
        self.core.meta.in_transaction()
    }

    /// Makes every change since the last commit durable.
    pub fn commit(&mut self) -> Result<()> {
        self.core.check_writable()?;
        self.core.flush_entries()?;
        {
            let (meta, mut env, _) = self.core.parts();
            meta.commit_dirty_buffers(&mut env)?;
        }
        let descriptor = describe(&self.core.meta, self.core.fcbs.get(self.table)?)?;
        persist(&mut self.core.io, &descriptor)?;
        self.descriptor = descriptor;
        info!(
            "committed STFS volume: {} of {} blocks free",
            descriptor.free_blocks, descriptor.total_blocks
        );
        Ok(())
    }

    /// Drops every change since the last commit. Refused while files are
    /// open, since their Fcbs would describe blocks that no longer exist, and
    /// on a single-copy volume once part of the transaction was written over
    /// committed blocks.
    pub fn abort(&mut self) -> Result<()> {
        let open = self.core.fcbs.user_open_count();
        if open > 0 {
            return Err(XcfsError::InvalidState(format!(
                "cannot abort with {} files open",
                open
            )));
        }
        {
            let (meta, mut env, _) = self.core.parts();
            meta.reset_write_state(&mut env)?;
        }
        let table = self.load_table()?;
        *self.core.fcbs.get_mut(self.table)? = table;
        info!("aborted STFS transaction");
        Ok(())
    }

    /// Recounts the hash tree and checks every counter against its leaves.
    pub fn verify(&mut self) -> Result<()> {
        let (meta, mut env, _) = self.core.parts();
        meta.verify_counters(&mut env)
    }

    /// Commits and hands back the medium.
    pub fn unmount(mut self) -> Result<T> {
        if !self.core.config.read_only() {
            self.commit()?;
        }
        let open = self.core.fcbs.user_open_count();
        if open > 0 {
            warn!("unmounting with {} files still open", open);
        }
        info!("unmounted STFS volume");
        Ok(self.core.io)
    }
}

impl<T: BlockStorage> Volume for StfsVolume<T> {
    fn root(&self) -> FcbId {
        self.core.root
    }

    fn open(&mut self, path: &str) -> Result<FcbId> {
        self.core.open(path)
    }

    fn create_file(
        &mut self,
        parent: FcbId,
        name: &str,
        is_directory: bool,
        initial_size: u64,
    ) -> Result<FcbId> {
        self.core.create_file(parent, name, is_directory, initial_size)
    }

    fn read(&mut self, fcb: FcbId, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.core.read(fcb, offset, len)
    }

    fn write(&mut self, fcb: FcbId, offset: u64, data: &[u8]) -> Result<()> {
        self.core.write(fcb, offset, data)
    }

    fn set_allocation_size(&mut self, fcb: FcbId, size: u64, disable_truncate: bool) -> Result<()> {
        self.core.set_allocation_size(fcb, size, disable_truncate)
    }

    fn set_end_of_file(&mut self, fcb: FcbId, size: u64) -> Result<()> {
        self.core.set_end_of_file(fcb, size)
    }

    fn mark_for_deletion(&mut self, fcb: FcbId) -> Result<()> {
        self.core.mark_for_deletion(fcb)
    }

    fn close(&mut self, fcb: FcbId) -> Result<()> {
        self.core.release(fcb)
    }

    fn read_dir(&mut self, dir: FcbId) -> Result<Vec<DirectoryEntry>> {
        self.core.read_dir(dir)
    }

    fn stat(&self, fcb: FcbId) -> Result<FileInfo> {
        self.core.stat(fcb)
    }

    fn flush(&mut self) -> Result<()> {
        self.commit()
    }

    fn rebuild_descriptor(&self) -> Result<Vec<u8>> {
        Ok(self.descriptor.to_bytes())
    }

    fn stats(&self) -> VolumeStats {
        self.core.stats()
    }
}
