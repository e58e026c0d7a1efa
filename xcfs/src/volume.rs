//! The file API both volume formats share.
//!
//! A `VolumeCore` owns the medium, the cache, the allocation metadata and the
//! table of open Fcbs. Format modules wrap it, supply the record codec and
//! their own mount, format and flush steps, and expose everything through the
//! [`Volume`] trait.

use crate::alloc::{chain_extent, AllocStats, AllocationMetadata, MetaEnv};
use crate::cache::{BlockCache, CacheStats};
use crate::config::VolumeConfig;
use crate::directory::DirectoryIndex;
use crate::dirent::{
    names_equal, validate_name, Attributes, DirectoryEntry, FatTimestamp, RecordCodec,
    RECORD_SIZE,
};
use crate::error::{Result, XcfsError};
use crate::fcb::{Fcb, FcbFlags, FcbId, FcbTable};
use crate::file_io;
use crate::BlockNumber;
use fileblock::{BlockStorage, BLOCK_SIZE};
use log::{debug, trace, warn};
use std::marker::PhantomData;

/// Largest number of records an STFS directory table can index; 0xFFFF is
/// the root's parent marker.
const MAX_TABLE_RECORDS: u64 = 0xFFFF;

/// The file-handle API of a mounted volume.
pub trait Volume {
    /// Handle of the root directory. It stays valid until unmount.
    fn root(&self) -> FcbId;

    /// Opens a path relative to the root. Separators may be `\` or `/`.
    fn open(&mut self, path: &str) -> Result<FcbId>;

    /// Creates a file or directory in `parent` and returns it open.
    fn create_file(
        &mut self,
        parent: FcbId,
        name: &str,
        is_directory: bool,
        initial_size: u64,
    ) -> Result<FcbId>;

    fn read(&mut self, fcb: FcbId, offset: u64, len: usize) -> Result<Vec<u8>>;

    fn write(&mut self, fcb: FcbId, offset: u64, data: &[u8]) -> Result<()>;

    fn set_allocation_size(&mut self, fcb: FcbId, size: u64, disable_truncate: bool)
        -> Result<()>;

    fn set_end_of_file(&mut self, fcb: FcbId, size: u64) -> Result<()>;

    /// The file is removed when its last handle closes.
    fn mark_for_deletion(&mut self, fcb: FcbId) -> Result<()>;

    fn close(&mut self, fcb: FcbId) -> Result<()>;

    fn read_dir(&mut self, dir: FcbId) -> Result<Vec<DirectoryEntry>>;

    fn stat(&self, fcb: FcbId) -> Result<FileInfo>;

    /// Writes every dirty entry, block and table to the medium.
    fn flush(&mut self) -> Result<()>;

    /// The header or descriptor as last written to the medium.
    fn rebuild_descriptor(&self) -> Result<Vec<u8>>;

    fn stats(&self) -> VolumeStats;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub attributes: Attributes,
    pub is_directory: bool,
    pub size: u64,
    pub allocation_size: u64,
    pub valid_size: u64,
    pub first_block: Option<BlockNumber>,
    pub contiguous: bool,
    pub created: FatTimestamp,
    pub written: FatTimestamp,
    pub accessed: FatTimestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeStats {
    pub block_size: u32,
    pub total_blocks: u32,
    pub free_blocks: u32,
    pub free_pending_blocks: u32,
    pub allocated_blocks: u32,
    pub hint: BlockNumber,
    pub scan_steps: u64,
    pub open_files: usize,
    pub cache: CacheStats,
}

impl VolumeStats {
    fn new(alloc: AllocStats, cache: CacheStats, open_files: usize) -> Self {
        VolumeStats {
            block_size: BLOCK_SIZE as u32,
            total_blocks: alloc.total,
            free_blocks: alloc.free,
            free_pending_blocks: alloc.free_pending,
            allocated_blocks: alloc.allocated(),
            hint: alloc.hint,
            scan_steps: alloc.scan_steps,
            open_files,
            cache,
        }
    }
}

/// Where a directory's records live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Namespace {
    /// Every directory owns a stream of records (FATX).
    PerDirectory,
    /// One table stream holds all records, and each record names its parent
    /// by table index (STFS).
    FlatTable { table: FcbId },
}

pub(crate) struct VolumeCore<T, M, C> {
    pub(crate) io: T,
    pub(crate) cache: BlockCache,
    pub(crate) meta: M,
    pub(crate) fcbs: FcbTable,
    pub(crate) root: FcbId,
    pub(crate) config: VolumeConfig,
    pub(crate) namespace: Namespace,
    codec: PhantomData<C>,
}

impl<T, M, C> VolumeCore<T, M, C>
where
    T: BlockStorage,
    M: AllocationMetadata,
    C: RecordCodec,
{
    pub(crate) fn new(io: T, cache: BlockCache, meta: M, config: VolumeConfig, mut root: Fcb) -> Self {
        let mut fcbs = FcbTable::new();
        root.flags |= FcbFlags::ROOT | FcbFlags::DIRECTORY;
        root.refs = 1;
        let root = fcbs.insert(root);
        VolumeCore {
            io,
            cache,
            meta,
            fcbs,
            root,
            config,
            namespace: Namespace::PerDirectory,
            codec: PhantomData,
        }
    }

    /// Switches to a single record table held by `table`.
    pub(crate) fn install_table(&mut self, mut table: Fcb) -> FcbId {
        table.flags |= FcbFlags::DIRECTORY_TABLE;
        table.refs = 1;
        let id = self.fcbs.insert(table);
        self.namespace = Namespace::FlatTable { table: id };
        id
    }

    pub(crate) fn parts(&mut self) -> (&mut M, MetaEnv<'_>, &mut FcbTable) {
        (
            &mut self.meta,
            MetaEnv {
                cache: &mut self.cache,
                io: &mut self.io,
            },
            &mut self.fcbs,
        )
    }

    pub(crate) fn check_writable(&self) -> Result<()> {
        if self.config.read_only() {
            return Err(XcfsError::ReadOnly);
        }
        Ok(())
    }

    /// Measures the chain starting at `first` and checks it against the
    /// count the caller expects, if any.
    pub(crate) fn measure_chain(
        &mut self,
        first: BlockNumber,
        expected: Option<u32>,
    ) -> Result<(u32, BlockNumber)> {
        let (meta, mut env, _) = self.parts();
        let (count, last) = chain_extent(meta, &mut env, first)?;
        match expected {
            Some(expected) if expected != count => Err(XcfsError::corruption(
                first,
                format!("chain holds {} blocks, entry claims {}", count, expected),
            )),
            _ => Ok((count, last)),
        }
    }

    /// The stream holding the records of `dir`, and the parent index those
    /// records carry when the namespace is flat.
    fn scope(&self, dir: FcbId) -> Result<(FcbId, Option<Option<u16>>)> {
        match self.namespace {
            Namespace::PerDirectory => Ok((dir, None)),
            Namespace::FlatTable { table } => {
                let fcb = self.fcbs.get(dir)?;
                if fcb.flags.contains(FcbFlags::ROOT) {
                    return Ok((table, Some(None)));
                }
                let offset = fcb.entry_offset.ok_or_else(|| {
                    XcfsError::InvalidState(format!("{:?} has no directory entry", fcb.name))
                })?;
                Ok((table, Some(Some((offset / RECORD_SIZE as u64) as u16))))
            }
        }
    }

    fn with_directory<R, F>(&mut self, stream: FcbId, f: F) -> Result<R>
    where
        F: FnOnce(&mut DirectoryIndex<'_, '_, M, C>) -> Result<R>,
    {
        let (meta, mut env, fcbs) = self.parts();
        let stream = fcbs.get_mut(stream)?;
        let mut index = DirectoryIndex::<M, C>::new(meta, &mut env, stream);
        f(&mut index)
    }

    fn lookup_entry(&mut self, dir: FcbId, name: &str) -> Result<Option<(u64, DirectoryEntry)>> {
        let (stream, scope) = self.scope(dir)?;
        self.with_directory(stream, |index| {
            index.lookup(|entry| {
                names_equal(&entry.name, name) && scope.map_or(true, |p| entry.parent == p)
            })
        })
    }

    pub(crate) fn open(&mut self, path: &str) -> Result<FcbId> {
        let mut current = self.root;
        self.fcbs.get_mut(current)?.refs += 1;
        for name in path.split(|c| c == '\\' || c == '/').filter(|c| !c.is_empty()) {
            let next = self.acquire_child(current, name);
            self.release(current)?;
            current = next?;
        }
        trace!("opened {:?}", path);
        Ok(current)
    }

    /// Returns a referenced Fcb for `name` in `parent`, sharing an open one
    /// when it exists.
    fn acquire_child(&mut self, parent: FcbId, name: &str) -> Result<FcbId> {
        let dir = self.fcbs.get(parent)?;
        if !dir.is_directory() {
            return Err(XcfsError::NotADirectory);
        }
        if let Some(id) = self.fcbs.find_child(parent, name) {
            let fcb = self.fcbs.get_mut(id)?;
            if fcb.flags.contains(FcbFlags::DELETE_PENDING) {
                return Err(XcfsError::NotFound);
            }
            fcb.refs += 1;
            return Ok(id);
        }
        validate_name(name, C::MAX_NAME)?;
        let (offset, entry) = self
            .lookup_entry(parent, name)?
            .ok_or(XcfsError::NotFound)?;

        let (blocks, last) = match entry.first_block {
            None => (0, None),
            Some(first) if entry.contiguous && entry.allocated_blocks > 0 => (
                entry.allocated_blocks,
                Some(first + entry.allocated_blocks - 1),
            ),
            Some(first) => {
                let expected = Some(entry.allocated_blocks).filter(|&n| n > 0);
                let (count, last) = self.measure_chain(first, expected)?;
                (count, Some(last))
            }
        };
        let mut fcb = Fcb::from_entry(&entry, parent, offset, blocks, last);
        if fcb.is_directory() {
            fcb.cover_allocation();
        } else if fcb.file_size as u64 > fcb.allocation_size {
            return Err(XcfsError::corruption(
                entry.first_block.unwrap_or(0),
                format!(
                    "{:?} is {} bytes but holds {} blocks",
                    entry.name, entry.size, blocks
                ),
            ));
        }
        fcb.refs = 1;
        let id = self.fcbs.insert(fcb);
        self.fcbs.get_mut(parent)?.refs += 1;
        debug!("loaded {:?}: {} blocks", name, blocks);
        Ok(id)
    }

    pub(crate) fn create_file(
        &mut self,
        parent: FcbId,
        name: &str,
        is_directory: bool,
        initial_size: u64,
    ) -> Result<FcbId> {
        self.check_writable()?;
        validate_name(name, C::MAX_NAME)?;
        let dir = self.fcbs.get(parent)?;
        if !dir.is_directory() {
            return Err(XcfsError::NotADirectory);
        }
        if dir.flags.contains(FcbFlags::DELETE_PENDING) {
            return Err(XcfsError::NotFound);
        }
        if self.fcbs.find_child(parent, name).is_some() || self.lookup_entry(parent, name)?.is_some() {
            return Err(XcfsError::AlreadyExists);
        }

        let (stream, _) = self.scope(parent)?;
        let offset = self.reserve_record(stream)?;
        let attributes = if is_directory {
            Attributes::DIRECTORY
        } else {
            Attributes::empty()
        };
        let mut fcb = Fcb::new(name, Some(parent), attributes, FatTimestamp::now());
        fcb.entry_offset = Some(offset);
        fcb.refs = 1;
        fcb.flags |= FcbFlags::DIRTY;
        let id = self.fcbs.insert(fcb);
        self.fcbs.get_mut(parent)?.refs += 1;

        if let Err(err) = self.populate(id, is_directory, initial_size) {
            self.discard(id);
            return Err(err);
        }
        debug!("created {:?} at record {:#x}", name, offset);
        Ok(id)
    }

    /// Gives a new file its first blocks and writes its entry.
    fn populate(&mut self, id: FcbId, is_directory: bool, initial_size: u64) -> Result<()> {
        let per_directory = self.namespace == Namespace::PerDirectory;
        let (meta, mut env, fcbs) = self.parts();
        let fcb = fcbs.get_mut(id)?;
        if is_directory && per_directory {
            file_io::extend_zeroed(meta, &mut env, fcb, 1)?;
        } else if !is_directory && initial_size > 0 {
            file_io::set_allocation_size(meta, &mut env, fcb, initial_size, false)?;
        }
        self.write_entry(id)
    }

    /// Drops a file whose creation failed part way.
    fn discard(&mut self, id: FcbId) {
        let (meta, mut env, fcbs) = self.parts();
        let fcb = match fcbs.remove(id) {
            Ok(fcb) => fcb,
            Err(_) => return,
        };
        if let Some(first) = fcb.first_block {
            if let Err(err) = meta.free(&mut env, first, false) {
                warn!("could not release blocks of {:?}: {}", fcb.name, err);
            }
        }
        if let Some(parent) = fcb.parent {
            if let Ok(parent) = self.fcbs.get_mut(parent) {
                parent.refs -= 1;
            }
        }
    }

    /// Offset of a free record in `stream`, growing the stream by a zeroed
    /// block when it is full.
    fn reserve_record(&mut self, stream: FcbId) -> Result<u64> {
        if let Some(offset) = self.with_directory(stream, |index| index.find_first_free())? {
            return Ok(offset);
        }
        let flat = self.namespace != Namespace::PerDirectory;
        let (meta, mut env, fcbs) = self.parts();
        let fcb = fcbs.get_mut(stream)?;
        let offset = fcb.allocation_size;
        if flat && offset / RECORD_SIZE as u64 >= MAX_TABLE_RECORDS {
            return Err(XcfsError::DiskFull);
        }
        file_io::extend_zeroed(meta, &mut env, fcb, 1)?;
        fcb.flags |= FcbFlags::DIRTY;
        debug!("directory stream {:?} grew to {} blocks", fcb.name, fcb.block_count());
        Ok(offset)
    }

    fn entry_for(&self, fcb: &Fcb, parent: Option<u16>) -> DirectoryEntry {
        DirectoryEntry {
            name: fcb.name.clone(),
            attributes: fcb.attributes,
            first_block: fcb.first_block,
            size: if fcb.is_directory() { 0 } else { fcb.file_size },
            created: fcb.created,
            written: fcb.written,
            accessed: fcb.accessed,
            parent,
            contiguous: fcb.flags.contains(FcbFlags::CONTIGUOUS),
            allocated_blocks: fcb.block_count(),
        }
    }

    fn write_entry(&mut self, id: FcbId) -> Result<()> {
        let fcb = self.fcbs.get(id)?;
        if fcb.is_internal() {
            return Ok(());
        }
        let missing = || XcfsError::InvalidState(format!("{:?} has no directory entry", fcb.name));
        let offset = fcb.entry_offset.ok_or_else(missing)?;
        let parent = fcb.parent.ok_or_else(missing)?;
        let (stream, scope) = self.scope(parent)?;
        let entry = self.entry_for(fcb, scope.flatten());
        self.with_directory(stream, |index| index.write(offset, &entry))?;
        self.fcbs.get_mut(id)?.flags.remove(FcbFlags::DIRTY);
        Ok(())
    }

    /// Writes the entries of every open file that changed.
    pub(crate) fn flush_entries(&mut self) -> Result<()> {
        for id in self.fcbs.ids() {
            let flags = self.fcbs.get(id)?.flags;
            if flags.contains(FcbFlags::DIRTY) && !flags.contains(FcbFlags::DELETE_PENDING) {
                self.write_entry(id)?;
            }
        }
        Ok(())
    }

    pub(crate) fn flush_cache(&mut self) -> Result<()> {
        let (meta, env, _) = self.parts();
        env.cache.flush_all(env.io, meta)
    }

    fn require_file(&mut self, id: FcbId) -> Result<()> {
        if self.fcbs.get(id)?.is_directory() {
            return Err(XcfsError::IsADirectory);
        }
        Ok(())
    }

    pub(crate) fn read(&mut self, id: FcbId, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.require_file(id)?;
        let (meta, mut env, fcbs) = self.parts();
        let fcb = fcbs.get_mut(id)?;
        let len = (len as u64).min((fcb.file_size as u64).saturating_sub(offset)) as usize;
        let mut buf = vec![0; len];
        let got = file_io::read(meta, &mut env, fcb, offset, &mut buf)?;
        buf.truncate(got);
        Ok(buf)
    }

    pub(crate) fn write(&mut self, id: FcbId, offset: u64, data: &[u8]) -> Result<()> {
        self.check_writable()?;
        self.require_file(id)?;
        let (meta, mut env, fcbs) = self.parts();
        file_io::write(meta, &mut env, fcbs.get_mut(id)?, offset, data)
    }

    pub(crate) fn set_allocation_size(
        &mut self,
        id: FcbId,
        size: u64,
        disable_truncate: bool,
    ) -> Result<()> {
        self.check_writable()?;
        self.require_file(id)?;
        let (meta, mut env, fcbs) = self.parts();
        file_io::set_allocation_size(meta, &mut env, fcbs.get_mut(id)?, size, disable_truncate)
    }

    pub(crate) fn set_end_of_file(&mut self, id: FcbId, size: u64) -> Result<()> {
        self.check_writable()?;
        self.require_file(id)?;
        let (meta, mut env, fcbs) = self.parts();
        file_io::set_end_of_file(meta, &mut env, fcbs.get_mut(id)?, size)
    }

    pub(crate) fn mark_for_deletion(&mut self, id: FcbId) -> Result<()> {
        self.check_writable()?;
        let fcb = self.fcbs.get(id)?;
        if fcb.is_internal() {
            return Err(XcfsError::InvalidArgument(
                "the root directory cannot be deleted".to_string(),
            ));
        }
        if fcb.is_directory() && !self.is_empty_directory(id)? {
            return Err(XcfsError::DirectoryNotEmpty);
        }
        self.fcbs.get_mut(id)?.flags |= FcbFlags::DELETE_PENDING;
        Ok(())
    }

    fn is_empty_directory(&mut self, dir: FcbId) -> Result<bool> {
        if self.fcbs.iter().any(|(_, fcb)| fcb.parent == Some(dir)) {
            return Ok(false);
        }
        let (stream, scope) = self.scope(dir)?;
        let child = self.with_directory(stream, |index| {
            index.lookup(|entry| scope.map_or(true, |p| entry.parent == p))
        })?;
        Ok(child.is_none())
    }

    /// Drops one reference. The last release finalizes the Fcb and releases
    /// its parent in turn.
    pub(crate) fn release(&mut self, id: FcbId) -> Result<()> {
        let mut current = id;
        loop {
            let fcb = self.fcbs.get_mut(current)?;
            if fcb.refs == 0 {
                return Err(XcfsError::InvalidState(format!(
                    "{:?} is not open",
                    fcb.name
                )));
            }
            fcb.refs -= 1;
            if fcb.refs > 0 || fcb.is_internal() {
                return Ok(());
            }
            match self.finalize(current)? {
                Some(parent) => current = parent,
                None => return Ok(()),
            }
        }
    }

    fn finalize(&mut self, id: FcbId) -> Result<Option<FcbId>> {
        let fcb = self.fcbs.get(id)?;
        if fcb.flags.contains(FcbFlags::DELETE_PENDING) {
            let first = fcb.first_block;
            let offset = fcb.entry_offset;
            let parent = fcb.parent;
            if let Some(first) = first {
                let (meta, mut env, _) = self.parts();
                meta.free(&mut env, first, false)?;
            }
            if let (Some(offset), Some(parent)) = (offset, parent) {
                let (stream, _) = self.scope(parent)?;
                self.with_directory(stream, |index| index.mark_deleted(offset))?;
            }
        } else if fcb.flags.contains(FcbFlags::DIRTY) {
            self.write_entry(id)?;
        }
        let fcb = self.fcbs.remove(id)?;
        trace!("finalized {:?}", fcb.name);
        Ok(fcb.parent)
    }

    pub(crate) fn read_dir(&mut self, dir: FcbId) -> Result<Vec<DirectoryEntry>> {
        if !self.fcbs.get(dir)?.is_directory() {
            return Err(XcfsError::NotADirectory);
        }
        let (stream, scope) = self.scope(dir)?;
        let entries = self.with_directory(stream, |index| index.entries())?;
        let mut listing = Vec::with_capacity(entries.len());
        for (_, entry) in entries {
            if !scope.map_or(true, |p| entry.parent == p) {
                continue;
            }
            // Open files may be ahead of their records.
            match self.fcbs.find_child(dir, &entry.name) {
                Some(child) => {
                    let child = self.fcbs.get(child)?;
                    if !child.flags.contains(FcbFlags::DELETE_PENDING) {
                        listing.push(self.entry_for(child, entry.parent));
                    }
                }
                None => listing.push(entry),
            }
        }
        Ok(listing)
    }

    pub(crate) fn stat(&self, id: FcbId) -> Result<FileInfo> {
        let fcb = self.fcbs.get(id)?;
        Ok(FileInfo {
            name: fcb.name.clone(),
            attributes: fcb.attributes,
            is_directory: fcb.is_directory(),
            size: fcb.file_size as u64,
            allocation_size: fcb.allocation_size,
            valid_size: fcb.valid_size as u64,
            first_block: fcb.first_block,
            contiguous: fcb.flags.contains(FcbFlags::CONTIGUOUS),
            created: fcb.created,
            written: fcb.written,
            accessed: fcb.accessed,
        })
    }

    pub(crate) fn stats(&self) -> VolumeStats {
        VolumeStats::new(
            self.meta.stats(),
            self.cache.stats(),
            self.fcbs.user_open_count(),
        )
    }
}
