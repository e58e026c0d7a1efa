//! FATX: cluster chains in a big-endian allocation table, one record stream
//! per directory.
//!
//! # Layout
//! ==========================================================================
//! | Header (block 0) | Chain table (0x1000, block aligned) | Clusters 1..n |
//! ==========================================================================
//!
//! Cluster 1 holds the root directory.

mod header;

pub use header::{VolumeHeader, MAGIC, ROOT_CLUSTER, SECTORS_PER_CLUSTER};

use crate::alloc::chain::ChainGeometry;
use crate::alloc::{chain_extent, AllocationMetadata, ChainTable, MetaEnv};
use crate::cache::BlockCache;
use crate::config::VolumeConfig;
use crate::dirent::{Attributes, DirectoryEntry, FatTimestamp, FatxRecord};
use crate::error::{Result, XcfsError};
use crate::fcb::{Fcb, FcbId};
use crate::volume::{FileInfo, Volume, VolumeCore, VolumeStats};
use fileblock::{BlockStorage, BLOCK_SIZE};
use log::{info, warn};

pub struct FatxVolume<T: BlockStorage> {
    core: VolumeCore<T, ChainTable, FatxRecord>,
    header: VolumeHeader,
}

impl<T: BlockStorage> FatxVolume<T> {
    /// Writes an empty volume over the whole medium.
    pub fn format(mut io: T, config: VolumeConfig) -> Result<Self> {
        if config.read_only() {
            return Err(XcfsError::ReadOnly);
        }
        let geometry = ChainGeometry::for_length(io.len())?;
        let header = VolumeHeader::new(FatTimestamp::now().0);
        io.write_at(0, &header.serialize())?;
        io.write_at(geometry.cluster_offset(ROOT_CLUSTER), &[0; BLOCK_SIZE])?;
        let mut cache = BlockCache::new(config.cache_capacity());
        let mut table = ChainTable::format(geometry);
        {
            let mut env = MetaEnv {
                cache: &mut cache,
                io: &mut io,
            };
            table.create_blank_pages(&mut env)?;
            env.cache.flush_all(env.io, &mut table)?;
        }
        io.sync_disk()?;
        info!(
            "formatted FATX volume {:#010x}: {} clusters",
            header.serial, geometry.clusters
        );
        Self::attach(io, cache, config, header, table)
    }

    pub fn mount(mut io: T, config: VolumeConfig) -> Result<Self> {
        let mut block = vec![0; BLOCK_SIZE];
        io.read_at(0, &mut block)?;
        let header = VolumeHeader::parse(&block)?;
        let geometry = ChainGeometry::for_length(io.len())?;
        let mut cache = BlockCache::new(config.cache_capacity());
        let table = ChainTable::load(
            &mut MetaEnv {
                cache: &mut cache,
                io: &mut io,
            },
            geometry,
        )?;
        info!(
            "mounted FATX volume {:#010x}: {} of {} clusters free",
            header.serial,
            table.stats().free,
            geometry.clusters
        );
        Self::attach(io, cache, config, header, table)
    }

    fn attach(
        mut io: T,
        mut cache: BlockCache,
        config: VolumeConfig,
        header: VolumeHeader,
        mut table: ChainTable,
    ) -> Result<Self> {
        let (clusters, last) = chain_extent(
            &mut table,
            &mut MetaEnv {
                cache: &mut cache,
                io: &mut io,
            },
            header.root_cluster,
        )?;
        let mut root = Fcb::new("", None, Attributes::DIRECTORY, FatTimestamp::default());
        root.first_block = Some(header.root_cluster);
        root.last_block = Some(last);
        root.allocation_size = clusters as u64 * BLOCK_SIZE as u64;
        root.cover_allocation();
        Ok(FatxVolume {
            core: VolumeCore::new(io, cache, table, config, root),
            header,
        })
    }

    pub fn header(&self) -> &VolumeHeader {
        &self.header
    }

    /// Recounts free clusters and compares them with the running counter.
    pub fn verify(&mut self) -> Result<()> {
        let (meta, mut env, _) = self.core.parts();
        let counted = meta.count_free(&mut env)?;
        let tracked = meta.stats().free;
        if counted != tracked {
            warn!("free counter {} disagrees with table {}", tracked, counted);
            return Err(XcfsError::corruption(
                0,
                format!("{} clusters tracked free, {} in the table", tracked, counted),
            ));
        }
        Ok(())
    }

    /// Flushes everything and hands back the medium.
    pub fn unmount(mut self) -> Result<T> {
        if !self.core.config.read_only() {
            self.flush()?;
        }
        let open = self.core.fcbs.user_open_count();
        if open > 0 {
            warn!("unmounting with {} files still open", open);
        }
        info!("unmounted FATX volume {:#010x}", self.header.serial);
        Ok(self.core.io)
    }
}

impl<T: BlockStorage> Volume for FatxVolume<T> {
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
        self.core.check_writable()?;
        self.core.flush_entries()?;
        self.core.flush_cache()?;
        self.core.io.sync_disk()?;
        Ok(())
    }

    fn rebuild_descriptor(&self) -> Result<Vec<u8>> {
        Ok(self.header.serialize())
    }

    fn stats(&self) -> VolumeStats {
        self.core.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fileblock::MemoryBlockStorage;

    const MIB: usize = 1024 * 1024;

    fn volume() -> FatxVolume<MemoryBlockStorage> {
        FatxVolume::format(
            MemoryBlockStorage::new(MIB / BLOCK_SIZE),
            VolumeConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn fresh_volume_has_an_empty_root() {
        let mut vol = volume();
        let root = vol.root();
        assert!(vol.read_dir(root).unwrap().is_empty());
        let info = vol.stat(root).unwrap();
        assert!(info.is_directory);
        assert_eq!(info.first_block, Some(ROOT_CLUSTER));
        assert_eq!(info.allocation_size, BLOCK_SIZE as u64);
        assert_eq!(vol.stats().free_blocks, vol.stats().total_blocks - 1);
        vol.verify().unwrap();
    }

    #[test]
    fn create_open_and_list() {
        let mut vol = volume();
        let root = vol.root();
        let dir = vol.create_file(root, "Content", true, 0).unwrap();
        let file = vol.create_file(dir, "save.bin", false, 0).unwrap();
        vol.write(file, 0, b"hello").unwrap();
        vol.close(file).unwrap();
        vol.close(dir).unwrap();

        let file = vol.open("\\content\\SAVE.BIN").unwrap();
        assert_eq!(vol.read(file, 0, 100).unwrap(), b"hello".to_vec());
        vol.close(file).unwrap();

        let dir = vol.open("Content").unwrap();
        let names: Vec<String> = vol.read_dir(dir).unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["save.bin".to_string()]);
        vol.close(dir).unwrap();
        assert_eq!(vol.stats().open_files, 0);
    }

    #[test]
    fn names_must_be_unique_and_valid() {
        let mut vol = volume();
        let root = vol.root();
        let file = vol.create_file(root, "a", false, 0).unwrap();
        assert!(matches!(
            vol.create_file(root, "A", false, 0),
            Err(XcfsError::AlreadyExists)
        ));
        assert!(matches!(
            vol.create_file(root, "a:b", false, 0),
            Err(XcfsError::InvalidName(_))
        ));
        assert!(matches!(
            vol.create_file(file, "child", false, 0),
            Err(XcfsError::NotADirectory)
        ));
        assert!(matches!(vol.open("missing"), Err(XcfsError::NotFound)));
    }

    #[test]
    fn directories_reject_file_operations() {
        let mut vol = volume();
        let root = vol.root();
        let dir = vol.create_file(root, "d", true, 0).unwrap();
        assert!(matches!(vol.write(dir, 0, b"x"), Err(XcfsError::IsADirectory)));
        assert!(matches!(vol.read(dir, 0, 1), Err(XcfsError::IsADirectory)));
    }

    #[test]
    fn delete_happens_on_last_close() {
        let mut vol = volume();
        let root = vol.root();
        let free = vol.stats().free_blocks;
        let file = vol.create_file(root, "gone", false, 3 * BLOCK_SIZE as u64).unwrap();
        assert_eq!(vol.stats().free_blocks, free - 3);
        let again = vol.open("gone").unwrap();
        assert_eq!(again, file);

        vol.mark_for_deletion(file).unwrap();
        vol.mark_for_deletion(file).unwrap();
        vol.close(file).unwrap();
        assert!(matches!(vol.open("gone"), Err(XcfsError::NotFound)));
        vol.close(again).unwrap();
        assert_eq!(vol.stats().free_blocks, free);
        assert!(vol.read_dir(root).unwrap().is_empty());
        assert!(matches!(vol.open("gone"), Err(XcfsError::NotFound)));
    }

    #[test]
    fn non_empty_directory_cannot_be_deleted() {
        let mut vol = volume();
        let root = vol.root();
        let dir = vol.create_file(root, "d", true, 0).unwrap();
        let file = vol.create_file(dir, "f", false, 0).unwrap();
        vol.close(file).unwrap();
        assert!(matches!(
            vol.mark_for_deletion(dir),
            Err(XcfsError::DirectoryNotEmpty)
        ));
        assert!(matches!(
            vol.mark_for_deletion(root),
            Err(XcfsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn root_directory_grows_past_one_cluster() {
        let mut vol = volume();
        let root = vol.root();
        for n in 0..70 {
            let file = vol.create_file(root, &format!("file{:02}", n), false, 0).unwrap();
            vol.close(file).unwrap();
        }
        assert_eq!(vol.stat(root).unwrap().allocation_size, 2 * BLOCK_SIZE as u64);
        assert_eq!(vol.read_dir(root).unwrap().len(), 70);
        let file = vol.open("file69").unwrap();
        vol.close(file).unwrap();
    }

    #[test]
    fn read_only_mount_refuses_writes() {
        let vol = volume();
        let io = vol.unmount().unwrap();
        let config = VolumeConfig::builder().read_only(true).build().unwrap();
        let mut vol = FatxVolume::mount(io, config).unwrap();
        let root = vol.root();
        assert!(matches!(
            vol.create_file(root, "x", false, 0),
            Err(XcfsError::ReadOnly)
        ));
    }

    #[test]
    fn blank_medium_does_not_mount() {
        let io = MemoryBlockStorage::new(MIB / BLOCK_SIZE);
        assert!(matches!(
            FatxVolume::mount(io, VolumeConfig::default()),
            Err(XcfsError::Corruption { block: 0, .. })
        ));
    }
}
