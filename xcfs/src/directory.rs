//! Scanning and editing the 64-byte records of a directory stream.

use crate::alloc::{AllocationMetadata, MetaEnv};
use crate::dirent::{DirectoryEntry, RecordCodec, Slot, RECORD_SIZE};
use crate::error::{Result, XcfsError};
use crate::fcb::Fcb;
use crate::file_io;
use log::trace;
use std::marker::PhantomData;

const RECORD: u64 = RECORD_SIZE as u64;

/// A directory stream opened for record access. `C` is the record encoding
/// of the volume.
pub struct DirectoryIndex<'a, 'e, M, C> {
    meta: &'a mut M,
    env: &'a mut MetaEnv<'e>,
    stream: &'a mut Fcb,
    codec: PhantomData<C>,
}

impl<'a, 'e, M: AllocationMetadata, C: RecordCodec> DirectoryIndex<'a, 'e, M, C> {
    pub fn new(meta: &'a mut M, env: &'a mut MetaEnv<'e>, stream: &'a mut Fcb) -> Self {
        DirectoryIndex {
            meta,
            env,
            stream,
            codec: PhantomData,
        }
    }

    fn capacity(&self) -> u64 {
        self.stream.allocation_size / RECORD
    }

    fn read_raw(&mut self, offset: u64) -> Result<[u8; RECORD_SIZE]> {
        let mut raw = [0; RECORD_SIZE];
        let got = file_io::read(self.meta, self.env, self.stream, offset, &mut raw)?;
        if got != RECORD_SIZE {
            return Err(XcfsError::corruption(
                self.stream.first_block.unwrap_or(0),
                format!("directory record at {:#x} is cut short", offset),
            ));
        }
        Ok(raw)
    }

    fn decode(&mut self, offset: u64) -> Result<Slot> {
        let raw = self.read_raw(offset)?;
        C::decode(&raw, self.stream.first_block.unwrap_or(0))
    }

    /// Visits records in order until `visit` returns false or the listing
    /// ends.
    fn scan<F>(&mut self, mut visit: F) -> Result<()>
    where
        F: FnMut(u64, Slot) -> bool,
    {
        for slot in 0..self.capacity() {
            let offset = slot * RECORD;
            let record = self.decode(offset)?;
            let end = record == Slot::End;
            if !visit(offset, record) || end {
                break;
            }
        }
        Ok(())
    }

    /// First live entry matching `pred`, with its byte offset.
    pub fn lookup<P>(&mut self, mut pred: P) -> Result<Option<(u64, DirectoryEntry)>>
    where
        P: FnMut(&DirectoryEntry) -> bool,
    {
        let mut found = None;
        self.scan(|offset, slot| match slot {
            Slot::Entry(entry) if pred(&entry) => {
                found = Some((offset, entry));
                false
            }
            _ => true,
        })?;
        Ok(found)
    }

    pub fn entries(&mut self) -> Result<Vec<(u64, DirectoryEntry)>> {
        let mut entries = Vec::new();
        self.scan(|offset, slot| {
            if let Slot::Entry(entry) = slot {
                entries.push((offset, entry));
            }
            true
        })?;
        Ok(entries)
    }

    /// Offset of the first deleted or end-of-listing record, if the stream
    /// has one.
    pub fn find_first_free(&mut self) -> Result<Option<u64>> {
        let mut free = None;
        self.scan(|offset, slot| match slot {
            Slot::End | Slot::Deleted => {
                free = Some(offset);
                false
            }
            Slot::Entry(_) => true,
        })?;
        Ok(free)
    }

    pub fn write(&mut self, offset: u64, entry: &DirectoryEntry) -> Result<()> {
        if offset % RECORD != 0 || offset >= self.stream.allocation_size {
            return Err(XcfsError::InvalidArgument(format!(
                "no directory record at {:#x}",
                offset
            )));
        }
        let mut raw = [0; RECORD_SIZE];
        C::encode(entry, &mut raw)?;
        trace!("writing entry {:?} at {:#x}", entry.name, offset);
        file_io::write(self.meta, self.env, self.stream, offset, &raw)
    }

    /// Tombstones the record at `offset`. A record that is already deleted
    /// is left untouched and reported with `false`.
    pub fn mark_deleted(&mut self, offset: u64) -> Result<bool> {
        let mut raw = self.read_raw(offset)?;
        if !C::tombstone(&mut raw) {
            return Ok(false);
        }
        trace!("deleted record at {:#x}", offset);
        file_io::write(self.meta, self.env, self.stream, offset, &raw)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::chain::ChainGeometry;
    use crate::alloc::ChainTable;
    use crate::cache::BlockCache;
    use crate::dirent::{Attributes, FatTimestamp, FatxRecord, StfsRecord};
    use fileblock::{MemoryBlockStorage, BLOCK_SIZE};

    const MIB: u64 = 1024 * 1024;

    struct Fixture {
        io: MemoryBlockStorage,
        cache: BlockCache,
        table: ChainTable,
        stream: Fcb,
    }

    impl Fixture {
        fn new() -> Self {
            let mut fx = Fixture {
                io: MemoryBlockStorage::new(MIB as usize / BLOCK_SIZE),
                cache: BlockCache::new(8),
                table: ChainTable::format(ChainGeometry::for_length(MIB).unwrap()),
                stream: Fcb::new("dir", None, Attributes::DIRECTORY, FatTimestamp::default()),
            };
            let mut env = MetaEnv {
                cache: &mut fx.cache,
                io: &mut fx.io,
            };
            file_io::extend_zeroed(&mut fx.table, &mut env, &mut fx.stream, 1).unwrap();
            fx
        }
    }

    fn entry(name: &str) -> DirectoryEntry {
        DirectoryEntry::new(name, Attributes::ARCHIVE, FatTimestamp(0x5000_0000))
    }

    #[test]
    fn insert_lookup_and_delete() {
        let mut fx = Fixture::new();
        let mut env = MetaEnv {
            cache: &mut fx.cache,
            io: &mut fx.io,
        };
        let mut dir = DirectoryIndex::<_, FatxRecord>::new(&mut fx.table, &mut env, &mut fx.stream);
        assert_eq!(dir.find_first_free().unwrap(), Some(0));
        dir.write(0, &entry("one")).unwrap();
        dir.write(64, &entry("two")).unwrap();
        assert_eq!(dir.find_first_free().unwrap(), Some(128));

        let (offset, found) = dir
            .lookup(|e| e.name.eq_ignore_ascii_case("TWO"))
            .unwrap()
            .unwrap();
        assert_eq!((offset, found.name.as_str()), (64, "two"));

        assert!(dir.mark_deleted(0).unwrap());
        assert!(!dir.mark_deleted(0).unwrap());
        assert_eq!(dir.find_first_free().unwrap(), Some(0));
        let names: Vec<String> = dir.entries().unwrap().into_iter().map(|(_, e)| e.name).collect();
        assert_eq!(names, vec!["two".to_string()]);
    }

    #[test]
    fn full_stream_has_no_free_record() {
        let mut fx = Fixture::new();
        let mut env = MetaEnv {
            cache: &mut fx.cache,
            io: &mut fx.io,
        };
        let mut dir = DirectoryIndex::<_, StfsRecord>::new(&mut fx.table, &mut env, &mut fx.stream);
        for n in 0..(BLOCK_SIZE / RECORD_SIZE) as u64 {
            dir.write(n * RECORD, &entry(&format!("f{}", n))).unwrap();
        }
        assert_eq!(dir.find_first_free().unwrap(), None);
        assert_eq!(dir.entries().unwrap().len(), 64);
        assert!(dir.write(BLOCK_SIZE as u64, &entry("over")).is_err());
    }

    #[test]
    fn oversized_name_length_is_corruption() {
        let mut fx = Fixture::new();
        let mut env = MetaEnv {
            cache: &mut fx.cache,
            io: &mut fx.io,
        };
        let mut raw = [0u8; RECORD_SIZE];
        raw[0] = 50;
        file_io::write(&mut fx.table, &mut env, &mut fx.stream, 0, &raw).unwrap();
        let mut dir = DirectoryIndex::<_, FatxRecord>::new(&mut fx.table, &mut env, &mut fx.stream);
        assert!(matches!(
            dir.entries(),
            Err(XcfsError::Corruption { .. })
        ));
    }
}
