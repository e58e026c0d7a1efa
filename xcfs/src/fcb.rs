//! File control blocks: the in-memory state of every open file and of the
//! directories above it.

use crate::dirent::{names_equal, Attributes, DirectoryEntry, FatTimestamp};
use crate::error::{Result, XcfsError};
use crate::translate::{Anchor, OffsetTranslator};
use crate::BlockNumber;
use bitflags::bitflags;
use fileblock::BLOCK_SIZE;

/// Handle to an Fcb. A handle outlives its Fcb only as a stale value: the
/// generation no longer matches and every access fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FcbId {
    index: u32,
    generation: u32,
}

bitflags! {
    #[derive(Default)]
    pub struct FcbFlags: u16 {
        /// The directory entry is out of date.
        const DIRTY = 0x01;
        const DELETE_PENDING = 0x02;
        const CONTIGUOUS = 0x04;
        const DIRECTORY = 0x08;
        const ROOT = 0x10;
        /// The STFS directory table stream.
        const DIRECTORY_TABLE = 0x20;
    }
}

#[derive(Debug, Clone)]
pub struct Fcb {
    pub parent: Option<FcbId>,
    pub name: String,
    pub attributes: Attributes,
    pub first_block: Option<BlockNumber>,
    pub last_block: Option<BlockNumber>,
    pub file_size: u32,
    /// Always a whole number of blocks.
    pub allocation_size: u64,
    /// Bytes below this offset have been written; reads past it see zeros.
    pub valid_size: u32,
    pub refs: u32,
    pub flags: FcbFlags,
    /// Byte offset of the entry in the directory stream that holds it.
    pub entry_offset: Option<u64>,
    pub created: FatTimestamp,
    pub written: FatTimestamp,
    pub accessed: FatTimestamp,
    pub translator: OffsetTranslator,
}

impl Fcb {
    pub fn new(name: &str, parent: Option<FcbId>, attributes: Attributes, stamp: FatTimestamp) -> Self {
        let mut flags = FcbFlags::empty();
        if attributes.contains(Attributes::DIRECTORY) {
            flags |= FcbFlags::DIRECTORY;
        }
        Fcb {
            parent,
            name: name.to_string(),
            attributes,
            first_block: None,
            last_block: None,
            file_size: 0,
            allocation_size: 0,
            valid_size: 0,
            refs: 0,
            flags,
            entry_offset: None,
            created: stamp,
            written: stamp,
            accessed: stamp,
            translator: OffsetTranslator::new(),
        }
    }

    /// Builds the Fcb for a directory entry whose chain has already been
    /// measured.
    pub fn from_entry(
        entry: &DirectoryEntry,
        parent: FcbId,
        entry_offset: u64,
        blocks: u32,
        last_block: Option<BlockNumber>,
    ) -> Self {
        let mut fcb = Fcb::new(&entry.name, Some(parent), entry.attributes, entry.written);
        fcb.created = entry.created;
        fcb.accessed = entry.accessed;
        fcb.first_block = entry.first_block;
        fcb.last_block = last_block;
        fcb.allocation_size = blocks as u64 * BLOCK_SIZE as u64;
        fcb.file_size = entry.size;
        fcb.valid_size = entry.size;
        fcb.entry_offset = Some(entry_offset);
        if entry.contiguous {
            fcb.flags |= FcbFlags::CONTIGUOUS;
        }
        fcb
    }

    pub fn is_directory(&self) -> bool {
        self.flags.contains(FcbFlags::DIRECTORY)
    }

    pub fn is_internal(&self) -> bool {
        self.flags
            .intersects(FcbFlags::ROOT | FcbFlags::DIRECTORY_TABLE)
    }

    pub fn block_count(&self) -> u32 {
        (self.allocation_size / BLOCK_SIZE as u64) as u32
    }

    pub fn anchor(&self) -> Option<Anchor> {
        match (self.first_block, self.last_block) {
            (Some(first), Some(last)) => Some(Anchor {
                first,
                last,
                block_count: self.block_count(),
            }),
            _ => None,
        }
    }

    /// Directory streams expose their whole allocation as content.
    pub fn cover_allocation(&mut self) {
        self.file_size = self.allocation_size as u32;
        self.valid_size = self.file_size;
    }
}

struct Slot {
    generation: u32,
    fcb: Option<Fcb>,
}

/// Arena of Fcbs addressed by generational handles.
#[derive(Default)]
pub struct FcbTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl FcbTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, fcb: Fcb) -> FcbId {
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.fcb = Some(fcb);
                FcbId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    fcb: Some(fcb),
                });
                FcbId {
                    index: self.slots.len() as u32 - 1,
                    generation: 0,
                }
            }
        }
    }

    pub fn get(&self, id: FcbId) -> Result<&Fcb> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.fcb.as_ref())
            .ok_or_else(|| stale(id))
    }

    pub fn get_mut(&mut self, id: FcbId) -> Result<&mut Fcb> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.fcb.as_mut())
            .ok_or_else(|| stale(id))
    }

    pub fn remove(&mut self, id: FcbId) -> Result<Fcb> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .ok_or_else(|| stale(id))?;
        let fcb = slot.fcb.take().ok_or_else(|| stale(id))?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        Ok(fcb)
    }

    /// Finds a live Fcb by parent and case-insensitive name.
    pub fn find_child(&self, parent: FcbId, name: &str) -> Option<FcbId> {
        self.iter()
            .find(|(_, fcb)| fcb.parent == Some(parent) && names_equal(&fcb.name, name))
            .map(|(id, _)| id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (FcbId, &Fcb)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.fcb.as_ref().map(|fcb| {
                (
                    FcbId {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    fcb,
                )
            })
        })
    }

    pub fn ids(&self) -> Vec<FcbId> {
        self.iter().map(|(id, _)| id).collect()
    }

    /// Fcbs held open on behalf of callers, not counting the ones the
    /// volume keeps for itself.
    pub fn user_open_count(&self) -> usize {
        self.iter().filter(|(_, fcb)| !fcb.is_internal()).count()
    }
}

fn stale(id: FcbId) -> XcfsError {
    XcfsError::InvalidArgument(format!("stale file handle {}:{}", id.index, id.generation))
}
