//! Directory records, names and timestamps.
//!
//! Both formats store 64-byte records. FATX keeps one stream of records per
//! directory; STFS keeps a single table for the whole volume in which every
//! record names the index of its parent.

use crate::error::{Result, XcfsError};
use crate::BlockNumber;
use bitflags::bitflags;
use std::time::{SystemTime, UNIX_EPOCH};
use zerocopy::byteorder::{BigEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, LayoutVerified, Unaligned};

pub const RECORD_SIZE: usize = 64;

bitflags! {
    #[derive(Default)]
    pub struct Attributes: u8 {
        const READ_ONLY = 0x01;
        const HIDDEN = 0x02;
        const SYSTEM = 0x04;
        const VOLUME = 0x08;
        const DIRECTORY = 0x10;
        const ARCHIVE = 0x20;
        const DEVICE = 0x40;
    }
}

const FAT_YEAR_BASE: i64 = 1980;
const FAT_YEAR_MAX: i64 = FAT_YEAR_BASE + 127;
const SECS_PER_DAY: i64 = 86_400;

/// A packed FAT date and time: the date in the high half, the time in the
/// low half, with two-second resolution.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FatTimestamp(pub u32);

impl FatTimestamp {
    pub fn from_parts(year: u16, month: u8, day: u8, hour: u8, minute: u8, second: u8) -> Self {
        let year = (year as i64).max(FAT_YEAR_BASE).min(FAT_YEAR_MAX) - FAT_YEAR_BASE;
        let date = ((year as u32) << 9) | ((month as u32 & 0x0F) << 5) | (day as u32 & 0x1F);
        let time = ((hour as u32 & 0x1F) << 11) | ((minute as u32 & 0x3F) << 5) | (second as u32 / 2);
        FatTimestamp((date << 16) | time)
    }

    /// (year, month, day, hour, minute, second)
    pub fn parts(self) -> (u16, u8, u8, u8, u8, u8) {
        let date = self.0 >> 16;
        let time = self.0 & 0xFFFF;
        (
            ((date >> 9) & 0x7F) as u16 + FAT_YEAR_BASE as u16,
            ((date >> 5) & 0x0F) as u8,
            (date & 0x1F) as u8,
            ((time >> 11) & 0x1F) as u8,
            ((time >> 5) & 0x3F) as u8,
            ((time & 0x1F) * 2) as u8,
        )
    }

    /// Converts seconds since the Unix epoch (UTC). Times outside the FAT
    /// range are clamped to its ends.
    pub fn from_unix(secs: u64) -> Self {
        let secs = secs.min(i64::MAX as u64) as i64;
        let (year, month, day) = civil_from_days(secs / SECS_PER_DAY);
        if year < FAT_YEAR_BASE {
            return FatTimestamp::from_parts(FAT_YEAR_BASE as u16, 1, 1, 0, 0, 0);
        }
        if year > FAT_YEAR_MAX {
            return FatTimestamp::from_parts(FAT_YEAR_MAX as u16, 12, 31, 23, 59, 58);
        }
        let rem = secs % SECS_PER_DAY;
        FatTimestamp::from_parts(
            year as u16,
            month,
            day,
            (rem / 3600) as u8,
            (rem / 60 % 60) as u8,
            (rem % 60) as u8,
        )
    }

    pub fn to_unix(self) -> u64 {
        let (year, month, day, hour, minute, second) = self.parts();
        let days = days_from_civil(year as i64, month.max(1).min(12), day.max(1));
        let secs = days * SECS_PER_DAY + hour as i64 * 3600 + minute as i64 * 60 + second as i64;
        secs.max(0) as u64
    }

    pub fn now() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        FatTimestamp::from_unix(secs)
    }
}

fn days_from_civil(year: i64, month: u8, day: u8) -> i64 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = (if y >= 0 { y } else { y - 399 }) / 400;
    let yoe = y - era * 400;
    let mp = (month as i64 + 9) % 12;
    let doy = (153 * mp + 2) / 5 + day as i64 - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

fn civil_from_days(days: i64) -> (i64, u8, u8) {
    let z = days + 719_468;
    let era = (if z >= 0 { z } else { z - 146_096 }) / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u8;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u8;
    let year = yoe + era * 400 + if month <= 2 { 1 } else { 0 };
    (year, month, day)
}

/// Checks a single path component against the rules shared by both formats.
pub fn validate_name(name: &str, max_len: usize) -> Result<()> {
    let invalid = name.is_empty()
        || name.len() > max_len
        || name == "."
        || name == ".."
        || name
            .bytes()
            .any(|b| !(0x20..0x7F).contains(&b) || b"\"*/:<>?\\|".contains(&b));
    if invalid {
        return Err(XcfsError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Names compare without regard to ASCII case.
pub fn names_equal(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// A decoded directory record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub name: String,
    pub attributes: Attributes,
    pub first_block: Option<BlockNumber>,
    pub size: u32,
    pub created: FatTimestamp,
    pub written: FatTimestamp,
    pub accessed: FatTimestamp,
    /// STFS only: table index of the containing directory, `None` for root.
    pub parent: Option<u16>,
    /// STFS only: the chain is known to be physically consecutive.
    pub contiguous: bool,
    /// STFS only: length of the chain in blocks.
    pub allocated_blocks: u32,
}

impl DirectoryEntry {
    pub fn new(name: &str, attributes: Attributes, stamp: FatTimestamp) -> Self {
        DirectoryEntry {
            name: name.to_string(),
            attributes,
            first_block: None,
            size: 0,
            created: stamp,
            written: stamp,
            accessed: stamp,
            parent: None,
            contiguous: false,
            allocated_blocks: 0,
        }
    }

    pub fn is_directory(&self) -> bool {
        self.attributes.contains(Attributes::DIRECTORY)
    }
}

/// What one record slot holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slot {
    /// No records follow.
    End,
    Deleted,
    Entry(DirectoryEntry),
}

/// Encoding of directory records for one volume format.
pub trait RecordCodec {
    const MAX_NAME: usize;

    /// `block` locates the record for error reports.
    fn decode(raw: &[u8], block: BlockNumber) -> Result<Slot>;

    fn encode(entry: &DirectoryEntry, raw: &mut [u8]) -> Result<()>;

    /// Marks a record deleted in place. Returns false when it already was.
    fn tombstone(raw: &mut [u8]) -> bool;
}

fn decode_name(bytes: &[u8], block: BlockNumber) -> Result<String> {
    if bytes.iter().any(|b| !(0x20..0x7F).contains(b)) {
        return Err(XcfsError::corruption(block, "directory record name is not printable"));
    }
    Ok(bytes.iter().map(|&b| b as char).collect())
}

fn record<T: FromBytes + Unaligned>(raw: &[u8]) -> Result<LayoutVerified<&[u8], T>> {
    LayoutVerified::new_unaligned(raw)
        .ok_or_else(|| XcfsError::InvalidState(format!("directory record is {} bytes", raw.len())))
}

fn record_mut<T: AsBytes + FromBytes + Unaligned>(
    raw: &mut [u8],
) -> Result<LayoutVerified<&mut [u8], T>> {
    let len = raw.len();
    LayoutVerified::new_unaligned(raw)
        .ok_or_else(|| XcfsError::InvalidState(format!("directory record is {} bytes", len)))
}

const FATX_NAME_LEN: usize = 42;
const FATX_DELETED: u8 = 0xE5;

#[repr(C)]
#[derive(AsBytes, FromBytes, Unaligned)]
struct FatxRaw {
    name_len: u8,
    attributes: u8,
    name: [u8; FATX_NAME_LEN],
    first_cluster: U32<BigEndian>,
    size: U32<BigEndian>,
    created: U32<BigEndian>,
    written: U32<BigEndian>,
    accessed: U32<BigEndian>,
}

pub struct FatxRecord;

impl RecordCodec for FatxRecord {
    const MAX_NAME: usize = FATX_NAME_LEN;

    fn decode(raw: &[u8], block: BlockNumber) -> Result<Slot> {
        let rec = record::<FatxRaw>(raw)?;
        let len = match rec.name_len {
            0x00 | 0xFF => return Ok(Slot::End),
            FATX_DELETED => return Ok(Slot::Deleted),
            len if len as usize > FATX_NAME_LEN => {
                return Err(XcfsError::corruption(
                    block,
                    format!("FATX record name length {:#x}", len),
                ))
            }
            len => len as usize,
        };
        let first = rec.first_cluster.get();
        Ok(Slot::Entry(DirectoryEntry {
            name: decode_name(&rec.name[..len], block)?,
            attributes: Attributes::from_bits_truncate(rec.attributes),
            first_block: if first == 0 { None } else { Some(first) },
            size: rec.size.get(),
            created: FatTimestamp(rec.created.get()),
            written: FatTimestamp(rec.written.get()),
            accessed: FatTimestamp(rec.accessed.get()),
            parent: None,
            contiguous: false,
            allocated_blocks: 0,
        }))
    }

    fn encode(entry: &DirectoryEntry, raw: &mut [u8]) -> Result<()> {
        validate_name(&entry.name, FATX_NAME_LEN)?;
        let mut rec = record_mut::<FatxRaw>(raw)?;
        rec.name_len = entry.name.len() as u8;
        rec.attributes = entry.attributes.bits();
        rec.name = [0xFF; FATX_NAME_LEN];
        rec.name[..entry.name.len()].copy_from_slice(entry.name.as_bytes());
        rec.first_cluster.set(entry.first_block.unwrap_or(0));
        rec.size.set(entry.size);
        rec.created.set(entry.created.0);
        rec.written.set(entry.written.0);
        rec.accessed.set(entry.accessed.0);
        Ok(())
    }

    fn tombstone(raw: &mut [u8]) -> bool {
        if raw[0] == FATX_DELETED {
            return false;
        }
        raw[0] = FATX_DELETED;
        true
    }
}

const STFS_NAME_LEN: usize = 40;
const STFS_LEN_MASK: u8 = 0x3F;
const STFS_CONTIGUOUS: u8 = 0x40;
const STFS_DIRECTORY: u8 = 0x80;
const STFS_ROOT_PARENT: u16 = 0xFFFF;

#[repr(C)]
#[derive(AsBytes, FromBytes, Unaligned)]
struct StfsRaw {
    name: [u8; STFS_NAME_LEN],
    flags: u8,
    allocated: [u8; 3],
    allocated_copy: [u8; 3],
    first_block: [u8; 3],
    parent: U16<BigEndian>,
    size: U32<BigEndian>,
    written: U32<BigEndian>,
    accessed: U32<BigEndian>,
}

fn u24_le(raw: [u8; 3]) -> u32 {
    u32::from_le_bytes([raw[0], raw[1], raw[2], 0])
}

fn to_u24_le(value: u32) -> [u8; 3] {
    let bytes = value.to_le_bytes();
    [bytes[0], bytes[1], bytes[2]]
}

pub struct StfsRecord;

impl RecordCodec for StfsRecord {
    const MAX_NAME: usize = STFS_NAME_LEN;

    fn decode(raw: &[u8], block: BlockNumber) -> Result<Slot> {
        let rec = record::<StfsRaw>(raw)?;
        let len = (rec.flags & STFS_LEN_MASK) as usize;
        if len == 0 {
            return Ok(Slot::End);
        }
        if rec.name[0] == 0 {
            return Ok(Slot::Deleted);
        }
        if len > STFS_NAME_LEN {
            return Err(XcfsError::corruption(
                block,
                format!("STFS record name length {}", len),
            ));
        }
        let mut attributes = Attributes::empty();
        if rec.flags & STFS_DIRECTORY != 0 {
            attributes |= Attributes::DIRECTORY;
        }
        let allocated = u24_le(rec.allocated);
        let parent = rec.parent.get();
        let written = FatTimestamp(rec.written.get());
        Ok(Slot::Entry(DirectoryEntry {
            name: decode_name(&rec.name[..len], block)?,
            attributes,
            first_block: if allocated == 0 {
                None
            } else {
                Some(u24_le(rec.first_block))
            },
            size: rec.size.get(),
            created: written,
            written,
            accessed: FatTimestamp(rec.accessed.get()),
            parent: if parent == STFS_ROOT_PARENT {
                None
            } else {
                Some(parent)
            },
            contiguous: rec.flags & STFS_CONTIGUOUS != 0,
            allocated_blocks: allocated,
        }))
    }

    fn encode(entry: &DirectoryEntry, raw: &mut [u8]) -> Result<()> {
        validate_name(&entry.name, STFS_NAME_LEN)?;
        let mut rec = record_mut::<StfsRaw>(raw)?;
        rec.name = [0; STFS_NAME_LEN];
        rec.name[..entry.name.len()].copy_from_slice(entry.name.as_bytes());
        let mut flags = entry.name.len() as u8;
        if entry.contiguous {
            flags |= STFS_CONTIGUOUS;
        }
        if entry.is_directory() {
            flags |= STFS_DIRECTORY;
        }
        rec.flags = flags;
        let allocated = to_u24_le(entry.allocated_blocks);
        rec.allocated = allocated;
        rec.allocated_copy = allocated;
        rec.first_block = to_u24_le(entry.first_block.unwrap_or(0));
        rec.parent.set(entry.parent.unwrap_or(STFS_ROOT_PARENT));
        rec.size.set(entry.size);
        rec.written.set(entry.written.0);
        rec.accessed.set(entry.accessed.0);
        Ok(())
    }

    fn tombstone(raw: &mut [u8]) -> bool {
        if raw[0] == 0 {
            return false;
        }
        raw[0] = 0;
        true
    }
}
