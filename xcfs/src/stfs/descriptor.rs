use crate::alloc::hash_tree::Mirror;
use crate::error::{Result, XcfsError};
use crate::hasher::{Digest, DIGEST_LEN};
use crate::BlockNumber;
use fileblock::BLOCK_SIZE;
use zerocopy::byteorder::{BigEndian, LittleEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, Unaligned};

pub const DESCRIPTOR_SIZE: usize = 0x24;
const VERSION: u8 = 0;

const SINGLE_COPY: u8 = 0x01;
const ROOT_ACTIVE: u8 = 0x02;

#[repr(C)]
#[derive(AsBytes, FromBytes, Unaligned)]
struct RawDescriptor {
    size: u8,
    version: u8,
    flags: u8,
    dir_block_count: U16<LittleEndian>,
    dir_first_block: [u8; 3],
    root_hash: [u8; DIGEST_LEN],
    total_blocks: U32<BigEndian>,
    free_blocks: U32<BigEndian>,
}

/// The persisted root of an STFS volume: where the directory table starts
/// and the digest and counters of the top hash node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeDescriptor {
    pub single_copy: bool,
    pub root_active: Mirror,
    pub dir_block_count: u16,
    pub dir_first_block: BlockNumber,
    pub root_hash: Digest,
    pub total_blocks: u32,
    pub free_blocks: u32,
}

impl VolumeDescriptor {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let raw = RawDescriptor::read_from_prefix(buf)
            .ok_or_else(|| XcfsError::corruption(0, "volume descriptor is cut short"))?;
        if raw.size as usize != DESCRIPTOR_SIZE || raw.version != VERSION {
            return Err(XcfsError::corruption(
                0,
                format!(
                    "unknown volume descriptor: size {:#x}, version {}",
                    raw.size, raw.version
                ),
            ));
        }
        let [a, b, c] = raw.dir_first_block;
        Ok(VolumeDescriptor {
            single_copy: raw.flags & SINGLE_COPY != 0,
            root_active: Mirror::from_bit(raw.flags & ROOT_ACTIVE != 0),
            dir_block_count: raw.dir_block_count.get(),
            dir_first_block: u32::from_le_bytes([a, b, c, 0]),
            root_hash: raw.root_hash,
            total_blocks: raw.total_blocks.get(),
            free_blocks: raw.free_blocks.get(),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut flags = 0;
        if self.single_copy {
            flags |= SINGLE_COPY;
        }
        if self.root_active.bit() {
            flags |= ROOT_ACTIVE;
        }
        let first = self.dir_first_block.to_le_bytes();
        let raw = RawDescriptor {
            size: DESCRIPTOR_SIZE as u8,
            version: VERSION,
            flags,
            dir_block_count: U16::new(self.dir_block_count),
            dir_first_block: [first[0], first[1], first[2]],
            root_hash: self.root_hash,
            total_blocks: U32::new(self.total_blocks),
            free_blocks: U32::new(self.free_blocks),
        };
        raw.as_bytes().to_vec()
    }

    /// The descriptor padded to the block it is stored in.
    pub fn to_block(&self) -> Vec<u8> {
        let mut block = self.to_bytes();
        block.resize(BLOCK_SIZE, 0);
        block
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> VolumeDescriptor {
        VolumeDescriptor {
            single_copy: false,
            root_active: Mirror::B,
            dir_block_count: 2,
            dir_first_block: 0x01_0203,
            root_hash: [0xAB; DIGEST_LEN],
            total_blocks: 0x1234,
            free_blocks: 0x1000,
        }
    }

    #[test]
    fn fields_land_at_their_offsets() {
        let raw = sample().to_bytes();
        assert_eq!(raw.len(), DESCRIPTOR_SIZE);
        assert_eq!(&raw[0..3], &[0x24, 0, ROOT_ACTIVE]);
        assert_eq!(&raw[3..5], &[2, 0]);
        assert_eq!(&raw[5..8], &[0x03, 0x02, 0x01]);
        assert_eq!(&raw[8..28], &[0xAB; DIGEST_LEN]);
        assert_eq!(&raw[28..32], &[0, 0, 0x12, 0x34]);
        assert_eq!(&raw[32..36], &[0, 0, 0x10, 0]);
        assert_eq!(VolumeDescriptor::parse(&sample().to_block()).unwrap(), sample());
    }

    #[test]
    fn unknown_version_is_corruption() {
        let mut raw = sample().to_bytes();
        raw[1] = 1;
        assert!(matches!(
            VolumeDescriptor::parse(&raw),
            Err(XcfsError::Corruption { block: 0, .. })
        ));
    }
}
