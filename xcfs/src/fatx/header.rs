use crate::error::{Result, XcfsError};
use fileblock::BLOCK_SIZE;
use zerocopy::byteorder::{BigEndian, U32};
use zerocopy::{AsBytes, FromBytes, Unaligned};

/// `XTAF` read as a big-endian word.
pub const MAGIC: u32 = 0x5854_4146;
pub const SECTORS_PER_CLUSTER: u32 = 8;
pub const ROOT_CLUSTER: u32 = 1;

#[repr(C)]
#[derive(AsBytes, FromBytes, Unaligned)]
struct RawHeader {
    magic: U32<BigEndian>,
    serial: U32<BigEndian>,
    sectors_per_cluster: U32<BigEndian>,
    root_cluster: U32<BigEndian>,
}

/// The first block of a FATX volume. Everything after the fixed fields is
/// zero padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeHeader {
    pub serial: u32,
    pub sectors_per_cluster: u32,
    pub root_cluster: u32,
}

impl VolumeHeader {
    pub fn new(serial: u32) -> Self {
        VolumeHeader {
            serial,
            sectors_per_cluster: SECTORS_PER_CLUSTER,
            root_cluster: ROOT_CLUSTER,
        }
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        let raw = RawHeader::read_from_prefix(buf)
            .ok_or_else(|| XcfsError::corruption(0, "volume header is cut short"))?;
        if raw.magic.get() != MAGIC {
            return Err(XcfsError::corruption(
                0,
                format!("bad volume magic {:#010x}", raw.magic.get()),
            ));
        }
        let header = VolumeHeader {
            serial: raw.serial.get(),
            sectors_per_cluster: raw.sectors_per_cluster.get(),
            root_cluster: raw.root_cluster.get(),
        };
        if header.sectors_per_cluster != SECTORS_PER_CLUSTER || header.root_cluster != ROOT_CLUSTER {
            return Err(XcfsError::corruption(
                0,
                format!(
                    "unsupported geometry: {} sectors per cluster, root at cluster {}",
                    header.sectors_per_cluster, header.root_cluster
                ),
            ));
        }
        Ok(header)
    }

    /// The header as a full block.
    pub fn serialize(&self) -> Vec<u8> {
        let raw = RawHeader {
            magic: U32::new(MAGIC),
            serial: U32::new(self.serial),
            sectors_per_cluster: U32::new(self.sectors_per_cluster),
            root_cluster: U32::new(self.root_cluster),
        };
        let mut block = vec![0; BLOCK_SIZE];
        block[..std::mem::size_of::<RawHeader>()].copy_from_slice(raw.as_bytes());
        block
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_starts_with_xtaf() {
        let block = VolumeHeader::new(0xDEAD_BEEF).serialize();
        assert_eq!(block.len(), BLOCK_SIZE);
        assert_eq!(&block[0..4], b"XTAF");
        assert_eq!(&block[4..8], &[0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(&block[8..16], &[0, 0, 0, 8, 0, 0, 0, 1]);
        assert!(block[16..].iter().all(|&b| b == 0));
        assert_eq!(VolumeHeader::parse(&block).unwrap(), VolumeHeader::new(0xDEAD_BEEF));
    }

    #[test]
    fn zeroed_block_is_not_a_volume() {
        assert!(matches!(
            VolumeHeader::parse(&[0; BLOCK_SIZE]),
            Err(XcfsError::Corruption { block: 0, .. })
        ));
    }

    #[test]
    fn short_buffer_is_rejected() {
        assert!(VolumeHeader::parse(b"XTAF").is_err());
    }
}
