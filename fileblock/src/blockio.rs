use std::io::{Error, ErrorKind};

/// Every transfer against a block storage device is a whole number of these.
pub const BLOCK_SIZE: usize = 4096;

/// Raw, block-aligned I/O surface consumed by the filesystem engine.
///
/// Offsets are absolute byte positions on the backing medium. Both the offset
/// and the length of every transfer must be a multiple of [`BLOCK_SIZE`]; the
/// engine performs its own read-modify-write for partial blocks.
pub trait BlockStorage {
    /// Reads `buf.len()` bytes starting at `offset` into `buf`.
    ///
    /// # Errors
    ///
    /// Attempting to read past the end of the medium or with an unaligned
    /// offset/length will return an error.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> std::io::Result<()>;
    /// Writes all of `buf` starting at `offset`.
    ///
    /// # Errors
    ///
    /// Attempting to write past the end of the medium or with an unaligned
    /// offset/length will return an error.
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> std::io::Result<()>;
    /// Grows the medium to `new_len` bytes. The new region reads as zeroes.
    /// Shrinking is not supported.
    fn extend(&mut self, new_len: u64) -> std::io::Result<()>;
    /// Current length of the medium in bytes.
    fn len(&self) -> u64;
    /// Flush any buffered disk IO from memory. This is useful if it must guaranteed
    /// the disk writes actually occurred, for instance, if being re-read from
    /// disk.
    fn sync_disk(&mut self) -> std::io::Result<()>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<S: BlockStorage + ?Sized> BlockStorage for Box<S> {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
        (**self).read_at(offset, buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> std::io::Result<()> {
        (**self).write_at(offset, buf)
    }

    fn extend(&mut self, new_len: u64) -> std::io::Result<()> {
        (**self).extend(new_len)
    }

    fn len(&self) -> u64 {
        (**self).len()
    }

    fn sync_disk(&mut self) -> std::io::Result<()> {
        (**self).sync_disk()
    }
}

/// Validates that a transfer is block aligned and lies within `limit` bytes.
pub fn check_transfer(offset: u64, len: usize, limit: u64) -> std::io::Result<()> {
    let block = BLOCK_SIZE as u64;
    if offset % block != 0 || len % BLOCK_SIZE != 0 {
        return Err(Error::new(
            ErrorKind::InvalidInput,
            format!("unaligned transfer: offset={:#x} len={:#x}", offset, len),
        ));
    }
    let end = offset
        .checked_add(len as u64)
        .ok_or_else(|| Error::new(ErrorKind::InvalidInput, "transfer range overflows"))?;
    if end > limit {
        return Err(Error::new(
            ErrorKind::InvalidInput,
            format!(
                "transfer exceeds medium: offset={:#x} len={:#x} medium={:#x}",
                offset, len, limit
            ),
        ));
    }
    Ok(())
}
