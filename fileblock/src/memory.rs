use crate::blockio::{check_transfer, BlockStorage, BLOCK_SIZE};

/// Block storage held entirely in memory. Useful for scratch images and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlockStorage {
    bytes: Vec<u8>,
    /// Number of `write_at` calls, for tests that count device traffic.
    writes: u64,
    /// Number of `read_at` calls.
    reads: u64,
}

impl MemoryBlockStorage {
    /// Creates a zeroed medium of `blocks` blocks.
    pub fn new(blocks: usize) -> Self {
        Self::from_bytes(vec![0; blocks * BLOCK_SIZE])
    }

    /// Wraps an existing image. The length is rounded down to a whole block.
    pub fn from_bytes(mut bytes: Vec<u8>) -> Self {
        let whole = bytes.len() - bytes.len() % BLOCK_SIZE;
        bytes.truncate(whole);
        Self {
            bytes,
            writes: 0,
            reads: 0,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Direct mutable access to the image, bypassing the transfer checks.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn write_count(&self) -> u64 {
        self.writes
    }

    pub fn read_count(&self) -> u64 {
        self.reads
    }
}

impl BlockStorage for MemoryBlockStorage {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
        check_transfer(offset, buf.len(), self.len())?;
        let start = offset as usize;
        buf.copy_from_slice(&self.bytes[start..start + buf.len()]);
        self.reads += 1;
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> std::io::Result<()> {
        check_transfer(offset, buf.len(), self.len())?;
        let start = offset as usize;
        self.bytes[start..start + buf.len()].copy_from_slice(buf);
        self.writes += 1;
        Ok(())
    }

    fn extend(&mut self, new_len: u64) -> std::io::Result<()> {
        if new_len % BLOCK_SIZE as u64 != 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("extension to {:#x} is not block aligned", new_len),
            ));
        }
        if new_len > self.len() {
            self.bytes.resize(new_len as usize, 0);
        }
        Ok(())
    }

    fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn sync_disk(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
