use crate::blockio::{check_transfer, BlockStorage, BLOCK_SIZE};
use log::debug;
use std::fs::{File, OpenOptions};
use std::io::prelude::*;
use std::io::{BufWriter, SeekFrom};
use std::path::Path;

/// Emulates block disk/flash storage in userspace using a file as block storage.
/// Container images are plain files, so this is also how images are opened for
/// real use.
pub struct FileBlockEmulator {
    /// The file must be a fixed-size file some exact multiple of the size of a block.
    fd: File,
    /// Length of the medium in bytes.
    len: u64,
}

impl FileBlockEmulator {
    /// Opens an existing image file. The file length is used as the medium size
    /// and must be block aligned.
    pub fn open_disk<P: AsRef<Path>>(dest: P) -> std::io::Result<Self> {
        // Return error if the file does not exist rather than create one.
        let fd = OpenOptions::new().read(true).write(true).open(dest)?;
        let len = fd.metadata()?.len();
        if len % BLOCK_SIZE as u64 != 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("image length {:#x} is not block aligned", len),
            ));
        }
        Ok(FileBlockEmulator { fd, len })
    }

    /// Returns ownership of the underlying file descriptor to the caller.
    pub fn into_file(self) -> File {
        self.fd
    }
}

impl BlockStorage for FileBlockEmulator {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
        check_transfer(offset, buf.len(), self.len)?;
        self.fd.seek(SeekFrom::Start(offset))?;
        self.fd.read_exact(buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> std::io::Result<()> {
        check_transfer(offset, buf.len(), self.len)?;
        self.fd.seek(SeekFrom::Start(offset))?;
        self.fd.write_all(buf)
    }

    fn extend(&mut self, new_len: u64) -> std::io::Result<()> {
        if new_len % BLOCK_SIZE as u64 != 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("extension to {:#x} is not block aligned", new_len),
            ));
        }
        if new_len <= self.len {
            return Ok(());
        }
        debug!("extending image from {:#x} to {:#x} bytes", self.len, new_len);
        self.fd.set_len(new_len)?;
        self.len = new_len;
        Ok(())
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn sync_disk(&mut self) -> std::io::Result<()> {
        self.fd.sync_all()?;
        Ok(())
    }
}

pub struct FileBlockEmulatorBuilder {
    fd: File,
    block_count: usize,
    clear_medium: bool,
}

impl From<File> for FileBlockEmulatorBuilder {
    fn from(fd: File) -> Self {
        FileBlockEmulatorBuilder {
            fd,
            // A better default here might be the size of the file rounded down
            // to the nearest block.
            block_count: 0,
            clear_medium: true,
        }
    }
}

impl FileBlockEmulatorBuilder {
    /// Sets the number of desired blocks in the block store device.
    pub fn with_block_count(mut self, blocks: usize) -> Self {
        self.block_count = blocks;
        self
    }

    /// When false, existing contents of the file are kept and only missing
    /// length is added.
    pub fn clear_medium(mut self, clear: bool) -> Self {
        self.clear_medium = clear;
        self
    }

    /// This builder assumed ownership of the file descriptor used and does
    /// destructive things to prepare the file for use. Additionally, ownership
    /// of the file is transfered to the emulator meaning this builder can only
    /// be used to create one emulator.
    pub fn build(mut self) -> std::io::Result<FileBlockEmulator> {
        debug_assert!(self.block_count > 0);
        let len = (self.block_count * BLOCK_SIZE) as u64;
        if self.clear_medium {
            self.zero_blocks()?;
        } else if self.fd.metadata()?.len() < len {
            self.fd.set_len(len)?;
        }
        Ok(FileBlockEmulator { fd: self.fd, len })
    }

    fn zero_blocks(&mut self) -> std::io::Result<()> {
        self.fd.seek(SeekFrom::Start(0))?;
        let mut bfd = BufWriter::new(&self.fd);
        // Zero out the "disk" block, buffering each write to prevent excessive reads.
        let zero = [0x00; BLOCK_SIZE];
        for _ in 0..self.block_count {
            bfd.write_all(&zero)?;
        }
        bfd.flush()?;
        Ok(())
    }
}
