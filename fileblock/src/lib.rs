//! Block-addressable backing storage for container images.
//!
//! The filesystem engine never touches files directly; it issues block-aligned
//! transfers through [`BlockStorage`]. Two media are provided: a file-backed
//! emulator for real images and an in-memory medium for scratch work.

mod blockio;
mod emulator;
mod memory;

pub use blockio::{check_transfer, BlockStorage, BLOCK_SIZE};
pub use emulator::{FileBlockEmulator, FileBlockEmulatorBuilder};
pub use memory::MemoryBlockStorage;
