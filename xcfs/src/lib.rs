//! Block engine for FATX and STFS container volumes.
//!
//! Both formats keep file data in 4096-byte blocks reached through per-file
//! chains. FATX chains live in a flat allocation table; STFS chains live in
//! the leaves of a double-buffered hash tree whose root digest covers the
//! volume. A shared reference-counted block cache, offset translator and
//! directory record layer sit on top of either, and [`FatxVolume`] and
//! [`StfsVolume`] expose them through the [`Volume`] file-handle API.

pub mod alloc;
pub mod cache;
pub mod config;
pub mod directory;
pub mod dirent;
mod error;
pub mod fatx;
pub mod fcb;
pub mod file_io;
pub mod free_space;
pub mod hasher;
pub mod stfs;
pub mod translate;
mod volume;

/// Index of a data block (STFS) or cluster (FATX) within a volume.
pub type BlockNumber = u32;

pub use config::{VolumeConfig, VolumeConfigBuilder};
pub use dirent::{Attributes, DirectoryEntry, FatTimestamp};
pub use error::{Result, XcfsError};
pub use fatx::FatxVolume;
pub use fcb::FcbId;
pub use hasher::{Blake3Hasher, BlockHasher, Digest};
pub use stfs::StfsVolume;
pub use volume::{FileInfo, Volume, VolumeStats};
