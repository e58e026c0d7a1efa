use crate::error::{Result, XcfsError};
use crate::hasher::{Blake3Hasher, BlockHasher};
use std::fmt;
use std::sync::Arc;

/// Smallest cache that can still hold a full root-to-leaf node path plus the
/// data blocks a single operation pins.
pub const MIN_CACHE_CAPACITY: usize = 8;
pub const DEFAULT_CACHE_CAPACITY: usize = 64;
/// Three full levels of 170-way nodes.
pub const MAX_TREE_BLOCKS: u32 = 170 * 170 * 170;

/// Mount and format options shared by both volume kinds.
#[derive(Clone)]
pub struct VolumeConfig {
    cache_capacity: usize,
    verify_hashes: bool,
    read_only: bool,
    growable: bool,
    single_copy: bool,
    max_blocks: u32,
    hasher: Arc<dyn BlockHasher>,
}

impl VolumeConfig {
    pub fn builder() -> VolumeConfigBuilder {
        VolumeConfigBuilder {
            config: VolumeConfig::default(),
        }
    }

    pub fn cache_capacity(&self) -> usize {
        self.cache_capacity
    }

    pub fn verify_hashes(&self) -> bool {
        self.verify_hashes
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn growable(&self) -> bool {
        self.growable
    }

    pub fn single_copy(&self) -> bool {
        self.single_copy
    }

    pub fn max_blocks(&self) -> u32 {
        self.max_blocks
    }

    pub fn hasher(&self) -> Arc<dyn BlockHasher> {
        Arc::clone(&self.hasher)
    }
}

impl Default for VolumeConfig {
    fn default() -> Self {
        VolumeConfig {
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            verify_hashes: false,
            read_only: false,
            growable: false,
            single_copy: false,
            max_blocks: MAX_TREE_BLOCKS,
            hasher: Arc::new(Blake3Hasher),
        }
    }
}

impl fmt::Debug for VolumeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VolumeConfig")
            .field("cache_capacity", &self.cache_capacity)
            .field("verify_hashes", &self.verify_hashes)
            .field("read_only", &self.read_only)
            .field("growable", &self.growable)
            .field("single_copy", &self.single_copy)
            .field("max_blocks", &self.max_blocks)
            .field("hasher", &self.hasher.name())
            .finish()
    }
}

pub struct VolumeConfigBuilder {
    config: VolumeConfig,
}

impl VolumeConfigBuilder {
    /// Number of 4 KiB elements held by the block cache.
    pub fn cache_capacity(mut self, elements: usize) -> Self {
        self.config.cache_capacity = elements;
        self
    }

    /// Compare every block read from an STFS volume against the digest its
    /// parent node records.
    pub fn verify_hashes(mut self, verify: bool) -> Self {
        self.config.verify_hashes = verify;
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.config.read_only = read_only;
        self
    }

    /// Allow an STFS volume to extend its backing store when it runs out of
    /// free blocks.
    pub fn growable(mut self, growable: bool) -> Self {
        self.config.growable = growable;
        self
    }

    /// Format STFS volumes with one copy of every hash node instead of two.
    pub fn single_copy(mut self, single: bool) -> Self {
        self.config.single_copy = single;
        self
    }

    pub fn max_blocks(mut self, blocks: u32) -> Self {
        self.config.max_blocks = blocks;
        self
    }

    pub fn hasher(mut self, hasher: Arc<dyn BlockHasher>) -> Self {
        self.config.hasher = hasher;
        self
    }

    pub fn build(self) -> Result<VolumeConfig> {
        if self.config.cache_capacity < MIN_CACHE_CAPACITY {
            return Err(XcfsError::InvalidArgument(format!(
                "cache capacity {} is below the minimum of {}",
                self.config.cache_capacity, MIN_CACHE_CAPACITY
            )));
        }
        if self.config.max_blocks == 0 || self.config.max_blocks > MAX_TREE_BLOCKS {
            return Err(XcfsError::InvalidArgument(format!(
                "max_blocks must be between 1 and {}",
                MAX_TREE_BLOCKS
            )));
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = VolumeConfig::builder().build().unwrap();
        assert_eq!(config.cache_capacity(), 64);
        assert!(!config.verify_hashes());
        assert!(!config.growable());
        assert_eq!(config.hasher().name(), "blake3-160");
    }

    #[test]
    fn tiny_cache_is_rejected() {
        let result = VolumeConfig::builder().cache_capacity(4).build();
        assert!(matches!(result, Err(XcfsError::InvalidArgument(_))));
    }

    #[test]
    fn builder_options_are_kept() {
        let config = VolumeConfig::builder()
            .cache_capacity(16)
            .verify_hashes(true)
            .growable(true)
            .max_blocks(1000)
            .build()
            .unwrap();
        assert_eq!(config.cache_capacity(), 16);
        assert!(config.verify_hashes());
        assert_eq!(config.max_blocks(), 1000);
    }
}
