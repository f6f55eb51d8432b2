//! Cache configuration and the derived counts computed from it.

use crate::error::{CacheError, Result};

/// Minimum number of blocks the cache will run with; below this `init`
/// gives up.
pub const MIN_USABLE_BLOCKS: usize = 8;

/// Per-block bookkeeping overhead folded into the block-count derivation
/// (`B = memory / (block_size + overhead)`).
const BLOCK_OVERHEAD_BYTES: usize = 96;

/// A small power-of-two bucket count for the per-file clean/dirty chains.
pub const FILE_HASH_BUCKETS: usize = 128;

/// Tunable parameters accepted by [`crate::KeyCache::init`] and
/// [`crate::KeyCache::resize`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheConfig {
    /// Page size in bytes. Must be a power of two, at least 512.
    pub block_size: usize,
    /// Total bytes available for buffers.
    pub memory: usize,
    /// Percentage (0-100) of blocks reserved as the "warm floor".
    pub division_limit: u8,
    /// Percentage (0-100) used to derive the hot-block aging threshold.
    pub age_threshold: u8,
    /// Keep the cache mutex held while copying a cached block's bytes out
    /// into a caller-supplied read buffer. Defaults to `false`: the
    /// buffer is staged and the mutex dropped before the copy runs, so a
    /// slow or faulting destination buffer can't stall every other
    /// request. Writing into the pool itself always needs the mutex
    /// regardless of this flag, since the pool lives behind it.
    pub serialized_read_from_cache: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            block_size: 4096,
            memory: 8 * 1024 * 1024,
            division_limit: 100,
            age_threshold: 100,
            serialized_read_from_cache: cfg!(feature = "serialized_read_from_cache"),
        }
    }
}

impl CacheConfig {
    /// Start building a configuration from the default values.
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::default()
    }

    /// Validate the configuration, clamping percentage fields and
    /// rejecting an unusable block size.
    pub(crate) fn validate(&self) -> Result<CacheConfig> {
        if self.block_size < 512 {
            return Err(CacheError::BlockTooSmall {
                requested: self.block_size,
            });
        }
        if !self.block_size.is_power_of_two() {
            return Err(CacheError::BlockSizeNotPowerOfTwo {
                requested: self.block_size,
            });
        }
        if self.memory == 0 {
            return Err(CacheError::InvalidArgument("memory must be non-zero".into()));
        }
        Ok(CacheConfig {
            division_limit: self.division_limit.min(100),
            age_threshold: self.age_threshold.min(100),
            ..*self
        })
    }

    /// Derive block/hash-table counts from this configuration.
    pub(crate) fn derive(&self) -> DerivedCounts {
        let per_block = self.block_size + BLOCK_OVERHEAD_BYTES;
        let blocks = self.memory / per_block;

        let hash_buckets = next_power_of_two(((blocks * 5) / 4).max(1));
        let hash_links = (2 * blocks).max(1);
        let min_warm_blocks = ((blocks * self.division_limit as usize) / 100).max(1);
        let age_threshold_ticks = (blocks * self.age_threshold as usize) / 100;

        DerivedCounts {
            blocks,
            hash_buckets,
            hash_links,
            min_warm_blocks,
            age_threshold_ticks,
        }
    }
}

fn next_power_of_two(n: usize) -> usize {
    n.max(1).next_power_of_two()
}

/// Quantities derived from a [`CacheConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DerivedCounts {
    pub blocks: usize,
    pub hash_buckets: usize,
    pub hash_links: usize,
    pub min_warm_blocks: usize,
    pub age_threshold_ticks: u64,
}

impl DerivedCounts {
    /// Raise the hash-link count to comfortably accommodate a given
    /// number of concurrent threads.
    pub(crate) fn with_thread_headroom(mut self, expected_threads: usize) -> Self {
        self.hash_links = self.hash_links.max(expected_threads * 2);
        self
    }
}

/// Builder for [`CacheConfig`] with a fluent construction style.
#[derive(Debug, Clone, Default)]
pub struct CacheConfigBuilder {
    cfg: CacheConfig,
}

impl CacheConfigBuilder {
    pub fn block_size(mut self, block_size: usize) -> Self {
        self.cfg.block_size = block_size;
        self
    }

    pub fn memory(mut self, memory: usize) -> Self {
        self.cfg.memory = memory;
        self
    }

    pub fn division_limit(mut self, division_limit: u8) -> Self {
        self.cfg.division_limit = division_limit;
        self
    }

    pub fn age_threshold(mut self, age_threshold: u8) -> Self {
        self.cfg.age_threshold = age_threshold;
        self
    }

    pub fn serialized_read_from_cache(mut self, enabled: bool) -> Self {
        self.cfg.serialized_read_from_cache = enabled;
        self
    }

    pub fn build(self) -> CacheConfig {
        self.cfg
    }
}
