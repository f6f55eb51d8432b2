//! The cache's protected state: everything that lives behind the single
//! cache mutex.

use std::collections::VecDeque;

use tracing::debug;

use crate::block::{BlockDescriptor, BlockIdx};
use crate::chains::FileChains;
use crate::config::{CacheConfig, MIN_USABLE_BLOCKS};
use crate::error::{CacheError, Result};
use crate::hash::HashTable;
use crate::stats::Statistics;

/// Everything [`crate::cache::KeyCache`] guards with its `parking_lot::Mutex`.
///
/// Laid out as `Vec`s addressed by index rather than a raw pointer graph:
/// `blocks`/`pool` never move once allocated, so a `BlockIdx` is stable
/// for the state's lifetime.
pub(crate) struct CacheState {
    pub config: CacheConfig,
    pub block_size: usize,

    /// Whether the cache is currently serving requests. `false` once
    /// disabled by repeated resource exhaustion or by `end()`.
    pub can_be_used: bool,

    pub in_resize: bool,
    pub resize_in_flush: bool,
    /// Count of in-flight direct (cache-disabled) I/O operations a
    /// resize must drain before proceeding.
    pub cnt_for_resize_op: u32,

    /// Single contiguous backing allocation for every block's buffer.
    pub pool: Vec<u8>,
    pub blocks: Vec<BlockDescriptor>,

    /// Stack of block indices never yet assigned a buffer's worth of
    /// content, drawn from before `free_blocks`.
    pub free_blocks: Vec<BlockIdx>,
    pub never_used_blocks: usize,
    pub blocks_used: usize,

    pub hash: HashTable,
    pub file_chains: FileChains,

    /// LRU ring tail marks. Both `Some` or both `None`.
    pub hot_tail: Option<BlockIdx>,
    pub warm_tail: Option<BlockIdx>,
    pub warm_blocks: usize,
    pub min_warm_blocks: usize,
    pub age_threshold_ticks: u64,
    /// Monotonically increasing logical clock, stamped on every
    /// `unreg_request`.
    pub keycache_time: u64,

    /// Blocks handed directly to a parked `waiting_for_block` thread,
    /// bypassing the ring.
    pub handed_off: VecDeque<BlockIdx>,
    pub waiting_for_block_count: usize,
    pub waiting_for_hash_link_count: usize,

    pub dirty_block_count: usize,

    pub stats: Statistics,
}

impl CacheState {
    /// Allocate a cache sized per `cfg`, retrying at 75% of the prior
    /// block count on allocation failure down to
    /// [`MIN_USABLE_BLOCKS`].
    pub fn new(cfg: &CacheConfig) -> Result<Self> {
        let validated = cfg.validate()?;
        let mut derived = validated.derive().with_thread_headroom(num_cpus::get());

        loop {
            if derived.blocks < MIN_USABLE_BLOCKS {
                return Err(CacheError::ResourceExhausted {
                    minimum_blocks: MIN_USABLE_BLOCKS,
                });
            }

            let pool_bytes = derived.blocks * validated.block_size;
            match try_allocate_pool(pool_bytes) {
                Some(pool) => {
                    return Ok(Self::build(validated, derived, pool));
                }
                None => {
                    debug!(
                        requested_blocks = derived.blocks,
                        "pool allocation failed, shrinking to 75%"
                    );
                    derived.blocks = (derived.blocks * 3) / 4;
                }
            }
        }
    }

    fn build(config: CacheConfig, derived: crate::config::DerivedCounts, pool: Vec<u8>) -> Self {
        let block_size = config.block_size;
        let blocks = (0..derived.blocks)
            .map(|i| BlockDescriptor::new(i * block_size))
            .collect();

        Self {
            config,
            block_size,
            can_be_used: true,
            in_resize: false,
            resize_in_flush: false,
            cnt_for_resize_op: 0,
            pool,
            blocks,
            free_blocks: Vec::new(),
            never_used_blocks: 0,
            blocks_used: 0,
            hash: HashTable::new(derived.hash_buckets, derived.hash_links, block_size),
            file_chains: FileChains::new(),
            hot_tail: None,
            warm_tail: None,
            warm_blocks: 0,
            min_warm_blocks: derived.min_warm_blocks,
            age_threshold_ticks: derived.age_threshold_ticks,
            keycache_time: 0,
            handed_off: VecDeque::new(),
            waiting_for_block_count: 0,
            waiting_for_hash_link_count: 0,
            dirty_block_count: 0,
            stats: Statistics::default(),
        }
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn buffer_mut(&mut self, idx: BlockIdx) -> &mut [u8] {
        let off = self.blocks[idx as usize].pool_offset;
        &mut self.pool[off..off + self.block_size]
    }

    pub fn buffer(&self, idx: BlockIdx) -> &[u8] {
        let off = self.blocks[idx as usize].pool_offset;
        &self.pool[off..off + self.block_size]
    }

    /// Pop a free block, preferring the never-used pool before the free
    /// stack so reused buffers stay warm in cache lines actually touched
    /// before.
    pub(crate) fn take_free_block(&mut self) -> Option<BlockIdx> {
        if self.never_used_blocks < self.blocks.len() {
            let idx = self.never_used_blocks as BlockIdx;
            self.never_used_blocks += 1;
            self.blocks_used += 1;
            return Some(idx);
        }
        if let Some(idx) = self.free_blocks.pop() {
            self.blocks_used += 1;
            return Some(idx);
        }
        None
    }

    pub(crate) fn return_free_block(&mut self, idx: BlockIdx) {
        self.blocks[idx as usize].reset_for_free_list(self.block_size);
        self.free_blocks.push(idx);
        self.blocks_used -= 1;
    }

    /// Sweep every cross-structure invariant the cache depends on. A
    /// no-op in release builds; callers invoke it unconditionally at the
    /// end of every public operation.
    #[cfg(not(debug_assertions))]
    pub(crate) fn debug_assert_invariants(&self) {}

    #[cfg(debug_assertions)]
    pub(crate) fn debug_assert_invariants(&self) {
        for (i, b) in self.blocks.iter().enumerate() {
            let idx = i as BlockIdx;

            // IN_USE holds iff the block has a hash link.
            debug_assert_eq!(
                b.status.contains(crate::block::Status::IN_USE),
                b.hash_link.is_some(),
                "block {idx}: IN_USE must track hash_link presence"
            );

            // CHANGED holds iff the block sits on its file's dirty chain.
            if let Some(link) = b.hash_link {
                let file = self.hash.get(link).file;
                let on_dirty_chain = self.dirty_chain(file).contains(&idx);
                debug_assert_eq!(
                    b.status.contains(crate::block::Status::CHANGED),
                    on_dirty_chain,
                    "block {idx}: CHANGED must track dirty-chain membership"
                );
            }

            // Invariant: offset <= length <= block_size.
            debug_assert!(b.offset <= b.length || b.length == 0);
            debug_assert!(b.length <= self.block_size);

            // A pinned block (requests > 0) is never in the LRU ring.
            if b.requests > 0 {
                debug_assert!(b.next_used.is_none() && b.prev_used.is_none());
            }
        }

        // Invariant: hot_tail and warm_tail are Some/None together.
        debug_assert_eq!(self.hot_tail.is_some(), self.warm_tail.is_some());
    }
}

/// Allocate a zeroed pool of `bytes`, with failure surfaced as `None`
/// rather than aborting the process. `vec![0u8; bytes]` would invoke the
/// global alloc-error handler (typically an abort) on failure instead of
/// giving the caller a chance to retry smaller, so this goes through
/// `try_reserve_exact` first.
fn try_allocate_pool(bytes: usize) -> Option<Vec<u8>> {
    if bytes == 0 {
        return None;
    }
    let mut pool = Vec::new();
    pool.try_reserve_exact(bytes).ok()?;
    pool.resize(bytes, 0);
    Some(pool)
}
