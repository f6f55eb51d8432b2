//! The public cache handle.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{info, instrument};

use crate::config::CacheConfig;
use crate::error::Result;
use crate::io::IoHandle;
use crate::state::CacheState;
use crate::stats::CacheStatistics;

/// A shared, thread-safe page cache for fixed-size blocks of many backing
/// files.
///
/// Every piece of mutable state lives behind a single
/// [`parking_lot::Mutex`] (`state`); the four cache-wide wait queues sit
/// beside it rather than inside it, since condition variables never need
/// to move once the cache exists. Per-block wait queues live on the
/// block descriptors themselves, inside the mutex.
pub struct KeyCache {
    pub(crate) state: Mutex<CacheState>,

    /// Parked when the hash-link table is exhausted.
    pub(crate) waiting_for_hash_link: Condvar,
    /// Parked when the LRU ring is empty and a new block is needed.
    pub(crate) waiting_for_block: Condvar,
    /// Parked during a resize's pre-flush phase.
    pub(crate) resize_queue: Condvar,
    /// Parked waiting for `cnt_for_resize_op` to reach zero.
    pub(crate) waiting_for_resize_cnt: Condvar,

    pub(crate) io: Arc<dyn IoHandle>,
}

impl KeyCache {
    /// Allocate a cache per `cfg` and `io`, returning the number of
    /// blocks actually realized.
    #[instrument(skip(cfg, io))]
    pub fn init(cfg: CacheConfig, io: Arc<dyn IoHandle>) -> Result<Self> {
        let state = CacheState::new(&cfg)?;
        let block_count = state.block_count();
        info!(block_count, block_size = state.block_size, "cache initialized");
        Ok(Self {
            state: Mutex::new(state),
            waiting_for_hash_link: Condvar::new(),
            waiting_for_block: Condvar::new(),
            resize_queue: Condvar::new(),
            waiting_for_resize_cnt: Condvar::new(),
            io,
        })
    }

    /// Recompute `min_warm_blocks`/`age_threshold_ticks` without touching
    /// the pool or tables.
    pub fn change_param(&self, division_limit: u8, age_threshold: u8) {
        let mut state = self.state.lock();
        state.config.division_limit = division_limit.min(100);
        state.config.age_threshold = age_threshold.min(100);
        let derived = state.config.derive();
        state.min_warm_blocks = derived.min_warm_blocks;
        state.age_threshold_ticks = derived.age_threshold_ticks;
        state.debug_assert_invariants();
    }

    /// A point-in-time snapshot of the running counters.
    pub fn statistics(&self) -> CacheStatistics {
        let state = self.state.lock();
        CacheStatistics {
            read_requests: state.stats.read_requests,
            reads: state.stats.reads,
            write_requests: state.stats.write_requests,
            writes: state.stats.writes,
            insert_requests: state.stats.insert_requests,
            inserts: state.stats.inserts,
            hits: state.stats.hits,
            flushes: state.stats.flushes,
            evictions: state.stats.evictions,
            blocks_used: state.blocks_used,
            blocks_total: state.block_count(),
            dirty_blocks: state.dirty_block_count,
        }
    }

    /// Zero the running counters without disturbing cache contents.
    pub fn reset_counters(&self) {
        self.state.lock().stats.reset();
    }

    /// Disable the cache and drop the pool. `cleanup` is accepted for
    /// symmetry with callers that distinguish a mutex teardown from a
    /// plain disable; this cache has no separate mutex object to tear
    /// down, so both paths behave the same.
    pub fn end(&self, _cleanup: bool) {
        let mut state = self.state.lock();
        state.can_be_used = false;
        state.pool.clear();
        state.pool.shrink_to_fit();
    }

    pub fn is_usable(&self) -> bool {
        self.state.lock().can_be_used
    }

    pub fn block_size(&self) -> usize {
        self.state.lock().block_size
    }

    pub fn block_count(&self) -> usize {
        self.state.lock().block_count()
    }
}
