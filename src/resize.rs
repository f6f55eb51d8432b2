//! Online resize: drains in-flight operations, flushes what's dirty, and
//! rebuilds the pool/tables from scratch.

use tracing::info;

use crate::cache::KeyCache;
use crate::config::CacheConfig;
use crate::error::Result;
use crate::state::CacheState;

impl KeyCache {
    /// `resize(new_block_size, new_memory, new_division, new_age)`.
    /// Returns the block count actually realized, which may be smaller
    /// than `cfg` implies if allocation had to retry at a reduced size.
    pub fn resize(&self, cfg: CacheConfig) -> Result<usize> {
        let mut state = self.state.lock();

        if cfg.block_size == state.config.block_size && cfg.memory == state.config.memory {
            // Nothing changes in size: just update the tunables.
            state.config.division_limit = cfg.division_limit.min(100);
            state.config.age_threshold = cfg.age_threshold.min(100);
            state.config.serialized_read_from_cache = cfg.serialized_read_from_cache;
            let derived = state.config.derive();
            state.min_warm_blocks = derived.min_warm_blocks;
            state.age_threshold_ticks = derived.age_threshold_ticks;
            let count = state.block_count();
            state.debug_assert_invariants();
            return Ok(count);
        }

        while state.in_resize {
            self.resize_queue.wait(&mut state);
        }
        state.in_resize = true;

        if state.can_be_used {
            state.resize_in_flush = true;
            if self.flush_all_locked(&mut state).is_err() {
                state.can_be_used = false;
            }
            state.resize_in_flush = false;
        }

        while state.cnt_for_resize_op > 0 {
            self.waiting_for_resize_cnt.wait(&mut state);
        }

        let result = match CacheState::new(&cfg) {
            Ok(fresh) => {
                let block_count = fresh.block_count();
                *state = fresh;
                info!(block_count, block_size = state.block_size, "cache resized");
                Ok(block_count)
            }
            Err(e) => {
                state.can_be_used = false;
                Err(e)
            }
        };

        state.in_resize = false;
        self.resize_queue.notify_all();
        state.debug_assert_invariants();

        result
    }
}
