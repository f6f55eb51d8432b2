//! Releasing a reader's hold on a key, and returning a block to the free
//! list.

use parking_lot::MutexGuard;
use tracing::trace;

use crate::block::{BlockIdx, Status, Temperature};
use crate::cache::KeyCache;
use crate::state::CacheState;

impl KeyCache {
    /// Release this thread's hold on `block_idx`'s hash-link key. Signals
    /// `reader_departed` once no operation holds the key any more, which
    /// is what wakes [`KeyCache::free_block_locked`] and
    /// `evict_and_reassign`'s "wait for readers of the old key" steps.
    pub(crate) fn remove_reader(&self, state: &mut CacheState, block_idx: BlockIdx) {
        let link_idx = state.blocks[block_idx as usize].hash_link.unwrap();
        let link = state.hash.get_mut(link_idx);
        debug_assert!(link.requests > 0);
        link.requests -= 1;
        if link.requests == 0 {
            let cv = state.blocks[block_idx as usize].reader_departed.clone();
            cv.notify_all();
        }
    }

    /// Reclaim `idx` back onto the free list.
    ///
    /// Preconditions: `IN_USE`, not mid-transition, clean, on the clean
    /// chain, pinned with `requests == 1`, attached to a hash link. The
    /// caller must already have released its own hash-link hold via
    /// [`KeyCache::remove_reader`] — every general read/insert/write
    /// wrapper does this before reaching an error path, and the
    /// resize-bypass branch of `find_key_block` does it explicitly.
    pub(crate) fn free_block_locked(&self, state: &mut MutexGuard<'_, CacheState>, idx: BlockIdx) {
        debug_assert!(state.blocks[idx as usize].status.contains(Status::IN_USE));
        debug_assert!(!state.blocks[idx as usize].status.contains(Status::CHANGED));
        debug_assert_eq!(state.blocks[idx as usize].requests, 1);

        let link_idx = state.blocks[idx as usize].hash_link.unwrap();
        state.blocks[idx as usize].status.insert(Status::REASSIGNED);

        while state.hash.get(link_idx).requests > 0 {
            let cv = state.blocks[idx as usize].reader_departed.clone();
            cv.wait(state);
        }

        state.blocks[idx as usize].status.remove(Status::REASSIGNED);

        let outcome = state.unreg_request(idx, false);
        if outcome.notify_waiting_for_block {
            self.waiting_for_block.notify_all();
        }
        if outcome.idx_handed_off {
            // Someone else now owns this block; we're done with it.
            return;
        }

        // `unreg_request` linked `idx` back into the ring on our behalf;
        // we're reclaiming it outright, so pull it straight back out.
        state.unlink_block(idx);
        if state.blocks[idx as usize].temperature == Temperature::Warm {
            state.warm_blocks -= 1;
        }
        state.blocks[idx as usize].temperature = Temperature::Cold;
        state.unlink_changed(idx);

        state.hash.get_mut(link_idx).block = None;
        state.blocks[idx as usize].hash_link = None;
        state.hash.remove(link_idx);
        if state.waiting_for_hash_link_count > 0 {
            self.waiting_for_hash_link.notify_all();
        }

        trace!(block = idx, "freed");
        state.return_free_block(idx);

        let cv = state.blocks[idx as usize].q_saved.clone();
        cv.notify_all();
    }
}
