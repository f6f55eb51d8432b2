//! Hash-link acquisition/release and the wait queues that guard it.

use parking_lot::MutexGuard;

use crate::cache::KeyCache;
use crate::hash::LinkIdx;
use crate::state::CacheState;
use crate::FileId;

impl KeyCache {
    /// Acquire (allocating if necessary) the hash link for `(file, pos)`,
    /// incrementing its `requests` count. Parks on `waiting_for_hash_link`
    /// and restarts from scratch if the table is momentarily exhausted.
    ///
    /// A vacated link is simply returned to the free stack rather than
    /// re-targeted to a specific waiter's key; every parked thread wakes
    /// and re-derives the lookup, which is equivalent modulo wakeup
    /// order.
    pub(crate) fn get_hash_link<'a>(
        &'a self,
        mut state: MutexGuard<'a, CacheState>,
        file: FileId,
        block_offset: u64,
    ) -> (MutexGuard<'a, CacheState>, LinkIdx) {
        loop {
            if let Some(idx) = state.hash.find(file, block_offset) {
                state.hash.get_mut(idx).requests += 1;
                return (state, idx);
            }
            if let Some(idx) = state.hash.insert_new(file, block_offset) {
                state.hash.get_mut(idx).requests += 1;
                return (state, idx);
            }
            state.waiting_for_hash_link_count += 1;
            self.waiting_for_hash_link.wait(&mut state);
            state.waiting_for_hash_link_count -= 1;
        }
    }

    /// Release a hold on a hash link. If this was the last request and
    /// the link has no resident block, it is returned to the free stack
    /// and any thread parked on `waiting_for_hash_link` is woken to
    /// retry its lookup.
    pub(crate) fn unlink_hash(&self, state: &mut CacheState, idx: LinkIdx) {
        let link = state.hash.get_mut(idx);
        debug_assert!(link.requests > 0);
        link.requests -= 1;
        if link.requests > 0 {
            return;
        }
        if state.hash.get(idx).block.is_some() {
            return;
        }
        state.hash.remove(idx);
        if state.waiting_for_hash_link_count > 0 {
            self.waiting_for_hash_link.notify_all();
        }
    }
}
