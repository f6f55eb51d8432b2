//! The two-segment (hot/warm) LRU ring.

use crate::block::{BlockIdx, Status, Temperature};
use crate::state::CacheState;

impl CacheState {
    /// Link `idx` into the LRU ring, or hand it directly to a thread
    /// parked on `waiting_for_block` when the ring would otherwise sit
    /// empty. `hot` selects which tail mark (`hot_tail`/`warm_tail`) the
    /// block attaches after; `at_end` additionally advances that mark.
    ///
    /// Returns `true` if the block was handed off rather than linked; the
    /// caller must then notify `waiting_for_block` (that condvar lives on
    /// the outer [`crate::cache::KeyCache`], not behind this mutex).
    pub(crate) fn link_block(&mut self, idx: BlockIdx, hot: bool, at_end: bool) -> bool {
        if !hot && self.waiting_for_block_count > 0 {
            self.hand_off_block(idx);
            return true;
        }

        if self.warm_tail.is_none() {
            self.blocks[idx as usize].next_used = Some(idx);
            self.blocks[idx as usize].prev_used = Some(idx);
            self.hot_tail = Some(idx);
            self.warm_tail = Some(idx);
            return false;
        }

        let ins = if hot { self.hot_tail } else { self.warm_tail }.unwrap();
        let old_next = self.blocks[ins as usize].next_used.unwrap();
        self.blocks[idx as usize].next_used = Some(old_next);
        self.blocks[idx as usize].prev_used = Some(ins);
        self.blocks[old_next as usize].prev_used = Some(idx);
        self.blocks[ins as usize].next_used = Some(idx);
        if at_end {
            if hot {
                self.hot_tail = Some(idx);
            } else {
                self.warm_tail = Some(idx);
            }
        }
        false
    }

    /// Unlink `idx` from the LRU ring. The block must currently be in it.
    pub(crate) fn unlink_block(&mut self, idx: BlockIdx) {
        let next = self.blocks[idx as usize].next_used.unwrap();
        if next == idx {
            self.hot_tail = None;
            self.warm_tail = None;
        } else {
            let prev = self.blocks[idx as usize].prev_used.unwrap();
            self.blocks[next as usize].prev_used = Some(prev);
            self.blocks[prev as usize].next_used = Some(next);
            if self.warm_tail == Some(idx) {
                self.warm_tail = Some(prev);
            }
            if self.hot_tail == Some(idx) {
                self.hot_tail = Some(prev);
            }
        }
        self.blocks[idx as usize].next_used = None;
        self.blocks[idx as usize].prev_used = None;
    }

    /// Hand a just-released block straight to whichever thread has been
    /// parked longest on `waiting_for_block`, bypassing the ring
    /// entirely. The caller notifies `waiting_for_block`.
    fn hand_off_block(&mut self, idx: BlockIdx) {
        self.blocks[idx as usize].requests = 1;
        self.blocks[idx as usize].status.insert(Status::IN_EVICTION);
        self.handed_off.push_back(idx);
    }

    /// The next eviction victim, if the ring is non-empty
    /// (`used_last.next_used`).
    pub(crate) fn eviction_victim(&self) -> Option<BlockIdx> {
        self.warm_tail
            .map(|tail| self.blocks[tail as usize].next_used.unwrap())
    }

    /// Pin a block, removing it from the LRU ring on the first request.
    pub(crate) fn reg_requests(&mut self, idx: BlockIdx, n: u32) {
        if self.blocks[idx as usize].requests == 0 {
            self.unlink_block(idx);
        }
        self.blocks[idx as usize].requests += n;
    }

    /// Release a pin. On the last release, ages, possibly promotes the
    /// block to `HOT`, and re-links it into the ring.
    pub(crate) fn unreg_request(&mut self, idx: BlockIdx, at_end: bool) -> UnregOutcome {
        {
            let b = &mut self.blocks[idx as usize];
            debug_assert!(b.requests > 0);
            b.requests -= 1;
        }
        let b = &self.blocks[idx as usize];
        if b.requests > 0 || b.status.contains(Status::ERROR) {
            return UnregOutcome::default();
        }

        {
            let b = &mut self.blocks[idx as usize];
            b.hits_left = b.hits_left.saturating_sub(1);
        }

        let hits_left = self.blocks[idx as usize].hits_left;
        let was_warm = self.blocks[idx as usize].temperature == Temperature::Warm;
        let promote_hot = hits_left == 0 && at_end && self.warm_blocks > self.min_warm_blocks;

        let idx_handed_off = if promote_hot {
            if was_warm {
                self.warm_blocks -= 1;
            }
            self.blocks[idx as usize].temperature = Temperature::Hot;
            self.link_block(idx, true, true)
        } else {
            if self.blocks[idx as usize].temperature != Temperature::Warm {
                self.blocks[idx as usize].temperature = Temperature::Warm;
                self.warm_blocks += 1;
            }
            self.link_block(idx, false, at_end)
        };

        self.blocks[idx as usize].last_hit_time = self.keycache_time;
        self.keycache_time += 1;

        let demotion_handed_off = self.demote_aged_hot_tail();

        UnregOutcome {
            idx_handed_off,
            notify_waiting_for_block: idx_handed_off || demotion_handed_off,
        }
    }

    /// If the block at the hot tail has aged past the threshold, demote
    /// it back to the warm segment.
    fn demote_aged_hot_tail(&mut self) -> bool {
        let Some(hot_idx) = self.hot_tail else {
            return false;
        };
        let last_hit = self.blocks[hot_idx as usize].last_hit_time;
        if self.keycache_time.saturating_sub(last_hit) <= self.age_threshold_ticks {
            return false;
        }
        self.unlink_block(hot_idx);
        if self.blocks[hot_idx as usize].temperature != Temperature::Warm {
            self.blocks[hot_idx as usize].temperature = Temperature::Warm;
            self.warm_blocks += 1;
        }
        self.link_block(hot_idx, false, true)
    }
}

/// What happened to a block released by [`CacheState::unreg_request`].
/// `idx_handed_off` tells the caller whether the block it just released
/// was itself handed directly to a `waiting_for_block` waiter (as opposed
/// to being linked into the ring); the unrelated "demotion check" can
/// also hand off the *former hot-tail* block, which only affects whether
/// the cache-wide condvar needs a wakeup.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct UnregOutcome {
    pub idx_handed_off: bool,
    pub notify_waiting_for_block: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;

    fn tiny_state() -> CacheState {
        let cfg = CacheConfig::builder().block_size(512).memory(512 * 8 + 96 * 8).build();
        CacheState::new(&cfg).unwrap()
    }

    #[test]
    fn reg_then_unreg_relinks_into_ring() {
        let mut state = tiny_state();
        let idx = state.take_free_block().unwrap();
        assert!(state.eviction_victim().is_none());

        state.reg_requests(idx, 1);
        assert_eq!(state.blocks[idx as usize].requests, 1);

        let outcome = state.unreg_request(idx, true);
        assert!(!outcome.idx_handed_off);
        assert_eq!(state.blocks[idx as usize].requests, 0);
        assert_eq!(state.eviction_victim(), Some(idx));
        assert_eq!(state.blocks[idx as usize].temperature, Temperature::Warm);
    }

    #[test]
    fn single_block_ring_is_its_own_neighbor() {
        let mut state = tiny_state();
        let idx = state.take_free_block().unwrap();
        state.reg_requests(idx, 1);
        state.unreg_request(idx, true);

        assert_eq!(state.hot_tail, Some(idx));
        assert_eq!(state.warm_tail, Some(idx));
        assert_eq!(state.blocks[idx as usize].next_used, Some(idx));
        assert_eq!(state.blocks[idx as usize].prev_used, Some(idx));
    }

    #[test]
    fn unlink_block_empties_the_ring() {
        let mut state = tiny_state();
        let idx = state.take_free_block().unwrap();
        state.reg_requests(idx, 1);
        state.unreg_request(idx, true);

        state.unlink_block(idx);
        assert_eq!(state.hot_tail, None);
        assert_eq!(state.warm_tail, None);
        assert_eq!(state.blocks[idx as usize].next_used, None);
    }

    #[test]
    fn pinned_block_leaves_the_ring_on_reg_requests() {
        let mut state = tiny_state();
        let idx = state.take_free_block().unwrap();
        state.reg_requests(idx, 1);
        state.unreg_request(idx, true);
        assert_eq!(state.eviction_victim(), Some(idx));

        state.reg_requests(idx, 1);
        assert!(state.eviction_victim().is_none(), "pinned blocks must not be evictable");
    }
}
