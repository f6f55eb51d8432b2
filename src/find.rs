//! The block state machine, `find_key_block`.

use parking_lot::MutexGuard;
use tracing::trace;

use crate::block::{BlockIdx, PageStatus, Status, Temperature};
use crate::cache::KeyCache;
use crate::hash::LinkIdx;
use crate::state::CacheState;
use crate::FileId;

impl KeyCache {
    /// Find or create the block caching `(file, block_offset)`, pinning
    /// it by one hash-link request. Returns `None` when the cache is
    /// disabled or when the resize-bypass path hands the caller off to a
    /// direct I/O operation instead.
    pub(crate) fn find_key_block<'a>(
        &'a self,
        mut state: MutexGuard<'a, CacheState>,
        file: FileId,
        block_offset: u64,
        hits_init: u32,
        write_mode: bool,
    ) -> (MutexGuard<'a, CacheState>, Option<(BlockIdx, LinkIdx, PageStatus)>) {
        if !state.can_be_used {
            return (state, None);
        }

        loop {
            let (s, link_idx) = self.get_hash_link(state, file, block_offset);
            state = s;

            if state.in_resize {
                let outcome = self.find_key_block_resize_bypass(&mut state, link_idx, write_mode);
                match outcome {
                    ResizeOutcome::Restart => continue,
                    ResizeOutcome::Return(result) => return (state, result),
                }
            }

            let block = state.hash.get(link_idx).block;

            match block {
                Some(block_idx)
                    if state.blocks[block_idx as usize]
                        .status
                        .intersects(Status::IN_EVICTION | Status::IN_SWITCH | Status::REASSIGNED) =>
                {
                    if !state.blocks[block_idx as usize].status.contains(Status::REASSIGNED) {
                        state.reg_requests(block_idx, 1);
                        return (
                            state,
                            Some((block_idx, link_idx, PageStatus::Read)),
                        );
                    }
                    self.remove_reader(&mut state, block_idx);
                    let cv = state.blocks[block_idx as usize].q_saved.clone();
                    cv.wait(&mut state);
                    continue;
                }

                Some(block_idx) => {
                    state.reg_requests(block_idx, 1);
                    if state.blocks[block_idx as usize].hits_left == 0 {
                        state.blocks[block_idx as usize].hits_left = hits_init;
                    }

                    if write_mode {
                        while state.blocks[block_idx as usize].status.contains(Status::IN_FLUSH) {
                            let cv = state.blocks[block_idx as usize].q_saved.clone();
                            cv.wait(&mut state);
                        }
                        if state.blocks[block_idx as usize].status.contains(Status::CHANGED) {
                            return (state, Some((block_idx, link_idx, PageStatus::Read)));
                        }
                    }

                    if state.blocks[block_idx as usize].status.contains(Status::READ) {
                        return (state, Some((block_idx, link_idx, PageStatus::Read)));
                    }
                    return (state, Some((block_idx, link_idx, PageStatus::WaitToBeRead)));
                }

                None => {
                    if let Some(block_idx) = state.take_free_block() {
                        trace!(block = block_idx, "attaching free block");
                        state.blocks[block_idx as usize].reset_for_assignment(state.block_size);
                        state.blocks[block_idx as usize].hits_left = hits_init;
                        state.blocks[block_idx as usize].hash_link = Some(link_idx);
                        state.hash.get_mut(link_idx).block = Some(block_idx);
                        state.link_to_file_list(block_idx);
                        return (state, Some((block_idx, link_idx, PageStatus::ToBeRead)));
                    }

                    if state.eviction_victim().is_none() {
                        state.waiting_for_block_count += 1;
                        self.waiting_for_block.wait(&mut state);
                        state.waiting_for_block_count -= 1;

                        if let Some(block_idx) = state.handed_off.pop_front() {
                            state.blocks[block_idx as usize].hash_link = Some(link_idx);
                            state.hash.get_mut(link_idx).block = Some(block_idx);
                            state.blocks[block_idx as usize].status.remove(Status::IN_EVICTION);
                            state.blocks[block_idx as usize].reset_for_assignment(state.block_size);
                            state.blocks[block_idx as usize].hits_left = hits_init;
                            state.link_to_file_list(block_idx);
                            return (state, Some((block_idx, link_idx, PageStatus::ToBeRead)));
                        }
                        // Lost the race for a handed-off block: release the
                        // hold `get_hash_link` took this iteration before
                        // restarting, which reacquires it from scratch.
                        self.unlink_hash(&mut state, link_idx);
                        continue;
                    }

                    let victim = state.eviction_victim().unwrap();
                    match self.evict_and_reassign(&mut state, victim, link_idx) {
                        EvictOutcome::Reassigned => {
                            state.blocks[victim as usize].hits_left = hits_init;
                            return (state, Some((victim, link_idx, PageStatus::ToBeRead)));
                        }
                        EvictOutcome::Restart => continue,
                    }
                }
            }
        }
    }

    fn find_key_block_resize_bypass(
        &self,
        state: &mut MutexGuard<'_, CacheState>,
        link_idx: LinkIdx,
        write_mode: bool,
    ) -> ResizeOutcome {
        let block = state.hash.get(link_idx).block;

        match block {
            None => {
                let sole_holder = state.hash.get(link_idx).requests == 1;
                // Either way this thread is done with the hold it took
                // this iteration: release it before returning or parking,
                // since a restart reacquires from scratch via
                // `get_hash_link`.
                self.unlink_hash(state, link_idx);
                if sole_holder {
                    ResizeOutcome::Return(None)
                } else {
                    state.waiting_for_block_count += 1;
                    self.waiting_for_block.wait(state);
                    state.waiting_for_block_count -= 1;
                    ResizeOutcome::Restart
                }
            }
            Some(block_idx) => {
                state.reg_requests(block_idx, 1);
                while !state.blocks[block_idx as usize].status.contains(Status::READ)
                    && !state.blocks[block_idx as usize].status.contains(Status::ERROR)
                {
                    let cv = state.blocks[block_idx as usize].q_requested.clone();
                    cv.wait(state);
                }

                if !write_mode {
                    return ResizeOutcome::Return(Some((block_idx, link_idx, PageStatus::Read)));
                }

                loop {
                    if !state.blocks[block_idx as usize].status.contains(Status::IN_FLUSH) {
                        break;
                    }
                    let cv = state.blocks[block_idx as usize].q_saved.clone();
                    cv.wait(state);
                }

                if state.blocks[block_idx as usize].status.contains(Status::CHANGED) {
                    return ResizeOutcome::Return(Some((block_idx, link_idx, PageStatus::Read)));
                }

                self.remove_reader(state, block_idx);
                self.free_block_locked(state, block_idx);
                ResizeOutcome::Return(None)
            }
        }
    }

    /// Select `victim` as the eviction target, write it back if dirty,
    /// and reassign it to `link_idx`'s key.
    fn evict_and_reassign(
        &self,
        state: &mut MutexGuard<'_, CacheState>,
        victim: BlockIdx,
        link_idx: LinkIdx,
    ) -> EvictOutcome {
        if state.blocks[victim as usize].status.contains(Status::IN_FLUSH) {
            // Release the hold `get_hash_link` took this iteration on
            // `link_idx` (the block has no resident block yet, so this is
            // a plain release, not a reassignment) before parking; the
            // caller's restart reacquires it from scratch.
            self.unlink_hash(state, link_idx);
            let cv = state.blocks[victim as usize].q_saved.clone();
            cv.wait(state);
            return EvictOutcome::Restart;
        }

        state.reg_requests(victim, 1);
        state.blocks[victim as usize].status.insert(Status::IN_SWITCH);
        let old_link_idx = state.blocks[victim as usize].hash_link.unwrap();

        if state.blocks[victim as usize].status.contains(Status::CHANGED) {
            state.blocks[victim as usize]
                .status
                .insert(Status::IN_FLUSH | Status::IN_FLUSHWRITE);

            let old_file = state.hash.get(old_link_idx).file;
            let old_pos = state.hash.get(old_link_idx).diskpos;
            let (start, len) = {
                let b = &state.blocks[victim as usize];
                (b.offset, b.length - b.offset)
            };

            let write_result = if len > 0 {
                let buf_range = {
                    let buf = state.buffer(victim);
                    buf[start..start + len].to_vec()
                };
                MutexGuard::unlocked(state, || {
                    self.io.pwrite(old_file, &buf_range, old_pos + start as u64)
                })
            } else {
                Ok(())
            };

            if write_result.is_err() {
                state.blocks[victim as usize].status.insert(Status::ERROR);
            }

            state.blocks[victim as usize]
                .status
                .remove(Status::IN_FLUSH | Status::IN_FLUSHWRITE);
            let cv = state.blocks[victim as usize].q_saved.clone();
            cv.notify_all();
        }

        state.blocks[victim as usize].status.insert(Status::REASSIGNED);
        let new_file = state.hash.get(link_idx).file;
        state.move_to_clean_list(victim, new_file);

        let cv = state.blocks[victim as usize].q_saved.clone();
        cv.notify_all();

        while state.hash.get(old_link_idx).requests > 0 {
            let cv = state.blocks[victim as usize].reader_departed.clone();
            cv.wait(state);
        }

        let cv = state.blocks[victim as usize].q_saved.clone();
        cv.notify_all();

        state.hash.get_mut(old_link_idx).block = None;
        state.hash.remove(old_link_idx);
        if state.waiting_for_hash_link_count > 0 {
            self.waiting_for_hash_link.notify_all();
        }

        state.blocks[victim as usize].hash_link = Some(link_idx);
        state.hash.get_mut(link_idx).block = Some(victim);
        state.blocks[victim as usize]
            .status
            .remove(Status::IN_SWITCH | Status::IN_FLUSH | Status::IN_FLUSHWRITE | Status::REASSIGNED);
        state.blocks[victim as usize].status.insert(Status::IN_USE);
        state.blocks[victim as usize].temperature = Temperature::Cold;
        state.blocks[victim as usize].status.remove(Status::READ | Status::CHANGED);
        state.blocks[victim as usize].length = 0;
        state.blocks[victim as usize].offset = state.block_size;
        state.stats.evictions += 1;

        EvictOutcome::Reassigned
    }
}

enum ResizeOutcome {
    Restart,
    Return(Option<(BlockIdx, LinkIdx, PageStatus)>),
}

enum EvictOutcome {
    Restart,
    Reassigned,
}
