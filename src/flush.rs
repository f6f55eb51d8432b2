//! Persisting dirty blocks: `flush_file` and `flush_all`.

use parking_lot::MutexGuard;
use tracing::{debug, warn};

use crate::block::{BlockIdx, Status};
use crate::cache::KeyCache;
use crate::error::{CacheError, Result};
use crate::state::CacheState;
use crate::FileId;

/// Bound on how many dirty blocks are pinned into one write burst before
/// it's sorted and flushed.
const FLUSH_CACHE: usize = 2000;

/// How many times a burst may hit the same write error before
/// `flush_file` gives up.
const FLUSH_RETRY_LIMIT: u32 = 5;

/// The closed set of flush behaviors a caller may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushType {
    /// Flush whatever dirty blocks aren't currently held by another
    /// in-flight flush or pending update, then return — without waiting
    /// for those other operations to settle first. May leave the file
    /// with dirty blocks still outstanding if every one of them is
    /// currently blocked by someone else.
    Keep,
    /// Flush dirty blocks, then reclaim them onto the free list.
    Release,
    /// Discard dirty contents without writing them back.
    IgnoreChanged,
    /// Flush dirty blocks but keep them resident and clean in cache.
    ForceWrite,
}

impl KeyCache {
    /// `flush(file, type)`.
    pub fn flush(&self, file: FileId, flush_type: FlushType) -> Result<()> {
        let mut state = self.state.lock();
        if !state.can_be_used {
            return Err(CacheError::CacheDisabled);
        }
        let result = self.flush_file_locked(&mut state, file, flush_type);
        state.debug_assert_invariants();
        result
    }

    /// Flush every file with dirty blocks, then release every clean,
    /// unpinned block.
    pub fn flush_all(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.can_be_used {
            return Err(CacheError::CacheDisabled);
        }
        let result = self.flush_all_locked(&mut state);
        state.debug_assert_invariants();
        result
    }

    pub(crate) fn flush_all_locked(&self, state: &mut MutexGuard<'_, CacheState>) -> Result<()> {
        // Phase 1: flush every dirty block, keeping it resident, until no
        // dirty chain anywhere gains new entries while we work.
        loop {
            let mut any_dirty_remaining = false;
            for file in state.all_dirty_files() {
                self.flush_file_locked(state, file, FlushType::ForceWrite)?;
                if !state.dirty_chain_is_empty(file) {
                    any_dirty_remaining = true;
                }
            }
            if !any_dirty_remaining {
                break;
            }
        }

        // Phase 2: release every clean, unpinned block.
        let mut any_new_dirty = false;
        for file in state.all_files_with_clean_chain() {
            for idx in state.clean_chain(file) {
                if state.blocks[idx as usize].requests != 0 {
                    continue;
                }
                state.reg_requests(idx, 1);
                self.free_block_locked(state, idx);
            }
            if !state.dirty_chain_is_empty(file) {
                any_new_dirty = true;
            }
        }

        if any_new_dirty {
            // New dirty blocks appeared while phase 2 wasn't looking
            // (e.g. a concurrent buffered write); restart.
            return self.flush_all_locked(state);
        }
        Ok(())
    }

    pub(crate) fn flush_file_locked(
        &self,
        state: &mut MutexGuard<'_, CacheState>,
        file: FileId,
        flush_type: FlushType,
    ) -> Result<()> {
        let mut first_error: Option<CacheError> = None;
        let mut consecutive_failures = 0u32;

        loop {
            if state.dirty_chain_is_empty(file) {
                break;
            }

            if matches!(flush_type, FlushType::IgnoreChanged) {
                for idx in state.dirty_chain(file) {
                    if !state.blocks[idx as usize]
                        .status
                        .intersects(Status::IN_FLUSH | Status::FOR_UPDATE | Status::IN_SWITCH)
                    {
                        state.link_to_file_list(idx);
                    }
                }
                if state.dirty_chain_is_empty(file) {
                    break;
                }
                // Every remaining dirty block is mid-transition; wait and
                // retry rather than spin.
                self.wait_on_blocking_chain(state, file);
                continue;
            }

            let mut burst: Vec<BlockIdx> = Vec::new();
            for idx in state.dirty_chain(file) {
                if state.blocks[idx as usize]
                    .status
                    .intersects(Status::IN_FLUSH | Status::FOR_UPDATE | Status::IN_SWITCH)
                {
                    continue;
                }
                state.reg_requests(idx, 1);
                state.blocks[idx as usize].status.insert(Status::IN_FLUSH);
                burst.push(idx);
                if burst.len() >= FLUSH_CACHE {
                    break;
                }
            }

            if burst.is_empty() {
                if matches!(flush_type, FlushType::Keep) {
                    // Every remaining dirty block is held by another
                    // in-flight flush or a pending update. `Keep` doesn't
                    // wait those out; stop here, possibly leaving dirty
                    // blocks behind for a later flush to pick up.
                    break;
                }
                self.wait_on_blocking_chain(state, file);
                continue;
            }

            debug!(file, burst = burst.len(), "flushing dirty burst");

            // Sort by on-disk position so the bursts write sequentially.
            burst.sort_by_key(|&idx| {
                let link = state.blocks[idx as usize].hash_link.unwrap();
                state.hash.get(link).diskpos
            });

            let mut burst_failed = false;
            for idx in burst {
                if state.blocks[idx as usize].status.contains(Status::FOR_UPDATE) {
                    state.blocks[idx as usize].status.remove(Status::IN_FLUSH);
                    let cv = state.blocks[idx as usize].q_saved.clone();
                    cv.notify_all();
                    let outcome = state.unreg_request(idx, true);
                    if outcome.notify_waiting_for_block {
                        self.waiting_for_block.notify_all();
                    }
                    continue;
                }

                state.blocks[idx as usize].status.insert(Status::IN_FLUSHWRITE);
                let (start, len, diskpos) = {
                    let b = &state.blocks[idx as usize];
                    let link = b.hash_link.unwrap();
                    (b.offset, b.length.saturating_sub(b.offset), state.hash.get(link).diskpos)
                };

                let write_result = if len > 0 {
                    let chunk = state.buffer(idx)[start..start + len].to_vec();
                    let io = self.io.clone();
                    MutexGuard::unlocked(state, || io.pwrite(file, &chunk, diskpos + start as u64))
                } else {
                    Ok(())
                };

                state.blocks[idx as usize].status.remove(Status::IN_FLUSHWRITE | Status::IN_FLUSH);
                let cv = state.blocks[idx as usize].q_saved.clone();
                cv.notify_all();

                match write_result {
                    Ok(()) => {
                        state.stats.flushes += 1;
                        state.link_to_file_list(idx);

                        let release = matches!(flush_type, FlushType::Release)
                            && !state.blocks[idx as usize]
                                .status
                                .intersects(Status::IN_EVICTION | Status::FOR_UPDATE | Status::IN_SWITCH)
                            && state.blocks[idx as usize].requests == 1;

                        if release {
                            self.free_block_locked(state, idx);
                        } else {
                            let outcome = state.unreg_request(idx, true);
                            if outcome.notify_waiting_for_block {
                                self.waiting_for_block.notify_all();
                            }
                        }
                    }
                    Err(e) => {
                        burst_failed = true;
                        if first_error.is_none() {
                            first_error = Some(CacheError::Io(e));
                        }
                        let outcome = state.unreg_request(idx, true);
                        if outcome.notify_waiting_for_block {
                            self.waiting_for_block.notify_all();
                        }
                    }
                }
            }

            if burst_failed {
                consecutive_failures += 1;
                if consecutive_failures >= FLUSH_RETRY_LIMIT {
                    warn!(file, attempts = consecutive_failures, "flush giving up after repeated write errors");
                    return Err(CacheError::FlushFailed {
                        file,
                        attempts: consecutive_failures,
                    });
                }
            } else {
                consecutive_failures = 0;
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Park on whichever wait queue the first still-dirty, not-yet-flushable
    /// block in `file`'s chain justifies: the next in-flight flush's
    /// `q_saved`, or the next `FOR_UPDATE`'s `q_requested` if none are
    /// flushable by us.
    fn wait_on_blocking_chain(&self, state: &mut MutexGuard<'_, CacheState>, file: FileId) {
        let chain = state.dirty_chain(file);
        if let Some(idx) = chain
            .iter()
            .find(|&&i| state.blocks[i as usize].status.contains(Status::IN_FLUSH))
        {
            let cv = state.blocks[*idx as usize].q_saved.clone();
            cv.wait(state);
            return;
        }
        if let Some(idx) = chain
            .iter()
            .find(|&&i| state.blocks[i as usize].status.contains(Status::FOR_UPDATE))
        {
            let cv = state.blocks[*idx as usize].q_requested.clone();
            cv.wait(state);
        }
    }
}
