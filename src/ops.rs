//! The thin protocol wrapping `find_key_block`: `read`, `insert`, `write`.

use parking_lot::MutexGuard;

use crate::block::{BlockIdx, PageStatus, Status};
use crate::cache::KeyCache;
use crate::error::{CacheError, Result};
use crate::state::CacheState;
use crate::FileId;

impl KeyCache {
    /// Load a block's full contents from disk.
    ///
    /// Primary requesters release the mutex, `pread` a full block, and
    /// wake every thread parked on `q_requested`. Secondary requesters
    /// just wait on that same queue. `min_len` is the smallest byte
    /// count this particular caller needs present for its own request to
    /// succeed; fewer bytes than that (a short read past end-of-file) is
    /// reported as [`CacheError::ShortRead`] and marks the block
    /// `ERROR`.
    fn read_block(
        &self,
        state: &mut MutexGuard<'_, CacheState>,
        file: FileId,
        block_offset: u64,
        block_idx: BlockIdx,
        min_len: usize,
        primary: bool,
    ) -> Result<()> {
        if !primary {
            while !state.blocks[block_idx as usize]
                .status
                .intersects(Status::READ | Status::ERROR)
            {
                let cv = state.blocks[block_idx as usize].q_requested.clone();
                cv.wait(state);
            }
            return if state.blocks[block_idx as usize].status.contains(Status::ERROR) {
                Err(CacheError::ShortRead {
                    file,
                    offset: block_offset,
                    got: 0,
                    expected: min_len,
                })
            } else {
                Ok(())
            };
        }

        debug_assert!(!state.blocks[block_idx as usize].status.contains(Status::READ));
        let block_size = state.block_size;
        let io = self.io.clone();
        let mut scratch = vec![0u8; block_size];
        let read_result = MutexGuard::unlocked(state, || io.pread(file, &mut scratch, block_offset));

        match read_result {
            Ok(n) if n >= min_len => {
                state.buffer_mut(block_idx)[..n].copy_from_slice(&scratch[..n]);
                state.blocks[block_idx as usize].status.insert(Status::READ);
                state.blocks[block_idx as usize].length = n;
                state.stats.reads += 1;
                let cv = state.blocks[block_idx as usize].q_requested.clone();
                cv.notify_all();
                Ok(())
            }
            Ok(n) => {
                state.blocks[block_idx as usize].status.insert(Status::ERROR);
                let cv = state.blocks[block_idx as usize].q_requested.clone();
                cv.notify_all();
                Err(CacheError::ShortRead {
                    file,
                    offset: block_offset,
                    got: n,
                    expected: min_len,
                })
            }
            Err(e) => {
                state.blocks[block_idx as usize].status.insert(Status::ERROR);
                let cv = state.blocks[block_idx as usize].q_requested.clone();
                cv.notify_all();
                Err(CacheError::Io(e))
            }
        }
    }

    /// Wait out a resize's pre-flush phase: `in_resize && !resize_in_flush`
    /// means a resize has been requested but hasn't started flushing yet,
    /// so new operations park until it either starts flushing (dirty
    /// writes are still allowed to extend cached blocks during the flush
    /// itself) or finishes outright.
    fn wait_out_resize_preflush(&self, state: &mut MutexGuard<'_, CacheState>) {
        while state.in_resize && !state.resize_in_flush {
            self.resize_queue.wait(state);
        }
    }

    /// `read(file, pos, hits_init, out_buf, len)`.
    pub fn read(&self, file: FileId, pos: u64, hits_init: u32, out: &mut [u8]) -> Result<()> {
        if out.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock();
        state.cnt_for_resize_op += 1;

        let mut file_pos = pos;
        let mut buf_off = 0usize;
        let mut remaining = out.len();
        let mut result = Ok(());

        while remaining > 0 {
            self.wait_out_resize_preflush(&mut state);

            let block_size = state.block_size;
            let block_offset = file_pos - (file_pos % block_size as u64);
            let intra = (file_pos - block_offset) as usize;
            let read_len = remaining.min(block_size - intra);
            state.stats.read_requests += 1;

            let (s, found) = self.find_key_block(state, file, block_offset, hits_init, false);
            state = s;

            let step_result = match found {
                None => {
                    let io = self.io.clone();
                    let dest = &mut out[buf_off..buf_off + read_len];
                    let mut scratch = vec![0u8; read_len];
                    let res = MutexGuard::unlocked(&mut state, || {
                        io.pread(file, &mut scratch, block_offset + intra as u64)
                    });
                    match res {
                        Ok(n) if n >= read_len => {
                            dest.copy_from_slice(&scratch);
                            state.stats.reads += 1;
                            Ok(())
                        }
                        Ok(n) => Err(CacheError::ShortRead {
                            file,
                            offset: block_offset + intra as u64,
                            got: n,
                            expected: read_len,
                        }),
                        Err(e) => Err(CacheError::Io(e)),
                    }
                }
                Some((block_idx, _link_idx, page_st)) => {
                    self.run_read_block(
                        &mut state, file, block_offset, block_idx, intra, read_len, page_st,
                        &mut out[buf_off..buf_off + read_len],
                    )
                }
            };

            if let Err(e) = step_result {
                result = Err(e);
                break;
            }

            file_pos += read_len as u64;
            buf_off += read_len;
            remaining -= read_len;
        }

        self.finish_resize_op(&mut state);
        result
    }

    fn run_read_block(
        &self,
        state: &mut MutexGuard<'_, CacheState>,
        file: FileId,
        block_offset: u64,
        block_idx: BlockIdx,
        intra: usize,
        read_len: usize,
        page_st: PageStatus,
        dest: &mut [u8],
    ) -> Result<()> {
        let load_result = match page_st {
            PageStatus::Read => {
                state.stats.hits += 1;
                Ok(())
            }
            PageStatus::ToBeRead => {
                self.read_block(state, file, block_offset, block_idx, intra + read_len, true)
            }
            PageStatus::WaitToBeRead => {
                self.read_block(state, file, block_offset, block_idx, intra + read_len, false)
            }
        };

        let result = load_result.and_then(|()| {
            let length = state.blocks[block_idx as usize].length;
            if length < intra + read_len {
                return Err(CacheError::ShortRead {
                    file,
                    offset: block_offset,
                    got: length,
                    expected: intra + read_len,
                });
            }
            if state.config.serialized_read_from_cache {
                dest.copy_from_slice(&state.buffer(block_idx)[intra..intra + read_len]);
            } else {
                // Stage the cache-side bytes while still locked (the pool
                // only exists behind the mutex), then copy into the
                // caller's buffer with the lock dropped: the block stays
                // pinned throughout, so nothing can evict or overwrite it
                // in the meantime.
                let staged = state.buffer(block_idx)[intra..intra + read_len].to_vec();
                MutexGuard::unlocked(state, || dest.copy_from_slice(&staged));
            }
            Ok(())
        });

        self.remove_reader(state, block_idx);
        match result {
            Ok(()) => {
                let outcome = state.unreg_request(block_idx, true);
                if outcome.notify_waiting_for_block {
                    self.waiting_for_block.notify_all();
                }
            }
            Err(_) => self.free_block_locked(state, block_idx),
        }
        result
    }

    /// `insert(file, pos, hits_init, in_buf, len)`: the
    /// caller already has the bytes (e.g. just read them off disk
    /// itself); this populates the cache with them when there's room to,
    /// and is a no-op where the block is already cached or the cache
    /// bypasses the request entirely.
    pub fn insert(&self, file: FileId, pos: u64, hits_init: u32, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock();
        state.cnt_for_resize_op += 1;

        let mut file_pos = pos;
        let mut buf_off = 0usize;
        let mut remaining = data.len();
        let mut result = Ok(());

        while remaining > 0 {
            self.wait_out_resize_preflush(&mut state);

            let block_size = state.block_size;
            let block_offset = file_pos - (file_pos % block_size as u64);
            let intra = (file_pos - block_offset) as usize;
            let chunk_len = remaining.min(block_size - intra);
            state.stats.insert_requests += 1;

            let (s, found) = self.find_key_block(state, file, block_offset, hits_init, false);
            state = s;

            let step_result = match found {
                None => Ok(()),
                Some((block_idx, _link_idx, page_st)) => self.run_insert_block(
                    &mut state, file, block_offset, block_idx, intra, chunk_len, block_size,
                    page_st, &data[buf_off..buf_off + chunk_len],
                ),
            };

            if let Err(e) = step_result {
                result = Err(e);
                break;
            }

            file_pos += chunk_len as u64;
            buf_off += chunk_len;
            remaining -= chunk_len;
        }

        self.finish_resize_op(&mut state);
        result
    }

    fn run_insert_block(
        &self,
        state: &mut MutexGuard<'_, CacheState>,
        file: FileId,
        block_offset: u64,
        block_idx: BlockIdx,
        intra: usize,
        chunk_len: usize,
        block_size: usize,
        page_st: PageStatus,
        chunk: &[u8],
    ) -> Result<()> {
        let result = match page_st {
            PageStatus::Read => {
                state.stats.hits += 1;
                Ok(())
            }
            PageStatus::ToBeRead if intra == 0 && chunk_len == block_size => {
                state.buffer_mut(block_idx)[..chunk_len].copy_from_slice(chunk);
                state.blocks[block_idx as usize].status.insert(Status::READ);
                state.blocks[block_idx as usize].length = chunk_len;
                state.stats.inserts += 1;
                let cv = state.blocks[block_idx as usize].q_requested.clone();
                cv.notify_all();
                Ok(())
            }
            PageStatus::ToBeRead => {
                self.read_block(state, file, block_offset, block_idx, intra + chunk_len, true)
            }
            PageStatus::WaitToBeRead => {
                self.read_block(state, file, block_offset, block_idx, intra + chunk_len, false)
            }
        };

        self.remove_reader(state, block_idx);
        match &result {
            Ok(()) => {
                let outcome = state.unreg_request(block_idx, true);
                if outcome.notify_waiting_for_block {
                    self.waiting_for_block.notify_all();
                }
            }
            Err(_) => self.free_block_locked(state, block_idx),
        }
        result
    }

    /// `write(file, pos, hits_init, in_buf, len, dont_write)`.
    /// `dont_write = true` keeps the write buffered in cache (the dirty
    /// bytes are flushed later); `false` writes through to disk
    /// immediately and also updates the cache so subsequent reads hit it.
    pub fn write(
        &self,
        file: FileId,
        pos: u64,
        hits_init: u32,
        data: &[u8],
        dont_write: bool,
    ) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock();
        state.cnt_for_resize_op += 1;

        let mut file_pos = pos;
        let mut buf_off = 0usize;
        let mut remaining = data.len();
        let mut result = Ok(());

        while remaining > 0 {
            self.wait_out_resize_preflush(&mut state);

            let block_size = state.block_size;
            let block_offset = file_pos - (file_pos % block_size as u64);
            let intra = (file_pos - block_offset) as usize;
            let chunk_len = remaining.min(block_size - intra);
            state.stats.write_requests += 1;

            let (s, found) = self.find_key_block(state, file, block_offset, hits_init, true);
            state = s;

            let step_result = match found {
                None => {
                    let io = self.io.clone();
                    let chunk = data[buf_off..buf_off + chunk_len].to_vec();
                    let res = MutexGuard::unlocked(&mut state, || {
                        io.pwrite(file, &chunk, block_offset + intra as u64)
                    });
                    state.stats.writes += 1;
                    res.map_err(CacheError::Io)
                }
                Some((block_idx, _link_idx, page_st)) => self.run_write_block(
                    &mut state, file, block_offset, block_idx, intra, chunk_len, block_size,
                    page_st, &data[buf_off..buf_off + chunk_len], dont_write,
                ),
            };

            if let Err(e) = step_result {
                result = Err(e);
                break;
            }

            file_pos += chunk_len as u64;
            buf_off += chunk_len;
            remaining -= chunk_len;
        }

        self.finish_resize_op(&mut state);
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn run_write_block(
        &self,
        state: &mut MutexGuard<'_, CacheState>,
        file: FileId,
        block_offset: u64,
        block_idx: BlockIdx,
        intra: usize,
        chunk_len: usize,
        block_size: usize,
        page_st: PageStatus,
        chunk: &[u8],
        dont_write: bool,
    ) -> Result<()> {
        state.blocks[block_idx as usize].status.insert(Status::FOR_UPDATE);

        let load_result = match page_st {
            PageStatus::Read => Ok(()),
            PageStatus::ToBeRead if intra == 0 && chunk_len == block_size => Ok(()),
            PageStatus::ToBeRead => {
                self.read_block(state, file, block_offset, block_idx, intra, true)
            }
            PageStatus::WaitToBeRead => {
                self.read_block(state, file, block_offset, block_idx, intra, false)
            }
        };

        let result = load_result.and_then(|()| {
            while state.blocks[block_idx as usize].status.contains(Status::IN_FLUSHWRITE) {
                let cv = state.blocks[block_idx as usize].q_saved.clone();
                cv.wait(state);
            }

            state.buffer_mut(block_idx)[intra..intra + chunk_len].copy_from_slice(chunk);
            state.blocks[block_idx as usize].status.insert(Status::READ);
            state.blocks[block_idx as usize].status.remove(Status::FOR_UPDATE);

            let b = &mut state.blocks[block_idx as usize];
            b.offset = b.offset.min(intra);
            b.length = b.length.max(intra + chunk_len);

            if !dont_write {
                let io = self.io.clone();
                let buf = chunk.to_vec();
                let write_result = MutexGuard::unlocked(state, || {
                    io.pwrite(file, &buf, block_offset + intra as u64)
                });
                state.stats.writes += 1;
                if write_result.is_err() {
                    state.blocks[block_idx as usize].status.insert(Status::ERROR);
                    return write_result.map_err(CacheError::Io);
                }
                if !state.blocks[block_idx as usize].status.contains(Status::CHANGED) {
                    state.link_to_file_list(block_idx);
                }
            } else if !state.blocks[block_idx as usize].status.contains(Status::CHANGED) {
                state.link_to_changed_list(block_idx);
            }

            let cv = state.blocks[block_idx as usize].q_requested.clone();
            cv.notify_all();
            Ok(())
        });

        state.blocks[block_idx as usize].status.remove(Status::FOR_UPDATE);
        self.remove_reader(state, block_idx);
        match &result {
            Ok(()) => {
                let outcome = state.unreg_request(block_idx, true);
                if outcome.notify_waiting_for_block {
                    self.waiting_for_block.notify_all();
                }
            }
            Err(_) => self.free_block_locked(state, block_idx),
        }
        result
    }

    fn finish_resize_op(&self, state: &mut MutexGuard<'_, CacheState>) {
        state.cnt_for_resize_op -= 1;
        if state.cnt_for_resize_op == 0 {
            self.waiting_for_resize_cnt.notify_all();
        }
        state.debug_assert_invariants();
    }
}
