//! Per-file clean/dirty chains.

use crate::block::{BlockIdx, Status};
use crate::config::FILE_HASH_BUCKETS;
use crate::state::CacheState;
use crate::FileId;

#[derive(Default, Clone, Copy)]
struct FileBucket {
    clean_head: Option<BlockIdx>,
    dirty_head: Option<BlockIdx>,
}

/// A small hash over the file handle; each bucket holds two independent
/// doubly-linked lists of blocks (clean vs dirty) whose key hashes into
/// it.
pub(crate) struct FileChains {
    buckets: Vec<FileBucket>,
}

impl FileChains {
    pub fn new() -> Self {
        Self {
            buckets: vec![FileBucket::default(); FILE_HASH_BUCKETS],
        }
    }

    fn bucket_of(file: FileId) -> usize {
        (file as u32 as usize) & (FILE_HASH_BUCKETS - 1)
    }
}

impl CacheState {
    fn file_head(&self, file: FileId, dirty: bool) -> Option<BlockIdx> {
        let bucket = &self.file_chains.buckets[FileChains::bucket_of(file)];
        if dirty {
            bucket.dirty_head
        } else {
            bucket.clean_head
        }
    }

    fn set_file_head(&mut self, file: FileId, dirty: bool, head: Option<BlockIdx>) {
        let bucket = &mut self.file_chains.buckets[FileChains::bucket_of(file)];
        if dirty {
            bucket.dirty_head = head;
        } else {
            bucket.clean_head = head;
        }
    }

    /// Remove a block from whichever clean/dirty chain it currently sits
    /// on, if any. Does not touch `CHANGED`. A block with no `prev_changed`
    /// is either the chain head or was never linked at all; those two
    /// cases are indistinguishable from its own links alone, so this
    /// checks the bucket's head pointer before clearing it — otherwise a
    /// never-linked block (e.g. one just pulled off the free list) would
    /// wipe out another block's chain when the file already has entries.
    pub(crate) fn unlink_changed(&mut self, idx: BlockIdx) {
        let Some(link) = self.blocks[idx as usize].hash_link else {
            return;
        };
        let file = self.hash.get(link).file;
        let dirty = self.blocks[idx as usize].status.contains(Status::CHANGED);
        let prev = self.blocks[idx as usize].prev_changed;
        let next = self.blocks[idx as usize].next_changed;
        match prev {
            Some(p) => self.blocks[p as usize].next_changed = next,
            None if self.file_head(file, dirty) == Some(idx) => {
                self.set_file_head(file, dirty, next);
            }
            None => return,
        }
        if let Some(n) = next {
            self.blocks[n as usize].prev_changed = prev;
        }
        self.blocks[idx as usize].prev_changed = None;
        self.blocks[idx as usize].next_changed = None;
    }

    fn link_changed(&mut self, idx: BlockIdx, file: FileId, dirty: bool) {
        let head = self.file_head(file, dirty);
        self.blocks[idx as usize].next_changed = head;
        self.blocks[idx as usize].prev_changed = None;
        if let Some(h) = head {
            self.blocks[h as usize].prev_changed = Some(idx);
        }
        self.set_file_head(file, dirty, Some(idx));
    }

    /// Move a block onto its file's clean chain, clearing `CHANGED` if it
    /// was set (only this helper and `link_to_changed_list` may flip the
    /// flag).
    pub(crate) fn link_to_file_list(&mut self, idx: BlockIdx) {
        let file = self.hash.get(self.blocks[idx as usize].hash_link.unwrap()).file;
        self.move_to_clean_list(idx, file);
    }

    /// Detach a block from whichever chain it currently sits on (resolved
    /// against its *current* `hash_link`) and attach it fresh onto
    /// `file`'s clean chain, clearing `CHANGED` if set. Used both by
    /// `link_to_file_list` (file unchanged) and by block reassignment,
    /// where `file` is the block's new key and differs from the file its
    /// `hash_link` still names at the moment this runs.
    pub(crate) fn move_to_clean_list(&mut self, idx: BlockIdx, file: FileId) {
        self.unlink_changed(idx);
        if self.blocks[idx as usize].status.contains(Status::CHANGED) {
            self.blocks[idx as usize].status.remove(Status::CHANGED);
            self.dirty_block_count -= 1;
        }
        self.link_changed(idx, file, false);
    }

    /// Move a block onto its file's dirty chain, setting `CHANGED`.
    pub(crate) fn link_to_changed_list(&mut self, idx: BlockIdx) {
        debug_assert!(!self.blocks[idx as usize].status.contains(Status::CHANGED));
        self.unlink_changed(idx);
        let file = self.hash.get(self.blocks[idx as usize].hash_link.unwrap()).file;
        self.link_changed(idx, file, true);
        self.blocks[idx as usize].status.insert(Status::CHANGED);
        self.dirty_block_count += 1;
    }

    /// Iterate the dirty chain for `file`, oldest-linked first.
    pub(crate) fn dirty_chain(&self, file: FileId) -> Vec<BlockIdx> {
        let mut out = Vec::new();
        let mut cur = self.file_head(file, true);
        while let Some(idx) = cur {
            out.push(idx);
            cur = self.blocks[idx as usize].next_changed;
        }
        out
    }

    /// `true` if `file` has no dirty blocks left.
    pub(crate) fn dirty_chain_is_empty(&self, file: FileId) -> bool {
        self.file_head(file, true).is_none()
    }

    /// All distinct files currently holding at least one dirty block,
    /// used by `flush_all` to iterate every bucket.
    pub(crate) fn all_dirty_files(&self) -> Vec<FileId> {
        let mut files = Vec::new();
        for bucket in &self.file_chains.buckets {
            if let Some(mut cur) = bucket.dirty_head {
                loop {
                    let link = self.blocks[cur as usize].hash_link.unwrap();
                    let file = self.hash.get(link).file;
                    if !files.contains(&file) {
                        files.push(file);
                    }
                    match self.blocks[cur as usize].next_changed {
                        Some(n) => cur = n,
                        None => break,
                    }
                }
            }
        }
        files
    }

    /// Iterate the clean chain for `file`.
    pub(crate) fn clean_chain(&self, file: FileId) -> Vec<BlockIdx> {
        let mut out = Vec::new();
        let mut cur = self.file_head(file, false);
        while let Some(idx) = cur {
            out.push(idx);
            cur = self.blocks[idx as usize].next_changed;
        }
        out
    }

    /// All distinct files currently holding at least one clean cached
    /// block, used by `flush_all`'s release phase.
    pub(crate) fn all_files_with_clean_chain(&self) -> Vec<FileId> {
        let mut files = Vec::new();
        for bucket in &self.file_chains.buckets {
            if let Some(mut cur) = bucket.clean_head {
                loop {
                    let link = self.blocks[cur as usize].hash_link.unwrap();
                    let file = self.hash.get(link).file;
                    if !files.contains(&file) {
                        files.push(file);
                    }
                    match self.blocks[cur as usize].next_changed {
                        Some(n) => cur = n,
                        None => break,
                    }
                }
            }
        }
        files
    }
}
