//! Block descriptors: one per buffer in the pool.

use std::sync::Arc;

use parking_lot::Condvar;

use crate::hash::LinkIdx;

bitflags::bitflags! {
    /// Status bitset over a block's lifecycle. Kept as a single word;
    /// every transition happens under the cache mutex and is paired with
    /// the invariant it implies:
    ///
    /// - `IN_USE` holds iff `hash_link` is `Some`.
    /// - `CHANGED` holds iff the block sits on its file's dirty chain;
    ///   only `link_to_file_list`/`link_to_changed_list` flip it.
    /// - `IN_FLUSHWRITE` implies `IN_FLUSH`; `REASSIGNED` implies
    ///   `IN_SWITCH` or an in-progress free.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct Status: u32 {
        const IN_USE        = 1 << 0;
        const READ          = 1 << 1;
        const CHANGED       = 1 << 2;
        const IN_FLUSH      = 1 << 3;
        const IN_FLUSHWRITE  = 1 << 4;
        const IN_SWITCH      = 1 << 5;
        const IN_EVICTION    = 1 << 6;
        const REASSIGNED     = 1 << 7;
        const FOR_UPDATE     = 1 << 8;
        const ERROR          = 1 << 9;
    }
}

/// LRU segment membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Temperature {
    /// Not in the LRU ring: either free or pinned.
    Cold,
    Warm,
    Hot,
}

/// Result of [`crate::state::CacheState::find_key_block`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageStatus {
    /// The block already holds the full page.
    Read,
    /// This thread is the primary requester and must load the page.
    ToBeRead,
    /// Another thread is already loading the page; wait for it.
    WaitToBeRead,
}

pub(crate) type BlockIdx = u32;

/// One descriptor per buffer in the pool.
pub(crate) struct BlockDescriptor {
    /// Byte offset of this block's buffer inside the pool's backing
    /// allocation (an index rather than a raw pointer).
    pub pool_offset: usize,

    pub status: Status,
    pub temperature: Temperature,

    /// Back-pointer to the hash link currently (or formerly, mid-switch)
    /// owning this block.
    pub hash_link: Option<LinkIdx>,

    /// Count of registered requesters pinning this block.
    pub requests: u32,

    /// Dirty region bounds inside the buffer: `0 <= offset <= length <= block_size`.
    pub offset: usize,
    pub length: usize,

    /// Remaining hits required before promotion to `Hot`.
    pub hits_left: u32,
    /// Logical timestamp of the last `unreg_request` touching this block.
    pub last_hit_time: u64,

    /// Released when the block becomes `READ` (or gains `ERROR`).
    pub q_requested: Arc<Condvar>,
    /// Released after a flush or reassignment step completes.
    pub q_saved: Arc<Condvar>,
    /// Single-waiter condition for `wait_for_readers`/`remove_reader`.
    pub reader_departed: Arc<Condvar>,

    /// LRU ring links.
    pub next_used: Option<BlockIdx>,
    pub prev_used: Option<BlockIdx>,

    /// Per-file clean/dirty chain links.
    pub next_changed: Option<BlockIdx>,
    pub prev_changed: Option<BlockIdx>,
}

impl BlockDescriptor {
    pub fn new(pool_offset: usize) -> Self {
        Self {
            pool_offset,
            status: Status::empty(),
            temperature: Temperature::Cold,
            hash_link: None,
            requests: 0,
            offset: 0,
            length: 0,
            hits_left: 0,
            last_hit_time: 0,
            q_requested: Arc::new(Condvar::new()),
            q_saved: Arc::new(Condvar::new()),
            reader_departed: Arc::new(Condvar::new()),
            next_used: None,
            prev_used: None,
            next_changed: None,
            prev_changed: None,
        }
    }

    /// Reset a block to its just-freed, never-assigned shape: zero
    /// status/length, reset offset to `block_size`.
    pub fn reset_for_free_list(&mut self, block_size: usize) {
        self.status = Status::empty();
        self.temperature = Temperature::Cold;
        self.hash_link = None;
        self.requests = 0;
        self.length = 0;
        self.offset = block_size;
        self.hits_left = 0;
    }

    /// Shape of a freshly-taken block, before its first load.
    pub fn reset_for_assignment(&mut self, block_size: usize) {
        self.status = Status::IN_USE;
        self.temperature = Temperature::Cold;
        self.requests = 1;
        self.offset = block_size;
        self.length = 0;
        self.hits_left = 0;
    }
}
