//! Cache-wide counters.

/// Running counters, snapshotted by [`crate::cache::KeyCache::statistics`]
/// and zeroed by `reset_counters` without disturbing cache contents.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Statistics {
    pub read_requests: u64,
    pub reads: u64,
    pub write_requests: u64,
    pub writes: u64,
    pub insert_requests: u64,
    pub inserts: u64,
    pub hits: u64,
    pub flushes: u64,
    pub evictions: u64,
}

impl Statistics {
    pub fn reset(&mut self) {
        *self = Statistics::default();
    }
}

/// Point-in-time snapshot returned to callers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStatistics {
    pub read_requests: u64,
    pub reads: u64,
    pub write_requests: u64,
    pub writes: u64,
    pub insert_requests: u64,
    pub inserts: u64,
    pub hits: u64,
    pub flushes: u64,
    pub evictions: u64,
    pub blocks_used: usize,
    pub blocks_total: usize,
    pub dirty_blocks: usize,
}
