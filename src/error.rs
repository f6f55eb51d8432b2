//! Error types for the block cache.

use thiserror::Error;

use crate::FileId;

/// Errors produced by cache operations.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("block size {requested} is too small (minimum 512 bytes)")]
    BlockTooSmall { requested: usize },

    #[error("block size {requested} is not a power of two")]
    BlockSizeNotPowerOfTwo { requested: usize },

    #[error("cache is disabled and cannot service this request")]
    CacheDisabled,

    #[error("could not allocate the minimum of {minimum_blocks} blocks")]
    ResourceExhausted { minimum_blocks: usize },

    #[error("flush of file {file} gave up after {attempts} failed attempts")]
    FlushFailed { file: FileId, attempts: u32 },

    #[error("short read: block for file {file} at offset {offset} returned {got} of {expected} required bytes")]
    ShortRead {
        file: FileId,
        offset: u64,
        got: usize,
        expected: usize,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CacheError>;
