//! Storage layer error types.

use crate::storage::page::PageId;
use thiserror::Error;

/// Errors that can occur in the storage layer.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Buffer pool is out of frames: every frame is pinned")]
    OutOfFrames,

    #[error("Page {0} is not pinned")]
    NotPinned(PageId),

    #[error("Page not found: {0}")]
    PageNotFound(PageId),

    #[error("Page is full: requires {required} bytes but only {available} available")]
    PageFull { required: usize, available: usize },

    #[error("Invalid slot: {slot} (tuple count: {count})")]
    InvalidSlot { slot: u32, count: u32 },

    #[error("Corrupt page {page_id}: {reason}")]
    CorruptPage { page_id: PageId, reason: String },

    #[error("Log flush failed: {0}")]
    LogFlush(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Disk(#[from] anyhow::Error),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
