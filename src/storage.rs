//! Storage layer implementation for emberdb.
//!
//! This module provides the foundation for persistent data storage using a page-based
//! architecture. Key components:
//!
//! - **Page**: Fixed-size (4KB) blocks of data, the basic unit of I/O
//! - **PageManager**: Handles reading/writing pages to disk
//! - **BufferPool**: In-memory cache of pages with LRU eviction and an
//!   extendible hash page table
//! - **TablePage**: Slotted page format for storing variable-length tuples
//! - **B+ tree pages**: Leaf and internal node layouts for indexes
//! - **WAL**: Log records, the log manager and its background flusher

pub mod buffer;
pub mod disk;
pub mod error;
pub mod page;
pub mod wal;

pub use buffer::{BufferPoolManager, PageReadGuard, PageWriteGuard};
pub use disk::{LogFile, PageManager, PAGE_SIZE};
pub use error::{StorageError, StorageResult};
pub use page::{Page, PageId};
