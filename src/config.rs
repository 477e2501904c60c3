//! Engine configuration.

use crate::storage::buffer::DEFAULT_BUCKET_SIZE;
use crate::storage::wal::LogConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Frames in the buffer pool.
    pub pool_size: usize,
    /// Entries per bucket of the buffer pool's page table.
    pub page_table_bucket_size: usize,
    /// Bytes buffered by the log manager before it must flush.
    pub log_buffer_size: usize,
    /// Longest a record waits in the log buffer while the flush thread runs.
    pub log_flush_interval: Duration,
    /// Write-ahead logging and recovery. Without it nothing survives a crash.
    pub enable_logging: bool,
    /// Entries per B+ tree leaf. `None` fills the page.
    pub leaf_max_size: Option<usize>,
    /// Children per B+ tree internal page. `None` fills the page.
    pub internal_max_size: Option<usize>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        let log = LogConfig::default();
        Self {
            pool_size: 64,
            page_table_bucket_size: DEFAULT_BUCKET_SIZE,
            log_buffer_size: log.buffer_size,
            log_flush_interval: log.flush_interval,
            enable_logging: true,
            leaf_max_size: None,
            internal_max_size: None,
        }
    }
}

impl DatabaseConfig {
    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            buffer_size: self.log_buffer_size,
            flush_interval: self.log_flush_interval,
        }
    }
}
