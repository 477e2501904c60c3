//! Write-ahead logging.
//!
//! Records are appended through the [`LogManager`], which assigns LSNs and
//! batches them to disk. [`LogReader`] scans the durable log during recovery.

pub mod manager;
pub mod reader;
pub mod record;

pub use manager::{LogConfig, LogManager};
pub use reader::{read_record_at, LogEntry, LogReadError, LogReader};
pub use record::{LogDecodeError, LogRecord, LogRecordBody, LogRecordType, Lsn};
