//! Disk access for the data file and the log file.

pub mod log_file;
pub mod page_manager;

pub use log_file::LogFile;
pub use page_manager::{PageManager, PAGE_SIZE};
