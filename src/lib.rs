//! emberdb: a single-node storage engine kernel.
//!
//! A buffer pool over a paged data file, B+ tree indexes with latch
//! crabbing, record-level two-phase locking with wait-die, and a
//! write-ahead log with ARIES-style crash recovery.

pub mod access;
pub mod concurrency;
pub mod config;
pub mod database;
pub mod recovery;
pub mod storage;
pub mod transaction;

pub use config::DatabaseConfig;
pub use database::Database;
