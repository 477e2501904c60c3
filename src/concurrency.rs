//! Concurrency control: record-level two-phase locking with wait-die
//! deadlock prevention.

pub mod lock;

pub use lock::{LockManager, LockMode};
