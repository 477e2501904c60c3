//! Crash recovery: redo and undo over the write-ahead log.

pub mod aries;

pub use aries::{AriesRecovery, RecoveryError, RecoveryStats};
