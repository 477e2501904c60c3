//! Transaction id generation.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};

/// A unique identifier for a transaction. Lower ids are older.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub u32);

impl TransactionId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    /// True if this transaction started before `other`.
    pub fn is_older_than(&self, other: TransactionId) -> bool {
        self.0 < other.0
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Txn{}", self.0)
    }
}

/// A thread-safe transaction ID generator.
#[derive(Debug)]
pub struct TransactionIdGenerator {
    next_id: AtomicU32,
}

impl TransactionIdGenerator {
    /// Creates a generator whose first id is 1.
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: u32) -> Self {
        Self {
            next_id: AtomicU32::new(first),
        }
    }

    pub fn next(&self) -> TransactionId {
        TransactionId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Makes sure future ids are all greater than `id`, e.g. after recovery
    /// found `id` in the log.
    pub fn advance_past(&self, id: TransactionId) {
        self.next_id.fetch_max(id.0.saturating_add(1), Ordering::SeqCst);
    }

    /// The id the next call to [`TransactionIdGenerator::next`] returns.
    pub fn peek(&self) -> TransactionId {
        TransactionId(self.next_id.load(Ordering::SeqCst))
    }
}

impl Default for TransactionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
