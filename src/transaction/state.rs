//! Transaction handles and their bookkeeping.

use super::id::TransactionId;
use crate::access::{Rid, TableHeap};
use crate::storage::wal::Lsn;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;

/// Two-phase locking states.
///
/// ```text
/// GROWING --unlock--> SHRINKING
///    |                    |
///    +---> COMMITTED <----+
///    +---> ABORTED   <----+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

impl TransactionState {
    /// Returns true if the transaction can still do work.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Growing | Self::Shrinking)
    }

    /// Returns true if the transaction is finished (committed or aborted).
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Growing => write!(f, "GROWING"),
            Self::Shrinking => write!(f, "SHRINKING"),
            Self::Committed => write!(f, "COMMITTED"),
            Self::Aborted => write!(f, "ABORTED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Insert,
    /// Delete-mark; the physical delete happens at commit.
    Delete,
    /// A delete-mark already made physical by a commit that then failed.
    /// `old_tuple` holds the removed bytes.
    AppliedDelete,
    Update,
}

/// One change made by a transaction, kept so it can be undone on abort or
/// finished on commit.
#[derive(Clone)]
pub struct WriteRecord {
    pub rid: Rid,
    pub kind: WriteKind,
    /// Before-image of an update.
    pub old_tuple: Option<Vec<u8>>,
    pub table: TableHeap,
}

impl fmt::Debug for WriteRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteRecord")
            .field("rid", &self.rid)
            .field("kind", &self.kind)
            .field("old_len", &self.old_tuple.as_ref().map(Vec::len))
            .field("table", &self.table.first_page_id())
            .finish()
    }
}

#[derive(Debug)]
struct TransactionInner {
    state: TransactionState,
    prev_lsn: Lsn,
    shared_locks: HashSet<Rid>,
    exclusive_locks: HashSet<Rid>,
    write_set: Vec<WriteRecord>,
}

/// A running transaction. Shared as `Arc<Transaction>` between the caller,
/// the transaction manager and the lock manager.
#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    inner: Mutex<TransactionInner>,
}

impl Transaction {
    pub fn new(id: TransactionId) -> Self {
        Self {
            id,
            inner: Mutex::new(TransactionInner {
                state: TransactionState::Growing,
                prev_lsn: Lsn::INVALID,
                shared_locks: HashSet::new(),
                exclusive_locks: HashSet::new(),
                write_set: Vec::new(),
            }),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.inner.lock().state
    }

    pub fn set_state(&self, state: TransactionState) {
        self.inner.lock().state = state;
    }

    /// LSN of the last log record this transaction wrote.
    pub fn prev_lsn(&self) -> Lsn {
        self.inner.lock().prev_lsn
    }

    pub fn set_prev_lsn(&self, lsn: Lsn) {
        self.inner.lock().prev_lsn = lsn;
    }

    pub fn is_shared_locked(&self, rid: &Rid) -> bool {
        self.inner.lock().shared_locks.contains(rid)
    }

    pub fn is_exclusive_locked(&self, rid: &Rid) -> bool {
        self.inner.lock().exclusive_locks.contains(rid)
    }

    pub(crate) fn add_shared_lock(&self, rid: Rid) {
        self.inner.lock().shared_locks.insert(rid);
    }

    /// Records an exclusive lock, replacing a shared one after an upgrade.
    pub(crate) fn add_exclusive_lock(&self, rid: Rid) {
        let mut inner = self.inner.lock();
        inner.shared_locks.remove(&rid);
        inner.exclusive_locks.insert(rid);
    }

    pub(crate) fn remove_lock(&self, rid: &Rid) {
        let mut inner = self.inner.lock();
        inner.shared_locks.remove(rid);
        inner.exclusive_locks.remove(rid);
    }

    /// Every record this transaction holds a lock on.
    pub fn locked_rids(&self) -> Vec<Rid> {
        let inner = self.inner.lock();
        inner
            .shared_locks
            .iter()
            .chain(inner.exclusive_locks.iter())
            .copied()
            .collect()
    }

    pub fn push_write(&self, record: WriteRecord) {
        self.inner.lock().write_set.push(record);
    }

    pub fn write_set_len(&self) -> usize {
        self.inner.lock().write_set.len()
    }

    /// Copy of the write set, oldest change first.
    pub fn write_set(&self) -> Vec<WriteRecord> {
        self.inner.lock().write_set.clone()
    }

    pub(crate) fn replace_write(&self, index: usize, record: WriteRecord) {
        if let Some(slot) = self.inner.lock().write_set.get_mut(index) {
            *slot = record;
        }
    }

    /// Keeps only the oldest `len` changes.
    pub(crate) fn truncate_write_set(&self, len: usize) {
        self.inner.lock().write_set.truncate(len);
    }

    /// Removes and returns the write set, oldest change first.
    pub fn take_write_set(&self) -> Vec<WriteRecord> {
        std::mem::take(&mut self.inner.lock().write_set)
    }
}
