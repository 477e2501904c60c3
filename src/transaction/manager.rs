//! Transaction manager for coordinating transaction lifecycle.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::RwLock;
use thiserror::Error;

use super::id::{TransactionId, TransactionIdGenerator};
use super::state::{Transaction, TransactionState, WriteKind, WriteRecord};
use crate::concurrency::LockManager;
use crate::storage::wal::{LogManager, LogRecord, LogRecordBody};
use crate::storage::StorageError;

/// Error types for transaction operations.
#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("Transaction {0} not found")]
    NotFound(TransactionId),

    #[error("Transaction {0} is in invalid state: {1}")]
    InvalidState(TransactionId, TransactionState),

    /// Lost a wait-die conflict or broke two-phase locking. The caller must
    /// abort the transaction.
    #[error("Transaction {0} was aborted")]
    Aborted(TransactionId),

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Failure inside the table heap while finishing or undoing a write.
    #[error(transparent)]
    Access(#[from] anyhow::Error),
}

/// Result type for transaction operations.
pub type Result<T> = std::result::Result<T, TransactionError>;

/// The transaction manager handles the lifecycle of all transactions.
///
/// Locks are held until commit or abort (strict two-phase locking).
pub struct TransactionManager {
    id_generator: TransactionIdGenerator,
    lock_manager: Arc<LockManager>,
    log_manager: Option<Arc<LogManager>>,
    /// Transactions that have begun and not yet finished.
    transactions: RwLock<HashMap<TransactionId, Arc<Transaction>>>,
}

impl TransactionManager {
    pub fn new(lock_manager: Arc<LockManager>, log_manager: Option<Arc<LogManager>>) -> Self {
        Self {
            id_generator: TransactionIdGenerator::new(),
            lock_manager,
            log_manager,
            transactions: RwLock::new(HashMap::new()),
        }
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    /// Makes every future transaction id greater than `id`.
    pub fn advance_id_past(&self, id: TransactionId) {
        self.id_generator.advance_past(id);
    }

    /// The id the next `begin` hands out.
    pub fn next_id(&self) -> TransactionId {
        self.id_generator.peek()
    }

    fn log(&self, txn: &Transaction, body: LogRecordBody) -> Result<()> {
        if let Some(log_manager) = &self.log_manager {
            let mut record = LogRecord::new(txn.id(), txn.prev_lsn(), body);
            let lsn = log_manager.append_log_record(&mut record)?;
            txn.set_prev_lsn(lsn);
        }
        Ok(())
    }

    /// Forces the transaction's log records, up to its last one, to disk.
    fn flush(&self, txn: &Transaction) -> Result<()> {
        if let Some(log_manager) = &self.log_manager {
            log_manager.flush_till(txn.prev_lsn())?;
        }
        Ok(())
    }

    /// Begins a new transaction.
    pub fn begin(&self) -> Result<Arc<Transaction>> {
        let txn = Arc::new(Transaction::new(self.id_generator.next()));
        self.log(&txn, LogRecordBody::Begin)?;

        self.transactions.write().insert(txn.id(), Arc::clone(&txn));
        debug!("Began {}", txn.id());
        Ok(txn)
    }

    /// Fails unless `txn` has begun and not yet finished.
    fn check_live(&self, txn: &Transaction) -> Result<()> {
        if !self.transactions.read().contains_key(&txn.id()) {
            return Err(TransactionError::NotFound(txn.id()));
        }
        Ok(())
    }

    /// Commits a transaction.
    ///
    /// Delete-marked tuples are removed for good, the COMMIT record is made
    /// durable, and only then are the locks released.
    pub fn commit(&self, txn: &Transaction) -> Result<()> {
        self.check_live(txn)?;
        let state = txn.state();
        if !state.is_active() {
            return Err(TransactionError::InvalidState(txn.id(), state));
        }

        // A failure part way leaves the write set describing what abort has
        // to undo, including deletes that are already physical
        for (index, write) in txn.write_set().into_iter().enumerate() {
            if write.kind == WriteKind::Delete {
                let tuple = write.table.apply_delete(write.rid, txn)?;
                txn.replace_write(
                    index,
                    WriteRecord {
                        kind: WriteKind::AppliedDelete,
                        old_tuple: Some(tuple),
                        ..write
                    },
                );
            }
        }

        self.log(txn, LogRecordBody::Commit)?;
        self.flush(txn)?;
        txn.take_write_set();

        txn.set_state(TransactionState::Committed);
        self.lock_manager.unlock_all(txn);
        self.transactions.write().remove(&txn.id());
        debug!("Committed {}", txn.id());
        Ok(())
    }

    /// Aborts a transaction, undoing its writes newest first.
    ///
    /// Also used to roll back a transaction the lock manager already marked
    /// ABORTED after it lost a wait-die conflict.
    pub fn abort(&self, txn: &Transaction) -> Result<()> {
        self.check_live(txn)?;
        let state = txn.state();
        if state == TransactionState::Committed {
            return Err(TransactionError::InvalidState(txn.id(), state));
        }
        txn.set_state(TransactionState::Aborted);

        let write_set = txn.write_set();
        for (index, write) in write_set.iter().enumerate().rev() {
            if let Err(e) = Self::undo(txn, write) {
                // Keep what is still to be undone so abort can be retried
                txn.truncate_write_set(index + 1);
                return Err(e);
            }
        }
        txn.take_write_set();

        self.log(txn, LogRecordBody::Abort)?;
        self.flush(txn)?;

        self.lock_manager.unlock_all(txn);
        self.transactions.write().remove(&txn.id());
        debug!("Aborted {} after undoing {} writes", txn.id(), write_set.len());
        Ok(())
    }

    fn undo(txn: &Transaction, write: &WriteRecord) -> Result<()> {
        match (write.kind, &write.old_tuple) {
            (WriteKind::Insert, _) => {
                write.table.apply_delete(write.rid, txn)?;
            }
            (WriteKind::Delete, _) => write.table.rollback_delete(write.rid, txn)?,
            (WriteKind::AppliedDelete, Some(old)) => {
                write.table.reinsert_tuple(old, write.rid, txn)?
            }
            (WriteKind::Update, Some(old)) => write.table.restore_tuple(old, write.rid, txn)?,
            (kind, None) => warn!(
                "{:?} of {} by {} has no before-image",
                kind,
                write.rid,
                txn.id()
            ),
        }
        Ok(())
    }

    /// Gets a live transaction by id.
    pub fn get(&self, id: TransactionId) -> Result<Arc<Transaction>> {
        self.transactions
            .read()
            .get(&id)
            .cloned()
            .ok_or(TransactionError::NotFound(id))
    }

    /// Gets the state of a live transaction.
    pub fn get_state(&self, id: TransactionId) -> Result<TransactionState> {
        Ok(self.get(id)?.state())
    }

    /// Returns the ids of all transactions that have not finished.
    pub fn active_transactions(&self) -> Vec<TransactionId> {
        let mut ids: Vec<_> = self.transactions.read().keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.read().len()
    }

    /// Checks if a transaction exists and can still do work.
    pub fn is_active(&self, id: TransactionId) -> bool {
        self.get_state(id)
            .map(|state| state.is_active())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::TableHeap;
    use crate::storage::buffer::lru::LruReplacer;
    use crate::storage::wal::{LogConfig, LogReader, LogRecordType};
    use crate::storage::{BufferPoolManager, PageManager};
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _dir: TempDir,
        buffer_pool: BufferPoolManager,
        log_manager: Arc<LogManager>,
        manager: TransactionManager,
    }

    fn fixture() -> anyhow::Result<Fixture> {
        let dir = tempdir()?;
        let page_manager = PageManager::create(&dir.path().join("txn.db"))?;
        let log_manager = Arc::new(LogManager::create(
            &dir.path().join("txn.log"),
            LogConfig::default(),
        )?);
        let buffer_pool = BufferPoolManager::with_options(
            page_manager,
            Box::new(LruReplacer::new(16)),
            16,
            16,
            Some(Arc::clone(&log_manager)),
        );
        let manager =
            TransactionManager::new(Arc::new(LockManager::new()), Some(Arc::clone(&log_manager)));
        Ok(Fixture {
            _dir: dir,
            buffer_pool,
            log_manager,
            manager,
        })
    }

    fn create_table(f: &Fixture) -> anyhow::Result<TableHeap> {
        let txn = f.manager.begin()?;
        let table = TableHeap::create(
            f.buffer_pool.clone(),
            Arc::clone(f.manager.lock_manager()),
            &txn,
        )?;
        f.manager.commit(&txn)?;
        Ok(table)
    }

    fn logged_types(log_manager: &LogManager, id: TransactionId) -> anyhow::Result<Vec<LogRecordType>> {
        let mut types = Vec::new();
        for entry in LogReader::new(log_manager) {
            let record = entry?.record;
            if record.txn_id == id {
                types.push(record.record_type());
            }
        }
        Ok(types)
    }

    #[test]
    fn test_begin_logs_and_registers() -> anyhow::Result<()> {
        let f = fixture()?;
        let t1 = f.manager.begin()?;
        let t2 = f.manager.begin()?;

        assert!(t1.id().is_older_than(t2.id()));
        assert_eq!(f.manager.active_transactions(), vec![t1.id(), t2.id()]);
        assert!(t1.prev_lsn().is_valid());
        assert!(f.manager.is_active(t2.id()));
        Ok(())
    }

    #[test]
    fn test_commit_is_durable_and_releases_locks() -> anyhow::Result<()> {
        let f = fixture()?;
        let table = create_table(&f)?;

        let txn = f.manager.begin()?;
        let rid = table.insert_tuple(b"row", &txn)?;
        f.manager.commit(&txn)?;

        assert_eq!(txn.state(), TransactionState::Committed);
        assert!(txn.locked_rids().is_empty());
        assert_eq!(f.manager.lock_manager().row_count(), 0);
        assert_eq!(f.log_manager.persistent_lsn(), txn.prev_lsn());
        assert_eq!(
            logged_types(&f.log_manager, txn.id())?,
            vec![LogRecordType::Begin, LogRecordType::Insert, LogRecordType::Commit]
        );

        // Finished transactions are forgotten
        assert!(matches!(
            f.manager.commit(&txn),
            Err(TransactionError::NotFound(_))
        ));

        let reader = f.manager.begin()?;
        assert_eq!(table.get_tuple(rid, &reader)?.map(|t| t.data), Some(b"row".to_vec()));
        Ok(())
    }

    #[test]
    fn test_commit_applies_deletes() -> anyhow::Result<()> {
        let f = fixture()?;
        let table = create_table(&f)?;

        let writer = f.manager.begin()?;
        let rid = table.insert_tuple(b"doomed", &writer)?;
        f.manager.commit(&writer)?;

        let deleter = f.manager.begin()?;
        assert!(table.mark_delete(rid, &deleter)?);
        f.manager.commit(&deleter)?;

        assert_eq!(
            logged_types(&f.log_manager, deleter.id())?,
            vec![
                LogRecordType::Begin,
                LogRecordType::MarkDelete,
                LogRecordType::ApplyDelete,
                LogRecordType::Commit,
            ]
        );
        let reader = f.manager.begin()?;
        assert!(table.get_tuple(rid, &reader)?.is_none());
        Ok(())
    }

    #[test]
    fn test_abort_undoes_writes() -> anyhow::Result<()> {
        let f = fixture()?;
        let table = create_table(&f)?;

        let setup = f.manager.begin()?;
        let kept = table.insert_tuple(b"original", &setup)?;
        let deleted = table.insert_tuple(b"deleted", &setup)?;
        f.manager.commit(&setup)?;

        let txn = f.manager.begin()?;
        let inserted = table.insert_tuple(b"inserted", &txn)?;
        assert!(table.update_tuple(b"changed", kept, &txn)?);
        assert!(table.mark_delete(deleted, &txn)?);
        f.manager.abort(&txn)?;

        assert_eq!(txn.state(), TransactionState::Aborted);
        assert!(txn.locked_rids().is_empty());
        assert_eq!(txn.write_set_len(), 0);

        let reader = f.manager.begin()?;
        assert!(table.get_tuple(inserted, &reader)?.is_none());
        assert_eq!(
            table.get_tuple(kept, &reader)?.map(|t| t.data),
            Some(b"original".to_vec())
        );
        assert_eq!(
            table.get_tuple(deleted, &reader)?.map(|t| t.data),
            Some(b"deleted".to_vec())
        );
        assert_eq!(
            logged_types(&f.log_manager, txn.id())?.last(),
            Some(&LogRecordType::Abort)
        );
        Ok(())
    }

    #[test]
    fn test_failed_commit_can_still_abort() -> anyhow::Result<()> {
        let f = fixture()?;
        let table = create_table(&f)?;

        let setup = f.manager.begin()?;
        let first = table.insert_tuple(b"first", &setup)?;
        let second = table.insert_tuple(b"second", &setup)?;
        f.manager.commit(&setup)?;

        let txn = f.manager.begin()?;
        assert!(table.mark_delete(first, &txn)?);
        assert!(table.mark_delete(second, &txn)?);
        // Removing `second` behind the commit's back makes its delete fail
        table.apply_delete(second, &txn)?;

        assert!(f.manager.commit(&txn).is_err());
        assert!(f.manager.is_active(txn.id()));
        assert_eq!(txn.write_set_len(), 2);
        assert_eq!(txn.write_set()[0].kind, WriteKind::AppliedDelete);

        f.manager.abort(&txn)?;
        assert!(txn.locked_rids().is_empty());
        assert_eq!(f.manager.transaction_count(), 0);

        let reader = f.manager.begin()?;
        assert_eq!(
            table.get_tuple(first, &reader)?.map(|t| t.data),
            Some(b"first".to_vec())
        );
        Ok(())
    }

    #[test]
    fn test_failed_abort_keeps_remaining_undo() -> anyhow::Result<()> {
        let f = fixture()?;
        let table = create_table(&f)?;

        let setup = f.manager.begin()?;
        let kept = table.insert_tuple(b"original", &setup)?;
        f.manager.commit(&setup)?;

        let txn = f.manager.begin()?;
        let inserted = table.insert_tuple(b"inserted", &txn)?;
        assert!(table.update_tuple(b"changed", kept, &txn)?);
        // With the insert already gone its undo fails
        table.apply_delete(inserted, &txn)?;

        assert!(f.manager.abort(&txn).is_err());
        assert_eq!(txn.write_set_len(), 1);
        assert_eq!(txn.write_set()[0].kind, WriteKind::Insert);
        assert!(txn.is_exclusive_locked(&kept));
        assert_eq!(f.manager.transaction_count(), 1);

        table.reinsert_tuple(b"inserted", inserted, &txn)?;
        f.manager.abort(&txn)?;
        assert!(txn.locked_rids().is_empty());
        assert_eq!(f.manager.transaction_count(), 0);

        let reader = f.manager.begin()?;
        assert!(table.get_tuple(inserted, &reader)?.is_none());
        assert_eq!(
            table.get_tuple(kept, &reader)?.map(|t| t.data),
            Some(b"original".to_vec())
        );
        Ok(())
    }

    #[test]
    fn test_abort_after_losing_wait_die() -> anyhow::Result<()> {
        let f = fixture()?;
        let table = create_table(&f)?;

        let older = f.manager.begin()?;
        let younger = f.manager.begin()?;
        let mine = table.insert_tuple(b"younger's", &younger)?;
        let theirs = table.insert_tuple(b"older's", &older)?;

        // Younger asks for a record older holds and dies
        assert!(table.mark_delete(theirs, &younger).is_err());
        assert_eq!(younger.state(), TransactionState::Aborted);
        assert!(matches!(
            f.manager.commit(&younger),
            Err(TransactionError::InvalidState(_, TransactionState::Aborted))
        ));

        f.manager.abort(&younger)?;
        f.manager.commit(&older)?;

        let reader = f.manager.begin()?;
        assert!(table.get_tuple(mine, &reader)?.is_none());
        assert!(table.get_tuple(theirs, &reader)?.is_some());
        Ok(())
    }

    #[test]
    fn test_unknown_transaction() {
        let manager = TransactionManager::new(Arc::new(LockManager::new()), None);
        let stranger = Transaction::new(TransactionId(999));

        assert!(matches!(
            manager.get_state(TransactionId(999)),
            Err(TransactionError::NotFound(_))
        ));
        assert!(matches!(
            manager.commit(&stranger),
            Err(TransactionError::NotFound(_))
        ));
        assert!(matches!(
            manager.abort(&stranger),
            Err(TransactionError::NotFound(_))
        ));
    }

    #[test]
    fn test_advance_id_past() -> anyhow::Result<()> {
        let manager = TransactionManager::new(Arc::new(LockManager::new()), None);
        manager.advance_id_past(TransactionId(10));
        assert_eq!(manager.next_id(), TransactionId(11));
        assert_eq!(manager.begin()?.id(), TransactionId(11));
        Ok(())
    }

    #[test]
    fn test_transaction_manager_thread_safety() {
        use std::thread;

        let manager = Arc::new(TransactionManager::new(Arc::new(LockManager::new()), None));
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let mgr = Arc::clone(&manager);
                thread::spawn(move || {
                    (0..10)
                        .map(|_| mgr.begin().map(|txn| txn.id()))
                        .collect::<Result<Vec<_>>>()
                })
            })
            .collect();

        let mut all_ids = vec![];
        for handle in handles {
            all_ids.extend(handle.join().unwrap().unwrap());
        }

        let mut unique_ids = all_ids.clone();
        unique_ids.sort();
        unique_ids.dedup();

        assert_eq!(all_ids.len(), 100);
        assert_eq!(unique_ids.len(), 100);
        assert_eq!(manager.transaction_count(), 100);
    }
}
