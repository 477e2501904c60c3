//! ARIES-style crash recovery over the write-ahead log.
//!
//! Runs in three phases:
//! 1. Analysis: scan the log, index records by LSN and find the transactions
//!    that never committed or aborted (the losers)
//! 2. Redo: repeat history, re-applying every change a page has not seen yet
//! 3. Undo: roll the losers back newest first, writing a compensation record
//!    (CLR) for each undone change and an ABORT once a loser reaches BEGIN
//!
//! Page LSNs make redo idempotent and CLRs make undo restartable, so a crash
//! during recovery is handled by simply recovering again.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info, warn};
use thiserror::Error;

use crate::storage::page::table_page::TablePage;
use crate::storage::page::{page_lsn, set_page_lsn, PageId};
use crate::storage::wal::{
    read_record_at, LogManager, LogReadError, LogReader, LogRecord, LogRecordBody, Lsn,
};
use crate::storage::{BufferPoolManager, StorageError, StorageResult};
use crate::transaction::TransactionId;

/// Errors that can occur during recovery.
#[derive(Error, Debug)]
pub enum RecoveryError {
    /// The log cannot be decoded. Recovery stops rather than guess.
    #[error("Corrupt log at offset {offset}: {reason}")]
    CorruptLog { offset: u64, reason: String },

    /// A logged change does not fit the page it names.
    #[error("Cannot replay {lsn} on page {page_id}: {source}")]
    RedoMismatch {
        lsn: Lsn,
        page_id: PageId,
        #[source]
        source: StorageError,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<LogReadError> for RecoveryError {
    fn from(e: LogReadError) -> Self {
        match e {
            LogReadError::Corrupt { offset, source } => RecoveryError::CorruptLog {
                offset,
                reason: source.to_string(),
            },
            LogReadError::Storage(e) => RecoveryError::Storage(e),
        }
    }
}

/// Recovery statistics.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Log records read during analysis.
    pub records_scanned: usize,
    /// Changes redo applied to a page.
    pub records_redone: usize,
    /// Changes rolled back during undo.
    pub records_undone: usize,
    pub clrs_written: usize,
    /// Transactions that were rolled back.
    pub loser_transactions: Vec<TransactionId>,
    /// Highest LSN found in the log.
    pub max_lsn: Lsn,
    /// Highest transaction id found in the log.
    pub max_txn_id: Option<TransactionId>,
}

/// What analysis learns from the log.
#[derive(Debug, Default)]
struct LogAnalysis {
    /// File offset of every record.
    offsets: HashMap<Lsn, u64>,
    /// Unfinished transactions and the LSN of their last record.
    active: HashMap<TransactionId, Lsn>,
    /// Bytes of the log holding complete records.
    valid_len: u64,
}

/// ARIES recovery manager.
pub struct AriesRecovery {
    buffer_pool: BufferPoolManager,
    log_manager: Arc<LogManager>,
}

impl AriesRecovery {
    pub fn new(buffer_pool: BufferPoolManager, log_manager: Arc<LogManager>) -> Self {
        AriesRecovery {
            buffer_pool,
            log_manager,
        }
    }

    /// Perform full recovery and return what was done.
    ///
    /// Must run before any new transaction writes to the log. On return the
    /// log manager hands out LSNs past everything in the log, and every page
    /// touched by recovery has been written back.
    pub fn recover(&self) -> Result<RecoveryStats, RecoveryError> {
        let mut stats = RecoveryStats::default();

        let analysis = self.analysis_phase(&mut stats)?;
        info!(
            "Analysis scanned {} records, {} unfinished transactions",
            stats.records_scanned,
            analysis.active.len()
        );

        if self.log_manager.log_size() > analysis.valid_len {
            warn!(
                "Truncating log from {} to {} bytes",
                self.log_manager.log_size(),
                analysis.valid_len
            );
            self.log_manager.truncate_log(analysis.valid_len)?;
        }
        self.log_manager.set_next_lsn(stats.max_lsn.next());
        self.log_manager.set_persistent_lsn(stats.max_lsn);

        self.redo_phase(&analysis, &mut stats)?;
        info!("Redo applied {} records", stats.records_redone);

        self.undo_phase(&analysis, &mut stats)?;
        info!(
            "Undo rolled back {} records of {} losers",
            stats.records_undone,
            stats.loser_transactions.len()
        );

        self.log_manager.force_flush()?;
        self.buffer_pool.flush_all()?;

        Ok(stats)
    }

    /// Phase 1: index the log and build the active transaction table.
    fn analysis_phase(&self, stats: &mut RecoveryStats) -> Result<LogAnalysis, RecoveryError> {
        let mut analysis = LogAnalysis::default();

        for entry in LogReader::new(&self.log_manager) {
            let entry = entry?;
            let record = &entry.record;
            stats.records_scanned += 1;
            stats.max_lsn = stats.max_lsn.max(record.lsn);
            stats.max_txn_id = stats.max_txn_id.max(Some(record.txn_id));

            analysis.offsets.insert(record.lsn, entry.offset);
            analysis.valid_len = entry.offset + record.size() as u64;

            match record.body {
                LogRecordBody::Commit | LogRecordBody::Abort => {
                    analysis.active.remove(&record.txn_id);
                }
                _ => {
                    analysis.active.insert(record.txn_id, record.lsn);
                }
            }
        }

        Ok(analysis)
    }

    /// Phase 2: repeat history from the start of the log.
    fn redo_phase(&self, analysis: &LogAnalysis, stats: &mut RecoveryStats) -> Result<(), RecoveryError> {
        for entry in LogReader::new(&self.log_manager) {
            let record = entry?.record;
            if self.redo_record(&record, analysis)? {
                stats.records_redone += 1;
            }
        }
        Ok(())
    }

    /// Re-applies one record if its page has not seen it. Returns true if
    /// anything changed.
    fn redo_record(&self, record: &LogRecord, analysis: &LogAnalysis) -> Result<bool, RecoveryError> {
        match &record.body {
            LogRecordBody::Begin | LogRecordBody::Commit | LogRecordBody::Abort => Ok(false),
            LogRecordBody::NewPage {
                prev_page_id,
                page_id,
            } => self.redo_new_page(record.lsn, *prev_page_id, *page_id),
            LogRecordBody::Clr {
                compensated_lsn, ..
            } => {
                let compensated = self.read_record(*compensated_lsn, analysis)?;
                match compensated.rid() {
                    Some(rid) => self.apply(rid.page_id, record.lsn, true, |page| {
                        undo_change(page, &compensated.body)
                    }),
                    None => Ok(false),
                }
            }
            body => match record.rid() {
                Some(rid) => {
                    self.apply(rid.page_id, record.lsn, true, |page| redo_change(page, body))
                }
                None => Ok(false),
            },
        }
    }

    fn redo_new_page(&self, lsn: Lsn, prev_page_id: PageId, page_id: PageId) -> Result<bool, RecoveryError> {
        let formatted = self.apply(page_id, lsn, true, |page| {
            page.init(page_id, prev_page_id);
            Ok(())
        })?;
        let linked = if prev_page_id.is_valid() {
            self.apply(prev_page_id, lsn, true, |page| {
                page.set_next_page_id(page_id);
                Ok(())
            })?
        } else {
            false
        };
        Ok(formatted || linked)
    }

    /// Runs `change` on the table page `page_id` and stamps it with `lsn`.
    /// With `only_if_older`, pages already at or past `lsn` are left alone.
    fn apply<F>(&self, page_id: PageId, lsn: Lsn, only_if_older: bool, change: F) -> Result<bool, RecoveryError>
    where
        F: FnOnce(&mut TablePage<&mut [u8]>) -> StorageResult<()>,
    {
        self.buffer_pool.ensure_page(page_id)?;
        let mut guard = self.buffer_pool.fetch_page_write(page_id)?;
        if only_if_older && page_lsn(&guard[..]) >= lsn {
            return Ok(false);
        }

        change(&mut TablePage::new(&mut guard[..])).map_err(|source| RecoveryError::RedoMismatch {
            lsn,
            page_id,
            source,
        })?;
        set_page_lsn(&mut guard[..], lsn);
        Ok(true)
    }

    fn read_record(&self, lsn: Lsn, analysis: &LogAnalysis) -> Result<LogRecord, RecoveryError> {
        let Some(&offset) = analysis.offsets.get(&lsn) else {
            return Err(RecoveryError::CorruptLog {
                offset: analysis.valid_len,
                reason: format!("{} is referenced but not in the log", lsn),
            });
        };
        Ok(read_record_at(&self.log_manager, offset)?)
    }

    /// Phase 3: roll back every loser, always undoing the newest remaining
    /// record across all of them first.
    fn undo_phase(&self, analysis: &LogAnalysis, stats: &mut RecoveryStats) -> Result<(), RecoveryError> {
        // Next record to undo and last record written, per loser
        let mut undo_next = analysis.active.clone();
        let mut last_lsn = analysis.active.clone();
        stats.loser_transactions = undo_next.keys().copied().collect();
        stats.loser_transactions.sort();

        loop {
            let Some((txn_id, lsn)) = undo_next
                .iter()
                .max_by_key(|(_, lsn)| **lsn)
                .map(|(txn_id, lsn)| (*txn_id, *lsn))
            else {
                break;
            };

            if !lsn.is_valid() {
                self.finish_loser(txn_id, &mut last_lsn)?;
                undo_next.remove(&txn_id);
                continue;
            }

            let record = self.read_record(lsn, analysis)?;
            let next = match &record.body {
                LogRecordBody::Begin => {
                    self.finish_loser(txn_id, &mut last_lsn)?;
                    undo_next.remove(&txn_id);
                    continue;
                }
                LogRecordBody::Clr { undo_next_lsn, .. } => *undo_next_lsn,
                LogRecordBody::Commit | LogRecordBody::Abort | LogRecordBody::NewPage { .. } => {
                    record.prev_lsn
                }
                _ => {
                    self.undo_record(&record, &mut last_lsn)?;
                    stats.records_undone += 1;
                    stats.clrs_written += 1;
                    record.prev_lsn
                }
            };
            undo_next.insert(txn_id, next);
        }

        Ok(())
    }

    /// Rolls back one change and logs its compensation.
    fn undo_record(
        &self,
        record: &LogRecord,
        last_lsn: &mut HashMap<TransactionId, Lsn>,
    ) -> Result<(), RecoveryError> {
        let Some(rid) = record.rid() else {
            return Ok(());
        };
        let prev = last_lsn.get(&record.txn_id).copied().unwrap_or(Lsn::INVALID);
        let mut clr = LogRecord::new(
            record.txn_id,
            prev,
            LogRecordBody::Clr {
                undo_next_lsn: record.prev_lsn,
                compensated_lsn: record.lsn,
            },
        );
        let clr_lsn = self.log_manager.append_log_record(&mut clr)?;
        last_lsn.insert(record.txn_id, clr_lsn);

        debug!("Undoing {} of {} as {}", record.lsn, record.txn_id, clr_lsn);
        self.apply(rid.page_id, clr_lsn, false, |page| undo_change(page, &record.body))?;
        Ok(())
    }

    /// Logs the ABORT that closes a fully rolled back loser.
    fn finish_loser(
        &self,
        txn_id: TransactionId,
        last_lsn: &mut HashMap<TransactionId, Lsn>,
    ) -> Result<(), RecoveryError> {
        let prev = last_lsn.remove(&txn_id).unwrap_or(Lsn::INVALID);
        let mut abort = LogRecord::new(txn_id, prev, LogRecordBody::Abort);
        self.log_manager.append_log_record(&mut abort)?;
        debug!("Rolled back {}", txn_id);
        Ok(())
    }
}

/// Re-applies a logged change to its page.
fn redo_change(page: &mut TablePage<&mut [u8]>, body: &LogRecordBody) -> StorageResult<()> {
    match body {
        LogRecordBody::Insert { rid, tuple } => page.insert_tuple_at(rid.slot, tuple),
        LogRecordBody::MarkDelete { rid, .. } => page.mark_delete(rid.slot),
        LogRecordBody::ApplyDelete { rid, .. } => page.apply_delete(rid.slot).map(|_| ()),
        LogRecordBody::RollbackDelete { rid, .. } => page.rollback_delete(rid.slot),
        LogRecordBody::Update { rid, new_tuple, .. } => {
            page.update_tuple(rid.slot, new_tuple).map(|_| ())
        }
        _ => Ok(()),
    }
}

/// Applies the inverse of a logged change.
fn undo_change(page: &mut TablePage<&mut [u8]>, body: &LogRecordBody) -> StorageResult<()> {
    match body {
        LogRecordBody::Insert { rid, .. } => page.apply_delete(rid.slot).map(|_| ()),
        LogRecordBody::MarkDelete { rid, .. } => page.rollback_delete(rid.slot),
        LogRecordBody::ApplyDelete { rid, tuple } => page.insert_tuple_at(rid.slot, tuple),
        LogRecordBody::RollbackDelete { rid, .. } => page.mark_delete(rid.slot),
        LogRecordBody::Update { rid, old_tuple, .. } => {
            page.update_tuple(rid.slot, old_tuple).map(|_| ())
        }
        _ => Ok(()),
    }
}
