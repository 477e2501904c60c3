//! Table heap: a table stored as a doubly linked chain of table pages.
//!
//! Every change takes the record lock it needs, is logged before the page
//! latch is released, stamps the page with the record's LSN, and is added to
//! the transaction's write set so commit and abort can finish or undo it.

use crate::access::tuple::{Rid, Tuple};
use crate::concurrency::LockManager;
use crate::storage::page::table_page::{TablePage, MAX_TUPLE_SIZE, SLOT_SIZE};
use crate::storage::page::{set_page_lsn, PageId};
use crate::storage::wal::{LogRecord, LogRecordBody};
use crate::storage::{BufferPoolManager, StorageError};
use crate::transaction::{Transaction, TransactionError, WriteKind, WriteRecord};
use anyhow::{bail, Result};
use log::debug;
use std::sync::Arc;

#[derive(Clone)]
pub struct TableHeap {
    buffer_pool: BufferPoolManager,
    lock_manager: Arc<LockManager>,
    first_page_id: PageId,
}

impl TableHeap {
    /// Creates a table with one empty page.
    pub fn create(
        buffer_pool: BufferPoolManager,
        lock_manager: Arc<LockManager>,
        txn: &Transaction,
    ) -> Result<Self> {
        let (first_page_id, mut guard) = buffer_pool.new_page()?;
        TablePage::new(&mut guard[..]).init(first_page_id, PageId::INVALID);

        let heap = Self {
            buffer_pool,
            lock_manager,
            first_page_id,
        };
        heap.log_change(
            txn,
            &mut guard[..],
            LogRecordBody::NewPage {
                prev_page_id: PageId::INVALID,
                page_id: first_page_id,
            },
        )?;
        Ok(heap)
    }

    /// Opens an existing table starting at `first_page_id`.
    pub fn open(
        buffer_pool: BufferPoolManager,
        lock_manager: Arc<LockManager>,
        first_page_id: PageId,
    ) -> Self {
        Self {
            buffer_pool,
            lock_manager,
            first_page_id,
        }
    }

    pub fn first_page_id(&self) -> PageId {
        self.first_page_id
    }

    /// Appends a log record for `txn` and stamps its LSN into `page`. Does
    /// nothing when the buffer pool runs without a log.
    fn log_change(&self, txn: &Transaction, page: &mut [u8], body: LogRecordBody) -> Result<()> {
        if let Some(log_manager) = self.buffer_pool.log_manager() {
            let mut record = LogRecord::new(txn.id(), txn.prev_lsn(), body);
            let lsn = log_manager.append_log_record(&mut record)?;
            txn.set_prev_lsn(lsn);
            set_page_lsn(page, lsn);
        }
        Ok(())
    }

    fn aborted(txn: &Transaction) -> anyhow::Error {
        TransactionError::Aborted(txn.id()).into()
    }

    fn lock_exclusive(&self, txn: &Transaction, rid: Rid) -> Result<()> {
        if !self.lock_manager.lock_exclusive(txn, rid) {
            return Err(Self::aborted(txn));
        }
        Ok(())
    }

    /// Inserts `data` into the first page with room, growing the chain when
    /// every page is full.
    pub fn insert_tuple(&self, data: &[u8], txn: &Transaction) -> Result<Rid> {
        if data.is_empty() {
            bail!("Cannot insert an empty tuple");
        }
        if data.len() > MAX_TUPLE_SIZE {
            bail!(
                "Tuple of {} bytes exceeds the maximum of {}",
                data.len(),
                MAX_TUPLE_SIZE
            );
        }
        if !txn.state().is_active() {
            return Err(Self::aborted(txn));
        }

        let mut guard = self.buffer_pool.fetch_page_write(self.first_page_id)?;
        loop {
            let (fits, next_page_id) = {
                let page = TablePage::new(&guard[..]);
                (page.free_space() >= data.len() + SLOT_SIZE, page.next_page_id())
            };
            if fits {
                break;
            }

            if next_page_id.is_valid() {
                guard = self.buffer_pool.fetch_page_write(next_page_id)?;
                continue;
            }

            let prev_page_id = guard.page_id();
            let (page_id, mut new_guard) = self.buffer_pool.new_page()?;
            TablePage::new(&mut new_guard[..]).init(page_id, prev_page_id);
            TablePage::new(&mut guard[..]).set_next_page_id(page_id);
            self.log_change(
                txn,
                &mut new_guard[..],
                LogRecordBody::NewPage {
                    prev_page_id,
                    page_id,
                },
            )?;
            set_page_lsn(&mut guard[..], txn.prev_lsn());
            debug!("Table {} grew page {} after {}", self.first_page_id, page_id, prev_page_id);
            guard = new_guard;
        }

        let slot = TablePage::new(&mut guard[..]).insert_tuple(data)?;
        let rid = Rid::new(guard.page_id(), slot);
        // Nobody else can reach the slot while the page latch is held, so the
        // lock is granted without waiting and before any reader sees the tuple
        if let Err(e) = self.lock_exclusive(txn, rid) {
            TablePage::new(&mut guard[..]).apply_delete(slot)?;
            return Err(e);
        }
        self.log_change(
            txn,
            &mut guard[..],
            LogRecordBody::Insert {
                rid,
                tuple: data.to_vec(),
            },
        )?;
        drop(guard);

        txn.push_write(WriteRecord {
            rid,
            kind: WriteKind::Insert,
            old_tuple: None,
            table: self.clone(),
        });
        Ok(rid)
    }

    /// Delete-marks the tuple at `rid`. The space is reclaimed when the
    /// transaction commits. Returns false if there is no live tuple there.
    pub fn mark_delete(&self, rid: Rid, txn: &Transaction) -> Result<bool> {
        self.lock_exclusive(txn, rid)?;

        let mut guard = self.buffer_pool.fetch_page_write(rid.page_id)?;
        let tuple = {
            let mut page = TablePage::new(&mut guard[..]);
            let tuple = match page.get_tuple(rid.slot) {
                Ok(tuple) => tuple.to_vec(),
                Err(StorageError::InvalidSlot { .. }) => return Ok(false),
                Err(e) => return Err(e.into()),
            };
            page.mark_delete(rid.slot)?;
            tuple
        };
        self.log_change(txn, &mut guard[..], LogRecordBody::MarkDelete { rid, tuple })?;
        drop(guard);

        txn.push_write(WriteRecord {
            rid,
            kind: WriteKind::Delete,
            old_tuple: None,
            table: self.clone(),
        });
        Ok(true)
    }

    /// Replaces the tuple at `rid` in place. Returns false if there is no live
    /// tuple there or the page lacks room for the new image.
    pub fn update_tuple(&self, data: &[u8], rid: Rid, txn: &Transaction) -> Result<bool> {
        if data.is_empty() {
            bail!("Cannot update to an empty tuple");
        }
        self.lock_exclusive(txn, rid)?;

        let mut guard = self.buffer_pool.fetch_page_write(rid.page_id)?;
        let old_tuple = match TablePage::new(&mut guard[..]).update_tuple(rid.slot, data) {
            Ok(old) => old,
            Err(StorageError::InvalidSlot { .. } | StorageError::PageFull { .. }) => {
                return Ok(false)
            }
            Err(e) => return Err(e.into()),
        };
        self.log_change(
            txn,
            &mut guard[..],
            LogRecordBody::Update {
                rid,
                old_tuple: old_tuple.clone(),
                new_tuple: data.to_vec(),
            },
        )?;
        drop(guard);

        txn.push_write(WriteRecord {
            rid,
            kind: WriteKind::Update,
            old_tuple: Some(old_tuple),
            table: self.clone(),
        });
        Ok(true)
    }

    /// Physically removes the tuple at `rid`. Called at commit for
    /// delete-marked tuples and on abort to take back an insert; the caller
    /// already holds the exclusive lock.
    pub fn apply_delete(&self, rid: Rid, txn: &Transaction) -> Result<Vec<u8>> {
        let mut guard = self.buffer_pool.fetch_page_write(rid.page_id)?;
        let tuple = TablePage::new(&mut guard[..]).apply_delete(rid.slot)?;
        self.log_change(
            txn,
            &mut guard[..],
            LogRecordBody::ApplyDelete {
                rid,
                tuple: tuple.clone(),
            },
        )?;
        Ok(tuple)
    }

    /// Puts a physically deleted tuple back into its slot as a live tuple.
    /// Used on abort after commit already removed it.
    pub fn reinsert_tuple(&self, data: &[u8], rid: Rid, txn: &Transaction) -> Result<()> {
        let mut guard = self.buffer_pool.fetch_page_write(rid.page_id)?;
        TablePage::new(&mut guard[..]).insert_tuple_at(rid.slot, data)?;
        self.log_change(
            txn,
            &mut guard[..],
            LogRecordBody::Insert {
                rid,
                tuple: data.to_vec(),
            },
        )
    }

    /// Clears a delete mark set by this transaction. Used on abort.
    pub fn rollback_delete(&self, rid: Rid, txn: &Transaction) -> Result<()> {
        let mut guard = self.buffer_pool.fetch_page_write(rid.page_id)?;
        let tuple = {
            let mut page = TablePage::new(&mut guard[..]);
            page.rollback_delete(rid.slot)?;
            page.get_tuple_any(rid.slot)?.to_vec()
        };
        self.log_change(txn, &mut guard[..], LogRecordBody::RollbackDelete { rid, tuple })
    }

    /// Puts back the before-image of an update. Used on abort.
    pub fn restore_tuple(&self, old_tuple: &[u8], rid: Rid, txn: &Transaction) -> Result<()> {
        let mut guard = self.buffer_pool.fetch_page_write(rid.page_id)?;
        let current = TablePage::new(&mut guard[..]).update_tuple(rid.slot, old_tuple)?;
        self.log_change(
            txn,
            &mut guard[..],
            LogRecordBody::Update {
                rid,
                old_tuple: current,
                new_tuple: old_tuple.to_vec(),
            },
        )
    }

    /// Reads the live tuple at `rid` under a shared lock.
    pub fn get_tuple(&self, rid: Rid, txn: &Transaction) -> Result<Option<Tuple>> {
        if !self.lock_manager.lock_shared(txn, rid) {
            return Err(Self::aborted(txn));
        }

        let guard = self.buffer_pool.fetch_page_read(rid.page_id)?;
        match TablePage::new(&guard[..]).get_tuple(rid.slot) {
            Ok(data) => Ok(Some(Tuple::new(rid, data.to_vec()))),
            Err(StorageError::InvalidSlot { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Scans every live tuple in page order.
    pub fn iter<'a>(&'a self, txn: &'a Transaction) -> TableIterator<'a> {
        TableIterator {
            heap: self,
            txn,
            page_id: self.first_page_id,
            next_slot: 0,
        }
    }
}

/// Scan over a table heap. Each returned tuple is read under a shared lock.
pub struct TableIterator<'a> {
    heap: &'a TableHeap,
    txn: &'a Transaction,
    page_id: PageId,
    next_slot: u32,
}

impl TableIterator<'_> {
    /// Next occupied slot at or after the cursor, moving across pages.
    fn advance(&mut self) -> Result<Option<Rid>> {
        while self.page_id.is_valid() {
            let guard = self.heap.buffer_pool.fetch_page_read(self.page_id)?;
            let page = TablePage::new(&guard[..]);
            let found = (self.next_slot..page.tuple_count()).find(|&slot| page.tuple_size(slot) > 0);
            match found {
                Some(slot) => {
                    self.next_slot = slot + 1;
                    return Ok(Some(Rid::new(self.page_id, slot)));
                }
                None => {
                    self.page_id = page.next_page_id();
                    self.next_slot = 0;
                }
            }
        }
        Ok(None)
    }
}

impl Iterator for TableIterator<'_> {
    type Item = Result<Tuple>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let rid = match self.advance() {
                Ok(Some(rid)) => rid,
                Ok(None) => return None,
                Err(e) => {
                    self.page_id = PageId::INVALID;
                    return Some(Err(e));
                }
            };
            // Deleted between the scan and the locked read
            match self.heap.get_tuple(rid, self.txn) {
                Ok(Some(tuple)) => return Some(Ok(tuple)),
                Ok(None) => continue,
                Err(e) => {
                    self.page_id = PageId::INVALID;
                    return Some(Err(e));
                }
            }
        }
    }
}
