//! Record lock manager: two-phase locking with wait-die deadlock prevention.
//!
//! Each record has its own lock row (granted set, wait queue, upgrade slot)
//! guarded by its own mutex, so waiting on one record never blocks requests
//! on another. A request that would have to wait for an older transaction
//! aborts its own transaction instead ("dies") and returns false without
//! blocking; only older transactions ever wait for younger ones.

use crate::access::Rid;
use crate::transaction::{Transaction, TransactionId, TransactionState};
use dashmap::DashMap;
use log::debug;
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeSet;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl LockMode {
    pub fn is_compatible_with(&self, other: &LockMode) -> bool {
        matches!((self, other), (LockMode::Shared, LockMode::Shared))
    }
}

#[derive(Debug, Default)]
struct RowState {
    granted: Vec<(TransactionId, LockMode)>,
    /// Waiting requesters; the first (smallest) id is the oldest.
    wait_queue: BTreeSet<TransactionId>,
    /// At most one shared holder waits here to become exclusive.
    upgrading: Option<TransactionId>,
}

impl RowState {
    fn is_idle(&self) -> bool {
        self.granted.is_empty() && self.wait_queue.is_empty() && self.upgrading.is_none()
    }

    fn can_grant(&self, mode: LockMode) -> bool {
        match mode {
            LockMode::Shared => {
                self.upgrading.is_none()
                    && self.granted.iter().all(|(_, held)| held.is_compatible_with(&mode))
            }
            LockMode::Exclusive => self.granted.is_empty(),
        }
    }

    /// The oldest transaction `id` would have to wait for, if any is older
    /// than `id` itself.
    fn older_blocker(&self, id: TransactionId, mode: LockMode) -> Option<TransactionId> {
        let holders = self
            .granted
            .iter()
            .filter(|(holder, held)| *holder != id && !(mode.is_compatible_with(held)))
            .map(|(holder, _)| *holder);
        let upgrader = self.upgrading.filter(|&upgrader| upgrader != id);
        let queue_head = self.wait_queue.first().copied();

        holders
            .chain(upgrader)
            .chain(queue_head)
            .filter(|other| other.is_older_than(id))
            .min()
    }
}

#[derive(Debug, Default)]
struct LockRow {
    state: Mutex<RowState>,
    cond: Condvar,
}

#[derive(Debug, Default)]
pub struct LockManager {
    rows: DashMap<Rid, Arc<LockRow>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn row(&self, rid: Rid) -> Arc<LockRow> {
        Arc::clone(self.rows.entry(rid).or_default().value())
    }

    /// Checks that `txn` may acquire locks. Locking while SHRINKING breaks
    /// two-phase locking and aborts the transaction.
    fn check_growing(txn: &Transaction) -> bool {
        match txn.state() {
            TransactionState::Growing => true,
            TransactionState::Shrinking => {
                debug!("{} requested a lock while shrinking, aborting", txn.id());
                txn.set_state(TransactionState::Aborted);
                false
            }
            TransactionState::Committed | TransactionState::Aborted => false,
        }
    }

    fn die(txn: &Transaction, rid: Rid, blocker: TransactionId) -> bool {
        debug!(
            "{} dies requesting {} held or awaited by older {}",
            txn.id(),
            rid,
            blocker
        );
        txn.set_state(TransactionState::Aborted);
        false
    }

    pub fn lock_shared(&self, txn: &Transaction, rid: Rid) -> bool {
        if !Self::check_growing(txn) {
            return false;
        }
        if txn.is_shared_locked(&rid) || txn.is_exclusive_locked(&rid) {
            return true;
        }
        if !self.acquire(txn, rid, LockMode::Shared) {
            return false;
        }
        txn.add_shared_lock(rid);
        true
    }

    /// Takes an exclusive lock. A transaction that already holds the shared
    /// lock is upgraded instead.
    pub fn lock_exclusive(&self, txn: &Transaction, rid: Rid) -> bool {
        if !Self::check_growing(txn) {
            return false;
        }
        if txn.is_exclusive_locked(&rid) {
            return true;
        }
        if txn.is_shared_locked(&rid) {
            return self.lock_upgrade(txn, rid);
        }
        if !self.acquire(txn, rid, LockMode::Exclusive) {
            return false;
        }
        txn.add_exclusive_lock(rid);
        true
    }

    fn acquire(&self, txn: &Transaction, rid: Rid, mode: LockMode) -> bool {
        let id = txn.id();
        let row = self.row(rid);
        let mut state = row.state.lock();

        let immediate = match mode {
            // An all-shared row admits readers even with writers queued
            LockMode::Shared => state.can_grant(mode),
            LockMode::Exclusive => state.wait_queue.is_empty() && state.can_grant(mode),
        };
        if immediate {
            state.granted.push((id, mode));
            return true;
        }
        if let Some(blocker) = state.older_blocker(id, mode) {
            return Self::die(txn, rid, blocker);
        }

        state.wait_queue.insert(id);
        while state.wait_queue.first() != Some(&id) || !state.can_grant(mode) {
            row.cond.wait(&mut state);
        }
        state.wait_queue.remove(&id);
        state.granted.push((id, mode));

        // The next waiter may be compatible with this grant
        row.cond.notify_all();
        true
    }

    /// Turns the shared lock `txn` holds on `rid` into an exclusive one.
    pub fn lock_upgrade(&self, txn: &Transaction, rid: Rid) -> bool {
        if !Self::check_growing(txn) {
            return false;
        }
        if txn.is_exclusive_locked(&rid) {
            return true;
        }
        if !txn.is_shared_locked(&rid) {
            debug!("{} cannot upgrade {} without a shared lock", txn.id(), rid);
            return false;
        }

        let id = txn.id();
        let row = self.row(rid);
        let mut state = row.state.lock();

        if let Some(upgrader) = state.upgrading {
            return Self::die(txn, rid, upgrader);
        }
        let older_holder = state
            .granted
            .iter()
            .map(|(holder, _)| *holder)
            .filter(|holder| holder.is_older_than(id))
            .min();
        if let Some(holder) = older_holder {
            return Self::die(txn, rid, holder);
        }

        state.upgrading = Some(id);
        while state.granted.iter().any(|(holder, _)| *holder != id) {
            row.cond.wait(&mut state);
        }
        state.upgrading = None;
        for (holder, mode) in state.granted.iter_mut() {
            if *holder == id {
                *mode = LockMode::Exclusive;
            }
        }
        drop(state);

        txn.add_exclusive_lock(rid);
        true
    }

    /// Releases the lock `txn` holds on `rid` and wakes every waiter on that
    /// record. A GROWING transaction moves to SHRINKING.
    pub fn unlock(&self, txn: &Transaction, rid: Rid) -> bool {
        let Some(row) = self.rows.get(&rid).map(|row| Arc::clone(row.value())) else {
            return false;
        };

        let released = {
            let mut state = row.state.lock();
            let before = state.granted.len();
            state.granted.retain(|(holder, _)| *holder != txn.id());
            let released = state.granted.len() != before;
            if released {
                row.cond.notify_all();
            }
            released
        };
        drop(row);

        if !released {
            return false;
        }
        if txn.state() == TransactionState::Growing {
            txn.set_state(TransactionState::Shrinking);
        }
        txn.remove_lock(&rid);

        // Only the map holds the row now, so nobody can be about to use it
        self.rows
            .remove_if(&rid, |_, row| Arc::strong_count(row) == 1 && row.state.lock().is_idle());
        true
    }

    /// Releases every lock `txn` holds. Used at commit and abort.
    pub fn unlock_all(&self, txn: &Transaction) {
        for rid in txn.locked_rids() {
            self.unlock(txn, rid);
        }
    }

    /// Number of records with a lock row, held or awaited.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}
