use parking_lot::Mutex;
use std::collections::HashSet;

use crate::storage::page::RecordId;

pub type TransactionId = u32;
pub const INVALID_TRANSACTION_ID: TransactionId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
}

/// Two-phase locking state machine. `Growing` may acquire; the first
/// lock release under 2PL moves the transaction to `Shrinking`, after which
/// acquisition attempts abort it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

/// A transaction as the lock manager sees it: an id, an isolation level,
/// the 2PL state, and the record locks currently held. State and lock sets
/// sit behind mutexes because waiters and the deadlock detector inspect
/// them from other threads.
#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    isolation_level: IsolationLevel,
    state: Mutex<TransactionState>,
    shared_lock_set: Mutex<HashSet<RecordId>>,
    exclusive_lock_set: Mutex<HashSet<RecordId>>,
}

impl Transaction {
    pub fn new(id: TransactionId, isolation_level: IsolationLevel) -> Self {
        Self {
            id,
            isolation_level,
            state: Mutex::new(TransactionState::Growing),
            shared_lock_set: Mutex::new(HashSet::new()),
            exclusive_lock_set: Mutex::new(HashSet::new()),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: TransactionState) {
        *self.state.lock() = state;
    }

    pub fn is_shared_locked(&self, rid: &RecordId) -> bool {
        self.shared_lock_set.lock().contains(rid)
    }

    pub fn is_exclusive_locked(&self, rid: &RecordId) -> bool {
        self.exclusive_lock_set.lock().contains(rid)
    }

    pub fn shared_lock_count(&self) -> usize {
        self.shared_lock_set.lock().len()
    }

    pub fn exclusive_lock_count(&self) -> usize {
        self.exclusive_lock_set.lock().len()
    }

    /// Every record this transaction currently holds a lock on.
    pub fn locked_records(&self) -> Vec<RecordId> {
        let mut rids: Vec<RecordId> = self.shared_lock_set.lock().iter().copied().collect();
        rids.extend(self.exclusive_lock_set.lock().iter().copied());
        rids
    }

    pub(crate) fn add_shared_lock(&self, rid: RecordId) {
        self.shared_lock_set.lock().insert(rid);
    }

    pub(crate) fn add_exclusive_lock(&self, rid: RecordId) {
        self.exclusive_lock_set.lock().insert(rid);
    }

    pub(crate) fn remove_shared_lock(&self, rid: &RecordId) {
        self.shared_lock_set.lock().remove(rid);
    }

    pub(crate) fn remove_exclusive_lock(&self, rid: &RecordId) {
        self.exclusive_lock_set.lock().remove(rid);
    }

    pub(crate) fn clear_lock_sets(&self) {
        self.shared_lock_set.lock().clear();
        self.exclusive_lock_set.lock().clear();
    }
}
