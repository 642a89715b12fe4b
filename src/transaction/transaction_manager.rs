use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::transaction::{
    IsolationLevel, LockManager, Transaction, TransactionId, TransactionState,
};

/// Owns transaction lifetimes: hands out monotonic ids, keeps the registry
/// of live transactions, and releases locks at commit/abort so waiters on
/// the lock manager resume.
#[derive(Debug)]
pub struct TransactionManager {
    next_txn_id: AtomicU32,
    lock_manager: Arc<LockManager>,
    txns: Mutex<HashMap<TransactionId, Arc<Transaction>>>,
}

impl TransactionManager {
    pub fn new(lock_manager: Arc<LockManager>) -> Self {
        Self {
            next_txn_id: AtomicU32::new(1),
            lock_manager,
            txns: Mutex::new(HashMap::new()),
        }
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    pub fn begin(&self, isolation_level: IsolationLevel) -> Arc<Transaction> {
        let id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let txn = Arc::new(Transaction::new(id, isolation_level));
        self.txns.lock().insert(id, txn.clone());
        debug!("begin txn {} at {:?}", id, isolation_level);
        txn
    }

    pub fn get_transaction(&self, txn_id: TransactionId) -> Option<Arc<Transaction>> {
        self.txns.lock().get(&txn_id).cloned()
    }

    pub fn active_count(&self) -> usize {
        self.txns.lock().len()
    }

    /// Strict 2PL: all locks are held to the commit point and released here.
    pub fn commit(&self, txn: &Arc<Transaction>) {
        self.lock_manager.release_all_locks(txn);
        txn.set_state(TransactionState::Committed);
        self.txns.lock().remove(&txn.id());
        debug!("commit txn {}", txn.id());
    }

    /// Roll back: the state flips first so any concurrent lock call by this
    /// transaction observes the abort, then the locks go.
    pub fn abort(&self, txn: &Arc<Transaction>) {
        txn.set_state(TransactionState::Aborted);
        self.lock_manager.release_all_locks(txn);
        self.txns.lock().remove(&txn.id());
        debug!("abort txn {}", txn.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::RecordId;

    #[test]
    fn begin_assigns_monotonic_ids() {
        let manager = TransactionManager::new(Arc::new(LockManager::new()));
        let t1 = manager.begin(IsolationLevel::RepeatableRead);
        let t2 = manager.begin(IsolationLevel::ReadCommitted);
        assert!(t2.id() > t1.id());
        assert_eq!(manager.active_count(), 2);
    }

    #[test]
    fn commit_releases_locks_and_unregisters() {
        let lock_manager = Arc::new(LockManager::new());
        let manager = TransactionManager::new(lock_manager.clone());
        let txn = manager.begin(IsolationLevel::RepeatableRead);
        let rid = RecordId::new(1, 1);

        assert!(lock_manager.lock_exclusive(&txn, rid).unwrap());
        manager.commit(&txn);

        assert_eq!(txn.state(), TransactionState::Committed);
        assert_eq!(txn.exclusive_lock_count(), 0);
        assert!(manager.get_transaction(txn.id()).is_none());

        // The record is free for the next transaction.
        let other = manager.begin(IsolationLevel::RepeatableRead);
        assert!(lock_manager.lock_exclusive(&other, rid).unwrap());
    }

    #[test]
    fn abort_releases_locks() {
        let lock_manager = Arc::new(LockManager::new());
        let manager = TransactionManager::new(lock_manager.clone());
        let txn = manager.begin(IsolationLevel::RepeatableRead);
        let rid = RecordId::new(2, 2);

        assert!(lock_manager.lock_shared(&txn, rid).unwrap());
        manager.abort(&txn);
        assert_eq!(txn.state(), TransactionState::Aborted);
        assert_eq!(txn.shared_lock_count(), 0);
    }
}
