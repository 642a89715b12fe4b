use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::config::LockManagerConfig;
use crate::error::{AbortReason, VellumError, VellumResult};
use crate::storage::page::RecordId;
use crate::transaction::{IsolationLevel, Transaction, TransactionId, TransactionState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug)]
struct LockRequest {
    txn: Arc<Transaction>,
    mode: LockMode,
    granted: bool,
}

/// FIFO request list for one record. Each queue owns a condvar, but every
/// wait happens on the manager's single table mutex.
#[derive(Debug)]
struct LockRequestQueue {
    requests: VecDeque<LockRequest>,
    upgrading: bool,
    condvar: Arc<Condvar>,
}

impl Default for LockRequestQueue {
    fn default() -> Self {
        Self {
            requests: VecDeque::new(),
            upgrading: false,
            condvar: Arc::new(Condvar::new()),
        }
    }
}

type LockTable = HashMap<RecordId, LockRequestQueue>;

/// Record-granular two-phase lock manager.
///
/// Grants are FIFO per record: a shared request waits behind any earlier
/// ungranted or exclusive request even when it would be compatible, so a
/// stream of readers cannot starve a writer. Queue entries are created on
/// first use and persist for the process lifetime.
#[derive(Debug, Default)]
pub struct LockManager {
    table: Mutex<LockTable>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a shared lock on `rid`, blocking until it is grantable.
    ///
    /// Aborts the transaction (with an error) when it is past its growing
    /// phase, runs under READ_UNCOMMITTED, or is chosen as a deadlock
    /// victim while waiting.
    pub fn lock_shared(&self, txn: &Arc<Transaction>, rid: RecordId) -> VellumResult<bool> {
        let mut table = self.table.lock();
        Self::check_lockable(txn)?;
        if txn.isolation_level() == IsolationLevel::ReadUncommitted {
            // Dirty reads take no shared locks; asking for one is a bug in
            // the caller and poisons the transaction.
            txn.set_state(TransactionState::Aborted);
            return Err(VellumError::TransactionAborted {
                txn_id: txn.id(),
                reason: AbortReason::LockSharedOnReadUncommitted,
            });
        }
        if txn.is_shared_locked(&rid) || txn.is_exclusive_locked(&rid) {
            return Ok(true);
        }

        let condvar = {
            let queue = table.entry(rid).or_default();
            queue.requests.push_back(LockRequest {
                txn: txn.clone(),
                mode: LockMode::Shared,
                granted: false,
            });
            queue.condvar.clone()
        };
        trace!("txn {} requests S on {}", txn.id(), rid);

        loop {
            {
                let queue = table
                    .get_mut(&rid)
                    .expect("queue exists while a request is pending");
                if Self::shared_grantable(queue, txn.id()) {
                    let request = queue
                        .requests
                        .iter_mut()
                        .find(|r| r.txn.id() == txn.id() && !r.granted)
                        .expect("pending request present");
                    request.granted = true;
                    txn.add_shared_lock(rid);
                    trace!("txn {} granted S on {}", txn.id(), rid);
                    condvar.notify_all();
                    return Ok(true);
                }
            }
            condvar.wait(&mut table);
            self.check_still_alive(&mut table, txn, rid, &condvar)?;
        }
    }

    /// Take an exclusive lock on `rid`; granted only at the queue head.
    pub fn lock_exclusive(&self, txn: &Arc<Transaction>, rid: RecordId) -> VellumResult<bool> {
        let mut table = self.table.lock();
        Self::check_lockable(txn)?;
        if txn.is_exclusive_locked(&rid) {
            return Ok(true);
        }

        let condvar = {
            let queue = table.entry(rid).or_default();
            queue.requests.push_back(LockRequest {
                txn: txn.clone(),
                mode: LockMode::Exclusive,
                granted: false,
            });
            queue.condvar.clone()
        };
        trace!("txn {} requests X on {}", txn.id(), rid);
        self.wait_for_exclusive(&mut table, txn, rid, &condvar)
    }

    /// Upgrade a held shared lock to exclusive. Returns `Ok(false)` when the
    /// transaction holds no granted shared lock on `rid`; a concurrent
    /// upgrade on the same queue aborts with `UpgradeConflict`.
    pub fn lock_upgrade(&self, txn: &Arc<Transaction>, rid: RecordId) -> VellumResult<bool> {
        let mut table = self.table.lock();
        Self::check_lockable(txn)?;

        let condvar = {
            let Some(queue) = table.get_mut(&rid) else {
                return Ok(false);
            };
            let Some(position) = queue
                .requests
                .iter()
                .position(|r| r.txn.id() == txn.id() && r.granted && r.mode == LockMode::Shared)
            else {
                return Ok(false);
            };
            if queue.upgrading {
                txn.set_state(TransactionState::Aborted);
                return Err(VellumError::TransactionAborted {
                    txn_id: txn.id(),
                    reason: AbortReason::UpgradeConflict,
                });
            }
            queue.upgrading = true;
            // The request turns into an ungranted exclusive one and moves to
            // the tail, keeping FIFO order for requests that arrived since.
            let mut request = queue
                .requests
                .remove(position)
                .expect("position is in bounds");
            request.mode = LockMode::Exclusive;
            request.granted = false;
            queue.requests.push_back(request);
            txn.remove_shared_lock(&rid);
            // The head may have become grantable for an earlier waiter.
            queue.condvar.notify_all();
            queue.condvar.clone()
        };
        debug!("txn {} upgrading S to X on {}", txn.id(), rid);

        let result = self.wait_for_exclusive(&mut table, txn, rid, &condvar);
        if let Some(queue) = table.get_mut(&rid) {
            queue.upgrading = false;
        }
        result
    }

    /// Release a held lock. Under READ_COMMITTED a shared release does not
    /// shrink the transaction; every other release moves a growing
    /// transaction to SHRINKING (2PL).
    pub fn unlock(&self, txn: &Arc<Transaction>, rid: RecordId) -> bool {
        let mut table = self.table.lock();
        let shared = txn.is_shared_locked(&rid);
        let exclusive = txn.is_exclusive_locked(&rid);
        if !shared && !exclusive {
            return false;
        }

        if txn.isolation_level() == IsolationLevel::ReadCommitted && shared {
            txn.remove_shared_lock(&rid);
            Self::remove_requests(&mut table, &rid, txn.id());
            Self::notify_queue(&table, &rid);
            trace!("txn {} early-released S on {}", txn.id(), rid);
            return true;
        }

        if txn.state() == TransactionState::Growing {
            txn.set_state(TransactionState::Shrinking);
        }
        if shared {
            txn.remove_shared_lock(&rid);
        } else {
            txn.remove_exclusive_lock(&rid);
        }
        Self::remove_requests(&mut table, &rid, txn.id());
        Self::notify_queue(&table, &rid);
        trace!("txn {} released {} ", txn.id(), rid);
        true
    }

    /// Drop every request of `txn` (granted or pending) and wake the
    /// affected queues. Used by commit and abort.
    pub fn release_all_locks(&self, txn: &Arc<Transaction>) {
        let mut table = self.table.lock();
        for queue in table.values_mut() {
            let before = queue.requests.len();
            queue.requests.retain(|r| r.txn.id() != txn.id());
            if queue.requests.len() != before {
                queue.condvar.notify_all();
            }
        }
        txn.clear_lock_sets();
    }

    /// Spawn the background cycle detector. Dropping the handle stops it.
    pub fn start_deadlock_detection(self: &Arc<Self>, config: LockManagerConfig) -> DeadlockDetector {
        let lock_manager = Arc::clone(self);
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let handle = thread::spawn(move || {
            while flag.load(Ordering::SeqCst) {
                thread::sleep(config.cycle_detection_interval);
                if !flag.load(Ordering::SeqCst) {
                    break;
                }
                lock_manager.run_cycle_detection();
            }
        });
        DeadlockDetector {
            running,
            handle: Some(handle),
        }
    }

    /// One detector pass: build the wait-for graph, abort the smallest-id
    /// member of the first cycle found, and wake every queue so the victim's
    /// blocked call observes the abort.
    pub fn run_cycle_detection(&self) {
        let table = self.table.lock();
        let waits_for = Self::build_waits_for(&table);
        let Some(victim_id) = Self::find_cycle_victim(&waits_for) else {
            return;
        };
        warn!("deadlock detected, aborting victim transaction {}", victim_id);
        'find: for queue in table.values() {
            for request in &queue.requests {
                if request.txn.id() == victim_id {
                    request.txn.set_state(TransactionState::Aborted);
                    break 'find;
                }
            }
        }
        for queue in table.values() {
            queue.condvar.notify_all();
        }
    }

    /// Waiter -> holders edges. Each queue contributes edges from its (at
    /// most one relevant) ungranted request to every granted holder.
    fn build_waits_for(table: &LockTable) -> BTreeMap<TransactionId, Vec<TransactionId>> {
        let mut graph: BTreeMap<TransactionId, Vec<TransactionId>> = BTreeMap::new();
        for queue in table.values() {
            let holders: Vec<TransactionId> = queue
                .requests
                .iter()
                .filter(|r| r.granted)
                .map(|r| r.txn.id())
                .collect();
            if let Some(waiter) = queue.requests.iter().find(|r| !r.granted) {
                let waiter_id = waiter.txn.id();
                graph
                    .entry(waiter_id)
                    .or_default()
                    .extend(holders.iter().copied().filter(|&h| h != waiter_id));
            }
        }
        for edges in graph.values_mut() {
            edges.sort_unstable();
            edges.dedup();
        }
        graph
    }

    /// Deterministic search: components are entered at their lowest id and
    /// neighbors expand in ascending order; the victim is the smallest id on
    /// the detected cycle.
    fn find_cycle_victim(
        graph: &BTreeMap<TransactionId, Vec<TransactionId>>,
    ) -> Option<TransactionId> {
        let mut visited = HashSet::new();
        for &start in graph.keys() {
            if visited.contains(&start) {
                continue;
            }
            visited.insert(start);
            let mut path = vec![start];
            let mut on_path: HashSet<TransactionId> = HashSet::from([start]);
            if let Some(victim) = Self::dfs(graph, start, &mut visited, &mut path, &mut on_path) {
                return Some(victim);
            }
        }
        None
    }

    fn dfs(
        graph: &BTreeMap<TransactionId, Vec<TransactionId>>,
        node: TransactionId,
        visited: &mut HashSet<TransactionId>,
        path: &mut Vec<TransactionId>,
        on_path: &mut HashSet<TransactionId>,
    ) -> Option<TransactionId> {
        if let Some(neighbors) = graph.get(&node) {
            for &next in neighbors {
                if on_path.contains(&next) {
                    let entry = path
                        .iter()
                        .position(|&t| t == next)
                        .expect("on_path member is on the path");
                    return path[entry..].iter().copied().min();
                }
                if !visited.contains(&next) {
                    visited.insert(next);
                    path.push(next);
                    on_path.insert(next);
                    if let Some(victim) = Self::dfs(graph, next, visited, path, on_path) {
                        return Some(victim);
                    }
                    on_path.remove(&next);
                    path.pop();
                }
            }
        }
        None
    }

    /// Grant-and-wait for an exclusive request, shared by `lock_exclusive`
    /// and `lock_upgrade`, all under the single held table mutex.
    fn wait_for_exclusive(
        &self,
        table: &mut MutexGuard<'_, LockTable>,
        txn: &Arc<Transaction>,
        rid: RecordId,
        condvar: &Arc<Condvar>,
    ) -> VellumResult<bool> {
        loop {
            {
                let queue = table
                    .get_mut(&rid)
                    .expect("queue exists while a request is pending");
                let head_is_mine = queue
                    .requests
                    .front()
                    .map(|r| r.txn.id() == txn.id() && r.mode == LockMode::Exclusive)
                    .unwrap_or(false);
                if head_is_mine {
                    let request = queue.requests.front_mut().expect("head exists");
                    request.granted = true;
                    txn.add_exclusive_lock(rid);
                    trace!("txn {} granted X on {}", txn.id(), rid);
                    condvar.notify_all();
                    return Ok(true);
                }
            }
            condvar.wait(table);
            self.check_still_alive(table, txn, rid, condvar)?;
        }
    }

    /// A waiter that wakes up aborted (deadlock victim or external abort)
    /// withdraws its request and propagates the abort.
    fn check_still_alive(
        &self,
        table: &mut MutexGuard<'_, LockTable>,
        txn: &Arc<Transaction>,
        rid: RecordId,
        condvar: &Arc<Condvar>,
    ) -> VellumResult<()> {
        if txn.state() != TransactionState::Aborted {
            return Ok(());
        }
        Self::remove_requests(table, &rid, txn.id());
        condvar.notify_all();
        Err(VellumError::TransactionAborted {
            txn_id: txn.id(),
            reason: AbortReason::Deadlock,
        })
    }

    /// Any lock call outside the growing phase aborts the transaction.
    fn check_lockable(txn: &Arc<Transaction>) -> VellumResult<()> {
        if txn.state() == TransactionState::Growing {
            return Ok(());
        }
        txn.set_state(TransactionState::Aborted);
        Err(VellumError::TransactionAborted {
            txn_id: txn.id(),
            reason: AbortReason::LockOnShrinking,
        })
    }

    /// Shared grant rule: every earlier request is granted and none is
    /// exclusive. Waiting behind earlier ungranted requests keeps writers
    /// from starving.
    fn shared_grantable(queue: &LockRequestQueue, txn_id: TransactionId) -> bool {
        for request in &queue.requests {
            if request.txn.id() == txn_id {
                return true;
            }
            if !request.granted || request.mode == LockMode::Exclusive {
                return false;
            }
        }
        false
    }

    fn remove_requests(table: &mut LockTable, rid: &RecordId, txn_id: TransactionId) -> bool {
        match table.get_mut(rid) {
            Some(queue) => {
                let before = queue.requests.len();
                queue.requests.retain(|r| r.txn.id() != txn_id);
                queue.requests.len() != before
            }
            None => false,
        }
    }

    fn notify_queue(table: &LockTable, rid: &RecordId) {
        if let Some(queue) = table.get(rid) {
            queue.condvar.notify_all();
        }
    }
}

/// Handle for the background detector thread; stops and joins on drop.
#[derive(Debug)]
pub struct DeadlockDetector {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl DeadlockDetector {
    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("deadlock detector thread terminated with a panic");
            }
        }
    }
}

impl Drop for DeadlockDetector {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    fn txn(id: TransactionId, isolation: IsolationLevel) -> Arc<Transaction> {
        Arc::new(Transaction::new(id, isolation))
    }

    fn rid(n: u32) -> RecordId {
        RecordId::new(1, n)
    }

    #[test]
    fn shared_locks_are_compatible() {
        let manager = LockManager::new();
        let t1 = txn(1, IsolationLevel::RepeatableRead);
        let t2 = txn(2, IsolationLevel::RepeatableRead);

        assert!(manager.lock_shared(&t1, rid(1)).unwrap());
        assert!(manager.lock_shared(&t2, rid(1)).unwrap());
        assert!(t1.is_shared_locked(&rid(1)));
        assert!(t2.is_shared_locked(&rid(1)));
    }

    #[test]
    fn exclusive_excludes_and_waits() {
        let manager = Arc::new(LockManager::new());
        let holder = txn(1, IsolationLevel::RepeatableRead);
        let waiter = txn(2, IsolationLevel::RepeatableRead);

        assert!(manager.lock_exclusive(&holder, rid(1)).unwrap());

        let acquired = Arc::new(AtomicBool::new(false));
        let acquired_clone = acquired.clone();
        let manager_clone = manager.clone();
        let waiter_clone = waiter.clone();
        let handle = thread::spawn(move || {
            let ok = manager_clone.lock_exclusive(&waiter_clone, rid(1)).unwrap();
            acquired_clone.store(ok, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(30));
        assert!(!acquired.load(Ordering::SeqCst));

        assert!(manager.unlock(&holder, rid(1)));
        handle.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
        assert!(waiter.is_exclusive_locked(&rid(1)));
    }

    #[test]
    fn shared_waits_behind_earlier_exclusive_request() {
        // S1 granted, X2 queued, S3 must wait behind X2 even though it is
        // compatible with S1 (no writer starvation).
        let manager = Arc::new(LockManager::new());
        let t1 = txn(1, IsolationLevel::RepeatableRead);
        let t2 = txn(2, IsolationLevel::RepeatableRead);
        let t3 = txn(3, IsolationLevel::RepeatableRead);

        assert!(manager.lock_shared(&t1, rid(7)).unwrap());

        let x_granted = Arc::new(AtomicBool::new(false));
        let x_handle = {
            let manager = manager.clone();
            let t2 = t2.clone();
            let flag = x_granted.clone();
            thread::spawn(move || {
                manager.lock_exclusive(&t2, rid(7)).unwrap();
                flag.store(true, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(30));
                manager.unlock(&t2, rid(7));
            })
        };
        thread::sleep(Duration::from_millis(20));

        let s_granted = Arc::new(AtomicBool::new(false));
        let s_handle = {
            let manager = manager.clone();
            let t3 = t3.clone();
            let flag = s_granted.clone();
            thread::spawn(move || {
                manager.lock_shared(&t3, rid(7)).unwrap();
                flag.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(20));
        assert!(!x_granted.load(Ordering::SeqCst));
        assert!(!s_granted.load(Ordering::SeqCst));

        // Releasing the first shared lock lets X in first, then S3.
        assert!(manager.unlock(&t1, rid(7)));
        x_handle.join().unwrap();
        s_handle.join().unwrap();
        assert!(x_granted.load(Ordering::SeqCst));
        assert!(s_granted.load(Ordering::SeqCst));
    }

    #[test]
    fn unlock_moves_repeatable_read_to_shrinking() {
        let manager = LockManager::new();
        let t = txn(1, IsolationLevel::RepeatableRead);

        assert!(manager.lock_shared(&t, rid(1)).unwrap());
        assert!(manager.unlock(&t, rid(1)));
        assert_eq!(t.state(), TransactionState::Shrinking);

        let err = manager.lock_shared(&t, rid(2)).unwrap_err();
        assert_eq!(err.abort_reason(), Some(AbortReason::LockOnShrinking));
        assert_eq!(t.state(), TransactionState::Aborted);
    }

    #[test]
    fn read_committed_early_release_keeps_growing() {
        let manager = LockManager::new();
        let t = txn(1, IsolationLevel::ReadCommitted);

        assert!(manager.lock_shared(&t, rid(1)).unwrap());
        assert!(manager.unlock(&t, rid(1)));
        assert_eq!(t.state(), TransactionState::Growing);

        // Still allowed to lock more.
        assert!(manager.lock_shared(&t, rid(2)).unwrap());
    }

    #[test]
    fn shared_lock_rejected_under_read_uncommitted() {
        let manager = LockManager::new();
        let t = txn(1, IsolationLevel::ReadUncommitted);
        let err = manager.lock_shared(&t, rid(1)).unwrap_err();
        assert_eq!(
            err.abort_reason(),
            Some(AbortReason::LockSharedOnReadUncommitted)
        );
        assert_eq!(t.state(), TransactionState::Aborted);
    }

    #[test]
    fn unlock_without_lock_returns_false() {
        let manager = LockManager::new();
        let t = txn(1, IsolationLevel::RepeatableRead);
        assert!(!manager.unlock(&t, rid(1)));
    }

    #[test]
    fn upgrade_without_shared_lock_is_noop() {
        let manager = LockManager::new();
        let t = txn(1, IsolationLevel::RepeatableRead);
        assert!(!manager.lock_upgrade(&t, rid(1)).unwrap());
    }

    #[test]
    fn upgrade_succeeds_once_other_sharers_leave() {
        let manager = Arc::new(LockManager::new());
        let upgrader = txn(1, IsolationLevel::RepeatableRead);
        let other = txn(2, IsolationLevel::RepeatableRead);

        assert!(manager.lock_shared(&upgrader, rid(1)).unwrap());
        assert!(manager.lock_shared(&other, rid(1)).unwrap());

        let upgraded = Arc::new(AtomicBool::new(false));
        let handle = {
            let manager = manager.clone();
            let upgrader = upgrader.clone();
            let flag = upgraded.clone();
            thread::spawn(move || {
                assert!(manager.lock_upgrade(&upgrader, rid(1)).unwrap());
                flag.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(30));
        assert!(!upgraded.load(Ordering::SeqCst));

        assert!(manager.unlock(&other, rid(1)));
        handle.join().unwrap();
        assert!(upgraded.load(Ordering::SeqCst));
        assert!(upgrader.is_exclusive_locked(&rid(1)));
        assert!(!upgrader.is_shared_locked(&rid(1)));
    }

    #[test]
    fn concurrent_upgrade_aborts_with_conflict() {
        let manager = Arc::new(LockManager::new());
        let first = txn(1, IsolationLevel::RepeatableRead);
        let second = txn(2, IsolationLevel::RepeatableRead);

        assert!(manager.lock_shared(&first, rid(1)).unwrap());
        assert!(manager.lock_shared(&second, rid(1)).unwrap());

        // First upgrade blocks behind second's shared lock.
        let handle = {
            let manager = manager.clone();
            let first = first.clone();
            thread::spawn(move || manager.lock_upgrade(&first, rid(1)))
        };
        thread::sleep(Duration::from_millis(30));

        let err = manager.lock_upgrade(&second, rid(1)).unwrap_err();
        assert_eq!(err.abort_reason(), Some(AbortReason::UpgradeConflict));
        assert_eq!(second.state(), TransactionState::Aborted);

        // The aborted sharer's lock release unblocks the first upgrade.
        manager.release_all_locks(&second);
        assert!(handle.join().unwrap().unwrap());
        assert!(first.is_exclusive_locked(&rid(1)));
    }

    #[test]
    fn cycle_detection_picks_smallest_id() {
        let manager = Arc::new(LockManager::new());
        let t1 = txn(1, IsolationLevel::RepeatableRead);
        let t2 = txn(2, IsolationLevel::RepeatableRead);

        assert!(manager.lock_exclusive(&t1, rid(1)).unwrap());
        assert!(manager.lock_exclusive(&t2, rid(2)).unwrap());

        // t2 blocks on rid 1; t1 blocks on rid 2 -> cycle {1, 2}.
        let blocked = {
            let manager = manager.clone();
            let t2 = t2.clone();
            thread::spawn(move || manager.lock_exclusive(&t2, rid(1)))
        };
        thread::sleep(Duration::from_millis(30));

        let t1_result = {
            let manager = manager.clone();
            let t1 = t1.clone();
            thread::spawn(move || manager.lock_exclusive(&t1, rid(2)))
        };
        thread::sleep(Duration::from_millis(30));

        manager.run_cycle_detection();

        // Victim is txn 1, the smallest id in the cycle.
        let err = t1_result.join().unwrap().unwrap_err();
        assert_eq!(err.abort_reason(), Some(AbortReason::Deadlock));
        assert_eq!(t1.state(), TransactionState::Aborted);

        // The survivor completes once the victim's locks are gone.
        manager.release_all_locks(&t1);
        assert!(blocked.join().unwrap().unwrap());
        assert_eq!(t2.state(), TransactionState::Growing);
    }

    #[test]
    fn detector_thread_runs_and_stops() {
        let manager = Arc::new(LockManager::new());
        let mut detector = manager.start_deadlock_detection(LockManagerConfig {
            cycle_detection_interval: Duration::from_millis(10),
        });
        thread::sleep(Duration::from_millis(40));
        detector.shutdown();
    }
}
