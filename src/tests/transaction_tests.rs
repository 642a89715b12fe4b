use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::LockManagerConfig;
use crate::error::AbortReason;
use crate::storage::page::RecordId;
use crate::transaction::{
    IsolationLevel, LockManager, TransactionManager, TransactionState,
};

fn rid(n: u32) -> RecordId {
    RecordId::new(1, n)
}

// A repeatable-read transaction that released a lock has entered its
// shrinking phase; any further lock request aborts it.
#[test]
fn two_phase_locking_violation_rejected() {
    let lock_manager = Arc::new(LockManager::new());
    let txn_manager = TransactionManager::new(lock_manager.clone());
    let txn = txn_manager.begin(IsolationLevel::RepeatableRead);

    assert!(lock_manager.lock_shared(&txn, rid(1)).unwrap());
    assert!(lock_manager.unlock(&txn, rid(1)));
    assert_eq!(txn.state(), TransactionState::Shrinking);

    let err = lock_manager.lock_shared(&txn, rid(2)).unwrap_err();
    assert_eq!(err.abort_reason(), Some(AbortReason::LockOnShrinking));
    assert_eq!(txn.state(), TransactionState::Aborted);
    txn_manager.abort(&txn);
}

// Upgrade ordering: A holds S, B's exclusive request queues behind it, then
// A upgrades. The upgrade re-enters the queue at the tail, so B is granted
// first and A's exclusive lock follows.
#[test]
fn upgrade_requeues_behind_pending_exclusive() {
    let lock_manager = Arc::new(LockManager::new());
    let txn_manager = Arc::new(TransactionManager::new(lock_manager.clone()));
    let txn_a = txn_manager.begin(IsolationLevel::RepeatableRead);
    let txn_b = txn_manager.begin(IsolationLevel::RepeatableRead);

    assert!(lock_manager.lock_shared(&txn_a, rid(1)).unwrap());

    let grant_order = Arc::new(Mutex::new(Vec::new()));

    let b_handle = {
        let lock_manager = lock_manager.clone();
        let txn_manager = txn_manager.clone();
        let txn_b = txn_b.clone();
        let grant_order = grant_order.clone();
        thread::spawn(move || {
            assert!(lock_manager.lock_exclusive(&txn_b, rid(1)).unwrap());
            grant_order.lock().push(txn_b.id());
            txn_manager.commit(&txn_b);
        })
    };
    // Let B enqueue behind A's shared lock.
    thread::sleep(Duration::from_millis(30));

    assert!(lock_manager.lock_upgrade(&txn_a, rid(1)).unwrap());
    grant_order.lock().push(txn_a.id());
    assert!(txn_a.is_exclusive_locked(&rid(1)));

    b_handle.join().unwrap();
    assert_eq!(*grant_order.lock(), vec![txn_b.id(), txn_a.id()]);
    txn_manager.commit(&txn_a);
}

// Classic two-transaction deadlock: within one detection interval the
// smaller id in the cycle aborts and the other completes.
#[test]
fn deadlock_aborts_smallest_id_in_cycle() {
    let lock_manager = Arc::new(LockManager::new());
    let txn_manager = Arc::new(TransactionManager::new(lock_manager.clone()));
    let interval = Duration::from_millis(20);
    let _detector = lock_manager.start_deadlock_detection(LockManagerConfig {
        cycle_detection_interval: interval,
    });

    let txn_a = txn_manager.begin(IsolationLevel::RepeatableRead);
    let txn_b = txn_manager.begin(IsolationLevel::RepeatableRead);
    assert!(txn_a.id() < txn_b.id());

    assert!(lock_manager.lock_exclusive(&txn_a, rid(1)).unwrap());
    assert!(lock_manager.lock_exclusive(&txn_b, rid(2)).unwrap());

    let b_done = Arc::new(AtomicBool::new(false));
    let b_handle = {
        let lock_manager = lock_manager.clone();
        let txn_manager = txn_manager.clone();
        let txn_b = txn_b.clone();
        let b_done = b_done.clone();
        thread::spawn(move || {
            // Blocks on A's lock until the victim aborts.
            assert!(lock_manager.lock_exclusive(&txn_b, rid(1)).unwrap());
            b_done.store(true, Ordering::SeqCst);
            txn_manager.commit(&txn_b);
        })
    };
    thread::sleep(Duration::from_millis(30));

    // Completes the cycle; A is the smallest id and must become the victim.
    let err = lock_manager.lock_exclusive(&txn_a, rid(2)).unwrap_err();
    assert_eq!(err.abort_reason(), Some(AbortReason::Deadlock));
    assert_eq!(txn_a.state(), TransactionState::Aborted);
    txn_manager.abort(&txn_a);

    b_handle.join().unwrap();
    assert!(b_done.load(Ordering::SeqCst));
    assert_eq!(txn_b.state(), TransactionState::Committed);
}

// FIFO grants: requests enqueued first are granted no later than requests
// enqueued after them.
#[test]
fn exclusive_grants_follow_enqueue_order() {
    let lock_manager = Arc::new(LockManager::new());
    let txn_manager = Arc::new(TransactionManager::new(lock_manager.clone()));
    let holder = txn_manager.begin(IsolationLevel::RepeatableRead);
    assert!(lock_manager.lock_exclusive(&holder, rid(9)).unwrap());

    let grant_order = Arc::new(Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    let mut expected = Vec::new();
    for _ in 0..3 {
        let txn = txn_manager.begin(IsolationLevel::RepeatableRead);
        expected.push(txn.id());
        let lock_manager = lock_manager.clone();
        let txn_manager = txn_manager.clone();
        let grant_order = grant_order.clone();
        handles.push(thread::spawn(move || {
            assert!(lock_manager.lock_exclusive(&txn, rid(9)).unwrap());
            grant_order.lock().push(txn.id());
            txn_manager.commit(&txn);
        }));
        // Order the enqueues deterministically.
        thread::sleep(Duration::from_millis(20));
    }

    assert!(lock_manager.unlock(&holder, rid(9)));
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(*grant_order.lock(), expected);
}

// Under READ_COMMITTED a guarded read can release its shared lock right
// after the read without ending the growing phase.
#[test]
fn read_committed_reads_release_early() {
    let lock_manager = Arc::new(LockManager::new());
    let txn_manager = TransactionManager::new(lock_manager.clone());
    let txn = txn_manager.begin(IsolationLevel::ReadCommitted);

    for n in 0..5 {
        assert!(lock_manager.lock_shared(&txn, rid(n)).unwrap());
        assert!(lock_manager.unlock(&txn, rid(n)));
        assert_eq!(txn.state(), TransactionState::Growing);
    }

    // A write lock still works afterwards, and commit cleans up.
    assert!(lock_manager.lock_exclusive(&txn, rid(100)).unwrap());
    txn_manager.commit(&txn);
    assert_eq!(txn.exclusive_lock_count(), 0);
}

// The background detector resolves a deadlock without any explicit
// detection call.
#[test]
fn background_detector_resolves_deadlock() {
    let lock_manager = Arc::new(LockManager::new());
    let txn_manager = Arc::new(TransactionManager::new(lock_manager.clone()));
    let _detector = lock_manager.start_deadlock_detection(LockManagerConfig {
        cycle_detection_interval: Duration::from_millis(10),
    });

    let txn_a = txn_manager.begin(IsolationLevel::RepeatableRead);
    let txn_b = txn_manager.begin(IsolationLevel::RepeatableRead);
    assert!(lock_manager.lock_exclusive(&txn_a, rid(1)).unwrap());
    assert!(lock_manager.lock_exclusive(&txn_b, rid(2)).unwrap());

    let a_handle = {
        let lock_manager = lock_manager.clone();
        let txn_manager = txn_manager.clone();
        let txn_a = txn_a.clone();
        thread::spawn(move || {
            let result = lock_manager.lock_exclusive(&txn_a, rid(2));
            if result.is_err() {
                txn_manager.abort(&txn_a);
            }
            result
        })
    };
    let b_handle = {
        let lock_manager = lock_manager.clone();
        let txn_manager = txn_manager.clone();
        let txn_b = txn_b.clone();
        thread::spawn(move || {
            let result = lock_manager.lock_exclusive(&txn_b, rid(1));
            if result.is_err() {
                txn_manager.abort(&txn_b);
            }
            result
        })
    };

    let a_result = a_handle.join().unwrap();
    let b_result = b_handle.join().unwrap();

    // Exactly one of the two aborted, and it is the smaller id when it is
    // part of the detected cycle.
    let aborted: Vec<bool> = vec![a_result.is_err(), b_result.is_err()];
    assert_eq!(aborted.iter().filter(|&&e| e).count(), 1);
    assert!(a_result.is_err(), "the smallest id in the cycle aborts");
    assert_eq!(
        a_result.unwrap_err().abort_reason(),
        Some(AbortReason::Deadlock)
    );
    assert!(b_result.unwrap());
}
