//! Transaction manager tests: commit/abort, undo replay, deadlock victims

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use stratum::buffer::BufferPoolManager;
use stratum::common::TableOid;
use stratum::concurrency::{
    IndexWriteRecord, IsolationLevel, LockManager, LockMode, TableWriteRecord, TransactionManager,
    TransactionState, WriteOp,
};
use stratum::index::{BPlusTree, IntegerComparator};
use stratum::storage::disk::DiskManager;
use stratum::storage::page::TupleMeta;
use stratum::storage::table::TableHeap;
use tempfile::NamedTempFile;

fn storage() -> (Arc<BufferPoolManager>, NamedTempFile) {
    let temp_file = NamedTempFile::new().unwrap();
    let dm = Arc::new(DiskManager::new(temp_file.path()).unwrap());
    (Arc::new(BufferPoolManager::new(64, 2, dm)), temp_file)
}

fn txn_manager(interval_ms: u64) -> Arc<TransactionManager> {
    let lm = Arc::new(LockManager::new(Duration::from_millis(interval_ms)));
    Arc::new(TransactionManager::new(lm, IsolationLevel::RepeatableRead))
}

#[test]
fn test_begin_assigns_increasing_ids() {
    let tm = txn_manager(50);

    let t1 = tm.begin();
    let t2 = tm.begin();
    assert!(t1.id() < t2.id());
    assert_eq!(t1.state(), TransactionState::Growing);
    assert_eq!(t1.isolation_level(), IsolationLevel::RepeatableRead);

    let t3 = tm.begin_with(IsolationLevel::ReadCommitted);
    assert_eq!(t3.isolation_level(), IsolationLevel::ReadCommitted);
}

#[test]
fn test_commit_releases_locks_and_forgets() {
    let tm = txn_manager(50);
    let oid = TableOid::new(1);

    let t1 = tm.begin();
    assert!(tm
        .lock_manager()
        .lock_table(&t1, LockMode::Exclusive, oid)
        .unwrap());
    tm.commit(&t1).unwrap();
    assert_eq!(t1.state(), TransactionState::Committed);
    assert!(tm.get_transaction(t1.id()).is_none());

    // the lock is gone: a second X grant is immediate
    let t2 = tm.begin();
    assert!(tm
        .lock_manager()
        .lock_table(&t2, LockMode::Exclusive, oid)
        .unwrap());
    tm.commit(&t2).unwrap();
}

#[test]
fn test_abort_rolls_back_heap_writes() {
    let (bpm, _temp) = storage();
    let tm = txn_manager(50);
    let heap = Arc::new(TableHeap::new(Arc::clone(&bpm)).unwrap());
    let oid = TableOid::new(1);

    // a committed row, then a txn that inserts one row and deletes the other
    let committed_rid = heap.insert_tuple(b"committed").unwrap();

    let txn = tm.begin();
    let new_rid = heap.insert_tuple(b"uncommitted").unwrap();
    txn.append_table_write(TableWriteRecord {
        op: WriteOp::Insert,
        rid: new_rid,
        oid,
        heap: Arc::clone(&heap),
    });

    heap.set_tuple_meta(committed_rid, TupleMeta { is_deleted: true })
        .unwrap();
    txn.append_table_write(TableWriteRecord {
        op: WriteOp::Delete,
        rid: committed_rid,
        oid,
        heap: Arc::clone(&heap),
    });

    tm.abort(&txn).unwrap();
    assert_eq!(txn.state(), TransactionState::Aborted);

    // the insert is tombstoned, the delete undone
    assert!(heap.tuple_meta(new_rid).unwrap().is_deleted);
    assert!(!heap.tuple_meta(committed_rid).unwrap().is_deleted);
}

#[test]
fn test_abort_rolls_back_index_writes() {
    let (bpm, _temp) = storage();
    let tm = txn_manager(50);
    let heap = Arc::new(TableHeap::new(Arc::clone(&bpm)).unwrap());
    let tree = Arc::new(
        BPlusTree::new(Arc::clone(&bpm), Box::new(IntegerComparator), 8, 8).unwrap(),
    );

    let kept_rid = heap.insert_tuple(b"kept").unwrap();
    tree.insert(10, kept_rid).unwrap();

    let txn = tm.begin();

    // txn adds key 20 and removes key 10
    let new_rid = heap.insert_tuple(b"new").unwrap();
    tree.insert(20, new_rid).unwrap();
    txn.append_index_write(IndexWriteRecord {
        op: WriteOp::Insert,
        key: 20,
        value: new_rid,
        index: Arc::clone(&tree),
    });

    tree.remove(10).unwrap();
    txn.append_index_write(IndexWriteRecord {
        op: WriteOp::Delete,
        key: 10,
        value: kept_rid,
        index: Arc::clone(&tree),
    });

    tm.abort(&txn).unwrap();

    assert_eq!(tree.get(20).unwrap(), None);
    assert_eq!(tree.get(10).unwrap(), Some(kept_rid));
}

/// Cross wait between two transactions: the detector aborts the youngest
/// within a couple of detection intervals and the older one proceeds.
#[test]
fn test_deadlock_aborts_youngest() {
    let tm = txn_manager(50);
    let oid_a = TableOid::new(100);
    let oid_b = TableOid::new(101);

    let older = tm.begin();
    let younger = tm.begin();
    assert!(older.id() < younger.id());

    assert!(tm
        .lock_manager()
        .lock_table(&older, LockMode::Exclusive, oid_a)
        .unwrap());
    assert!(tm
        .lock_manager()
        .lock_table(&younger, LockMode::Exclusive, oid_b)
        .unwrap());

    let (older_tx, older_rx) = mpsc::channel();
    let older_thread = {
        let tm = Arc::clone(&tm);
        let older = Arc::clone(&older);
        thread::spawn(move || {
            let granted = tm
                .lock_manager()
                .lock_table(&older, LockMode::Exclusive, oid_b)
                .unwrap();
            older_tx.send(granted).unwrap();
        })
    };

    let (younger_tx, younger_rx) = mpsc::channel();
    let younger_thread = {
        let tm = Arc::clone(&tm);
        let younger = Arc::clone(&younger);
        thread::spawn(move || {
            let granted = tm
                .lock_manager()
                .lock_table(&younger, LockMode::Exclusive, oid_a)
                .unwrap();
            younger_tx.send(granted).unwrap();
            if !granted {
                tm.abort(&younger).unwrap();
            }
        })
    };

    // the victim's wait fails fast once the detector runs
    let younger_granted = younger_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(!younger_granted);
    assert_eq!(younger.state(), TransactionState::Aborted);

    // with the victim's locks gone, the survivor is granted
    let older_granted = older_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(older_granted);

    older_thread.join().unwrap();
    younger_thread.join().unwrap();

    tm.commit(&older).unwrap();
}

/// No deadlock, just contention: detection leaves straight-line waits alone.
#[test]
fn test_detection_spares_plain_waits() {
    let tm = txn_manager(20);
    let oid = TableOid::new(200);

    let t1 = tm.begin();
    let t2 = tm.begin();

    assert!(tm
        .lock_manager()
        .lock_table(&t1, LockMode::Exclusive, oid)
        .unwrap());

    let waiter = {
        let tm = Arc::clone(&tm);
        let t2 = Arc::clone(&t2);
        thread::spawn(move || {
            tm.lock_manager()
                .lock_table(&t2, LockMode::Exclusive, oid)
                .unwrap()
        })
    };

    // give the detector several passes over the wait
    thread::sleep(Duration::from_millis(150));
    assert_eq!(t2.state(), TransactionState::Growing);

    tm.commit(&t1).unwrap();
    assert!(waiter.join().unwrap());
    tm.commit(&t2).unwrap();
}

/// External cancellation: flipping a waiter's state to Aborted and nudging
/// its queue makes the wait return false.
#[test]
fn test_aborted_waiter_gives_up() {
    let tm = txn_manager(50);
    let oid = TableOid::new(300);

    let holder = tm.begin();
    let waiter = tm.begin();

    assert!(tm
        .lock_manager()
        .lock_table(&holder, LockMode::Exclusive, oid)
        .unwrap());

    let handle = {
        let tm = Arc::clone(&tm);
        let waiter = Arc::clone(&waiter);
        thread::spawn(move || {
            tm.lock_manager()
                .lock_table(&waiter, LockMode::Shared, oid)
                .unwrap()
        })
    };

    thread::sleep(Duration::from_millis(100));
    waiter.set_state(TransactionState::Aborted);
    // release and retake the lock to ripple a notify through the queue
    tm.lock_manager().unlock_all(&holder);

    assert!(!handle.join().unwrap());
}
