use std::sync::Arc;
use std::time::Duration;

use stratum::buffer::BufferPoolManager;
use stratum::concurrency::{IsolationLevel, LockManager, LockMode, TransactionManager};
use stratum::index::{BPlusTree, IntegerComparator};
use stratum::storage::disk::DiskManager;
use stratum::storage::table::TableHeap;
use stratum::TableOid;

fn main() {
    env_logger::init();

    println!("Stratum - disk-oriented storage and concurrency core");
    println!("====================================================\n");

    let db_path = "demo.db";
    let disk_manager = Arc::new(DiskManager::new(db_path).expect("failed to create disk manager"));
    println!("Created disk manager for: {db_path}");

    let bpm = Arc::new(BufferPoolManager::new(64, 2, disk_manager));
    println!("Created buffer pool with 64 frames (LRU-2)\n");

    // A heap for rows, and a B+ tree indexing them by key
    let heap = Arc::new(TableHeap::new(Arc::clone(&bpm)).expect("failed to create heap"));
    let tree = BPlusTree::new(Arc::clone(&bpm), Box::new(IntegerComparator), 16, 16)
        .expect("failed to create index");

    for key in [42u32, 7, 19, 88, 3] {
        let row = format!("row-{key}");
        let rid = heap.insert_tuple(row.as_bytes()).expect("insert failed");
        tree.insert(key, rid).expect("index insert failed");
        println!("Inserted {row} at {rid}");
    }

    println!("\nIndex scan in key order:");
    for entry in tree.begin().expect("scan failed") {
        let (key, rid) = entry.expect("scan step failed");
        let (_, data) = heap.get_tuple(rid).expect("heap read failed");
        println!("  {key:>3} -> {}", String::from_utf8_lossy(&data));
    }

    println!("\nTree shape:\n{}", tree.draw().expect("draw failed"));

    // Locks and transactions
    let lock_manager = Arc::new(LockManager::new(Duration::from_millis(50)));
    let txn_manager = TransactionManager::new(lock_manager, IsolationLevel::RepeatableRead);

    let txn = txn_manager.begin();
    let oid = TableOid::new(1);
    txn_manager
        .lock_manager()
        .lock_table(&txn, LockMode::IntentionExclusive, oid)
        .expect("table lock failed");
    println!("{} holds IX on {oid}", txn.id());
    txn_manager.commit(&txn).expect("commit failed");
    println!("{} committed", txn.id());

    bpm.flush_all_pages().expect("flush failed");
    std::fs::remove_file(db_path).ok();
    println!("\nDemo completed successfully!");
}
