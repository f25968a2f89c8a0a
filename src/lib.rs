//! Stratum - the storage and concurrency core of a disk-oriented RDBMS
//!
//! This crate provides the three tightly coupled subsystems at the bottom of
//! a relational database engine: a buffered page cache, a concurrent B+ tree
//! index built on top of it, and a hierarchical two-phase lock manager with
//! deadlock detection.
//!
//! # Architecture
//!
//! The system is organized into layers, leaves first:
//!
//! - **Storage Layer** (`storage`): disk I/O and on-page formats
//!   - `DiskManager`: reads and writes fixed-size pages in a single file
//!   - `DiskScheduler`: background worker serializing disk requests
//!   - `TablePage` / `TableHeap`: slotted tuple storage with per-tuple metadata
//!
//! - **Buffer Pool** (`buffer`): memory management for database pages
//!   - `BufferPoolManager`: caches pages in a fixed set of frames
//!   - `LruKReplacer`: LRU-K eviction over the evictable frames
//!   - `BasicPageGuard`/`ReadPageGuard`/`WritePageGuard`: RAII pins and latches
//!
//! - **Index** (`index`): ordered access paths
//!   - `BPlusTree`: crab-latched, disk-resident B+ tree
//!   - `BPlusTreeIterator`: forward scan over the leaf chain
//!
//! - **Concurrency** (`concurrency`): transactions
//!   - `LockManager`: IS/IX/S/SIX/X table and row locks, upgrades, deadlock
//!     detection with victim abort
//!   - `TransactionManager`: begin/commit/abort with reverse undo replay
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use stratum::buffer::BufferPoolManager;
//! use stratum::index::{BPlusTree, IntegerComparator};
//! use stratum::storage::disk::DiskManager;
//! use stratum::common::{PageId, RecordId, SlotId};
//!
//! let disk_manager = Arc::new(DiskManager::new("test.db").unwrap());
//! let bpm = Arc::new(BufferPoolManager::new(100, 2, disk_manager));
//!
//! let tree = BPlusTree::new(bpm, Box::new(IntegerComparator), 64, 64).unwrap();
//! let rid = RecordId::new(PageId::new(7), SlotId::new(0));
//! tree.insert(42, rid).unwrap();
//! assert_eq!(tree.get(42).unwrap(), Some(rid));
//! ```

pub mod buffer;
pub mod common;
pub mod concurrency;
pub mod index;
pub mod storage;

// Re-export commonly used types at the crate root
pub use common::{PageId, RecordId, Result, SlotId, StratumError, TableOid, TxnId};
