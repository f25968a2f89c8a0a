use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::common::{RecordId, TableOid, TxnId};
use crate::index::{BPlusTree, IndexKey};
use crate::storage::table::TableHeap;

use super::lock_manager::LockMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    Insert,
    Delete,
}

/// Undo record for a heap mutation: enough to flip the tuple's deletion
/// flag back on abort.
pub struct TableWriteRecord {
    pub op: WriteOp,
    pub rid: RecordId,
    pub oid: TableOid,
    pub heap: Arc<TableHeap>,
}

/// Undo record for an index mutation.
pub struct IndexWriteRecord {
    pub op: WriteOp,
    pub key: IndexKey,
    pub value: RecordId,
    pub index: Arc<BPlusTree>,
}

#[derive(Default)]
struct LockSets {
    shared_tables: HashSet<TableOid>,
    exclusive_tables: HashSet<TableOid>,
    intention_shared_tables: HashSet<TableOid>,
    intention_exclusive_tables: HashSet<TableOid>,
    shared_intention_exclusive_tables: HashSet<TableOid>,
    shared_rows: HashMap<TableOid, HashSet<RecordId>>,
    exclusive_rows: HashMap<TableOid, HashSet<RecordId>>,
}

impl LockSets {
    fn table_set(&mut self, mode: LockMode) -> &mut HashSet<TableOid> {
        match mode {
            LockMode::Shared => &mut self.shared_tables,
            LockMode::Exclusive => &mut self.exclusive_tables,
            LockMode::IntentionShared => &mut self.intention_shared_tables,
            LockMode::IntentionExclusive => &mut self.intention_exclusive_tables,
            LockMode::SharedIntentionExclusive => &mut self.shared_intention_exclusive_tables,
        }
    }
}

/// A single transaction: identity, isolation level, 2PL state, the locks it
/// holds, and the undo records for its writes.
pub struct Transaction {
    id: TxnId,
    isolation: IsolationLevel,
    state: Mutex<TransactionState>,
    locks: Mutex<LockSets>,
    table_writes: Mutex<Vec<TableWriteRecord>>,
    index_writes: Mutex<Vec<IndexWriteRecord>>,
}

impl Transaction {
    pub fn new(id: TxnId, isolation: IsolationLevel) -> Self {
        Self {
            id,
            isolation,
            state: Mutex::new(TransactionState::Growing),
            locks: Mutex::new(LockSets::default()),
            table_writes: Mutex::new(Vec::new()),
            index_writes: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: TransactionState) {
        *self.state.lock() = state;
    }

    pub(crate) fn add_table_lock(&self, mode: LockMode, oid: TableOid) {
        self.locks.lock().table_set(mode).insert(oid);
    }

    pub(crate) fn remove_table_lock(&self, mode: LockMode, oid: TableOid) {
        self.locks.lock().table_set(mode).remove(&oid);
    }

    pub(crate) fn add_row_lock(&self, mode: LockMode, oid: TableOid, rid: RecordId) {
        let mut locks = self.locks.lock();
        let map = match mode {
            LockMode::Shared => &mut locks.shared_rows,
            LockMode::Exclusive => &mut locks.exclusive_rows,
            _ => unreachable!("intention modes are rejected on rows"),
        };
        map.entry(oid).or_default().insert(rid);
    }

    pub(crate) fn remove_row_lock(&self, mode: LockMode, oid: TableOid, rid: RecordId) {
        let mut locks = self.locks.lock();
        let map = match mode {
            LockMode::Shared => &mut locks.shared_rows,
            LockMode::Exclusive => &mut locks.exclusive_rows,
            _ => unreachable!("intention modes are rejected on rows"),
        };
        if let Some(set) = map.get_mut(&oid) {
            set.remove(&rid);
            if set.is_empty() {
                map.remove(&oid);
            }
        }
    }

    /// Whether this transaction holds a table lock on `oid` in one of the
    /// given modes.
    pub fn holds_table_lock_in(&self, oid: TableOid, modes: &[LockMode]) -> bool {
        let mut locks = self.locks.lock();
        modes.iter().any(|&mode| locks.table_set(mode).contains(&oid))
    }

    /// Whether any row of `oid` is still locked by this transaction.
    pub fn holds_row_locks_on(&self, oid: TableOid) -> bool {
        let locks = self.locks.lock();
        locks.shared_rows.contains_key(&oid) || locks.exclusive_rows.contains_key(&oid)
    }

    /// Snapshot of every lock held, rows first, for bulk release.
    pub(crate) fn held_locks(&self) -> (Vec<(LockMode, TableOid, RecordId)>, Vec<(LockMode, TableOid)>) {
        let locks = self.locks.lock();
        let mut rows = Vec::new();
        for (&oid, rids) in &locks.shared_rows {
            rows.extend(rids.iter().map(|&rid| (LockMode::Shared, oid, rid)));
        }
        for (&oid, rids) in &locks.exclusive_rows {
            rows.extend(rids.iter().map(|&rid| (LockMode::Exclusive, oid, rid)));
        }

        let mut tables = Vec::new();
        for &oid in &locks.intention_shared_tables {
            tables.push((LockMode::IntentionShared, oid));
        }
        for &oid in &locks.intention_exclusive_tables {
            tables.push((LockMode::IntentionExclusive, oid));
        }
        for &oid in &locks.shared_tables {
            tables.push((LockMode::Shared, oid));
        }
        for &oid in &locks.shared_intention_exclusive_tables {
            tables.push((LockMode::SharedIntentionExclusive, oid));
        }
        for &oid in &locks.exclusive_tables {
            tables.push((LockMode::Exclusive, oid));
        }
        (rows, tables)
    }

    pub fn append_table_write(&self, record: TableWriteRecord) {
        self.table_writes.lock().push(record);
    }

    pub fn append_index_write(&self, record: IndexWriteRecord) {
        self.index_writes.lock().push(record);
    }

    pub(crate) fn take_table_writes(&self) -> Vec<TableWriteRecord> {
        std::mem::take(&mut *self.table_writes.lock())
    }

    pub(crate) fn take_index_writes(&self) -> Vec<IndexWriteRecord> {
        std::mem::take(&mut *self.index_writes.lock())
    }
}
