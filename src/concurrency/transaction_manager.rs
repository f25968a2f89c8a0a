use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::common::{Result, TxnId};
use crate::storage::page::TupleMeta;

use super::lock_manager::LockManager;
use super::transaction::{IsolationLevel, Transaction, TransactionState, WriteOp};

/// Hands out transactions, tracks the live ones, and drives commit/abort.
/// Abort replays the transaction's write records in reverse: heap writes
/// flip the tuple deletion flag back, index writes remove or reinsert keys.
pub struct TransactionManager {
    next_txn_id: AtomicU32,
    txn_map: Mutex<HashMap<TxnId, Arc<Transaction>>>,
    lock_manager: Arc<LockManager>,
    default_isolation: IsolationLevel,
}

impl TransactionManager {
    pub fn new(lock_manager: Arc<LockManager>, default_isolation: IsolationLevel) -> Self {
        Self {
            next_txn_id: AtomicU32::new(0),
            txn_map: Mutex::new(HashMap::new()),
            lock_manager,
            default_isolation,
        }
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    /// Starts a transaction at the manager's default isolation level.
    pub fn begin(&self) -> Arc<Transaction> {
        self.begin_with(self.default_isolation)
    }

    /// Starts a transaction at the given isolation level.
    pub fn begin_with(&self, isolation: IsolationLevel) -> Arc<Transaction> {
        let id = TxnId::new(self.next_txn_id.fetch_add(1, Ordering::SeqCst));
        let txn = Arc::new(Transaction::new(id, isolation));
        self.txn_map.lock().insert(id, Arc::clone(&txn));
        debug!("{id} began ({isolation:?})");
        txn
    }

    pub fn get_transaction(&self, id: TxnId) -> Option<Arc<Transaction>> {
        self.txn_map.lock().get(&id).cloned()
    }

    /// Commits: releases every lock, marks the transaction committed, and
    /// forgets it.
    pub fn commit(&self, txn: &Arc<Transaction>) -> Result<()> {
        self.lock_manager.unlock_all(txn);
        txn.set_state(TransactionState::Committed);
        self.txn_map.lock().remove(&txn.id());
        debug!("{} committed", txn.id());
        Ok(())
    }

    /// Aborts: undoes the transaction's writes newest-first, then releases
    /// its locks.
    pub fn abort(&self, txn: &Arc<Transaction>) -> Result<()> {
        let mut table_writes = txn.take_table_writes();
        while let Some(record) = table_writes.pop() {
            match record.op {
                WriteOp::Insert => {
                    record
                        .heap
                        .set_tuple_meta(record.rid, TupleMeta { is_deleted: true })?;
                }
                WriteOp::Delete => {
                    record
                        .heap
                        .set_tuple_meta(record.rid, TupleMeta { is_deleted: false })?;
                }
            }
        }

        let mut index_writes = txn.take_index_writes();
        while let Some(record) = index_writes.pop() {
            match record.op {
                WriteOp::Insert => {
                    record.index.remove(record.key)?;
                }
                WriteOp::Delete => {
                    record.index.insert(record.key, record.value)?;
                }
            }
        }

        self.lock_manager.unlock_all(txn);
        txn.set_state(TransactionState::Aborted);
        self.txn_map.lock().remove(&txn.id());
        debug!("{} aborted and rolled back", txn.id());
        Ok(())
    }
}
