use thiserror::Error;

use super::types::{PageId, RecordId, TableOid, TxnId};

/// Database error types
#[derive(Error, Debug)]
pub enum StratumError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Page {0} not found")]
    PageNotFound(PageId),

    #[error("Invalid page ID: {0}")]
    InvalidPageId(PageId),

    #[error("Buffer pool is full, no evictable frames available")]
    PoolExhausted,

    #[error("Page {0} is still pinned")]
    PageStillPinned(PageId),

    #[error("Disk scheduler error: {0}")]
    DiskScheduler(String),

    #[error("Tuple of {0} bytes does not fit in a page")]
    TupleTooLarge(usize),

    #[error("Tuple {0} not found")]
    TupleNotFound(RecordId),

    #[error("Index corrupted: {0}")]
    IndexCorrupted(String),

    #[error("{txn_id} aborted: lock request while in the shrinking phase")]
    LockOnShrinking { txn_id: TxnId },

    #[error("{txn_id} aborted: shared lock request under READ UNCOMMITTED")]
    LockSharedOnReadUncommitted { txn_id: TxnId },

    #[error("{txn_id} aborted: another upgrade is pending on the same resource")]
    UpgradeConflict { txn_id: TxnId },

    #[error("{txn_id} aborted: requested mode is not an upgrade of the held mode")]
    IncompatibleUpgrade { txn_id: TxnId },

    #[error("{txn_id} aborted: row lock on {oid} without a matching table intent lock")]
    TableLockNotPresent { txn_id: TxnId, oid: TableOid },

    #[error("{txn_id} aborted: intention lock requested on a row")]
    AttemptedIntentionLockOnRow { txn_id: TxnId },

    #[error("{txn_id} aborted: unlock without a matching granted lock")]
    AttemptedUnlockButNoLockHeld { txn_id: TxnId },

    #[error("{txn_id} aborted: table {oid} unlocked while row locks remain")]
    TableUnlockedBeforeUnlockingRows { txn_id: TxnId, oid: TableOid },
}

pub type Result<T> = std::result::Result<T, StratumError>;
