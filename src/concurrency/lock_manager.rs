use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex};

use crate::common::{RecordId, Result, StratumError, TableOid, TxnId};

use super::transaction::{IsolationLevel, Transaction, TransactionState};

/// The five hierarchical lock modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    IntentionShared,
    IntentionExclusive,
    Shared,
    SharedIntentionExclusive,
    Exclusive,
}

impl LockMode {
    /// Standard hierarchical-locking compatibility matrix (symmetric).
    pub fn compatible_with(self, other: LockMode) -> bool {
        use LockMode::*;
        match (self, other) {
            (IntentionShared, Exclusive) | (Exclusive, IntentionShared) => false,
            (IntentionShared, _) | (_, IntentionShared) => true,
            (IntentionExclusive, IntentionExclusive) => true,
            (Shared, Shared) => true,
            _ => false,
        }
    }

    /// The upgrade lattice: IS -> {S, X, IX, SIX}; S -> {X, SIX};
    /// IX -> {X, SIX}; SIX -> {X}.
    pub fn upgradable_to(self, target: LockMode) -> bool {
        use LockMode::*;
        match self {
            IntentionShared => matches!(
                target,
                Shared | Exclusive | IntentionExclusive | SharedIntentionExclusive
            ),
            Shared | IntentionExclusive => {
                matches!(target, Exclusive | SharedIntentionExclusive)
            }
            SharedIntentionExclusive => matches!(target, Exclusive),
            Exclusive => false,
        }
    }

    pub fn is_intention(self) -> bool {
        matches!(
            self,
            LockMode::IntentionShared | LockMode::IntentionExclusive | LockMode::SharedIntentionExclusive
        )
    }
}

struct LockRequest {
    txn: Arc<Transaction>,
    mode: LockMode,
    granted: bool,
}

/// What enqueue did with a request.
enum Enqueued {
    /// The same mode is already granted; nothing to wait for
    AlreadyHeld,
    /// A brand-new request was appended
    Fresh,
    /// The held request was withdrawn for an upgrade to a stronger mode
    Upgrade(LockMode),
}

#[derive(Default)]
struct QueueInner {
    /// FIFO request list; granted requests stay until unlocked
    requests: Vec<LockRequest>,
    /// Transaction currently upgrading on this resource, if any
    upgrading: Option<TxnId>,
}

/// One request queue per locked resource. Handles are reference counted so
/// a queue outlives its map entry for waiters still parked on it.
struct LockRequestQueue {
    inner: Mutex<QueueInner>,
    cv: Condvar,
}

impl LockRequestQueue {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(QueueInner::default()),
            cv: Condvar::new(),
        })
    }
}

/// Shared lock tables; the background detector keeps its own handle.
struct LockTables {
    table_queues: Mutex<HashMap<TableOid, Arc<LockRequestQueue>>>,
    row_queues: Mutex<HashMap<RecordId, Arc<LockRequestQueue>>>,
    stop: AtomicBool,
    cycle_detection_interval: Duration,
}

/// Hierarchical two-phase lock manager with deadlock detection.
///
/// Grants follow FIFO order among waiters, except that a pending upgrade has
/// absolute priority. A background thread periodically rebuilds the
/// waits-for graph and aborts the youngest transaction on each cycle.
pub struct LockManager {
    core: Arc<LockTables>,
    detector: Option<JoinHandle<()>>,
}

impl LockManager {
    /// Creates the manager and spawns its cycle-detection thread.
    pub fn new(cycle_detection_interval: Duration) -> Self {
        let core = Arc::new(LockTables {
            table_queues: Mutex::new(HashMap::new()),
            row_queues: Mutex::new(HashMap::new()),
            stop: AtomicBool::new(false),
            cycle_detection_interval,
        });

        let detector_core = Arc::clone(&core);
        let detector = thread::spawn(move || detector_core.run_cycle_detection());

        Self {
            core,
            detector: Some(detector),
        }
    }

    /// Signals the detection thread to wind down.
    pub fn stop(&self) {
        self.core.stop.store(true, Ordering::SeqCst);
    }

    /// Acquires (or upgrades to) a table lock. Blocks until granted. Returns
    /// false if the transaction was aborted while waiting; isolation or
    /// upgrade violations abort the transaction and surface as errors.
    pub fn lock_table(&self, txn: &Arc<Transaction>, mode: LockMode, oid: TableOid) -> Result<bool> {
        self.check_isolation(txn, mode)?;

        let queue = {
            let mut map = self.core.table_queues.lock();
            Arc::clone(map.entry(oid).or_insert_with(LockRequestQueue::new))
        };

        match self.enqueue(txn, &queue, mode)? {
            Enqueued::AlreadyHeld => return Ok(true),
            Enqueued::Upgrade(held) => txn.remove_table_lock(held, oid),
            Enqueued::Fresh => {}
        }

        if !self.wait_for_grant(txn, &queue) {
            return Ok(false);
        }

        txn.add_table_lock(mode, oid);
        trace!("{} granted {mode:?} on {oid}", txn.id());
        Ok(true)
    }

    /// Releases a table lock. Refuses while rows of the table are still
    /// locked; transitions the transaction into its shrinking phase per its
    /// isolation level.
    pub fn unlock_table(&self, txn: &Arc<Transaction>, oid: TableOid) -> Result<bool> {
        if txn.holds_row_locks_on(oid) {
            return Err(Self::abort(
                txn,
                StratumError::TableUnlockedBeforeUnlockingRows {
                    txn_id: txn.id(),
                    oid,
                },
            ));
        }

        let queue = self.core.table_queues.lock().get(&oid).cloned();
        let mode = queue.and_then(|queue| self.dequeue_granted(&queue, txn.id()));
        let Some(mode) = mode else {
            return Err(Self::abort(
                txn,
                StratumError::AttemptedUnlockButNoLockHeld { txn_id: txn.id() },
            ));
        };

        txn.remove_table_lock(mode, oid);
        self.shrink(txn, mode, false);
        trace!("{} released {mode:?} on {oid}", txn.id());
        Ok(true)
    }

    /// Acquires (or upgrades to) a row lock. Intention modes are rejected,
    /// and the matching table intent must already be held.
    pub fn lock_row(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        oid: TableOid,
        rid: RecordId,
    ) -> Result<bool> {
        if mode.is_intention() {
            return Err(Self::abort(
                txn,
                StratumError::AttemptedIntentionLockOnRow { txn_id: txn.id() },
            ));
        }
        self.check_isolation(txn, mode)?;

        let table_cover: &[LockMode] = if mode == LockMode::Exclusive {
            &[
                LockMode::Exclusive,
                LockMode::IntentionExclusive,
                LockMode::SharedIntentionExclusive,
            ]
        } else {
            &[
                LockMode::Shared,
                LockMode::Exclusive,
                LockMode::IntentionShared,
                LockMode::IntentionExclusive,
                LockMode::SharedIntentionExclusive,
            ]
        };
        if !txn.holds_table_lock_in(oid, table_cover) {
            return Err(Self::abort(
                txn,
                StratumError::TableLockNotPresent {
                    txn_id: txn.id(),
                    oid,
                },
            ));
        }

        let queue = {
            let mut map = self.core.row_queues.lock();
            Arc::clone(map.entry(rid).or_insert_with(LockRequestQueue::new))
        };

        match self.enqueue(txn, &queue, mode)? {
            Enqueued::AlreadyHeld => return Ok(true),
            Enqueued::Upgrade(held) => txn.remove_row_lock(held, oid, rid),
            Enqueued::Fresh => {}
        }

        if !self.wait_for_grant(txn, &queue) {
            return Ok(false);
        }

        txn.add_row_lock(mode, oid, rid);
        trace!("{} granted {mode:?} on {rid}", txn.id());
        Ok(true)
    }

    /// Releases a row lock. With `force` the 2PL state transition is
    /// skipped, as on read-committed scans that drop locks eagerly.
    pub fn unlock_row(
        &self,
        txn: &Arc<Transaction>,
        oid: TableOid,
        rid: RecordId,
        force: bool,
    ) -> Result<bool> {
        let queue = self.core.row_queues.lock().get(&rid).cloned();
        let mode = queue.and_then(|queue| self.dequeue_granted(&queue, txn.id()));
        let Some(mode) = mode else {
            return Err(Self::abort(
                txn,
                StratumError::AttemptedUnlockButNoLockHeld { txn_id: txn.id() },
            ));
        };

        txn.remove_row_lock(mode, oid, rid);
        self.shrink(txn, mode, force);
        Ok(true)
    }

    /// Releases every lock the transaction still holds, rows before tables,
    /// without any state transition. Used by commit and abort.
    pub fn unlock_all(&self, txn: &Arc<Transaction>) {
        let (rows, tables) = txn.held_locks();

        for (mode, oid, rid) in rows {
            let queue = self.core.row_queues.lock().get(&rid).cloned();
            if let Some(queue) = queue {
                self.dequeue_granted(&queue, txn.id());
            }
            txn.remove_row_lock(mode, oid, rid);
        }
        for (mode, oid) in tables {
            let queue = self.core.table_queues.lock().get(&oid).cloned();
            if let Some(queue) = queue {
                self.dequeue_granted(&queue, txn.id());
            }
            txn.remove_table_lock(mode, oid);
        }
    }

    /// Current waits-for edges (granted txn -> waiting txn), sorted.
    pub fn edge_list(&self) -> Vec<(TxnId, TxnId)> {
        let (edges, _, _) = self.core.collect_waits_for();
        let mut list: Vec<(TxnId, TxnId)> = edges
            .iter()
            .flat_map(|(&from, tos)| tos.iter().map(move |&to| (from, to)))
            .collect();
        list.sort();
        list
    }

    /// Runs the deadlock detector until the stop flag is raised. The
    /// constructor spawns this on its own thread.
    pub fn run_cycle_detection(&self) {
        self.core.run_cycle_detection();
    }

    /// Gates a lock request on the transaction's isolation level and phase.
    fn check_isolation(&self, txn: &Arc<Transaction>, mode: LockMode) -> Result<()> {
        use LockMode::*;
        let state = txn.state();
        match txn.isolation_level() {
            IsolationLevel::ReadUncommitted => {
                if matches!(mode, Shared | IntentionShared | SharedIntentionExclusive) {
                    return Err(Self::abort(
                        txn,
                        StratumError::LockSharedOnReadUncommitted { txn_id: txn.id() },
                    ));
                }
                if state == TransactionState::Shrinking {
                    return Err(Self::abort(
                        txn,
                        StratumError::LockOnShrinking { txn_id: txn.id() },
                    ));
                }
            }
            IsolationLevel::ReadCommitted => {
                if state == TransactionState::Shrinking && !matches!(mode, Shared | IntentionShared)
                {
                    return Err(Self::abort(
                        txn,
                        StratumError::LockOnShrinking { txn_id: txn.id() },
                    ));
                }
            }
            IsolationLevel::RepeatableRead => {
                if state == TransactionState::Shrinking {
                    return Err(Self::abort(
                        txn,
                        StratumError::LockOnShrinking { txn_id: txn.id() },
                    ));
                }
            }
        }
        Ok(())
    }

    /// Appends the transaction's request to the queue, handling re-requests
    /// and upgrades.
    fn enqueue(
        &self,
        txn: &Arc<Transaction>,
        queue: &Arc<LockRequestQueue>,
        mode: LockMode,
    ) -> Result<Enqueued> {
        let mut inner = queue.inner.lock();

        let mut outcome = Enqueued::Fresh;
        if let Some(pos) = inner
            .requests
            .iter()
            .position(|r| r.txn.id() == txn.id())
        {
            let held = inner.requests[pos].mode;
            if held == mode {
                return Ok(Enqueued::AlreadyHeld);
            }
            if inner.upgrading.is_some() {
                return Err(Self::abort(
                    txn,
                    StratumError::UpgradeConflict { txn_id: txn.id() },
                ));
            }
            if !held.upgradable_to(mode) {
                return Err(Self::abort(
                    txn,
                    StratumError::IncompatibleUpgrade { txn_id: txn.id() },
                ));
            }
            inner.upgrading = Some(txn.id());
            inner.requests.remove(pos);
            outcome = Enqueued::Upgrade(held);
        }

        inner.requests.push(LockRequest {
            txn: Arc::clone(txn),
            mode,
            granted: false,
        });
        Ok(outcome)
    }

    /// Parks the transaction on the queue until its request is granted.
    /// Returns false if it woke up aborted; the request is then withdrawn.
    fn wait_for_grant(&self, txn: &Arc<Transaction>, queue: &Arc<LockRequestQueue>) -> bool {
        let mut inner = queue.inner.lock();
        loop {
            if Self::try_grant(&mut inner, txn.id()) {
                return true;
            }
            queue.cv.wait(&mut inner);
            if txn.state() == TransactionState::Aborted {
                if inner.upgrading == Some(txn.id()) {
                    inner.upgrading = None;
                }
                inner.requests.retain(|r| r.txn.id() != txn.id());
                queue.cv.notify_all();
                debug!("{} gave up its lock wait after abort", txn.id());
                return false;
            }
        }
    }

    /// Grant rule: compatible with every granted request; a pending upgrade
    /// has absolute priority; otherwise FIFO among the waiters ahead.
    fn try_grant(inner: &mut QueueInner, txn_id: TxnId) -> bool {
        let pos = inner
            .requests
            .iter()
            .position(|r| r.txn.id() == txn_id)
            .expect("waiter's request vanished from its queue");
        let mode = inner.requests[pos].mode;

        if inner
            .requests
            .iter()
            .any(|r| r.granted && !mode.compatible_with(r.mode))
        {
            return false;
        }

        if let Some(upgrading) = inner.upgrading {
            if upgrading != txn_id {
                return false;
            }
            inner.upgrading = None;
            inner.requests[pos].granted = true;
            return true;
        }

        for r in inner.requests.iter_mut() {
            if r.txn.id() == txn_id {
                r.granted = true;
                return true;
            }
            if !r.granted && !mode.compatible_with(r.mode) {
                return false;
            }
        }
        unreachable!("request position checked above");
    }

    /// Removes the transaction's granted request, waking the queue. Returns
    /// the released mode.
    fn dequeue_granted(&self, queue: &Arc<LockRequestQueue>, txn_id: TxnId) -> Option<LockMode> {
        let mut inner = queue.inner.lock();
        let pos = inner
            .requests
            .iter()
            .position(|r| r.txn.id() == txn_id && r.granted)?;
        let mode = inner.requests.remove(pos).mode;
        queue.cv.notify_all();
        Some(mode)
    }

    /// 2PL phase transition after an unlock: RepeatableRead shrinks on any
    /// release, the weaker levels only when an exclusive lock goes away.
    fn shrink(&self, txn: &Arc<Transaction>, mode: LockMode, force: bool) {
        if force || txn.state() != TransactionState::Growing {
            return;
        }
        let shrinks = match txn.isolation_level() {
            IsolationLevel::RepeatableRead => true,
            IsolationLevel::ReadCommitted | IsolationLevel::ReadUncommitted => {
                mode == LockMode::Exclusive
            }
        };
        if shrinks {
            txn.set_state(TransactionState::Shrinking);
        }
    }

    fn abort(txn: &Arc<Transaction>, err: StratumError) -> StratumError {
        txn.set_state(TransactionState::Aborted);
        err
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = self.detector.take() {
            let _ = handle.join();
        }
    }
}

impl LockTables {
    fn run_cycle_detection(&self) {
        while !self.stop.load(Ordering::SeqCst) {
            thread::sleep(self.cycle_detection_interval);
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            self.detect_and_resolve();
        }
    }

    /// One detection pass: rebuild the waits-for graph, abort the youngest
    /// member of each cycle, and wake the queue it is parked on.
    fn detect_and_resolve(&self) {
        let (mut edges, txns, waits_on) = self.collect_waits_for();

        while let Some(victim) = Self::find_cycle_victim(&edges) {
            warn!("deadlock detected, aborting {victim}");
            if let Some(txn) = txns.get(&victim) {
                txn.set_state(TransactionState::Aborted);
            }
            edges.remove(&victim);
            for targets in edges.values_mut() {
                targets.remove(&victim);
            }
            if let Some(queue) = waits_on.get(&victim) {
                let _inner = queue.inner.lock();
                queue.cv.notify_all();
            }
        }
    }

    /// Snapshot of the waits-for graph: an edge from every granted holder to
    /// every waiter behind it on the same queue.
    #[allow(clippy::type_complexity)]
    fn collect_waits_for(
        &self,
    ) -> (
        BTreeMap<TxnId, BTreeSet<TxnId>>,
        HashMap<TxnId, Arc<Transaction>>,
        HashMap<TxnId, Arc<LockRequestQueue>>,
    ) {
        let mut queues: Vec<Arc<LockRequestQueue>> =
            self.table_queues.lock().values().cloned().collect();
        queues.extend(self.row_queues.lock().values().cloned());

        let mut edges: BTreeMap<TxnId, BTreeSet<TxnId>> = BTreeMap::new();
        let mut txns = HashMap::new();
        let mut waits_on = HashMap::new();

        for queue in queues {
            let inner = queue.inner.lock();
            let mut granted = Vec::new();
            let mut waiting = Vec::new();
            for request in &inner.requests {
                let id = request.txn.id();
                txns.insert(id, Arc::clone(&request.txn));
                if request.granted {
                    granted.push(id);
                } else {
                    waiting.push(id);
                    waits_on.insert(id, Arc::clone(&queue));
                }
            }
            for &holder in &granted {
                for &waiter in &waiting {
                    if holder != waiter {
                        edges.entry(holder).or_default().insert(waiter);
                    }
                }
            }
        }

        (edges, txns, waits_on)
    }

    /// DFS in ascending txn-id order; on the first cycle found, returns the
    /// largest (youngest) transaction id on it.
    fn find_cycle_victim(edges: &BTreeMap<TxnId, BTreeSet<TxnId>>) -> Option<TxnId> {
        let mut done: BTreeSet<TxnId> = BTreeSet::new();

        for &start in edges.keys() {
            if done.contains(&start) {
                continue;
            }
            let mut path: Vec<TxnId> = Vec::new();
            if let Some(victim) = Self::dfs(start, edges, &mut path, &mut done) {
                return Some(victim);
            }
        }
        None
    }

    fn dfs(
        node: TxnId,
        edges: &BTreeMap<TxnId, BTreeSet<TxnId>>,
        path: &mut Vec<TxnId>,
        done: &mut BTreeSet<TxnId>,
    ) -> Option<TxnId> {
        if let Some(cycle_start) = path.iter().position(|&n| n == node) {
            // back edge: the cycle is the path suffix from the revisited node
            return path[cycle_start..].iter().copied().max();
        }
        if done.contains(&node) {
            return None;
        }

        path.push(node);
        if let Some(targets) = edges.get(&node) {
            for &next in targets {
                if let Some(victim) = Self::dfs(next, edges, path, done) {
                    return Some(victim);
                }
            }
        }
        path.pop();
        done.insert(node);
        None
    }
}
