// ferrodb-core/src/transaction.rs
// Transaction coordinator: binds the lock manager and WAL into ACID
// transactions with lock-based isolation.
//
// Operations apply to the store and indexes at operation time under
// exclusive document locks; commit is a WAL prepare (durable commit
// record) followed by lock release; rollback physically reverts pending
// operations from their before-images in reverse order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::document::{Document, DocumentId};
use crate::error::{FerroError, Result};
use crate::index::IndexRegistry;
use crate::lock::{LockManager, LockMode, ResourceId};
use crate::store::DocumentStore;
use crate::wal::{WalManager, WalRecord, WalRecordKind};

pub type TransactionId = u64;

/// Which concurrent writes a transaction's reads may observe, realized by
/// lock acquisition policy rather than snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "read_uncommitted" | "readuncommitted" => Some(IsolationLevel::ReadUncommitted),
            "read_committed" | "readcommitted" => Some(IsolationLevel::ReadCommitted),
            "repeatable_read" | "repeatableread" => Some(IsolationLevel::RepeatableRead),
            "serializable" => Some(IsolationLevel::Serializable),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "read_uncommitted",
            IsolationLevel::ReadCommitted => "read_committed",
            IsolationLevel::RepeatableRead => "repeatable_read",
            IsolationLevel::Serializable => "serializable",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Preparing,
    Committed,
    RollingBack,
    RolledBack,
    /// Rolled back by the system (deadlock victim or timeout)
    Aborted,
    /// Commit-record write failed; in-memory effects were reverted
    Failed,
}

/// Why a rollback ran; decides the terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    Requested,
    Timeout,
    Deadlock,
}

/// One applied operation with the images needed to revert it.
#[derive(Debug, Clone)]
pub struct PendingOp {
    pub kind: WalRecordKind,
    pub collection: String,
    pub doc_id: DocumentId,
    pub before: Option<Document>,
    pub after: Option<Document>,
}

/// Savepoint: (next op index, held lock count) at creation time.
#[derive(Debug, Clone)]
pub struct Savepoint {
    pub name: String,
    pub op_index: usize,
    pub lock_count: usize,
}

#[derive(Debug)]
pub struct Transaction {
    pub id: TransactionId,
    pub isolation: IsolationLevel,
    pub state: TransactionState,
    pub started_at: Instant,
    pub started_at_wall: DateTime<Utc>,
    pub timeout: Duration,
    /// LSN of the begin record; written lazily at the first write op so
    /// read-only transactions leave no trace in the log
    pub begin_lsn: Option<u64>,
    pub pending_ops: Vec<PendingOp>,
    pub savepoints: Vec<Savepoint>,
}

impl Transaction {
    fn ensure_active(&self) -> Result<()> {
        if self.state == TransactionState::Active {
            Ok(())
        } else {
            Err(FerroError::TransactionInactive(self.id))
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.started_at) > self.timeout
    }
}

pub struct TransactionManager {
    store: Arc<DocumentStore>,
    indexes: Arc<IndexRegistry>,
    wal: Arc<WalManager>,
    locks: Arc<LockManager>,
    active: RwLock<HashMap<TransactionId, Arc<Mutex<Transaction>>>>,
    next_id: AtomicU64,
    default_isolation: IsolationLevel,
    default_timeout: Duration,
    lock_timeout: Duration,
}

impl TransactionManager {
    pub fn new(
        store: Arc<DocumentStore>,
        indexes: Arc<IndexRegistry>,
        wal: Arc<WalManager>,
        locks: Arc<LockManager>,
        default_isolation: IsolationLevel,
        default_timeout: Duration,
        lock_timeout: Duration,
    ) -> Self {
        TransactionManager {
            store,
            indexes,
            wal,
            locks,
            active: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            default_isolation,
            default_timeout,
            lock_timeout,
        }
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn default_isolation(&self) -> IsolationLevel {
        self.default_isolation
    }

    fn tx_handle(&self, tx_id: TransactionId) -> Result<Arc<Mutex<Transaction>>> {
        self.active
            .read()
            .get(&tx_id)
            .cloned()
            .ok_or(FerroError::TransactionInactive(tx_id))
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    pub fn begin(&self, isolation: Option<IsolationLevel>, timeout: Option<Duration>) -> Result<TransactionId> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let tx = Transaction {
            id,
            isolation: isolation.unwrap_or(self.default_isolation),
            state: TransactionState::Active,
            started_at: Instant::now(),
            started_at_wall: Utc::now(),
            timeout: timeout.unwrap_or(self.default_timeout),
            begin_lsn: None,
            pending_ops: Vec::new(),
            savepoints: Vec::new(),
        };
        debug!(tx = id, isolation = tx.isolation.as_str(), "transaction begin");
        self.active.write().insert(id, Arc::new(Mutex::new(tx)));
        Ok(id)
    }

    /// Two-phase commit: prepare (durable commit record), then apply
    /// (effects are already in place), mark committed, release locks.
    pub fn commit(&self, tx_id: TransactionId) -> Result<()> {
        let handle = self.tx_handle(tx_id)?;
        let mut tx = handle.lock();
        tx.ensure_active()?;
        tx.state = TransactionState::Preparing;

        if tx.begin_lsn.is_none() {
            // Read-only: nothing to make durable
            tx.state = TransactionState::Committed;
            drop(tx);
            self.forget(tx_id);
            return Ok(());
        }

        match self.wal.append(WalRecord::commit(tx_id)) {
            Ok(_) => {}
            Err(err) => {
                // Prepare failed: commit must not be reported; revert all
                // in-memory effects. A WAL write failure during commit is
                // fatal at process level - surface it loudly.
                error!(tx = tx_id, error = %err, "commit record write failed");
                tx.state = TransactionState::RollingBack;
                self.revert_ops(&mut tx, 0);
                tx.state = TransactionState::Failed;
                drop(tx);
                self.forget(tx_id);
                return Err(err);
            }
        }

        tx.state = TransactionState::Committed;
        debug!(tx = tx_id, ops = tx.pending_ops.len(), "transaction committed");
        drop(tx);
        self.forget(tx_id);
        Ok(())
    }

    pub fn rollback(&self, tx_id: TransactionId) -> Result<()> {
        self.abort(tx_id, AbortReason::Requested)
    }

    /// Roll a transaction back, reverting every pending op in reverse
    /// order from its stored images.
    pub fn abort(&self, tx_id: TransactionId, reason: AbortReason) -> Result<()> {
        let handle = self.tx_handle(tx_id)?;
        let mut tx = handle.lock();
        tx.ensure_active()?;
        tx.state = TransactionState::RollingBack;

        self.revert_ops(&mut tx, 0);
        if tx.begin_lsn.is_some() {
            if let Err(err) = self.wal.append(WalRecord::rollback(tx_id)) {
                error!(tx = tx_id, error = %err, "rollback record write failed");
            }
        }

        tx.state = match reason {
            AbortReason::Requested => TransactionState::RolledBack,
            AbortReason::Timeout | AbortReason::Deadlock => TransactionState::Aborted,
        };
        info!(tx = tx_id, reason = ?reason, "transaction rolled back");
        drop(tx);
        self.forget(tx_id);
        Ok(())
    }

    /// Drop the transaction from the active table and release its locks.
    fn forget(&self, tx_id: TransactionId) {
        self.active.write().remove(&tx_id);
        self.locks.release_all(tx_id);
    }

    /// Revert pending ops down to (exclusive) `keep`, in reverse order.
    fn revert_ops(&self, tx: &mut Transaction, keep: usize) {
        while tx.pending_ops.len() > keep {
            let op = tx.pending_ops.pop().expect("len checked");
            let manager = self.indexes.manager(&op.collection);
            let result: Result<()> = match op.kind {
                WalRecordKind::Insert => {
                    let doc = op.after.as_ref().expect("insert keeps after image");
                    manager.on_delete(doc);
                    self.store.remove_raw(&op.collection, &op.doc_id)
                }
                WalRecordKind::Update => {
                    // Document state first; a failed index revert must not
                    // leave the after-image in the store
                    let before = op.before.clone().expect("update keeps before image");
                    let after = op.after.as_ref().expect("update keeps after image");
                    self.store
                        .load_raw(&op.collection, before.clone())
                        .and_then(|_| manager.on_update(after, &before))
                }
                WalRecordKind::Delete => {
                    let before = op.before.clone().expect("delete keeps before image");
                    self.store
                        .load_raw(&op.collection, before.clone())
                        .and_then(|_| manager.on_insert(&before))
                }
                other => {
                    warn!(kind = ?other, "unexpected pending op kind during revert");
                    Ok(())
                }
            };
            if let Err(err) = result {
                // Keep reverting; a partial rollback is worse than a noisy one
                error!(
                    tx = tx.id,
                    kind = ?op.kind,
                    collection = %op.collection,
                    id = %op.doc_id,
                    error = %err,
                    "failed reverting pending op"
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Savepoints
    // ------------------------------------------------------------------

    pub fn savepoint(&self, tx_id: TransactionId, name: &str) -> Result<()> {
        let handle = self.tx_handle(tx_id)?;
        let mut tx = handle.lock();
        tx.ensure_active()?;
        let savepoint = Savepoint {
            name: name.to_string(),
            op_index: tx.pending_ops.len(),
            lock_count: self.locks.lock_count(tx_id),
        };
        tx.savepoints.retain(|s| s.name != name);
        tx.savepoints.push(savepoint);
        Ok(())
    }

    /// Revert ops above the savepoint and release locks acquired after it;
    /// the transaction stays Active.
    pub fn rollback_to_savepoint(&self, tx_id: TransactionId, name: &str) -> Result<()> {
        let handle = self.tx_handle(tx_id)?;
        let mut tx = handle.lock();
        tx.ensure_active()?;

        let position = tx
            .savepoints
            .iter()
            .rposition(|s| s.name == name)
            .ok_or_else(|| FerroError::Validation(format!("unknown savepoint '{}'", name)))?;
        let savepoint = tx.savepoints[position].clone();

        self.revert_ops(&mut tx, savepoint.op_index);

        let held = self.locks.held_locks(tx_id);
        for resource in held.iter().skip(savepoint.lock_count) {
            self.locks.release(tx_id, resource);
        }
        tx.savepoints.truncate(position + 1);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    /// Write the begin record before a transaction's first write op.
    fn ensure_wal_begin(&self, tx: &mut Transaction) -> Result<()> {
        if tx.begin_lsn.is_none() {
            tx.begin_lsn = Some(self.wal.append(WalRecord::begin(tx.id))?);
        }
        Ok(())
    }

    fn lock_write(&self, tx: &Transaction, collection: &str, id: &str) -> Result<()> {
        self.locks.acquire(
            tx.id,
            ResourceId::document(collection, id),
            LockMode::Exclusive,
            self.lock_timeout,
            None,
        )
    }

    /// Membership gate for serializable readers: writers pass through the
    /// collection's range resource so a held range S blocks phantoms. The
    /// gate is released right after the operation, not at commit.
    fn pass_range_gate(&self, tx: &Transaction, collection: &str) -> Result<ResourceId> {
        let resource = ResourceId::range(collection);
        self.locks.acquire(
            tx.id,
            resource.clone(),
            LockMode::Exclusive,
            self.lock_timeout,
            None,
        )?;
        Ok(resource)
    }

    pub fn insert(
        &self,
        tx_id: TransactionId,
        collection: &str,
        data: Map<String, Value>,
        id: Option<DocumentId>,
    ) -> Result<Document> {
        let handle = self.tx_handle(tx_id)?;
        let mut tx = handle.lock();
        tx.ensure_active()?;
        self.store.collection(collection)?;

        let id = id.unwrap_or_else(Document::generate_id);
        if id.is_empty() {
            return Err(FerroError::Validation("document _id must be non-empty".into()));
        }

        self.guarded(&mut tx, |this, tx| {
            this.lock_write(tx, collection, &id)?;
            let gate = this.pass_range_gate(tx, collection)?;
            this.ensure_wal_begin(tx)?;

            let result = (|| -> Result<Document> {
                // Safe under the document X lock: a concurrent insert of
                // the same id serializes on it
                if this.store.get(collection, &id)?.is_some() {
                    return Err(FerroError::DuplicateId(id.clone()));
                }
                let doc = Document::new(id.clone(), data.clone());

                // Apply first, log after: the op record may only exist for
                // an operation that actually took effect, otherwise a
                // committed transaction would replay a failed op.
                let manager = this.indexes.manager(collection);
                manager.on_insert(&doc)?;
                if let Err(err) = this.store.load_raw(collection, doc.clone()) {
                    manager.on_delete(&doc);
                    return Err(err);
                }
                if let Err(err) = this.wal.append_op(
                    tx.id,
                    WalRecordKind::Insert,
                    collection,
                    &doc.id,
                    None,
                    Some(serde_json::to_value(&doc)?),
                ) {
                    let _ = this.store.remove_raw(collection, &doc.id);
                    manager.on_delete(&doc);
                    return Err(err);
                }

                tx.pending_ops.push(PendingOp {
                    kind: WalRecordKind::Insert,
                    collection: collection.to_string(),
                    doc_id: doc.id.clone(),
                    before: None,
                    after: Some(doc.clone()),
                });
                Ok(doc)
            })();

            this.locks.release(tx.id, &gate);
            result
        })
    }

    pub fn update(
        &self,
        tx_id: TransactionId,
        collection: &str,
        id: &str,
        data: Map<String, Value>,
    ) -> Result<Document> {
        let handle = self.tx_handle(tx_id)?;
        let mut tx = handle.lock();
        tx.ensure_active()?;
        self.store.collection(collection)?;

        self.guarded(&mut tx, |this, tx| {
            this.lock_write(tx, collection, id)?;
            let gate = this.pass_range_gate(tx, collection)?;
            this.ensure_wal_begin(tx)?;

            let result = (|| -> Result<Document> {
                let before = this
                    .store
                    .get(collection, id)?
                    .ok_or_else(|| FerroError::DocumentNotFound(format!("{}/{}", collection, id)))?;
                let mut after = before.clone();
                after.replace_data(data.clone());

                let manager = this.indexes.manager(collection);
                manager.on_update(&before, &after)?;
                if let Err(err) = this.store.load_raw(collection, after.clone()) {
                    let _ = manager.on_update(&after, &before);
                    return Err(err);
                }
                if let Err(err) = this.wal.append_op(
                    tx.id,
                    WalRecordKind::Update,
                    collection,
                    id,
                    Some(serde_json::to_value(&before)?),
                    Some(serde_json::to_value(&after)?),
                ) {
                    let _ = this.store.load_raw(collection, before.clone());
                    let _ = manager.on_update(&after, &before);
                    return Err(err);
                }

                tx.pending_ops.push(PendingOp {
                    kind: WalRecordKind::Update,
                    collection: collection.to_string(),
                    doc_id: id.to_string(),
                    before: Some(before),
                    after: Some(after.clone()),
                });
                Ok(after)
            })();

            this.locks.release(tx.id, &gate);
            result
        })
    }

    pub fn delete(&self, tx_id: TransactionId, collection: &str, id: &str) -> Result<bool> {
        let handle = self.tx_handle(tx_id)?;
        let mut tx = handle.lock();
        tx.ensure_active()?;
        self.store.collection(collection)?;

        self.guarded(&mut tx, |this, tx| {
            this.lock_write(tx, collection, id)?;
            let gate = this.pass_range_gate(tx, collection)?;
            this.ensure_wal_begin(tx)?;

            let result = (|| -> Result<bool> {
                let before = match this.store.get(collection, id)? {
                    Some(doc) => doc,
                    None => return Ok(false),
                };

                let manager = this.indexes.manager(collection);
                manager.on_delete(&before);
                if let Err(err) = this.store.remove_raw(collection, id) {
                    let _ = manager.on_insert(&before);
                    return Err(err);
                }
                if let Err(err) = this.wal.append_op(
                    tx.id,
                    WalRecordKind::Delete,
                    collection,
                    id,
                    Some(serde_json::to_value(&before)?),
                    None,
                ) {
                    let _ = this.store.load_raw(collection, before.clone());
                    let _ = manager.on_insert(&before);
                    return Err(err);
                }

                tx.pending_ops.push(PendingOp {
                    kind: WalRecordKind::Delete,
                    collection: collection.to_string(),
                    doc_id: id.to_string(),
                    before: Some(before),
                    after: None,
                });
                Ok(true)
            })();

            this.locks.release(tx.id, &gate);
            result
        })
    }

    /// Isolation-aware point read.
    pub fn get(&self, tx_id: TransactionId, collection: &str, id: &str) -> Result<Option<Document>> {
        let handle = self.tx_handle(tx_id)?;
        let mut tx = handle.lock();
        tx.ensure_active()?;
        self.store.collection(collection)?;

        self.guarded(&mut tx, |this, tx| {
            let resource = ResourceId::document(collection, id);
            // A lock this transaction already owns (its own earlier write)
            // must survive the read at every level
            let pre_held = this.locks.holds(tx.id, &resource).is_some();
            match tx.isolation {
                IsolationLevel::ReadUncommitted => {}
                IsolationLevel::ReadCommitted
                | IsolationLevel::RepeatableRead
                | IsolationLevel::Serializable => {
                    this.locks.acquire(
                        tx.id,
                        resource.clone(),
                        LockMode::Shared,
                        this.lock_timeout,
                        None,
                    )?;
                    if tx.isolation == IsolationLevel::Serializable {
                        this.locks.acquire(
                            tx.id,
                            ResourceId::range(collection),
                            LockMode::Shared,
                            this.lock_timeout,
                            None,
                        )?;
                    }
                }
            }

            let doc = this.store.get(collection, id)?;
            if tx.isolation == IsolationLevel::ReadCommitted && !pre_held {
                // S released immediately after the read
                this.locks.release(tx.id, &resource);
            }
            Ok(doc)
        })
    }

    /// Take the scan-level read lock for a collection per the transaction's
    /// isolation. Returns the resource to release for ReadCommitted scans
    /// (held-to-commit levels return None).
    pub fn scan_lock(&self, tx_id: TransactionId, collection: &str) -> Result<Option<ResourceId>> {
        let handle = self.tx_handle(tx_id)?;
        let mut tx = handle.lock();
        tx.ensure_active()?;

        self.guarded(&mut tx, |this, tx| {
            let resource = ResourceId::range(collection);
            match tx.isolation {
                IsolationLevel::ReadUncommitted => Ok(None),
                IsolationLevel::ReadCommitted => {
                    let pre_held = this.locks.holds(tx.id, &resource).is_some();
                    this.locks.acquire(
                        tx.id,
                        resource.clone(),
                        LockMode::Shared,
                        this.lock_timeout,
                        None,
                    )?;
                    // Only a lock this scan itself took gets released after
                    Ok(if pre_held { None } else { Some(resource) })
                }
                IsolationLevel::RepeatableRead | IsolationLevel::Serializable => {
                    // Range S held until commit
                    this.locks.acquire(
                        tx.id,
                        resource,
                        LockMode::Shared,
                        this.lock_timeout,
                        None,
                    )?;
                    Ok(None)
                }
            }
        })
    }

    pub fn release_scan_lock(&self, tx_id: TransactionId, resource: &ResourceId) {
        self.locks.release(tx_id, resource);
    }

    /// Run an operation body; a deadlock verdict from the lock manager
    /// aborts the transaction before the error propagates.
    fn guarded<T>(
        &self,
        tx: &mut Transaction,
        body: impl FnOnce(&Self, &mut Transaction) -> Result<T>,
    ) -> Result<T> {
        match body(self, tx) {
            Err(FerroError::Deadlock(id)) => {
                warn!(tx = id, "transaction aborted as deadlock victim");
                tx.state = TransactionState::RollingBack;
                self.revert_ops(tx, 0);
                if tx.begin_lsn.is_some() {
                    if let Err(err) = self.wal.append(WalRecord::rollback(id)) {
                        error!(tx = id, error = %err, "rollback record write failed");
                    }
                }
                tx.state = TransactionState::Aborted;
                self.active.write().remove(&id);
                self.locks.release_all(id);
                Err(FerroError::Deadlock(id))
            }
            other => other,
        }
    }

    // ------------------------------------------------------------------
    // Auto-commit and housekeeping
    // ------------------------------------------------------------------

    /// Wrap one operation in its own transaction so WAL invariants hold
    /// for non-transactional writes too.
    pub fn with_auto_commit<T>(
        &self,
        isolation: Option<IsolationLevel>,
        body: impl FnOnce(TransactionId) -> Result<T>,
    ) -> Result<T> {
        let tx_id = self.begin(isolation, None)?;
        match body(tx_id) {
            Ok(value) => {
                self.commit(tx_id)?;
                Ok(value)
            }
            Err(err) => {
                // A deadlock victim is already rolled back by the guard
                if self.is_active(tx_id) {
                    if let Err(rb) = self.rollback(tx_id) {
                        warn!(tx = tx_id, error = %rb, "auto-commit rollback failed");
                    }
                }
                Err(err)
            }
        }
    }

    pub fn is_active(&self, tx_id: TransactionId) -> bool {
        self.active.read().contains_key(&tx_id)
    }

    pub fn isolation_of(&self, tx_id: TransactionId) -> Result<IsolationLevel> {
        let handle = self.tx_handle(tx_id)?;
        let tx = handle.lock();
        Ok(tx.isolation)
    }

    pub fn active_count(&self) -> usize {
        self.active.read().len()
    }

    /// Oldest LSN still needed by an active writing transaction
    /// (checkpoint floor). Read-only transactions have no WAL footprint.
    pub fn min_active_lsn(&self) -> Option<u64> {
        let active = self.active.read();
        active
            .values()
            .filter_map(|handle| handle.try_lock().and_then(|tx| tx.begin_lsn))
            .min()
    }

    /// Abort every transaction whose deadline has passed. Returns the ids
    /// that were aborted.
    pub fn sweep_timeouts(&self) -> Vec<TransactionId> {
        let now = Instant::now();
        let expired: Vec<TransactionId> = {
            let active = self.active.read();
            active
                .iter()
                .filter_map(|(id, handle)| {
                    // Skip transactions mid-operation; next sweep gets them
                    let tx = handle.try_lock()?;
                    (tx.state == TransactionState::Active && tx.is_expired(now)).then_some(*id)
                })
                .collect()
        };

        let mut aborted = Vec::new();
        for id in expired {
            match self.abort(id, AbortReason::Timeout) {
                Ok(()) => {
                    info!(tx = id, "transaction aborted by timeout sweeper");
                    aborted.push(id);
                }
                Err(FerroError::TransactionInactive(_)) => {}
                Err(err) => warn!(tx = id, error = %err, "timeout abort failed"),
            }
        }
        aborted
    }
}
