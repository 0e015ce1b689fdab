// ferrodb-core/src/database.rs
// Database facade: wires store, catalog, WAL, locks, transactions,
// indexes, query execution and cursors behind one handle.
//
// Open sequence: catalog -> document load -> WAL replay -> index rebuild
// -> checkpoint -> background sweepers. Shutdown stops the sweepers,
// flushes the write queue and leaves a fresh checkpoint behind.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tracing::{error, info, warn};

use crate::catalog::CatalogStore;
use crate::config::Config;
use crate::cursor::{CursorManager, CursorReply};
use crate::document::{Document, DocumentId};
use crate::error::{FerroError, Result};
use crate::index::{ttl, IndexDefinition, IndexRegistry, IndexStats};
use crate::lock::{LockManager, LockMode, ResourceId};
use crate::query::executor::{self, QueryPlan};
use crate::query::filter::EvalContext;
use crate::query::{aggregation::Pipeline, FilterExpr, Query};
use crate::store::{DocumentStore, WriteFailure};
use crate::transaction::{IsolationLevel, TransactionId, TransactionManager};
use crate::update::{apply_update_operators, is_operator_update};
use crate::wal::{recovery, WalManager, WalRecordKind};

/// Background sweeper tick; long intervals accumulate over ticks so
/// shutdown never waits on a sleeping thread for more than this.
const SWEEP_TICK: Duration = Duration::from_millis(50);

pub struct Database {
    config: Config,
    store: Arc<DocumentStore>,
    catalog: Arc<CatalogStore>,
    indexes: Arc<IndexRegistry>,
    wal: Arc<WalManager>,
    locks: Arc<LockManager>,
    txns: Arc<TransactionManager>,
    cursors: Arc<CursorManager>,
    shutdown: Arc<AtomicBool>,
    background: Mutex<Vec<JoinHandle<()>>>,
    started_at: chrono::DateTime<Utc>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

impl Database {
    /// Open (or create) a database at the configured data path, running
    /// WAL recovery and index rebuild before anything is served.
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        // No-op when the embedder already installed its own subscriber
        crate::logging::init(&config.logging.level);

        let data_path = config.storage.data_path.clone();
        let store = Arc::new(DocumentStore::open(
            &data_path,
            config.storage.write_queue_workers,
            config.storage.write_queue_capacity,
        )?);
        let catalog = Arc::new(CatalogStore::load(&data_path)?);

        // Catalog and directory listing converge: catalog-only collections
        // get their directory back, untracked directories get adopted
        for name in catalog.collections() {
            if !store.has_collection(&name) {
                store.create_collection(&name)?;
            }
        }
        for name in store.list_collections() {
            if !catalog.contains(&name) {
                catalog.add_collection(&name)?;
            }
        }

        let wal = Arc::new(WalManager::open(
            data_path.join("wal"),
            config.performance.wal_segment_max_bytes,
            config.performance.wal_sync_watermark,
        )?);

        // Replay committed transactions in LSN order
        let (ops, stats) = recovery::replay(&data_path, config.storage.skip_corrupted_wal)?;
        for op in ops {
            if !store.has_collection(&op.collection) {
                store.create_collection(&op.collection)?;
                catalog.add_collection(&op.collection)?;
            }
            match op.kind {
                WalRecordKind::Insert | WalRecordKind::Update => {
                    let doc = op.after.expect("recovery keeps images for writes");
                    store.load_raw(&op.collection, doc)?;
                }
                WalRecordKind::Delete => {
                    store.remove_raw(&op.collection, &op.doc_id)?;
                }
                _ => {}
            }
        }
        store.flush()?;
        if stats.applied_ops > 0 {
            info!(
                ops = stats.applied_ops,
                committed = stats.committed_transactions,
                "recovery applied committed operations"
            );
        }

        // Rebuild indexes from documents (definitions persist, trees don't)
        let indexes = Arc::new(IndexRegistry::new(config.performance.btree_order));
        for collection in catalog.collections() {
            let manager = indexes.manager(&collection);
            let docs = store.scan(&collection)?;
            for def in catalog.indexes_of(&collection)? {
                let name = def.name.clone();
                if let Err(err) = manager.create_index(def, docs.iter()) {
                    // Keep serving; the operator can REINDEX after fixing data
                    error!(
                        index = %name,
                        collection = %collection,
                        error = %err,
                        "index rebuild failed"
                    );
                }
            }
        }

        let locks = Arc::new(LockManager::new());
        let default_isolation = IsolationLevel::parse(&config.transaction.default_isolation)
            .expect("validated in Config::validate");
        let txns = Arc::new(TransactionManager::new(
            store.clone(),
            indexes.clone(),
            wal.clone(),
            locks.clone(),
            default_isolation,
            Duration::from_secs(config.transaction.timeout_secs),
            Duration::from_millis(config.transaction.lock_timeout_ms),
        ));
        let cursors = Arc::new(CursorManager::new(
            Duration::from_secs(config.performance.cursor_timeout_secs),
            config.performance.cursor_default_batch,
        ));

        // Replayed segments are subsumed by a fresh checkpoint
        wal.checkpoint(wal.next_lsn())?;

        let db = Database {
            config,
            store,
            catalog,
            indexes,
            wal,
            locks,
            txns,
            cursors,
            shutdown: Arc::new(AtomicBool::new(false)),
            background: Mutex::new(Vec::new()),
            started_at: Utc::now(),
        };
        db.spawn_sweepers();
        Ok(db)
    }

    /// Open with default configuration rooted at `data_path` (tests, CLI).
    pub fn open_at(data_path: impl Into<std::path::PathBuf>) -> Result<Self> {
        let mut config = Config::default();
        config.storage.data_path = data_path.into();
        Self::open(config)
    }

    fn spawn_sweepers(&self) {
        let mut background = self.background.lock();

        background.push(self.spawn_ticker(
            "ferrodb-deadlock",
            Duration::from_millis(self.config.transaction.deadlock_interval_ms),
            {
                let locks = self.locks.clone();
                move || {
                    locks.detect_once();
                }
            },
        ));
        background.push(self.spawn_ticker("ferrodb-tx-sweeper", Duration::from_secs(1), {
            let txns = self.txns.clone();
            let cursors = self.cursors.clone();
            move || {
                for tx in txns.sweep_timeouts() {
                    cursors.kill_owned_by(tx);
                }
            }
        }));
        background.push(self.spawn_ticker(
            "ferrodb-cursor-sweeper",
            Duration::from_secs(self.config.performance.cursor_timeout_secs.clamp(1, 30)),
            {
                let cursors = self.cursors.clone();
                move || {
                    cursors.sweep_idle();
                }
            },
        ));
        background.push(self.spawn_ticker(
            "ferrodb-ttl-sweeper",
            Duration::from_secs(self.config.performance.ttl_sweep_interval_secs),
            {
                let txns = self.txns.clone();
                let indexes = self.indexes.clone();
                move || {
                    sweep_expired(&txns, &indexes);
                }
            },
        ));
    }

    /// Periodic worker that sleeps in short ticks so shutdown stays fast.
    fn spawn_ticker(
        &self,
        name: &str,
        interval: Duration,
        mut job: impl FnMut() + Send + 'static,
    ) -> JoinHandle<()> {
        let shutdown = self.shutdown.clone();
        std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut elapsed = Duration::ZERO;
                while !shutdown.load(Ordering::Acquire) {
                    std::thread::sleep(SWEEP_TICK);
                    elapsed += SWEEP_TICK;
                    if elapsed >= interval {
                        elapsed = Duration::ZERO;
                        job();
                    }
                }
            })
            .expect("spawn background sweeper")
    }

    // ------------------------------------------------------------------
    // Collection lifecycle
    // ------------------------------------------------------------------

    pub fn create_collection(&self, name: &str) -> Result<()> {
        self.store.create_collection(name)?;
        self.catalog.add_collection(name)?;
        Ok(())
    }

    pub fn drop_collection(&self, name: &str) -> Result<bool> {
        let existed = self.store.drop_collection(name)?;
        if existed {
            self.indexes.remove(name);
            self.catalog.remove_collection(name)?;
        }
        Ok(existed)
    }

    pub fn list_collections(&self) -> Vec<String> {
        self.store.list_collections()
    }

    pub fn collection_stats(&self, name: &str) -> Result<Value> {
        let count = self.store.count(name)?;
        let index_stats: Vec<IndexStats> = self.indexes.manager(name).stats();
        Ok(json!({
            "collection": name,
            "document_count": count,
            "indexes": serde_json::to_value(index_stats)?,
        }))
    }

    // ------------------------------------------------------------------
    // Document operations (session transaction or auto-commit)
    // ------------------------------------------------------------------

    fn run_in_tx<T>(
        &self,
        session: Option<TransactionId>,
        body: impl FnOnce(TransactionId) -> Result<T>,
    ) -> Result<T> {
        match session {
            Some(tx) => body(tx),
            None => self.txns.with_auto_commit(None, body),
        }
    }

    /// Insert a document given its wire shape (`_id` optional).
    pub fn insert(
        &self,
        session: Option<TransactionId>,
        collection: &str,
        doc: Value,
    ) -> Result<Document> {
        let parsed = Document::from_value(doc)?;
        let (id, data) = (parsed.id, parsed.data);
        self.run_in_tx(session, |tx| self.txns.insert(tx, collection, data.clone(), Some(id.clone())))
    }

    pub fn get(
        &self,
        session: Option<TransactionId>,
        collection: &str,
        id: &str,
    ) -> Result<Option<Document>> {
        self.run_in_tx(session, |tx| self.txns.get(tx, collection, id))
    }

    /// Full replace of a document's data; optional optimistic version gate.
    pub fn replace(
        &self,
        session: Option<TransactionId>,
        collection: &str,
        id: &str,
        data: Map<String, Value>,
        expected_version: Option<u64>,
    ) -> Result<Document> {
        self.run_in_tx(session, |tx| {
            self.check_version(tx, collection, id, expected_version)?;
            self.txns.update(tx, collection, id, data.clone())
        })
    }

    /// Operator-style partial update ($set/$inc/...).
    pub fn patch(
        &self,
        session: Option<TransactionId>,
        collection: &str,
        id: &str,
        update: Map<String, Value>,
        expected_version: Option<u64>,
    ) -> Result<Document> {
        if !is_operator_update(&update)? {
            return Err(FerroError::Validation(
                "PATCH requires update operators; use REPLACE for full documents".into(),
            ));
        }
        self.run_in_tx(session, |tx| {
            self.check_version(tx, collection, id, expected_version)?;
            let current = self
                .txns
                .get(tx, collection, id)?
                .ok_or_else(|| FerroError::DocumentNotFound(format!("{}/{}", collection, id)))?;
            let data = apply_update_operators(&current.data, &update)?;
            self.txns.update(tx, collection, id, data)
        })
    }

    /// Insert-or-replace keyed on `_id`.
    pub fn upsert(
        &self,
        session: Option<TransactionId>,
        collection: &str,
        doc: Value,
    ) -> Result<Document> {
        let parsed = Document::from_value(doc)?;
        let (id, data) = (parsed.id, parsed.data);
        self.run_in_tx(session, |tx| {
            if self.txns.get(tx, collection, &id)?.is_some() {
                self.txns.update(tx, collection, &id, data.clone())
            } else {
                self.txns.insert(tx, collection, data.clone(), Some(id.clone()))
            }
        })
    }

    pub fn delete(
        &self,
        session: Option<TransactionId>,
        collection: &str,
        id: &str,
        expected_version: Option<u64>,
    ) -> Result<bool> {
        self.run_in_tx(session, |tx| {
            if expected_version.is_some() {
                self.check_version(tx, collection, id, expected_version)?;
            }
            self.txns.delete(tx, collection, id)
        })
    }

    fn check_version(
        &self,
        tx: TransactionId,
        collection: &str,
        id: &str,
        expected: Option<u64>,
    ) -> Result<()> {
        let expected = match expected {
            Some(v) => v,
            None => return Ok(()),
        };
        let current = self
            .txns
            .get(tx, collection, id)?
            .ok_or_else(|| FerroError::DocumentNotFound(format!("{}/{}", collection, id)))?;
        if current.meta.version != expected {
            return Err(FerroError::TransactionConflict(format!(
                "version mismatch on {}/{}: expected {}, found {}",
                collection, id, expected, current.meta.version
            )));
        }
        Ok(())
    }

    pub fn exists(&self, session: Option<TransactionId>, collection: &str, id: &str) -> Result<bool> {
        Ok(self.get(session, collection, id)?.is_some())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    fn eval_context(&self) -> EvalContext {
        EvalContext::with_budget(Duration::from_millis(self.config.performance.regex_timeout_ms))
    }

    /// Run a query inside a transaction, honoring its isolation level for
    /// every document it touches. Returns finalized result documents.
    fn find_docs(&self, tx: TransactionId, collection: &str, query: &Query) -> Result<Vec<Value>> {
        self.store.collection(collection)?;
        let scan_lock = self.txns.scan_lock(tx, collection)?;

        let result = (|| -> Result<Vec<Value>> {
            let manager = self.indexes.manager(collection);
            let plan = executor::plan(query, &manager);

            let candidate_ids: Vec<DocumentId> = match plan.candidate_ids() {
                Some(ids) => ids,
                None => self.store.collection(collection)?.ids(),
            };

            let ctx = self.eval_context();
            let mut rows = Vec::new();
            for id in candidate_ids {
                // Isolation-aware fetch: the read lock policy applies to
                // every candidate the plan produces
                let doc = match self.txns.get(tx, collection, &id)? {
                    Some(doc) => doc,
                    None => continue,
                };
                let value = doc.to_value();
                if plan.residual.evaluate(&value, &ctx)? {
                    rows.push(value);
                }
            }
            Ok(executor::finalize(rows, query, plan.sort_satisfied))
        })();

        if let Some(resource) = scan_lock {
            self.txns.release_scan_lock(tx, &resource);
        }
        result
    }

    /// FIND: parse, execute, and open a cursor over the result.
    pub fn find(
        &self,
        session: Option<TransactionId>,
        collection: &str,
        query_doc: &Value,
        batch_size: Option<usize>,
    ) -> Result<CursorReply> {
        let query = Query::parse(query_doc)?;
        let rows = self.run_in_tx(session, |tx| self.find_docs(tx, collection, &query))?;
        Ok(self.cursors.open(rows, batch_size, session))
    }

    /// FIND with the whole result materialized (CLI, aggregation source).
    pub fn find_all(
        &self,
        session: Option<TransactionId>,
        collection: &str,
        query_doc: &Value,
    ) -> Result<Vec<Value>> {
        let query = Query::parse(query_doc)?;
        self.run_in_tx(session, |tx| self.find_docs(tx, collection, &query))
    }

    pub fn find_one(
        &self,
        session: Option<TransactionId>,
        collection: &str,
        query_doc: &Value,
    ) -> Result<Option<Value>> {
        let mut query = Query::parse(query_doc)?;
        query.limit = Some(1);
        let rows = self.run_in_tx(session, |tx| self.find_docs(tx, collection, &query))?;
        Ok(rows.into_iter().next())
    }

    pub fn count(
        &self,
        session: Option<TransactionId>,
        collection: &str,
        filter: Option<&Value>,
    ) -> Result<usize> {
        match filter {
            None | Some(Value::Null) => self.store.count(collection),
            Some(filter) => {
                let query = Query::from_filter(filter)?;
                Ok(self
                    .run_in_tx(session, |tx| self.find_docs(tx, collection, &query))?
                    .len())
            }
        }
    }

    pub fn distinct(
        &self,
        session: Option<TransactionId>,
        collection: &str,
        field: &str,
        filter: Option<&Value>,
    ) -> Result<Vec<Value>> {
        let query = match filter {
            Some(filter) => Query::from_filter(filter)?,
            None => Query::default(),
        };
        let rows = self.run_in_tx(session, |tx| self.find_docs(tx, collection, &query))?;

        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for row in &rows {
            if let Some(value) = crate::value_utils::get_nested_value(row, field) {
                let key = serde_json::to_string(value).unwrap_or_default();
                if seen.insert(key) {
                    out.push(value.clone());
                }
            }
        }
        Ok(out)
    }

    /// EXPLAIN: the chosen plan without executing it.
    pub fn explain(&self, collection: &str, query_doc: &Value) -> Result<Value> {
        self.store.collection(collection)?;
        let query = Query::parse(query_doc)?;
        let manager = self.indexes.manager(collection);
        let plan: QueryPlan = executor::plan(&query, &manager);
        Ok(json!({
            "collection": collection,
            "plan": plan.explain(),
        }))
    }

    /// AGGREGATE with leading $match/$limit pushed into the source scan.
    pub fn aggregate(
        &self,
        session: Option<TransactionId>,
        collection: &str,
        pipeline_doc: &Value,
    ) -> Result<Vec<Value>> {
        let pipeline = Pipeline::from_json(pipeline_doc)?;
        let (pushed_filter, pushed_limit, rest) = pipeline.pushdown();

        let source_query = Query {
            filter: pushed_filter.cloned().unwrap_or(FilterExpr::All),
            limit: pushed_limit,
            ..Query::default()
        };
        let source = self.run_in_tx(session, |tx| self.find_docs(tx, collection, &source_query))?;
        Pipeline::execute_stages(rest, source, &self.eval_context())
    }

    /// FIND_AND_MODIFY: atomically update (or delete) the first match.
    pub fn find_and_modify(
        &self,
        session: Option<TransactionId>,
        collection: &str,
        filter: &Value,
        update: Option<&Map<String, Value>>,
        remove: bool,
        return_new: bool,
    ) -> Result<Option<Value>> {
        let query = Query::from_filter(filter)?;
        self.run_in_tx(session, |tx| {
            let mut matches = self.find_docs(tx, collection, &query)?;
            let first = match matches.drain(..).next() {
                Some(doc) => doc,
                None => return Ok(None),
            };
            let id = first
                .get("_id")
                .and_then(|v| v.as_str())
                .ok_or_else(|| FerroError::Internal("result without _id".into()))?
                .to_string();

            if remove {
                self.txns.delete(tx, collection, &id)?;
                return Ok(Some(first));
            }

            let update = update.ok_or_else(|| {
                FerroError::Validation("FIND_AND_MODIFY requires update or remove".into())
            })?;
            let current = self
                .txns
                .get(tx, collection, &id)?
                .ok_or_else(|| FerroError::DocumentNotFound(format!("{}/{}", collection, id)))?;
            let data = if is_operator_update(update)? {
                apply_update_operators(&current.data, update)?
            } else {
                update.clone()
            };
            let after = self.txns.update(tx, collection, &id, data)?;
            Ok(Some(if return_new { after.to_value() } else { first }))
        })
    }

    // ------------------------------------------------------------------
    // Cursors
    // ------------------------------------------------------------------

    pub fn get_more(&self, cursor_id: u64, batch_size: Option<usize>) -> Result<CursorReply> {
        self.cursors.next_batch(cursor_id, batch_size)
    }

    pub fn kill_cursor(&self, cursor_id: u64) -> bool {
        self.cursors.kill(cursor_id)
    }

    // ------------------------------------------------------------------
    // Index administration
    // ------------------------------------------------------------------

    /// Create an index, backfilled under the collection's range gate so
    /// concurrent writers cannot slip past the build.
    pub fn create_index(&self, collection: &str, def: IndexDefinition) -> Result<()> {
        self.store.collection(collection)?;
        self.txns.with_auto_commit(None, |tx| {
            self.locks().acquire(
                tx,
                ResourceId::range(collection),
                LockMode::Exclusive,
                Duration::from_millis(self.config.transaction.lock_timeout_ms),
                None,
            )?;
            let docs = self.store.scan(collection)?;
            self.indexes.manager(collection).create_index(def.clone(), docs.iter())?;
            self.catalog.add_index(collection, &def)?;
            Ok(())
        })
    }

    pub fn drop_index(&self, collection: &str, name: &str) -> Result<()> {
        self.indexes.manager(collection).drop_index(name)?;
        self.catalog.remove_index(collection, name)?;
        Ok(())
    }

    pub fn list_indexes(&self, collection: &str) -> Result<Vec<IndexDefinition>> {
        self.store.collection(collection)?;
        Ok(self.indexes.manager(collection).list())
    }

    pub fn index_stats(&self, collection: &str) -> Result<Vec<IndexStats>> {
        self.store.collection(collection)?;
        Ok(self.indexes.manager(collection).stats())
    }

    /// Rebuild one index (or all of a collection's) from documents.
    pub fn reindex(&self, collection: &str, index_name: Option<&str>) -> Result<usize> {
        self.store.collection(collection)?;
        self.txns.with_auto_commit(None, |tx| {
            self.locks().acquire(
                tx,
                ResourceId::range(collection),
                LockMode::Exclusive,
                Duration::from_millis(self.config.transaction.lock_timeout_ms),
                None,
            )?;
            let docs = self.store.scan(collection)?;
            let manager = self.indexes.manager(collection);
            let names: Vec<String> = match index_name {
                Some(name) => vec![name.to_string()],
                None => manager.list().into_iter().map(|d| d.name).collect(),
            };
            for name in &names {
                manager.rebuild(name, docs.iter())?;
            }
            Ok(names.len())
        })
    }

    // ------------------------------------------------------------------
    // Transactions (session surface)
    // ------------------------------------------------------------------

    pub fn begin(&self, isolation: Option<IsolationLevel>) -> Result<TransactionId> {
        self.txns.begin(isolation, None)
    }

    pub fn commit(&self, tx: TransactionId) -> Result<()> {
        self.cursors.kill_owned_by(tx);
        self.txns.commit(tx)
    }

    pub fn rollback(&self, tx: TransactionId) -> Result<()> {
        self.cursors.kill_owned_by(tx);
        self.txns.rollback(tx)
    }

    pub fn savepoint(&self, tx: TransactionId, name: &str) -> Result<()> {
        self.txns.savepoint(tx, name)
    }

    pub fn rollback_to_savepoint(&self, tx: TransactionId, name: &str) -> Result<()> {
        self.txns.rollback_to_savepoint(tx, name)
    }

    pub fn transactions(&self) -> &Arc<TransactionManager> {
        &self.txns
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    // ------------------------------------------------------------------
    // Operations and introspection
    // ------------------------------------------------------------------

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn info(&self) -> Value {
        json!({
            "name": "ferrodb",
            "version": env!("CARGO_PKG_VERSION"),
            "started_at": self.started_at.to_rfc3339(),
            "collections": self.list_collections().len(),
            "active_transactions": self.txns.active_count(),
            "open_cursors": self.cursors.open_count(),
            "next_lsn": self.wal.next_lsn(),
        })
    }

    /// Force a checkpoint at the current oldest-active-transaction LSN.
    pub fn checkpoint(&self) -> Result<u64> {
        let min = self
            .txns
            .min_active_lsn()
            .unwrap_or_else(|| self.wal.next_lsn());
        let info = self.wal.checkpoint(min)?;
        Ok(info.checkpoint_lsn)
    }

    /// Block until all enqueued document writes are on disk.
    pub fn flush(&self) -> Result<()> {
        self.store.flush()
    }

    /// Durability failures since the last call (operator surface).
    pub fn take_write_failures(&self) -> Vec<WriteFailure> {
        self.store.take_write_failures()
    }

    /// One TTL sweep over every collection; returns deleted count.
    /// The periodic sweeper calls this on its own schedule.
    pub fn sweep_ttl_once(&self) -> usize {
        sweep_expired(&self.txns, &self.indexes)
    }

    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        for handle in self.background.lock().drain(..) {
            let _ = handle.join();
        }
        self.store.shutdown();
        if let Err(err) = self.checkpoint() {
            warn!(error = %err, "final checkpoint failed");
        }
        info!("database shut down");
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Delete every expired document reachable through TTL indexes, each one
/// through the regular transactional delete path under a system
/// transaction, so indexes and the WAL stay consistent.
fn sweep_expired(txns: &TransactionManager, indexes: &IndexRegistry) -> usize {
    let now = Utc::now();
    let mut deleted = 0usize;
    for collection in indexes.collections() {
        let manager = indexes.manager(&collection);
        let index = match manager.ttl_index() {
            Some(index) => index,
            None => continue,
        };
        for id in ttl::expired_ids(&index, now) {
            match txns.with_auto_commit(None, |tx| txns.delete(tx, &collection, &id)) {
                Ok(true) => deleted += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(collection = %collection, id = %id, error = %err, "TTL delete failed");
                }
            }
        }
    }
    if deleted > 0 {
        info!(deleted, "TTL sweep removed expired documents");
    }
    deleted
}
