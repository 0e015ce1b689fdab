// ferrodb-core/src/lock.rs
// Shared/exclusive lock manager with wait-for-graph deadlock detection
//
// One table mutex plus a broadcast condvar: waiters re-evaluate their own
// grant condition on every wakeup, which keeps the grant rules (FIFO, no
// passing a conflicting earlier waiter, atomic upgrade ahead of other
// waiters) in exactly one place. The wait-for graph stores transaction ids
// only, never references into the tables.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::{AHashMap, AHashSet};
use parking_lot::{Condvar, Mutex};

use tracing::info;

use crate::error::{FerroError, Result};

pub type TxId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Collection,
    Document,
    Range,
}

/// A lockable resource: `(kind, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceId {
    pub kind: ResourceKind,
    pub name: String,
}

impl ResourceId {
    pub fn collection(name: &str) -> Self {
        ResourceId {
            kind: ResourceKind::Collection,
            name: name.to_string(),
        }
    }

    pub fn document(collection: &str, id: &str) -> Self {
        ResourceId {
            kind: ResourceKind::Document,
            name: format!("{}/{}", collection, id),
        }
    }

    pub fn range(collection: &str) -> Self {
        ResourceId {
            kind: ResourceKind::Range,
            name: collection.to_string(),
        }
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            ResourceKind::Collection => "collection",
            ResourceKind::Document => "document",
            ResourceKind::Range => "range",
        };
        write!(f, "{}:{}", kind, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

fn compatible(a: LockMode, b: LockMode) -> bool {
    a == LockMode::Shared && b == LockMode::Shared
}

#[derive(Debug, Clone)]
struct Waiter {
    tx: TxId,
    mode: LockMode,
    /// S→X upgrade: waits on holders only, ahead of every queued waiter
    upgrade: bool,
}

#[derive(Debug, Default)]
struct ResourceState {
    holders: AHashMap<TxId, LockMode>,
    queue: VecDeque<Waiter>,
}

#[derive(Default)]
struct LockTables {
    resources: AHashMap<ResourceId, ResourceState>,
    /// Held resources per transaction, in acquisition order (savepoints
    /// release suffixes of this list)
    held: AHashMap<TxId, Vec<ResourceId>>,
    /// Transactions chosen as deadlock victims, cleared on release_all
    victims: AHashSet<TxId>,
}

struct LockInner {
    tables: Mutex<LockTables>,
    cond: Condvar,
}

/// Cancels one pending `acquire`. Cancellation removes the waiter and
/// re-evaluates everyone else; no queue entry survives it.
#[derive(Clone)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
    inner: Arc<LockInner>,
}

impl CancellationToken {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        // Take the table lock so the notify cannot race a waiter that is
        // between its flag check and its wait
        let _guard = self.inner.tables.lock();
        self.inner.cond.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

pub struct LockManager {
    inner: Arc<LockInner>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        LockManager {
            inner: Arc::new(LockInner {
                tables: Mutex::new(LockTables::default()),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        CancellationToken {
            flag: Arc::new(AtomicBool::new(false)),
            inner: Arc::clone(&self.inner),
        }
    }

    /// Grant rule, evaluated by each waiter for itself.
    fn can_grant(state: &ResourceState, tx: TxId, mode: LockMode, upgrade: bool) -> bool {
        if upgrade {
            // Atomic upgrade: granted the moment no other holder remains;
            // the holder's own S lock never drops in between
            return state.holders.len() == 1 && state.holders.contains_key(&tx);
        }
        if state
            .holders
            .iter()
            .any(|(holder, held)| *holder != tx && !compatible(*held, mode))
        {
            return false;
        }
        // FIFO fairness: never pass an earlier waiter of conflicting mode
        for waiter in &state.queue {
            if waiter.tx == tx {
                break;
            }
            if waiter.upgrade || !compatible(waiter.mode, mode) {
                return false;
            }
        }
        true
    }

    fn remove_waiter(tables: &mut LockTables, resource: &ResourceId, tx: TxId) {
        if let Some(state) = tables.resources.get_mut(resource) {
            state.queue.retain(|w| w.tx != tx);
            if state.holders.is_empty() && state.queue.is_empty() {
                tables.resources.remove(resource);
            }
        }
    }

    /// Acquire `mode` on `resource` for `tx`, waiting at most `timeout`.
    ///
    /// Re-entrant: a holder asking for the same or weaker mode returns
    /// immediately; S→X is a true atomic upgrade. Exceeding the deadline
    /// yields `LockTimeout` and leaves the transaction alive.
    pub fn acquire(
        &self,
        tx: TxId,
        resource: ResourceId,
        mode: LockMode,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut tables = self.inner.tables.lock();

        if tables.victims.contains(&tx) {
            return Err(FerroError::Deadlock(tx));
        }

        // Re-entrancy / upgrade classification
        let upgrade = {
            let state = tables.resources.entry(resource.clone()).or_default();
            match (state.holders.get(&tx).copied(), mode) {
                (Some(LockMode::Exclusive), _) => return Ok(()),
                (Some(LockMode::Shared), LockMode::Shared) => return Ok(()),
                (Some(LockMode::Shared), LockMode::Exclusive) => true,
                (None, _) => false,
            }
        };

        let mut enqueued = false;
        loop {
            if tables.victims.contains(&tx) {
                Self::remove_waiter(&mut tables, &resource, tx);
                self.inner.cond.notify_all();
                return Err(FerroError::Deadlock(tx));
            }
            if cancel.is_some_and(|c| c.is_cancelled()) {
                Self::remove_waiter(&mut tables, &resource, tx);
                self.inner.cond.notify_all();
                return Err(FerroError::Timeout(format!(
                    "lock wait cancelled on {}",
                    resource
                )));
            }

            let granted = {
                let state = tables.resources.entry(resource.clone()).or_default();
                if Self::can_grant(state, tx, mode, upgrade) {
                    state.queue.retain(|w| w.tx != tx);
                    state.holders.insert(tx, mode);
                    true
                } else {
                    if !enqueued {
                        state.queue.push_back(Waiter { tx, mode, upgrade });
                        enqueued = true;
                    }
                    false
                }
            };
            if granted {
                if !upgrade {
                    tables.held.entry(tx).or_default().push(resource.clone());
                }
                // Our dequeue may unblock waiters queued behind us
                self.inner.cond.notify_all();
                return Ok(());
            }

            if self.inner.cond.wait_until(&mut tables, deadline).timed_out() {
                Self::remove_waiter(&mut tables, &resource, tx);
                self.inner.cond.notify_all();
                return Err(FerroError::LockTimeout(resource.to_string()));
            }
        }
    }

    /// Release one lock. Returns whether the transaction held it.
    pub fn release(&self, tx: TxId, resource: &ResourceId) -> bool {
        let mut tables = self.inner.tables.lock();
        let released = match tables.resources.get_mut(resource) {
            Some(state) => state.holders.remove(&tx).is_some(),
            None => false,
        };
        if released {
            if let Some(held) = tables.held.get_mut(&tx) {
                if let Some(pos) = held.iter().rposition(|r| r == resource) {
                    held.remove(pos);
                }
                if held.is_empty() {
                    tables.held.remove(&tx);
                }
            }
            if let Some(state) = tables.resources.get(resource) {
                if state.holders.is_empty() && state.queue.is_empty() {
                    tables.resources.remove(resource);
                }
            }
            self.inner.cond.notify_all();
        }
        released
    }

    /// Release every lock a transaction holds and clear its victim mark.
    /// Returns the number of released locks.
    pub fn release_all(&self, tx: TxId) -> usize {
        let mut tables = self.inner.tables.lock();
        let held = tables.held.remove(&tx).unwrap_or_default();
        let mut released = 0;
        for resource in &held {
            if let Some(state) = tables.resources.get_mut(resource) {
                if state.holders.remove(&tx).is_some() {
                    released += 1;
                }
                if state.holders.is_empty() && state.queue.is_empty() {
                    tables.resources.remove(resource);
                }
            }
        }
        tables.victims.remove(&tx);
        if released > 0 {
            self.inner.cond.notify_all();
        }
        released
    }

    /// Mode the transaction currently holds on a resource, if any.
    pub fn holds(&self, tx: TxId, resource: &ResourceId) -> Option<LockMode> {
        self.inner
            .tables
            .lock()
            .resources
            .get(resource)
            .and_then(|state| state.holders.get(&tx).copied())
    }

    /// Held resources in acquisition order.
    pub fn held_locks(&self, tx: TxId) -> Vec<ResourceId> {
        self.inner
            .tables
            .lock()
            .held
            .get(&tx)
            .cloned()
            .unwrap_or_default()
    }

    pub fn lock_count(&self, tx: TxId) -> usize {
        self.inner
            .tables
            .lock()
            .held
            .get(&tx)
            .map(|held| held.len())
            .unwrap_or(0)
    }

    /// Total queued waiters across all resources (test observability).
    pub fn waiter_count(&self) -> usize {
        self.inner
            .tables
            .lock()
            .resources
            .values()
            .map(|state| state.queue.len())
            .sum()
    }

    // ------------------------------------------------------------------
    // Deadlock detection
    // ------------------------------------------------------------------

    /// Wait-for edges: waiter -> every transaction blocking it, either a
    /// holder of conflicting mode or an earlier conflicting waiter.
    fn wait_graph(tables: &LockTables) -> AHashMap<TxId, AHashSet<TxId>> {
        let mut edges: AHashMap<TxId, AHashSet<TxId>> = AHashMap::new();
        for state in tables.resources.values() {
            for (pos, waiter) in state.queue.iter().enumerate() {
                let targets = edges.entry(waiter.tx).or_default();
                for (holder, held) in &state.holders {
                    if *holder != waiter.tx && !compatible(*held, waiter.mode) {
                        targets.insert(*holder);
                    }
                }
                if !waiter.upgrade {
                    for earlier in state.queue.iter().take(pos) {
                        if earlier.tx != waiter.tx
                            && (earlier.upgrade || !compatible(earlier.mode, waiter.mode))
                        {
                            targets.insert(earlier.tx);
                        }
                    }
                }
            }
        }
        edges
    }

    fn find_cycle(edges: &AHashMap<TxId, AHashSet<TxId>>) -> Option<Vec<TxId>> {
        #[derive(PartialEq)]
        enum Color {
            Visiting,
            Done,
        }
        let mut colors: AHashMap<TxId, Color> = AHashMap::new();
        let mut stack: Vec<TxId> = Vec::new();

        fn dfs(
            node: TxId,
            edges: &AHashMap<TxId, AHashSet<TxId>>,
            colors: &mut AHashMap<TxId, Color>,
            stack: &mut Vec<TxId>,
        ) -> Option<Vec<TxId>> {
            colors.insert(node, Color::Visiting);
            stack.push(node);
            if let Some(targets) = edges.get(&node) {
                for &next in targets {
                    match colors.get(&next) {
                        Some(Color::Visiting) => {
                            let start = stack.iter().position(|&t| t == next).unwrap_or(0);
                            return Some(stack[start..].to_vec());
                        }
                        Some(Color::Done) => {}
                        None => {
                            if let Some(cycle) = dfs(next, edges, colors, stack) {
                                return Some(cycle);
                            }
                        }
                    }
                }
            }
            stack.pop();
            colors.insert(node, Color::Done);
            None
        }

        for &node in edges.keys() {
            if !colors.contains_key(&node) {
                if let Some(cycle) = dfs(node, edges, &mut colors, &mut stack) {
                    return Some(cycle);
                }
            }
            stack.clear();
        }
        None
    }

    /// One detection sweep. Repeats until the graph is acyclic; every
    /// chosen victim is marked, its queue entries dropped, and waiters
    /// woken. Returns the victims in the order chosen.
    pub fn detect_once(&self) -> Vec<TxId> {
        let mut tables = self.inner.tables.lock();
        let mut victims = Vec::new();

        loop {
            let edges = Self::wait_graph(&tables);
            let cycle = match Self::find_cycle(&edges) {
                Some(cycle) => cycle,
                None => break,
            };

            // Youngest transaction dies: highest tx id, ties broken by
            // fewest held locks
            let victim = *cycle
                .iter()
                .max_by_key(|tx| {
                    let held = tables.held.get(tx).map(|h| h.len()).unwrap_or(0);
                    (**tx, usize::MAX - held)
                })
                .expect("non-empty cycle");

            info!(cycle = ?cycle, victim, "deadlock detected, aborting youngest");
            tables.victims.insert(victim);
            for state in tables.resources.values_mut() {
                state.queue.retain(|w| w.tx != victim);
            }
            victims.push(victim);
        }

        if !victims.is_empty() {
            self.inner.cond.notify_all();
        }
        victims
    }

    /// Whether a transaction has been sentenced by the detector.
    pub fn is_victim(&self, tx: TxId) -> bool {
        self.inner.tables.lock().victims.contains(&tx)
    }
}
