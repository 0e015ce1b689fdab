// ferrodb-core/src/index/mod.rs
// Secondary indexing: typed keys, index definitions, per-collection manager
//
// The manager owns every index of one collection and is invoked by the
// store hooks so that index updates become visible atomically with the
// document write that produced them.

pub mod ttl;

use std::collections::HashMap;
use std::ops::Bound;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::btree::BTree;
use crate::document::{Document, DocumentId};
use crate::error::{FerroError, Result};
use crate::query::filter::FilterExpr;

/// Index key - supported key component types, totally ordered.
///
/// Variant order defines cross-type ordering: Null sorts before every
/// non-null value (missing fields land on Null unless the index is sparse).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexKey {
    Null,
    Bool(bool),
    Int(i64),
    Float(OrderedFloat),
    String(String),
    /// Compound key for multi-field indexes, compared lexicographically
    /// in declared field order
    Compound(Vec<IndexKey>),
    /// Reversed-order wrapper for descending fields
    Desc(Box<IndexKey>),
}

/// OrderedFloat wrapper for f64 to enable Ord (NaN sorts last)
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OrderedFloat(pub f64);

impl PartialEq for OrderedFloat {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Eq for OrderedFloat {}

impl PartialOrd for OrderedFloat {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedFloat {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match (self.0.is_nan(), other.0.is_nan()) {
            (true, true) => std::cmp::Ordering::Equal,
            (true, false) => std::cmp::Ordering::Greater,
            (false, true) => std::cmp::Ordering::Less,
            (false, false) => self
                .0
                .partial_cmp(&other.0)
                .unwrap_or(std::cmp::Ordering::Equal),
        }
    }
}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        use std::cmp::Ordering;
        use IndexKey::*;
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Null, _) => Ordering::Less,
            (_, Null) => Ordering::Greater,

            (Bool(a), Bool(b)) => a.cmp(b),
            (Bool(_), _) => Ordering::Less,
            (_, Bool(_)) => Ordering::Greater,

            (Int(a), Int(b)) => a.cmp(b),
            // Mixed numeric comparison keeps ints and floats interleaved
            (Int(a), Float(b)) => OrderedFloat(*a as f64).cmp(b),
            (Float(a), Int(b)) => a.cmp(&OrderedFloat(*b as f64)),
            (Int(_), _) => Ordering::Less,
            (_, Int(_)) => Ordering::Greater,

            (Float(a), Float(b)) => a.cmp(b),
            (Float(_), _) => Ordering::Less,
            (_, Float(_)) => Ordering::Greater,

            (String(a), String(b)) => a.cmp(b),
            (String(_), _) => Ordering::Less,
            (_, String(_)) => Ordering::Greater,

            (Compound(a), Compound(b)) => a.cmp(b),
            (Compound(_), _) => Ordering::Less,
            (_, Compound(_)) => Ordering::Greater,

            // Within one tree every key carries the same wrapping per
            // field, so reversed comparison yields descending order
            (Desc(a), Desc(b)) => b.cmp(a),
        }
    }
}

impl From<&Value> for IndexKey {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => IndexKey::Null,
            Value::Bool(b) => IndexKey::Bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    IndexKey::Int(i)
                } else if let Some(f) = n.as_f64() {
                    IndexKey::Float(OrderedFloat(f))
                } else {
                    IndexKey::Null
                }
            }
            Value::String(s) => IndexKey::String(s.clone()),
            // Arrays and objects index under Null
            _ => IndexKey::Null,
        }
    }
}

/// Field sort direction within an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexDirection {
    Asc,
    Desc,
}

impl IndexDirection {
    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            1 => Some(IndexDirection::Asc),
            -1 => Some(IndexDirection::Desc),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> i64 {
        match self {
            IndexDirection::Asc => 1,
            IndexDirection::Desc => -1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexField {
    pub path: String,
    pub direction: IndexDirection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    Single,
    Compound,
    Unique,
    Sparse,
    Partial,
    Ttl,
}

/// Index definition as stored in the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub name: String,
    pub fields: Vec<IndexField>,
    pub kind: IndexKind,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub sparse: bool,
    #[serde(default)]
    pub partial_filter: Option<Value>,
    /// Expiry horizon in seconds for TTL indexes
    #[serde(default)]
    pub ttl_secs: Option<i64>,
}

impl IndexDefinition {
    /// Shorthand for a single-field ascending index.
    pub fn single(name: impl Into<String>, path: impl Into<String>, unique: bool) -> Self {
        IndexDefinition {
            name: name.into(),
            fields: vec![IndexField {
                path: path.into(),
                direction: IndexDirection::Asc,
            }],
            kind: if unique { IndexKind::Unique } else { IndexKind::Single },
            unique,
            sparse: false,
            partial_filter: None,
            ttl_secs: None,
        }
    }

    /// Parse a wire-shape definition:
    /// `{name, fields, type?, unique?, sparse?, partial_filter?, ttl_secs?}`
    /// where `fields` is `"path"`, `{"path": 1}` or `[["path", 1], ...]`.
    /// The kind is inferred from the flags when `type` is absent.
    pub fn parse(spec: &Value) -> Result<Self> {
        let obj = spec.as_object().ok_or_else(|| {
            FerroError::Validation("index definition must be a JSON object".into())
        })?;

        let name = obj
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| FerroError::Validation("index definition needs a name".into()))?
            .to_string();

        let mut fields = Vec::new();
        match obj.get("fields") {
            Some(Value::String(path)) => fields.push(IndexField {
                path: path.clone(),
                direction: IndexDirection::Asc,
            }),
            Some(Value::Object(map)) => {
                for (path, dir) in map {
                    fields.push(IndexField {
                        path: path.clone(),
                        direction: parse_field_direction(dir)?,
                    });
                }
            }
            Some(Value::Array(items)) => {
                for item in items {
                    let pair = item.as_array().filter(|p| p.len() == 2).ok_or_else(|| {
                        FerroError::Validation(
                            "index fields must be [path, direction] pairs".into(),
                        )
                    })?;
                    let path = pair[0].as_str().ok_or_else(|| {
                        FerroError::Validation("index field path must be a string".into())
                    })?;
                    fields.push(IndexField {
                        path: path.to_string(),
                        direction: parse_field_direction(&pair[1])?,
                    });
                }
            }
            _ => {
                return Err(FerroError::Validation(
                    "index definition needs fields".into(),
                ))
            }
        }

        let unique = obj.get("unique").and_then(|v| v.as_bool()).unwrap_or(false);
        let sparse = obj.get("sparse").and_then(|v| v.as_bool()).unwrap_or(false);
        let partial_filter = obj.get("partial_filter").cloned();
        let ttl_secs = obj.get("ttl_secs").and_then(|v| v.as_i64());

        let kind = match obj.get("type").and_then(|v| v.as_str()) {
            Some("single") => IndexKind::Single,
            Some("compound") => IndexKind::Compound,
            Some("unique") => IndexKind::Unique,
            Some("sparse") => IndexKind::Sparse,
            Some("partial") => IndexKind::Partial,
            Some("ttl") => IndexKind::Ttl,
            Some(other) => {
                return Err(FerroError::Validation(format!(
                    "unknown index type '{}'",
                    other
                )))
            }
            None => {
                if ttl_secs.is_some() {
                    IndexKind::Ttl
                } else if partial_filter.is_some() {
                    IndexKind::Partial
                } else if unique {
                    IndexKind::Unique
                } else if sparse {
                    IndexKind::Sparse
                } else if fields.len() > 1 {
                    IndexKind::Compound
                } else {
                    IndexKind::Single
                }
            }
        };

        let def = IndexDefinition {
            name,
            fields,
            kind,
            unique,
            sparse,
            partial_filter,
            ttl_secs,
        };
        def.validate()?;
        Ok(def)
    }

    pub fn is_unique(&self) -> bool {
        self.unique || self.kind == IndexKind::Unique
    }

    pub fn is_sparse(&self) -> bool {
        self.sparse || self.kind == IndexKind::Sparse
    }

    pub fn is_ttl(&self) -> bool {
        self.kind == IndexKind::Ttl
    }

    pub fn is_compound(&self) -> bool {
        self.fields.len() > 1
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(FerroError::IndexError("index name must be non-empty".into()));
        }
        if self.fields.is_empty() {
            return Err(FerroError::IndexError(format!(
                "index '{}' must declare at least one field",
                self.name
            )));
        }
        for field in &self.fields {
            if field.path.is_empty() {
                return Err(FerroError::IndexError(format!(
                    "index '{}' has an empty field path",
                    self.name
                )));
            }
        }
        match self.kind {
            IndexKind::Ttl => {
                if self.fields.len() != 1 {
                    return Err(FerroError::IndexError(format!(
                        "TTL index '{}' must be single-field",
                        self.name
                    )));
                }
                if !self.ttl_secs.is_some_and(|s| s >= 0) {
                    return Err(FerroError::IndexError(format!(
                        "TTL index '{}' needs a non-negative ttl_secs",
                        self.name
                    )));
                }
            }
            IndexKind::Partial => {
                if self.partial_filter.is_none() {
                    return Err(FerroError::IndexError(format!(
                        "partial index '{}' needs a partial_filter",
                        self.name
                    )));
                }
            }
            IndexKind::Compound => {
                if self.fields.len() < 2 {
                    return Err(FerroError::IndexError(format!(
                        "compound index '{}' needs at least two fields",
                        self.name
                    )));
                }
            }
            _ => {}
        }
        if self.ttl_secs.is_some() && self.kind != IndexKind::Ttl {
            return Err(FerroError::IndexError(format!(
                "index '{}' sets ttl_secs but is not a TTL index",
                self.name
            )));
        }
        Ok(())
    }
}

fn parse_field_direction(value: &Value) -> Result<IndexDirection> {
    value
        .as_i64()
        .and_then(IndexDirection::from_i64)
        .ok_or_else(|| FerroError::Validation("index field direction must be 1 or -1".into()))
}

/// Runtime stats for INDEX_STATS.
#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub name: String,
    pub keys: u64,
    pub entries: u64,
    pub height: u32,
    pub order: usize,
}

/// One B-tree index plus its selection predicate.
pub struct Index {
    def: IndexDefinition,
    partial: Option<FilterExpr>,
    tree: RwLock<BTree<IndexKey>>,
}

impl Index {
    pub fn new(def: IndexDefinition, order: usize) -> Result<Self> {
        def.validate()?;
        let partial = match &def.partial_filter {
            Some(filter) => Some(FilterExpr::parse(filter)?),
            None => None,
        };
        Ok(Index {
            def,
            partial,
            tree: RwLock::new(BTree::new(order)),
        })
    }

    pub fn definition(&self) -> &IndexDefinition {
        &self.def
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    /// Extract the key this document indexes under.
    ///
    /// Returns `None` when the selection predicate rejects the document:
    /// sparse with every field absent, partial filter not matching, or a
    /// TTL field that is not a timestamp.
    pub fn key_for(&self, doc: &Document) -> Option<IndexKey> {
        if let Some(partial) = &self.partial {
            let matches = partial.matches_value(&doc.to_value()).unwrap_or(false);
            if !matches {
                return None;
            }
        }

        if self.def.is_ttl() {
            let value = doc.get(&self.def.fields[0].path)?;
            let millis = ttl::timestamp_millis(&value)?;
            return Some(IndexKey::Int(millis));
        }

        let mut components = Vec::with_capacity(self.def.fields.len());
        let mut any_present = false;
        for field in &self.def.fields {
            let component = match doc.get(&field.path) {
                Some(value) => {
                    any_present = true;
                    IndexKey::from(&value)
                }
                None => IndexKey::Null,
            };
            let component = match field.direction {
                IndexDirection::Asc => component,
                IndexDirection::Desc => IndexKey::Desc(Box::new(component)),
            };
            components.push(component);
        }

        if self.def.is_sparse() && !any_present {
            return None;
        }

        if components.len() == 1 {
            Some(components.pop().expect("one component"))
        } else {
            Some(IndexKey::Compound(components))
        }
    }

    /// Unique-conflict probe: the doc id (other than `exclude`) already
    /// holding the key this document would index under.
    pub fn conflicting_id(&self, doc: &Document, exclude: Option<&DocumentId>) -> Option<DocumentId> {
        if !self.def.is_unique() {
            return None;
        }
        let key = self.key_for(doc)?;
        let tree = self.tree.read();
        tree.get(&key)?
            .iter()
            .find(|id| Some(*id) != exclude)
            .cloned()
    }

    pub(crate) fn insert_doc(&self, doc: &Document) -> Result<()> {
        if let Some(key) = self.key_for(doc) {
            let mut tree = self.tree.write();
            tree.insert(key, doc.id.clone(), self.def.is_unique())
                .map_err(|e| self.name_duplicate(e))?;
        }
        Ok(())
    }

    pub(crate) fn remove_doc(&self, doc: &Document) {
        if let Some(key) = self.key_for(doc) {
            let mut tree = self.tree.write();
            if !tree.remove(&key, &doc.id) {
                warn!(
                    index = %self.def.name,
                    id = %doc.id,
                    "no index entry for document on removal"
                );
            }
        }
    }

    fn name_duplicate(&self, err: FerroError) -> FerroError {
        match err {
            FerroError::DuplicateKey { key, .. } => FerroError::DuplicateKey {
                index: self.def.name.clone(),
                key,
            },
            other => other,
        }
    }

    pub fn lookup(&self, key: &IndexKey) -> Vec<DocumentId> {
        self.tree
            .read()
            .get(key)
            .map(|ids| ids.to_vec())
            .unwrap_or_default()
    }

    pub fn range(&self, start: Bound<&IndexKey>, end: Bound<&IndexKey>) -> Vec<DocumentId> {
        self.tree.read().range_scan(start, end)
    }

    pub fn range_entries(
        &self,
        start: Bound<&IndexKey>,
        end: Bound<&IndexKey>,
    ) -> Vec<(IndexKey, Vec<DocumentId>)> {
        self.tree.read().range_entries(start, end)
    }

    /// All doc ids in index-key order.
    pub fn scan_all(&self) -> Vec<DocumentId> {
        self.tree.read().scan_all()
    }

    pub fn stats(&self) -> IndexStats {
        let tree = self.tree.read();
        IndexStats {
            name: self.def.name.clone(),
            keys: tree.key_count(),
            entries: tree.len(),
            height: tree.height(),
            order: tree.order(),
        }
    }

    fn clear(&self) {
        let order = self.tree.read().order();
        *self.tree.write() = BTree::new(order);
    }
}

/// Collection-scoped index registry.
///
/// The registry latch is held only while adding or removing an entire
/// index; per-tree latches serialize structural changes.
pub struct IndexManager {
    collection: String,
    order: usize,
    indexes: RwLock<HashMap<String, Arc<Index>>>,
}

impl IndexManager {
    pub fn new(collection: impl Into<String>, order: usize) -> Self {
        IndexManager {
            collection: collection.into(),
            order,
            indexes: RwLock::new(HashMap::new()),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Create an index and backfill it from `docs`. Registration is atomic:
    /// a unique conflict during backfill leaves the registry untouched.
    pub fn create_index<'a>(
        &self,
        def: IndexDefinition,
        docs: impl Iterator<Item = &'a Document>,
    ) -> Result<()> {
        def.validate()?;
        {
            let indexes = self.indexes.read();
            if indexes.contains_key(&def.name) {
                return Err(FerroError::IndexError(format!(
                    "index '{}' already exists on collection '{}'",
                    def.name, self.collection
                )));
            }
            if def.is_ttl() && indexes.values().any(|i| i.definition().is_ttl()) {
                return Err(FerroError::IndexError(format!(
                    "collection '{}' already has a TTL index",
                    self.collection
                )));
            }
        }

        let index = Index::new(def, self.order)?;
        for doc in docs {
            index.insert_doc(doc)?;
        }

        let mut indexes = self.indexes.write();
        if indexes.contains_key(index.name()) {
            return Err(FerroError::IndexError(format!(
                "index '{}' already exists on collection '{}'",
                index.name(),
                self.collection
            )));
        }
        debug!(index = %index.name(), collection = %self.collection, "created index");
        indexes.insert(index.name().to_string(), Arc::new(index));
        Ok(())
    }

    pub fn drop_index(&self, name: &str) -> Result<()> {
        let removed = self.indexes.write().remove(name);
        match removed {
            Some(_) => Ok(()),
            None => Err(FerroError::IndexError(format!(
                "index '{}' not found on collection '{}'",
                name, self.collection
            ))),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Index>> {
        self.indexes.read().get(name).cloned()
    }

    pub fn list(&self) -> Vec<IndexDefinition> {
        let mut defs: Vec<_> = self
            .indexes
            .read()
            .values()
            .map(|i| i.definition().clone())
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn all(&self) -> Vec<Arc<Index>> {
        self.indexes.read().values().cloned().collect()
    }

    pub fn stats(&self) -> Vec<IndexStats> {
        let mut stats: Vec<_> = self.indexes.read().values().map(|i| i.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    pub fn ttl_index(&self) -> Option<Arc<Index>> {
        self.indexes
            .read()
            .values()
            .find(|i| i.definition().is_ttl())
            .cloned()
    }

    /// Rebuild one index from scratch out of the given documents.
    pub fn rebuild<'a>(&self, name: &str, docs: impl Iterator<Item = &'a Document>) -> Result<()> {
        let index = self.get(name).ok_or_else(|| {
            FerroError::IndexError(format!(
                "index '{}' not found on collection '{}'",
                name, self.collection
            ))
        })?;
        index.clear();
        for doc in docs {
            index.insert_doc(doc)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Mutation hooks, called by the store while the document lock is held
    // ------------------------------------------------------------------

    /// Unique pre-check across every index; nothing is mutated on failure.
    fn check_unique(&self, doc: &Document, exclude: Option<&DocumentId>) -> Result<()> {
        for index in self.indexes.read().values() {
            if let Some(holder) = index.conflicting_id(doc, exclude) {
                let key = index
                    .key_for(doc)
                    .map(|k| format!("{:?}", k))
                    .unwrap_or_default();
                debug!(
                    index = %index.name(),
                    key = %key,
                    holder = %holder,
                    "unique conflict"
                );
                return Err(FerroError::DuplicateKey {
                    index: index.name().to_string(),
                    key,
                });
            }
        }
        Ok(())
    }

    pub fn on_insert(&self, doc: &Document) -> Result<()> {
        self.check_unique(doc, None)?;
        let indexes = self.indexes.read();
        let mut applied: Vec<&Arc<Index>> = Vec::new();
        for index in indexes.values() {
            if let Err(err) = index.insert_doc(doc) {
                // No partial update: undo what already went in
                for done in applied {
                    done.remove_doc(doc);
                }
                return Err(err);
            }
            applied.push(index);
        }
        Ok(())
    }

    pub fn on_update(&self, before: &Document, after: &Document) -> Result<()> {
        self.check_unique(after, Some(&before.id))?;
        let indexes = self.indexes.read();
        let mut moved: Vec<&Arc<Index>> = Vec::new();
        for index in indexes.values() {
            let old_key = index.key_for(before);
            let new_key = index.key_for(after);
            if old_key == new_key {
                continue;
            }
            index.remove_doc(before);
            if let Err(err) = index.insert_doc(after) {
                // Restore this index and every previously moved one
                let _ = index.insert_doc(before);
                for done in moved {
                    done.remove_doc(after);
                    let _ = done.insert_doc(before);
                }
                return Err(err);
            }
            moved.push(index);
        }
        Ok(())
    }

    pub fn on_delete(&self, doc: &Document) {
        let indexes = self.indexes.read();
        for index in indexes.values() {
            index.remove_doc(doc);
        }
    }
}

/// All collections' index managers, created on demand.
pub struct IndexRegistry {
    order: usize,
    managers: dashmap::DashMap<String, Arc<IndexManager>>,
}

impl IndexRegistry {
    pub fn new(order: usize) -> Self {
        IndexRegistry {
            order,
            managers: dashmap::DashMap::new(),
        }
    }

    /// The index manager for a collection, creating an empty one first
    /// time around.
    pub fn manager(&self, collection: &str) -> Arc<IndexManager> {
        self.managers
            .entry(collection.to_string())
            .or_insert_with(|| Arc::new(IndexManager::new(collection, self.order)))
            .clone()
    }

    pub fn remove(&self, collection: &str) {
        self.managers.remove(collection);
    }

    pub fn collections(&self) -> Vec<String> {
        self.managers.iter().map(|e| e.key().clone()).collect()
    }
}
