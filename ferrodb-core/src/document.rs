// ferrodb-core/src/document.rs
// Stored document model: id + user data + server-maintained metadata

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{FerroError, Result};
use crate::value_utils::{get_nested_value, remove_nested_value, set_nested_value};

/// Document id. Always a non-empty string; either client-supplied or
/// generated as a time-ordered 128-bit value (UUIDv7).
pub type DocumentId = String;

/// Server-maintained document metadata.
///
/// `version` starts at 1 on insert and increases by exactly one on every
/// successful mutation through the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMeta {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

/// A stored document.
///
/// Serialized layout keeps `_id` and `_meta` as reserved keys and flattens
/// the user data map next to them, so the on-disk file reads as one JSON
/// object:
///
/// ```json
/// {"_id": "u1", "_meta": {...}, "name": "A", "address": {"city": "..."}}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(rename = "_id")]
    pub id: DocumentId,

    #[serde(rename = "_meta")]
    pub meta: DocumentMeta,

    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl Document {
    /// Create a fresh version-1 document with server-set timestamps.
    pub fn new(id: DocumentId, data: Map<String, Value>) -> Self {
        let now = Utc::now();
        Document {
            id,
            meta: DocumentMeta {
                created_at: now,
                updated_at: now,
                version: 1,
            },
            data,
        }
    }

    /// Generate a time-ordered 128-bit document id (UUIDv7).
    pub fn generate_id() -> DocumentId {
        uuid::Uuid::now_v7().to_string()
    }

    /// Build a document from a raw JSON object. A `_id` field supplies the
    /// id (must be a non-empty string); otherwise one is generated.
    /// A `_meta` field in the input is ignored — metadata is server-owned.
    pub fn from_value(value: Value) -> Result<Self> {
        let mut map = match value {
            Value::Object(map) => map,
            other => {
                return Err(FerroError::Validation(format!(
                    "document must be a JSON object, got {}",
                    type_name(&other)
                )))
            }
        };

        map.remove("_meta");
        let id = match map.remove("_id") {
            Some(Value::String(s)) if !s.is_empty() => s,
            Some(Value::String(_)) => {
                return Err(FerroError::Validation("document _id must be non-empty".into()))
            }
            Some(other) => {
                return Err(FerroError::Validation(format!(
                    "document _id must be a string, got {}",
                    type_name(&other)
                )))
            }
            None => Self::generate_id(),
        };

        Ok(Document::new(id, map))
    }

    /// Parse a document from its on-disk JSON representation.
    pub fn from_json(json: &str) -> Result<Self> {
        let doc: Document = serde_json::from_str(json)?;
        if doc.id.is_empty() {
            return Err(FerroError::Corruption("document with empty _id".into()));
        }
        Ok(doc)
    }

    /// Serialize to the on-disk JSON representation.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// User data plus `_id`, without `_meta` — the shape query predicates
    /// and projections operate on.
    pub fn to_value(&self) -> Value {
        let mut map = self.data.clone();
        map.insert("_id".to_string(), Value::String(self.id.clone()));
        Value::Object(map)
    }

    /// Full wire shape including `_meta` (used by GET responses so clients
    /// can see versions for optimistic concurrency).
    pub fn to_value_with_meta(&self) -> Value {
        let mut map = self.data.clone();
        map.insert("_id".to_string(), Value::String(self.id.clone()));
        map.insert(
            "_meta".to_string(),
            serde_json::to_value(&self.meta).unwrap_or(Value::Null),
        );
        Value::Object(map)
    }

    /// Field lookup with dot notation. `_id` resolves to the id.
    pub fn get(&self, path: &str) -> Option<Value> {
        if path.is_empty() {
            return None;
        }
        if path == "_id" {
            return Some(Value::String(self.id.clone()));
        }
        let root = Value::Object(self.data.clone());
        get_nested_value(&root, path).cloned()
    }

    /// Borrowing variant for hot paths that only need top-level fields.
    pub fn get_field(&self, field: &str) -> Option<&Value> {
        self.data.get(field)
    }

    /// Set a field with dot notation, creating intermediate objects.
    pub fn set(&mut self, path: &str, value: Value) {
        if path == "_id" || path == "_meta" {
            return; // reserved
        }
        if !path.contains('.') {
            self.data.insert(path.to_string(), value);
            return;
        }
        let mut root = Value::Object(std::mem::take(&mut self.data));
        set_nested_value(&mut root, path, value);
        if let Value::Object(map) = root {
            self.data = map;
        }
    }

    /// Remove a field with dot notation; returns the removed value.
    pub fn remove(&mut self, path: &str) -> Option<Value> {
        if path == "_id" || path == "_meta" {
            return None;
        }
        if !path.contains('.') {
            return self.data.remove(path);
        }
        let mut root = Value::Object(std::mem::take(&mut self.data));
        let removed = remove_nested_value(&mut root, path);
        if let Value::Object(map) = root {
            self.data = map;
        }
        removed
    }

    /// Replace the user data wholesale, bumping version and `updated_at`.
    pub fn replace_data(&mut self, data: Map<String, Value>) {
        self.data = data;
        self.touch();
    }

    /// Advance version and `updated_at` after a successful mutation.
    pub fn touch(&mut self) {
        self.meta.version += 1;
        self.meta.updated_at = Utc::now();
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_new_document_starts_at_version_one() {
        let doc = Document::new("u1".into(), obj(json!({"name": "Alice"})));
        assert_eq!(doc.meta.version, 1);
        assert_eq!(doc.meta.created_at, doc.meta.updated_at);
    }

    #[test]
    fn test_generated_ids_are_time_ordered() {
        let a = Document::generate_id();
        // Separate the millisecond timestamps so ordering is deterministic
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = Document::generate_id();
        // UUIDv7 sorts by creation time lexicographically
        assert!(a < b);
        assert_eq!(a.len(), 36);
    }

    #[test]
    fn test_from_value_with_client_id() {
        let doc = Document::from_value(json!({"_id": "u1", "n": 1})).unwrap();
        assert_eq!(doc.id, "u1");
        assert_eq!(doc.data.get("n"), Some(&json!(1)));
    }

    #[test]
    fn test_from_value_generates_missing_id() {
        let doc = Document::from_value(json!({"n": 1})).unwrap();
        assert!(!doc.id.is_empty());
    }

    #[test]
    fn test_from_value_rejects_bad_ids() {
        assert!(Document::from_value(json!({"_id": "", "n": 1})).is_err());
        assert!(Document::from_value(json!({"_id": 42, "n": 1})).is_err());
        assert!(Document::from_value(json!([1, 2])).is_err());
    }

    #[test]
    fn test_from_value_ignores_client_meta() {
        let doc =
            Document::from_value(json!({"_id": "u1", "_meta": {"version": 99}, "n": 1})).unwrap();
        assert_eq!(doc.meta.version, 1);
    }

    #[test]
    fn test_roundtrip_serialization_preserves_version() {
        let mut doc = Document::new("u1".into(), obj(json!({"name": "A", "tags": ["x", "y"]})));
        doc.touch();
        let json = doc.to_json().unwrap();
        let restored = Document::from_json(&json).unwrap();
        assert_eq!(restored, doc);
        assert_eq!(restored.meta.version, 2);
    }

    #[test]
    fn test_get_with_dot_notation() {
        let doc = Document::new(
            "u1".into(),
            obj(json!({"address": {"city": "Graz"}, "items": [{"k": 1}]})),
        );
        assert_eq!(doc.get("address.city"), Some(json!("Graz")));
        assert_eq!(doc.get("items.0.k"), Some(json!(1)));
        assert_eq!(doc.get("_id"), Some(json!("u1")));
        assert_eq!(doc.get("missing"), None);
    }

    #[test]
    fn test_set_and_remove_nested() {
        let mut doc = Document::new("u1".into(), obj(json!({})));
        doc.set("a.b", json!(5));
        assert_eq!(doc.get("a.b"), Some(json!(5)));
        assert_eq!(doc.remove("a.b"), Some(json!(5)));
        assert_eq!(doc.get("a.b"), None);
    }

    #[test]
    fn test_reserved_keys_are_protected() {
        let mut doc = Document::new("u1".into(), obj(json!({"n": 1})));
        doc.set("_id", json!("evil"));
        doc.set("_meta", json!({"version": 99}));
        assert_eq!(doc.id, "u1");
        assert_eq!(doc.meta.version, 1);
        assert_eq!(doc.remove("_id"), None);
    }

    #[test]
    fn test_touch_increments_version_by_one() {
        let mut doc = Document::new("u1".into(), obj(json!({})));
        doc.touch();
        doc.touch();
        assert_eq!(doc.meta.version, 3);
    }

    #[test]
    fn test_to_value_excludes_meta() {
        let doc = Document::new("u1".into(), obj(json!({"n": 1})));
        let v = doc.to_value();
        assert_eq!(v.get("_id"), Some(&json!("u1")));
        assert!(v.get("_meta").is_none());
        let vm = doc.to_value_with_meta();
        assert!(vm.get("_meta").is_some());
    }
}
