// ferrodb-core/src/batch.rs
// Bulk driver: ordered batches of inserts/replaces/patches/deletes,
// optionally inside one transaction.
//
// Ordered mode stops at the first failure; unordered keeps going and
// reports per-item outcomes either way. Transactional mode wraps the
// whole batch so a failure rolls everything back.

use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::database::Database;
use crate::error::{FerroError, Result};
use crate::transaction::TransactionId;

/// One operation of a bulk request.
#[derive(Debug, Clone)]
pub enum BulkOp {
    Insert { document: Value },
    Replace { id: String, data: Map<String, Value> },
    Patch { id: String, update: Map<String, Value> },
    Delete { id: String },
}

impl BulkOp {
    /// Wire shape: `{"op": "insert"|"replace"|"patch"|"delete", ...}`.
    pub fn parse(spec: &Value) -> Result<Self> {
        let obj = spec
            .as_object()
            .ok_or_else(|| FerroError::Validation("bulk operation must be an object".into()))?;
        let op = obj
            .get("op")
            .and_then(|v| v.as_str())
            .ok_or_else(|| FerroError::Validation("bulk operation needs an 'op' field".into()))?;

        let id = || -> Result<String> {
            obj.get("id")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .ok_or_else(|| FerroError::Validation(format!("bulk {} needs an 'id'", op)))
        };
        let body = |key: &str| -> Result<Map<String, Value>> {
            obj.get(key)
                .and_then(|v| v.as_object())
                .cloned()
                .ok_or_else(|| {
                    FerroError::Validation(format!("bulk {} needs an object '{}'", op, key))
                })
        };

        match op {
            "insert" => Ok(BulkOp::Insert {
                document: obj
                    .get("document")
                    .cloned()
                    .ok_or_else(|| FerroError::Validation("bulk insert needs a 'document'".into()))?,
            }),
            "replace" => Ok(BulkOp::Replace {
                id: id()?,
                data: body("document")?,
            }),
            "patch" => Ok(BulkOp::Patch {
                id: id()?,
                update: body("update")?,
            }),
            "delete" => Ok(BulkOp::Delete { id: id()? }),
            other => Err(FerroError::Validation(format!(
                "unknown bulk op '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BulkOptions {
    /// Stop at the first failing operation
    pub ordered: bool,
    /// Run the whole batch inside one transaction
    pub transactional: bool,
}

/// Per-item outcome plus totals.
#[derive(Debug, Clone)]
pub struct BulkReport {
    pub applied: usize,
    pub failed: usize,
    pub items: Vec<Value>,
}

impl BulkReport {
    pub fn to_value(&self) -> Value {
        json!({
            "applied": self.applied,
            "failed": self.failed,
            "items": self.items,
        })
    }
}

/// Apply a batch against one collection.
pub fn execute(
    db: &Arc<Database>,
    session: Option<TransactionId>,
    collection: &str,
    ops: Vec<BulkOp>,
    options: BulkOptions,
) -> Result<BulkReport> {
    if options.transactional && session.is_none() {
        // One transaction around the whole batch; any failure aborts it all
        let tx = db.begin(None)?;
        return match run_ops(db, Some(tx), collection, &ops, &options) {
            Ok(report) if report.failed == 0 => {
                db.commit(tx)?;
                Ok(report)
            }
            Ok(report) => {
                db.rollback(tx)?;
                // A partially failed transactional batch applies nothing
                Ok(BulkReport {
                    applied: 0,
                    failed: report.failed,
                    items: report.items,
                })
            }
            Err(err) => {
                // The transaction may already be gone (deadlock victim)
                let _ = db.rollback(tx);
                Err(err)
            }
        };
    }
    run_ops(db, session, collection, &ops, &options)
}

fn run_ops(
    db: &Arc<Database>,
    session: Option<TransactionId>,
    collection: &str,
    ops: &[BulkOp],
    options: &BulkOptions,
) -> Result<BulkReport> {
    let mut report = BulkReport {
        applied: 0,
        failed: 0,
        items: Vec::with_capacity(ops.len()),
    };

    for (position, op) in ops.iter().enumerate() {
        let outcome = apply_one(db, session, collection, op);
        match outcome {
            Ok(detail) => {
                report.applied += 1;
                report.items.push(json!({
                    "index": position,
                    "ok": true,
                    "detail": detail,
                }));
            }
            Err(err) => {
                report.failed += 1;
                report.items.push(json!({
                    "index": position,
                    "ok": false,
                    "code": err.code(),
                    "message": err.to_string(),
                }));
                if options.ordered {
                    break;
                }
            }
        }
    }
    Ok(report)
}

fn apply_one(
    db: &Arc<Database>,
    session: Option<TransactionId>,
    collection: &str,
    op: &BulkOp,
) -> Result<Value> {
    match op {
        BulkOp::Insert { document } => {
            let doc = db.insert(session, collection, document.clone())?;
            Ok(json!({"_id": doc.id, "version": doc.meta.version}))
        }
        BulkOp::Replace { id, data } => {
            let doc = db.replace(session, collection, id, data.clone(), None)?;
            Ok(json!({"_id": doc.id, "version": doc.meta.version}))
        }
        BulkOp::Patch { id, update } => {
            let doc = db.patch(session, collection, id, update.clone(), None)?;
            Ok(json!({"_id": doc.id, "version": doc.meta.version}))
        }
        BulkOp::Delete { id } => {
            let deleted = db.delete(session, collection, id, None)?;
            Ok(json!({"_id": id, "deleted": deleted}))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<Database>) {
        let tmp = TempDir::new().unwrap();
        let db = Arc::new(Database::open_at(tmp.path()).unwrap());
        db.create_collection("users").unwrap();
        (tmp, db)
    }

    fn insert_op(id: &str, n: i64) -> BulkOp {
        BulkOp::Insert {
            document: json!({"_id": id, "n": n}),
        }
    }

    #[test]
    fn test_parse_bulk_ops() {
        assert!(matches!(
            BulkOp::parse(&json!({"op": "insert", "document": {"n": 1}})).unwrap(),
            BulkOp::Insert { .. }
        ));
        assert!(matches!(
            BulkOp::parse(&json!({"op": "delete", "id": "u1"})).unwrap(),
            BulkOp::Delete { .. }
        ));
        assert!(BulkOp::parse(&json!({"op": "explode"})).is_err());
        assert!(BulkOp::parse(&json!({"op": "patch", "id": "u1"})).is_err());
    }

    #[test]
    fn test_mixed_batch_applies_in_order() {
        let (_tmp, db) = setup();
        let ops = vec![
            insert_op("u1", 1),
            BulkOp::Patch {
                id: "u1".into(),
                update: json!({"$inc": {"n": 5}}).as_object().unwrap().clone(),
            },
            BulkOp::Delete { id: "u1".into() },
        ];
        let report = execute(&db, None, "users", ops, BulkOptions::default()).unwrap();
        assert_eq!(report.applied, 3);
        assert_eq!(report.failed, 0);
        assert!(db.get(None, "users", "u1").unwrap().is_none());
    }

    #[test]
    fn test_ordered_stops_at_first_failure() {
        let (_tmp, db) = setup();
        let ops = vec![
            insert_op("u1", 1),
            insert_op("u1", 2), // duplicate id
            insert_op("u2", 3),
        ];
        let report = execute(
            &db,
            None,
            "users",
            ops,
            BulkOptions {
                ordered: true,
                transactional: false,
            },
        )
        .unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.items.len(), 2);
        assert!(db.get(None, "users", "u2").unwrap().is_none());
    }

    #[test]
    fn test_unordered_continues_past_failures() {
        let (_tmp, db) = setup();
        let ops = vec![insert_op("u1", 1), insert_op("u1", 2), insert_op("u2", 3)];
        let report = execute(&db, None, "users", ops, BulkOptions::default()).unwrap();
        assert_eq!(report.applied, 2);
        assert_eq!(report.failed, 1);
        assert!(db.get(None, "users", "u2").unwrap().is_some());
    }

    #[test]
    fn test_transactional_batch_rolls_back_on_failure() {
        let (_tmp, db) = setup();
        let ops = vec![
            insert_op("u1", 1),
            insert_op("u2", 2),
            insert_op("u1", 3), // fails
        ];
        let report = execute(
            &db,
            None,
            "users",
            ops,
            BulkOptions {
                ordered: true,
                transactional: true,
            },
        )
        .unwrap();
        assert_eq!(report.applied, 0);
        // Nothing from the batch survived
        assert!(db.get(None, "users", "u1").unwrap().is_none());
        assert!(db.get(None, "users", "u2").unwrap().is_none());
    }

    #[test]
    fn test_transactional_batch_commits_when_clean() {
        let (_tmp, db) = setup();
        let ops = vec![insert_op("u1", 1), insert_op("u2", 2)];
        let report = execute(
            &db,
            None,
            "users",
            ops,
            BulkOptions {
                ordered: true,
                transactional: true,
            },
        )
        .unwrap();
        assert_eq!(report.applied, 2);
        assert!(db.get(None, "users", "u1").unwrap().is_some());
        assert!(db.get(None, "users", "u2").unwrap().is_some());
    }
}
