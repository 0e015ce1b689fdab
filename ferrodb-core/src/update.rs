// ferrodb-core/src/update.rs
// Update-operator application: $set, $unset, $inc, $push, $pull, $addToSet
//
// Powers PATCH, INCREMENT, PUSH, PULL, ADD_TO_SET and FIND_AND_MODIFY.
// Operators mutate a scratch copy of the document's data; the store is
// only touched once the whole patch applied cleanly.

use serde_json::{Map, Value};

use crate::error::{FerroError, Result};
use crate::query::filter::values_equal;
use crate::value_utils::{get_nested_value, remove_nested_value, set_nested_value};

/// Whether an update document uses operators (`$set`-style) or is a full
/// replacement. Mixing both forms is invalid.
pub fn is_operator_update(update: &Map<String, Value>) -> Result<bool> {
    let with_ops = update.keys().filter(|k| k.starts_with('$')).count();
    if with_ops == 0 {
        return Ok(false);
    }
    if with_ops != update.len() {
        return Err(FerroError::Validation(
            "update cannot mix operators and plain fields".into(),
        ));
    }
    Ok(true)
}

/// Apply an operator-style update to a data tree, returning the new tree.
pub fn apply_update_operators(
    data: &Map<String, Value>,
    update: &Map<String, Value>,
) -> Result<Map<String, Value>> {
    let mut root = Value::Object(data.clone());

    for (operator, spec) in update {
        let fields = spec.as_object().ok_or_else(|| {
            FerroError::Validation(format!("{} expects an object of field updates", operator))
        })?;
        match operator.as_str() {
            "$set" => {
                for (path, value) in fields {
                    reject_reserved(path)?;
                    set_nested_value(&mut root, path, value.clone());
                }
            }
            "$unset" => {
                for path in fields.keys() {
                    reject_reserved(path)?;
                    remove_nested_value(&mut root, path);
                }
            }
            "$inc" => {
                for (path, delta) in fields {
                    reject_reserved(path)?;
                    let delta = delta.as_f64().ok_or_else(|| {
                        FerroError::Validation(format!("$inc value for '{}' must be numeric", path))
                    })?;
                    let current = match get_nested_value(&root, path) {
                        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
                        Some(_) => {
                            return Err(FerroError::Validation(format!(
                                "$inc target '{}' is not numeric",
                                path
                            )))
                        }
                        None => 0.0,
                    };
                    let next = current + delta;
                    let value = if next.fract() == 0.0 && next.abs() < (i64::MAX as f64) {
                        Value::from(next as i64)
                    } else {
                        Value::from(next)
                    };
                    set_nested_value(&mut root, path, value);
                }
            }
            "$push" => {
                for (path, value) in fields {
                    reject_reserved(path)?;
                    push_element(&mut root, path, value.clone(), false)?;
                }
            }
            "$addToSet" => {
                for (path, value) in fields {
                    reject_reserved(path)?;
                    push_element(&mut root, path, value.clone(), true)?;
                }
            }
            "$pull" => {
                for (path, value) in fields {
                    reject_reserved(path)?;
                    match get_nested_value(&root, path) {
                        Some(Value::Array(items)) => {
                            let filtered: Vec<Value> = items
                                .iter()
                                .filter(|item| !values_equal(item, value))
                                .cloned()
                                .collect();
                            set_nested_value(&mut root, path, Value::Array(filtered));
                        }
                        Some(_) => {
                            return Err(FerroError::Validation(format!(
                                "$pull target '{}' is not an array",
                                path
                            )))
                        }
                        None => {}
                    }
                }
            }
            other => {
                return Err(FerroError::Validation(format!(
                    "unknown update operator '{}'",
                    other
                )))
            }
        }
    }

    match root {
        Value::Object(map) => Ok(map),
        _ => Err(FerroError::Internal("update produced a non-object".into())),
    }
}

fn reject_reserved(path: &str) -> Result<()> {
    if path == "_id" || path == "_meta" || path.starts_with("_id.") || path.starts_with("_meta.") {
        return Err(FerroError::Validation(format!(
            "field '{}' is reserved and cannot be updated",
            path
        )));
    }
    Ok(())
}

fn push_element(root: &mut Value, path: &str, value: Value, unique: bool) -> Result<()> {
    match get_nested_value(root, path) {
        Some(Value::Array(items)) => {
            let mut items = items.clone();
            if !unique || !items.iter().any(|item| values_equal(item, &value)) {
                items.push(value);
            }
            set_nested_value(root, path, Value::Array(items));
            Ok(())
        }
        Some(_) => Err(FerroError::Validation(format!(
            "array operator target '{}' is not an array",
            path
        ))),
        None => {
            set_nested_value(root, path, Value::Array(vec![value]));
            Ok(())
        }
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

    fn apply(data: Value, update: Value) -> Result<Value> {
        apply_update_operators(&obj(data), &obj(update)).map(Value::Object)
    }

    #[test]
    fn test_set_creates_and_overwrites() {
        let out = apply(json!({"a": 1}), json!({"$set": {"a": 2, "b.c": 3}})).unwrap();
        assert_eq!(out, json!({"a": 2, "b": {"c": 3}}));
    }

    #[test]
    fn test_unset_removes() {
        let out = apply(json!({"a": 1, "b": 2}), json!({"$unset": {"a": ""}})).unwrap();
        assert_eq!(out, json!({"b": 2}));
    }

    #[test]
    fn test_inc_existing_and_missing() {
        let out = apply(json!({"n": 5}), json!({"$inc": {"n": 2, "fresh": 3}})).unwrap();
        assert_eq!(out, json!({"n": 7, "fresh": 3}));
    }

    #[test]
    fn test_inc_float_result() {
        let out = apply(json!({"n": 1}), json!({"$inc": {"n": 0.5}})).unwrap();
        assert_eq!(out, json!({"n": 1.5}));
    }

    #[test]
    fn test_inc_non_numeric_target_fails() {
        assert!(apply(json!({"n": "x"}), json!({"$inc": {"n": 1}})).is_err());
    }

    #[test]
    fn test_push_appends_and_creates() {
        let out = apply(json!({"tags": ["a"]}), json!({"$push": {"tags": "b"}})).unwrap();
        assert_eq!(out, json!({"tags": ["a", "b"]}));
        let out = apply(json!({}), json!({"$push": {"tags": "a"}})).unwrap();
        assert_eq!(out, json!({"tags": ["a"]}));
    }

    #[test]
    fn test_add_to_set_deduplicates() {
        let out = apply(json!({"tags": ["a"]}), json!({"$addToSet": {"tags": "a"}})).unwrap();
        assert_eq!(out, json!({"tags": ["a"]}));
        let out = apply(json!({"tags": ["a"]}), json!({"$addToSet": {"tags": "b"}})).unwrap();
        assert_eq!(out, json!({"tags": ["a", "b"]}));
    }

    #[test]
    fn test_pull_removes_matching() {
        let out = apply(json!({"v": [1, 2, 1, 3]}), json!({"$pull": {"v": 1}})).unwrap();
        assert_eq!(out, json!({"v": [2, 3]}));
        // Pulling from a missing field is a no-op
        let out = apply(json!({}), json!({"$pull": {"v": 1}})).unwrap();
        assert_eq!(out, json!({}));
    }

    #[test]
    fn test_push_to_non_array_fails() {
        assert!(apply(json!({"v": 3}), json!({"$push": {"v": 1}})).is_err());
    }

    #[test]
    fn test_reserved_fields_rejected() {
        assert!(apply(json!({}), json!({"$set": {"_id": "x"}})).is_err());
        assert!(apply(json!({}), json!({"$inc": {"_meta.version": 1}})).is_err());
    }

    #[test]
    fn test_unknown_operator_rejected() {
        assert!(apply(json!({}), json!({"$rename": {"a": "b"}})).is_err());
    }

    #[test]
    fn test_operator_detection() {
        assert!(is_operator_update(&obj(json!({"$set": {"a": 1}}))).unwrap());
        assert!(!is_operator_update(&obj(json!({"a": 1}))).unwrap());
        assert!(is_operator_update(&obj(json!({"$set": {}, "b": 1}))).is_err());
    }
}
