//! Shared helpers for working with JSON values
//!
//! Nested field access with dot notation and value comparison used by the
//! document model, indexes, sorting and the aggregation pipeline.

use serde_json::Value;
use std::cmp::Ordering;

/// Get nested value from JSON with dot notation support
///
/// Supports:
/// - Simple fields: "name"
/// - Nested objects: "address.city"
/// - Array indexing: "items.0.name"
pub fn get_nested_value<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    // Fast path: no dots means simple field access
    if !path.contains('.') {
        return doc.get(path);
    }

    let mut value = doc;
    for part in path.split('.') {
        match value {
            Value::Object(map) => value = map.get(part)?,
            Value::Array(arr) => {
                if let Ok(index) = part.parse::<usize>() {
                    value = arr.get(index)?;
                } else {
                    return None;
                }
            }
            _ => return None,
        }
    }
    Some(value)
}

/// Set a nested value, creating intermediate objects along the path.
///
/// Array elements can be addressed by numeric path parts; out-of-range
/// indices are ignored (the document is left unchanged for that branch).
pub fn set_nested_value(doc: &mut Value, path: &str, new_value: Value) {
    let parts: Vec<&str> = path.split('.').collect();
    set_at_path(doc, &parts, new_value);
}

fn set_at_path(current: &mut Value, parts: &[&str], new_value: Value) {
    if parts.is_empty() {
        *current = new_value;
        return;
    }

    if parts.len() == 1 {
        match current {
            Value::Object(map) => {
                map.insert(parts[0].to_string(), new_value);
            }
            Value::Array(arr) => {
                if let Ok(index) = parts[0].parse::<usize>() {
                    if index < arr.len() {
                        arr[index] = new_value;
                    }
                }
            }
            _ => {
                let mut obj = serde_json::Map::new();
                obj.insert(parts[0].to_string(), new_value);
                *current = Value::Object(obj);
            }
        }
        return;
    }

    match current {
        Value::Object(map) => {
            let entry = map
                .entry(parts[0].to_string())
                .or_insert_with(|| Value::Object(serde_json::Map::new()));
            set_at_path(entry, &parts[1..], new_value);
        }
        Value::Array(arr) => {
            if let Ok(index) = parts[0].parse::<usize>() {
                if index < arr.len() {
                    set_at_path(&mut arr[index], &parts[1..], new_value);
                }
            }
        }
        _ => {
            // Replace a scalar with the nested structure
            let mut obj = serde_json::Map::new();
            obj.insert(parts[0].to_string(), Value::Null);
            *current = Value::Object(obj);
            set_at_path(current, parts, new_value);
        }
    }
}

/// Remove a nested value; returns the removed value if present.
pub fn remove_nested_value(doc: &mut Value, path: &str) -> Option<Value> {
    let parts: Vec<&str> = path.split('.').collect();
    remove_at_path(doc, &parts)
}

fn remove_at_path(current: &mut Value, parts: &[&str]) -> Option<Value> {
    if parts.is_empty() {
        return None;
    }

    if parts.len() == 1 {
        return match current {
            Value::Object(map) => map.remove(parts[0]),
            Value::Array(arr) => {
                if let Ok(index) = parts[0].parse::<usize>() {
                    if index < arr.len() {
                        return Some(arr.remove(index));
                    }
                }
                None
            }
            _ => None,
        };
    }

    match current {
        Value::Object(map) => {
            let next = map.get_mut(parts[0])?;
            remove_at_path(next, &parts[1..])
        }
        Value::Array(arr) => {
            if let Ok(index) = parts[0].parse::<usize>() {
                if index < arr.len() {
                    return remove_at_path(&mut arr[index], &parts[1..]);
                }
            }
            None
        }
        _ => None,
    }
}

/// Compare two JSON values
///
/// Returns `Some(Ordering)` for comparable types (numbers, strings,
/// booleans), `None` for incompatible types (e.g. string vs number).
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(n1), Value::Number(n2)) => {
            let f1 = n1.as_f64()?;
            let f2 = n2.as_f64()?;
            f1.partial_cmp(&f2)
        }
        (Value::String(s1), Value::String(s2)) => Some(s1.cmp(s2)),
        (Value::Bool(b1), Value::Bool(b2)) => Some(b1.cmp(b2)),
        _ => None,
    }
}

/// Compare two optional JSON values with None handling
///
/// Used for sorting where missing values need consistent ordering:
/// None < Some(_); incompatible types compare Equal (stable sort keeps
/// their relative order).
pub fn compare_values_with_none(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(av), Some(bv)) => compare_values(av, bv).unwrap_or(Ordering::Equal),
    }
}
