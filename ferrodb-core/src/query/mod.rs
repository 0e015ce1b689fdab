// query/mod.rs
// Query document parsing: filter, sort, skip/limit, projection

pub mod aggregation;
pub mod executor;
pub mod filter;

use std::collections::HashMap;

use serde_json::Value;

use crate::error::{FerroError, Result};
use crate::value_utils::{compare_values_with_none, get_nested_value};

pub use filter::{EvalContext, FilterExpr};

/// Include/exclude projection. Mixed modes are rejected, except that
/// `_id: false` may accompany inclusions.
#[derive(Debug, Clone, Default)]
pub struct Projection {
    fields: HashMap<String, bool>,
    include_mode: bool,
}

impl Projection {
    pub fn parse(spec: &Value) -> Result<Projection> {
        let map = match spec {
            Value::Object(map) => map,
            _ => {
                return Err(FerroError::Validation(
                    "projection must be a JSON object".into(),
                ))
            }
        };

        let mut fields = HashMap::with_capacity(map.len());
        for (path, flag) in map {
            let include = match flag {
                Value::Bool(b) => *b,
                Value::Number(n) => n.as_i64().map(|i| i != 0).unwrap_or(false),
                _ => {
                    return Err(FerroError::Validation(format!(
                        "projection value for '{}' must be 0/1 or boolean",
                        path
                    )))
                }
            };
            fields.insert(path.clone(), include);
        }

        let has_inclusions = fields.iter().any(|(_, &include)| include);
        let has_exclusions = fields
            .iter()
            .any(|(path, &include)| !include && path != "_id");
        if has_inclusions && has_exclusions {
            return Err(FerroError::Validation(
                "projection cannot mix include and exclude modes".into(),
            ));
        }

        Ok(Projection {
            include_mode: has_inclusions,
            fields,
        })
    }

    /// Build a fresh result document; stored subtrees are deep-cloned so a
    /// caller can never mutate resident documents through the result.
    pub fn apply(&self, doc: &Value) -> Value {
        let obj = match doc {
            Value::Object(obj) => obj,
            other => return other.clone(),
        };

        let mut result = serde_json::Map::new();
        if self.include_mode {
            for (path, &include) in &self.fields {
                if include {
                    if let Some(value) = get_nested_value(doc, path) {
                        result.insert(path.clone(), value.clone());
                    }
                }
            }
            // _id rides along unless explicitly excluded
            if self.fields.get("_id") != Some(&false) {
                if let Some(id) = obj.get("_id") {
                    result.insert("_id".to_string(), id.clone());
                }
            }
        } else {
            for (key, value) in obj {
                if self.fields.get(key) != Some(&false) {
                    result.insert(key.clone(), value.clone());
                }
            }
        }
        Value::Object(result)
    }
}

/// A parsed find query.
#[derive(Debug, Clone)]
pub struct Query {
    pub filter: FilterExpr,
    pub sort: Vec<(String, i32)>,
    pub skip: usize,
    pub limit: Option<usize>,
    pub projection: Option<Projection>,
}

impl Default for Query {
    fn default() -> Self {
        Query {
            filter: FilterExpr::All,
            sort: Vec::new(),
            skip: 0,
            limit: None,
            projection: None,
        }
    }
}

impl Query {
    /// Parse the query document: `{filter?, sort?, limit?, skip?,
    /// projection?}`. Unknown top-level keys are rejected.
    pub fn parse(doc: &Value) -> Result<Query> {
        let map = match doc {
            Value::Object(map) => map,
            _ => {
                return Err(FerroError::Validation(
                    "query must be a JSON object".into(),
                ))
            }
        };

        let mut query = Query::default();
        for (key, value) in map {
            match key.as_str() {
                "filter" => query.filter = FilterExpr::parse(value)?,
                "sort" => query.sort = parse_sort(value)?,
                "limit" => {
                    query.limit = Some(parse_non_negative(value, "limit")?);
                }
                "skip" => {
                    query.skip = parse_non_negative(value, "skip")?;
                }
                "projection" => query.projection = Some(Projection::parse(value)?),
                other => {
                    return Err(FerroError::Validation(format!(
                        "unknown query key '{}'",
                        other
                    )))
                }
            }
        }
        Ok(query)
    }

    /// A bare filter document (GET-style commands pass just the predicate).
    pub fn from_filter(filter: &Value) -> Result<Query> {
        Ok(Query {
            filter: FilterExpr::parse(filter)?,
            ..Query::default()
        })
    }
}

fn parse_non_negative(value: &Value, key: &str) -> Result<usize> {
    value
        .as_u64()
        .map(|n| n as usize)
        .ok_or_else(|| FerroError::Validation(format!("{} must be a non-negative integer", key)))
}

/// Sort spec: `[["field", 1], ...]` (order-preserving) or `{"field": 1}`.
pub fn parse_sort(value: &Value) -> Result<Vec<(String, i32)>> {
    let mut sort = Vec::new();
    match value {
        Value::Array(items) => {
            for item in items {
                let pair = item.as_array().filter(|p| p.len() == 2).ok_or_else(|| {
                    FerroError::Validation("sort entries must be [field, direction] pairs".into())
                })?;
                let field = pair[0]
                    .as_str()
                    .ok_or_else(|| FerroError::Validation("sort field must be a string".into()))?;
                sort.push((field.to_string(), parse_direction(&pair[1])?));
            }
        }
        Value::Object(map) => {
            for (field, dir) in map {
                sort.push((field.clone(), parse_direction(dir)?));
            }
        }
        _ => {
            return Err(FerroError::Validation(
                "sort must be an array of pairs or an object".into(),
            ))
        }
    }
    Ok(sort)
}

fn parse_direction(value: &Value) -> Result<i32> {
    match value.as_i64() {
        Some(1) => Ok(1),
        Some(-1) => Ok(-1),
        _ => Err(FerroError::Validation(
            "sort direction must be 1 or -1".into(),
        )),
    }
}

/// Sort documents in place by the sort spec, dotted paths included.
/// Missing values order before present ones; the sort is stable.
pub fn apply_sort(docs: &mut [Value], sort: &[(String, i32)]) {
    if sort.is_empty() {
        return;
    }
    docs.sort_by(|a, b| {
        for (field, direction) in sort {
            let ordering =
                compare_values_with_none(get_nested_value(a, field), get_nested_value(b, field));
            if ordering != std::cmp::Ordering::Equal {
                return if *direction == 1 {
                    ordering
                } else {
                    ordering.reverse()
                };
            }
        }
        std::cmp::Ordering::Equal
    });
}
