// query/aggregation.rs
// Aggregation pipeline: $match, $project, $sort, $limit, $skip, $group
//
// Stages execute in declared order over materialized documents. $sort and
// $group buffer their whole input; they report it via Stage::buffered so
// EXPLAIN-style output can show the memory-heavy stages. A leading $match
// (and $limit) is pushed into the source query by the database layer.

use std::collections::HashMap;

use serde_json::{json, Map, Value};

use crate::error::{FerroError, Result};
use crate::query::filter::{values_equal, EvalContext, FilterExpr};
use crate::query::{apply_sort, parse_sort};
use crate::value_utils::get_nested_value;

/// Parse a `"$field"` reference.
fn parse_field_reference(value: &Value, op_name: &str) -> Result<String> {
    match value.as_str() {
        Some(s) if s.starts_with('$') => Ok(s.trim_start_matches('$').to_string()),
        _ => Err(FerroError::Aggregation(format!(
            "{} expects a \"$field\" reference",
            op_name
        ))),
    }
}

fn numeric(value: &Value) -> Option<f64> {
    value.as_f64()
}

/// Render a float without a trailing .0 when it is integral.
fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < (i64::MAX as f64) {
        json!(n as i64)
    } else {
        json!(n)
    }
}

/// Aggregation pipeline.
#[derive(Debug, Clone)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

#[derive(Debug, Clone)]
pub enum Stage {
    Match(FilterExpr),
    Project(ProjectStage),
    Group(GroupStage),
    Sort(Vec<(String, i32)>),
    Limit(usize),
    Skip(usize),
}

#[derive(Debug, Clone)]
pub struct ProjectStage {
    fields: Vec<(String, ProjectField)>,
}

#[derive(Debug, Clone)]
pub enum ProjectField {
    Include,
    Exclude,
    /// `{"out": "$source.field"}` rename/projection
    Rename(String),
}

#[derive(Debug, Clone)]
pub struct GroupStage {
    id: GroupId,
    accumulators: Vec<(String, Accumulator)>,
}

#[derive(Debug, Clone)]
pub enum GroupId {
    /// `"$field"` - one bucket per distinct value
    Field(String),
    /// `null` - every document in one bucket
    Null,
}

#[derive(Debug, Clone)]
pub enum Accumulator {
    Sum(SumExpression),
    Avg(String),
    Min(String),
    Max(String),
    Count,
    First(String),
    Last(String),
    Push(String),
    AddToSet(String),
}

#[derive(Debug, Clone)]
pub enum SumExpression {
    /// `{"$sum": 1}` - counting
    Constant(f64),
    /// `{"$sum": "$amount"}`
    Field(String),
}

impl Pipeline {
    pub fn from_json(pipeline: &Value) -> Result<Self> {
        let stages_json = match pipeline {
            Value::Array(stages) => stages,
            _ => {
                return Err(FerroError::Aggregation(
                    "pipeline must be an array of stages".into(),
                ))
            }
        };
        if stages_json.is_empty() {
            return Err(FerroError::Aggregation("pipeline cannot be empty".into()));
        }
        let stages = stages_json
            .iter()
            .map(Stage::from_json)
            .collect::<Result<Vec<_>>>()?;
        Ok(Pipeline { stages })
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Split off a leading `$match` (and a `$limit` directly behind it)
    /// that can be pushed down into the source scan.
    pub fn pushdown(&self) -> (Option<&FilterExpr>, Option<usize>, &[Stage]) {
        let mut rest = self.stages.as_slice();
        let mut filter = None;
        let mut limit = None;
        if let Some(Stage::Match(expr)) = rest.first() {
            filter = Some(expr);
            rest = &rest[1..];
        }
        if let Some(Stage::Limit(n)) = rest.first() {
            limit = Some(*n);
            rest = &rest[1..];
        }
        (filter, limit, rest)
    }

    /// Execute every stage over the given documents.
    pub fn execute(&self, docs: Vec<Value>, ctx: &EvalContext) -> Result<Vec<Value>> {
        Self::execute_stages(&self.stages, docs, ctx)
    }

    pub fn execute_stages(stages: &[Stage], mut docs: Vec<Value>, ctx: &EvalContext) -> Result<Vec<Value>> {
        for stage in stages {
            docs = stage.execute(docs, ctx)?;
        }
        Ok(docs)
    }

    /// Stage listing with buffering flags (for AGGREGATE explain output).
    pub fn describe(&self) -> Value {
        Value::Array(
            self.stages
                .iter()
                .map(|stage| {
                    json!({
                        "stage": stage.name(),
                        "buffered": stage.buffered(),
                    })
                })
                .collect(),
        )
    }
}

impl Stage {
    fn from_json(stage: &Value) -> Result<Self> {
        let obj = match stage {
            Value::Object(obj) if obj.len() == 1 => obj,
            _ => {
                return Err(FerroError::Aggregation(
                    "each stage must be an object with exactly one operator".into(),
                ))
            }
        };
        let (name, spec) = obj.iter().next().expect("len checked");

        match name.as_str() {
            "$match" => Ok(Stage::Match(FilterExpr::parse(spec)?)),
            "$project" => Ok(Stage::Project(ProjectStage::from_json(spec)?)),
            "$group" => Ok(Stage::Group(GroupStage::from_json(spec)?)),
            "$sort" => Ok(Stage::Sort(parse_sort(spec)?)),
            "$limit" => Ok(Stage::Limit(spec.as_u64().ok_or_else(|| {
                FerroError::Aggregation("$limit expects a non-negative integer".into())
            })? as usize)),
            "$skip" => Ok(Stage::Skip(spec.as_u64().ok_or_else(|| {
                FerroError::Aggregation("$skip expects a non-negative integer".into())
            })? as usize)),
            other => Err(FerroError::Aggregation(format!(
                "unknown pipeline stage '{}'",
                other
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Match(_) => "$match",
            Stage::Project(_) => "$project",
            Stage::Group(_) => "$group",
            Stage::Sort(_) => "$sort",
            Stage::Limit(_) => "$limit",
            Stage::Skip(_) => "$skip",
        }
    }

    /// Whether the stage must buffer its entire input.
    pub fn buffered(&self) -> bool {
        matches!(self, Stage::Sort(_) | Stage::Group(_))
    }

    fn execute(&self, docs: Vec<Value>, ctx: &EvalContext) -> Result<Vec<Value>> {
        match self {
            Stage::Match(filter) => {
                let mut out = Vec::with_capacity(docs.len());
                for doc in docs {
                    if filter.evaluate(&doc, ctx)? {
                        out.push(doc);
                    }
                }
                Ok(out)
            }
            Stage::Project(project) => Ok(docs.iter().map(|d| project.apply(d)).collect()),
            Stage::Group(group) => group.execute(&docs),
            Stage::Sort(sort) => {
                let mut docs = docs;
                apply_sort(&mut docs, sort);
                Ok(docs)
            }
            Stage::Limit(n) => {
                let mut docs = docs;
                docs.truncate(*n);
                Ok(docs)
            }
            Stage::Skip(n) => Ok(docs.into_iter().skip(*n).collect()),
        }
    }
}

impl ProjectStage {
    fn from_json(spec: &Value) -> Result<Self> {
        let obj = match spec {
            Value::Object(obj) if !obj.is_empty() => obj,
            _ => {
                return Err(FerroError::Aggregation(
                    "$project expects a non-empty object".into(),
                ))
            }
        };
        let mut fields = Vec::with_capacity(obj.len());
        for (path, value) in obj {
            let field = match value {
                Value::Number(n) if n.as_i64() == Some(1) => ProjectField::Include,
                Value::Number(n) if n.as_i64() == Some(0) => ProjectField::Exclude,
                Value::Bool(true) => ProjectField::Include,
                Value::Bool(false) => ProjectField::Exclude,
                Value::String(s) if s.starts_with('$') => {
                    ProjectField::Rename(s.trim_start_matches('$').to_string())
                }
                _ => {
                    return Err(FerroError::Aggregation(format!(
                        "$project value for '{}' must be 0, 1 or \"$field\"",
                        path
                    )))
                }
            };
            fields.push((path.clone(), field));
        }
        Ok(ProjectStage { fields })
    }

    fn apply(&self, doc: &Value) -> Value {
        let include_mode = self
            .fields
            .iter()
            .any(|(_, f)| matches!(f, ProjectField::Include | ProjectField::Rename(_)));

        let mut out = Map::new();
        if include_mode {
            for (path, field) in &self.fields {
                match field {
                    ProjectField::Include => {
                        if let Some(value) = get_nested_value(doc, path) {
                            out.insert(path.clone(), value.clone());
                        }
                    }
                    ProjectField::Rename(source) => {
                        if let Some(value) = get_nested_value(doc, source) {
                            out.insert(path.clone(), value.clone());
                        }
                    }
                    ProjectField::Exclude => {}
                }
            }
            let id_excluded = self
                .fields
                .iter()
                .any(|(p, f)| p == "_id" && matches!(f, ProjectField::Exclude));
            if !id_excluded && !out.contains_key("_id") {
                if let Some(id) = doc.get("_id") {
                    out.insert("_id".to_string(), id.clone());
                }
            }
        } else if let Value::Object(source) = doc {
            for (key, value) in source {
                let excluded = self
                    .fields
                    .iter()
                    .any(|(p, f)| p == key && matches!(f, ProjectField::Exclude));
                if !excluded {
                    out.insert(key.clone(), value.clone());
                }
            }
        }
        Value::Object(out)
    }
}

impl GroupStage {
    fn from_json(spec: &Value) -> Result<Self> {
        let obj = match spec {
            Value::Object(obj) => obj,
            _ => return Err(FerroError::Aggregation("$group expects an object".into())),
        };
        let id = match obj.get("_id") {
            Some(Value::Null) => GroupId::Null,
            Some(Value::String(s)) if s.starts_with('$') => {
                GroupId::Field(s.trim_start_matches('$').to_string())
            }
            Some(_) => {
                return Err(FerroError::Aggregation(
                    "$group _id must be null or a \"$field\" reference".into(),
                ))
            }
            None => return Err(FerroError::Aggregation("$group requires _id".into())),
        };

        let mut accumulators = Vec::new();
        for (name, accum_spec) in obj {
            if name == "_id" {
                continue;
            }
            accumulators.push((name.clone(), Accumulator::from_json(accum_spec)?));
        }
        Ok(GroupStage { id, accumulators })
    }

    fn execute(&self, docs: &[Value]) -> Result<Vec<Value>> {
        // Buckets keyed by the canonical JSON of the group key; insertion
        // order retained for stable output
        let mut order: Vec<String> = Vec::new();
        let mut buckets: HashMap<String, (Value, Vec<&Value>)> = HashMap::new();

        for doc in docs {
            let key_value = match &self.id {
                GroupId::Null => Value::Null,
                GroupId::Field(path) => get_nested_value(doc, path).cloned().unwrap_or(Value::Null),
            };
            let key = serde_json::to_string(&key_value).unwrap_or_default();
            let bucket = buckets.entry(key.clone()).or_insert_with(|| {
                order.push(key);
                (key_value, Vec::new())
            });
            bucket.1.push(doc);
        }

        let mut out = Vec::with_capacity(order.len());
        for key in order {
            let (key_value, members) = buckets.remove(&key).expect("bucket recorded");
            let mut row = Map::new();
            row.insert("_id".to_string(), key_value);
            for (name, accumulator) in &self.accumulators {
                row.insert(name.clone(), accumulator.compute(&members)?);
            }
            out.push(Value::Object(row));
        }
        Ok(out)
    }
}

impl Accumulator {
    fn from_json(spec: &Value) -> Result<Self> {
        let obj = match spec {
            Value::Object(obj) if obj.len() == 1 => obj,
            _ => {
                return Err(FerroError::Aggregation(
                    "accumulator must be an object with exactly one operator".into(),
                ))
            }
        };
        let (op, value) = obj.iter().next().expect("len checked");
        match op.as_str() {
            "$sum" => match value {
                Value::Number(n) => Ok(Accumulator::Sum(SumExpression::Constant(
                    n.as_f64().unwrap_or(0.0),
                ))),
                other => Ok(Accumulator::Sum(SumExpression::Field(
                    parse_field_reference(other, "$sum")?,
                ))),
            },
            "$avg" => Ok(Accumulator::Avg(parse_field_reference(value, "$avg")?)),
            "$min" => Ok(Accumulator::Min(parse_field_reference(value, "$min")?)),
            "$max" => Ok(Accumulator::Max(parse_field_reference(value, "$max")?)),
            "$count" => Ok(Accumulator::Count),
            "$first" => Ok(Accumulator::First(parse_field_reference(value, "$first")?)),
            "$last" => Ok(Accumulator::Last(parse_field_reference(value, "$last")?)),
            "$push" => Ok(Accumulator::Push(parse_field_reference(value, "$push")?)),
            "$addToSet" => Ok(Accumulator::AddToSet(parse_field_reference(
                value,
                "$addToSet",
            )?)),
            other => Err(FerroError::Aggregation(format!(
                "unknown accumulator '{}'",
                other
            ))),
        }
    }

    fn compute(&self, docs: &[&Value]) -> Result<Value> {
        match self {
            Accumulator::Count => Ok(json!(docs.len())),
            Accumulator::Sum(SumExpression::Constant(c)) => {
                Ok(number_value(c * docs.len() as f64))
            }
            Accumulator::Sum(SumExpression::Field(path)) => {
                let mut total = 0.0;
                for doc in docs {
                    if let Some(n) = get_nested_value(doc, path).and_then(numeric) {
                        total += n;
                    }
                }
                Ok(number_value(total))
            }
            Accumulator::Avg(path) => {
                let mut total = 0.0;
                let mut count = 0usize;
                for doc in docs {
                    if let Some(n) = get_nested_value(doc, path).and_then(numeric) {
                        total += n;
                        count += 1;
                    }
                }
                if count == 0 {
                    Ok(Value::Null)
                } else {
                    Ok(json!(total / count as f64))
                }
            }
            Accumulator::Min(path) => Ok(Self::extremum(docs, path, |a, b| a.min(b))),
            Accumulator::Max(path) => Ok(Self::extremum(docs, path, |a, b| a.max(b))),
            Accumulator::First(path) => Ok(docs
                .first()
                .and_then(|d| get_nested_value(d, path))
                .cloned()
                .unwrap_or(Value::Null)),
            Accumulator::Last(path) => Ok(docs
                .last()
                .and_then(|d| get_nested_value(d, path))
                .cloned()
                .unwrap_or(Value::Null)),
            Accumulator::Push(path) => Ok(Value::Array(
                docs.iter()
                    .filter_map(|d| get_nested_value(d, path))
                    .cloned()
                    .collect(),
            )),
            Accumulator::AddToSet(path) => {
                let mut set: Vec<Value> = Vec::new();
                for doc in docs {
                    if let Some(value) = get_nested_value(doc, path) {
                        if !set.iter().any(|existing| values_equal(existing, value)) {
                            set.push(value.clone());
                        }
                    }
                }
                Ok(Value::Array(set))
            }
        }
    }

    fn extremum(docs: &[&Value], path: &str, pick: impl Fn(f64, f64) -> f64) -> Value {
        let mut result: Option<f64> = None;
        for doc in docs {
            if let Some(n) = get_nested_value(doc, path).and_then(numeric) {
                result = Some(result.map_or(n, |r| pick(r, n)));
            }
        }
        result.map(number_value).unwrap_or(Value::Null)
    }
}
