// query/executor.rs
// Index selection and result finalization
//
// The planner walks the filter's conjuncts and picks the index covering
// the most leading equalities, falling back to a single-field range scan,
// then a collection scan. Conjuncts the access path already enforces are
// subtracted from the residual filter. Sorting is skipped when the chosen
// index's key order matches the requested sort.

use std::ops::Bound;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::document::DocumentId;
use crate::index::{Index, IndexDirection, IndexKey, IndexKind, IndexManager};
use crate::query::filter::{CmpOp, FilterExpr};
use crate::query::{apply_sort, Query};

/// How candidate documents are produced.
pub enum AccessPath {
    /// Walk every resident document
    FullScan,
    /// Point lookup for a fully covered equality key
    IndexEq { index: Arc<Index>, key: IndexKey },
    /// Ordered range scan over one index
    IndexRange {
        index: Arc<Index>,
        start: Bound<IndexKey>,
        end: Bound<IndexKey>,
    },
}

pub struct QueryPlan {
    pub path: AccessPath,
    /// The filter portion the access path does not enforce
    pub residual: FilterExpr,
    /// Whether index order already satisfies the requested sort
    pub sort_satisfied: bool,
}

impl QueryPlan {
    /// Candidate ids in access-path order; None means collection scan.
    pub fn candidate_ids(&self) -> Option<Vec<DocumentId>> {
        match &self.path {
            AccessPath::FullScan => None,
            AccessPath::IndexEq { index, key } => Some(index.lookup(key)),
            AccessPath::IndexRange { index, start, end } => {
                Some(index.range(as_ref_bound(start), as_ref_bound(end)))
            }
        }
    }

    /// EXPLAIN output: access path, residual presence, sort strategy.
    pub fn explain(&self) -> Value {
        let (kind, index, detail) = match &self.path {
            AccessPath::FullScan => ("collection_scan", None, Value::Null),
            AccessPath::IndexEq { index, key } => (
                "index_point",
                Some(index.name().to_string()),
                json!(format!("{:?}", key)),
            ),
            AccessPath::IndexRange { index, start, end } => (
                "index_range",
                Some(index.name().to_string()),
                json!(format!("{:?}..{:?}", start, end)),
            ),
        };
        json!({
            "access_path": kind,
            "index": index,
            "detail": detail,
            "residual_filter": self.residual != FilterExpr::All,
            "sort": if self.sort_satisfied { "index_order" } else { "buffered" },
        })
    }
}

fn as_ref_bound(bound: &Bound<IndexKey>) -> Bound<&IndexKey> {
    match bound {
        Bound::Included(k) => Bound::Included(k),
        Bound::Excluded(k) => Bound::Excluded(k),
        Bound::Unbounded => Bound::Unbounded,
    }
}

/// Indexes with a selection predicate cannot serve arbitrary queries:
/// they are allowed to miss documents.
fn plannable(index: &Index) -> bool {
    let def = index.definition();
    !def.is_sparse() && !matches!(def.kind, IndexKind::Partial | IndexKind::Ttl)
}

/// Choose an access path for a query.
pub fn plan(query: &Query, manager: &IndexManager) -> QueryPlan {
    let conjuncts = query.filter.conjuncts();

    // Non-conjunctive top levels (Or/Not) scan with the whole filter
    if conjuncts.is_empty() && query.filter != FilterExpr::All {
        return QueryPlan {
            path: AccessPath::FullScan,
            residual: query.filter.clone(),
            sort_satisfied: false,
        };
    }

    let mut best: Option<(usize, Arc<Index>, IndexKey, Vec<usize>)> = None;
    let mut best_range: Option<(Arc<Index>, Bound<IndexKey>, Bound<IndexKey>, Vec<usize>)> = None;

    for index in manager.all() {
        if !plannable(&index) {
            continue;
        }
        let def = index.definition();

        // Leading equalities covered by this index
        let mut covered = Vec::new();
        let mut components = Vec::new();
        for field in &def.fields {
            let found = conjuncts.iter().enumerate().find_map(|(i, c)| {
                c.equality_target()
                    .filter(|(path, _)| *path == field.path)
                    .map(|(_, value)| (i, value))
            });
            match found {
                Some((i, value)) => {
                    covered.push(i);
                    let component = IndexKey::from(value);
                    components.push(match field.direction {
                        IndexDirection::Asc => component,
                        IndexDirection::Desc => IndexKey::Desc(Box::new(component)),
                    });
                }
                None => break,
            }
        }

        if covered.len() == def.fields.len() && !covered.is_empty() {
            // Full equality key; prefer the widest coverage
            let key = if components.len() == 1 {
                components.pop().expect("one component")
            } else {
                IndexKey::Compound(components)
            };
            if best.as_ref().map(|(n, ..)| covered.len() > *n).unwrap_or(true) {
                best = Some((covered.len(), index.clone(), key, covered.clone()));
            }
            continue;
        }

        // Range fallback: single ascending field with ordering conjuncts
        if best_range.is_none() && def.fields.len() == 1 && def.fields[0].direction == IndexDirection::Asc
        {
            let field_path = def.fields[0].path.as_str();
            let mut start = Bound::Unbounded;
            let mut end = Bound::Unbounded;
            let mut range_covered = Vec::new();
            for (i, conjunct) in conjuncts.iter().enumerate() {
                if let Some((path, op, value)) = conjunct.range_target() {
                    if path != field_path {
                        continue;
                    }
                    let key = IndexKey::from(value);
                    match op {
                        CmpOp::Gt => start = tighten_lower(start, Bound::Excluded(key)),
                        CmpOp::Gte => start = tighten_lower(start, Bound::Included(key)),
                        CmpOp::Lt => end = tighten_upper(end, Bound::Excluded(key)),
                        CmpOp::Lte => end = tighten_upper(end, Bound::Included(key)),
                        _ => continue,
                    }
                    range_covered.push(i);
                }
            }
            if !range_covered.is_empty() {
                best_range = Some((index.clone(), start, end, range_covered));
            }
        }
    }

    let (path, covered) = if let Some((_, index, key, covered)) = best {
        (AccessPath::IndexEq { index, key }, covered)
    } else if let Some((index, start, end, covered)) = best_range {
        (AccessPath::IndexRange { index, start, end }, covered)
    } else {
        return QueryPlan {
            path: AccessPath::FullScan,
            residual: query.filter.clone(),
            sort_satisfied: false,
        };
    };

    // Residual: conjuncts the access path does not already enforce
    let remaining: Vec<FilterExpr> = conjuncts
        .iter()
        .enumerate()
        .filter(|(i, _)| !covered.contains(i))
        .map(|(_, c)| (*c).clone())
        .collect();
    let residual = match remaining.len() {
        0 => FilterExpr::All,
        1 => remaining.into_iter().next().expect("one term"),
        _ => FilterExpr::And(remaining),
    };

    let sort_satisfied = sort_matches_path(&path, &query.sort);

    QueryPlan {
        path,
        residual,
        sort_satisfied,
    }
}

/// A range scan over a single ascending field yields that field's order.
fn sort_matches_path(path: &AccessPath, sort: &[(String, i32)]) -> bool {
    if sort.is_empty() {
        return true;
    }
    match path {
        AccessPath::IndexRange { index, .. } => {
            let def = index.definition();
            sort.len() == 1
                && def.fields.len() == 1
                && sort[0].0 == def.fields[0].path
                && sort[0].1 == def.fields[0].direction.as_i64() as i32
        }
        _ => false,
    }
}

fn tighten_lower(current: Bound<IndexKey>, candidate: Bound<IndexKey>) -> Bound<IndexKey> {
    match (&current, &candidate) {
        (Bound::Unbounded, _) => candidate,
        (Bound::Included(a) | Bound::Excluded(a), Bound::Included(b) | Bound::Excluded(b)) => {
            if b > a {
                candidate
            } else if b == a && matches!(candidate, Bound::Excluded(_)) {
                candidate
            } else {
                current
            }
        }
        _ => current,
    }
}

fn tighten_upper(current: Bound<IndexKey>, candidate: Bound<IndexKey>) -> Bound<IndexKey> {
    match (&current, &candidate) {
        (Bound::Unbounded, _) => candidate,
        (Bound::Included(a) | Bound::Excluded(a), Bound::Included(b) | Bound::Excluded(b)) => {
            if b < a {
                candidate
            } else if b == a && matches!(candidate, Bound::Excluded(_)) {
                candidate
            } else {
                current
            }
        }
        _ => current,
    }
}

/// Sort (unless index order suffices), then skip, then limit, then project.
pub fn finalize(mut docs: Vec<Value>, query: &Query, sort_satisfied: bool) -> Vec<Value> {
    if !sort_satisfied {
        apply_sort(&mut docs, &query.sort);
    }
    let mut docs: Vec<Value> = docs.into_iter().skip(query.skip).collect();
    if let Some(limit) = query.limit {
        docs.truncate(limit);
    }
    match &query.projection {
        Some(projection) => docs.iter().map(|d| projection.apply(d)).collect(),
        None => docs,
    }
}
