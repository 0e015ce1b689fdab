// query/filter.rs
// Filter predicate tree: parsing and evaluation
//
// Operators form a tagged sum with one variant per operator, so the parser
// can enumerate and validate the full set up front; unknown operator names
// fail at parse time, not mid-scan. $regex terms compile once, at parse
// time, and the compiled matcher lives inside the expression tree - scans
// and partial indexes re-evaluate a predicate thousands of times, the
// compiler runs exactly once per tree. Every match is still checked
// against a hard time budget.

use std::time::{Duration, Instant};

use regex::{Regex, RegexBuilder};
use serde_json::Value;

use crate::error::{FerroError, Result};
use crate::value_utils::{compare_values, get_nested_value};

/// Default per-evaluation regex budget; configurable per context.
pub const DEFAULT_REGEX_BUDGET: Duration = Duration::from_millis(250);

/// Upper bound on a compiled regex program. Keeps a hostile pattern from
/// ballooning memory the way a backtracking engine balloons time.
const REGEX_COMPILED_SIZE_LIMIT: usize = 1 << 20;

/// MongoDB-style matching options, mapped onto the regex builder flag by
/// flag instead of spliced into the pattern text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegexOptions {
    /// `i`
    pub case_insensitive: bool,
    /// `m` - ^ and $ match line boundaries
    pub multi_line: bool,
    /// `s` - . matches newlines
    pub dot_matches_newline: bool,
    /// `x` - whitespace ignored, # comments
    pub ignore_whitespace: bool,
}

impl RegexOptions {
    /// Parse an option string like `"im"`. Unknown letters are a query
    /// error, not silently dropped.
    pub fn parse(spec: &str) -> Result<Self> {
        let mut options = RegexOptions::default();
        for flag in spec.chars() {
            match flag {
                'i' => options.case_insensitive = true,
                'm' => options.multi_line = true,
                's' => options.dot_matches_newline = true,
                'x' => options.ignore_whitespace = true,
                other => {
                    return Err(FerroError::InvalidQuery(format!(
                        "unsupported $options flag '{}'",
                        other
                    )))
                }
            }
        }
        Ok(options)
    }
}

/// One `$regex` term: the source pattern plus its matcher, compiled when
/// the filter was parsed.
#[derive(Debug, Clone)]
pub struct CompiledRegex {
    source: String,
    options: RegexOptions,
    regex: Regex,
}

/// Equality is by (pattern, options) - two terms that compile the same
/// program are the same predicate.
impl PartialEq for CompiledRegex {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source && self.options == other.options
    }
}

impl CompiledRegex {
    pub fn compile(source: &str, options: RegexOptions) -> Result<Self> {
        let regex = RegexBuilder::new(source)
            .case_insensitive(options.case_insensitive)
            .multi_line(options.multi_line)
            .dot_matches_new_line(options.dot_matches_newline)
            .ignore_whitespace(options.ignore_whitespace)
            .size_limit(REGEX_COMPILED_SIZE_LIMIT)
            .build()
            .map_err(|e| {
                FerroError::InvalidQuery(format!("invalid regex pattern '{}': {}", source, e))
            })?;
        Ok(CompiledRegex {
            source: source.to_string(),
            options,
            regex,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Run one match under the time budget. The engine is linear-time, so
    /// the guard is a backstop, not the primary defense.
    pub fn is_match_within(&self, text: &str, budget: Duration) -> Result<bool> {
        let started = Instant::now();
        let matched = self.regex.is_match(text);
        if started.elapsed() > budget {
            return Err(FerroError::RegexTimeout);
        }
        Ok(matched)
    }
}

/// Evaluation context: carries the regex time budget.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext {
    pub regex_budget: Duration,
}

impl Default for EvalContext {
    fn default() -> Self {
        EvalContext {
            regex_budget: DEFAULT_REGEX_BUDGET,
        }
    }
}

impl EvalContext {
    pub fn with_budget(regex_budget: Duration) -> Self {
        EvalContext { regex_budget }
    }
}

/// Comparison operator kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl CmpOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            CmpOp::Eq => "$eq",
            CmpOp::Ne => "$ne",
            CmpOp::Gt => "$gt",
            CmpOp::Gte => "$gte",
            CmpOp::Lt => "$lt",
            CmpOp::Lte => "$lte",
        }
    }
}

/// Parsed filter predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterExpr {
    /// {} - matches every document
    All,
    Cmp {
        path: String,
        op: CmpOp,
        value: Value,
    },
    In {
        path: String,
        values: Vec<Value>,
        negated: bool,
    },
    Exists {
        path: String,
        expected: bool,
    },
    Regex {
        path: String,
        regex: CompiledRegex,
    },
    And(Vec<FilterExpr>),
    Or(Vec<FilterExpr>),
    Not(Box<FilterExpr>),
}

impl FilterExpr {
    // ------------------------------------------------------------------
    // Parsing
    // ------------------------------------------------------------------

    pub fn parse(filter: &Value) -> Result<FilterExpr> {
        let map = match filter {
            Value::Object(map) => map,
            _ => {
                return Err(FerroError::InvalidQuery(
                    "filter must be a JSON object".into(),
                ))
            }
        };
        if map.is_empty() {
            return Ok(FilterExpr::All);
        }

        let mut terms = Vec::with_capacity(map.len());
        for (key, value) in map {
            if let Some(op) = key.strip_prefix('$') {
                terms.push(Self::parse_logical(op, value)?);
            } else {
                terms.push(Self::parse_field(key, value)?);
            }
        }
        Ok(if terms.len() == 1 {
            terms.pop().expect("one term")
        } else {
            FilterExpr::And(terms)
        })
    }

    fn parse_logical(op: &str, value: &Value) -> Result<FilterExpr> {
        match op {
            "and" | "or" => {
                let items = value.as_array().ok_or_else(|| {
                    FerroError::InvalidQuery(format!("${} expects an array of filters", op))
                })?;
                if items.is_empty() {
                    return Err(FerroError::InvalidQuery(format!(
                        "${} expects a non-empty array",
                        op
                    )));
                }
                let parsed = items.iter().map(Self::parse).collect::<Result<Vec<_>>>()?;
                Ok(if op == "and" {
                    FilterExpr::And(parsed)
                } else {
                    FilterExpr::Or(parsed)
                })
            }
            "not" => Ok(FilterExpr::Not(Box::new(Self::parse(value)?))),
            other => Err(FerroError::InvalidQuery(format!(
                "unknown operator '${}'",
                other
            ))),
        }
    }

    /// Field entry: either an operator object or an implicit $eq.
    fn parse_field(path: &str, value: &Value) -> Result<FilterExpr> {
        let ops = match value {
            Value::Object(map) if map.keys().any(|k| k.starts_with('$')) => map,
            // Implicit $eq on the field, including object equality
            _ => {
                return Ok(FilterExpr::Cmp {
                    path: path.to_string(),
                    op: CmpOp::Eq,
                    value: value.clone(),
                })
            }
        };

        let mut terms = Vec::with_capacity(ops.len());
        let mut regex_options = String::new();
        let mut regex_pattern: Option<String> = None;

        for (op_name, op_value) in ops {
            match op_name.as_str() {
                "$eq" | "$ne" | "$gt" | "$gte" | "$lt" | "$lte" => {
                    let op = match op_name.as_str() {
                        "$eq" => CmpOp::Eq,
                        "$ne" => CmpOp::Ne,
                        "$gt" => CmpOp::Gt,
                        "$gte" => CmpOp::Gte,
                        "$lt" => CmpOp::Lt,
                        _ => CmpOp::Lte,
                    };
                    terms.push(FilterExpr::Cmp {
                        path: path.to_string(),
                        op,
                        value: op_value.clone(),
                    });
                }
                "$in" | "$nin" => {
                    let values = op_value
                        .as_array()
                        .ok_or_else(|| {
                            FerroError::InvalidQuery(format!("{} expects an array", op_name))
                        })?
                        .clone();
                    terms.push(FilterExpr::In {
                        path: path.to_string(),
                        values,
                        negated: op_name == "$nin",
                    });
                }
                "$exists" => {
                    let expected = op_value.as_bool().ok_or_else(|| {
                        FerroError::InvalidQuery("$exists expects a boolean".into())
                    })?;
                    terms.push(FilterExpr::Exists {
                        path: path.to_string(),
                        expected,
                    });
                }
                "$regex" => {
                    let pattern = op_value.as_str().ok_or_else(|| {
                        FerroError::InvalidQuery("$regex expects a string pattern".into())
                    })?;
                    regex_pattern = Some(pattern.to_string());
                }
                "$options" => {
                    regex_options = op_value.as_str().unwrap_or("").to_string();
                }
                unknown if unknown.starts_with('$') => {
                    return Err(FerroError::InvalidQuery(format!(
                        "unknown operator '{}'",
                        unknown
                    )));
                }
                _ => {
                    return Err(FerroError::InvalidQuery(format!(
                        "cannot mix operators and plain fields under '{}'",
                        path
                    )));
                }
            }
        }

        if let Some(pattern) = regex_pattern {
            // Compile here, once; evaluation only ever runs the matcher
            let options = RegexOptions::parse(&regex_options)?;
            terms.push(FilterExpr::Regex {
                path: path.to_string(),
                regex: CompiledRegex::compile(&pattern, options)?,
            });
        } else if !regex_options.is_empty() {
            return Err(FerroError::InvalidQuery(
                "$options requires a $regex on the same field".into(),
            ));
        }

        if terms.is_empty() {
            return Err(FerroError::InvalidQuery(format!(
                "empty operator object for field '{}'",
                path
            )));
        }
        Ok(if terms.len() == 1 {
            terms.pop().expect("one term")
        } else {
            FilterExpr::And(terms)
        })
    }

    // ------------------------------------------------------------------
    // Evaluation
    // ------------------------------------------------------------------

    /// Evaluate against a document value (the `_id`-bearing data tree).
    pub fn evaluate(&self, doc: &Value, ctx: &EvalContext) -> Result<bool> {
        match self {
            FilterExpr::All => Ok(true),
            FilterExpr::Cmp { path, op, value } => {
                Ok(Self::eval_cmp(get_nested_value(doc, path), *op, value))
            }
            FilterExpr::In {
                path,
                values,
                negated,
            } => {
                let field = get_nested_value(doc, path);
                let contained = match field {
                    Some(actual) => values.iter().any(|v| values_equal(actual, v)),
                    // A missing field only matches $nin
                    None => false,
                };
                Ok(if *negated { !contained } else { contained })
            }
            FilterExpr::Exists { path, expected } => {
                Ok(get_nested_value(doc, path).is_some() == *expected)
            }
            FilterExpr::Regex { path, regex } => {
                let text = match get_nested_value(doc, path) {
                    Some(Value::String(s)) => s,
                    _ => return Ok(false),
                };
                regex.is_match_within(text, ctx.regex_budget)
            }
            FilterExpr::And(terms) => {
                for term in terms {
                    if !term.evaluate(doc, ctx)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            FilterExpr::Or(terms) => {
                for term in terms {
                    if term.evaluate(doc, ctx)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            FilterExpr::Not(inner) => Ok(!inner.evaluate(doc, ctx)?),
        }
    }

    /// Evaluate with the default regex budget.
    pub fn matches_value(&self, doc: &Value) -> Result<bool> {
        self.evaluate(doc, &EvalContext::default())
    }

    fn eval_cmp(field: Option<&Value>, op: CmpOp, expected: &Value) -> bool {
        match op {
            CmpOp::Eq => match field {
                Some(actual) => values_equal(actual, expected),
                // {field: null} matches an absent field too
                None => expected.is_null(),
            },
            CmpOp::Ne => !Self::eval_cmp(field, CmpOp::Eq, expected),
            CmpOp::Gt | CmpOp::Gte | CmpOp::Lt | CmpOp::Lte => {
                let actual = match field {
                    Some(v) => v,
                    None => return false,
                };
                match compare_values(actual, expected) {
                    Some(ordering) => match op {
                        CmpOp::Gt => ordering.is_gt(),
                        CmpOp::Gte => ordering.is_ge(),
                        CmpOp::Lt => ordering.is_lt(),
                        CmpOp::Lte => ordering.is_le(),
                        _ => unreachable!(),
                    },
                    None => false,
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Shape helpers for the planner
    // ------------------------------------------------------------------

    /// Top-level conjuncts: the terms of an And, or the expression itself.
    pub fn conjuncts(&self) -> Vec<&FilterExpr> {
        match self {
            FilterExpr::All => Vec::new(),
            FilterExpr::And(terms) => terms.iter().collect(),
            other => vec![other],
        }
    }

    /// `(path, value)` when this term is an equality test.
    pub fn equality_target(&self) -> Option<(&str, &Value)> {
        match self {
            FilterExpr::Cmp {
                path,
                op: CmpOp::Eq,
                value,
            } => Some((path.as_str(), value)),
            _ => None,
        }
    }

    /// `(path, op, value)` when this term is an ordering comparison.
    pub fn range_target(&self) -> Option<(&str, CmpOp, &Value)> {
        match self {
            FilterExpr::Cmp { path, op, value }
                if matches!(op, CmpOp::Gt | CmpOp::Gte | CmpOp::Lt | CmpOp::Lte) =>
            {
                Some((path.as_str(), *op, value))
            }
            _ => None,
        }
    }
}

/// Equality with numeric cross-type tolerance (1 == 1.0).
pub fn values_equal(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    matches!(
        (a, b),
        (Value::Number(_), Value::Number(_))
    ) && compare_values(a, b) == Some(std::cmp::Ordering::Equal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn matches(filter: Value, doc: Value) -> bool {
        FilterExpr::parse(&filter)
            .unwrap()
            .matches_value(&doc)
            .unwrap()
    }

    #[test]
    fn test_empty_filter_matches_all() {
        assert!(matches(json!({}), json!({"a": 1})));
    }

    #[test]
    fn test_implicit_eq() {
        assert!(matches(json!({"name": "Alice"}), json!({"name": "Alice"})));
        assert!(!matches(json!({"name": "Alice"}), json!({"name": "Bob"})));
    }

    #[test]
    fn test_numeric_cross_type_eq() {
        assert!(matches(json!({"n": 1}), json!({"n": 1.0})));
    }

    #[test]
    fn test_eq_null_matches_missing() {
        assert!(matches(json!({"gone": null}), json!({"other": 1})));
        assert!(!matches(json!({"gone": 5}), json!({"other": 1})));
    }

    #[test]
    fn test_comparison_operators() {
        let doc = json!({"age": 25});
        assert!(matches(json!({"age": {"$gt": 18}}), doc.clone()));
        assert!(matches(json!({"age": {"$gte": 25}}), doc.clone()));
        assert!(matches(json!({"age": {"$lt": 30}}), doc.clone()));
        assert!(matches(json!({"age": {"$lte": 25}}), doc.clone()));
        assert!(matches(json!({"age": {"$ne": 30}}), doc.clone()));
        assert!(!matches(json!({"age": {"$gt": 25}}), doc));
    }

    #[test]
    fn test_range_on_missing_field_is_false() {
        assert!(!matches(json!({"age": {"$gt": 1}}), json!({"x": 1})));
        // But $ne on a missing field holds
        assert!(matches(json!({"age": {"$ne": 1}}), json!({"x": 1})));
    }

    #[test]
    fn test_in_nin() {
        let doc = json!({"city": "Wien"});
        assert!(matches(json!({"city": {"$in": ["Wien", "Graz"]}}), doc.clone()));
        assert!(!matches(json!({"city": {"$nin": ["Wien"]}}), doc.clone()));
        assert!(matches(json!({"city": {"$nin": ["Graz"]}}), doc));
        // Missing field: $in false, $nin true
        assert!(!matches(json!({"city": {"$in": ["Wien"]}}), json!({})));
        assert!(matches(json!({"city": {"$nin": ["Wien"]}}), json!({})));
    }

    #[test]
    fn test_exists() {
        assert!(matches(json!({"email": {"$exists": true}}), json!({"email": "x"})));
        assert!(matches(json!({"email": {"$exists": false}}), json!({})));
        assert!(!matches(json!({"email": {"$exists": true}}), json!({})));
    }

    #[test]
    fn test_logical_connectives() {
        let doc = json!({"a": 1, "b": 2});
        assert!(matches(json!({"$and": [{"a": 1}, {"b": 2}]}), doc.clone()));
        assert!(matches(json!({"$or": [{"a": 9}, {"b": 2}]}), doc.clone()));
        assert!(matches(json!({"$not": {"a": 9}}), doc.clone()));
        assert!(!matches(json!({"$and": [{"a": 1}, {"b": 9}]}), doc));
    }

    #[test]
    fn test_multiple_fields_are_conjunctive() {
        assert!(matches(json!({"a": 1, "b": 2}), json!({"a": 1, "b": 2})));
        assert!(!matches(json!({"a": 1, "b": 2}), json!({"a": 1, "b": 3})));
    }

    #[test]
    fn test_dotted_paths() {
        let doc = json!({"address": {"city": "Linz"}});
        assert!(matches(json!({"address.city": "Linz"}), doc));
    }

    #[test]
    fn test_unknown_operator_is_parse_error() {
        let err = FilterExpr::parse(&json!({"a": {"$frobnicate": 1}})).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        let err = FilterExpr::parse(&json!({"$xor": []})).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_invalid_regex_fails_at_parse() {
        let err = FilterExpr::parse(&json!({"a": {"$regex": "(unclosed"}})).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_regex_matching_with_options() {
        assert!(matches(
            json!({"name": {"$regex": "^al", "$options": "i"}}),
            json!({"name": "Alice"})
        ));
        assert!(!matches(
            json!({"name": {"$regex": "^al"}}),
            json!({"name": "Alice"})
        ));
        // Non-string fields never match
        assert!(!matches(json!({"n": {"$regex": "1"}}), json!({"n": 1})));
    }

    #[test]
    fn test_unknown_regex_option_rejected() {
        let err =
            FilterExpr::parse(&json!({"a": {"$regex": "x", "$options": "iz"}})).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_regex_options_parse_flags() {
        let options = RegexOptions::parse("is").unwrap();
        assert!(options.case_insensitive);
        assert!(options.dot_matches_newline);
        assert!(!options.multi_line);
        assert_eq!(RegexOptions::parse("").unwrap(), RegexOptions::default());
    }

    #[test]
    fn test_compiled_regex_equality_ignores_program() {
        let a = CompiledRegex::compile("^a+", RegexOptions::parse("i").unwrap()).unwrap();
        let b = CompiledRegex::compile("^a+", RegexOptions::parse("i").unwrap()).unwrap();
        let c = CompiledRegex::compile("^a+", RegexOptions::default()).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.source(), "^a+");
    }

    #[test]
    fn test_parsed_filters_share_no_recompilation_at_eval() {
        // A cloned filter carries its compiled matcher with it
        let expr = FilterExpr::parse(&json!({"s": {"$regex": "^ab", "$options": "i"}})).unwrap();
        let clone = expr.clone();
        assert!(clone.matches_value(&json!({"s": "ABBA"})).unwrap());
        assert_eq!(expr, clone);
    }

    #[test]
    fn test_redos_shaped_pattern_stays_within_budget() {
        // Catastrophic for backtracking engines; linear here, and the
        // budget guard must not fire
        let expr = FilterExpr::parse(&json!({"s": {"$regex": "(a+)+$"}})).unwrap();
        let doc = json!({"s": "aaaaaaaaaaaaaaaaaaaa!"});
        let ctx = EvalContext::with_budget(Duration::from_millis(250));
        assert_eq!(expr.evaluate(&doc, &ctx).unwrap(), false);
    }

    #[test]
    fn test_conjunct_extraction() {
        let expr = FilterExpr::parse(&json!({"a": 1, "b": {"$gt": 2}})).unwrap();
        let conjuncts = expr.conjuncts();
        assert_eq!(conjuncts.len(), 2);
        assert!(conjuncts.iter().any(|c| c.equality_target() == Some(("a", &json!(1)))));
        assert!(conjuncts.iter().any(|c| c.range_target().is_some()));
    }

    #[test]
    fn test_mixed_operator_and_plain_keys_rejected() {
        let err = FilterExpr::parse(&json!({"a": {"$gt": 1, "plain": 2}})).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }
}
