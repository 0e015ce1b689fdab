// ferrodb-core/src/index/ttl.rs
// TTL index expiry: timestamp coercion and expired-id selection
//
// The sweep thread itself lives in database.rs; expiry deletes go through
// the regular transactional delete path so every index stays consistent
// and WAL records are emitted under a system transaction.

use std::ops::Bound;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::document::DocumentId;
use crate::index::{Index, IndexKey};

/// Coerce a TTL field value to epoch milliseconds.
///
/// Accepted shapes: RFC 3339 strings, integer epoch milliseconds, and
/// float epoch seconds. Anything else is not a timestamp and the document
/// is not indexed.
pub fn timestamp_millis(value: &Value) -> Option<i64> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc).timestamp_millis()),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(i)
            } else {
                n.as_f64().map(|f| (f * 1000.0) as i64)
            }
        }
        _ => None,
    }
}

/// Ids of documents whose TTL field is at or before `now - ttl`.
///
/// The boundary is inclusive: a document stamped exactly `now - ttl` is
/// expired, one stamped a millisecond later is not.
pub fn expired_ids(index: &Index, now: DateTime<Utc>) -> Vec<DocumentId> {
    let ttl_secs = match index.definition().ttl_secs {
        Some(secs) => secs,
        None => return Vec::new(),
    };
    let cutoff = now.timestamp_millis() - ttl_secs * 1000;
    let upper = IndexKey::Int(cutoff);
    index.range(Bound::Unbounded, Bound::Included(&upper))
}
