//! Typed filter expressions over indexed document fields.
//!
//! Filters are small boolean trees evaluated against the top-level fields
//! of a stored JSON document. Comparisons are timestamp-aware: two strings
//! that both parse as RFC 3339 instants compare as instants, so range
//! filters over `created_at`-style fields behave chronologically.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde_json::Value;

/// A boolean expression over top-level document fields.
#[derive(Debug, Clone)]
pub enum Filter {
    /// Matches every document.
    All,
    /// `field == value`.
    Eq(String, Value),
    /// `field != value` (a missing field does not match).
    Ne(String, Value),
    /// `field <= value`.
    Le(String, Value),
    /// `field >= value`.
    Ge(String, Value),
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq(field.into(), value.into())
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Ne(field.into(), value.into())
    }

    pub fn le(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Le(field.into(), value.into())
    }

    pub fn ge(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Ge(field.into(), value.into())
    }

    pub fn and(filters: Vec<Filter>) -> Self {
        Self::And(filters)
    }

    pub fn or(filters: Vec<Filter>) -> Self {
        Self::Or(filters)
    }

    /// Evaluate the filter against a document.
    pub fn matches(&self, doc: &Value) -> bool {
        match self {
            Self::All => true,
            Self::Eq(field, want) => field_of(doc, field)
                .map(|got| compare_values(got, want) == Some(Ordering::Equal))
                .unwrap_or(false),
            Self::Ne(field, want) => field_of(doc, field)
                .map(|got| compare_values(got, want) != Some(Ordering::Equal))
                .unwrap_or(false),
            Self::Le(field, want) => field_of(doc, field)
                .and_then(|got| compare_values(got, want))
                .map(|ord| ord != Ordering::Greater)
                .unwrap_or(false),
            Self::Ge(field, want) => field_of(doc, field)
                .and_then(|got| compare_values(got, want))
                .map(|ord| ord != Ordering::Less)
                .unwrap_or(false),
            Self::And(filters) => filters.iter().all(|f| f.matches(doc)),
            Self::Or(filters) => filters.iter().any(|f| f.matches(doc)),
        }
    }
}

fn field_of<'v>(doc: &'v Value, field: &str) -> Option<&'v Value> {
    match doc.get(field) {
        Some(Value::Null) | None => None,
        Some(v) => Some(v),
    }
}

/// Compare two JSON scalars.
///
/// Strings that both parse as RFC 3339 compare as instants; numbers compare
/// numerically; everything else falls back to same-type ordering. Returns
/// `None` for incomparable values, which makes range filters not match.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::String(sa), Value::String(sb)) => {
            match (parse_instant(sa), parse_instant(sb)) {
                (Some(ta), Some(tb)) => Some(ta.cmp(&tb)),
                _ => Some(sa.cmp(sb)),
            }
        }
        (Value::Number(na), Value::Number(nb)) => {
            if let (Some(ia), Some(ib)) = (na.as_i64(), nb.as_i64()) {
                Some(ia.cmp(&ib))
            } else {
                na.as_f64()
                    .zip(nb.as_f64())
                    .and_then(|(fa, fb)| fa.partial_cmp(&fb))
            }
        }
        (Value::Bool(ba), Value::Bool(bb)) => Some(ba.cmp(bb)),
        _ => None,
    }
}

fn parse_instant(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
