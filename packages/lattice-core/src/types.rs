//! Runtime value model and shared domain types.
//!
//! The core treats stored values as structured-but-opaque data: a [`Value`]
//! is carried through merges, journaling, and broadcast without
//! interpretation. Only configured indexes, predicates, and field-level
//! security reach into it, via [`Value::get_path`].

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::lww_map::LwwRecord;
use crate::or_map::OrRecord;

/// Generic runtime value for CRDT map entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Explicit null.
    Null,
    /// Boolean.
    Bool(bool),
    /// 64-bit signed integer.
    Int(i64),
    /// 64-bit float.
    Float(f64),
    /// UTF-8 string.
    String(String),
    /// Raw bytes.
    Bytes(#[serde(with = "serde_bytes")] Vec<u8>),
    /// Ordered list of values.
    Array(Vec<Value>),
    /// String-keyed map with deterministic iteration order.
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Returns the string content if this is a `String` value.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer content if this is an `Int` value.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Resolves a dot-separated field path against this value.
    ///
    /// `get_path("address.city")` descends through nested `Map`s. An empty
    /// path returns the value itself. Missing segments or descents through
    /// non-map values yield `None`.
    #[must_use]
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        if path.is_empty() {
            return Some(self);
        }
        let mut current = self;
        for segment in path.split('.') {
            match current {
                Value::Map(fields) => current = fields.get(segment)?,
                _ => return None,
            }
        }
        Some(current)
    }

    /// Lists the top-level field names of a `Map` value.
    ///
    /// Non-map values have no addressable fields and return an empty list.
    #[must_use]
    pub fn top_level_fields(&self) -> Vec<&str> {
        match self {
            Value::Map(fields) => fields.keys().map(String::as_str).collect(),
            _ => Vec::new(),
        }
    }

    /// Compares two values for predicate evaluation and sorting.
    ///
    /// Numbers compare numerically across `Int`/`Float`; strings, bools,
    /// and bytes compare within their own type. Mixed or unordered types
    /// (arrays, maps, null) return `None`, which predicate operators treat
    /// as "no match".
    #[must_use]
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            #[allow(clippy::cast_precision_loss)] // comparison tolerance, not storage
            (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            #[allow(clippy::cast_precision_loss)]
            (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Bytes(a), Value::Bytes(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

/// Discriminant for CRDT map strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MapKind {
    /// Last-Write-Wins: the record with the greatest timestamp prevails.
    Lww,
    /// Observed-Remove set: tagged multi-value entries with add-wins merge.
    Or,
}

/// Tagged union stored in one persistence slot.
///
/// A storage key maps to exactly one of these shapes; the serialized form
/// carries the variant tag so heterogeneous record types share one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum StorageValue {
    /// A single LWW record (possibly a tombstone).
    Lww {
        /// The record, tombstone included.
        record: LwwRecord<Value>,
    },
    /// All active OR-set records for one key.
    OrRecords {
        /// Tagged records currently visible for the key.
        records: Vec<OrRecord<Value>>,
    },
    /// The OR-set tombstone tags for one map.
    OrTombstones {
        /// Removed tags.
        tags: Vec<String>,
    },
}

/// Authenticated identity attached to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    /// Unique identifier of the authenticated entity.
    pub user_id: String,
    /// Roles granted to this principal, consumed by the policy engine.
    pub roles: Vec<String>,
}
