//! Opaque pagination cursors.
//!
//! A cursor pins the position after the last returned row: the query's
//! fingerprint (filter + sort), the row's sort key values, its entry key,
//! and the iteration direction. It travels base64-encoded and is decoded
//! best-effort: anything malformed, or minted by a query with a different
//! fingerprint, is ignored and iteration restarts from the beginning.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use lattice_core::types::Value;
use serde::{Deserialize, Serialize};

/// Iteration direction the cursor was minted under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Ascending sort order.
    Forward,
    /// Descending sort order.
    Backward,
}

/// Decoded continuation token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cursor {
    /// Fingerprint of the query that minted the cursor.
    pub fingerprint: u64,
    /// Sort key values of the last returned row; `Null` stands in for a
    /// missing sort field (both sort last).
    pub last_sort_values: Vec<Value>,
    /// Entry key of the last returned row (the final tie-break).
    pub last_key: String,
    /// Direction the page was produced in.
    pub direction: Direction,
}

impl Cursor {
    /// Encodes to the opaque wire form.
    #[must_use]
    pub fn encode(&self) -> String {
        let bytes = rmp_serde::to_vec_named(self).expect("cursor fields always serialize");
        URL_SAFE_NO_PAD.encode(bytes)
    }

    /// Decodes a wire cursor; `None` for anything malformed.
    #[must_use]
    pub fn decode(token: &str) -> Option<Self> {
        let bytes = URL_SAFE_NO_PAD.decode(token).ok()?;
        rmp_serde::from_slice(&bytes).ok()
    }
}
