//! FNV-1a 64-bit hashing and deterministic entry encoding.
//!
//! A single non-cryptographic hash is the shared contract between clients
//! and servers: it routes keys to partitions and to `MerkleTree` buckets,
//! so every participant must compute identical values for identical input.
//! FNV-1a over UTF-8 bytes is stable across platforms and trivial to port.

use std::collections::BTreeMap;

use serde::Serialize;

const FNV64_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV64_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a 64-bit hash of a string's UTF-8 bytes.
#[must_use]
pub fn fnv1a_64(input: &str) -> u64 {
    fnv1a_64_bytes(input.as_bytes())
}

/// FNV-1a 64-bit hash of a byte slice.
#[must_use]
pub fn fnv1a_64_bytes(bytes: &[u8]) -> u64 {
    let mut hash = FNV64_OFFSET;
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(FNV64_PRIME);
    }
    hash
}

/// Folds a sequence of child hashes into a single parent hash.
///
/// Each hash contributes its little-endian bytes to a continuing FNV-1a
/// state, so the result is order-sensitive: callers must present children
/// in a canonical order (bucket index for Merkle internal nodes).
#[must_use]
pub fn combine_hashes(hashes: &[u64]) -> u64 {
    let mut hash = FNV64_OFFSET;
    for h in hashes {
        for b in h.to_le_bytes() {
            hash ^= u64::from(b);
            hash = hash.wrapping_mul(FNV64_PRIME);
        }
    }
    hash
}

/// Produces a deterministic JSON string with recursively sorted object keys.
///
/// Serializes `value` to `serde_json::Value`, recursively sorts all object
/// keys, then serializes back. Identical logical content yields identical
/// output regardless of the iteration order of the original type, which is
/// what Merkle entry hashing requires.
///
/// # Panics
///
/// Panics if `value` cannot be represented as JSON (non-string map keys from
/// foreign types). All wire-reachable record types satisfy the bound.
#[must_use]
pub fn canonical_json<V: Serialize>(value: &V) -> String {
    let json_value =
        serde_json::to_value(value).expect("record types must convert to serde_json::Value");
    let sorted = sort_json_value(json_value);
    serde_json::to_string(&sorted).expect("sorted serde_json::Value must serialize")
}

/// Recursively sorts object keys in a `serde_json::Value`.
fn sort_json_value(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let sorted: BTreeMap<String, serde_json::Value> = map
                .into_iter()
                .map(|(k, v)| (k, sort_json_value(v)))
                .collect();
            serde_json::Value::Object(sorted.into_iter().collect())
        }
        serde_json::Value::Array(arr) => {
            serde_json::Value::Array(arr.into_iter().map(sort_json_value).collect())
        }
        other => other,
    }
}
