//! Last-Writer-Wins map CRDT.
//!
//! `LwwMap<V>` resolves concurrent writes to the same key by keeping the
//! record with the greatest [`Timestamp`]; the HLC total order (physical,
//! counter, node id) makes the outcome identical on every replica
//! regardless of delivery order.
//!
//! Deletions are tombstones (`value: None`) that participate in merge like
//! any other record and are physically dropped only by [`LwwMap::prune`],
//! once the coordinator knows no live peer can still reference them. TTLs
//! are evaluated at read time against the clock source; an expired record
//! stays in place until pruned or overwritten.
//!
//! Every mutation feeds the embedded [`MerkleTree`], so replicas can
//! locate divergent keys without exchanging full content.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::hash::{canonical_json, fnv1a_64};
use crate::hlc::{Hlc, Timestamp};
use crate::merkle::MerkleTree;

/// Upper bound on key length accepted by map mutations.
pub const DEFAULT_MAX_KEY_LEN: usize = 1024;

/// A value wrapped with its causal timestamp.
///
/// `value: None` encodes a tombstone. `ttl_ms` is relative to the
/// timestamp's physical component and is checked on read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(bound(serialize = "V: Serialize", deserialize = "V: DeserializeOwned"))]
pub struct LwwRecord<V> {
    /// The stored value, or `None` for a tombstone.
    pub value: Option<V>,
    /// Causal timestamp issued by the writing node.
    pub timestamp: Timestamp,
    /// Optional time-to-live in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ttl_ms: Option<u64>,
}

impl<V> LwwRecord<V> {
    /// Whether this record is a deletion marker.
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

/// Errors from map mutations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    /// The key exceeds the configured length limit.
    #[error("key length {len} exceeds limit {max}")]
    InvalidKey {
        /// Offending key length in bytes.
        len: usize,
        /// Configured maximum.
        max: usize,
    },
}

/// A Last-Writer-Wins map with Merkle-backed delta sync support.
///
/// Concurrent updates never error: the CRDT resolves them
/// deterministically. The only mutation error is [`MapError::InvalidKey`].
pub struct LwwMap<V> {
    records: HashMap<String, LwwRecord<V>>,
    hlc: Hlc,
    merkle: MerkleTree,
    max_key_len: usize,
}

impl<V> LwwMap<V>
where
    V: Clone + Serialize + DeserializeOwned + PartialEq,
{
    /// Creates an empty map around the given clock.
    #[must_use]
    pub fn new(hlc: Hlc) -> Self {
        Self::with_limits(hlc, MerkleTree::default_depth(), DEFAULT_MAX_KEY_LEN)
    }

    /// Creates an empty map with an explicit Merkle tree and key limit.
    #[must_use]
    pub fn with_limits(hlc: Hlc, merkle: MerkleTree, max_key_len: usize) -> Self {
        Self {
            records: HashMap::new(),
            hlc,
            merkle,
            max_key_len,
        }
    }

    /// Stores a value under a fresh local timestamp.
    ///
    /// # Errors
    ///
    /// Returns [`MapError::InvalidKey`] when the key exceeds the limit.
    pub fn set(
        &mut self,
        key: impl Into<String>,
        value: V,
        ttl_ms: Option<u64>,
    ) -> Result<LwwRecord<V>, MapError> {
        let key = key.into();
        self.check_key(&key)?;
        let record = LwwRecord {
            value: Some(value),
            timestamp: self.hlc.now(),
            ttl_ms,
        };
        self.store(key, record.clone());
        Ok(record)
    }

    /// Tombstones a key under a fresh local timestamp.
    ///
    /// The tombstone is written even when the key was never present, so
    /// that a delete observed before the corresponding set still wins if
    /// its timestamp is greater.
    ///
    /// # Errors
    ///
    /// Returns [`MapError::InvalidKey`] when the key exceeds the limit.
    pub fn remove(&mut self, key: &str) -> Result<LwwRecord<V>, MapError> {
        self.check_key(key)?;
        let tombstone = LwwRecord {
            value: None,
            timestamp: self.hlc.now(),
            ttl_ms: None,
        };
        self.store(key.to_string(), tombstone.clone());
        Ok(tombstone)
    }

    /// Reads the live value for a key.
    ///
    /// Tombstones and TTL-expired records read as absent.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&V> {
        let record = self.records.get(key)?;
        if self.is_expired(record) {
            return None;
        }
        record.value.as_ref()
    }

    /// Reads the raw record for a key, tombstones and expired included.
    ///
    /// Sync and persistence need the full record; client reads go through
    /// [`LwwMap::get`].
    #[must_use]
    pub fn get_record(&self, key: &str) -> Option<&LwwRecord<V>> {
        self.records.get(key)
    }

    /// Merges a remote record, returning `true` if local state changed.
    ///
    /// The remote timestamp always feeds the HLC (drift errors from the
    /// non-strict path are ignored; strict-mode enforcement happens at the
    /// session boundary before merge). The record is accepted when no
    /// local record exists or the remote timestamp is strictly greater.
    pub fn merge(&mut self, key: impl Into<String>, remote: LwwRecord<V>) -> bool {
        let _ = self.hlc.update(&remote.timestamp);

        let key = key.into();
        let accept = match self.records.get(&key) {
            None => true,
            Some(local) => remote.timestamp > local.timestamp,
        };
        if accept {
            self.store(key, remote);
        }
        accept
    }

    /// Drops tombstones with timestamps strictly below `older_than`.
    ///
    /// The cutoff is supplied by the coordinator as the oldest timestamp
    /// still reachable from active peers. Live records are never pruned.
    /// Returns the pruned keys.
    pub fn prune(&mut self, older_than: &Timestamp) -> Vec<String> {
        let pruned: Vec<String> = self
            .records
            .iter()
            .filter(|(_, r)| r.is_tombstone() && r.timestamp < *older_than)
            .map(|(k, _)| k.clone())
            .collect();

        for key in &pruned {
            self.records.remove(key);
            self.merkle.remove(key);
        }
        pruned
    }

    /// Removes all records and resets the Merkle tree.
    pub fn clear(&mut self) {
        self.records.clear();
        let depth = self.merkle.depth();
        self.merkle = MerkleTree::new(depth);
    }

    /// Iterates live entries (no tombstones, no expired records).
    pub fn entries(&self) -> impl Iterator<Item = (&String, &V)> {
        self.records.iter().filter_map(move |(key, record)| {
            if self.is_expired(record) {
                return None;
            }
            record.value.as_ref().map(|v| (key, v))
        })
    }

    /// Iterates all keys, tombstones included.
    pub fn all_keys(&self) -> impl Iterator<Item = &String> {
        self.records.keys()
    }

    /// Number of stored records, tombstones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no records are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Read access to the Merkle tree for sync walks.
    #[must_use]
    pub fn merkle(&self) -> &MerkleTree {
        &self.merkle
    }

    /// The node id of the embedded clock.
    #[must_use]
    pub fn node_id(&self) -> &str {
        self.hlc.node_id()
    }

    fn check_key(&self, key: &str) -> Result<(), MapError> {
        if key.len() > self.max_key_len {
            return Err(MapError::InvalidKey {
                len: key.len(),
                max: self.max_key_len,
            });
        }
        Ok(())
    }

    fn is_expired(&self, record: &LwwRecord<V>) -> bool {
        record.ttl_ms.is_some_and(|ttl| {
            record.timestamp.physical_millis + ttl < self.hlc.clock_source().now()
        })
    }

    fn store(&mut self, key: String, record: LwwRecord<V>) {
        let entry_hash = entry_hash(&key, &record);
        self.records.insert(key.clone(), record);
        self.merkle.update(&key, entry_hash);
    }
}

/// Entry hash over key and full record content.
///
/// Covers value, timestamp, and TTL so that any observable difference
/// between replicas surfaces in the Merkle comparison.
fn entry_hash<V: Serialize>(key: &str, record: &LwwRecord<V>) -> u64 {
    let value_json = canonical_json(&record.value);
    let mut input = format!("{key}|{}|{value_json}", record.timestamp);
    if let Some(ttl) = record.ttl_ms {
        use std::fmt::Write;
        let _ = write!(input, "|ttl={ttl}");
    }
    fnv1a_64(&input)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering as AtomicOrdering;
    use std::sync::Arc;

    use super::*;
    use crate::hlc::test_support::ManualClock;
    use crate::types::Value;

    fn make_map(initial_time: u64) -> (LwwMap<Value>, Arc<std::sync::atomic::AtomicU64>) {
        let (clock, time) = ManualClock::new(initial_time);
        let hlc = Hlc::new("test-node", Box::new(clock));
        (LwwMap::new(hlc), time)
    }

    fn record(value: &str, physical: u64, counter: u32, node: &str) -> LwwRecord<Value> {
        LwwRecord {
            value: Some(Value::String(value.to_string())),
            timestamp: Timestamp::new(physical, counter, node),
            ttl_ms: None,
        }
    }

    // ---- basic reads and writes ----

    #[test]
    fn set_then_get() {
        let (mut map, _) = make_map(1_000_000);
        map.set("user:1", Value::Int(7), None).unwrap();
        assert_eq!(map.get("user:1"), Some(&Value::Int(7)));
        assert_eq!(map.get("missing"), None);
    }

    #[test]
    fn set_overwrites_with_newer_timestamp() {
        let (mut map, _) = make_map(1_000_000);
        map.set("k", Value::Int(1), None).unwrap();
        map.set("k", Value::Int(2), None).unwrap();
        assert_eq!(map.get("k"), Some(&Value::Int(2)));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn get_record_exposes_raw_state() {
        let (mut map, _) = make_map(1_000_000);
        map.set("k", Value::Int(42), Some(9_000)).unwrap();
        let rec = map.get_record("k").expect("record exists");
        assert_eq!(rec.value, Some(Value::Int(42)));
        assert_eq!(rec.timestamp.node_id, "test-node");
        assert_eq!(rec.ttl_ms, Some(9_000));
    }

    #[test]
    fn oversize_key_is_rejected() {
        let (clock, _) = ManualClock::new(0);
        let hlc = Hlc::new("n", Box::new(clock));
        let mut map: LwwMap<Value> =
            LwwMap::with_limits(hlc, MerkleTree::default_depth(), 8);

        let err = map.set("way-too-long-key", Value::Null, None).unwrap_err();
        assert_eq!(err, MapError::InvalidKey { len: 16, max: 8 });
        assert!(map.is_empty());

        let err = map.remove("way-too-long-key").unwrap_err();
        assert!(matches!(err, MapError::InvalidKey { .. }));
    }

    // ---- tombstones ----

    #[test]
    fn remove_hides_value_but_keeps_record() {
        let (mut map, _) = make_map(1_000_000);
        map.set("k", Value::Int(1), None).unwrap();
        let tomb = map.remove("k").unwrap();
        assert!(tomb.is_tombstone());
        assert_eq!(map.get("k"), None);
        assert!(map.get_record("k").unwrap().is_tombstone());
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn remove_unknown_key_still_writes_tombstone() {
        let (mut map, _) = make_map(1_000_000);
        map.remove("phantom").unwrap();
        assert!(map.get_record("phantom").unwrap().is_tombstone());
    }

    // ---- TTL ----

    #[test]
    fn ttl_expires_on_read_only() {
        let (mut map, time) = make_map(1_000_000);
        map.set("session", Value::String("S".to_string()), Some(100))
            .unwrap();

        // Within TTL.
        time.store(1_000_050, AtomicOrdering::Relaxed);
        assert!(map.get("session").is_some());

        // Past TTL: read as absent, record physically retained.
        time.store(1_000_150, AtomicOrdering::Relaxed);
        assert_eq!(map.get("session"), None);
        assert!(map.get_record("session").is_some());
    }

    #[test]
    fn ttl_boundary_is_inclusive() {
        let (mut map, time) = make_map(1_000_000);
        map.set("k", Value::Int(1), Some(500)).unwrap();
        time.store(1_000_500, AtomicOrdering::Relaxed);
        assert!(map.get("k").is_some());
        time.store(1_000_501, AtomicOrdering::Relaxed);
        assert!(map.get("k").is_none());
    }

    #[test]
    fn no_ttl_never_expires() {
        let (mut map, time) = make_map(1_000_000);
        map.set("k", Value::Int(1), None).unwrap();
        time.store(u64::MAX, AtomicOrdering::Relaxed);
        assert!(map.get("k").is_some());
    }

    // ---- merge conflict resolution ----

    #[test]
    fn merge_keeps_greater_timestamp() {
        let (mut map, _) = make_map(1_000_000);
        assert!(map.merge("k", record("old", 100, 0, "A")));
        assert!(map.merge("k", record("new", 200, 0, "B")));
        assert_eq!(map.get("k"), Some(&Value::String("new".to_string())));

        // Re-offering the stale record is a no-op.
        assert!(!map.merge("k", record("old", 100, 0, "A")));
        assert_eq!(map.get("k"), Some(&Value::String("new".to_string())));
    }

    #[test]
    fn merge_ties_break_on_node_id() {
        let a = record("from-a", 100, 0, "A");
        let b = record("from-b", 100, 0, "B");

        let (mut ab, _) = make_map(1_000_000);
        ab.merge("k", a.clone());
        ab.merge("k", b.clone());

        let (mut ba, _) = make_map(1_000_000);
        ba.merge("k", b);
        ba.merge("k", a);

        assert_eq!(ab.get("k"), ba.get("k"));
        assert_eq!(ab.get("k"), Some(&Value::String("from-b".to_string())));
    }

    #[test]
    fn merge_tombstone_wins_when_newer() {
        let (mut map, _) = make_map(1_000_000);
        map.merge("k", record("v", 100, 0, "A"));
        map.merge(
            "k",
            LwwRecord {
                value: None,
                timestamp: Timestamp::new(200, 0, "B"),
                ttl_ms: None,
            },
        );
        assert_eq!(map.get("k"), None);
        assert!(map.get_record("k").unwrap().is_tombstone());
    }

    // ---- prune ----

    #[test]
    fn prune_drops_only_old_tombstones() {
        let (mut map, _) = make_map(1_000_000);
        map.set("live", Value::Int(1), None).unwrap();
        let tomb = map.remove("dead").unwrap();

        let cutoff = Timestamp::new(tomb.timestamp.physical_millis + 1_000, 0, "test-node");
        let pruned = map.prune(&cutoff);

        assert_eq!(pruned, vec!["dead".to_string()]);
        assert!(map.get_record("dead").is_none());
        assert!(map.get_record("live").is_some());
    }

    #[test]
    fn prune_spares_recent_tombstones() {
        let (mut map, _) = make_map(1_000_000);
        let tomb = map.remove("k").unwrap();
        let cutoff = Timestamp::new(tomb.timestamp.physical_millis - 1, 0, "test-node");
        assert!(map.prune(&cutoff).is_empty());
        assert!(map.get_record("k").is_some());
    }

    // ---- iteration ----

    #[test]
    fn entries_filters_tombstones_and_expired() {
        let (mut map, time) = make_map(1_000_000);
        map.set("live", Value::Int(1), None).unwrap();
        map.set("short", Value::Int(2), Some(10)).unwrap();
        map.set("gone", Value::Int(3), None).unwrap();
        map.remove("gone").unwrap();

        time.store(1_000_100, AtomicOrdering::Relaxed);
        let mut keys: Vec<&String> = map.entries().map(|(k, _)| k).collect();
        keys.sort();
        assert_eq!(keys, vec!["live"]);

        let mut all: Vec<&String> = map.all_keys().collect();
        all.sort();
        assert_eq!(all, vec!["gone", "live", "short"]);
    }

    // ---- Merkle integration ----

    #[test]
    fn mutations_move_the_merkle_root() {
        let (mut map, _) = make_map(1_000_000);
        let empty = map.merkle().root_hash();

        map.set("k", Value::Int(1), None).unwrap();
        let after_set = map.merkle().root_hash();
        assert_ne!(empty, after_set);

        map.remove("k").unwrap();
        let after_remove = map.merkle().root_hash();
        assert_ne!(after_set, after_remove);
    }

    #[test]
    fn replicas_with_same_records_share_roots() {
        let (mut a, _) = make_map(1_000_000);
        let (mut b, _) = make_map(1_000_000);

        let rec = record("payload", 500, 3, "writer");
        a.merge("k", rec.clone());
        b.merge("k", rec);

        assert_eq!(a.merkle().root_hash(), b.merkle().root_hash());
    }

    #[test]
    fn value_difference_shows_in_root() {
        // Same timestamp, different payloads must still diverge the root.
        let (mut a, _) = make_map(1_000_000);
        let (mut b, _) = make_map(1_000_000);
        a.merge("k", record("x", 500, 0, "w"));
        b.merge("k", record("y", 500, 0, "w"));
        assert_ne!(a.merkle().root_hash(), b.merkle().root_hash());
    }

    #[test]
    fn clear_resets_everything() {
        let (mut map, _) = make_map(1_000_000);
        map.set("a", Value::Int(1), None).unwrap();
        map.clear();
        assert!(map.is_empty());
        assert_eq!(map.merkle().root_hash(), crate::merkle::EMPTY_HASH);
    }
}

/// Property-based CRDT laws.
#[cfg(test)]
mod proptests {
    use proptest::prelude::*;

    use super::*;
    use crate::hlc::test_support::ManualClock;
    use crate::types::Value;

    fn make_map() -> LwwMap<Value> {
        let (clock, _) = ManualClock::new(u64::MAX / 2);
        LwwMap::new(Hlc::new("prop-node", Box::new(clock)))
    }

    fn arb_record() -> impl Strategy<Value = LwwRecord<Value>> {
        (
            prop::option::of(prop_oneof![
                any::<i64>().prop_map(Value::Int),
                "[a-z ]{0,12}".prop_map(Value::String),
                any::<bool>().prop_map(Value::Bool),
            ]),
            1_u64..1_000_000_000,
            0_u32..100,
            "[a-z]{1,6}",
        )
            .prop_map(|(value, physical, counter, node)| LwwRecord {
                value,
                timestamp: Timestamp::new(physical, counter, node),
                ttl_ms: None,
            })
    }

    proptest! {
        /// Merge order does not matter.
        #[test]
        fn merge_commutes(r1 in arb_record(), r2 in arb_record()) {
            let mut forward = make_map();
            forward.merge("k", r1.clone());
            forward.merge("k", r2.clone());

            let mut backward = make_map();
            backward.merge("k", r2);
            backward.merge("k", r1);

            prop_assert_eq!(forward.get_record("k"), backward.get_record("k"));
            prop_assert_eq!(
                forward.merkle().root_hash(),
                backward.merkle().root_hash()
            );
        }

        /// Re-merging a record changes nothing.
        #[test]
        fn merge_is_idempotent(r in arb_record()) {
            let mut map = make_map();
            map.merge("k", r.clone());
            let root = map.merkle().root_hash();
            let snapshot = map.get_record("k").cloned();

            prop_assert!(!map.merge("k", r));
            prop_assert_eq!(map.get_record("k").cloned(), snapshot);
            prop_assert_eq!(map.merkle().root_hash(), root);
        }

        /// All interleavings of a record set converge to the same state
        /// with the same Merkle root.
        #[test]
        fn replicas_converge(
            records in proptest::collection::vec(("[a-d]{1,3}", arb_record()), 1..12),
        ) {
            let mut forward = make_map();
            for (key, rec) in &records {
                forward.merge(key.clone(), rec.clone());
            }

            let mut backward = make_map();
            for (key, rec) in records.iter().rev() {
                backward.merge(key.clone(), rec.clone());
            }

            let mut keys: Vec<&String> = records.iter().map(|(k, _)| k).collect();
            keys.dedup();
            for key in keys {
                prop_assert_eq!(forward.get_record(key), backward.get_record(key));
            }
            prop_assert_eq!(
                forward.merkle().root_hash(),
                backward.merkle().root_hash()
            );
        }

        /// The surviving record always carries the maximal timestamp.
        #[test]
        fn winner_has_max_timestamp(r1 in arb_record(), r2 in arb_record()) {
            let mut map = make_map();
            map.merge("k", r1.clone());
            map.merge("k", r2.clone());

            let winner = map.get_record("k").expect("record exists");
            let expected = if r1.timestamp >= r2.timestamp { &r1 } else { &r2 };
            prop_assert_eq!(winner, expected);
        }
    }
}
