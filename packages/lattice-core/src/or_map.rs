//! Observed-Remove map CRDT.
//!
//! `OrMap<V>` is a multimap: each key holds a set of values, every value
//! instance identified by a globally unique tag (the string form of its
//! creation timestamp). Removal tombstones tags, not values, which gives
//! add-wins semantics: a concurrent add under a fresh tag survives a
//! concurrent remove of the old one.
//!
//! Records live in a nested map (key -> tag -> record); removed tags go
//! into a per-map tombstone set. Merging is union of records minus union
//! of tombstones, and the tombstone set itself merges by set union. The
//! pruner drops tombstones (and any straggler records they cover) once
//! the coordinator's cutoff passes them.
//!
//! Every key mutation recomputes that key's Merkle entry from all of its
//! active records, keeping the embedded [`MerkleTree`] in sync for
//! anti-entropy walks.

use std::collections::{HashMap, HashSet};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::hash::{canonical_json, fnv1a_64};
use crate::hlc::{Hlc, Timestamp};
use crate::lww_map::{MapError, DEFAULT_MAX_KEY_LEN};
use crate::merkle::MerkleTree;

/// A tagged value instance inside an OR map entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(bound(serialize = "V: Serialize", deserialize = "V: DeserializeOwned"))]
pub struct OrRecord<V> {
    /// The stored value.
    pub value: V,
    /// Causal timestamp issued by the writing node.
    pub timestamp: Timestamp,
    /// Globally unique tag (`"physical:counter:nodeId"` of the add).
    pub tag: String,
    /// Optional time-to-live in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ttl_ms: Option<u64>,
}

/// Counters describing the effect of a key merge, surfaced as metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Records newly added by the merge.
    pub added: usize,
    /// Existing records replaced by a newer remote copy.
    pub updated: usize,
}

/// An Observed-Remove map with add-wins conflict resolution.
pub struct OrMap<V> {
    /// Key -> tag -> record, active records only.
    entries: HashMap<String, HashMap<String, OrRecord<V>>>,
    /// Tags that have been removed.
    tombstones: HashSet<String>,
    hlc: Hlc,
    merkle: MerkleTree,
    max_key_len: usize,
}

impl<V> OrMap<V>
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
            entries: HashMap::new(),
            tombstones: HashSet::new(),
            hlc,
            merkle,
            max_key_len,
        }
    }

    /// Adds a value under a fresh unique tag.
    ///
    /// # Errors
    ///
    /// Returns [`MapError::InvalidKey`] when the key exceeds the limit.
    pub fn add(
        &mut self,
        key: impl Into<String>,
        value: V,
        ttl_ms: Option<u64>,
    ) -> Result<OrRecord<V>, MapError> {
        let key = key.into();
        self.check_key(&key)?;

        let timestamp = self.hlc.now();
        let record = OrRecord {
            value,
            tag: timestamp.to_string(),
            timestamp,
            ttl_ms,
        };

        self.entries
            .entry(key.clone())
            .or_default()
            .insert(record.tag.clone(), record.clone());
        self.refresh_merkle(&key);
        Ok(record)
    }

    /// Removes one value instance by its tag.
    ///
    /// Tombstones the tag and drops the matching record. Returns `false`
    /// when the tag is not currently observed under the key (the tombstone
    /// is still recorded so a late-arriving add of that tag stays dead).
    pub fn remove_tag(&mut self, key: &str, tag: &str) -> bool {
        self.tombstones.insert(tag.to_string());

        let Some(key_map) = self.entries.get_mut(key) else {
            return false;
        };
        let removed = key_map.remove(tag).is_some();
        if key_map.is_empty() {
            self.entries.remove(key);
        }
        if removed {
            self.refresh_merkle(key);
        }
        removed
    }

    /// Removes every observed instance of a value under a key.
    ///
    /// Tombstones all tags whose record compares equal to `value` and
    /// returns them.
    pub fn remove_value(&mut self, key: &str, value: &V) -> Vec<String> {
        let Some(key_map) = self.entries.get_mut(key) else {
            return Vec::new();
        };

        let tags: Vec<String> = key_map
            .iter()
            .filter(|(_, record)| &record.value == value)
            .map(|(tag, _)| tag.clone())
            .collect();

        for tag in &tags {
            self.tombstones.insert(tag.clone());
            key_map.remove(tag);
        }
        if key_map.is_empty() {
            self.entries.remove(key);
        }
        if !tags.is_empty() {
            self.refresh_merkle(key);
        }
        tags
    }

    /// Applies a record from a remote writer.
    ///
    /// Rejected (returns `false`) when the tag is already tombstoned.
    /// Always folds the remote timestamp into the local clock.
    pub fn apply(&mut self, key: impl Into<String>, record: OrRecord<V>) -> bool {
        let _ = self.hlc.update(&record.timestamp);
        if self.tombstones.contains(&record.tag) {
            return false;
        }

        let key = key.into();
        self.entries
            .entry(key.clone())
            .or_default()
            .insert(record.tag.clone(), record);
        self.refresh_merkle(&key);
        true
    }

    /// Applies a remote removal by tag.
    pub fn apply_tombstone(&mut self, tag: &str) {
        self.tombstones.insert(tag.to_string());

        // The tag is globally unique, so at most one key holds it.
        let holder = self.entries.iter_mut().find_map(|(key, key_map)| {
            key_map.remove(tag).map(|_| key.clone())
        });

        if let Some(key) = holder {
            if self.entries.get(&key).is_some_and(HashMap::is_empty) {
                self.entries.remove(&key);
            }
            self.refresh_merkle(&key);
        }
    }

    /// Live values for a key (tombstoned and TTL-expired records filtered).
    #[must_use]
    pub fn get(&self, key: &str) -> Vec<&V> {
        self.records(key).into_iter().map(|r| &r.value).collect()
    }

    /// Live records for a key.
    #[must_use]
    pub fn records(&self, key: &str) -> Vec<&OrRecord<V>> {
        let Some(key_map) = self.entries.get(key) else {
            return Vec::new();
        };
        let now = self.hlc.clock_source().now();
        key_map
            .values()
            .filter(|record| !self.tombstones.contains(&record.tag))
            .filter(|record| {
                record
                    .ttl_ms
                    .is_none_or(|ttl| record.timestamp.physical_millis + ttl >= now)
            })
            .collect()
    }

    /// The raw tag -> record map for a key, if any records exist.
    #[must_use]
    pub fn records_map(&self, key: &str) -> Option<&HashMap<String, OrRecord<V>>> {
        self.entries.get(key)
    }

    /// Merges remote records and tombstones for one key.
    ///
    /// Tombstones apply first (union), then each remote record is added if
    /// unseen, replaced if the remote copy is newer, or skipped if its tag
    /// is dead. Returns the added/updated counters.
    pub fn merge_key(
        &mut self,
        key: impl Into<String>,
        remote_records: Vec<OrRecord<V>>,
        remote_tombstones: &[String],
    ) -> MergeOutcome {
        let key = key.into();
        let mut outcome = MergeOutcome::default();

        for tag in remote_tombstones {
            self.tombstones.insert(tag.clone());
        }

        let key_map = self.entries.entry(key.clone()).or_default();

        // Evict local records the new tombstones cover.
        let dead: Vec<String> = key_map
            .keys()
            .filter(|tag| self.tombstones.contains(*tag))
            .cloned()
            .collect();
        for tag in dead {
            key_map.remove(&tag);
        }

        for remote in remote_records {
            let _ = self.hlc.update(&remote.timestamp);
            if self.tombstones.contains(&remote.tag) {
                continue;
            }
            match key_map.get(&remote.tag) {
                Some(local) if remote.timestamp > local.timestamp => {
                    key_map.insert(remote.tag.clone(), remote);
                    outcome.updated += 1;
                }
                Some(_) => {}
                None => {
                    key_map.insert(remote.tag.clone(), remote);
                    outcome.added += 1;
                }
            }
        }

        if key_map.is_empty() {
            self.entries.remove(&key);
        }
        self.refresh_merkle(&key);
        outcome
    }

    /// All tombstoned tags.
    #[must_use]
    pub fn tombstones(&self) -> Vec<&String> {
        self.tombstones.iter().collect()
    }

    /// Whether a tag has been removed.
    #[must_use]
    pub fn is_tombstoned(&self, tag: &str) -> bool {
        self.tombstones.contains(tag)
    }

    /// Drops tombstones whose tag timestamp is strictly below `older_than`,
    /// along with any record still carrying a dropped tag.
    ///
    /// Tags that do not parse as timestamps are kept; they can never be
    /// matched against the cutoff safely. Returns the pruned tags.
    pub fn prune(&mut self, older_than: &Timestamp) -> Vec<String> {
        let pruned: Vec<String> = self
            .tombstones
            .iter()
            .filter(|tag| {
                Timestamp::parse(tag).is_ok_and(|ts| ts < *older_than)
            })
            .cloned()
            .collect();

        for tag in &pruned {
            self.tombstones.remove(tag);
        }
        pruned
    }

    /// Keys with at least one active record.
    #[must_use]
    pub fn all_keys(&self) -> Vec<&String> {
        self.entries.keys().collect()
    }

    /// Number of keys with active records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no key has active records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes all records and tombstones and resets the Merkle tree.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.tombstones.clear();
        let depth = self.merkle.depth();
        self.merkle = MerkleTree::new(depth);
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

    /// Recomputes the Merkle entry for a key from its active records.
    fn refresh_merkle(&mut self, key: &str) {
        match self.entries.get(key) {
            Some(key_map) if !key_map.is_empty() => {
                let hash = entry_hash(key, key_map);
                self.merkle.update(key, hash);
            }
            _ => {
                self.merkle.remove(key);
            }
        }
    }
}

/// Deterministic hash over all records of a key.
///
/// Records fold in tag order; each contributes tag, canonical-JSON value,
/// timestamp, and TTL, so any cross-replica difference in a key's record
/// set is visible in the Merkle comparison.
fn entry_hash<V: Serialize>(key: &str, records: &HashMap<String, OrRecord<V>>) -> u64 {
    let mut tags: Vec<&String> = records.keys().collect();
    tags.sort();

    let mut parts = Vec::with_capacity(tags.len() + 1);
    parts.push(format!("key:{key}"));
    for tag in tags {
        let record = &records[tag];
        let mut part = format!(
            "{tag}|{}|{}",
            canonical_json(&record.value),
            record.timestamp
        );
        if let Some(ttl) = record.ttl_ms {
            use std::fmt::Write;
            let _ = write!(part, "|ttl={ttl}");
        }
        parts.push(part);
    }
    fnv1a_64(&parts.join("\u{1f}"))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering as AtomicOrdering;
    use std::sync::Arc;

    use super::*;
    use crate::hlc::test_support::ManualClock;
    use crate::types::Value;

    fn make_map(node: &str, time: u64) -> (OrMap<Value>, Arc<std::sync::atomic::AtomicU64>) {
        let (clock, handle) = ManualClock::new(time);
        (OrMap::new(Hlc::new(node, Box::new(clock))), handle)
    }

    fn s(v: &str) -> Value {
        Value::String(v.to_string())
    }

    fn remote_record(v: &str, physical: u64, counter: u32, node: &str) -> OrRecord<Value> {
        let timestamp = Timestamp::new(physical, counter, node);
        OrRecord {
            value: s(v),
            tag: timestamp.to_string(),
            timestamp,
            ttl_ms: None,
        }
    }

    // ---- add / get ----

    #[test]
    fn add_accumulates_values_per_key() {
        let (mut map, _) = make_map("n1", 1_000_000);
        map.add("k", s("work"), None).unwrap();
        map.add("k", s("play"), None).unwrap();

        let values = map.get("k");
        assert_eq!(values.len(), 2);
        assert!(values.contains(&&s("work")));
        assert!(values.contains(&&s("play")));
    }

    #[test]
    fn add_issues_unique_tags() {
        let (mut map, _) = make_map("n1", 1_000_000);
        let a = map.add("k", s("x"), None).unwrap();
        let b = map.add("k", s("x"), None).unwrap();
        assert_ne!(a.tag, b.tag);
        assert!(a.tag.ends_with("n1"));
        // Duplicate values with distinct tags are both present.
        assert_eq!(map.get("k").len(), 2);
    }

    #[test]
    fn get_unknown_key_is_empty() {
        let (map, _) = make_map("n1", 1_000_000);
        assert!(map.get("missing").is_empty());
        assert!(map.records_map("missing").is_none());
    }

    #[test]
    fn oversize_key_rejected() {
        let (clock, _) = ManualClock::new(0);
        let hlc = Hlc::new("n", Box::new(clock));
        let mut map: OrMap<Value> = OrMap::with_limits(hlc, MerkleTree::default_depth(), 4);
        assert!(matches!(
            map.add("too-long", s("v"), None),
            Err(MapError::InvalidKey { len: 8, max: 4 })
        ));
    }

    // ---- removal semantics ----

    #[test]
    fn remove_tag_tombstones_single_instance() {
        let (mut map, _) = make_map("n1", 1_000_000);
        let keep = map.add("k", s("keep"), None).unwrap();
        let drop = map.add("k", s("drop"), None).unwrap();

        assert!(map.remove_tag("k", &drop.tag));
        assert!(map.is_tombstoned(&drop.tag));
        assert!(!map.is_tombstoned(&keep.tag));
        assert_eq!(map.get("k"), vec![&s("keep")]);
    }

    #[test]
    fn remove_tag_for_unseen_tag_still_tombstones() {
        let (mut map, _) = make_map("n1", 1_000_000);
        assert!(!map.remove_tag("k", "999:0:elsewhere"));
        assert!(map.is_tombstoned("999:0:elsewhere"));
        // The late-arriving add with that tag is dead on arrival.
        assert!(!map.apply("k", remote_record("late", 999, 0, "elsewhere")));
        assert!(map.get("k").is_empty());
    }

    #[test]
    fn remove_value_tombstones_all_matching_instances() {
        let (mut map, _) = make_map("n1", 1_000_000);
        map.add("k", s("dup"), None).unwrap();
        map.add("k", s("dup"), None).unwrap();
        map.add("k", s("other"), None).unwrap();

        let removed = map.remove_value("k", &s("dup"));
        assert_eq!(removed.len(), 2);
        assert_eq!(map.get("k"), vec![&s("other")]);
    }

    #[test]
    fn add_wins_over_concurrent_remove() {
        let (mut map, _) = make_map("n1", 1_000_000);
        let old = map.add("k", s("v"), None).unwrap();
        map.remove_tag("k", &old.tag);

        // A concurrent add of the same value under a different tag survives.
        assert!(map.apply("k", remote_record("v", 2_000_000, 0, "peer")));
        assert_eq!(map.get("k"), vec![&s("v")]);
    }

    #[test]
    fn apply_tombstone_drops_existing_record() {
        let (mut map, _) = make_map("n1", 1_000_000);
        let rec = map.add("k", s("v"), None).unwrap();
        map.apply_tombstone(&rec.tag);
        assert!(map.get("k").is_empty());
        assert!(map.all_keys().is_empty());
    }

    // ---- TTL ----

    #[test]
    fn expired_records_hidden_from_reads() {
        let (mut map, time) = make_map("n1", 1_000_000);
        map.add("k", s("short"), Some(100)).unwrap();
        map.add("k", s("long"), None).unwrap();

        time.store(1_000_200, AtomicOrdering::Relaxed);
        assert_eq!(map.get("k"), vec![&s("long")]);
        // The raw map still holds both.
        assert_eq!(map.records_map("k").unwrap().len(), 2);
    }

    // ---- merge_key ----

    #[test]
    fn merge_key_counts_added_and_updated() {
        let (mut map, _) = make_map("n1", 1_000_000);
        let r1 = remote_record("a", 100, 0, "peer");
        let outcome = map.merge_key("k", vec![r1.clone()], &[]);
        assert_eq!(outcome, MergeOutcome { added: 1, updated: 0 });

        // Same tag, newer timestamp: an update.
        let newer = OrRecord {
            value: s("a2"),
            timestamp: Timestamp::new(200, 0, "peer"),
            tag: r1.tag.clone(),
            ttl_ms: None,
        };
        let outcome = map.merge_key("k", vec![newer], &[]);
        assert_eq!(outcome, MergeOutcome { added: 0, updated: 1 });

        // Replay of the original is a no-op.
        let outcome = map.merge_key("k", vec![r1], &[]);
        assert_eq!(outcome, MergeOutcome::default());
    }

    #[test]
    fn merge_key_applies_tombstones_first() {
        let (mut map, _) = make_map("n1", 1_000_000);
        let rec = remote_record("v", 100, 0, "peer");
        let tag = rec.tag.clone();

        // Records arriving together with their own tombstone never surface.
        let outcome = map.merge_key("k", vec![rec], &[tag.clone()]);
        assert_eq!(outcome, MergeOutcome::default());
        assert!(map.get("k").is_empty());
        assert!(map.is_tombstoned(&tag));
    }

    #[test]
    fn merge_key_evicts_locally_held_dead_tags() {
        let (mut map, _) = make_map("n1", 1_000_000);
        let local = map.add("k", s("v"), None).unwrap();
        map.merge_key("k", Vec::new(), &[local.tag.clone()]);
        assert!(map.get("k").is_empty());
    }

    // ---- prune ----

    #[test]
    fn prune_drops_old_tombstones_only() {
        let (mut map, _) = make_map("n1", 1_000_000);
        let rec = map.add("k", s("v"), None).unwrap();
        map.remove_tag("k", &rec.tag);

        // Cutoff before the tombstone: kept.
        assert!(map.prune(&Timestamp::new(999_999, 0, "n1")).is_empty());
        assert!(map.is_tombstoned(&rec.tag));

        // Cutoff after: dropped.
        let pruned = map.prune(&Timestamp::new(2_000_000, 0, "n1"));
        assert_eq!(pruned, vec![rec.tag.clone()]);
        assert!(!map.is_tombstoned(&rec.tag));
    }

    #[test]
    fn prune_keeps_unparseable_tags() {
        let (mut map, _) = make_map("n1", 1_000_000);
        map.apply_tombstone("not-a-timestamp");
        assert!(map.prune(&Timestamp::new(u64::MAX, 0, "z")).is_empty());
        assert!(map.is_tombstoned("not-a-timestamp"));
    }

    // ---- Merkle integration ----

    #[test]
    fn merkle_tracks_mutations() {
        let (mut map, _) = make_map("n1", 1_000_000);
        let empty = map.merkle().root_hash();

        let rec = map.add("k", s("v"), None).unwrap();
        let after_add = map.merkle().root_hash();
        assert_ne!(empty, after_add);

        map.remove_tag("k", &rec.tag);
        assert_eq!(map.merkle().root_hash(), empty);
    }

    #[test]
    fn replicas_with_same_records_share_roots() {
        let (mut a, _) = make_map("a", 1_000_000);
        let (mut b, _) = make_map("b", 1_000_000);

        let r1 = remote_record("x", 100, 0, "w1");
        let r2 = remote_record("y", 100, 1, "w2");

        a.merge_key("k", vec![r1.clone(), r2.clone()], &[]);
        b.merge_key("k", vec![r2, r1], &[]);

        assert_eq!(a.merkle().root_hash(), b.merkle().root_hash());
    }

    #[test]
    fn clear_resets_state_and_tree() {
        let (mut map, _) = make_map("n1", 1_000_000);
        let rec = map.add("k", s("v"), None).unwrap();
        map.remove_tag("k", &rec.tag);
        map.clear();
        assert!(map.is_empty());
        assert!(map.tombstones().is_empty());
        assert_eq!(map.merkle().root_hash(), crate::merkle::EMPTY_HASH);
    }
}
