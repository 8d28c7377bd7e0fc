//! Per-map value indexes.
//!
//! Values are opaque to the core; indexing is opt-in per map by declaring
//! field paths. Declared fields get a sorted map from index key to the
//! entry keys holding that value; compound indexes do the same over a
//! tuple of fields. Standing query indexes additionally keep the exact
//! result key set of a pre-registered query up to date on every write.
//!
//! Index maintenance runs on the map's mutation stripe, right after the
//! CRDT apply, so index state can lag raw map state only across stripe
//! boundaries the same way any reader can.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use dashmap::DashMap;
use lattice_core::types::Value;
use lattice_core::Query;
use ordered_float::OrderedFloat;
use parking_lot::RwLock;
use std::sync::Arc;

/// Totally ordered encoding of an indexable value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum IndexKey {
    /// Null sorts first.
    Null,
    /// Booleans.
    Bool(bool),
    /// Ints and floats share one numeric axis.
    Num(OrderedFloat<f64>),
    /// Strings.
    Str(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
}

impl IndexKey {
    /// Encodes a value for indexing; arrays and maps are not indexable.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        Some(match value {
            Value::Null => IndexKey::Null,
            Value::Bool(b) => IndexKey::Bool(*b),
            #[allow(clippy::cast_precision_loss)] // index ordering tolerance
            Value::Int(i) => IndexKey::Num(OrderedFloat(*i as f64)),
            Value::Float(f) => IndexKey::Num(OrderedFloat(*f)),
            Value::String(s) => IndexKey::Str(s.clone()),
            Value::Bytes(b) => IndexKey::Bytes(b.clone()),
            Value::Array(_) | Value::Map(_) => return None,
        })
    }
}

/// Declared indexes for one map.
#[derive(Debug, Clone, Default)]
pub struct IndexSpec {
    /// Single-field indexes by dot-separated field path.
    pub single: Vec<String>,
    /// Compound indexes; field order is the index order.
    pub compound: Vec<Vec<String>>,
}

/// Live index state for one map.
pub struct MapIndexes {
    single: HashMap<String, BTreeMap<IndexKey, BTreeSet<String>>>,
    compound: HashMap<Vec<String>, BTreeMap<Vec<IndexKey>, BTreeSet<String>>>,
    standing: HashMap<u64, (Query, BTreeSet<String>)>,
}

impl MapIndexes {
    /// Creates empty index state from a declaration.
    #[must_use]
    pub fn new(spec: &IndexSpec) -> Self {
        Self {
            single: spec
                .single
                .iter()
                .map(|f| (f.clone(), BTreeMap::new()))
                .collect(),
            compound: spec
                .compound
                .iter()
                .map(|fields| (fields.clone(), BTreeMap::new()))
                .collect(),
            standing: HashMap::new(),
        }
    }

    /// Whether a single-field index exists for `field`.
    #[must_use]
    pub fn has_single(&self, field: &str) -> bool {
        self.single.contains_key(field)
    }

    /// A compound index whose every field appears in `eq_fields`, if any.
    #[must_use]
    pub fn compound_covered_by(&self, eq_fields: &[&str]) -> Option<&Vec<String>> {
        self.compound
            .keys()
            .find(|fields| fields.iter().all(|f| eq_fields.contains(&f.as_str())))
    }

    /// Entry keys whose `field` equals `value`.
    #[must_use]
    pub fn lookup_single(&self, field: &str, value: &Value) -> Vec<String> {
        let Some(index) = self.single.get(field) else {
            return Vec::new();
        };
        let Some(key) = IndexKey::from_value(value) else {
            return Vec::new();
        };
        index
            .get(&key)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Entry keys matching a full compound tuple.
    #[must_use]
    pub fn lookup_compound(&self, fields: &[String], values: &[IndexKey]) -> Vec<String> {
        self.compound
            .get(fields)
            .and_then(|index| index.get(values))
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Registers a standing query; its key set is maintained on writes.
    pub fn register_standing(&mut self, query: Query) {
        self.standing
            .insert(query.fingerprint(), (query, BTreeSet::new()));
    }

    /// Whether a standing index exists for this fingerprint.
    #[must_use]
    pub fn has_standing(&self, fingerprint: u64) -> bool {
        self.standing.contains_key(&fingerprint)
    }

    /// Current key set of a standing query.
    #[must_use]
    pub fn standing_keys(&self, fingerprint: u64) -> Vec<String> {
        self.standing
            .get(&fingerprint)
            .map(|(_, keys)| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Applies one write to every index.
    ///
    /// `old` is the value visible before the write, `new` after; deletes
    /// pass `new: None`.
    pub fn apply_write(&mut self, entry_key: &str, old: Option<&Value>, new: Option<&Value>) {
        for (field, index) in &mut self.single {
            if let Some(old_key) = old.and_then(|v| v.get_path(field)).and_then(IndexKey::from_value)
            {
                remove_posting(index, &old_key, entry_key);
            }
            if let Some(new_key) = new.and_then(|v| v.get_path(field)).and_then(IndexKey::from_value)
            {
                index.entry(new_key).or_default().insert(entry_key.to_string());
            }
        }

        for (fields, index) in &mut self.compound {
            if let Some(old_tuple) = old.and_then(|v| compound_tuple(fields, v)) {
                remove_posting(index, &old_tuple, entry_key);
            }
            if let Some(new_tuple) = new.and_then(|v| compound_tuple(fields, v)) {
                index
                    .entry(new_tuple)
                    .or_default()
                    .insert(entry_key.to_string());
            }
        }

        for (query, keys) in self.standing.values_mut() {
            let matches = new.is_some_and(|v| query.matches(entry_key, v));
            if matches {
                keys.insert(entry_key.to_string());
            } else {
                keys.remove(entry_key);
            }
        }
    }
}

fn remove_posting<K: Ord>(
    index: &mut BTreeMap<K, BTreeSet<String>>,
    key: &K,
    entry_key: &str,
) {
    if let Some(postings) = index.get_mut(key) {
        postings.remove(entry_key);
        if postings.is_empty() {
            index.remove(key);
        }
    }
}

/// The full tuple of a compound index for a value, or `None` when any
/// field is missing or unindexable.
#[must_use]
pub fn compound_tuple(fields: &[String], value: &Value) -> Option<Vec<IndexKey>> {
    fields
        .iter()
        .map(|f| value.get_path(f).and_then(IndexKey::from_value))
        .collect()
}

/// Index state for every configured map.
#[derive(Default)]
pub struct IndexRegistry {
    per_map: DashMap<String, Arc<RwLock<MapIndexes>>>,
}

impl IndexRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares the indexes of a map, replacing any previous declaration.
    pub fn configure(&self, map_name: impl Into<String>, spec: &IndexSpec) {
        self.per_map
            .insert(map_name.into(), Arc::new(RwLock::new(MapIndexes::new(spec))));
    }

    /// Index state for a map, if configured.
    #[must_use]
    pub fn get(&self, map_name: &str) -> Option<Arc<RwLock<MapIndexes>>> {
        self.per_map.get(map_name).map(|e| e.value().clone())
    }

    /// Routes one write to the map's indexes, if any are configured.
    pub fn apply_write(
        &self,
        map_name: &str,
        entry_key: &str,
        old: Option<&Value>,
        new: Option<&Value>,
    ) {
        if let Some(indexes) = self.get(map_name) {
            indexes.write().apply_write(entry_key, old, new);
        }
    }
}
