//! Named CRDT map registry.
//!
//! Maps come into existence on first touch. Each map owns its CRDT state
//! behind a `parking_lot::RwLock`; mutation ordering is provided above
//! this layer by the striped executor (stripe = hash of map name), so the
//! locks only guard against concurrent readers. All maps on a node share
//! one clock source but run their own HLC instance, keyed by the node id.

use std::sync::Arc;

use dashmap::DashMap;
use lattice_core::{ClockSource, Hlc, LwwMap, MapKind, MerkleTree, OrMap, Value};
use parking_lot::RwLock;

/// Adapter letting one shared clock source back many HLC instances.
struct SharedClock(Arc<dyn ClockSource>);

impl ClockSource for SharedClock {
    fn now(&self) -> u64 {
        self.0.now()
    }
}

/// CRDT state of one named map.
pub enum MapState {
    /// Last-writer-wins records.
    Lww(RwLock<LwwMap<Value>>),
    /// Observed-remove records.
    Or(RwLock<OrMap<Value>>),
}

/// A named map and its CRDT state.
pub struct NamedMap {
    name: String,
    kind: MapKind,
    state: MapState,
}

impl NamedMap {
    /// The map's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The CRDT strategy of this map.
    #[must_use]
    pub fn kind(&self) -> MapKind {
        self.kind
    }

    /// The CRDT state.
    #[must_use]
    pub fn state(&self) -> &MapState {
        &self.state
    }

    /// The LWW state, when this is an LWW map.
    #[must_use]
    pub fn lww(&self) -> Option<&RwLock<LwwMap<Value>>> {
        match &self.state {
            MapState::Lww(map) => Some(map),
            MapState::Or(_) => None,
        }
    }

    /// The OR state, when this is an OR map.
    #[must_use]
    pub fn or_map(&self) -> Option<&RwLock<OrMap<Value>>> {
        match &self.state {
            MapState::Or(map) => Some(map),
            MapState::Lww(_) => None,
        }
    }

    /// Current Merkle root of the map.
    #[must_use]
    pub fn root_hash(&self) -> u64 {
        match &self.state {
            MapState::Lww(map) => map.read().merkle().root_hash(),
            MapState::Or(map) => map.read().merkle().root_hash(),
        }
    }
}

/// Registry of all maps hosted on this node.
pub struct MapRegistry {
    maps: DashMap<String, Arc<NamedMap>>,
    declared: DashMap<String, MapKind>,
    node_id: String,
    clock: Arc<dyn ClockSource>,
    strict_clock: bool,
    max_drift_ms: u64,
    merkle_depth: usize,
    max_key_len: usize,
}

impl MapRegistry {
    /// Creates an empty registry for this node.
    #[must_use]
    pub fn new(
        node_id: impl Into<String>,
        clock: Arc<dyn ClockSource>,
        strict_clock: bool,
        max_drift_ms: u64,
        merkle_depth: usize,
        max_key_len: usize,
    ) -> Self {
        Self {
            maps: DashMap::new(),
            declared: DashMap::new(),
            node_id: node_id.into(),
            clock,
            strict_clock,
            max_drift_ms,
            merkle_depth,
            max_key_len,
        }
    }

    /// Pre-declares the CRDT kind of a map, overriding the kind implied
    /// by the first operation that touches it.
    pub fn declare(&self, name: impl Into<String>, kind: MapKind) {
        self.declared.insert(name.into(), kind);
    }

    /// Looks up an existing map.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<NamedMap>> {
        self.maps.get(name).map(|e| e.value().clone())
    }

    /// Looks up a map, creating it with the declared kind (or
    /// `fallback_kind` when undeclared) on first touch.
    pub fn get_or_create(&self, name: &str, fallback_kind: MapKind) -> Arc<NamedMap> {
        if let Some(existing) = self.get(name) {
            return existing;
        }
        let kind = self
            .declared
            .get(name)
            .map_or(fallback_kind, |entry| *entry.value());

        self.maps
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(self.build_map(name, kind)))
            .value()
            .clone()
    }

    /// Names of every instantiated map.
    #[must_use]
    pub fn map_names(&self) -> Vec<String> {
        self.maps.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of instantiated maps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.maps.len()
    }

    /// Whether no maps are instantiated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    fn build_map(&self, name: &str, kind: MapKind) -> NamedMap {
        let hlc = Hlc::with_options(
            self.node_id.clone(),
            Box::new(SharedClock(self.clock.clone())),
            self.strict_clock,
            self.max_drift_ms,
        );
        let merkle = MerkleTree::new(self.merkle_depth);
        let state = match kind {
            MapKind::Lww => {
                MapState::Lww(RwLock::new(LwwMap::with_limits(hlc, merkle, self.max_key_len)))
            }
            MapKind::Or => {
                MapState::Or(RwLock::new(OrMap::with_limits(hlc, merkle, self.max_key_len)))
            }
        };
        NamedMap {
            name: name.to_string(),
            kind,
            state,
        }
    }
}
