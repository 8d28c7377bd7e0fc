//! Merkle anti-entropy synchronization.
//!
//! One side pulls from the other: the puller announces its last
//! successful sync, the responder answers with its Merkle root (or
//! demands a full resync when local garbage collection has outrun the
//! puller's watermark), and mismatching subtrees are narrowed down
//! bucket by bucket until leaves exchange records. The puller merges
//! newer remote records and pushes records the responder lacks, so one
//! session converges both sides.
//!
//! Sync is non-blocking with respect to mutations: records merged here
//! carry HLC timestamps and apply idempotently, so writes racing a sync
//! session are ordered by the CRDT, not by the walk. Either side may
//! stop at any message boundary; no partial state needs cleanup.

mod session;

pub use session::{SyncSession, SyncStats, SyncStep};

use std::sync::Arc;
use std::time::Duration;

use lattice_core::messages::{
    OrMapEntry, OrSyncDiffResponsePayload, OrSyncRespLeafPayload, OrSyncRespRootPayload,
    SyncDiffResponsePayload, SyncLeafEntry, SyncRespBucketsPayload, SyncRespLeafPayload,
    SyncRespRootPayload, SyncResetRequiredPayload,
};
use lattice_core::{ClockSource, MapKind, Message, Timestamp};

use crate::maps::{MapRegistry, NamedMap};

/// Answers sync requests against local maps.
pub struct SyncResponder {
    maps: Arc<MapRegistry>,
    clock: Arc<dyn ClockSource>,
    node_id: String,
    gc_max_age: Duration,
}

impl SyncResponder {
    /// Creates a responder over this node's maps.
    #[must_use]
    pub fn new(
        maps: Arc<MapRegistry>,
        clock: Arc<dyn ClockSource>,
        node_id: impl Into<String>,
        gc_max_age: Duration,
    ) -> Self {
        Self {
            maps,
            clock,
            node_id: node_id.into(),
            gc_max_age,
        }
    }

    /// Handles one inbound sync message, producing zero or more replies.
    ///
    /// Non-sync messages produce no replies; push payloads merge silently.
    #[must_use]
    pub fn handle(&self, message: &Message) -> Vec<Message> {
        match message {
            Message::SyncInit(init) => {
                if self.requires_reset(init.last_sync_ts) {
                    return vec![Message::SyncResetRequired(SyncResetRequiredPayload {
                        map_name: init.map_name.clone(),
                    })];
                }
                let map = self.maps.get_or_create(&init.map_name, MapKind::Lww);
                vec![Message::SyncRespRoot(SyncRespRootPayload {
                    map_name: init.map_name.clone(),
                    root_hash: map.root_hash(),
                    timestamp: self.now(),
                })]
            }
            Message::OrSyncInit(init) => {
                if self.requires_reset(init.last_sync_ts) {
                    return vec![Message::OrSyncResetRequired(SyncResetRequiredPayload {
                        map_name: init.map_name.clone(),
                    })];
                }
                let map = self.maps.get_or_create(&init.map_name, MapKind::Or);
                vec![Message::OrSyncRespRoot(OrSyncRespRootPayload {
                    map_name: init.map_name.clone(),
                    root_hash: map.root_hash(),
                    timestamp: self.now(),
                })]
            }

            Message::SyncReqBucket(req) => {
                let Some(map) = self.maps.get(&req.map_name) else {
                    return Vec::new();
                };
                self.answer_bucket(&map, &req.map_name, &req.path, MapKind::Lww)
            }
            Message::OrSyncReqBucket(req) => {
                let Some(map) = self.maps.get(&req.map_name) else {
                    return Vec::new();
                };
                self.answer_bucket(&map, &req.map_name, &req.path, MapKind::Or)
            }

            Message::SyncDiffRequest(req) => {
                let Some(map) = self.maps.get(&req.map_name) else {
                    return Vec::new();
                };
                let Some(lww) = map.lww() else {
                    return Vec::new();
                };
                let guard = lww.read();
                let entries = req
                    .keys
                    .iter()
                    .filter_map(|key| {
                        guard.get_record(key).map(|record| SyncLeafEntry {
                            key: key.clone(),
                            record: record.clone(),
                        })
                    })
                    .collect();
                vec![Message::SyncDiffResponse(SyncDiffResponsePayload {
                    map_name: req.map_name.clone(),
                    entries,
                })]
            }
            Message::OrSyncDiffRequest(req) => {
                let Some(map) = self.maps.get(&req.map_name) else {
                    return Vec::new();
                };
                let Some(or_map) = map.or_map() else {
                    return Vec::new();
                };
                let guard = or_map.read();
                let tombstones: Vec<String> =
                    guard.tombstones().into_iter().cloned().collect();
                let entries = req
                    .keys
                    .iter()
                    .filter_map(|key| {
                        guard.records_map(key).map(|records| OrMapEntry {
                            key: key.clone(),
                            records: records.values().cloned().collect(),
                            tombstones: tombstones.clone(),
                        })
                    })
                    .collect();
                vec![Message::OrSyncDiffResponse(OrSyncDiffResponsePayload {
                    map_name: req.map_name.clone(),
                    entries,
                })]
            }

            Message::SyncPushDiff(push) => {
                let map = self.maps.get_or_create(&push.map_name, MapKind::Lww);
                if let Some(lww) = map.lww() {
                    let mut guard = lww.write();
                    let mut merged = 0_usize;
                    for entry in &push.entries {
                        if guard.merge(entry.key.clone(), entry.record.clone()) {
                            merged += 1;
                        }
                    }
                    metrics::counter!("lattice_sync_pushed_records_total")
                        .increment(merged as u64);
                }
                Vec::new()
            }
            Message::OrSyncPushDiff(push) => {
                let map = self.maps.get_or_create(&push.map_name, MapKind::Or);
                if let Some(or_map) = map.or_map() {
                    let mut guard = or_map.write();
                    for entry in &push.entries {
                        guard.merge_key(
                            entry.key.clone(),
                            entry.records.clone(),
                            &entry.tombstones,
                        );
                    }
                }
                Vec::new()
            }

            _ => Vec::new(),
        }
    }

    fn answer_bucket(
        &self,
        map: &NamedMap,
        map_name: &str,
        path: &str,
        kind: MapKind,
    ) -> Vec<Message> {
        match kind {
            MapKind::Lww => {
                let Some(lww) = map.lww() else {
                    return Vec::new();
                };
                let guard = lww.read();
                if guard.merkle().is_leaf_path(path) {
                    let entries = guard
                        .merkle()
                        .keys_in_bucket(path)
                        .unwrap_or_default()
                        .into_iter()
                        .filter_map(|key| {
                            guard.get_record(&key).map(|record| SyncLeafEntry {
                                record: record.clone(),
                                key,
                            })
                        })
                        .collect();
                    vec![Message::SyncRespLeaf(SyncRespLeafPayload {
                        map_name: map_name.to_string(),
                        path: path.to_string(),
                        entries,
                    })]
                } else {
                    let Some(children) = guard.merkle().child_hashes(path) else {
                        return Vec::new();
                    };
                    vec![Message::SyncRespBuckets(SyncRespBucketsPayload {
                        map_name: map_name.to_string(),
                        path: path.to_string(),
                        children,
                    })]
                }
            }
            MapKind::Or => {
                let Some(or_map) = map.or_map() else {
                    return Vec::new();
                };
                let guard = or_map.read();
                if guard.merkle().is_leaf_path(path) {
                    let tombstones: Vec<String> =
                        guard.tombstones().into_iter().cloned().collect();
                    let entries = guard
                        .merkle()
                        .keys_in_bucket(path)
                        .unwrap_or_default()
                        .into_iter()
                        .filter_map(|key| {
                            guard.records_map(&key).map(|records| OrMapEntry {
                                records: records.values().cloned().collect(),
                                tombstones: tombstones.clone(),
                                key,
                            })
                        })
                        .collect();
                    vec![Message::OrSyncRespLeaf(OrSyncRespLeafPayload {
                        map_name: map_name.to_string(),
                        path: path.to_string(),
                        entries,
                    })]
                } else {
                    let Some(children) = guard.merkle().child_hashes(path) else {
                        return Vec::new();
                    };
                    vec![Message::OrSyncRespBuckets(SyncRespBucketsPayload {
                        map_name: map_name.to_string(),
                        path: path.to_string(),
                        children,
                    })]
                }
            }
        }
    }

    fn requires_reset(&self, last_sync_ts: Option<u64>) -> bool {
        let Some(last) = last_sync_ts else {
            return false; // first sync: a full walk, not a reset
        };
        let age = self.clock.now().saturating_sub(last);
        age > u64::try_from(self.gc_max_age.as_millis()).unwrap_or(u64::MAX)
    }

    fn now(&self) -> Timestamp {
        Timestamp::new(self.clock.now(), 0, self.node_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use lattice_core::messages::{OrSyncInitPayload, SyncInitPayload, SyncReqBucketPayload};
    use lattice_core::{SystemClock, Value};

    use super::*;

    fn responder() -> (SyncResponder, Arc<MapRegistry>) {
        let maps = Arc::new(MapRegistry::new(
            "resp-node",
            Arc::new(SystemClock),
            false,
            60_000,
            3,
            1024,
        ));
        let responder = SyncResponder::new(
            maps.clone(),
            Arc::new(SystemClock),
            "resp-node",
            Duration::from_secs(3600),
        );
        (responder, maps)
    }

    fn init(map_name: &str, last_sync_ts: Option<u64>) -> Message {
        Message::SyncInit(SyncInitPayload {
            map_name: map_name.to_string(),
            last_sync_ts,
        })
    }

    #[test]
    fn init_answers_with_the_root_hash() {
        let (responder, maps) = responder();
        let map = maps.get_or_create("users", MapKind::Lww);
        map.lww()
            .unwrap()
            .write()
            .set("k", Value::Int(1), None)
            .unwrap();

        let replies = responder.handle(&init("users", None));
        match &replies[..] {
            [Message::SyncRespRoot(root)] => {
                assert_eq!(root.map_name, "users");
                assert_eq!(root.root_hash, map.root_hash());
                assert_eq!(root.timestamp.node_id, "resp-node");
            }
            other => panic!("expected root reply, got {other:?}"),
        }
    }

    #[test]
    fn stale_watermark_demands_reset() {
        let (responder, _) = responder();
        // A watermark far older than the GC age.
        let replies = responder.handle(&init("users", Some(1)));
        assert!(matches!(
            replies[..],
            [Message::SyncResetRequired(_)]
        ));

        // A recent watermark walks normally.
        let now = SystemClock.now();
        let replies = responder.handle(&init("users", Some(now)));
        assert!(matches!(replies[..], [Message::SyncRespRoot(_)]));
    }

    #[test]
    fn bucket_walk_descends_to_a_leaf() {
        let (responder, maps) = responder();
        let map = maps.get_or_create("users", MapKind::Lww);
        map.lww()
            .unwrap()
            .write()
            .set("hello", Value::Int(1), None)
            .unwrap();

        // Root request returns 16 children.
        let replies = responder.handle(&Message::SyncReqBucket(SyncReqBucketPayload {
            map_name: "users".to_string(),
            path: String::new(),
        }));
        let children = match &replies[..] {
            [Message::SyncRespBuckets(b)] => {
                assert_eq!(b.children.len(), 16);
                b.children.clone()
            }
            other => panic!("expected buckets, got {other:?}"),
        };
        assert!(children.iter().any(|&h| h != 0));

        // Walk to the leaf holding the key.
        let leaf_path = {
            let lww = map.lww().unwrap().read();
            lww.merkle().path_of("hello")
        };
        let replies = responder.handle(&Message::SyncReqBucket(SyncReqBucketPayload {
            map_name: "users".to_string(),
            path: leaf_path.clone(),
        }));
        match &replies[..] {
            [Message::SyncRespLeaf(leaf)] => {
                assert_eq!(leaf.path, leaf_path);
                assert_eq!(leaf.entries.len(), 1);
                assert_eq!(leaf.entries[0].key, "hello");
            }
            other => panic!("expected leaf, got {other:?}"),
        }
    }

    #[test]
    fn or_init_and_leaves_carry_tombstones() {
        let (responder, maps) = responder();
        let map = maps.get_or_create("tags", MapKind::Or);
        let record = {
            let mut guard = map.or_map().unwrap().write();
            let r = guard.add("k", Value::Int(1), None).unwrap();
            guard.add("k", Value::Int(2), None).unwrap();
            guard.remove_tag("k", &r.tag);
            r
        };

        let replies = responder.handle(&Message::OrSyncInit(OrSyncInitPayload {
            map_name: "tags".to_string(),
            last_sync_ts: None,
        }));
        assert!(matches!(replies[..], [Message::OrSyncRespRoot(_)]));

        let leaf_path = {
            let guard = map.or_map().unwrap().read();
            guard.merkle().path_of("k")
        };
        let replies = responder.handle(&Message::OrSyncReqBucket(SyncReqBucketPayload {
            map_name: "tags".to_string(),
            path: leaf_path,
        }));
        match &replies[..] {
            [Message::OrSyncRespLeaf(leaf)] => {
                assert_eq!(leaf.entries.len(), 1);
                assert_eq!(leaf.entries[0].records.len(), 1);
                assert_eq!(leaf.entries[0].tombstones, vec![record.tag]);
            }
            other => panic!("expected OR leaf, got {other:?}"),
        }
    }

    #[test]
    fn push_diff_merges_and_stays_silent() {
        let (responder, maps) = responder();
        let record = lattice_core::LwwRecord {
            value: Some(Value::Int(9)),
            timestamp: Timestamp::new(500, 0, "peer"),
            ttl_ms: None,
        };
        let replies = responder.handle(&Message::SyncPushDiff(
            lattice_core::messages::SyncPushDiffPayload {
                map_name: "users".to_string(),
                entries: vec![SyncLeafEntry {
                    key: "k".to_string(),
                    record,
                }],
            },
        ));
        assert!(replies.is_empty());

        let map = maps.get("users").unwrap();
        assert_eq!(map.lww().unwrap().read().get("k"), Some(&Value::Int(9)));
    }

    #[test]
    fn non_sync_messages_are_ignored() {
        let (responder, _) = responder();
        let replies = responder.handle(&Message::Heartbeat(
            lattice_core::messages::HeartbeatPayload { ts: 1 },
        ));
        assert!(replies.is_empty());
    }
}
