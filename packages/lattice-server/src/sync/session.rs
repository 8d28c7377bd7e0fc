//! Initiator side of a sync walk.
//!
//! A [`SyncSession`] is a pure state machine: the driver owns the
//! transport, feeds inbound messages to [`SyncSession::on_message`], and
//! sends whatever comes back. The session tracks how many subtree
//! requests are outstanding; when the count returns to zero the walk is
//! complete. A session can be dropped at any boundary — no cleanup is
//! needed on either side.

use lattice_core::messages::{
    OrMapEntry, OrSyncInitPayload, OrSyncPushDiffPayload, SyncInitPayload, SyncLeafEntry,
    SyncPushDiffPayload, SyncReqBucketPayload,
};
use lattice_core::merkle::FANOUT;
use lattice_core::{MapKind, Message};

use crate::maps::MapRegistry;

/// Counters describing a completed walk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Remote records merged locally.
    pub pulled: usize,
    /// Local records pushed to the responder.
    pub pushed: usize,
}

/// Result of feeding one message to the session.
#[derive(Debug)]
pub enum SyncStep {
    /// Send these messages and keep feeding responses.
    Continue(Vec<Message>),
    /// The walk is complete; send any final pushes and stop.
    Finished {
        /// Push messages that still need to go out (no replies expected).
        send: Vec<Message>,
        /// Walk counters.
        stats: SyncStats,
    },
    /// The responder demands a full resync; call
    /// [`SyncSession::accept_reset`] to restart in pull-only mode, or
    /// drop the session.
    ResetRequired,
}

/// Pull-sync state machine for one map against one peer.
pub struct SyncSession {
    map_name: String,
    kind: MapKind,
    outstanding: usize,
    push_enabled: bool,
    stats: SyncStats,
}

impl SyncSession {
    /// Starts an LWW sync; returns the session and the opening message.
    #[must_use]
    pub fn lww(map_name: impl Into<String>, last_sync_ts: Option<u64>) -> (Self, Message) {
        let map_name = map_name.into();
        let init = Message::SyncInit(SyncInitPayload {
            map_name: map_name.clone(),
            last_sync_ts,
        });
        (
            Self {
                map_name,
                kind: MapKind::Lww,
                outstanding: 0,
                push_enabled: true,
                stats: SyncStats::default(),
            },
            init,
        )
    }

    /// Starts an OR-map sync; returns the session and the opening message.
    #[must_use]
    pub fn or(map_name: impl Into<String>, last_sync_ts: Option<u64>) -> (Self, Message) {
        let map_name = map_name.into();
        let init = Message::OrSyncInit(OrSyncInitPayload {
            map_name: map_name.clone(),
            last_sync_ts,
        });
        (
            Self {
                map_name,
                kind: MapKind::Or,
                outstanding: 0,
                push_enabled: true,
                stats: SyncStats::default(),
            },
            init,
        )
    }

    /// Restarts the walk after `SYNC_RESET_REQUIRED`: pushes are disabled
    /// (local state may predate the responder's garbage collection) and
    /// the session re-initiates without a watermark.
    #[must_use]
    pub fn accept_reset(&mut self) -> Message {
        self.push_enabled = false;
        self.outstanding = 0;
        match self.kind {
            MapKind::Lww => Message::SyncInit(SyncInitPayload {
                map_name: self.map_name.clone(),
                last_sync_ts: None,
            }),
            MapKind::Or => Message::OrSyncInit(OrSyncInitPayload {
                map_name: self.map_name.clone(),
                last_sync_ts: None,
            }),
        }
    }

    /// Feeds one responder message to the walk.
    pub fn on_message(&mut self, message: &Message, maps: &MapRegistry) -> SyncStep {
        match message {
            Message::SyncResetRequired(p) | Message::OrSyncResetRequired(p)
                if p.map_name == self.map_name =>
            {
                SyncStep::ResetRequired
            }

            Message::SyncRespRoot(root) if root.map_name == self.map_name => {
                let map = maps.get_or_create(&self.map_name, MapKind::Lww);
                if map.root_hash() == root.root_hash {
                    return self.finished(Vec::new());
                }
                self.request_paths(vec![String::new()])
            }
            Message::OrSyncRespRoot(root) if root.map_name == self.map_name => {
                let map = maps.get_or_create(&self.map_name, MapKind::Or);
                if map.root_hash() == root.root_hash {
                    return self.finished(Vec::new());
                }
                self.request_paths(vec![String::new()])
            }

            Message::SyncRespBuckets(buckets) | Message::OrSyncRespBuckets(buckets)
                if buckets.map_name == self.map_name =>
            {
                self.outstanding = self.outstanding.saturating_sub(1);
                let local = self.local_children(maps, &buckets.path);
                let mismatched: Vec<String> = buckets
                    .children
                    .iter()
                    .enumerate()
                    .filter(|(i, remote_hash)| {
                        local.get(*i).copied().unwrap_or_default() != **remote_hash
                    })
                    .map(|(i, _)| {
                        let digit =
                            char::from_digit(u32::try_from(i).expect("fanout < 16"), 16)
                                .expect("digit < 16");
                        format!("{}{digit}", buckets.path)
                    })
                    .collect();
                if mismatched.is_empty() && self.outstanding == 0 {
                    return self.finished(Vec::new());
                }
                self.request_paths(mismatched)
            }

            Message::SyncRespLeaf(leaf) if leaf.map_name == self.map_name => {
                self.outstanding = self.outstanding.saturating_sub(1);
                let pushes = self.apply_lww_leaf(maps, &leaf.path, &leaf.entries);
                self.step_after_leaf(pushes)
            }
            Message::OrSyncRespLeaf(leaf) if leaf.map_name == self.map_name => {
                self.outstanding = self.outstanding.saturating_sub(1);
                let pushes = self.apply_or_leaf(maps, &leaf.path, &leaf.entries);
                self.step_after_leaf(pushes)
            }

            Message::SyncDiffResponse(diff) if diff.map_name == self.map_name => {
                let map = maps.get_or_create(&self.map_name, MapKind::Lww);
                if let Some(lww) = map.lww() {
                    let mut guard = lww.write();
                    for entry in &diff.entries {
                        if guard.merge(entry.key.clone(), entry.record.clone()) {
                            self.stats.pulled += 1;
                        }
                    }
                }
                if self.outstanding == 0 {
                    return self.finished(Vec::new());
                }
                SyncStep::Continue(Vec::new())
            }
            Message::OrSyncDiffResponse(diff) if diff.map_name == self.map_name => {
                let map = maps.get_or_create(&self.map_name, MapKind::Or);
                if let Some(or_map) = map.or_map() {
                    let mut guard = or_map.write();
                    for entry in &diff.entries {
                        let outcome = guard.merge_key(
                            entry.key.clone(),
                            entry.records.clone(),
                            &entry.tombstones,
                        );
                        self.stats.pulled += outcome.added + outcome.updated;
                    }
                }
                if self.outstanding == 0 {
                    return self.finished(Vec::new());
                }
                SyncStep::Continue(Vec::new())
            }

            _ => SyncStep::Continue(Vec::new()),
        }
    }

    fn request_paths(&mut self, paths: Vec<String>) -> SyncStep {
        self.outstanding += paths.len();
        let requests = paths
            .into_iter()
            .map(|path| {
                let payload = SyncReqBucketPayload {
                    map_name: self.map_name.clone(),
                    path,
                };
                match self.kind {
                    MapKind::Lww => Message::SyncReqBucket(payload),
                    MapKind::Or => Message::OrSyncReqBucket(payload),
                }
            })
            .collect();
        SyncStep::Continue(requests)
    }

    fn step_after_leaf(&mut self, pushes: Vec<Message>) -> SyncStep {
        if self.outstanding == 0 {
            self.finished(pushes)
        } else {
            SyncStep::Continue(pushes)
        }
    }

    fn finished(&self, send: Vec<Message>) -> SyncStep {
        SyncStep::Finished {
            send,
            stats: self.stats,
        }
    }

    fn local_children(&self, maps: &MapRegistry, path: &str) -> Vec<u64> {
        let fallback_kind = self.kind;
        let map = maps.get_or_create(&self.map_name, fallback_kind);
        let children = match (self.kind, map.lww(), map.or_map()) {
            (MapKind::Lww, Some(lww), _) => lww.read().merkle().child_hashes(path),
            (MapKind::Or, _, Some(or_map)) => or_map.read().merkle().child_hashes(path),
            _ => None,
        };
        children.unwrap_or_else(|| vec![0; FANOUT])
    }

    /// Merges remote leaf entries and collects the local records the
    /// responder is missing or holds stale.
    fn apply_lww_leaf(
        &mut self,
        maps: &MapRegistry,
        path: &str,
        entries: &[SyncLeafEntry],
    ) -> Vec<Message> {
        let map = maps.get_or_create(&self.map_name, MapKind::Lww);
        let Some(lww) = map.lww() else {
            return Vec::new();
        };
        let mut guard = lww.write();

        for entry in entries {
            if guard.merge(entry.key.clone(), entry.record.clone()) {
                self.stats.pulled += 1;
            }
        }

        if !self.push_enabled {
            return Vec::new();
        }

        let local_keys = guard.merkle().keys_in_bucket(path).unwrap_or_default();
        let mut push_entries = Vec::new();
        for key in local_keys {
            let Some(local_record) = guard.get_record(&key) else {
                continue;
            };
            let remote = entries.iter().find(|e| e.key == key);
            let remote_is_stale = remote.is_none_or(|e| {
                local_record.timestamp > e.record.timestamp
            });
            if remote_is_stale {
                push_entries.push(SyncLeafEntry {
                    key,
                    record: local_record.clone(),
                });
            }
        }

        if push_entries.is_empty() {
            return Vec::new();
        }
        self.stats.pushed += push_entries.len();
        vec![Message::SyncPushDiff(SyncPushDiffPayload {
            map_name: self.map_name.clone(),
            entries: push_entries,
        })]
    }

    fn apply_or_leaf(
        &mut self,
        maps: &MapRegistry,
        path: &str,
        entries: &[OrMapEntry],
    ) -> Vec<Message> {
        let map = maps.get_or_create(&self.map_name, MapKind::Or);
        let Some(or_map) = map.or_map() else {
            return Vec::new();
        };
        let mut guard = or_map.write();

        let remote_tombstones: Vec<String> = entries
            .first()
            .map(|e| e.tombstones.clone())
            .unwrap_or_default();

        for entry in entries {
            let outcome = guard.merge_key(
                entry.key.clone(),
                entry.records.clone(),
                &entry.tombstones,
            );
            self.stats.pulled += outcome.added + outcome.updated;
        }

        if !self.push_enabled {
            return Vec::new();
        }

        let local_tombstones: Vec<String> =
            guard.tombstones().into_iter().cloned().collect();
        let local_keys = guard.merkle().keys_in_bucket(path).unwrap_or_default();

        let mut push_entries = Vec::new();
        for key in local_keys {
            let Some(local_records) = guard.records_map(&key) else {
                continue;
            };
            let remote = entries.iter().find(|e| e.key == key);
            let has_unseen_tag = remote.is_none_or(|e| {
                local_records
                    .keys()
                    .any(|tag| !e.records.iter().any(|r| &r.tag == tag))
            });
            if has_unseen_tag {
                push_entries.push(OrMapEntry {
                    records: local_records.values().cloned().collect(),
                    tombstones: local_tombstones.clone(),
                    key,
                });
            }
        }

        // Tombstones the responder lacks must travel even when no record
        // differs; attach them to the first remote key of the bucket.
        let unseen_tombstones = local_tombstones
            .iter()
            .any(|t| !remote_tombstones.contains(t));
        if push_entries.is_empty() && unseen_tombstones {
            if let Some(entry) = entries.first() {
                let records = guard
                    .records_map(&entry.key)
                    .map(|m| m.values().cloned().collect())
                    .unwrap_or_default();
                push_entries.push(OrMapEntry {
                    key: entry.key.clone(),
                    records,
                    tombstones: local_tombstones,
                });
            }
        }

        if push_entries.is_empty() {
            return Vec::new();
        }
        self.stats.pushed += push_entries.len();
        vec![Message::OrSyncPushDiff(OrSyncPushDiffPayload {
            map_name: self.map_name.clone(),
            entries: push_entries,
        })]
    }
}
