//! Anti-entropy sync message payloads for LWW and OR maps.
//!
//! The walk is the same for both map flavors: the puller announces its
//! last sync time (`*SyncInit`), the responder either demands a full
//! resync (`*SyncResetRequired`, when local GC has outrun the puller) or
//! answers with its Merkle root; mismatching subtrees are narrowed bucket
//! by bucket (`*ReqBucket` / `*RespBuckets`) down to leaves, whose key
//! sets feed a symmetric diff (`*DiffRequest` / `*DiffResponse` /
//! `*PushDiff`). OR payloads additionally carry tombstone tags, since a
//! removal must travel even when no record remains.

use serde::{Deserialize, Serialize};

use crate::hlc::Timestamp;
use crate::lww_map::LwwRecord;
use crate::or_map::OrRecord;
use crate::types::Value;

/// Starts a sync session for one map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncInitPayload {
    /// Map to synchronize.
    pub map_name: String,
    /// Wall-clock millis of the puller's last completed sync, if any.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_sync_ts: Option<u64>,
}

/// Responder's Merkle root for the map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRespRootPayload {
    /// Map being synchronized.
    pub map_name: String,
    /// Root hash of the responder's tree.
    pub root_hash: u64,
    /// Responder HLC time at the response.
    pub timestamp: Timestamp,
}

/// The puller's `last_sync_ts` predates local garbage collection; only a
/// full push can bring it back in sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResetRequiredPayload {
    /// Map being synchronized.
    pub map_name: String,
}

/// Asks for the child hashes (or leaf content) under a tree path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReqBucketPayload {
    /// Map being synchronized.
    pub map_name: String,
    /// Hex-digit path of the node whose children are wanted.
    pub path: String,
}

/// Child hashes under an internal node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRespBucketsPayload {
    /// Map being synchronized.
    pub map_name: String,
    /// Path the children belong to.
    pub path: String,
    /// The 16 child hashes in bucket order.
    pub children: Vec<u64>,
}

/// One key and its full LWW record inside a leaf or diff message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncLeafEntry {
    /// Entry key.
    pub key: String,
    /// Raw record, tombstones included.
    pub record: LwwRecord<Value>,
}

/// Full content of one leaf bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRespLeafPayload {
    /// Map being synchronized.
    pub map_name: String,
    /// Leaf path the entries belong to.
    pub path: String,
    /// All records in the bucket, in key order.
    pub entries: Vec<SyncLeafEntry>,
}

/// Requests full records for specific keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncDiffRequestPayload {
    /// Map being synchronized.
    pub map_name: String,
    /// Keys the requester believes are stale or missing locally.
    pub keys: Vec<String>,
}

/// Answers a diff request with the requested records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncDiffResponsePayload {
    /// Map being synchronized.
    pub map_name: String,
    /// Records for the requested keys that exist on the responder.
    pub entries: Vec<SyncLeafEntry>,
}

/// Unsolicited records the sender believes are newer than the receiver's.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPushDiffPayload {
    /// Map being synchronized.
    pub map_name: String,
    /// Records to merge on the receiving side.
    pub entries: Vec<SyncLeafEntry>,
}

// ---------------------------------------------------------------------------
// OR-map analogs
// ---------------------------------------------------------------------------

/// One key of an OR map: its records plus the tombstones covering it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrMapEntry {
    /// Entry key.
    pub key: String,
    /// Active tagged records.
    pub records: Vec<OrRecord<Value>>,
    /// Tombstoned tags relevant to this key (or the whole map in init).
    pub tombstones: Vec<String>,
}

/// Starts an OR-map sync session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrSyncInitPayload {
    /// Map to synchronize.
    pub map_name: String,
    /// Wall-clock millis of the puller's last completed sync, if any.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_sync_ts: Option<u64>,
}

/// Responder's Merkle root for an OR map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrSyncRespRootPayload {
    /// Map being synchronized.
    pub map_name: String,
    /// Root hash of the responder's tree.
    pub root_hash: u64,
    /// Responder HLC time at the response.
    pub timestamp: Timestamp,
}

/// Full content of one OR-map leaf bucket, tombstones included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrSyncRespLeafPayload {
    /// Map being synchronized.
    pub map_name: String,
    /// Leaf path the entries belong to.
    pub path: String,
    /// Per-key records and tombstones.
    pub entries: Vec<OrMapEntry>,
}

/// Answers an OR diff request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrSyncDiffResponsePayload {
    /// Map being synchronized.
    pub map_name: String,
    /// Per-key records and tombstones for the requested keys.
    pub entries: Vec<OrMapEntry>,
}

/// Pushes OR entries the sender believes the receiver lacks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrSyncPushDiffPayload {
    /// Map being synchronized.
    pub map_name: String,
    /// Per-key records and tombstones to merge.
    pub entries: Vec<OrMapEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip<T>(val: &T) -> T
    where
        T: Serialize + serde::de::DeserializeOwned,
    {
        let bytes = rmp_serde::to_vec_named(val).expect("serialize");
        rmp_serde::from_slice(&bytes).expect("deserialize")
    }

    #[test]
    fn sync_init_roundtrips_with_and_without_watermark() {
        let with = SyncInitPayload {
            map_name: "users".to_string(),
            last_sync_ts: Some(1_700_000_000_000),
        };
        let without = SyncInitPayload {
            map_name: "users".to_string(),
            last_sync_ts: None,
        };
        assert_eq!(roundtrip(&with), with);
        assert_eq!(roundtrip(&without), without);
    }

    #[test]
    fn root_and_reset_roundtrip() {
        let root = SyncRespRootPayload {
            map_name: "users".to_string(),
            root_hash: u64::MAX - 3,
            timestamp: Timestamp::new(100, 2, "n1"),
        };
        let reset = SyncResetRequiredPayload {
            map_name: "users".to_string(),
        };
        assert_eq!(roundtrip(&root), root);
        assert_eq!(roundtrip(&reset), reset);
    }

    #[test]
    fn bucket_walk_payloads_roundtrip() {
        let req = SyncReqBucketPayload {
            map_name: "m".to_string(),
            path: "a3".to_string(),
        };
        let resp = SyncRespBucketsPayload {
            map_name: "m".to_string(),
            path: "a3".to_string(),
            children: (0..16).collect(),
        };
        assert_eq!(roundtrip(&req), req);
        assert_eq!(roundtrip(&resp), resp);
    }

    #[test]
    fn leaf_and_diff_payloads_roundtrip() {
        let entry = SyncLeafEntry {
            key: "k".to_string(),
            record: LwwRecord {
                value: None,
                timestamp: Timestamp::new(9, 0, "n"),
                ttl_ms: None,
            },
        };
        let leaf = SyncRespLeafPayload {
            map_name: "m".to_string(),
            path: "a3f".to_string(),
            entries: vec![entry.clone()],
        };
        let req = SyncDiffRequestPayload {
            map_name: "m".to_string(),
            keys: vec!["k".to_string(), "other".to_string()],
        };
        let push = SyncPushDiffPayload {
            map_name: "m".to_string(),
            entries: vec![entry],
        };
        assert_eq!(roundtrip(&leaf), leaf);
        assert_eq!(roundtrip(&req), req);
        assert_eq!(roundtrip(&push), push);
    }

    #[test]
    fn or_entries_carry_tombstones() {
        let entry = OrMapEntry {
            key: "k".to_string(),
            records: vec![OrRecord {
                value: Value::Int(1),
                timestamp: Timestamp::new(10, 0, "n"),
                tag: "10:0:n".to_string(),
                ttl_ms: None,
            }],
            tombstones: vec!["9:0:n".to_string()],
        };
        let leaf = OrSyncRespLeafPayload {
            map_name: "m".to_string(),
            path: "000".to_string(),
            entries: vec![entry.clone()],
        };
        let push = OrSyncPushDiffPayload {
            map_name: "m".to_string(),
            entries: vec![entry],
        };
        assert_eq!(roundtrip(&leaf), leaf);
        assert_eq!(roundtrip(&push), push);
    }
}
