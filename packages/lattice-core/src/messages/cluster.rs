//! Cluster protocol payloads.
//!
//! Nodes talk to each other over the same framing as clients but on a
//! separate listener. The cluster protocol adds operation forwarding
//! (`ClusterOp`), membership notifications from the discovery feed, and
//! partition map announcements from the node that rebuilt the table.

use serde::{Deserialize, Serialize};

use crate::partition::PartitionMap;

use super::base::ClientOpPayload;

/// A client operation forwarded between nodes.
///
/// Receivers treat these as cluster-originated: they merge idempotently
/// and never re-broadcast to peers, which breaks forwarding loops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterOpPayload {
    /// The forwarded operation, unchanged from the origin.
    pub op: ClientOpPayload,
    /// Node that first accepted the operation from a client.
    pub origin_node_id: String,
}

/// A node joined the cluster (from the discovery feed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberJoinPayload {
    /// Joining node's id.
    pub node_id: String,
    /// Cluster listener address (`host:port`).
    pub address: String,
}

/// A node left the cluster (gracefully or by failure detection).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberLeavePayload {
    /// Leaving node's id.
    pub node_id: String,
}

/// Publishes a rebuilt partition map to the cluster.
///
/// Receivers adopt the map only when its version exceeds the one they
/// hold; stale announcements from slow gossip are dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionMapAnnouncePayload {
    /// The full versioned map.
    pub map: PartitionMap,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::base::OpType;
    use crate::partition::PARTITION_COUNT;

    fn roundtrip<T>(val: &T) -> T
    where
        T: Serialize + serde::de::DeserializeOwned,
    {
        let bytes = rmp_serde::to_vec_named(val).expect("serialize");
        rmp_serde::from_slice(&bytes).expect("deserialize")
    }

    #[test]
    fn cluster_op_roundtrip() {
        let payload = ClusterOpPayload {
            op: ClientOpPayload {
                id: Some("op-9".to_string()),
                map_name: "users".to_string(),
                key: "alice".to_string(),
                op_type: OpType::Remove,
                record: None,
                or_record: None,
                or_tag: None,
                timestamp: None,
                write_concern: None,
                timeout_ms: None,
            },
            origin_node_id: "node-1".to_string(),
        };
        assert_eq!(roundtrip(&payload), payload);
    }

    #[test]
    fn membership_payloads_roundtrip() {
        let join = MemberJoinPayload {
            node_id: "node-2".to_string(),
            address: "10.0.0.2:7401".to_string(),
        };
        let leave = MemberLeavePayload {
            node_id: "node-2".to_string(),
        };
        assert_eq!(roundtrip(&join), join);
        assert_eq!(roundtrip(&leave), leave);
    }

    #[test]
    fn partition_map_announce_roundtrip() {
        let map = PartitionMap::build(
            4,
            &["node-1".to_string(), "node-2".to_string()],
            PARTITION_COUNT,
            1,
        );
        let payload = PartitionMapAnnouncePayload { map };
        assert_eq!(roundtrip(&payload), payload);
    }
}
