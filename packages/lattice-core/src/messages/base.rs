//! Session-level message payloads: auth, operations, acks, events.
//!
//! Every struct here is the payload of exactly one [`FrameKind`]
//! (`crate::frame::FrameKind`); the frame header carries the type, so
//! payloads hold only their own fields. All structs serialize as named
//! MsgPack maps with camelCase keys, the wire convention shared with
//! client SDKs.

use serde::{Deserialize, Serialize};

use crate::hlc::Timestamp;
use crate::lww_map::LwwRecord;
use crate::or_map::OrRecord;
use crate::types::{Principal, Value};

/// Wire error codes, aligned with their HTTP namesakes.
pub mod error_codes {
    /// Malformed frame, unknown type, or invalid payload shape.
    pub const PROTOCOL: u16 = 400;
    /// Missing, expired, or invalid credentials.
    pub const UNAUTHENTICATED: u16 = 401;
    /// Policy engine denied the action.
    pub const FORBIDDEN: u16 = 403;
    /// Strict-mode clock skew rejection.
    pub const CLOCK_SKEW: u16 = 409;
    /// Frame exceeded the size limit.
    pub const PAYLOAD_TOO_LARGE: u16 = 413;
    /// Admission control or per-client rate cap.
    pub const RATE_LIMITED: u16 = 429;
    /// Invariant breach; the session will be closed.
    pub const INTERNAL: u16 = 500;
    /// Write concern unmet, storage unavailable, or shutting down.
    pub const UNAVAILABLE: u16 = 503;
}

/// Write concern: how many replicas must acknowledge before the client
/// sees an ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WriteConcern {
    /// Ack after the local apply.
    Local,
    /// Ack after `ceil((replicas + 1) / 2)` acks, the origin included.
    Quorum,
    /// Ack after every replica acks.
    All,
}

impl Default for WriteConcern {
    fn default() -> Self {
        Self::Local
    }
}

/// Mutation verb of a client operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpType {
    /// LWW set.
    Put,
    /// LWW tombstone.
    Remove,
    /// OR-set tagged add.
    OrAdd,
    /// OR-set removal by tag.
    OrRemove,
}

/// Client authentication, the only message accepted on a fresh session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthPayload {
    /// Bearer token; scheme is up to the configured authenticator.
    pub token: String,
    /// Optional protocol version announced by the client.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub protocol_version: Option<u32>,
}

/// Successful authentication reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthOkPayload {
    /// The resolved principal the session now acts as.
    pub principal: Principal,
}

/// Error reply; fatal codes are followed by a close.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    /// One of [`error_codes`].
    pub code: u16,
    /// Human-readable detail.
    pub message: String,
}

/// A single client mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientOpPayload {
    /// Client-assigned id echoed in the ack; generated when absent.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub id: Option<String>,
    /// Target map.
    pub map_name: String,
    /// Target key.
    pub key: String,
    /// Mutation verb.
    pub op_type: OpType,
    /// LWW record for `PUT`/`REMOVE` (`REMOVE` carries the tombstone).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub record: Option<LwwRecord<Value>>,
    /// OR record for `OR_ADD`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub or_record: Option<OrRecord<Value>>,
    /// Tag for `OR_REMOVE`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub or_tag: Option<String>,
    /// Removal timestamp for `OR_REMOVE`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub timestamp: Option<Timestamp>,
    /// Requested durability before the ack; defaults to `LOCAL`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub write_concern: Option<WriteConcern>,
    /// Per-op timeout override in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub timeout_ms: Option<u64>,
}

/// Acknowledgement of an accepted operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckPayload {
    /// The operation this ack answers.
    pub op_id: String,
    /// Durability level actually reached when the ack was sent.
    pub achieved: WriteConcern,
}

/// A conflict resolver rejected the operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeRejectionPayload {
    /// Map the rejected op targeted.
    pub map_name: String,
    /// Key the rejected op targeted.
    pub key: String,
    /// Resolver-supplied reason.
    pub reason: String,
    /// The value the client attempted to write.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub attempted_value: Option<Value>,
}

/// Change category carried by server events and journal rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    /// A key became visible.
    Put,
    /// A visible key changed value.
    Update,
    /// A key was removed.
    Delete,
}

/// Change notification pushed to map subscribers and replicas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerEventPayload {
    /// Map that changed.
    pub map_name: String,
    /// Change category.
    pub event_kind: EventKind,
    /// Key that changed.
    pub key: String,
    /// New LWW record, when the map is LWW.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub record: Option<LwwRecord<Value>>,
    /// New OR record, when the map is OR.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub or_record: Option<OrRecord<Value>>,
    /// Tombstoned tag for OR removals.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub or_tag: Option<String>,
}

/// Registers a live query subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuerySubPayload {
    /// Client-chosen subscription id.
    pub query_id: String,
    /// Map to query.
    pub map_name: String,
    /// The query itself.
    pub query: crate::query::Query,
}

/// Cancels a live query subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryUnsubPayload {
    /// Subscription to cancel.
    pub query_id: String,
}

/// One row of a query result page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRow {
    /// Entry key.
    pub key: String,
    /// Entry value.
    pub value: Value,
}

/// A page of query results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResultPayload {
    /// Subscription or request id the page answers.
    pub query_id: String,
    /// Rows in sort order.
    pub rows: Vec<QueryRow>,
    /// Opaque continuation token when more rows exist.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cursor: Option<String>,
    /// Whether the limit filled before the data ran out.
    pub has_more: bool,
}

/// Liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    /// Sender wall clock in milliseconds.
    pub ts: u64,
}

/// Liveness probe reply, echoing the probe's timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatAckPayload {
    /// The echoed probe timestamp.
    pub ts: u64,
    /// Responder wall clock in milliseconds.
    pub server_ts: u64,
}
