//! Server error taxonomy and its mapping onto the wire protocol.
//!
//! Every failure a session can observe collapses into [`ServerError`];
//! the session loop turns it into an `ERROR{code}` (or `MERGE_REJECTION`)
//! frame via [`ServerError::to_wire`] and decides whether the connection
//! survives via [`ServerError::closes_session`]. Handler and interceptor
//! errors are caught at the pipeline boundary — they never tear down the
//! session loop itself.

use lattice_core::messages::{error_codes, ErrorPayload, MergeRejectionPayload, Message};
use lattice_core::types::Value;
use lattice_core::{FrameError, HlcError, MapError};

use crate::storage::StorageError;

/// Unified server-side error.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Malformed frame, unknown kind, or undecodable payload.
    #[error("protocol: {0}")]
    Protocol(#[from] FrameError),

    /// An operation whose shape is invalid for its verb (missing record,
    /// missing tag, wrong map kind). Treated like a protocol breach.
    #[error("malformed operation: {0}")]
    Malformed(String),

    /// Missing, expired, or invalid credentials.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// The policy engine rejected the action.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Admission control or a per-session cap rejected the request.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// A conflict resolver rejected the merge.
    #[error("merge rejected on {map_name}/{key}: {reason}")]
    MergeRejected {
        /// Map the rejected op targeted.
        map_name: String,
        /// Key the rejected op targeted.
        key: String,
        /// Resolver-supplied reason.
        reason: String,
        /// Value the client attempted to write.
        attempted_value: Option<Value>,
    },

    /// The requested write concern was not reached in time.
    #[error("write concern unmet for op {op_id} after {timeout_ms}ms")]
    WriteTimeout {
        /// The operation that timed out.
        op_id: String,
        /// How long the tracker waited.
        timeout_ms: u64,
    },

    /// Strict-mode clock drift rejection.
    #[error(transparent)]
    ClockSkew(#[from] HlcError),

    /// Invalid key or other map-level input error.
    #[error(transparent)]
    InvalidInput(#[from] MapError),

    /// The storage adapter failed and the write concern required it.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Too many operations in flight; load was shed.
    #[error("server overloaded")]
    Overloaded,

    /// Deadline or shutdown cancelled the operation.
    #[error("cancelled")]
    Cancelled,

    /// Invariant breach; the component restarts and the session closes.
    #[error("internal: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ServerError {
    /// The wire error code this error reports as.
    #[must_use]
    pub fn wire_code(&self) -> u16 {
        match self {
            ServerError::Protocol(FrameError::Oversize { .. }) => {
                error_codes::PAYLOAD_TOO_LARGE
            }
            ServerError::Protocol(_)
            | ServerError::Malformed(_)
            | ServerError::InvalidInput(_) => error_codes::PROTOCOL,
            ServerError::Unauthenticated(_) => error_codes::UNAUTHENTICATED,
            ServerError::PermissionDenied(_) => error_codes::FORBIDDEN,
            ServerError::RateLimited(_) => error_codes::RATE_LIMITED,
            ServerError::ClockSkew(_) => error_codes::CLOCK_SKEW,
            ServerError::WriteTimeout { .. }
            | ServerError::Storage(_)
            | ServerError::Overloaded
            | ServerError::Cancelled => error_codes::UNAVAILABLE,
            // Rejections travel as MERGE_REJECTION, not ERROR; the code is
            // only used if one ends up on the ERROR path anyway.
            ServerError::MergeRejected { .. } => error_codes::PROTOCOL,
            ServerError::Internal(_) => error_codes::INTERNAL,
        }
    }

    /// Whether the session must be closed after reporting this error.
    #[must_use]
    pub fn closes_session(&self) -> bool {
        matches!(
            self,
            ServerError::Protocol(_) | ServerError::Unauthenticated(_) | ServerError::Internal(_)
        )
    }

    /// The reply frame for this error: `MERGE_REJECTION` for resolver
    /// rejections, `ERROR{code}` for everything else.
    #[must_use]
    pub fn to_wire(&self) -> Message {
        match self {
            ServerError::MergeRejected {
                map_name,
                key,
                reason,
                attempted_value,
            } => Message::MergeRejection(MergeRejectionPayload {
                map_name: map_name.clone(),
                key: key.clone(),
                reason: reason.clone(),
                attempted_value: attempted_value.clone(),
            }),
            other => Message::Error(ErrorPayload {
                code: other.wire_code(),
                message: other.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes_follow_the_taxonomy() {
        assert_eq!(
            ServerError::Unauthenticated("no token".into()).wire_code(),
            401
        );
        assert_eq!(
            ServerError::PermissionDenied("role".into()).wire_code(),
            403
        );
        assert_eq!(ServerError::RateLimited("cap".into()).wire_code(), 429);
        assert_eq!(ServerError::Overloaded.wire_code(), 503);
        assert_eq!(
            ServerError::WriteTimeout {
                op_id: "op".into(),
                timeout_ms: 5,
            }
            .wire_code(),
            503
        );
        assert_eq!(
            ServerError::ClockSkew(HlcError::ClockSkew {
                remote_millis: 2,
                local_millis: 1,
                drift_ms: 1,
                max_drift_ms: 0,
            })
            .wire_code(),
            409
        );
        assert_eq!(
            ServerError::Internal(anyhow::anyhow!("invariant")).wire_code(),
            500
        );
    }

    #[test]
    fn oversize_frames_map_to_413() {
        let err = ServerError::Protocol(FrameError::Oversize { len: 10, max: 5 });
        assert_eq!(err.wire_code(), 413);
        assert!(err.closes_session());
    }

    #[test]
    fn only_fatal_errors_close_the_session() {
        assert!(ServerError::Unauthenticated("x".into()).closes_session());
        assert!(ServerError::Protocol(FrameError::UnknownKind(0xEE)).closes_session());
        assert!(!ServerError::PermissionDenied("x".into()).closes_session());
        assert!(!ServerError::RateLimited("x".into()).closes_session());
        assert!(!ServerError::Overloaded.closes_session());
    }

    #[test]
    fn merge_rejections_travel_as_their_own_kind() {
        let err = ServerError::MergeRejected {
            map_name: "configs".into(),
            key: "app".into(),
            reason: "immutable".into(),
            attempted_value: Some(Value::Int(2)),
        };
        match err.to_wire() {
            Message::MergeRejection(p) => {
                assert_eq!(p.reason, "immutable");
                assert_eq!(p.attempted_value, Some(Value::Int(2)));
            }
            other => panic!("expected MergeRejection, got {other:?}"),
        }
    }

    #[test]
    fn plain_errors_travel_as_error_frames() {
        match ServerError::Overloaded.to_wire() {
            Message::Error(p) => assert_eq!(p.code, 503),
            other => panic!("expected Error, got {other:?}"),
        }
    }
}
