//! Operation interceptors.
//!
//! Interceptors run in registration order around every client op. A
//! before hook may pass the op through, rewrite it, drop it silently, or
//! reject it back to the client; after hooks observe the final outcome.
//! Interceptor failures are contained at the pipeline boundary — they
//! reject the one op, never the session.

use lattice_core::messages::{ClientOpPayload, WriteConcern};
use lattice_core::Principal;

/// Outcome handed to after-op hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpOutcome {
    /// The op was applied (or was a stale no-op) and acked.
    Applied {
        /// Durability level reached at ack time.
        achieved: WriteConcern,
        /// Whether the CRDT state actually changed.
        changed: bool,
    },
    /// A conflict resolver kept the local value; the op was acked but
    /// not applied.
    PreferredLocal,
    /// The op was rejected (resolver, policy, or interceptor).
    Rejected {
        /// Why.
        reason: String,
    },
    /// A before hook dropped the op silently.
    Dropped,
}

/// Hook pair around client operations.
pub trait OpInterceptor: Send + Sync {
    /// Runs before the op is applied.
    ///
    /// Return `Ok(Some(op))` to continue (possibly modified),
    /// `Ok(None)` to drop silently, `Err(reason)` to reject with an
    /// error to the client.
    ///
    /// # Errors
    ///
    /// The returned reason is reported to the client verbatim.
    fn before_op(
        &self,
        principal: Option<&Principal>,
        op: ClientOpPayload,
    ) -> Result<Option<ClientOpPayload>, String>;

    /// Runs after the op completed, with its outcome.
    fn after_op(
        &self,
        _principal: Option<&Principal>,
        _op: &ClientOpPayload,
        _outcome: &OpOutcome,
    ) {
    }
}

#[cfg(test)]
mod tests {
    use lattice_core::messages::OpType;

    use super::*;

    /// Stamps a marker id onto every op; used to prove rewrite plumbing.
    struct TagInterceptor;

    impl OpInterceptor for TagInterceptor {
        fn before_op(
            &self,
            _principal: Option<&Principal>,
            mut op: ClientOpPayload,
        ) -> Result<Option<ClientOpPayload>, String> {
            op.id = Some(format!("tagged-{}", op.id.unwrap_or_default()));
            Ok(Some(op))
        }
    }

    #[test]
    fn interceptor_can_rewrite_ops() {
        let op = ClientOpPayload {
            id: Some("1".to_string()),
            map_name: "m".to_string(),
            key: "k".to_string(),
            op_type: OpType::Remove,
            record: None,
            or_record: None,
            or_tag: None,
            timestamp: None,
            write_concern: None,
            timeout_ms: None,
        };
        let out = TagInterceptor.before_op(None, op).unwrap().unwrap();
        assert_eq!(out.id.as_deref(), Some("tagged-1"));
    }
}
