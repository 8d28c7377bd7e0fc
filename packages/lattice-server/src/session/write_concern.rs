//! Pending-ack tracking for replicated write concerns.
//!
//! A `QUORUM` or `ALL` write registers here before fan-out; replica acks
//! stream in via the cluster connection and the waiter fires as soon as
//! the required count (origin included) is reached. A waiter that times
//! out reports `WriteTimeout` — the local apply stays in place, only the
//! durability promise is withdrawn.

use std::collections::HashSet;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::error::ServerError;

struct PendingAck {
    required: usize,
    acked: HashSet<String>,
    notify: Option<oneshot::Sender<()>>,
}

/// Tracks outstanding replica acknowledgements by op id.
#[derive(Default)]
pub struct AckTracker {
    pending: DashMap<String, PendingAck>,
}

impl AckTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter for `required` acks; the origin's own ack is
    /// pre-counted. The returned receiver fires once enough replicas
    /// acked. With `required <= 1` it fires immediately.
    pub fn register(&self, op_id: &str, required: usize, self_node: &str) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let mut acked = HashSet::new();
        acked.insert(self_node.to_string());

        if acked.len() >= required {
            let _ = tx.send(());
            return rx;
        }
        self.pending.insert(
            op_id.to_string(),
            PendingAck {
                required,
                acked,
                notify: Some(tx),
            },
        );
        rx
    }

    /// Records one replica ack. Duplicate acks from the same node are
    /// counted once. Returns `true` when this ack completed the waiter.
    pub fn record_ack(&self, op_id: &str, node_id: &str) -> bool {
        let Some(mut entry) = self.pending.get_mut(op_id) else {
            return false; // late ack after completion or timeout
        };
        entry.acked.insert(node_id.to_string());
        if entry.acked.len() >= entry.required {
            if let Some(notify) = entry.notify.take() {
                let _ = notify.send(());
            }
            drop(entry);
            self.pending.remove(op_id);
            return true;
        }
        false
    }

    /// Drops a waiter (timeout or session teardown).
    pub fn abandon(&self, op_id: &str) {
        self.pending.remove(op_id);
    }

    /// Number of ops still waiting for acks.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Awaits a registered waiter with a timeout.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::WriteTimeout`] when the acks do not arrive
    /// in time; the pending entry is dropped so late acks are ignored.
    pub async fn wait(
        &self,
        op_id: &str,
        rx: oneshot::Receiver<()>,
        timeout: Duration,
    ) -> Result<(), ServerError> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(_) => Ok(()),
            Err(_) => {
                self.abandon(op_id);
                metrics::counter!("lattice_write_concern_timeouts_total").increment(1);
                Err(ServerError::WriteTimeout {
                    op_id: op_id.to_string(),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }
}

/// Acks required for a quorum over `replica_count` replicas (origin
/// included): `ceil((replicas + 1) / 2)`.
#[must_use]
pub fn quorum_of(replica_count: usize) -> usize {
    (replica_count + 1).div_ceil(2)
}
