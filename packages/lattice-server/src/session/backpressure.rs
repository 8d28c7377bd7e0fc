//! Write-path backpressure regulation.
//!
//! The pipeline accepts ops faster than storage can absorb them; left
//! unchecked the pending set grows without bound. The regulator counts
//! ops in flight, makes new ops wait for capacity once the budget is
//! full, and forces periodic write-throughs — every Nth op always, plus
//! randomly once utilization climbs past the early-forcing threshold so
//! the pending set drains before it saturates.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Notify;

use crate::config::SessionConfig;
use crate::error::ServerError;

/// Counter snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackpressureStats {
    /// Ops accepted since start.
    pub accepted: u64,
    /// Ops currently in flight.
    pub pending: usize,
    /// Write-throughs forced (periodic plus early).
    pub forced: u64,
}

/// Admission and write-through regulator for the op pipeline.
#[derive(Debug)]
pub struct BackpressureRegulator {
    accepted: AtomicU64,
    pending: AtomicUsize,
    forced: AtomicU64,
    capacity_freed: Notify,
    write_through_every: u64,
    max_pending_ops: usize,
    early_force_utilization: f64,
}

/// Holds one slot of the pending-op budget; dropping it frees the slot.
#[derive(Debug)]
pub struct OpPermit {
    regulator: Arc<BackpressureRegulator>,
}

impl Drop for OpPermit {
    fn drop(&mut self) {
        self.regulator.pending.fetch_sub(1, Ordering::Relaxed);
        self.regulator.capacity_freed.notify_waiters();
    }
}

impl BackpressureRegulator {
    /// Creates a regulator from session configuration.
    #[must_use]
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            accepted: AtomicU64::new(0),
            pending: AtomicUsize::new(0),
            forced: AtomicU64::new(0),
            capacity_freed: Notify::new(),
            write_through_every: config.write_through_every.max(1),
            max_pending_ops: config.max_pending_ops.max(1),
            early_force_utilization: config.early_force_utilization,
        }
    }

    /// Admits one op, waiting up to `timeout` for capacity when the
    /// pending budget is exhausted.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Overloaded`] when capacity does not free up
    /// within the timeout.
    pub async fn admit(self: &Arc<Self>, timeout: Duration) -> Result<OpPermit, ServerError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let current = self.pending.load(Ordering::Relaxed);
            if current < self.max_pending_ops {
                // Optimistic claim; revalidate after the increment.
                let claimed = self.pending.fetch_add(1, Ordering::Relaxed);
                if claimed < self.max_pending_ops {
                    return Ok(OpPermit {
                        regulator: self.clone(),
                    });
                }
                self.pending.fetch_sub(1, Ordering::Relaxed);
            }

            metrics::counter!("lattice_backpressure_waits_total").increment(1);
            let wait = self.capacity_freed.notified();
            if tokio::time::timeout_at(deadline, wait).await.is_err() {
                return Err(ServerError::Overloaded);
            }
        }
    }

    /// Counts one accepted op and decides whether it must write through
    /// to storage synchronously.
    pub fn on_accept(&self) -> bool {
        let accepted = self.accepted.fetch_add(1, Ordering::Relaxed) + 1;
        if accepted % self.write_through_every == 0 {
            self.forced.fetch_add(1, Ordering::Relaxed);
            return true;
        }

        #[allow(clippy::cast_precision_loss)]
        let utilization =
            self.pending.load(Ordering::Relaxed) as f64 / self.max_pending_ops as f64;
        if utilization > self.early_force_utilization {
            // Forcing probability ramps linearly from the threshold to 1.
            let ramp = (utilization - self.early_force_utilization)
                / (1.0 - self.early_force_utilization);
            if rand::rng().random::<f64>() < ramp {
                self.forced.fetch_add(1, Ordering::Relaxed);
                return true;
            }
        }
        false
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> BackpressureStats {
        BackpressureStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            pending: self.pending.load(Ordering::Relaxed),
            forced: self.forced.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn regulator(max_pending: usize, every: u64) -> Arc<BackpressureRegulator> {
        Arc::new(BackpressureRegulator::new(&SessionConfig {
            max_pending_ops: max_pending,
            write_through_every: every,
            early_force_utilization: 0.99,
            ..SessionConfig::default()
        }))
    }

    #[tokio::test]
    async fn permits_track_pending_and_release_on_drop() {
        let regulator = regulator(4, 1_000);
        let p1 = regulator.admit(Duration::from_millis(10)).await.unwrap();
        let p2 = regulator.admit(Duration::from_millis(10)).await.unwrap();
        assert_eq!(regulator.stats().pending, 2);

        drop(p1);
        assert_eq!(regulator.stats().pending, 1);
        drop(p2);
        assert_eq!(regulator.stats().pending, 0);
    }

    #[tokio::test]
    async fn admit_times_out_when_budget_is_full() {
        let regulator = regulator(1, 1_000);
        let _held = regulator.admit(Duration::from_millis(10)).await.unwrap();

        let err = regulator.admit(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, ServerError::Overloaded));
    }

    #[tokio::test]
    async fn admit_resumes_when_capacity_frees() {
        let regulator = regulator(1, 1_000);
        let held = regulator.admit(Duration::from_millis(10)).await.unwrap();

        let waiter = {
            let regulator = regulator.clone();
            tokio::spawn(async move { regulator.admit(Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);

        let permit = waiter.await.unwrap();
        assert!(permit.is_ok());
    }

    #[tokio::test]
    async fn every_nth_op_forces_write_through() {
        let regulator = regulator(1_000, 4);
        let forced: Vec<bool> = (0..12).map(|_| regulator.on_accept()).collect();
        let expected: Vec<bool> = (1..=12).map(|n| n % 4 == 0).collect();
        assert_eq!(forced, expected);
        assert_eq!(regulator.stats().forced, 3);
        assert_eq!(regulator.stats().accepted, 12);
    }

    #[tokio::test]
    async fn high_utilization_forces_early() {
        let regulator = Arc::new(BackpressureRegulator::new(&SessionConfig {
            max_pending_ops: 10,
            write_through_every: u64::MAX,
            early_force_utilization: 0.5,
            ..SessionConfig::default()
        }));

        // Fill pending to 100% utilization; the ramp reaches probability 1.
        let mut permits = Vec::new();
        for _ in 0..10 {
            permits.push(regulator.admit(Duration::from_millis(10)).await.unwrap());
        }
        let forced = (0..50).filter(|_| regulator.on_accept()).count();
        assert!(forced >= 45, "full utilization must force nearly always");
    }
}
