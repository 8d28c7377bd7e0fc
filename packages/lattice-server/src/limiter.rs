//! Connection admission control.
//!
//! A sliding one-window limiter with two independent caps: how many
//! connections may be admitted per window, and how many may sit in the
//! handshake ("pending") at once. An accepted attempt holds a pending
//! slot until the handshake resolves to established or failed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lattice_core::ClockSource;
use parking_lot::Mutex;

use crate::config::AdmissionConfig;

/// Snapshot of limiter counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionStats {
    /// Connections admitted in the current window.
    pub connections_per_second: u32,
    /// Connections currently in the handshake.
    pub pending: u32,
    /// Total admitted since start.
    pub total_accepted: u64,
    /// Total rejected since start.
    pub total_rejected: u64,
}

struct WindowState {
    window_start: u64,
    admitted_in_window: u32,
    pending: u32,
}

/// Sliding-window connection rate limiter.
pub struct ConnectionRateLimiter {
    config: AdmissionConfig,
    state: Mutex<WindowState>,
    total_accepted: AtomicU64,
    total_rejected: AtomicU64,
    clock: Arc<dyn ClockSource>,
}

impl ConnectionRateLimiter {
    /// Creates a limiter with the given caps.
    #[must_use]
    pub fn new(config: AdmissionConfig, clock: Arc<dyn ClockSource>) -> Self {
        let now = clock.now();
        Self {
            config,
            state: Mutex::new(WindowState {
                window_start: now,
                admitted_in_window: 0,
                pending: 0,
            }),
            total_accepted: AtomicU64::new(0),
            total_rejected: AtomicU64::new(0),
            clock,
        }
    }

    /// Whether a new connection would currently be admitted. Read-only.
    #[must_use]
    pub fn should_accept(&self) -> bool {
        let mut state = self.state.lock();
        self.roll_window(&mut state);
        state.admitted_in_window < self.config.max_connections_per_second
            && state.pending < self.config.max_pending_connections
    }

    /// Registers a connection attempt.
    ///
    /// On admission the attempt occupies a pending slot; the caller must
    /// resolve it with [`ConnectionRateLimiter::established`] or
    /// [`ConnectionRateLimiter::pending_failed`]. Returns `false` when
    /// either cap rejects the attempt.
    pub fn attempt(&self) -> bool {
        let mut state = self.state.lock();
        self.roll_window(&mut state);

        if state.admitted_in_window >= self.config.max_connections_per_second
            || state.pending >= self.config.max_pending_connections
        {
            drop(state);
            self.total_rejected.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("lattice_admission_rejected_total").increment(1);
            return false;
        }

        state.admitted_in_window += 1;
        state.pending += 1;
        drop(state);
        self.total_accepted.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("lattice_admission_accepted_total").increment(1);
        true
    }

    /// Marks an admitted attempt as fully established.
    pub fn established(&self) {
        let mut state = self.state.lock();
        state.pending = state.pending.saturating_sub(1);
    }

    /// Marks an admitted attempt as failed during the handshake.
    pub fn pending_failed(&self) {
        let mut state = self.state.lock();
        state.pending = state.pending.saturating_sub(1);
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> AdmissionStats {
        let mut state = self.state.lock();
        self.roll_window(&mut state);
        AdmissionStats {
            connections_per_second: state.admitted_in_window,
            pending: state.pending,
            total_accepted: self.total_accepted.load(Ordering::Relaxed),
            total_rejected: self.total_rejected.load(Ordering::Relaxed),
        }
    }

    /// Resets per-window counters once the window has elapsed.
    fn roll_window(&self, state: &mut WindowState) {
        let now = self.clock.now();
        let window_ms = u64::try_from(self.config.window.as_millis()).unwrap_or(u64::MAX);
        if now.saturating_sub(state.window_start) >= window_ms {
            state.window_start = now;
            state.admitted_in_window = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64 as TestAtomic;

    use super::*;

    struct TestClock(Arc<TestAtomic>);
    impl ClockSource for TestClock {
        fn now(&self) -> u64 {
            self.0.load(Ordering::Relaxed)
        }
    }

    fn make(per_second: u32, pending: u32) -> (ConnectionRateLimiter, Arc<TestAtomic>) {
        let time = Arc::new(TestAtomic::new(10_000));
        let limiter = ConnectionRateLimiter::new(
            AdmissionConfig {
                max_connections_per_second: per_second,
                max_pending_connections: pending,
                window: std::time::Duration::from_secs(1),
            },
            Arc::new(TestClock(time.clone())),
        );
        (limiter, time)
    }

    #[test]
    fn admits_up_to_rate_cap_per_window() {
        let (limiter, _) = make(3, 100);
        for _ in 0..3 {
            assert!(limiter.attempt());
            limiter.established();
        }
        assert!(!limiter.attempt());
        assert!(!limiter.should_accept());

        let stats = limiter.stats();
        assert_eq!(stats.total_accepted, 3);
        assert_eq!(stats.total_rejected, 1);
    }

    #[test]
    fn window_roll_restores_the_rate_budget() {
        let (limiter, time) = make(1, 100);
        assert!(limiter.attempt());
        limiter.established();
        assert!(!limiter.attempt());

        time.store(11_100, Ordering::Relaxed);
        assert!(limiter.should_accept());
        assert!(limiter.attempt());
    }

    #[test]
    fn pending_cap_is_independent_of_rate() {
        let (limiter, time) = make(100, 2);
        assert!(limiter.attempt());
        assert!(limiter.attempt());
        // Pending slots are exhausted even though the rate budget is not.
        assert!(!limiter.attempt());

        // Rolling the window does not release pending slots.
        time.store(11_100, Ordering::Relaxed);
        assert!(!limiter.attempt());

        limiter.pending_failed();
        assert!(limiter.attempt());
    }

    #[test]
    fn established_and_failed_both_release_pending() {
        let (limiter, _) = make(100, 1);
        assert!(limiter.attempt());
        limiter.established();
        assert!(limiter.attempt());
        limiter.pending_failed();
        assert_eq!(limiter.stats().pending, 0);
    }

    #[test]
    fn admitted_per_window_never_exceeds_cap_under_pressure() {
        let (limiter, time) = make(10, 1_000);
        let mut admitted_total = 0_u64;

        // 100 windows of 1000 attempts each.
        for window in 0..100_u64 {
            time.store(10_000 + window * 1_000, Ordering::Relaxed);
            let mut in_window = 0;
            for _ in 0..1_000 {
                if limiter.attempt() {
                    limiter.established();
                    in_window += 1;
                }
            }
            assert!(in_window <= 10, "window {window} admitted {in_window}");
            admitted_total += in_window;
        }
        assert_eq!(admitted_total, 1_000);
        assert_eq!(limiter.stats().total_accepted, 1_000);
        assert_eq!(limiter.stats().total_rejected, 99_000);
    }
}
