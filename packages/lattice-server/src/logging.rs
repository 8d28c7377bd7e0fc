//! Rate-limited logging.
//!
//! A hostile or broken client can produce the same warning thousands of
//! times per second; emitting each one floods the log backend and buries
//! real signals. [`RateLimitedLogger`] gates emissions per key inside a
//! rolling window and reports a single suppression summary when the
//! window turns over.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use lattice_core::ClockSource;
use parking_lot::Mutex;

/// Outcome of asking to log one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogDecision {
    /// Emit the event.
    Emit,
    /// Emit the event, prefixed by a summary of `suppressed` events
    /// dropped in the window that just rolled over.
    EmitWithSummary {
        /// Events suppressed in the finished window.
        suppressed: u64,
    },
    /// Drop the event; the per-window budget is spent.
    Suppress,
}

struct KeyWindow {
    window_start: u64,
    emitted: u32,
    suppressed: u64,
}

/// Per-key windowed log throttle.
pub struct RateLimitedLogger {
    windows: Mutex<HashMap<String, KeyWindow>>,
    window: Duration,
    max_per_window: u32,
    clock: Arc<dyn ClockSource>,
}

impl RateLimitedLogger {
    /// Creates a throttle allowing `max_per_window` emissions per key per
    /// `window`.
    #[must_use]
    pub fn new(window: Duration, max_per_window: u32, clock: Arc<dyn ClockSource>) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            window,
            max_per_window,
            clock,
        }
    }

    /// Decides whether an event for `key` may be emitted now.
    pub fn check(&self, key: &str) -> LogDecision {
        let now = self.clock.now();
        let window_ms = u64::try_from(self.window.as_millis()).unwrap_or(u64::MAX);
        let mut windows = self.windows.lock();

        let entry = windows.entry(key.to_string()).or_insert(KeyWindow {
            window_start: now,
            emitted: 0,
            suppressed: 0,
        });

        if now.saturating_sub(entry.window_start) >= window_ms {
            let suppressed = entry.suppressed;
            entry.window_start = now;
            entry.emitted = 1;
            entry.suppressed = 0;
            return if suppressed > 0 {
                LogDecision::EmitWithSummary { suppressed }
            } else {
                LogDecision::Emit
            };
        }

        if entry.emitted < self.max_per_window {
            entry.emitted += 1;
            LogDecision::Emit
        } else {
            entry.suppressed += 1;
            LogDecision::Suppress
        }
    }

    /// Emits a warning for `key` through `tracing`, subject to throttling.
    pub fn warn(&self, key: &str, message: &str) {
        match self.check(key) {
            LogDecision::Emit => tracing::warn!(key, "{message}"),
            LogDecision::EmitWithSummary { suppressed } => {
                tracing::warn!(key, suppressed, "{message} ({suppressed} similar suppressed)");
            }
            LogDecision::Suppress => {}
        }
    }

    /// Drops all per-key state.
    pub fn reset(&self) {
        self.windows.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    struct TestClock(Arc<AtomicU64>);
    impl ClockSource for TestClock {
        fn now(&self) -> u64 {
            self.0.load(Ordering::Relaxed)
        }
    }

    fn make(max: u32) -> (RateLimitedLogger, Arc<AtomicU64>) {
        let time = Arc::new(AtomicU64::new(1_000));
        let logger = RateLimitedLogger::new(
            Duration::from_secs(1),
            max,
            Arc::new(TestClock(time.clone())),
        );
        (logger, time)
    }

    #[test]
    fn emits_up_to_budget_then_suppresses() {
        let (logger, _) = make(3);
        for _ in 0..3 {
            assert_eq!(logger.check("k"), LogDecision::Emit);
        }
        for _ in 0..10 {
            assert_eq!(logger.check("k"), LogDecision::Suppress);
        }
    }

    #[test]
    fn window_roll_emits_single_summary() {
        let (logger, time) = make(1);
        assert_eq!(logger.check("k"), LogDecision::Emit);
        assert_eq!(logger.check("k"), LogDecision::Suppress);
        assert_eq!(logger.check("k"), LogDecision::Suppress);

        time.store(2_100, Ordering::Relaxed);
        assert_eq!(
            logger.check("k"),
            LogDecision::EmitWithSummary { suppressed: 2 }
        );
        // The summary was consumed; the next roll has nothing to report.
        time.store(3_200, Ordering::Relaxed);
        assert_eq!(logger.check("k"), LogDecision::Emit);
    }

    #[test]
    fn keys_are_throttled_independently() {
        let (logger, _) = make(1);
        assert_eq!(logger.check("a"), LogDecision::Emit);
        assert_eq!(logger.check("a"), LogDecision::Suppress);
        assert_eq!(logger.check("b"), LogDecision::Emit);
    }

    #[test]
    fn reset_forgets_history() {
        let (logger, _) = make(1);
        assert_eq!(logger.check("k"), LogDecision::Emit);
        assert_eq!(logger.check("k"), LogDecision::Suppress);
        logger.reset();
        assert_eq!(logger.check("k"), LogDecision::Emit);
    }
}
