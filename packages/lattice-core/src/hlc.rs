//! Hybrid Logical Clock (HLC) for distributed causality tracking.
//!
//! Produces monotonically increasing timestamps that combine physical
//! wall-clock time with a logical counter, giving a total order of events
//! across nodes that is consistent with happens-before. The HLC feeds every
//! LWW and OR-set merge decision.
//!
//! # Wire format
//!
//! Timestamps travel either as the three-field struct or as the compact
//! string form `"physical:counter:nodeId"`. Node IDs must not contain `:`;
//! [`Hlc::new`] enforces this at construction.

use std::cmp::Ordering;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// A hybrid logical timestamp: physical time, logical counter, node identity.
///
/// Ordering compares `physical_millis`, then `counter`, then `node_id`
/// (lexicographic byte order), yielding a total order across all replicas.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timestamp {
    /// Physical wall-clock milliseconds since the Unix epoch.
    pub physical_millis: u64,
    /// Logical counter disambiguating events within one millisecond.
    pub counter: u32,
    /// Identifier of the node that issued this timestamp.
    pub node_id: String,
}

impl Timestamp {
    /// Builds a timestamp from its parts. Convenience for tests and fixtures.
    #[must_use]
    pub fn new(physical_millis: u64, counter: u32, node_id: impl Into<String>) -> Self {
        Self {
            physical_millis,
            counter,
            node_id: node_id.into(),
        }
    }

    /// Parses the string form `"physical:counter:nodeId"`.
    ///
    /// # Errors
    ///
    /// Returns [`HlcError::Parse`] when the input does not have three
    /// colon-separated parts, the numeric parts do not parse, or the node ID
    /// is empty.
    pub fn parse(s: &str) -> Result<Self, HlcError> {
        let parts: Vec<&str> = s.splitn(3, ':').collect();
        if parts.len() != 3 {
            return Err(HlcError::Parse {
                input: s.to_string(),
            });
        }

        let physical_millis = parts[0].parse::<u64>().map_err(|_| HlcError::Parse {
            input: s.to_string(),
        })?;
        let counter = parts[1].parse::<u32>().map_err(|_| HlcError::Parse {
            input: s.to_string(),
        })?;
        let node_id = parts[2];

        if node_id.is_empty() {
            return Err(HlcError::Parse {
                input: s.to_string(),
            });
        }

        Ok(Self {
            physical_millis,
            counter,
            node_id: node_id.to_string(),
        })
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.physical_millis
            .cmp(&other.physical_millis)
            .then_with(|| self.counter.cmp(&other.counter))
            .then_with(|| self.node_id.cmp(&other.node_id))
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.physical_millis, self.counter, self.node_id)
    }
}

/// Errors produced by clock operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HlcError {
    /// A remote timestamp exceeded the drift threshold in strict mode.
    #[error(
        "clock skew: remote time {remote_millis} is {drift_ms}ms ahead of local \
         {local_millis} (threshold {max_drift_ms}ms)"
    )]
    ClockSkew {
        /// The offending remote physical time.
        remote_millis: u64,
        /// Local wall-clock reading at the time of the check.
        local_millis: u64,
        /// Observed positive drift in milliseconds.
        drift_ms: u64,
        /// Configured drift threshold.
        max_drift_ms: u64,
    },
    /// A timestamp string did not match `"physical:counter:nodeId"`.
    #[error("invalid timestamp string: {input:?}")]
    Parse {
        /// The rejected input.
        input: String,
    },
}

/// Abstraction over the system clock for dependency injection.
///
/// Deterministic tests swap in a controlled clock; production uses
/// [`SystemClock`]. The same source also drives TTL expiry checks in the
/// CRDT maps.
pub trait ClockSource: Send + Sync {
    /// Current time as milliseconds since the Unix epoch.
    fn now(&self) -> u64;
}

/// Default clock source reading real system time.
#[derive(Debug, Clone)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    #[allow(clippy::cast_possible_truncation)] // millis since epoch fit u64 for ~584M years
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before Unix epoch")
            .as_millis() as u64
    }
}

/// Hybrid Logical Clock.
///
/// [`Hlc::now`] issues strictly increasing timestamps; [`Hlc::update`]
/// merges a remote timestamp into local state so that subsequent local
/// timestamps dominate everything seen so far.
///
/// # Drift policy
///
/// A remote timestamp more than `max_drift_ms` ahead of the local wall
/// clock is rejected with [`HlcError::ClockSkew`] in strict mode; in
/// non-strict mode it is logged and accepted (AP behavior).
pub struct Hlc {
    last_physical: u64,
    last_counter: u32,
    node_id: String,
    strict: bool,
    max_drift_ms: u64,
    clock: Box<dyn ClockSource>,
}

/// Default drift tolerance before the policy triggers.
pub const DEFAULT_MAX_DRIFT_MS: u64 = 60_000;

impl Hlc {
    /// Creates a clock for `node_id` in non-strict mode with the default
    /// drift threshold.
    ///
    /// # Panics
    ///
    /// Panics if `node_id` contains `:` (reserved as the string-form field
    /// delimiter) or is empty.
    #[must_use]
    pub fn new(node_id: impl Into<String>, clock: Box<dyn ClockSource>) -> Self {
        Self::with_options(node_id, clock, false, DEFAULT_MAX_DRIFT_MS)
    }

    /// Creates a clock with explicit strictness and drift threshold.
    ///
    /// # Panics
    ///
    /// Panics if `node_id` contains `:` or is empty.
    #[must_use]
    pub fn with_options(
        node_id: impl Into<String>,
        clock: Box<dyn ClockSource>,
        strict: bool,
        max_drift_ms: u64,
    ) -> Self {
        let node_id = node_id.into();
        assert!(
            !node_id.is_empty() && !node_id.contains(':'),
            "node id must be non-empty and must not contain ':': {node_id:?}"
        );
        Self {
            last_physical: 0,
            last_counter: 0,
            node_id,
            strict,
            max_drift_ms,
            clock,
        }
    }

    /// The node ID stamped onto issued timestamps.
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Whether excessive drift fails instead of warning.
    #[must_use]
    pub fn strict(&self) -> bool {
        self.strict
    }

    /// Configured drift threshold in milliseconds.
    #[must_use]
    pub fn max_drift_ms(&self) -> u64 {
        self.max_drift_ms
    }

    /// The injected clock source. The CRDT maps read it for TTL checks.
    #[must_use]
    pub fn clock_source(&self) -> &dyn ClockSource {
        &*self.clock
    }

    /// Issues a fresh timestamp for a local event.
    ///
    /// Strictly greater than every timestamp previously issued or merged on
    /// this clock: the counter resets when the wall clock advances past the
    /// logical time and increments otherwise.
    pub fn now(&mut self) -> Timestamp {
        let wall = self.clock.now();

        if wall > self.last_physical {
            self.last_physical = wall;
            self.last_counter = 0;
        } else {
            self.last_counter += 1;
        }

        Timestamp {
            physical_millis: self.last_physical,
            counter: self.last_counter,
            node_id: self.node_id.clone(),
        }
    }

    /// Merges a remote timestamp into the local clock state.
    ///
    /// Called for every message received from another node. After the call,
    /// the next [`Hlc::now`] result is greater than both the local history
    /// and `remote`.
    ///
    /// # Errors
    ///
    /// In strict mode, returns [`HlcError::ClockSkew`] when the remote
    /// physical time exceeds local wall time by more than the threshold.
    /// Non-strict mode logs a warning and accepts the timestamp.
    pub fn update(&mut self, remote: &Timestamp) -> Result<(), HlcError> {
        let wall = self.clock.now();

        // Only positive drift (remote ahead of local) is policed.
        if remote.physical_millis > wall {
            let drift = remote.physical_millis - wall;
            if drift > self.max_drift_ms {
                if self.strict {
                    return Err(HlcError::ClockSkew {
                        remote_millis: remote.physical_millis,
                        local_millis: wall,
                        drift_ms: drift,
                        max_drift_ms: self.max_drift_ms,
                    });
                }
                tracing::warn!(
                    drift_ms = drift,
                    remote_millis = remote.physical_millis,
                    local_millis = wall,
                    max_drift_ms = self.max_drift_ms,
                    "accepting remote timestamp beyond drift threshold"
                );
            }
        }

        let max_physical = self
            .last_physical
            .max(wall)
            .max(remote.physical_millis);

        if max_physical == self.last_physical && max_physical == remote.physical_millis {
            // Same logical millisecond on both sides: take max counter + 1.
            self.last_counter = self.last_counter.max(remote.counter) + 1;
        } else if max_physical == self.last_physical {
            // Local logical clock is ahead.
            self.last_counter += 1;
        } else if max_physical == remote.physical_millis {
            // Remote clock is ahead: fast-forward.
            self.last_counter = remote.counter + 1;
        } else {
            // Wall clock is ahead of both.
            self.last_counter = 0;
        }

        self.last_physical = max_physical;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    use super::ClockSource;

    /// Deterministic clock source whose time is advanced explicitly.
    pub struct ManualClock {
        time: Arc<AtomicU64>,
    }

    impl ManualClock {
        pub fn new(initial: u64) -> (Self, Arc<AtomicU64>) {
            let time = Arc::new(AtomicU64::new(initial));
            (Self { time: time.clone() }, time)
        }
    }

    impl ClockSource for ManualClock {
        fn now(&self) -> u64 {
            self.time.load(Ordering::Relaxed)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering as AtomicOrdering;

    use super::test_support::ManualClock;
    use super::*;

    fn fixed_hlc(node: &str, time: u64) -> Hlc {
        let (clock, _) = ManualClock::new(time);
        Hlc::new(node, Box::new(clock))
    }

    // ---- Timestamp ordering ----

    #[test]
    fn ordering_physical_dominates() {
        let a = Timestamp::new(100, 5, "z");
        let b = Timestamp::new(200, 0, "a");
        assert!(a < b);
    }

    #[test]
    fn ordering_counter_breaks_physical_ties() {
        let a = Timestamp::new(100, 1, "z");
        let b = Timestamp::new(100, 2, "a");
        assert!(a < b);
    }

    #[test]
    fn ordering_node_id_breaks_full_ties() {
        let a = Timestamp::new(100, 1, "a");
        let b = Timestamp::new(100, 1, "b");
        assert!(a < b);
        assert_eq!(
            Timestamp::new(100, 1, "n").cmp(&Timestamp::new(100, 1, "n")),
            std::cmp::Ordering::Equal
        );
    }

    // ---- now() ----

    #[test]
    fn now_is_strictly_increasing() {
        let mut hlc = fixed_hlc("n1", 1_000_000);
        let mut prev = hlc.now();
        for _ in 0..100 {
            let next = hlc.now();
            assert!(prev < next);
            prev = next;
        }
    }

    #[test]
    fn now_increments_counter_on_frozen_clock() {
        let mut hlc = fixed_hlc("n1", 1_000_000);
        let a = hlc.now();
        let b = hlc.now();
        assert_eq!((a.physical_millis, a.counter), (1_000_000, 0));
        assert_eq!((b.physical_millis, b.counter), (1_000_000, 1));
    }

    #[test]
    fn now_resets_counter_when_clock_advances() {
        let (clock, time) = ManualClock::new(1_000_000);
        let mut hlc = Hlc::new("n1", Box::new(clock));

        let a = hlc.now();
        time.store(1_000_001, AtomicOrdering::Relaxed);
        let b = hlc.now();

        assert_eq!(a.counter, 0);
        assert_eq!((b.physical_millis, b.counter), (1_000_001, 0));
    }

    // ---- update() merge cases ----

    #[test]
    fn update_fast_forwards_to_remote() {
        let mut hlc = fixed_hlc("n1", 1_000_000);
        let remote = Timestamp::new(1_000_100, 5, "peer");

        hlc.update(&remote).unwrap();
        let ts = hlc.now();

        assert_eq!(ts.physical_millis, 1_000_100);
        // remote.counter + 1 from update, then + 1 from now().
        assert_eq!(ts.counter, 7);
    }

    #[test]
    fn update_same_millisecond_takes_max_counter() {
        let mut hlc = fixed_hlc("n1", 1_000_000);
        hlc.now(); // local at (1_000_000, 0)

        hlc.update(&Timestamp::new(1_000_000, 5, "peer")).unwrap();
        let ts = hlc.now();

        assert_eq!(ts.physical_millis, 1_000_000);
        assert_eq!(ts.counter, 7); // max(0,5)+1 then +1
    }

    #[test]
    fn update_keeps_local_when_ahead() {
        let mut hlc = fixed_hlc("n1", 1_000_100);
        hlc.now();

        hlc.update(&Timestamp::new(1_000_000, 10, "peer")).unwrap();
        assert_eq!(hlc.now().physical_millis, 1_000_100);
    }

    #[test]
    fn update_resets_counter_when_wall_clock_ahead() {
        let mut hlc = fixed_hlc("n1", 1_000_200);
        hlc.update(&Timestamp::new(1_000_100, 5, "peer")).unwrap();
        let ts = hlc.now();
        assert_eq!((ts.physical_millis, ts.counter), (1_000_200, 1));
    }

    // ---- string form ----

    #[test]
    fn display_matches_wire_form() {
        let ts = Timestamp::new(1_234_567_890, 42, "my-node");
        assert_eq!(ts.to_string(), "1234567890:42:my-node");
    }

    #[test]
    fn parse_roundtrip() {
        let original = Timestamp::new(9_999_999_999_999, 1000, "node-123");
        let parsed = Timestamp::parse(&original.to_string()).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn parse_rejects_malformed_input() {
        for bad in ["", "invalid", "123:456", "123:456:", "x:0:node", "1:y:node"] {
            assert!(Timestamp::parse(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn parse_preserves_dashes_in_node_id() {
        let ts = Timestamp::parse("100:0:node-with-dashes").unwrap();
        assert_eq!(ts.node_id, "node-with-dashes");
    }

    // ---- drift policy ----

    #[test]
    fn strict_mode_rejects_excessive_drift() {
        let (clock, _) = ManualClock::new(1_000_000);
        let mut hlc = Hlc::with_options("strict", Box::new(clock), true, 5_000);

        let err = hlc
            .update(&Timestamp::new(1_010_000, 0, "peer"))
            .unwrap_err();
        assert_eq!(
            err,
            HlcError::ClockSkew {
                remote_millis: 1_010_000,
                local_millis: 1_000_000,
                drift_ms: 10_000,
                max_drift_ms: 5_000,
            }
        );
    }

    #[test]
    fn strict_mode_accepts_drift_within_threshold() {
        let (clock, _) = ManualClock::new(1_000_000);
        let mut hlc = Hlc::with_options("strict", Box::new(clock), true, 10_000);

        assert!(hlc.update(&Timestamp::new(1_005_000, 0, "peer")).is_ok());
        assert_eq!(hlc.now().physical_millis, 1_005_000);
    }

    #[test]
    fn non_strict_mode_accepts_any_drift() {
        let mut hlc = fixed_hlc("lax", 1_000_000);
        assert!(hlc.update(&Timestamp::new(1_100_000, 0, "peer")).is_ok());
        assert_eq!(hlc.now().physical_millis, 1_100_000);
    }

    #[test]
    fn negative_drift_never_rejected() {
        let (clock, _) = ManualClock::new(1_000_000);
        let mut hlc = Hlc::with_options("strict", Box::new(clock), true, 5_000);
        assert!(hlc.update(&Timestamp::new(900_000, 0, "peer")).is_ok());
    }

    // ---- construction guards ----

    #[test]
    #[should_panic(expected = "must not contain ':'")]
    fn node_id_with_colon_panics() {
        let (clock, _) = ManualClock::new(0);
        let _ = Hlc::new("bad:id", Box::new(clock));
    }

    #[test]
    #[should_panic(expected = "non-empty")]
    fn empty_node_id_panics() {
        let (clock, _) = ManualClock::new(0);
        let _ = Hlc::new("", Box::new(clock));
    }

    // ---- cross-node causality ----

    #[test]
    fn receiving_node_dominates_sender() {
        let mut a = fixed_hlc("node-a", 1_000_000);
        let mut b = fixed_hlc("node-b", 1_000_000);

        a.now();
        let sent = a.now();
        b.update(&sent).unwrap();
        let received = b.now();

        assert!(sent < received);
    }

    #[test]
    fn bidirectional_exchange_stays_ordered() {
        let mut a = fixed_hlc("node-a", 1_000_000);
        let mut b = fixed_hlc("node-b", 1_000_000);

        let m1 = a.now();
        b.update(&m1).unwrap();
        let m2 = b.now();
        a.update(&m2).unwrap();
        let m3 = a.now();

        assert!(m1 < m2);
        assert!(m2 < m3);
    }

    #[test]
    fn concurrent_nodes_totally_ordered_by_node_id() {
        let mut a = fixed_hlc("node-a", 1_000_000);
        let mut b = fixed_hlc("node-b", 1_000_000);
        let ta = a.now();
        let tb = b.now();
        assert_eq!(ta.physical_millis, tb.physical_millis);
        assert_eq!(ta.counter, tb.counter);
        assert!(ta < tb);
    }
}
