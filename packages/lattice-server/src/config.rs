//! Node configuration.
//!
//! Everything is plain data with production defaults; nothing reads the
//! environment. Embedders build a [`NodeConfig`], adjust what they need,
//! and hand it to the bootstrap together with the injected collaborators
//! (storage adapter, authenticator, cluster transport).

use std::time::Duration;

use lattice_core::lww_map::DEFAULT_MAX_KEY_LEN;
use lattice_core::merkle::DEFAULT_DEPTH;
use lattice_core::partition::{DEFAULT_BACKUP_COUNT, PARTITION_COUNT};

/// Top-level configuration for one node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Unique node identifier; must not contain `:`.
    pub node_id: String,
    /// Number of partitions; must match every peer and client.
    pub partition_count: u32,
    /// Backup replicas per partition.
    pub backup_count: u32,
    /// Reject remote timestamps beyond the drift threshold instead of
    /// accepting them with a warning.
    pub strict_clock: bool,
    /// Clock drift threshold in milliseconds.
    pub max_drift_ms: u64,
    /// Maximum key length accepted by map mutations.
    pub max_key_len: usize,
    /// Merkle tree depth (fanout is fixed at 16).
    pub merkle_depth: usize,
    /// Maximum inbound frame length in bytes.
    pub max_frame_len: usize,
    /// Session and operation pipeline settings.
    pub session: SessionConfig,
    /// Connection admission control.
    pub admission: AdmissionConfig,
    /// Mutation journal settings.
    pub journal: JournalConfig,
    /// Striped executor settings.
    pub executor: ExecutorConfig,
    /// Tasklet scheduler settings.
    pub scheduler: SchedulerConfig,
    /// Per-connection write coalescing settings.
    pub writer: CoalesceConfig,
    /// Anti-entropy settings.
    pub sync: SyncConfig,
    /// Query engine settings.
    pub query: QueryConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "node-0".to_string(),
            partition_count: PARTITION_COUNT,
            backup_count: DEFAULT_BACKUP_COUNT,
            strict_clock: false,
            max_drift_ms: 60_000,
            max_key_len: DEFAULT_MAX_KEY_LEN,
            merkle_depth: DEFAULT_DEPTH,
            max_frame_len: lattice_core::frame::DEFAULT_MAX_FRAME_LEN,
            session: SessionConfig::default(),
            admission: AdmissionConfig::default(),
            journal: JournalConfig::default(),
            executor: ExecutorConfig::default(),
            scheduler: SchedulerConfig::default(),
            writer: CoalesceConfig::balanced(),
            sync: SyncConfig::default(),
            query: QueryConfig::default(),
        }
    }
}

/// Session pipeline settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Default per-operation timeout when the client does not set one.
    pub default_op_timeout_ms: u64,
    /// Maximum concurrent operations before load shedding.
    pub max_concurrent_ops: u32,
    /// Ops accepted per session per second (sliding window).
    pub ops_per_second: u32,
    /// Pending (unpersisted) ops above which new ops wait for capacity.
    pub max_pending_ops: usize,
    /// Every Nth accepted op forces a storage write-through.
    pub write_through_every: u64,
    /// Utilization of the pending-op budget above which write-throughs
    /// are forced randomly.
    pub early_force_utilization: f64,
    /// How long a write-concern waiter holds on before `WriteTimeout`.
    pub ack_timeout_ms: u64,
    /// Capacity of each session's outbound channel.
    pub outbound_channel_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_op_timeout_ms: 30_000,
            max_concurrent_ops: 1_000,
            ops_per_second: 5_000,
            max_pending_ops: 10_000,
            write_through_every: 64,
            early_force_utilization: 0.75,
            ack_timeout_ms: 5_000,
            outbound_channel_capacity: 256,
        }
    }
}

/// Connection admission control settings.
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// New connections admitted per second.
    pub max_connections_per_second: u32,
    /// Connections allowed to sit in the handshake at once.
    pub max_pending_connections: u32,
    /// Admission window length.
    pub window: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_connections_per_second: 500,
            max_pending_connections: 1_000,
            window: Duration::from_secs(1),
        }
    }
}

/// Mutation journal settings.
#[derive(Debug, Clone)]
pub struct JournalConfig {
    /// In-memory ring capacity.
    pub capacity: usize,
    /// Flush the durable tail at least this often.
    pub persist_interval: Duration,
    /// Flush as soon as this many events are pending.
    pub persist_batch_size: usize,
    /// Drop persisted rows older than this.
    pub retention: Duration,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            capacity: 100_000,
            persist_interval: Duration::from_millis(500),
            persist_batch_size: 512,
            retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// Striped executor settings.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Number of stripes; tasks hash to a stripe by key.
    pub stripes: usize,
    /// Bounded queue capacity per stripe.
    pub queue_capacity: usize,
    /// Queue depth at which a high-water notification fires.
    pub high_water_mark: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            stripes: 8,
            queue_capacity: 1_024,
            high_water_mark: 768,
        }
    }
}

/// Tasklet scheduler settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum concurrently active tasklets; excess submissions queue.
    pub max_active: usize,
    /// Per-tasklet time budget inside one tick.
    pub tasklet_budget: Duration,
    /// Wall-clock cap for one whole tick.
    pub tick_budget: Duration,
    /// Delay between ticks, leaving the I/O loop room to run.
    pub tick_interval: Duration,
    /// Items an iterating tasklet processes per `run()` slice.
    pub items_per_slice: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_active: 64,
            tasklet_budget: Duration::from_millis(1),
            tick_budget: Duration::from_millis(10),
            tick_interval: Duration::from_millis(2),
            items_per_slice: 256,
        }
    }
}

/// Write coalescing limits for one connection.
#[derive(Debug, Clone)]
pub struct CoalesceConfig {
    /// Flush once this many messages are buffered.
    pub max_batch_count: usize,
    /// Flush once the buffered frames reach this many bytes.
    pub max_batch_bytes: usize,
    /// Flush this long after the first buffered message at the latest.
    pub max_delay: Duration,
}

impl CoalesceConfig {
    /// Small batches, low latency.
    #[must_use]
    pub fn conservative() -> Self {
        Self {
            max_batch_count: 16,
            max_batch_bytes: 4 * 1024,
            max_delay: Duration::from_millis(2),
        }
    }

    /// The default trade-off.
    #[must_use]
    pub fn balanced() -> Self {
        Self {
            max_batch_count: 64,
            max_batch_bytes: 32 * 1024,
            max_delay: Duration::from_millis(5),
        }
    }

    /// Larger batches for fan-out heavy workloads.
    #[must_use]
    pub fn high_throughput() -> Self {
        Self {
            max_batch_count: 256,
            max_batch_bytes: 128 * 1024,
            max_delay: Duration::from_millis(10),
        }
    }

    /// Maximum batching; latency subordinate to throughput.
    #[must_use]
    pub fn aggressive() -> Self {
        Self {
            max_batch_count: 1_024,
            max_batch_bytes: 512 * 1024,
            max_delay: Duration::from_millis(25),
        }
    }
}

/// Anti-entropy settings.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// A peer whose last sync is older than this must take a full push;
    /// tombstones it missed may already be garbage collected.
    pub gc_max_age: Duration,
    /// How far back the tombstone pruner reaches.
    pub prune_horizon: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            gc_max_age: Duration::from_secs(24 * 3600),
            prune_horizon: Duration::from_secs(24 * 3600),
        }
    }
}

/// Query engine settings.
#[derive(Debug, Clone)]
pub struct QueryConfig {
    /// Page size when the query does not set a limit.
    pub default_limit: u32,
    /// Hard cap on page size.
    pub max_limit: u32,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_limit: 100,
            max_limit: 10_000,
        }
    }
}
