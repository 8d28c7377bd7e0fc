//! The operation pipeline.
//!
//! Every accepted mutation walks the same stations, in order: per-session
//! rate admission, backpressure, interceptors, the security policy, the
//! map's conflict resolvers, the CRDT apply (serialized on the map's
//! executor stripe together with index maintenance), the journal append,
//! persistence under the requested write concern, and finally broadcast
//! to subscribers and replica fan-out. Cluster-forwarded ops skip the
//! client-facing stations (rate, interceptors, policy, resolvers) and
//! are never fanned out again, which is what keeps replication loops
//! impossible.

use std::sync::Arc;
use std::time::Duration;

use lattice_core::messages::{
    ClientOpPayload, EventKind, OpType, ServerEventPayload, WriteConcern,
};
use lattice_core::types::{StorageValue, Value};
use lattice_core::{ClockSource, MapKind, Timestamp};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::cluster::ClusterCoordinator;
use crate::config::SessionConfig;
use crate::error::ServerError;
use crate::executor::StripedExecutor;
use crate::journal::EventJournal;
use crate::maps::{MapRegistry, MapState};
use crate::query::IndexRegistry;
use crate::resolver::{ConflictResolvers, Resolution, ResolutionContext};
use crate::security::{Action, PolicyEngine};
use crate::storage::{StorageAdapter, StoreRetryQueue};

use super::interceptor::{OpInterceptor, OpOutcome};
use super::write_concern::{quorum_of, AckTracker};
use super::{BackpressureRegulator, Session, SessionId, SessionRegistry};

/// Storage slot holding an OR map's tombstone set.
pub const OR_TOMBSTONES_KEY: &str = "__or_tombstones__";

/// Where an operation entered this node.
#[derive(Debug, Clone)]
pub enum OpOrigin {
    /// Directly from a client session.
    Client {
        /// The originating session, excluded from broadcast.
        session_id: SessionId,
    },
    /// Forwarded by a peer; never fanned out again.
    Cluster {
        /// The node that first accepted the op.
        origin_node: String,
    },
}

/// Everything the pipeline is built from.
pub struct PipelineParts {
    /// This node's id.
    pub node_id: String,
    /// Session-pipeline settings.
    pub config: SessionConfig,
    /// Wall clock for drift checks and journal stamps.
    pub clock: Arc<dyn ClockSource>,
    /// Reject client timestamps beyond the drift threshold.
    pub strict_clock: bool,
    /// Drift threshold in milliseconds.
    pub max_drift_ms: u64,
    /// CRDT maps.
    pub maps: Arc<MapRegistry>,
    /// Mutation journal.
    pub journal: Arc<EventJournal>,
    /// Durable storage.
    pub storage: Arc<dyn StorageAdapter>,
    /// Write-behind retry queue for storage failures.
    pub retry: Arc<StoreRetryQueue>,
    /// Security policies.
    pub policy: Arc<PolicyEngine>,
    /// Conflict resolvers.
    pub resolvers: Arc<ConflictResolvers>,
    /// Backpressure regulator.
    pub backpressure: Arc<BackpressureRegulator>,
    /// Pending-ack tracker for replicated write concerns.
    pub acks: Arc<AckTracker>,
    /// Cluster coordinator for fan-out and routing.
    pub cluster: Arc<ClusterCoordinator>,
    /// Striped executor serializing per-map mutations.
    pub executor: Arc<StripedExecutor>,
    /// Value indexes.
    pub indexes: Arc<IndexRegistry>,
    /// Session registry for broadcast.
    pub sessions: Arc<SessionRegistry>,
}

/// What one stripe-side apply produced.
struct Applied {
    op_id: String,
    changed: bool,
    preferred_local: bool,
    event: Option<ServerEventPayload>,
    journal_kind: Option<EventKind>,
    previous_value: Option<Value>,
    new_value: Option<Value>,
    timestamp: Timestamp,
    storage_writes: Vec<(String, StorageValue)>,
}

/// The mutation pipeline.
pub struct OpPipeline {
    parts: PipelineParts,
    interceptors: RwLock<Vec<Arc<dyn OpInterceptor>>>,
    /// Load shed: ops beyond this many in flight are rejected outright
    /// rather than queued.
    concurrency: Arc<tokio::sync::Semaphore>,
}

impl OpPipeline {
    /// Assembles the pipeline.
    #[must_use]
    pub fn new(parts: PipelineParts) -> Self {
        let concurrency = Arc::new(tokio::sync::Semaphore::new(
            parts.config.max_concurrent_ops as usize,
        ));
        Self {
            parts,
            interceptors: RwLock::new(Vec::new()),
            concurrency,
        }
    }

    /// Appends an interceptor; ordering is registration order.
    pub fn add_interceptor(&self, interceptor: Arc<dyn OpInterceptor>) {
        self.interceptors.write().push(interceptor);
    }

    /// The pending-ack tracker (the cluster inbound path records acks).
    #[must_use]
    pub fn acks(&self) -> &Arc<AckTracker> {
        &self.parts.acks
    }

    /// The backpressure regulator, for stats surfaces.
    #[must_use]
    pub fn backpressure(&self) -> &Arc<BackpressureRegulator> {
        &self.parts.backpressure
    }

    /// The storage adapter the pipeline persists through.
    #[must_use]
    pub fn storage_handle(&self) -> Arc<dyn StorageAdapter> {
        self.parts.storage.clone()
    }

    /// Runs a client operation through the full pipeline.
    ///
    /// # Errors
    ///
    /// Any station may fail; the session layer maps the error onto the
    /// wire and decides whether the session survives.
    pub async fn handle_client_op(
        &self,
        session: &Arc<Session>,
        op: ClientOpPayload,
    ) -> Result<OpOutcome, ServerError> {
        // 1. Admission: load shed, per-session rate, global pending budget.
        let Ok(_concurrency_permit) = self.concurrency.clone().try_acquire_owned() else {
            metrics::counter!("lattice_ops_shed_total").increment(1);
            return Err(ServerError::Overloaded);
        };
        if !session.admit_op(self.parts.config.ops_per_second) {
            return Err(ServerError::RateLimited(format!(
                "session exceeds {} ops/s",
                self.parts.config.ops_per_second
            )));
        }
        let timeout = Duration::from_millis(
            op.timeout_ms
                .unwrap_or(self.parts.config.default_op_timeout_ms),
        );
        let _permit = self.parts.backpressure.admit(timeout).await?;
        let force_write_through = self.parts.backpressure.on_accept();

        let principal = session.principal();

        // 2. Interceptors, in order.
        let mut op = op;
        for interceptor in self.interceptors.read().iter() {
            match interceptor.before_op(principal.as_ref(), op) {
                Ok(Some(next)) => op = next,
                Ok(None) => return Ok(OpOutcome::Dropped),
                Err(reason) => {
                    return Err(ServerError::Malformed(reason));
                }
            }
        }

        // 3. Security policy.
        if let Some(principal) = &principal {
            let action = match op.op_type {
                OpType::Put | OpType::OrAdd => Action::Put,
                OpType::Remove | OpType::OrRemove => Action::Remove,
            };
            let fields = touched_fields(&op);
            self.parts
                .policy
                .check(principal, &op.map_name, action, &fields)
                .map_err(ServerError::PermissionDenied)?;
        }

        // 4. Strict clock policy on the client-supplied timestamp.
        self.check_drift(&op)?;

        // 5 & 6. Resolver + CRDT apply + journal + persistence + fan-out,
        // all under the operation's deadline.
        let started = std::time::Instant::now();
        let outcome = match tokio::time::timeout(
            timeout,
            self.apply_and_settle(
                op.clone(),
                OpOrigin::Client {
                    session_id: session.id(),
                },
                force_write_through,
                principal.clone(),
            ),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_elapsed) => Err(ServerError::Cancelled),
        };
        metrics::histogram!("lattice_op_duration_seconds").record(started.elapsed().as_secs_f64());

        // 7. After-op interceptors observe the outcome (errors included).
        let reported = match &outcome {
            Ok(outcome) => outcome.clone(),
            Err(err) => OpOutcome::Rejected {
                reason: err.to_string(),
            },
        };
        for interceptor in self.interceptors.read().iter() {
            interceptor.after_op(principal.as_ref(), &op, &reported);
        }

        outcome
    }

    /// Applies a cluster-forwarded operation: no client-facing stations,
    /// no re-fan-out; broadcast reaches local subscribers only.
    ///
    /// # Errors
    ///
    /// Propagates apply failures (malformed forwards, storage when
    /// demanded).
    pub async fn handle_cluster_op(
        &self,
        origin_node: &str,
        op: ClientOpPayload,
    ) -> Result<OpOutcome, ServerError> {
        self.apply_and_settle(
            op,
            OpOrigin::Cluster {
                origin_node: origin_node.to_string(),
            },
            false,
            None,
        )
        .await
    }

    async fn apply_and_settle(
        &self,
        op: ClientOpPayload,
        origin: OpOrigin,
        force_write_through: bool,
        principal: Option<lattice_core::Principal>,
    ) -> Result<OpOutcome, ServerError> {
        let is_client = matches!(origin, OpOrigin::Client { .. });
        let concern = op.write_concern.unwrap_or_default();

        // CRDT apply, serialized per map on its executor stripe; the
        // conflict resolver runs inside the same critical section so its
        // view of the local value is the value the merge will see.
        let applied = {
            let maps = self.parts.maps.clone();
            let indexes = self.parts.indexes.clone();
            let resolvers = self.parts.resolvers.clone();
            let check_resolvers = is_client;
            let stripe_key = op.map_name.clone();
            let op = op.clone();
            self.parts
                .executor
                .execute(&stripe_key, move || {
                    apply_on_stripe(&maps, &indexes, &resolvers, check_resolvers, principal, op)
                })
                .await
                .map_err(|e| ServerError::Internal(anyhow::anyhow!(e)))??
        };

        if applied.preferred_local {
            return Ok(OpOutcome::PreferredLocal);
        }

        // Journal: every accepted mutation, exactly once, unless we are
        // replaying history.
        if applied.changed && !self.parts.journal.is_loading() {
            let mut metadata = std::collections::BTreeMap::new();
            if let OpOrigin::Cluster { origin_node } = &origin {
                metadata.insert("fromCluster".to_string(), "true".to_string());
                metadata.insert("originNode".to_string(), origin_node.clone());
            }
            if let Some(kind) = applied.journal_kind {
                self.parts.journal.record(
                    kind,
                    &op.map_name,
                    &op.key,
                    applied.new_value.clone(),
                    applied.previous_value.clone(),
                    applied.timestamp.clone(),
                    &self.parts.node_id,
                    (!metadata.is_empty()).then_some(metadata),
                );
            }
        }

        // Persistence. No write concern level requires storage, so
        // failures park in the retry queue instead of failing the op.
        self.persist(&op.map_name, applied.storage_writes.clone(), force_write_through)
            .await;

        // Replication per write concern (client-origin ops only; a
        // forwarded op is already part of its origin's replication).
        let mut achieved = WriteConcern::Local;
        if is_client {
            let replicas = self.parts.cluster.replicas_for_key(&op.key);
            let replica_count = replicas.len().max(1);
            let required = match concern {
                WriteConcern::Local => 1,
                WriteConcern::Quorum => quorum_of(replica_count),
                WriteConcern::All => replica_count,
            };

            if required > 1 {
                let rx = self
                    .parts
                    .acks
                    .register(&applied.op_id, required, &self.parts.node_id);
                let mut forwarded = op.clone();
                forwarded.id = Some(applied.op_id.clone());
                self.parts.cluster.fan_out(&forwarded).await;
                let timeout = Duration::from_millis(self.parts.config.ack_timeout_ms);
                self.parts.acks.wait(&applied.op_id, rx, timeout).await?;
                achieved = concern;
            } else {
                // LOCAL (or a single-replica cluster): fan out without
                // waiting for replica acks.
                let mut forwarded = op.clone();
                forwarded.id = Some(applied.op_id.clone());
                self.parts.cluster.fan_out(&forwarded).await;
            }
        }

        // Broadcast to local subscribers, origin session excluded.
        if applied.changed {
            if let Some(event) = &applied.event {
                let exclude = match &origin {
                    OpOrigin::Client { session_id } => Some(*session_id),
                    OpOrigin::Cluster { .. } => None,
                };
                self.parts.sessions.broadcast_event(event, exclude).await;
            }
        }

        metrics::counter!("lattice_ops_applied_total").increment(1);
        Ok(OpOutcome::Applied {
            achieved,
            changed: applied.changed,
        })
    }

    async fn persist(
        &self,
        map_name: &str,
        writes: Vec<(String, StorageValue)>,
        force: bool,
    ) {
        if writes.is_empty() {
            return;
        }
        if force {
            for (key, value) in writes {
                if let Err(err) = self.parts.storage.store(map_name, &key, value.clone()).await {
                    tracing::warn!(map_name, key, %err, "write-through failed, parked for retry");
                    self.parts.retry.enqueue(map_name, &key, value);
                }
            }
        } else {
            let storage = self.parts.storage.clone();
            let retry = self.parts.retry.clone();
            let map_name = map_name.to_string();
            tokio::spawn(async move {
                for (key, value) in writes {
                    if let Err(err) = storage.store(&map_name, &key, value.clone()).await {
                        tracing::debug!(map_name, key, %err, "async persist failed, parked for retry");
                        retry.enqueue(&map_name, &key, value);
                    }
                }
            });
        }
    }

    fn check_drift(&self, op: &ClientOpPayload) -> Result<(), ServerError> {
        if !self.parts.strict_clock {
            return Ok(());
        }
        let stamp = op
            .record
            .as_ref()
            .map(|r| &r.timestamp)
            .or(op.or_record.as_ref().map(|r| &r.timestamp))
            .or(op.timestamp.as_ref());
        let Some(stamp) = stamp else {
            return Ok(());
        };
        let now = self.parts.clock.now();
        if stamp.physical_millis > now {
            let drift = stamp.physical_millis - now;
            if drift > self.parts.max_drift_ms {
                return Err(ServerError::ClockSkew(lattice_core::HlcError::ClockSkew {
                    remote_millis: stamp.physical_millis,
                    local_millis: now,
                    drift_ms: drift,
                    max_drift_ms: self.parts.max_drift_ms,
                }));
            }
        }
        Ok(())
    }
}

/// The stripe-side critical section: resolver, merge, indexes.
#[allow(clippy::too_many_lines)]
fn apply_on_stripe(
    maps: &MapRegistry,
    indexes: &IndexRegistry,
    resolvers: &ConflictResolvers,
    check_resolvers: bool,
    principal: Option<lattice_core::Principal>,
    op: ClientOpPayload,
) -> Result<Applied, ServerError> {
    let op_id = op
        .id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let fallback_kind = match op.op_type {
        OpType::Put | OpType::Remove => MapKind::Lww,
        OpType::OrAdd | OpType::OrRemove => MapKind::Or,
    };
    let map = maps.get_or_create(&op.map_name, fallback_kind);

    match (map.state(), op.op_type) {
        (MapState::Lww(lww), OpType::Put | OpType::Remove) => {
            let mut guard = lww.write();
            let previous_value = guard.get(&op.key).cloned();

            let incoming_record = match (op.op_type, op.record.clone()) {
                (OpType::Put, Some(record)) => record,
                (OpType::Put, None) => {
                    return Err(ServerError::Malformed(
                        "PUT requires a record".to_string(),
                    ));
                }
                (OpType::Remove, Some(record)) if record.is_tombstone() => record,
                // A remove without a record (or with a non-tombstone one)
                // is stamped locally.
                (OpType::Remove, _) => {
                    let tombstone = guard.remove(&op.key)?;
                    let new_visible = guard.get(&op.key).cloned();
                    drop(guard);
                    indexes.apply_write(&op.map_name, &op.key, previous_value.as_ref(), None);
                    let timestamp = tombstone.timestamp.clone();
                    return Ok(Applied {
                        op_id,
                        changed: true,
                        preferred_local: false,
                        event: Some(ServerEventPayload {
                            map_name: op.map_name.clone(),
                            event_kind: EventKind::Delete,
                            key: op.key.clone(),
                            record: Some(tombstone.clone()),
                            or_record: None,
                            or_tag: None,
                        }),
                        journal_kind: Some(EventKind::Delete),
                        previous_value,
                        new_value: new_visible,
                        timestamp,
                        storage_writes: vec![(
                            op.key.clone(),
                            StorageValue::Lww { record: tombstone },
                        )],
                    });
                }
                (OpType::OrAdd | OpType::OrRemove, _) => {
                    unreachable!("outer match already restricted op_type to Put | Remove")
                }
            };

            if check_resolvers {
                let ctx = ResolutionContext {
                    map_name: &op.map_name,
                    key: &op.key,
                    local: previous_value.as_ref(),
                    incoming: incoming_record.value.as_ref(),
                    principal: principal.as_ref(),
                };
                match resolvers.resolve(&ctx) {
                    Resolution::Accept => {}
                    Resolution::PreferLocal => {
                        return Ok(preferred_local(op_id, incoming_record.timestamp));
                    }
                    Resolution::Reject { reason } => {
                        return Err(ServerError::MergeRejected {
                            map_name: op.map_name.clone(),
                            key: op.key.clone(),
                            reason,
                            attempted_value: incoming_record.value.clone(),
                        });
                    }
                }
            }

            let timestamp = incoming_record.timestamp.clone();
            let is_tombstone = incoming_record.is_tombstone();
            let changed = guard.merge(op.key.clone(), incoming_record);
            let stored = guard.get_record(&op.key).cloned();
            let new_value = guard.get(&op.key).cloned();
            drop(guard);

            if changed {
                indexes.apply_write(
                    &op.map_name,
                    &op.key,
                    previous_value.as_ref(),
                    new_value.as_ref(),
                );
            }

            let journal_kind = if !changed {
                None
            } else if is_tombstone {
                Some(EventKind::Delete)
            } else if previous_value.is_none() {
                Some(EventKind::Put)
            } else {
                Some(EventKind::Update)
            };

            Ok(Applied {
                op_id,
                changed,
                preferred_local: false,
                event: changed.then(|| ServerEventPayload {
                    map_name: op.map_name.clone(),
                    event_kind: journal_kind.unwrap_or(EventKind::Update),
                    key: op.key.clone(),
                    record: stored.clone(),
                    or_record: None,
                    or_tag: None,
                }),
                journal_kind,
                previous_value,
                new_value,
                timestamp,
                storage_writes: stored
                    .map(|record| vec![(op.key.clone(), StorageValue::Lww { record })])
                    .unwrap_or_default(),
            })
        }

        (MapState::Or(or_map), OpType::OrAdd) => {
            let Some(record) = op.or_record.clone() else {
                return Err(ServerError::Malformed(
                    "OR_ADD requires an orRecord".to_string(),
                ));
            };
            let mut guard = or_map.write();
            let previous_value = or_visible(&guard, &op.key);

            if check_resolvers {
                let ctx = ResolutionContext {
                    map_name: &op.map_name,
                    key: &op.key,
                    local: previous_value.as_ref(),
                    incoming: Some(&record.value),
                    principal: principal.as_ref(),
                };
                match resolvers.resolve(&ctx) {
                    Resolution::Accept => {}
                    Resolution::PreferLocal => {
                        return Ok(preferred_local(op_id, record.timestamp));
                    }
                    Resolution::Reject { reason } => {
                        return Err(ServerError::MergeRejected {
                            map_name: op.map_name.clone(),
                            key: op.key.clone(),
                            reason,
                            attempted_value: Some(record.value.clone()),
                        });
                    }
                }
            }

            let timestamp = record.timestamp.clone();
            let changed = guard.apply(op.key.clone(), record.clone());
            let new_value = or_visible(&guard, &op.key);
            let storage_writes = or_storage_writes(&guard, &op.key);
            drop(guard);

            if changed {
                indexes.apply_write(
                    &op.map_name,
                    &op.key,
                    previous_value.as_ref(),
                    new_value.as_ref(),
                );
            }

            Ok(Applied {
                op_id,
                changed,
                preferred_local: false,
                event: changed.then(|| ServerEventPayload {
                    map_name: op.map_name.clone(),
                    event_kind: if previous_value.is_none() {
                        EventKind::Put
                    } else {
                        EventKind::Update
                    },
                    key: op.key.clone(),
                    record: None,
                    or_record: Some(record),
                    or_tag: None,
                }),
                journal_kind: changed.then(|| {
                    if previous_value.is_none() {
                        EventKind::Put
                    } else {
                        EventKind::Update
                    }
                }),
                previous_value,
                new_value,
                timestamp,
                storage_writes,
            })
        }

        (MapState::Or(or_map), OpType::OrRemove) => {
            let Some(tag) = op.or_tag.clone() else {
                return Err(ServerError::Malformed(
                    "OR_REMOVE requires an orTag".to_string(),
                ));
            };
            let timestamp = op
                .timestamp
                .clone()
                .or_else(|| Timestamp::parse(&tag).ok())
                .ok_or_else(|| {
                    ServerError::Malformed("OR_REMOVE requires a timestamp".to_string())
                })?;

            let mut guard = or_map.write();
            let previous_value = or_visible(&guard, &op.key);
            let changed = !guard.is_tombstoned(&tag);
            guard.apply_tombstone(&tag);
            let new_value = or_visible(&guard, &op.key);
            let storage_writes = or_storage_writes(&guard, &op.key);
            drop(guard);

            if changed {
                indexes.apply_write(
                    &op.map_name,
                    &op.key,
                    previous_value.as_ref(),
                    new_value.as_ref(),
                );
            }

            Ok(Applied {
                op_id,
                changed,
                preferred_local: false,
                event: changed.then(|| ServerEventPayload {
                    map_name: op.map_name.clone(),
                    event_kind: EventKind::Delete,
                    key: op.key.clone(),
                    record: None,
                    or_record: None,
                    or_tag: Some(tag),
                }),
                journal_kind: changed.then_some(EventKind::Delete),
                previous_value,
                new_value,
                timestamp,
                storage_writes,
            })
        }

        _ => Err(ServerError::Malformed(format!(
            "{:?} is not valid on a {:?} map",
            op.op_type,
            map.kind()
        ))),
    }
}

fn preferred_local(op_id: String, timestamp: Timestamp) -> Applied {
    Applied {
        op_id,
        changed: false,
        preferred_local: true,
        event: None,
        journal_kind: None,
        previous_value: None,
        new_value: None,
        timestamp,
        storage_writes: Vec::new(),
    }
}

fn or_visible(
    guard: &parking_lot::RwLockWriteGuard<'_, lattice_core::OrMap<Value>>,
    key: &str,
) -> Option<Value> {
    let values: Vec<Value> = guard.get(key).into_iter().cloned().collect();
    (!values.is_empty()).then_some(Value::Array(values))
}

fn or_storage_writes(
    guard: &parking_lot::RwLockWriteGuard<'_, lattice_core::OrMap<Value>>,
    key: &str,
) -> Vec<(String, StorageValue)> {
    let records = guard
        .records_map(key)
        .map(|m| m.values().cloned().collect())
        .unwrap_or_default();
    vec![
        (key.to_string(), StorageValue::OrRecords { records }),
        (
            OR_TOMBSTONES_KEY.to_string(),
            StorageValue::OrTombstones {
                tags: guard.tombstones().into_iter().cloned().collect(),
            },
        ),
    ]
}

/// Top-level value fields a mutation touches, for the policy whitelist.
fn touched_fields(op: &ClientOpPayload) -> Vec<String> {
    let value = op
        .record
        .as_ref()
        .and_then(|r| r.value.as_ref())
        .or(op.or_record.as_ref().map(|r| &r.value));
    value
        .map(|v| {
            v.top_level_fields()
                .into_iter()
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default()
}
