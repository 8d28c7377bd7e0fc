//! Node bootstrap: wires the coordination plane together.
//!
//! Nothing here reads the environment or holds process-global state. An
//! embedder builds a [`NodeConfig`], the [`Collaborators`] (storage,
//! journal store, authenticator, cluster transport, clock), and the
//! policy set, then gets back a [`LatticeNode`] whose sessions it feeds
//! from whatever transport it runs.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use lattice_core::messages::{
    OrMapEntry, OrSyncPushDiffPayload, SyncLeafEntry, SyncPushDiffPayload,
};
use lattice_core::{ClockSource, MapKind, Message, StorageValue};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::auth::Authenticator;
use crate::cluster::{ClusterCoordinator, ClusterEvent, ClusterTransport, HandoffPlan};
use crate::config::NodeConfig;
use crate::error::ServerError;
use crate::executor::{StripedExecutor, StripedExecutorBuilder};
use crate::journal::{EventJournal, JournalStore};
use crate::limiter::ConnectionRateLimiter;
use crate::maps::{MapRegistry, MapState};
use crate::query::{IndexRegistry, QueryEngine};
use crate::resolver::ConflictResolvers;
use crate::scheduler::TaskletScheduler;
use crate::security::PolicyEngine;
use crate::session::{
    AckTracker, BackpressureRegulator, OpPipeline, PipelineParts, Session, SessionHandler,
    SessionKind, SessionRegistry,
};
use crate::storage::{StorageAdapter, StoreRetryQueue};
use crate::sync::SyncResponder;

/// Injected external services.
pub struct Collaborators {
    /// Durable key-value storage.
    pub storage: Arc<dyn StorageAdapter>,
    /// Durable journal tail, if journal persistence is wanted.
    pub journal_store: Option<Arc<dyn JournalStore>>,
    /// Session authentication.
    pub authenticator: Arc<dyn Authenticator>,
    /// Outbound cluster links.
    pub cluster_transport: Arc<dyn ClusterTransport>,
    /// Wall clock (injected for deterministic tests).
    pub clock: Arc<dyn ClockSource>,
}

/// What [`LatticeNode::restore`] brought back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    /// Journal events replayed into the ring.
    pub replayed_events: usize,
    /// Maps repopulated from storage.
    pub maps: usize,
    /// Records merged back.
    pub records: usize,
}

/// One running node of the grid.
pub struct LatticeNode {
    config: NodeConfig,
    clock: Arc<dyn ClockSource>,
    maps: Arc<MapRegistry>,
    indexes: Arc<IndexRegistry>,
    journal: Arc<EventJournal>,
    retry: Arc<StoreRetryQueue>,
    scheduler: TaskletScheduler,
    executor: Arc<StripedExecutor>,
    cluster: Arc<ClusterCoordinator>,
    transport: Arc<dyn ClusterTransport>,
    sessions: Arc<SessionRegistry>,
    resolvers: Arc<ConflictResolvers>,
    admission: ConnectionRateLimiter,
    pipeline: Arc<OpPipeline>,
    handler: Arc<SessionHandler>,
    sync: Arc<SyncResponder>,
    query: Arc<QueryEngine>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl LatticeNode {
    /// Wires a node. Must be called within a tokio runtime: executor
    /// stripes and background drivers spawn immediately.
    #[must_use]
    pub fn new(
        config: NodeConfig,
        policy: Arc<PolicyEngine>,
        collaborators: Collaborators,
    ) -> Arc<Self> {
        let Collaborators {
            storage,
            journal_store,
            authenticator,
            cluster_transport,
            clock,
        } = collaborators;

        let maps = Arc::new(MapRegistry::new(
            config.node_id.clone(),
            clock.clone(),
            config.strict_clock,
            config.max_drift_ms,
            config.merkle_depth,
            config.max_key_len,
        ));
        let indexes = Arc::new(IndexRegistry::new());
        let journal = Arc::new(EventJournal::new(
            config.journal.clone(),
            journal_store,
            clock.clone(),
        ));
        let retry = Arc::new(StoreRetryQueue::new(
            storage.clone(),
            Duration::from_millis(500),
        ));
        let scheduler = TaskletScheduler::new(config.scheduler.clone());
        let executor = Arc::new(StripedExecutorBuilder::new(config.executor.clone()).build());
        let cluster = Arc::new(ClusterCoordinator::new(
            config.node_id.clone(),
            "local",
            config.partition_count,
            config.backup_count,
            cluster_transport.clone(),
        ));
        let sessions = Arc::new(SessionRegistry::new(
            config.writer.clone(),
            &config.session,
        ));
        let resolvers = Arc::new(ConflictResolvers::new());
        let admission = ConnectionRateLimiter::new(config.admission.clone(), clock.clone());
        let backpressure = Arc::new(BackpressureRegulator::new(&config.session));
        let acks = Arc::new(AckTracker::new());

        let pipeline = Arc::new(OpPipeline::new(PipelineParts {
            node_id: config.node_id.clone(),
            config: config.session.clone(),
            clock: clock.clone(),
            strict_clock: config.strict_clock,
            max_drift_ms: config.max_drift_ms,
            maps: maps.clone(),
            journal: journal.clone(),
            storage,
            retry: retry.clone(),
            policy,
            resolvers: resolvers.clone(),
            backpressure,
            acks,
            cluster: cluster.clone(),
            executor: executor.clone(),
            indexes: indexes.clone(),
            sessions: sessions.clone(),
        }));

        let sync = Arc::new(SyncResponder::new(
            maps.clone(),
            clock.clone(),
            config.node_id.clone(),
            config.sync.gc_max_age,
        ));
        let query = Arc::new(QueryEngine::new(
            maps.clone(),
            indexes.clone(),
            scheduler.clone(),
            config.query.clone(),
        ));
        let handler = Arc::new(SessionHandler::new(
            pipeline.clone(),
            authenticator,
            sync.clone(),
            query.clone(),
            cluster.clone(),
            clock.clone(),
        ));

        Arc::new(Self {
            config,
            clock,
            maps,
            indexes,
            journal,
            retry,
            scheduler,
            executor,
            cluster,
            transport: cluster_transport,
            sessions,
            resolvers,
            admission,
            pipeline,
            handler,
            sync,
            query,
            background: Mutex::new(Vec::new()),
        })
    }

    /// Starts background drivers: journal flusher, storage retry,
    /// tasklet ticker, and the handoff listener.
    pub fn start(self: &Arc<Self>) {
        self.journal.start();
        self.retry.start();
        self.scheduler.start();

        let node = Arc::clone(self);
        let mut events = self.cluster.subscribe();
        let handle = tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if let ClusterEvent::HandoffPlanned(plan) = event {
                    node.run_handoff(&plan).await;
                }
            }
        });
        self.background.lock().push(handle);
    }

    /// Stops background drivers and drains the executor.
    pub async fn shutdown(&self) {
        for handle in self.background.lock().drain(..) {
            handle.abort();
        }
        self.scheduler.stop();
        self.journal.stop();
        let _ = self.journal.flush_once().await;
        self.retry.stop();
        let _ = self.retry.flush_all().await;
        self.executor.shutdown().await;
    }

    /// Opens a session without admission control (locally originated
    /// connections: loopback cluster links, embedded clients).
    #[must_use]
    pub fn open_session(&self, kind: SessionKind) -> (Arc<Session>, mpsc::Receiver<Bytes>) {
        self.sessions.register(kind)
    }

    /// Opens a session through connection admission control.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::RateLimited`] when the admission window or
    /// pending cap rejects the connection.
    pub fn accept_session(
        &self,
        kind: SessionKind,
    ) -> Result<(Arc<Session>, mpsc::Receiver<Bytes>), ServerError> {
        if !self.admission.attempt() {
            return Err(ServerError::RateLimited(
                "connection admission rejected".to_string(),
            ));
        }
        let registered = self.sessions.register(kind);
        self.admission.established();
        Ok(registered)
    }

    /// Replays the journal and repopulates maps from storage.
    ///
    /// # Errors
    ///
    /// Propagates storage failures; partial restores leave whatever was
    /// merged so far (merging is idempotent and can be retried).
    pub async fn restore(&self) -> Result<RestoreSummary, ServerError> {
        let replayed_events = self.journal.replay().await?;

        // The journal names every map that ever changed; storage holds
        // the authoritative current records.
        let map_names: HashSet<String> = self
            .journal
            .events(0, u64::MAX, &crate::journal::EventFilter::default())
            .into_iter()
            .map(|e| e.map_name)
            .collect();

        let mut summary = RestoreSummary {
            replayed_events,
            ..RestoreSummary::default()
        };
        let storage = self.storage();
        for map_name in map_names {
            let keys = storage.load_all_keys(&map_name).await?;
            if keys.is_empty() {
                continue;
            }
            let values = storage.load_all(&map_name, &keys).await?;
            summary.maps += 1;

            // Tombstones first so resurrected tags stay dead.
            for value in values.values() {
                if let StorageValue::OrTombstones { tags } = value {
                    let map = self.maps.get_or_create(&map_name, MapKind::Or);
                    if let Some(or_map) = map.or_map() {
                        let mut guard = or_map.write();
                        for tag in tags {
                            guard.apply_tombstone(tag);
                        }
                    }
                }
            }
            for (key, value) in values {
                match value {
                    StorageValue::Lww { record } => {
                        let map = self.maps.get_or_create(&map_name, MapKind::Lww);
                        if let Some(lww) = map.lww() {
                            lww.write().merge(key, record);
                            summary.records += 1;
                        }
                    }
                    StorageValue::OrRecords { records } => {
                        let map = self.maps.get_or_create(&map_name, MapKind::Or);
                        if let Some(or_map) = map.or_map() {
                            or_map.write().merge_key(key, records, &[]);
                            summary.records += 1;
                        }
                    }
                    StorageValue::OrTombstones { .. } => {}
                }
            }
        }
        Ok(summary)
    }

    /// Streams every moved partition's data to its new owner and backups.
    ///
    /// Writes continue locally while this runs; the receivers merge
    /// idempotently, so anything mutated mid-handoff is repaired by the
    /// next anti-entropy round.
    pub async fn run_handoff(&self, plan: &HandoffPlan) {
        let moved: HashMap<u32, Vec<String>> = plan
            .moves
            .iter()
            .map(|m| {
                let mut targets = vec![m.new_owner.clone()];
                targets.extend(m.new_backups.iter().cloned());
                targets.retain(|t| t != &self.config.node_id);
                (m.partition_id, targets)
            })
            .collect();
        if moved.is_empty() {
            return;
        }
        let partition_map = self.cluster.partition_map();

        for map_name in self.maps.map_names() {
            let Some(map) = self.maps.get(&map_name) else {
                continue;
            };
            // target node -> entries to push
            let mut lww_pushes: HashMap<String, Vec<SyncLeafEntry>> = HashMap::new();
            let mut or_pushes: HashMap<String, Vec<OrMapEntry>> = HashMap::new();

            match map.state() {
                MapState::Lww(lww) => {
                    let guard = lww.read();
                    for key in guard.all_keys() {
                        let pid = partition_map.partition_of(key);
                        let Some(targets) = moved.get(&pid) else {
                            continue;
                        };
                        let Some(record) = guard.get_record(key) else {
                            continue;
                        };
                        for target in targets {
                            lww_pushes.entry(target.clone()).or_default().push(
                                SyncLeafEntry {
                                    key: key.clone(),
                                    record: record.clone(),
                                },
                            );
                        }
                    }
                }
                MapState::Or(or_map) => {
                    let guard = or_map.read();
                    let tombstones: Vec<String> =
                        guard.tombstones().into_iter().cloned().collect();
                    for key in guard.all_keys() {
                        let pid = partition_map.partition_of(key);
                        let Some(targets) = moved.get(&pid) else {
                            continue;
                        };
                        let Some(records) = guard.records_map(key) else {
                            continue;
                        };
                        for target in targets {
                            or_pushes.entry(target.clone()).or_default().push(OrMapEntry {
                                key: key.clone(),
                                records: records.values().cloned().collect(),
                                tombstones: tombstones.clone(),
                            });
                        }
                    }
                }
            }

            for (target, entries) in lww_pushes {
                let message = Message::SyncPushDiff(SyncPushDiffPayload {
                    map_name: map_name.clone(),
                    entries,
                });
                if let Err(err) = self.transport.send(&target, message).await {
                    tracing::warn!(target, map_name, %err, "handoff push failed");
                }
            }
            for (target, entries) in or_pushes {
                let message = Message::OrSyncPushDiff(OrSyncPushDiffPayload {
                    map_name: map_name.clone(),
                    entries,
                });
                if let Err(err) = self.transport.send(&target, message).await {
                    tracing::warn!(target, map_name, %err, "handoff push failed");
                }
            }
        }
    }

    /// Prunes old tombstones across every map, using the coordinator's
    /// prune horizon as the cutoff.
    pub fn prune_tombstones(&self) -> usize {
        let horizon =
            u64::try_from(self.config.sync.prune_horizon.as_millis()).unwrap_or(u64::MAX);
        let cutoff = lattice_core::Timestamp::new(
            self.clock.now().saturating_sub(horizon),
            0,
            self.config.node_id.clone(),
        );
        let mut pruned = 0;
        for map_name in self.maps.map_names() {
            let Some(map) = self.maps.get(&map_name) else {
                continue;
            };
            pruned += match map.state() {
                MapState::Lww(lww) => lww.write().prune(&cutoff).len(),
                MapState::Or(or_map) => or_map.write().prune(&cutoff).len(),
            };
        }
        pruned
    }

    // ---- accessors ----

    /// Node configuration.
    #[must_use]
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// CRDT maps.
    #[must_use]
    pub fn maps(&self) -> &Arc<MapRegistry> {
        &self.maps
    }

    /// Value indexes.
    #[must_use]
    pub fn indexes(&self) -> &Arc<IndexRegistry> {
        &self.indexes
    }

    /// Mutation journal.
    #[must_use]
    pub fn journal(&self) -> &Arc<EventJournal> {
        &self.journal
    }

    /// Cluster coordinator.
    #[must_use]
    pub fn cluster(&self) -> &Arc<ClusterCoordinator> {
        &self.cluster
    }

    /// Conflict resolvers.
    #[must_use]
    pub fn resolvers(&self) -> &Arc<ConflictResolvers> {
        &self.resolvers
    }

    /// Session dispatcher.
    #[must_use]
    pub fn handler(&self) -> &Arc<SessionHandler> {
        &self.handler
    }

    /// Operation pipeline.
    #[must_use]
    pub fn pipeline(&self) -> &Arc<OpPipeline> {
        &self.pipeline
    }

    /// Sync responder.
    #[must_use]
    pub fn sync_responder(&self) -> &Arc<SyncResponder> {
        &self.sync
    }

    /// Query engine.
    #[must_use]
    pub fn query(&self) -> &Arc<QueryEngine> {
        &self.query
    }

    /// Session registry.
    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Connection admission stats.
    #[must_use]
    pub fn admission(&self) -> &ConnectionRateLimiter {
        &self.admission
    }

    fn storage(&self) -> Arc<dyn StorageAdapter> {
        // The pipeline owns the canonical handle; reuse it.
        self.pipeline.storage_handle()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use async_trait::async_trait;
    use dashmap::DashMap;
    use lattice_core::{Principal, SystemClock};

    use crate::auth::StaticTokenAuthenticator;
    use crate::journal::MemoryJournalStore;
    use crate::storage::MemoryStorageAdapter;

    use super::*;

    /// In-process cluster fabric: `send` dispatches straight into the
    /// target node, and acks for cluster ops are routed back to the
    /// origin's tracker.
    #[derive(Default)]
    pub struct LoopbackMesh {
        nodes: DashMap<String, Arc<LatticeNode>>,
        down: DashMap<String, ()>,
    }

    impl LoopbackMesh {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn register(&self, node: &Arc<LatticeNode>) {
            self.nodes
                .insert(node.config().node_id.clone(), node.clone());
        }

        pub fn kill(&self, node_id: &str) {
            self.down.insert(node_id.to_string(), ());
        }

        pub fn link(self: &Arc<Self>, from: &str) -> Arc<MeshLink> {
            Arc::new(MeshLink {
                mesh: self.clone(),
                from: from.to_string(),
            })
        }
    }

    /// One node's outbound view of the mesh.
    pub struct MeshLink {
        mesh: Arc<LoopbackMesh>,
        from: String,
    }

    #[async_trait]
    impl ClusterTransport for MeshLink {
        async fn send(&self, node_id: &str, message: Message) -> anyhow::Result<()> {
            if self.mesh.down.contains_key(node_id) {
                anyhow::bail!("node {node_id} is down");
            }
            let Some(target) = self.mesh.nodes.get(node_id).map(|n| n.clone()) else {
                anyhow::bail!("node {node_id} is unknown");
            };

            match message {
                Message::ClusterOp(payload) => {
                    let op_id = payload.op.id.clone().unwrap_or_default();
                    let origin = payload.origin_node_id.clone();
                    target
                        .pipeline()
                        .handle_cluster_op(&origin, payload.op)
                        .await
                        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
                    if let Some(origin_node) = self.mesh.nodes.get(&origin) {
                        origin_node.pipeline().acks().record_ack(&op_id, node_id);
                    }
                }
                Message::PartitionMapAnnounce(announce) => {
                    target.cluster().handle_announce(announce.map);
                }
                msg @ (Message::SyncPushDiff(_) | Message::OrSyncPushDiff(_)) => {
                    let _ = target.sync_responder().handle(&msg);
                }
                other => {
                    tracing::debug!(kind = ?other.kind(), "mesh dropping unhandled message");
                }
            }
            Ok(())
        }
    }

    pub fn test_principal() -> Principal {
        Principal {
            user_id: "writer".to_string(),
            roles: vec!["writer".to_string()],
        }
    }

    fn test_authenticator() -> Arc<dyn Authenticator> {
        Arc::new(StaticTokenAuthenticator::new(vec![(
            "writer-token".to_string(),
            test_principal(),
        )]))
    }

    pub struct NodeFixture {
        pub node: Arc<LatticeNode>,
        pub storage: Arc<MemoryStorageAdapter>,
        pub journal_store: Arc<MemoryJournalStore>,
        pub mesh: Arc<LoopbackMesh>,
    }

    pub async fn fixture_with(node_id: &str, mesh: &Arc<LoopbackMesh>, config: NodeConfig) -> NodeFixture {
        let storage = Arc::new(MemoryStorageAdapter::new());
        let journal_store = Arc::new(MemoryJournalStore::new());
        let node = LatticeNode::new(
            config,
            Arc::new(PolicyEngine::allow_all()),
            Collaborators {
                storage: storage.clone(),
                journal_store: Some(journal_store.clone() as Arc<dyn JournalStore>),
                authenticator: test_authenticator(),
                cluster_transport: mesh.link(node_id),
                clock: Arc::new(SystemClock),
            },
        );
        mesh.register(&node);
        node.start();
        NodeFixture {
            node,
            storage,
            journal_store,
            mesh: mesh.clone(),
        }
    }

    pub async fn fixture(node_id: &str) -> NodeFixture {
        let mesh = LoopbackMesh::new();
        let config = NodeConfig {
            node_id: node_id.to_string(),
            ..NodeConfig::default()
        };
        fixture_with(node_id, &mesh, config).await
    }

    /// A started single node for handler-level tests.
    pub async fn single_node(node_id: &str) -> Arc<LatticeNode> {
        fixture(node_id).await.node
    }
}
