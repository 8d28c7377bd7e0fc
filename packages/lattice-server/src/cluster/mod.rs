//! Cluster coordination: membership, partition map, op fan-out, handoff.
//!
//! Membership changes arrive from an external discovery feed. On every
//! join or leave the coordinator rebuilds the rendezvous partition map,
//! publishes it atomically (readers hold an `ArcSwap` snapshot and are
//! never blocked), announces it to peers, and emits a handoff plan for
//! the partitions this node just stopped owning — the actual data
//! movement rides the anti-entropy protocol toward the new owner.
//!
//! While a handoff is in flight the old owner keeps accepting writes and
//! forwards them; receivers merge idempotently, so duplicate delivery
//! during the overlap is harmless. Operations arriving from peers are
//! marked cluster-originated and are never re-forwarded, which breaks
//! fan-out loops.

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use lattice_core::messages::{ClientOpPayload, ClusterOpPayload, PartitionMapAnnouncePayload};
use lattice_core::{Message, PartitionMap};
use parking_lot::RwLock;
use tokio::sync::broadcast;

/// One cluster member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    /// Unique node id.
    pub node_id: String,
    /// Cluster listener address (`host:port`).
    pub address: String,
}

/// A partition changing hands during rebalance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionMove {
    /// The partition being reassigned.
    pub partition_id: u32,
    /// Owner before the rebalance.
    pub previous_owner: String,
    /// Owner after the rebalance.
    pub new_owner: String,
    /// Backups after the rebalance.
    pub new_backups: Vec<String>,
}

/// Everything this node must stream away after a rebalance.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HandoffPlan {
    /// Partition moves where this node was the previous owner.
    pub moves: Vec<PartitionMove>,
}

/// Cluster state change notifications.
#[derive(Debug, Clone)]
pub enum ClusterEvent {
    /// A member joined.
    MemberJoined(MemberInfo),
    /// A member left or was removed.
    MemberLeft(String),
    /// The partition map was rebuilt.
    Rebalanced {
        /// Version before the rebuild.
        previous_version: u64,
        /// The new map.
        map: Arc<PartitionMap>,
        /// Partitions whose owner or backups changed.
        changed: Vec<u32>,
    },
    /// This node must stream partitions to their new owners.
    HandoffPlanned(HandoffPlan),
}

/// Outbound channel to peers. The wire transport is injected; the
/// coordinator only decides who gets what.
#[async_trait]
pub trait ClusterTransport: Send + Sync {
    /// Sends one message to one peer.
    async fn send(&self, node_id: &str, message: Message) -> anyhow::Result<()>;
}

/// Coordinates membership, partitions, and inter-node op routing.
pub struct ClusterCoordinator {
    node_id: String,
    backup_count: u32,
    members: RwLock<BTreeMap<String, MemberInfo>>,
    partition_map: ArcSwap<PartitionMap>,
    events: broadcast::Sender<ClusterEvent>,
    transport: Arc<dyn ClusterTransport>,
}

impl ClusterCoordinator {
    /// Creates a coordinator for a single-member cluster of `self`.
    #[must_use]
    pub fn new(
        node_id: impl Into<String>,
        self_address: impl Into<String>,
        partition_count: u32,
        backup_count: u32,
        transport: Arc<dyn ClusterTransport>,
    ) -> Self {
        let node_id = node_id.into();
        let mut members = BTreeMap::new();
        members.insert(
            node_id.clone(),
            MemberInfo {
                node_id: node_id.clone(),
                address: self_address.into(),
            },
        );

        let initial = PartitionMap::build(1, &[node_id.clone()], partition_count, backup_count);
        let (events, _) = broadcast::channel(64);

        Self {
            node_id,
            backup_count,
            members: RwLock::new(members),
            partition_map: ArcSwap::from_pointee(initial),
            events,
            transport,
        }
    }

    /// This node's id.
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Subscribes to cluster events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }

    /// Current partition map snapshot.
    #[must_use]
    pub fn partition_map(&self) -> Arc<PartitionMap> {
        self.partition_map.load_full()
    }

    /// Current members, self included.
    #[must_use]
    pub fn members(&self) -> Vec<MemberInfo> {
        self.members.read().values().cloned().collect()
    }

    /// Whether this node holds any replica of the key's partition.
    #[must_use]
    pub fn is_local_replica(&self, key: &str) -> bool {
        let map = self.partition_map.load();
        let pid = map.partition_of(key);
        map.is_replica(pid, &self.node_id)
    }

    /// Replica node ids (owner first) for a key, this node included if it
    /// is one.
    #[must_use]
    pub fn replicas_for_key(&self, key: &str) -> Vec<String> {
        self.partition_map
            .load()
            .replicas_for_key(key)
            .into_iter()
            .map(ToString::to_string)
            .collect()
    }

    /// Processes a member join from discovery: rebuild, announce, plan.
    pub async fn member_joined(&self, member: MemberInfo) {
        let inserted = {
            let mut members = self.members.write();
            members
                .insert(member.node_id.clone(), member.clone())
                .is_none()
        };
        if !inserted {
            return; // duplicate notification
        }
        let _ = self.events.send(ClusterEvent::MemberJoined(member));
        self.rebuild_and_publish().await;
    }

    /// Processes a member departure from discovery.
    pub async fn member_left(&self, node_id: &str) {
        let removed = self.members.write().remove(node_id).is_some();
        if !removed {
            return;
        }
        let _ = self
            .events
            .send(ClusterEvent::MemberLeft(node_id.to_string()));
        self.rebuild_and_publish().await;
    }

    /// Adopts a peer-announced map when its version is newer.
    pub fn handle_announce(&self, announced: PartitionMap) {
        let current = self.partition_map.load();
        if announced.version > current.version {
            tracing::info!(
                from_version = current.version,
                to_version = announced.version,
                "adopting announced partition map"
            );
            self.partition_map.store(Arc::new(announced));
        }
    }

    /// Fans an accepted operation out to the other replicas of its key.
    ///
    /// Returns the replicas the op was sent to. Cluster-originated ops
    /// must not be fanned out again; callers check the origin before
    /// calling.
    pub async fn fan_out(&self, op: &ClientOpPayload) -> Vec<String> {
        let replicas = self.replicas_for_key(&op.key);
        let mut sent = Vec::new();
        for replica in replicas {
            if replica == self.node_id {
                continue;
            }
            let message = Message::ClusterOp(ClusterOpPayload {
                op: op.clone(),
                origin_node_id: self.node_id.clone(),
            });
            match self.transport.send(&replica, message).await {
                Ok(()) => sent.push(replica),
                Err(err) => {
                    tracing::warn!(replica, %err, "cluster op fan-out failed");
                }
            }
        }
        metrics::counter!("lattice_cluster_fanout_total").increment(sent.len() as u64);
        sent
    }

    /// Forwards an op to the owner of its key when this node is not the
    /// owner. Returns the owner when forwarded, `None` when local.
    pub async fn forward_to_owner(&self, op: &ClientOpPayload) -> Option<String> {
        let map = self.partition_map.load();
        let owner = map.owner_for_key(&op.key)?.to_string();
        if owner == self.node_id {
            return None;
        }
        let message = Message::ClusterOp(ClusterOpPayload {
            op: op.clone(),
            origin_node_id: self.node_id.clone(),
        });
        if let Err(err) = self.transport.send(&owner, message).await {
            tracing::warn!(owner, %err, "owner forward failed");
        }
        Some(owner)
    }

    async fn rebuild_and_publish(&self) {
        let nodes: Vec<String> = self.members.read().keys().cloned().collect();
        let previous = self.partition_map.load_full();
        let (next, changed) = previous.rebalance(&nodes, self.backup_count);
        let next = Arc::new(next);
        self.partition_map.store(next.clone());

        tracing::info!(
            version = next.version,
            members = nodes.len(),
            changed = changed.len(),
            "partition map rebuilt"
        );
        let _ = self.events.send(ClusterEvent::Rebalanced {
            previous_version: previous.version,
            map: next.clone(),
            changed: changed.clone(),
        });

        // Handoff plan: partitions this node owned and no longer owns.
        let moves: Vec<PartitionMove> = changed
            .iter()
            .filter_map(|&pid| {
                let was_owner = previous.owner_of(pid) == Some(self.node_id.as_str());
                let now_owner = next.owner_of(pid)?;
                if was_owner && now_owner != self.node_id {
                    Some(PartitionMove {
                        partition_id: pid,
                        previous_owner: self.node_id.clone(),
                        new_owner: now_owner.to_string(),
                        new_backups: next.backups_of(pid).to_vec(),
                    })
                } else {
                    None
                }
            })
            .collect();
        if !moves.is_empty() {
            let _ = self
                .events
                .send(ClusterEvent::HandoffPlanned(HandoffPlan { moves }));
        }

        self.announce(&next).await;
    }

    /// Announces the current map to every peer.
    async fn announce(&self, map: &Arc<PartitionMap>) {
        let peers: Vec<String> = {
            let members = self.members.read();
            members
                .keys()
                .filter(|id| *id != &self.node_id)
                .cloned()
                .collect()
        };
        for peer in peers {
            let message = Message::PartitionMapAnnounce(PartitionMapAnnouncePayload {
                map: (**map).clone(),
            });
            if let Err(err) = self.transport.send(&peer, message).await {
                tracing::warn!(peer, %err, "partition map announce failed");
            }
        }
    }
}
