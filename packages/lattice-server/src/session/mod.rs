//! Client and cluster-peer sessions.
//!
//! A session is one duplex connection: a state machine (`NEW` until a
//! successful `AUTH`, then `AUTHENTICATED`, then closing), its
//! subscriptions, a per-session op rate window, and a coalescing writer
//! feeding the connection's outbound channel. The registry tracks all
//! live sessions and fans server events out to subscribers, preserving
//! per-connection FIFO order through each session's writer.

mod backpressure;
mod handler;
mod interceptor;
mod pipeline;
mod write_concern;

pub use backpressure::{BackpressureRegulator, BackpressureStats, OpPermit};
pub use handler::{SessionHandler, Verdict};
pub use interceptor::{OpInterceptor, OpOutcome};
pub use pipeline::{OpOrigin, OpPipeline, PipelineParts};
pub use write_concern::{quorum_of, AckTracker};

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use bytes::Bytes;
use dashmap::DashMap;
use lattice_core::messages::ServerEventPayload;
use lattice_core::types::Value;
use lattice_core::{Message, Principal, Query};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::{CoalesceConfig, SessionConfig};
use crate::error::ServerError;
use crate::writer::CoalescingWriter;

/// Registry-assigned session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// What kind of peer sits on the other end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// A client application.
    Client,
    /// Another node's cluster connection.
    ClusterPeer,
}

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, not yet authenticated; only `AUTH` is accepted.
    New,
    /// Authenticated; the full op surface is available.
    Authenticated,
    /// Close requested; inbound messages are ignored.
    Closing,
    /// Terminal.
    Closed,
}

#[derive(Debug)]
struct OpsWindow {
    window_start: Instant,
    count: u32,
}

/// One live connection.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    kind: SessionKind,
    state: RwLock<SessionState>,
    principal: RwLock<Option<Principal>>,
    map_subs: RwLock<HashSet<String>>,
    query_subs: RwLock<HashMap<String, (String, Query)>>,
    peer_node_id: RwLock<Option<String>>,
    writer: CoalescingWriter,
    ops_window: Mutex<OpsWindow>,
}

impl Session {
    /// This session's id.
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Client or cluster peer.
    #[must_use]
    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Moves the session to a new lifecycle state.
    pub fn set_state(&self, state: SessionState) {
        *self.state.write() = state;
    }

    /// The authenticated principal, if any.
    #[must_use]
    pub fn principal(&self) -> Option<Principal> {
        self.principal.read().clone()
    }

    /// Marks the session authenticated as `principal`.
    pub fn authenticate(&self, principal: Principal) {
        *self.principal.write() = Some(principal);
        self.set_state(SessionState::Authenticated);
    }

    /// The peer node id, for cluster sessions that announced one.
    #[must_use]
    pub fn peer_node_id(&self) -> Option<String> {
        self.peer_node_id.read().clone()
    }

    /// Records the peer node id of a cluster session.
    pub fn set_peer_node_id(&self, node_id: impl Into<String>) {
        *self.peer_node_id.write() = Some(node_id.into());
    }

    /// Queues a message on this session's writer.
    ///
    /// # Errors
    ///
    /// Propagates encode failures and closed-connection errors.
    pub async fn send(&self, message: &Message, flush_now: bool) -> Result<(), ServerError> {
        self.writer.write(message, flush_now).await
    }

    /// Flushes the coalescing writer, pushing buffered frames to the
    /// transport immediately.
    pub async fn flush_writer(&self) {
        let _ = self.writer.flush().await;
    }

    /// Subscribes this session to change events of a map.
    pub fn subscribe_map(&self, map_name: impl Into<String>) {
        self.map_subs.write().insert(map_name.into());
    }

    /// Removes a map subscription.
    pub fn unsubscribe_map(&self, map_name: &str) {
        self.map_subs.write().remove(map_name);
    }

    /// Registers a live query subscription.
    pub fn add_query_sub(&self, query_id: impl Into<String>, map_name: impl Into<String>, query: Query) {
        self.query_subs
            .write()
            .insert(query_id.into(), (map_name.into(), query));
    }

    /// Cancels a live query subscription. Returns whether it existed.
    pub fn remove_query_sub(&self, query_id: &str) -> bool {
        self.query_subs.write().remove(query_id).is_some()
    }

    /// Whether this session should receive an event for `map_name`.
    ///
    /// True for plain map subscriptions, and for live queries on the map
    /// whose predicate matches the changed entry (deletes always notify:
    /// the entry may have just left the result set).
    fn wants_event(&self, map_name: &str, key: &str, value: Option<&Value>) -> bool {
        if self.map_subs.read().contains(map_name) {
            return true;
        }
        self.query_subs.read().values().any(|(sub_map, query)| {
            sub_map == map_name
                && match value {
                    Some(value) => query.matches(key, value),
                    None => true,
                }
        })
    }

    /// Admits one op under the session's ops-per-second window.
    pub fn admit_op(&self, ops_per_second: u32) -> bool {
        let mut window = self.ops_window.lock();
        if window.window_start.elapsed().as_millis() >= 1_000 {
            window.window_start = Instant::now();
            window.count = 0;
        }
        if window.count >= ops_per_second {
            return false;
        }
        window.count += 1;
        true
    }
}

/// All live sessions.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
    next_id: AtomicU64,
    coalesce: CoalesceConfig,
    outbound_capacity: usize,
}

impl SessionRegistry {
    /// Creates an empty registry using the given writer settings.
    #[must_use]
    pub fn new(coalesce: CoalesceConfig, session_config: &SessionConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
            coalesce,
            outbound_capacity: session_config.outbound_channel_capacity,
        }
    }

    /// Registers a new session; the returned receiver is the outbound
    /// byte stream the transport drains.
    pub fn register(&self, kind: SessionKind) -> (Arc<Session>, mpsc::Receiver<Bytes>) {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.outbound_capacity);
        let session = Arc::new(Session {
            id,
            kind,
            state: RwLock::new(SessionState::New),
            principal: RwLock::new(None),
            map_subs: RwLock::new(HashSet::new()),
            query_subs: RwLock::new(HashMap::new()),
            peer_node_id: RwLock::new(None),
            writer: CoalescingWriter::new(self.coalesce.clone(), tx),
            ops_window: Mutex::new(OpsWindow {
                window_start: Instant::now(),
                count: 0,
            }),
        });
        self.sessions.insert(id, session.clone());
        metrics::gauge!("lattice_sessions_active").set(self.sessions.len() as f64);
        (session, rx)
    }

    /// Removes a session, marking it closed.
    pub fn remove(&self, id: SessionId) -> Option<Arc<Session>> {
        let removed = self.sessions.remove(&id).map(|(_, s)| s);
        if let Some(session) = &removed {
            session.set_state(SessionState::Closed);
        }
        metrics::gauge!("lattice_sessions_active").set(self.sessions.len() as f64);
        removed
    }

    /// Looks up a session.
    #[must_use]
    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|e| e.value().clone())
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no sessions are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Delivers a server event to every interested session except the
    /// origin. Slow consumers exert backpressure through their own
    /// writer; one stalled session does not block the others beyond its
    /// own outbound channel.
    pub async fn broadcast_event(
        &self,
        event: &ServerEventPayload,
        exclude: Option<SessionId>,
    ) {
        let value = event
            .record
            .as_ref()
            .and_then(|r| r.value.as_ref())
            .or(event.or_record.as_ref().map(|r| &r.value));

        let targets: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .filter(|entry| Some(*entry.key()) != exclude)
            .filter(|entry| entry.value().state() == SessionState::Authenticated)
            .filter(|entry| entry.value().wants_event(&event.map_name, &event.key, value))
            .map(|entry| entry.value().clone())
            .collect();

        let message = Message::ServerEvent(event.clone());
        for session in targets {
            if let Err(err) = session.send(&message, false).await {
                tracing::debug!(session = %session.id(), %err, "event delivery failed");
            }
        }
    }
}
