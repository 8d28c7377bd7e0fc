//! Per-session message dispatch.
//!
//! The handler owns the session state machine: a fresh session accepts
//! nothing but `AUTH`; an authenticated one dispatches ops into the
//! pipeline, queries into the engine, sync walks into the responder, and
//! cluster traffic into the coordinator. Errors are reported on the
//! session's writer; only protocol breaches, failed authentication, and
//! internal invariant errors terminate the connection.

use std::sync::Arc;

use lattice_core::messages::{AckPayload, AuthOkPayload, HeartbeatAckPayload, WriteConcern};
use lattice_core::{ClockSource, Message};
use uuid::Uuid;

use crate::auth::Authenticator;
use crate::cluster::ClusterCoordinator;
use crate::error::ServerError;
use crate::logging::RateLimitedLogger;
use crate::query::QueryEngine;
use crate::sync::SyncResponder;

use super::interceptor::OpOutcome;
use super::pipeline::OpPipeline;
use super::{Session, SessionKind, SessionState};

/// What the transport should do with the connection after a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Keep reading.
    Continue,
    /// Flush and close the connection.
    Close,
}

/// Stateless dispatcher shared by every session.
pub struct SessionHandler {
    pipeline: Arc<OpPipeline>,
    authenticator: Arc<dyn Authenticator>,
    sync: Arc<SyncResponder>,
    query: Arc<QueryEngine>,
    cluster: Arc<ClusterCoordinator>,
    clock: Arc<dyn ClockSource>,
    /// Throttles error logging per session so a hostile client hammering
    /// the same failure cannot flood the log backend.
    error_log: RateLimitedLogger,
}

impl SessionHandler {
    /// Assembles the dispatcher.
    #[must_use]
    pub fn new(
        pipeline: Arc<OpPipeline>,
        authenticator: Arc<dyn Authenticator>,
        sync: Arc<SyncResponder>,
        query: Arc<QueryEngine>,
        cluster: Arc<ClusterCoordinator>,
        clock: Arc<dyn ClockSource>,
    ) -> Self {
        let error_log =
            RateLimitedLogger::new(std::time::Duration::from_secs(10), 5, clock.clone());
        Self {
            pipeline,
            authenticator,
            sync,
            query,
            cluster,
            clock,
            error_log,
        }
    }

    /// Processes one inbound message for a session.
    pub async fn handle_message(&self, session: &Arc<Session>, message: Message) -> Verdict {
        match session.state() {
            SessionState::New => self.handle_unauthenticated(session, message).await,
            SessionState::Authenticated => self.handle_authenticated(session, message).await,
            SessionState::Closing | SessionState::Closed => Verdict::Close,
        }
    }

    async fn handle_unauthenticated(
        &self,
        session: &Arc<Session>,
        message: Message,
    ) -> Verdict {
        let Message::Auth(auth) = message else {
            let err = ServerError::Unauthenticated(
                "authenticate before sending anything else".to_string(),
            );
            let _ = session.send(&err.to_wire(), true).await;
            session.set_state(SessionState::Closing);
            return Verdict::Close;
        };

        match self.authenticator.authenticate(&auth.token).await {
            Ok(principal) => {
                session.authenticate(principal.clone());
                let reply = Message::AuthOk(AuthOkPayload { principal });
                let _ = session.send(&reply, true).await;
                Verdict::Continue
            }
            Err(err) => {
                let err = ServerError::Unauthenticated(err.to_string());
                let _ = session.send(&err.to_wire(), true).await;
                session.set_state(SessionState::Closing);
                Verdict::Close
            }
        }
    }

    #[allow(clippy::too_many_lines)]
    async fn handle_authenticated(
        &self,
        session: &Arc<Session>,
        message: Message,
    ) -> Verdict {
        match message {
            Message::ClientOp(mut op) => {
                // Fix the op id up front so the pipeline, the replicas,
                // and the client ack all speak about the same operation.
                let op_id = op
                    .id
                    .clone()
                    .unwrap_or_else(|| Uuid::new_v4().to_string());
                op.id = Some(op_id.clone());

                match self.pipeline.handle_client_op(session, op).await {
                    Ok(OpOutcome::Applied { achieved, .. }) => {
                        let ack = Message::Ack(AckPayload { op_id, achieved });
                        let _ = session.send(&ack, false).await;
                        Verdict::Continue
                    }
                    Ok(OpOutcome::PreferredLocal) => {
                        // The write was resolved in favor of local state;
                        // from the client's side it is simply acknowledged.
                        let ack = Message::Ack(AckPayload {
                            op_id,
                            achieved: WriteConcern::Local,
                        });
                        let _ = session.send(&ack, false).await;
                        Verdict::Continue
                    }
                    Ok(OpOutcome::Dropped | OpOutcome::Rejected { .. }) => Verdict::Continue,
                    Err(err) => self.report(session, &err).await,
                }
            }

            Message::QuerySub(sub) => {
                match self
                    .query
                    .run(&sub.query_id, &sub.map_name, &sub.query)
                    .await
                {
                    Ok(page) => {
                        session.add_query_sub(
                            sub.query_id.clone(),
                            sub.map_name.clone(),
                            sub.query,
                        );
                        let _ = session.send(&Message::QueryResult(page), true).await;
                        Verdict::Continue
                    }
                    Err(err) => self.report(session, &err).await,
                }
            }
            Message::QueryUnsub(unsub) => {
                session.remove_query_sub(&unsub.query_id);
                Verdict::Continue
            }

            Message::Heartbeat(hb) => {
                let ack = Message::HeartbeatAck(HeartbeatAckPayload {
                    ts: hb.ts,
                    server_ts: self.clock.now(),
                });
                let _ = session.send(&ack, true).await;
                Verdict::Continue
            }

            msg @ (Message::SyncInit(_)
            | Message::SyncReqBucket(_)
            | Message::SyncDiffRequest(_)
            | Message::SyncPushDiff(_)
            | Message::OrSyncInit(_)
            | Message::OrSyncReqBucket(_)
            | Message::OrSyncDiffRequest(_)
            | Message::OrSyncPushDiff(_)) => {
                let replies = self.sync.handle(&msg);
                let last = replies.len().saturating_sub(1);
                for (i, reply) in replies.into_iter().enumerate() {
                    let _ = session.send(&reply, i == last).await;
                }
                Verdict::Continue
            }

            Message::ClusterOp(cluster_op) => {
                if session.kind() != SessionKind::ClusterPeer {
                    let err = ServerError::Malformed(
                        "cluster ops are not accepted on client sessions".to_string(),
                    );
                    return self.report(session, &err).await;
                }
                session.set_peer_node_id(cluster_op.origin_node_id.clone());

                let op_id = cluster_op.op.id.clone().unwrap_or_default();
                match self
                    .pipeline
                    .handle_cluster_op(&cluster_op.origin_node_id, cluster_op.op)
                    .await
                {
                    Ok(_) => {
                        // Acked so the origin's write-concern tracker can
                        // count this replica.
                        let ack = Message::Ack(AckPayload {
                            op_id,
                            achieved: WriteConcern::Local,
                        });
                        let _ = session.send(&ack, true).await;
                        Verdict::Continue
                    }
                    Err(err) => self.report(session, &err).await,
                }
            }
            Message::Ack(ack) if session.kind() == SessionKind::ClusterPeer => {
                let peer = session
                    .peer_node_id()
                    .unwrap_or_else(|| session.id().to_string());
                self.pipeline.acks().record_ack(&ack.op_id, &peer);
                Verdict::Continue
            }
            Message::MemberJoin(join) if session.kind() == SessionKind::ClusterPeer => {
                self.cluster
                    .member_joined(crate::cluster::MemberInfo {
                        node_id: join.node_id,
                        address: join.address,
                    })
                    .await;
                Verdict::Continue
            }
            Message::MemberLeave(leave) if session.kind() == SessionKind::ClusterPeer => {
                self.cluster.member_left(&leave.node_id).await;
                Verdict::Continue
            }
            Message::PartitionMapAnnounce(announce)
                if session.kind() == SessionKind::ClusterPeer =>
            {
                self.cluster.handle_announce(announce.map);
                Verdict::Continue
            }

            Message::Error(err) => {
                tracing::debug!(session = %session.id(), code = err.code, "peer reported error: {}", err.message);
                Verdict::Continue
            }

            // Anything else inbound is a server-to-client message or a
            // kind this session type must not send: protocol breach.
            other => {
                let err = ServerError::Malformed(format!(
                    "unexpected inbound message kind {:?}",
                    other.kind()
                ));
                let _ = session.send(&err.to_wire(), true).await;
                session.set_state(SessionState::Closing);
                Verdict::Close
            }
        }
    }

    /// Reports a pipeline error to the client and decides the verdict.
    async fn report(&self, session: &Arc<Session>, err: &ServerError) -> Verdict {
        self.error_log.warn(
            &format!("{}:{}", session.id(), err.wire_code()),
            &err.to_string(),
        );
        let _ = session.send(&err.to_wire(), true).await;
        if err.closes_session() {
            session.set_state(SessionState::Closing);
            Verdict::Close
        } else {
            Verdict::Continue
        }
    }
}
