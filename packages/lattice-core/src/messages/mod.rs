//! Typed wire messages and their frame binding.
//!
//! Payload structs live in domain submodules ([`base`], [`sync`],
//! [`cluster`]); [`Message`] is the closed sum of everything that can
//! appear on a connection, tied one-to-one to [`FrameKind`]. Transports
//! parse frames and hand [`Message::from_frame`] the result; senders go
//! the other way through [`Message::to_frame_bytes`].

pub mod base;
pub mod cluster;
pub mod sync;

use bytes::Bytes;

use crate::frame::{self, Frame, FrameError, FrameKind};

pub use base::{
    error_codes, AckPayload, AuthOkPayload, AuthPayload, ClientOpPayload, ErrorPayload,
    EventKind, HeartbeatAckPayload, HeartbeatPayload, MergeRejectionPayload, OpType,
    QueryResultPayload, QueryRow, QuerySubPayload, QueryUnsubPayload, ServerEventPayload,
    WriteConcern,
};
pub use cluster::{
    ClusterOpPayload, MemberJoinPayload, MemberLeavePayload, PartitionMapAnnouncePayload,
};
pub use sync::{
    OrMapEntry, OrSyncDiffResponsePayload, OrSyncInitPayload, OrSyncPushDiffPayload,
    OrSyncRespLeafPayload, OrSyncRespRootPayload, SyncDiffRequestPayload,
    SyncDiffResponsePayload, SyncInitPayload, SyncLeafEntry, SyncPushDiffPayload,
    SyncReqBucketPayload, SyncRespBucketsPayload, SyncRespLeafPayload, SyncRespRootPayload,
    SyncResetRequiredPayload,
};

/// Every message that can travel over a client or cluster connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Auth(AuthPayload),
    AuthOk(AuthOkPayload),
    Error(ErrorPayload),
    ClientOp(ClientOpPayload),
    Ack(AckPayload),
    MergeRejection(MergeRejectionPayload),
    ServerEvent(ServerEventPayload),
    QuerySub(QuerySubPayload),
    QueryUnsub(QueryUnsubPayload),
    QueryResult(QueryResultPayload),
    Heartbeat(HeartbeatPayload),
    HeartbeatAck(HeartbeatAckPayload),

    SyncInit(SyncInitPayload),
    SyncRespRoot(SyncRespRootPayload),
    SyncResetRequired(SyncResetRequiredPayload),
    SyncReqBucket(SyncReqBucketPayload),
    SyncRespBuckets(SyncRespBucketsPayload),
    SyncRespLeaf(SyncRespLeafPayload),
    SyncDiffRequest(SyncDiffRequestPayload),
    SyncDiffResponse(SyncDiffResponsePayload),
    SyncPushDiff(SyncPushDiffPayload),

    OrSyncInit(OrSyncInitPayload),
    OrSyncRespRoot(OrSyncRespRootPayload),
    OrSyncResetRequired(SyncResetRequiredPayload),
    OrSyncReqBucket(SyncReqBucketPayload),
    OrSyncRespBuckets(SyncRespBucketsPayload),
    OrSyncRespLeaf(OrSyncRespLeafPayload),
    OrSyncDiffRequest(SyncDiffRequestPayload),
    OrSyncDiffResponse(OrSyncDiffResponsePayload),
    OrSyncPushDiff(OrSyncPushDiffPayload),

    ClusterOp(ClusterOpPayload),
    MemberJoin(MemberJoinPayload),
    MemberLeave(MemberLeavePayload),
    PartitionMapAnnounce(PartitionMapAnnouncePayload),
}

impl Message {
    /// The frame kind this message travels as.
    #[must_use]
    pub fn kind(&self) -> FrameKind {
        match self {
            Message::Auth(_) => FrameKind::Auth,
            Message::AuthOk(_) => FrameKind::AuthOk,
            Message::Error(_) => FrameKind::Error,
            Message::ClientOp(_) => FrameKind::ClientOp,
            Message::Ack(_) => FrameKind::Ack,
            Message::MergeRejection(_) => FrameKind::MergeRejection,
            Message::ServerEvent(_) => FrameKind::ServerEvent,
            Message::QuerySub(_) => FrameKind::QuerySub,
            Message::QueryUnsub(_) => FrameKind::QueryUnsub,
            Message::QueryResult(_) => FrameKind::QueryResult,
            Message::Heartbeat(_) => FrameKind::Heartbeat,
            Message::HeartbeatAck(_) => FrameKind::HeartbeatAck,
            Message::SyncInit(_) => FrameKind::SyncInit,
            Message::SyncRespRoot(_) => FrameKind::SyncRespRoot,
            Message::SyncResetRequired(_) => FrameKind::SyncResetRequired,
            Message::SyncReqBucket(_) => FrameKind::SyncReqBucket,
            Message::SyncRespBuckets(_) => FrameKind::SyncRespBuckets,
            Message::SyncRespLeaf(_) => FrameKind::SyncRespLeaf,
            Message::SyncDiffRequest(_) => FrameKind::SyncDiffRequest,
            Message::SyncDiffResponse(_) => FrameKind::SyncDiffResponse,
            Message::SyncPushDiff(_) => FrameKind::SyncPushDiff,
            Message::OrSyncInit(_) => FrameKind::OrSyncInit,
            Message::OrSyncRespRoot(_) => FrameKind::OrSyncRespRoot,
            Message::OrSyncResetRequired(_) => FrameKind::OrSyncResetRequired,
            Message::OrSyncReqBucket(_) => FrameKind::OrSyncReqBucket,
            Message::OrSyncRespBuckets(_) => FrameKind::OrSyncRespBuckets,
            Message::OrSyncRespLeaf(_) => FrameKind::OrSyncRespLeaf,
            Message::OrSyncDiffRequest(_) => FrameKind::OrSyncDiffRequest,
            Message::OrSyncDiffResponse(_) => FrameKind::OrSyncDiffResponse,
            Message::OrSyncPushDiff(_) => FrameKind::OrSyncPushDiff,
            Message::ClusterOp(_) => FrameKind::ClusterOp,
            Message::MemberJoin(_) => FrameKind::MemberJoin,
            Message::MemberLeave(_) => FrameKind::MemberLeave,
            Message::PartitionMapAnnounce(_) => FrameKind::PartitionMapAnnounce,
        }
    }

    /// Encodes the message as one complete wire frame.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Encode`] when the payload fails to serialize.
    pub fn to_frame_bytes(&self) -> Result<Bytes, FrameError> {
        match self {
            Message::Auth(p) => frame::encode_frame(self.kind(), p),
            Message::AuthOk(p) => frame::encode_frame(self.kind(), p),
            Message::Error(p) => frame::encode_frame(self.kind(), p),
            Message::ClientOp(p) => frame::encode_frame(self.kind(), p),
            Message::Ack(p) => frame::encode_frame(self.kind(), p),
            Message::MergeRejection(p) => frame::encode_frame(self.kind(), p),
            Message::ServerEvent(p) => frame::encode_frame(self.kind(), p),
            Message::QuerySub(p) => frame::encode_frame(self.kind(), p),
            Message::QueryUnsub(p) => frame::encode_frame(self.kind(), p),
            Message::QueryResult(p) => frame::encode_frame(self.kind(), p),
            Message::Heartbeat(p) => frame::encode_frame(self.kind(), p),
            Message::HeartbeatAck(p) => frame::encode_frame(self.kind(), p),
            Message::SyncInit(p) => frame::encode_frame(self.kind(), p),
            Message::SyncRespRoot(p) => frame::encode_frame(self.kind(), p),
            Message::SyncResetRequired(p) => frame::encode_frame(self.kind(), p),
            Message::SyncReqBucket(p) => frame::encode_frame(self.kind(), p),
            Message::SyncRespBuckets(p) => frame::encode_frame(self.kind(), p),
            Message::SyncRespLeaf(p) => frame::encode_frame(self.kind(), p),
            Message::SyncDiffRequest(p) => frame::encode_frame(self.kind(), p),
            Message::SyncDiffResponse(p) => frame::encode_frame(self.kind(), p),
            Message::SyncPushDiff(p) => frame::encode_frame(self.kind(), p),
            Message::OrSyncInit(p) => frame::encode_frame(self.kind(), p),
            Message::OrSyncRespRoot(p) => frame::encode_frame(self.kind(), p),
            Message::OrSyncResetRequired(p) => frame::encode_frame(self.kind(), p),
            Message::OrSyncReqBucket(p) => frame::encode_frame(self.kind(), p),
            Message::OrSyncRespBuckets(p) => frame::encode_frame(self.kind(), p),
            Message::OrSyncRespLeaf(p) => frame::encode_frame(self.kind(), p),
            Message::OrSyncDiffRequest(p) => frame::encode_frame(self.kind(), p),
            Message::OrSyncDiffResponse(p) => frame::encode_frame(self.kind(), p),
            Message::OrSyncPushDiff(p) => frame::encode_frame(self.kind(), p),
            Message::ClusterOp(p) => frame::encode_frame(self.kind(), p),
            Message::MemberJoin(p) => frame::encode_frame(self.kind(), p),
            Message::MemberLeave(p) => frame::encode_frame(self.kind(), p),
            Message::PartitionMapAnnounce(p) => frame::encode_frame(self.kind(), p),
        }
    }

    /// Decodes a parsed frame into its typed message.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Decode`] when the payload does not match the
    /// kind's schema.
    pub fn from_frame(frame: &Frame) -> Result<Self, FrameError> {
        Ok(match frame.kind {
            FrameKind::Auth => Message::Auth(frame::decode_payload(frame)?),
            FrameKind::AuthOk => Message::AuthOk(frame::decode_payload(frame)?),
            FrameKind::Error => Message::Error(frame::decode_payload(frame)?),
            FrameKind::ClientOp => Message::ClientOp(frame::decode_payload(frame)?),
            FrameKind::Ack => Message::Ack(frame::decode_payload(frame)?),
            FrameKind::MergeRejection => Message::MergeRejection(frame::decode_payload(frame)?),
            FrameKind::ServerEvent => Message::ServerEvent(frame::decode_payload(frame)?),
            FrameKind::QuerySub => Message::QuerySub(frame::decode_payload(frame)?),
            FrameKind::QueryUnsub => Message::QueryUnsub(frame::decode_payload(frame)?),
            FrameKind::QueryResult => Message::QueryResult(frame::decode_payload(frame)?),
            FrameKind::Heartbeat => Message::Heartbeat(frame::decode_payload(frame)?),
            FrameKind::HeartbeatAck => Message::HeartbeatAck(frame::decode_payload(frame)?),
            FrameKind::SyncInit => Message::SyncInit(frame::decode_payload(frame)?),
            FrameKind::SyncRespRoot => Message::SyncRespRoot(frame::decode_payload(frame)?),
            FrameKind::SyncResetRequired => {
                Message::SyncResetRequired(frame::decode_payload(frame)?)
            }
            FrameKind::SyncReqBucket => Message::SyncReqBucket(frame::decode_payload(frame)?),
            FrameKind::SyncRespBuckets => Message::SyncRespBuckets(frame::decode_payload(frame)?),
            FrameKind::SyncRespLeaf => Message::SyncRespLeaf(frame::decode_payload(frame)?),
            FrameKind::SyncDiffRequest => Message::SyncDiffRequest(frame::decode_payload(frame)?),
            FrameKind::SyncDiffResponse => {
                Message::SyncDiffResponse(frame::decode_payload(frame)?)
            }
            FrameKind::SyncPushDiff => Message::SyncPushDiff(frame::decode_payload(frame)?),
            FrameKind::OrSyncInit => Message::OrSyncInit(frame::decode_payload(frame)?),
            FrameKind::OrSyncRespRoot => Message::OrSyncRespRoot(frame::decode_payload(frame)?),
            FrameKind::OrSyncResetRequired => {
                Message::OrSyncResetRequired(frame::decode_payload(frame)?)
            }
            FrameKind::OrSyncReqBucket => Message::OrSyncReqBucket(frame::decode_payload(frame)?),
            FrameKind::OrSyncRespBuckets => {
                Message::OrSyncRespBuckets(frame::decode_payload(frame)?)
            }
            FrameKind::OrSyncRespLeaf => Message::OrSyncRespLeaf(frame::decode_payload(frame)?),
            FrameKind::OrSyncDiffRequest => {
                Message::OrSyncDiffRequest(frame::decode_payload(frame)?)
            }
            FrameKind::OrSyncDiffResponse => {
                Message::OrSyncDiffResponse(frame::decode_payload(frame)?)
            }
            FrameKind::OrSyncPushDiff => Message::OrSyncPushDiff(frame::decode_payload(frame)?),
            FrameKind::ClusterOp => Message::ClusterOp(frame::decode_payload(frame)?),
            FrameKind::MemberJoin => Message::MemberJoin(frame::decode_payload(frame)?),
            FrameKind::MemberLeave => Message::MemberLeave(frame::decode_payload(frame)?),
            FrameKind::PartitionMapAnnounce => {
                Message::PartitionMapAnnounce(frame::decode_payload(frame)?)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::*;
    use crate::frame::{try_parse, DEFAULT_MAX_FRAME_LEN};
    use crate::hlc::Timestamp;
    use crate::types::Principal;

    fn wire_roundtrip(msg: &Message) -> Message {
        let bytes = msg.to_frame_bytes().expect("encode");
        let mut buf = BytesMut::from(&bytes[..]);
        let frame = try_parse(&mut buf, DEFAULT_MAX_FRAME_LEN)
            .expect("parse")
            .expect("complete");
        assert!(buf.is_empty());
        Message::from_frame(&frame).expect("decode")
    }

    #[test]
    fn session_messages_roundtrip_through_frames() {
        let messages = vec![
            Message::Auth(AuthPayload {
                token: "t".to_string(),
                protocol_version: None,
            }),
            Message::AuthOk(AuthOkPayload {
                principal: Principal {
                    user_id: "u".to_string(),
                    roles: vec![],
                },
            }),
            Message::Error(ErrorPayload {
                code: error_codes::RATE_LIMITED,
                message: "slow down".to_string(),
            }),
            Message::Heartbeat(HeartbeatPayload { ts: 1 }),
            Message::HeartbeatAck(HeartbeatAckPayload { ts: 1, server_ts: 2 }),
            Message::QueryUnsub(QueryUnsubPayload {
                query_id: "q".to_string(),
            }),
        ];
        for msg in messages {
            assert_eq!(wire_roundtrip(&msg), msg);
        }
    }

    #[test]
    fn sync_messages_roundtrip_through_frames() {
        let messages = vec![
            Message::SyncInit(SyncInitPayload {
                map_name: "m".to_string(),
                last_sync_ts: Some(5),
            }),
            Message::SyncRespRoot(SyncRespRootPayload {
                map_name: "m".to_string(),
                root_hash: 99,
                timestamp: Timestamp::new(1, 0, "n"),
            }),
            Message::SyncResetRequired(SyncResetRequiredPayload {
                map_name: "m".to_string(),
            }),
            Message::OrSyncResetRequired(SyncResetRequiredPayload {
                map_name: "m".to_string(),
            }),
            Message::SyncDiffRequest(SyncDiffRequestPayload {
                map_name: "m".to_string(),
                keys: vec!["k".to_string()],
            }),
        ];
        for msg in messages {
            assert_eq!(wire_roundtrip(&msg), msg);
        }
    }

    #[test]
    fn lww_and_or_reset_use_distinct_kinds() {
        let lww = Message::SyncResetRequired(SyncResetRequiredPayload {
            map_name: "m".to_string(),
        });
        let or = Message::OrSyncResetRequired(SyncResetRequiredPayload {
            map_name: "m".to_string(),
        });
        assert_eq!(lww.kind(), FrameKind::SyncResetRequired);
        assert_eq!(or.kind(), FrameKind::OrSyncResetRequired);
        assert_ne!(lww.kind() as u8, or.kind() as u8);
    }

    #[test]
    fn cluster_messages_roundtrip_through_frames() {
        let msg = Message::MemberJoin(MemberJoinPayload {
            node_id: "n2".to_string(),
            address: "host:1".to_string(),
        });
        assert_eq!(wire_roundtrip(&msg), msg);
    }
}
