//! Length-prefixed binary framing.
//!
//! Every frame on the wire is `u32 length | u8 kind | payload`, where
//! `length` counts the kind byte plus the payload and the payload is the
//! named-MsgPack encoding of the kind's message struct. The same framing
//! carries the client protocol and the cluster protocol; only the set of
//! kinds in use differs per listener.
//!
//! Decoding is incremental: [`try_parse`] consumes at most one complete
//! frame from a receive buffer and leaves partial input untouched, so the
//! transport can feed it arbitrary chunk boundaries.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Bytes of framing before the payload: length word plus kind byte.
pub const HEADER_LEN: usize = 5;

/// Default cap on `length` accepted from the wire.
pub const DEFAULT_MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// Frame type registry.
///
/// Values are wire bytes and must never be renumbered. Gaps group related
/// kinds: 1-15 session, 16-31 LWW sync, 32-47 OR sync, 48+ cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    Auth = 1,
    AuthOk = 2,
    Error = 3,
    ClientOp = 4,
    Ack = 5,
    MergeRejection = 6,
    ServerEvent = 7,
    QuerySub = 8,
    QueryUnsub = 9,
    QueryResult = 10,
    Heartbeat = 11,
    HeartbeatAck = 12,

    SyncInit = 16,
    SyncRespRoot = 17,
    SyncResetRequired = 18,
    SyncReqBucket = 19,
    SyncRespBuckets = 20,
    SyncRespLeaf = 21,
    SyncDiffRequest = 22,
    SyncDiffResponse = 23,
    SyncPushDiff = 24,

    OrSyncInit = 32,
    OrSyncRespRoot = 33,
    OrSyncResetRequired = 34,
    OrSyncReqBucket = 35,
    OrSyncRespBuckets = 36,
    OrSyncRespLeaf = 37,
    OrSyncDiffRequest = 38,
    OrSyncDiffResponse = 39,
    OrSyncPushDiff = 40,

    ClusterOp = 48,
    MemberJoin = 49,
    MemberLeave = 50,
    PartitionMapAnnounce = 51,
}

impl FrameKind {
    /// Decodes a wire byte into a kind.
    #[must_use]
    pub fn from_u8(byte: u8) -> Option<Self> {
        Some(match byte {
            1 => Self::Auth,
            2 => Self::AuthOk,
            3 => Self::Error,
            4 => Self::ClientOp,
            5 => Self::Ack,
            6 => Self::MergeRejection,
            7 => Self::ServerEvent,
            8 => Self::QuerySub,
            9 => Self::QueryUnsub,
            10 => Self::QueryResult,
            11 => Self::Heartbeat,
            12 => Self::HeartbeatAck,
            16 => Self::SyncInit,
            17 => Self::SyncRespRoot,
            18 => Self::SyncResetRequired,
            19 => Self::SyncReqBucket,
            20 => Self::SyncRespBuckets,
            21 => Self::SyncRespLeaf,
            22 => Self::SyncDiffRequest,
            23 => Self::SyncDiffResponse,
            24 => Self::SyncPushDiff,
            32 => Self::OrSyncInit,
            33 => Self::OrSyncRespRoot,
            34 => Self::OrSyncResetRequired,
            35 => Self::OrSyncReqBucket,
            36 => Self::OrSyncRespBuckets,
            37 => Self::OrSyncRespLeaf,
            38 => Self::OrSyncDiffRequest,
            39 => Self::OrSyncDiffResponse,
            40 => Self::OrSyncPushDiff,
            48 => Self::ClusterOp,
            49 => Self::MemberJoin,
            50 => Self::MemberLeave,
            51 => Self::PartitionMapAnnounce,
            _ => return None,
        })
    }
}

/// A complete frame: kind plus raw payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The frame kind from the wire.
    pub kind: FrameKind,
    /// MsgPack payload, not yet decoded.
    pub payload: Bytes,
}

/// Framing and payload codec errors.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// Declared frame length exceeds the configured cap. Maps to wire 413.
    #[error("frame length {len} exceeds limit {max}")]
    Oversize {
        /// Declared length (kind byte + payload).
        len: usize,
        /// Configured maximum.
        max: usize,
    },
    /// The kind byte is not in the registry. Maps to wire 400.
    #[error("unknown frame kind {0:#04x}")]
    UnknownKind(u8),
    /// Declared length smaller than the kind byte itself.
    #[error("frame length must be at least 1")]
    Underflow,
    /// Payload failed to serialize.
    #[error("payload encode: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    /// Payload failed to deserialize as the expected struct.
    #[error("payload decode: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    /// Transport-level I/O failure surfaced through a frame codec.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Encodes one frame into a fresh buffer.
///
/// # Errors
///
/// Returns [`FrameError::Encode`] when the payload cannot serialize.
pub fn encode_frame<T: Serialize>(kind: FrameKind, payload: &T) -> Result<Bytes, FrameError> {
    let mut buf = BytesMut::new();
    encode_frame_into(kind, payload, &mut buf)?;
    Ok(buf.freeze())
}

/// Encodes one frame, appending to an existing buffer.
///
/// # Errors
///
/// Returns [`FrameError::Encode`] when the payload cannot serialize.
pub fn encode_frame_into<T: Serialize>(
    kind: FrameKind,
    payload: &T,
    buf: &mut BytesMut,
) -> Result<(), FrameError> {
    let body = rmp_serde::to_vec_named(payload)?;
    let len = u32::try_from(body.len() + 1).map_err(|_| FrameError::Oversize {
        len: body.len() + 1,
        max: u32::MAX as usize,
    })?;
    buf.reserve(HEADER_LEN + body.len());
    buf.put_u32(len);
    buf.put_u8(kind as u8);
    buf.put_slice(&body);
    Ok(())
}

/// Attempts to consume one complete frame from the buffer.
///
/// Returns `Ok(None)` when more bytes are needed; the buffer is only
/// advanced once a full frame is available. Oversize and unknown-kind
/// errors are detected from the header before the payload arrives, so a
/// hostile length word cannot force unbounded buffering.
///
/// # Errors
///
/// Returns [`FrameError::Oversize`], [`FrameError::UnknownKind`], or
/// [`FrameError::Underflow`] for malformed headers.
pub fn try_parse(buf: &mut BytesMut, max_len: usize) -> Result<Option<Frame>, FrameError> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }

    let declared = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if declared < 1 {
        return Err(FrameError::Underflow);
    }
    if declared > max_len {
        return Err(FrameError::Oversize {
            len: declared,
            max: max_len,
        });
    }

    let kind_byte = buf[4];
    let Some(kind) = FrameKind::from_u8(kind_byte) else {
        return Err(FrameError::UnknownKind(kind_byte));
    };

    let total = 4 + declared;
    if buf.len() < total {
        return Ok(None);
    }

    buf.advance(HEADER_LEN);
    let payload = buf.split_to(declared - 1).freeze();
    Ok(Some(Frame { kind, payload }))
}

/// Decodes a frame's payload as a typed message struct.
///
/// # Errors
///
/// Returns [`FrameError::Decode`] when the payload does not match `T`.
pub fn decode_payload<T: DeserializeOwned>(frame: &Frame) -> Result<T, FrameError> {
    Ok(rmp_serde::from_slice(&frame.payload)?)
}
