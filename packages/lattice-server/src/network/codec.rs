//! Tokio codec for the length-prefixed frame protocol.

use bytes::{Bytes, BytesMut};
use lattice_core::frame::{self, Frame, FrameError, DEFAULT_MAX_FRAME_LEN};
use lattice_core::Message;
use tokio_util::codec::{Decoder, Encoder};

/// Frame codec for `tokio_util::codec::Framed` transports.
///
/// Decoding yields parsed [`Frame`]s (header validated, payload still
/// raw); encoding accepts typed [`Message`]s or pre-encoded batches from
/// the coalescing writer.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_len: usize,
}

impl FrameCodec {
    /// Creates a codec with an explicit inbound frame size cap.
    #[must_use]
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        frame::try_parse(src, self.max_frame_len)
    }
}

impl Encoder<&Message> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, message: &Message, dst: &mut BytesMut) -> Result<(), FrameError> {
        let bytes = message.to_frame_bytes()?;
        dst.extend_from_slice(&bytes);
        Ok(())
    }
}

/// Pre-framed bytes (coalesced batches) pass through untouched.
impl Encoder<Bytes> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, batch: Bytes, dst: &mut BytesMut) -> Result<(), FrameError> {
        dst.extend_from_slice(&batch);
        Ok(())
    }
}
