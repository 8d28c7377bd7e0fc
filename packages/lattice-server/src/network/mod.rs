//! Transport-facing adapters.
//!
//! The wire transport itself (TCP, websocket, TLS) lives outside this
//! crate; what lives here is the seam a transport needs: a tokio codec
//! that turns a byte stream into parsed frames and typed messages back
//! into bytes.

mod codec;

pub use codec::FrameCodec;
