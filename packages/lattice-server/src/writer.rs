//! Per-connection coalescing writer.
//!
//! Small messages dominate the outbound traffic of a busy map (acks,
//! server events); writing each as its own transport send wastes
//! syscalls. The writer buffers encoded frames per connection and flushes
//! them as one contiguous batch when any limit trips: message count,
//! batch bytes, or age of the oldest buffered frame. Urgent messages
//! bypass coalescing with `flush_now`.
//!
//! Flushes preserve FIFO order: a batch is the concatenation of frames in
//! write order, and batches leave through a bounded channel in order.

use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use lattice_core::Message;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::CoalesceConfig;
use crate::error::ServerError;

#[derive(Debug)]
struct BatchState {
    buffer: BytesMut,
    count: usize,
    oldest: Option<Instant>,
}

#[derive(Debug)]
struct Inner {
    config: CoalesceConfig,
    state: Mutex<BatchState>,
    out: mpsc::Sender<Bytes>,
}

/// Batching writer in front of one connection's outbound channel.
#[derive(Debug)]
pub struct CoalescingWriter {
    inner: Arc<Inner>,
    flusher: JoinHandle<()>,
}

impl CoalescingWriter {
    /// Creates a writer emitting batches into `out` and starts its delay
    /// flusher.
    #[must_use]
    pub fn new(config: CoalesceConfig, out: mpsc::Sender<Bytes>) -> Self {
        let inner = Arc::new(Inner {
            config,
            state: Mutex::new(BatchState {
                buffer: BytesMut::new(),
                count: 0,
                oldest: None,
            }),
            out,
        });

        // The delay flusher only has to catch batches that never reach a
        // size limit; it polls at half the max delay for bounded lag.
        let flusher_inner = inner.clone();
        let poll = inner.config.max_delay / 2;
        let flusher = tokio::spawn(async move {
            loop {
                tokio::time::sleep(poll.max(std::time::Duration::from_millis(1))).await;
                let due = {
                    let state = flusher_inner.state.lock();
                    state
                        .oldest
                        .is_some_and(|t| t.elapsed() >= flusher_inner.config.max_delay)
                };
                if due {
                    let _ = Inner::flush(&flusher_inner).await;
                }
            }
        });

        Self { inner, flusher }
    }

    /// Buffers a message, flushing when a limit trips or `flush_now` is
    /// set.
    ///
    /// # Errors
    ///
    /// Returns an error when the message fails to encode or the
    /// connection channel has closed.
    pub async fn write(&self, message: &Message, flush_now: bool) -> Result<(), ServerError> {
        let bytes = message.to_frame_bytes()?;

        let should_flush = {
            let mut state = self.inner.state.lock();
            state.buffer.extend_from_slice(&bytes);
            state.count += 1;
            if state.oldest.is_none() {
                state.oldest = Some(Instant::now());
            }
            flush_now
                || state.count >= self.inner.config.max_batch_count
                || state.buffer.len() >= self.inner.config.max_batch_bytes
        };

        if should_flush {
            Inner::flush(&self.inner).await?;
        }
        Ok(())
    }

    /// Flushes whatever is buffered, regardless of limits.
    ///
    /// # Errors
    ///
    /// Returns an error when the connection channel has closed.
    pub async fn flush(&self) -> Result<(), ServerError> {
        Inner::flush(&self.inner).await
    }

    /// Number of messages currently buffered.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.inner.state.lock().count
    }

    /// Stops the delay flusher. Buffered messages are dropped; callers
    /// flush first when draining gracefully.
    pub fn close(&self) {
        self.flusher.abort();
    }
}

impl Drop for CoalescingWriter {
    fn drop(&mut self) {
        self.flusher.abort();
    }
}

impl Inner {
    async fn flush(inner: &Arc<Inner>) -> Result<(), ServerError> {
        let batch = {
            let mut state = inner.state.lock();
            if state.count == 0 {
                return Ok(());
            }
            metrics::histogram!("lattice_writer_batch_messages").record(state.count as f64);
            state.count = 0;
            state.oldest = None;
            state.buffer.split().freeze()
        };
        inner
            .out
            .send(batch)
            .await
            .map_err(|_| ServerError::Cancelled)
    }
}
