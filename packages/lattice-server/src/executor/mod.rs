//! Backpressured work queues.
//!
//! [`BoundedQueue`] is the building block: a capped FIFO with a reject
//! policy invoked when an enqueue fails. [`StripedExecutor`] arranges
//! bounded queues into key-hashed stripes so that work sharing a key is
//! serialized while unrelated work runs in parallel — the mechanism that
//! gives per-map mutation ordering without a global lock.

mod bounded;
mod striped;

pub use bounded::{BoundedQueue, RejectPolicy};
pub use striped::{HighWaterHook, StripedExecutor, StripedExecutorBuilder};

/// Errors from executor submission.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// The stripe's queue is at capacity.
    #[error("stripe {stripe} queue is full")]
    QueueFull {
        /// The stripe that rejected the task.
        stripe: usize,
    },
    /// The executor has been shut down.
    #[error("executor is shut down")]
    ShutDown,
}
