//! Durable storage seam.
//!
//! The core never talks to a database directly: it writes through the
//! [`StorageAdapter`] trait and treats failures as retryable. The
//! in-memory adapter serves tests and single-node deployments; real
//! drivers live outside this crate.

mod adapter;
mod memory;
mod retry;

pub use adapter::{StorageAdapter, StorageError};
pub use memory::MemoryStorageAdapter;
pub use retry::StoreRetryQueue;
