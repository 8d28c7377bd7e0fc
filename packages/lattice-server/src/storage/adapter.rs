//! The storage adapter contract.

use std::collections::HashMap;

use async_trait::async_trait;
use lattice_core::StorageValue;

/// Storage failures. All variants are retryable from the core's point of
/// view: the local op stays applied in memory and in the journal, and a
/// retry queue re-drives the write.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// The backend is unreachable or refused the request.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    /// The backend accepted the request but failed mid-flight.
    #[error("storage io: {0}")]
    Io(String),
    /// Stored bytes failed to decode; the row is unusable.
    #[error("storage corruption: {0}")]
    Corrupt(String),
}

/// Durable key-value storage, scoped by map name.
///
/// Implementations must be durable before returning from any `store*` or
/// `delete*` call. All methods are object-safe; the core holds the
/// adapter as `Arc<dyn StorageAdapter>`.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Prepares the backend (connections, schema). Called once at boot.
    async fn initialize(&self) -> Result<(), StorageError>;

    /// Releases backend resources. Called once at shutdown.
    async fn close(&self) -> Result<(), StorageError>;

    /// Loads one value.
    async fn load(&self, map: &str, key: &str) -> Result<Option<StorageValue>, StorageError>;

    /// Loads several values; absent keys are simply missing from the
    /// result.
    async fn load_all(
        &self,
        map: &str,
        keys: &[String],
    ) -> Result<HashMap<String, StorageValue>, StorageError>;

    /// Lists every key stored for a map.
    async fn load_all_keys(&self, map: &str) -> Result<Vec<String>, StorageError>;

    /// Stores one value durably.
    async fn store(&self, map: &str, key: &str, value: StorageValue)
        -> Result<(), StorageError>;

    /// Stores several values durably.
    async fn store_all(
        &self,
        map: &str,
        entries: HashMap<String, StorageValue>,
    ) -> Result<(), StorageError>;

    /// Deletes one key.
    async fn delete(&self, map: &str, key: &str) -> Result<(), StorageError>;

    /// Deletes several keys.
    async fn delete_all(&self, map: &str, keys: &[String]) -> Result<(), StorageError>;
}
