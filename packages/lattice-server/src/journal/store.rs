//! Durable backing for the journal tail.
//!
//! The persisted shape is one table: sequence (primary key), kind, map
//! name, key, value, previous value, timestamp, node id, metadata, and
//! created-at, indexed by map name, `(map, key)`, created-at, and node
//! id. Real drivers live outside the crate; the in-memory store backs
//! tests and single-node runs.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::storage::StorageError;

use super::JournalEvent;

/// Durable append target for journal batches.
#[async_trait]
pub trait JournalStore: Send + Sync {
    /// Persists a batch. Must be durable before returning. Re-persisting
    /// a sequence already stored must be idempotent (upsert by sequence).
    async fn persist(&self, events: &[JournalEvent]) -> Result<(), StorageError>;

    /// Loads the newest `limit` rows, newest first.
    async fn load_recent(&self, limit: usize) -> Result<Vec<JournalEvent>, StorageError>;

    /// Deletes rows with `created_at < cutoff_millis`, returning the
    /// deleted count.
    async fn delete_created_before(&self, cutoff_millis: u64) -> Result<u64, StorageError>;
}

/// In-memory journal store ordered by sequence.
#[derive(Default)]
pub struct MemoryJournalStore {
    rows: Mutex<Vec<JournalEvent>>,
    unavailable: AtomicBool,
}

impl MemoryJournalStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Switches the store into (or out of) a failing state.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    /// Number of persisted rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    /// Whether no rows are persisted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }

    /// All rows in ascending sequence order.
    #[must_use]
    pub fn all(&self) -> Vec<JournalEvent> {
        self.rows.lock().clone()
    }

    fn check_available(&self) -> Result<(), StorageError> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(StorageError::Unavailable(
                "journal store switched unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl JournalStore for MemoryJournalStore {
    async fn persist(&self, events: &[JournalEvent]) -> Result<(), StorageError> {
        self.check_available()?;
        let mut rows = self.rows.lock();
        for event in events {
            match rows.binary_search_by_key(&event.sequence, |e| e.sequence) {
                Ok(pos) => rows[pos] = event.clone(),
                Err(pos) => rows.insert(pos, event.clone()),
            }
        }
        Ok(())
    }

    async fn load_recent(&self, limit: usize) -> Result<Vec<JournalEvent>, StorageError> {
        self.check_available()?;
        let rows = self.rows.lock();
        Ok(rows.iter().rev().take(limit).cloned().collect())
    }

    async fn delete_created_before(&self, cutoff_millis: u64) -> Result<u64, StorageError> {
        self.check_available()?;
        let mut rows = self.rows.lock();
        let before = rows.len();
        rows.retain(|e| e.created_at >= cutoff_millis);
        Ok((before - rows.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use lattice_core::messages::EventKind;
    use lattice_core::{Timestamp, Value};

    use super::*;

    fn event(sequence: u64, created_at: u64) -> JournalEvent {
        JournalEvent {
            sequence,
            kind: EventKind::Put,
            map_name: "m".to_string(),
            key: format!("k{sequence}"),
            value: Some(Value::Int(1)),
            previous_value: None,
            timestamp: Timestamp::new(sequence, 0, "n"),
            node_id: "n".to_string(),
            metadata: None,
            created_at,
        }
    }

    #[tokio::test]
    async fn persist_is_idempotent_by_sequence() {
        let store = MemoryJournalStore::new();
        store.persist(&[event(1, 10), event(2, 20)]).await.unwrap();
        store.persist(&[event(2, 20), event(3, 30)]).await.unwrap();
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn load_recent_returns_newest_first() {
        let store = MemoryJournalStore::new();
        store
            .persist(&[event(1, 10), event(2, 20), event(3, 30)])
            .await
            .unwrap();
        let recent = store.load_recent(2).await.unwrap();
        assert_eq!(recent[0].sequence, 3);
        assert_eq!(recent[1].sequence, 2);
    }

    #[tokio::test]
    async fn delete_created_before_counts() {
        let store = MemoryJournalStore::new();
        store
            .persist(&[event(1, 10), event(2, 20), event(3, 30)])
            .await
            .unwrap();
        assert_eq!(store.delete_created_before(25).await.unwrap(), 2);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn journal_event_serde_roundtrip() {
        let mut meta = std::collections::BTreeMap::new();
        meta.insert("origin".to_string(), "session-1".to_string());
        let mut e = event(7, 70);
        e.metadata = Some(meta);

        let bytes = rmp_serde::to_vec_named(&e).unwrap();
        let decoded: JournalEvent = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(decoded, e);
    }
}
