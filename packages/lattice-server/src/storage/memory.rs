//! In-memory storage adapter.
//!
//! Reference implementation of [`StorageAdapter`]: a two-level map under
//! a `DashMap`, with an unavailability switch so tests and failure drills
//! can exercise the retry path without a real backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use lattice_core::StorageValue;

use super::{StorageAdapter, StorageError};

/// Hash-map backed adapter. Durability is trivially immediate.
#[derive(Default)]
pub struct MemoryStorageAdapter {
    maps: DashMap<String, HashMap<String, StorageValue>>,
    unavailable: AtomicBool,
}

impl MemoryStorageAdapter {
    /// Creates an empty adapter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Switches the adapter into (or out of) a failing state in which
    /// every call returns [`StorageError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    /// Number of entries stored for a map.
    #[must_use]
    pub fn len(&self, map: &str) -> usize {
        self.maps.get(map).map_or(0, |m| m.len())
    }

    /// Whether a map holds no entries.
    #[must_use]
    pub fn is_empty(&self, map: &str) -> bool {
        self.len(map) == 0
    }

    fn check_available(&self) -> Result<(), StorageError> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(StorageError::Unavailable(
                "memory adapter switched unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageAdapter for MemoryStorageAdapter {
    async fn initialize(&self) -> Result<(), StorageError> {
        self.check_available()
    }

    async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn load(&self, map: &str, key: &str) -> Result<Option<StorageValue>, StorageError> {
        self.check_available()?;
        Ok(self.maps.get(map).and_then(|m| m.get(key).cloned()))
    }

    async fn load_all(
        &self,
        map: &str,
        keys: &[String],
    ) -> Result<HashMap<String, StorageValue>, StorageError> {
        self.check_available()?;
        let Some(entries) = self.maps.get(map) else {
            return Ok(HashMap::new());
        };
        Ok(keys
            .iter()
            .filter_map(|k| entries.get(k).map(|v| (k.clone(), v.clone())))
            .collect())
    }

    async fn load_all_keys(&self, map: &str) -> Result<Vec<String>, StorageError> {
        self.check_available()?;
        Ok(self
            .maps
            .get(map)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn store(
        &self,
        map: &str,
        key: &str,
        value: StorageValue,
    ) -> Result<(), StorageError> {
        self.check_available()?;
        self.maps
            .entry(map.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn store_all(
        &self,
        map: &str,
        entries: HashMap<String, StorageValue>,
    ) -> Result<(), StorageError> {
        self.check_available()?;
        self.maps.entry(map.to_string()).or_default().extend(entries);
        Ok(())
    }

    async fn delete(&self, map: &str, key: &str) -> Result<(), StorageError> {
        self.check_available()?;
        if let Some(mut entries) = self.maps.get_mut(map) {
            entries.remove(key);
        }
        Ok(())
    }

    async fn delete_all(&self, map: &str, keys: &[String]) -> Result<(), StorageError> {
        self.check_available()?;
        if let Some(mut entries) = self.maps.get_mut(map) {
            for key in keys {
                entries.remove(key);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use lattice_core::lww_map::LwwRecord;
    use lattice_core::{Timestamp, Value};

    use super::*;

    fn lww(n: i64) -> StorageValue {
        StorageValue::Lww {
            record: LwwRecord {
                value: Some(Value::Int(n)),
                timestamp: Timestamp::new(n.unsigned_abs(), 0, "n"),
                ttl_ms: None,
            },
        }
    }

    #[tokio::test]
    async fn store_load_delete_cycle() {
        let adapter = MemoryStorageAdapter::new();
        adapter.initialize().await.unwrap();

        adapter.store("users", "a", lww(1)).await.unwrap();
        assert_eq!(adapter.load("users", "a").await.unwrap(), Some(lww(1)));
        assert_eq!(adapter.load("users", "missing").await.unwrap(), None);

        adapter.delete("users", "a").await.unwrap();
        assert_eq!(adapter.load("users", "a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn bulk_operations() {
        let adapter = MemoryStorageAdapter::new();
        let entries: HashMap<String, StorageValue> =
            (0..5).map(|i| (format!("k{i}"), lww(i))).collect();
        adapter.store_all("m", entries).await.unwrap();

        let mut keys = adapter.load_all_keys("m").await.unwrap();
        keys.sort();
        assert_eq!(keys.len(), 5);

        let loaded = adapter
            .load_all("m", &["k0".to_string(), "k3".to_string(), "nope".to_string()])
            .await
            .unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.get("k3"), Some(&lww(3)));

        adapter
            .delete_all("m", &["k0".to_string(), "k1".to_string()])
            .await
            .unwrap();
        assert_eq!(adapter.len("m"), 3);
    }

    #[tokio::test]
    async fn maps_are_isolated() {
        let adapter = MemoryStorageAdapter::new();
        adapter.store("a", "k", lww(1)).await.unwrap();
        adapter.store("b", "k", lww(2)).await.unwrap();
        assert_eq!(adapter.load("a", "k").await.unwrap(), Some(lww(1)));
        assert_eq!(adapter.load("b", "k").await.unwrap(), Some(lww(2)));
    }

    #[tokio::test]
    async fn unavailable_mode_fails_every_call() {
        let adapter = MemoryStorageAdapter::new();
        adapter.store("m", "k", lww(1)).await.unwrap();

        adapter.set_unavailable(true);
        assert!(matches!(
            adapter.load("m", "k").await,
            Err(StorageError::Unavailable(_))
        ));
        assert!(adapter.store("m", "k", lww(2)).await.is_err());

        adapter.set_unavailable(false);
        // The pre-outage write survived; the failed write never landed.
        assert_eq!(adapter.load("m", "k").await.unwrap(), Some(lww(1)));
    }
}
