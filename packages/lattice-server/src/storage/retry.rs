//! Write-behind retry queue for storage failures.
//!
//! A storage outage must not lose writes or stall the op pipeline: the
//! local apply and journal append already happened, so the failed
//! persistence is parked here and re-driven on a timer with jitter until
//! the backend recovers. Entries for the same `(map, key)` collapse to
//! the newest value; older versions are obsolete the moment a newer one
//! is queued.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use lattice_core::StorageValue;
use parking_lot::Mutex;
use rand::Rng;
use tokio::task::JoinHandle;

use super::{StorageAdapter, StorageError};

/// Pending writes keyed by `(map, key)`.
type PendingWrites = HashMap<(String, String), StorageValue>;

/// Queue of storage writes awaiting a successful retry.
pub struct StoreRetryQueue {
    adapter: Arc<dyn StorageAdapter>,
    pending: Arc<Mutex<PendingWrites>>,
    interval: Duration,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl StoreRetryQueue {
    /// Creates a queue retrying against `adapter` every `interval`
    /// (plus up to 25% jitter).
    #[must_use]
    pub fn new(adapter: Arc<dyn StorageAdapter>, interval: Duration) -> Self {
        Self {
            adapter,
            pending: Arc::new(Mutex::new(HashMap::new())),
            interval,
            driver: Mutex::new(None),
        }
    }

    /// Parks a failed write for retry. The newest value per key wins.
    pub fn enqueue(&self, map: &str, key: &str, value: StorageValue) {
        self.pending
            .lock()
            .insert((map.to_string(), key.to_string()), value);
        metrics::gauge!("lattice_storage_retry_pending").set(self.len() as f64);
    }

    /// Number of writes waiting for retry.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Whether nothing is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Attempts every pending write once; writes that fail again stay
    /// queued (a newer value queued meanwhile is preserved). Returns the
    /// number of writes that succeeded.
    pub async fn drain_once(&self) -> usize {
        let snapshot: Vec<((String, String), StorageValue)> = {
            let pending = self.pending.lock();
            pending
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };

        let mut flushed = 0;
        for ((map, key), value) in snapshot {
            match self.adapter.store(&map, &key, value.clone()).await {
                Ok(()) => {
                    let mut pending = self.pending.lock();
                    // Only clear the slot if no newer value replaced it
                    // while the store was in flight.
                    if pending.get(&(map.clone(), key.clone())) == Some(&value) {
                        pending.remove(&(map, key));
                    }
                    flushed += 1;
                }
                Err(err) => {
                    tracing::debug!(map, key, %err, "storage retry still failing");
                }
            }
        }
        if flushed > 0 {
            metrics::counter!("lattice_storage_retry_flushed_total").increment(flushed as u64);
        }
        flushed
    }

    /// Spawns the retry driver on the current runtime.
    pub fn start(self: &Arc<Self>) {
        let queue = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                let jitter = {
                    let mut rng = rand::rng();
                    rng.random_range(0..=queue.interval.as_millis() as u64 / 4)
                };
                tokio::time::sleep(queue.interval + Duration::from_millis(jitter)).await;
                if !queue.is_empty() {
                    queue.drain_once().await;
                }
            }
        });
        *self.driver.lock() = Some(handle);
    }

    /// Stops the retry driver. Pending writes stay queued in memory.
    pub fn stop(&self) {
        if let Some(handle) = self.driver.lock().take() {
            handle.abort();
        }
    }

    /// Last-resort flush for shutdown: one pass, errors traced.
    ///
    /// # Errors
    ///
    /// Returns the first error encountered if any write still fails.
    pub async fn flush_all(&self) -> Result<(), StorageError> {
        self.drain_once().await;
        if self.is_empty() {
            Ok(())
        } else {
            Err(StorageError::Unavailable(format!(
                "{} writes still unflushed",
                self.len()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use lattice_core::lww_map::LwwRecord;
    use lattice_core::{Timestamp, Value};

    use super::super::MemoryStorageAdapter;
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
    async fn drains_once_backend_recovers() {
        let adapter = Arc::new(MemoryStorageAdapter::new());
        let queue = StoreRetryQueue::new(adapter.clone(), Duration::from_millis(10));

        adapter.set_unavailable(true);
        queue.enqueue("m", "k", lww(1));
        assert_eq!(queue.drain_once().await, 0);
        assert_eq!(queue.len(), 1);

        adapter.set_unavailable(false);
        assert_eq!(queue.drain_once().await, 1);
        assert!(queue.is_empty());
        assert_eq!(adapter.load("m", "k").await.unwrap(), Some(lww(1)));
    }

    #[tokio::test]
    async fn newest_value_per_key_wins() {
        let adapter = Arc::new(MemoryStorageAdapter::new());
        let queue = StoreRetryQueue::new(adapter.clone(), Duration::from_millis(10));

        queue.enqueue("m", "k", lww(1));
        queue.enqueue("m", "k", lww(2));
        assert_eq!(queue.len(), 1);

        queue.drain_once().await;
        assert_eq!(adapter.load("m", "k").await.unwrap(), Some(lww(2)));
    }

    #[tokio::test]
    async fn driver_retries_in_background() {
        let adapter = Arc::new(MemoryStorageAdapter::new());
        let queue = Arc::new(StoreRetryQueue::new(
            adapter.clone(),
            Duration::from_millis(5),
        ));

        adapter.set_unavailable(true);
        queue.enqueue("m", "k", lww(9));
        queue.start();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(queue.len(), 1, "still parked while unavailable");

        adapter.set_unavailable(false);
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !queue.is_empty() && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(queue.is_empty(), "driver must flush after recovery");
        queue.stop();
    }

    #[tokio::test]
    async fn flush_all_reports_residue() {
        let adapter = Arc::new(MemoryStorageAdapter::new());
        let queue = StoreRetryQueue::new(adapter.clone(), Duration::from_millis(10));

        adapter.set_unavailable(true);
        queue.enqueue("m", "k", lww(1));
        assert!(queue.flush_all().await.is_err());

        adapter.set_unavailable(false);
        assert!(queue.flush_all().await.is_ok());
    }
}
