//! Mutation journal: a capped ring with a durable tail.
//!
//! Every accepted mutation lands here exactly once, in acceptance order,
//! under a per-node monotonic sequence. The newest `capacity` events stay
//! in memory for range reads (audit, debugging, late subscribers); the
//! tail is flushed to a [`JournalStore`] in batches, and a failed batch
//! is re-queued at the head so nothing is dropped while the backend is
//! down. On startup the newest rows are read back newest-first, then
//! replayed in ascending order under a loading flag so replay is not
//! mistaken for fresh mutations.

mod store;

pub use store::{JournalStore, MemoryJournalStore};

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use lattice_core::messages::EventKind;
use lattice_core::types::Value;
use lattice_core::{ClockSource, Timestamp};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::config::JournalConfig;
use crate::storage::StorageError;

/// One journalled mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalEvent {
    /// Per-node monotonic sequence, assigned on acceptance.
    pub sequence: u64,
    /// Mutation category.
    pub kind: EventKind,
    /// Map the mutation targeted.
    pub map_name: String,
    /// Key the mutation targeted.
    pub key: String,
    /// Value after the mutation, if any.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub value: Option<Value>,
    /// Value before the mutation, if any.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub previous_value: Option<Value>,
    /// Causal timestamp of the mutation.
    pub timestamp: Timestamp,
    /// Node that accepted the mutation.
    pub node_id: String,
    /// Free-form annotations (origin session, resolver decisions, ...).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub metadata: Option<BTreeMap<String, String>>,
    /// Wall-clock millis when the event was journalled; retention keys
    /// off this.
    pub created_at: u64,
}

/// Range-read filter.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Only events for this map.
    pub map_name: Option<String>,
    /// Only events of this kind.
    pub kind: Option<EventKind>,
}

impl EventFilter {
    fn accepts(&self, event: &JournalEvent) -> bool {
        self.map_name
            .as_deref()
            .is_none_or(|m| event.map_name == m)
            && self.kind.is_none_or(|k| event.kind == k)
    }
}

/// The append-only journal.
pub struct EventJournal {
    config: JournalConfig,
    ring: RwLock<VecDeque<JournalEvent>>,
    pending: Mutex<VecDeque<JournalEvent>>,
    next_sequence: AtomicU64,
    loading: AtomicBool,
    store: Option<Arc<dyn JournalStore>>,
    clock: Arc<dyn ClockSource>,
    flush_signal: Notify,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl EventJournal {
    /// Creates a journal. Without a store, events live only in the ring.
    #[must_use]
    pub fn new(
        config: JournalConfig,
        store: Option<Arc<dyn JournalStore>>,
        clock: Arc<dyn ClockSource>,
    ) -> Self {
        Self {
            config,
            ring: RwLock::new(VecDeque::new()),
            pending: Mutex::new(VecDeque::new()),
            next_sequence: AtomicU64::new(1),
            loading: AtomicBool::new(false),
            store,
            clock,
            flush_signal: Notify::new(),
            flusher: Mutex::new(None),
        }
    }

    /// Appends a mutation and returns its sequence.
    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &self,
        kind: EventKind,
        map_name: &str,
        key: &str,
        value: Option<Value>,
        previous_value: Option<Value>,
        timestamp: Timestamp,
        node_id: &str,
        metadata: Option<BTreeMap<String, String>>,
    ) -> u64 {
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let event = JournalEvent {
            sequence,
            kind,
            map_name: map_name.to_string(),
            key: key.to_string(),
            value,
            previous_value,
            timestamp,
            node_id: node_id.to_string(),
            metadata,
            created_at: self.clock.now(),
        };

        self.push_ring(event.clone());

        if self.store.is_some() {
            let pending_len = {
                let mut pending = self.pending.lock();
                pending.push_back(event);
                pending.len()
            };
            if pending_len >= self.config.persist_batch_size {
                self.flush_signal.notify_one();
            }
        }
        metrics::counter!("lattice_journal_appended_total").increment(1);
        sequence
    }

    /// Whether the journal is replaying persisted rows.
    ///
    /// While set, consumers must not re-broadcast events they observe
    /// being appended; they are history, not fresh mutations.
    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::Relaxed)
    }

    /// The highest sequence assigned so far (0 when empty).
    #[must_use]
    pub fn latest_sequence(&self) -> u64 {
        self.next_sequence.load(Ordering::Relaxed) - 1
    }

    /// Number of events in the in-memory ring.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ring.read().len()
    }

    /// Whether the ring is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ring.read().is_empty()
    }

    /// Events not yet flushed to the store.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Scans events with `from_sequence <= sequence <= to_sequence`,
    /// optionally filtered. Unflushed tail events are served from memory
    /// like any others.
    #[must_use]
    pub fn events(
        &self,
        from_sequence: u64,
        to_sequence: u64,
        filter: &EventFilter,
    ) -> Vec<JournalEvent> {
        self.ring
            .read()
            .iter()
            .filter(|e| e.sequence >= from_sequence && e.sequence <= to_sequence)
            .filter(|e| filter.accepts(e))
            .cloned()
            .collect()
    }

    /// Flushes at most one batch of pending events.
    ///
    /// On failure the batch returns to the head of the pending queue in
    /// its original order; the in-memory view is unaffected either way.
    ///
    /// # Errors
    ///
    /// Propagates the store error after re-queuing.
    pub async fn flush_once(&self) -> Result<usize, StorageError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };

        let batch: Vec<JournalEvent> = {
            let mut pending = self.pending.lock();
            let take = pending.len().min(self.config.persist_batch_size);
            pending.drain(..take).collect()
        };
        if batch.is_empty() {
            return Ok(0);
        }

        match store.persist(&batch).await {
            Ok(()) => {
                metrics::counter!("lattice_journal_flushed_total")
                    .increment(batch.len() as u64);
                Ok(batch.len())
            }
            Err(err) => {
                let mut pending = self.pending.lock();
                for event in batch.into_iter().rev() {
                    pending.push_front(event);
                }
                tracing::warn!(%err, pending = pending.len(), "journal flush failed, batch re-queued");
                Err(err)
            }
        }
    }

    /// Replays the newest persisted rows into the ring.
    ///
    /// Rows arrive newest-first from the store and are applied in
    /// ascending sequence order; the sequence counter resumes after the
    /// highest replayed value.
    ///
    /// # Errors
    ///
    /// Propagates store read failures; the journal stays empty then.
    pub async fn replay(&self) -> Result<usize, StorageError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };

        self.loading.store(true, Ordering::Relaxed);
        let result = async {
            let mut rows = store.load_recent(self.config.capacity).await?;
            rows.reverse(); // newest-first from the store -> ascending
            let count = rows.len();

            let mut max_sequence = 0;
            for event in rows {
                max_sequence = max_sequence.max(event.sequence);
                self.push_ring(event);
            }
            if max_sequence > 0 {
                self.next_sequence
                    .store(max_sequence + 1, Ordering::Relaxed);
            }
            Ok(count)
        }
        .await;
        self.loading.store(false, Ordering::Relaxed);
        result
    }

    /// Deletes persisted rows older than the retention horizon, returning
    /// the deleted count.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn cleanup_retention(&self) -> Result<u64, StorageError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let cutoff = self
            .clock
            .now()
            .saturating_sub(u64::try_from(self.config.retention.as_millis()).unwrap_or(u64::MAX));
        let deleted = store.delete_created_before(cutoff).await?;
        if deleted > 0 {
            tracing::info!(deleted, cutoff, "journal retention cleanup");
        }
        Ok(deleted)
    }

    /// Spawns the flush driver: flushes on the persist interval and
    /// whenever a full batch accumulates.
    pub fn start(self: &Arc<Self>) {
        let journal = Arc::clone(self);
        let interval = self.config.persist_interval;
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(interval) => {}
                    () = journal.flush_signal.notified() => {}
                }
                while journal.pending_len() > 0 {
                    if journal.flush_once().await.is_err() {
                        break; // back off until the next interval
                    }
                }
            }
        });
        *self.flusher.lock() = Some(handle);
    }

    /// Stops the flush driver; pending events stay queued.
    pub fn stop(&self) {
        if let Some(handle) = self.flusher.lock().take() {
            handle.abort();
        }
    }

    fn push_ring(&self, event: JournalEvent) {
        let mut ring = self.ring.write();
        if ring.len() >= self.config.capacity {
            ring.pop_front();
        }
        ring.push_back(event);
    }
}
