//! Bounded FIFO queue with a reject policy.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

/// Callback invoked with the rejected item when an enqueue fails.
pub type RejectPolicy<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// A capped FIFO queue.
///
/// `push` fails once `capacity` items are queued; the reject policy (if
/// configured) observes the rejected item, typically to count a metric or
/// notify the producer, and the item is handed back to the caller.
pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    on_reject: Option<RejectPolicy<T>>,
}

impl<T> BoundedQueue<T> {
    /// Creates a queue holding at most `capacity` items.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(1_024))),
            capacity,
            on_reject: None,
        }
    }

    /// Creates a queue with a reject policy.
    #[must_use]
    pub fn with_reject_policy(capacity: usize, on_reject: RejectPolicy<T>) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(1_024))),
            capacity,
            on_reject: Some(on_reject),
        }
    }

    /// Enqueues an item, or returns it when the queue is full.
    ///
    /// # Errors
    ///
    /// Returns `Err(item)` (after invoking the reject policy) when the
    /// queue already holds `capacity` items.
    pub fn push(&self, item: T) -> Result<(), T> {
        let mut items = self.items.lock();
        if items.len() >= self.capacity {
            drop(items);
            if let Some(policy) = &self.on_reject {
                policy(&item);
            }
            return Err(item);
        }
        items.push_back(item);
        Ok(())
    }

    /// Dequeues the oldest item.
    pub fn pop(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    /// Current queue depth.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Configured capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
