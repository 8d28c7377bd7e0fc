//! Key-striped executor with per-stripe FIFO workers.

use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;

use crate::config::ExecutorConfig;

use super::{BoundedQueue, ExecutorError};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Notification fired when a stripe's queue depth crosses the high-water
/// mark on submit. Receives `(stripe, depth)`.
pub type HighWaterHook = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// Builder for [`StripedExecutor`].
pub struct StripedExecutorBuilder {
    config: ExecutorConfig,
    high_water: Option<HighWaterHook>,
}

impl StripedExecutorBuilder {
    /// Starts a builder from executor configuration.
    #[must_use]
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            high_water: None,
        }
    }

    /// Installs a high-water notification hook.
    #[must_use]
    pub fn high_water(mut self, hook: HighWaterHook) -> Self {
        self.high_water = Some(hook);
        self
    }

    /// Spawns the stripe workers onto the current tokio runtime.
    #[must_use]
    pub fn build(self) -> StripedExecutor {
        StripedExecutor::start(self.config, self.high_water)
    }
}

struct Stripe {
    queue: Arc<BoundedQueue<Job>>,
    /// Wakes the stripe worker when work arrives.
    signal: Arc<Notify>,
}

/// A pool of FIFO workers, one bounded queue per stripe.
///
/// Tasks hash to a stripe by key: tasks sharing a key execute in
/// submission order on one worker, while different stripes run in
/// parallel. Submission is non-blocking; a full stripe invokes the
/// queue's reject policy and fails with [`ExecutorError::QueueFull`],
/// which the caller surfaces as overload.
pub struct StripedExecutor {
    stripes: Vec<Stripe>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    hasher: ahash::RandomState,
    shut_down: Arc<AtomicBool>,
    high_water_mark: usize,
    high_water_hook: Option<HighWaterHook>,
}

impl StripedExecutor {
    fn start(config: ExecutorConfig, high_water: Option<HighWaterHook>) -> Self {
        let stripe_count = config.stripes.max(1);
        let shut_down = Arc::new(AtomicBool::new(false));
        let mut stripes = Vec::with_capacity(stripe_count);
        let mut workers = Vec::with_capacity(stripe_count);

        for index in 0..stripe_count {
            let queue: Arc<BoundedQueue<Job>> = Arc::new(BoundedQueue::with_reject_policy(
                config.queue_capacity,
                Arc::new(move |_job: &Job| {
                    metrics::counter!("lattice_executor_rejected_total", "stripe" => index.to_string())
                        .increment(1);
                }),
            ));
            let signal = Arc::new(Notify::new());

            let worker_queue = queue.clone();
            let worker_signal = signal.clone();
            let worker_stop = shut_down.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    match worker_queue.pop() {
                        Some(job) => {
                            job();
                            // Cooperative: give the I/O driver a turn
                            // between jobs.
                            tokio::task::yield_now().await;
                        }
                        None => {
                            if worker_stop.load(Ordering::Relaxed) {
                                return;
                            }
                            worker_signal.notified().await;
                        }
                    }
                }
            }));

            stripes.push(Stripe { queue, signal });
        }

        Self {
            stripes,
            workers: Mutex::new(workers),
            hasher: ahash::RandomState::new(),
            shut_down,
            high_water_mark: config.high_water_mark,
            high_water_hook: high_water,
        }
    }

    /// Number of stripes.
    #[must_use]
    pub fn stripe_count(&self) -> usize {
        self.stripes.len()
    }

    /// The stripe a key routes to.
    #[must_use]
    pub fn stripe_of(&self, key: &str) -> usize {
        let mut hasher = self.hasher.build_hasher();
        key.hash(&mut hasher);
        (hasher.finish() % self.stripes.len() as u64) as usize
    }

    /// Current queue depth of a stripe.
    #[must_use]
    pub fn depth(&self, stripe: usize) -> usize {
        self.stripes[stripe].queue.len()
    }

    /// Submits a task keyed by `key`, without waiting for execution.
    ///
    /// # Errors
    ///
    /// [`ExecutorError::QueueFull`] when the stripe's queue is at
    /// capacity; [`ExecutorError::ShutDown`] after shutdown.
    pub fn submit(
        &self,
        key: &str,
        job: impl FnOnce() + Send + 'static,
    ) -> Result<(), ExecutorError> {
        if self.shut_down.load(Ordering::Relaxed) {
            return Err(ExecutorError::ShutDown);
        }
        let stripe = self.stripe_of(key);
        let slot = &self.stripes[stripe];

        if slot.queue.push(Box::new(job)).is_err() {
            return Err(ExecutorError::QueueFull { stripe });
        }
        let depth = slot.queue.len();
        metrics::gauge!("lattice_executor_stripe_depth", "stripe" => stripe.to_string())
            .set(depth as f64);
        if depth >= self.high_water_mark {
            metrics::counter!("lattice_executor_high_water_total").increment(1);
            tracing::warn!(stripe, depth, "stripe queue above high-water mark");
            if let Some(hook) = &self.high_water_hook {
                hook(stripe, depth);
            }
        }
        slot.signal.notify_one();
        Ok(())
    }

    /// Submits a closure and awaits its return value.
    ///
    /// # Errors
    ///
    /// Submission errors as for [`StripedExecutor::submit`];
    /// [`ExecutorError::ShutDown`] if the worker dropped the job during
    /// shutdown.
    pub async fn execute<R, F>(&self, key: &str, job: F) -> Result<R, ExecutorError>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.submit(key, move || {
            let _ = tx.send(job());
        })?;
        rx.await.map_err(|_| ExecutorError::ShutDown)
    }

    /// Stops accepting work, drains queued jobs, and stops the workers.
    pub async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Relaxed);
        for stripe in &self.stripes {
            while !stripe.queue.is_empty() {
                stripe.signal.notify_one();
                tokio::task::yield_now().await;
            }
            // Wake the worker one last time so it observes the flag.
            stripe.signal.notify_one();
        }
        let workers = {
            let mut guard = self.workers.lock();
            std::mem::take(&mut *guard)
        };
        for handle in workers {
            let _ = handle.await;
        }
    }
}
