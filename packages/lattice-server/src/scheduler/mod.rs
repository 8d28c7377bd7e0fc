//! Cooperative tasklet scheduler.
//!
//! Long-running work (query scans, bulk merges) must not monopolize the
//! runtime: a [`Tasklet`] does a bounded slice of work per [`Tasklet::run`]
//! call and reports whether it finished, advanced, or is waiting. The
//! scheduler keeps a bounded set of active tasklets and drives them
//! round-robin from a tick loop, with a time budget per tasklet and a
//! wall-clock cap per tick, sleeping between ticks so the I/O loop always
//! gets its turn.
//!
//! Cancellation is cooperative: the flag is checked at slice boundaries
//! and a cancelled tasklet gets [`Tasklet::on_cancel`] before its waiter
//! resolves. A synchronous fast path ([`TaskletScheduler::run_inline`])
//! exists for work known to be small.

mod iter;

pub use iter::{ForEachTasklet, ReduceTasklet};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::config::SchedulerConfig;

/// What one work slice accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskletProgress {
    /// The tasklet finished; resolve its waiter.
    Done,
    /// Work was done and more remains; run again soon.
    MadeProgress,
    /// Nothing could be done right now; retry next tick.
    NoProgress,
}

/// How a tasklet ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskletOutcome {
    /// Ran to completion.
    Completed,
    /// Cancelled before completion.
    Cancelled,
}

/// A cooperatively scheduled unit of work.
pub trait Tasklet: Send + 'static {
    /// Performs one bounded slice of work.
    fn run(&mut self) -> TaskletProgress;

    /// Invoked once when the tasklet is cancelled before completion.
    fn on_cancel(&mut self) {}
}

/// Waiter handle for a scheduled tasklet.
pub struct TaskletHandle {
    cancel: Arc<AtomicBool>,
    done: oneshot::Receiver<TaskletOutcome>,
}

impl TaskletHandle {
    /// Requests cancellation; observed at the next slice boundary.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// Waits for the tasklet to finish or be cancelled.
    pub async fn wait(self) -> TaskletOutcome {
        self.done.await.unwrap_or(TaskletOutcome::Cancelled)
    }
}

struct Active {
    tasklet: Box<dyn Tasklet>,
    cancel: Arc<AtomicBool>,
    done: Option<oneshot::Sender<TaskletOutcome>>,
}

impl Active {
    fn finish(mut self, outcome: TaskletOutcome) {
        if outcome == TaskletOutcome::Cancelled {
            self.tasklet.on_cancel();
        }
        if let Some(done) = self.done.take() {
            let _ = done.send(outcome);
        }
    }
}

struct Inner {
    config: SchedulerConfig,
    /// Tasklets in the active round-robin rotation.
    active: Mutex<VecDeque<Active>>,
    /// Submissions beyond `max_active`, promoted as slots free up.
    waiting: Mutex<VecDeque<Active>>,
}

/// Round-robin, time-budgeted tasklet runner.
#[derive(Clone)]
pub struct TaskletScheduler {
    inner: Arc<Inner>,
    ticker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl TaskletScheduler {
    /// Creates a scheduler; call [`TaskletScheduler::start`] to begin
    /// ticking, or drive [`TaskletScheduler::tick`] manually in tests.
    #[must_use]
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                active: Mutex::new(VecDeque::new()),
                waiting: Mutex::new(VecDeque::new()),
            }),
            ticker: Arc::new(Mutex::new(None)),
        }
    }

    /// Items an iterating tasklet should process per slice.
    #[must_use]
    pub fn items_per_slice(&self) -> usize {
        self.inner.config.items_per_slice
    }

    /// Submits a tasklet and returns its waiter handle.
    pub fn schedule(&self, tasklet: Box<dyn Tasklet>) -> TaskletHandle {
        let cancel = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = oneshot::channel();
        let active = Active {
            tasklet,
            cancel: cancel.clone(),
            done: Some(done_tx),
        };

        let active_len = {
            let mut queue = self.inner.active.lock();
            if queue.len() < self.inner.config.max_active {
                queue.push_back(active);
                queue.len()
            } else {
                drop(queue);
                self.inner.waiting.lock().push_back(active);
                self.inner.config.max_active
            }
        };
        metrics::gauge!("lattice_scheduler_active").set(active_len as f64);

        TaskletHandle {
            cancel,
            done: done_rx,
        }
    }

    /// Synchronous fast path: drives a tasklet to completion on the
    /// caller's thread, up to `max_slices` slices.
    ///
    /// Returns `Done` if the tasklet finished within the allowance, or
    /// the last progress value otherwise (the caller then schedules it).
    pub fn run_inline(tasklet: &mut dyn Tasklet, max_slices: usize) -> TaskletProgress {
        let mut last = TaskletProgress::NoProgress;
        for _ in 0..max_slices {
            last = tasklet.run();
            if last != TaskletProgress::MadeProgress {
                break;
            }
        }
        last
    }

    /// Number of tasklets in the rotation (waiting excluded).
    #[must_use]
    pub fn active_len(&self) -> usize {
        self.inner.active.lock().len()
    }

    /// Runs one scheduler tick: promote waiters, then give every active
    /// tasklet at most one budgeted turn, stopping early when the tick's
    /// wall-clock cap is spent.
    pub fn tick(&self) {
        self.promote_waiting();

        let rotation_len = self.inner.active.lock().len();
        let tick_deadline = Instant::now() + self.inner.config.tick_budget;

        for _ in 0..rotation_len {
            if Instant::now() >= tick_deadline {
                break;
            }
            let Some(mut active) = self.inner.active.lock().pop_front() else {
                break;
            };

            if active.cancel.load(Ordering::Relaxed) {
                active.finish(TaskletOutcome::Cancelled);
                continue;
            }

            let budget = Instant::now() + self.inner.config.tasklet_budget;
            let finish_outcome = loop {
                match active.tasklet.run() {
                    TaskletProgress::Done => {
                        break Some(TaskletOutcome::Completed);
                    }
                    TaskletProgress::NoProgress => break None,
                    TaskletProgress::MadeProgress => {
                        if active.cancel.load(Ordering::Relaxed) {
                            break Some(TaskletOutcome::Cancelled);
                        }
                        if Instant::now() >= budget || Instant::now() >= tick_deadline {
                            break None;
                        }
                    }
                }
            };
            match finish_outcome {
                Some(outcome) => active.finish(outcome),
                None => self.inner.active.lock().push_back(active),
            }
        }
    }

    fn promote_waiting(&self) {
        let mut active = self.inner.active.lock();
        let mut waiting = self.inner.waiting.lock();
        while active.len() < self.inner.config.max_active {
            match waiting.pop_front() {
                Some(tasklet) => active.push_back(tasklet),
                None => break,
            }
        }
    }

    /// Spawns the tick loop on the current runtime.
    ///
    /// The loop sleeps `tick_interval` between ticks so transport I/O and
    /// timers run interleaved with tasklet work.
    pub fn start(&self) {
        let scheduler = self.clone();
        let interval = self.inner.config.tick_interval;
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                scheduler.tick();
            }
        });
        *self.ticker.lock() = Some(handle);
    }

    /// Stops the tick loop and cancels everything still queued.
    pub fn stop(&self) {
        if let Some(handle) = self.ticker.lock().take() {
            handle.abort();
        }
        let drained: Vec<Active> = {
            let mut active = self.inner.active.lock();
            let mut waiting = self.inner.waiting.lock();
            active.drain(..).chain(waiting.drain(..)).collect()
        };
        for tasklet in drained {
            tasklet.finish(TaskletOutcome::Cancelled);
        }
    }
}
