//! Iterator-driven tasklets.
//!
//! Wrap any iterator so that each scheduler slice consumes a bounded
//! number of items. Filtering and mapping compose on the iterator itself
//! (`iter.filter(..).map(..)`); these adapters only add the slicing and
//! the result delivery.

use tokio::sync::oneshot;

use super::{Tasklet, TaskletProgress};

/// Runs a closure over every item, a bounded batch per slice.
pub struct ForEachTasklet<I, F> {
    iter: I,
    each: F,
    per_slice: usize,
}

impl<I, F> ForEachTasklet<I, F>
where
    I: Iterator + Send + 'static,
    I::Item: Send,
    F: FnMut(I::Item) + Send + 'static,
{
    /// Wraps `iter`, invoking `each` on every item.
    pub fn new(iter: I, per_slice: usize, each: F) -> Self {
        Self {
            iter,
            each,
            per_slice: per_slice.max(1),
        }
    }
}

impl<I, F> Tasklet for ForEachTasklet<I, F>
where
    I: Iterator + Send + 'static,
    I::Item: Send,
    F: FnMut(I::Item) + Send + 'static,
{
    fn run(&mut self) -> TaskletProgress {
        for _ in 0..self.per_slice {
            match self.iter.next() {
                Some(item) => (self.each)(item),
                None => return TaskletProgress::Done,
            }
        }
        TaskletProgress::MadeProgress
    }
}

/// Folds every item into an accumulator and delivers the result through a
/// oneshot when the iterator is exhausted.
pub struct ReduceTasklet<I, Acc, F> {
    iter: I,
    acc: Option<Acc>,
    fold: F,
    per_slice: usize,
    out: Option<oneshot::Sender<Acc>>,
}

impl<I, Acc, F> ReduceTasklet<I, Acc, F>
where
    I: Iterator + Send + 'static,
    I::Item: Send,
    Acc: Send + 'static,
    F: FnMut(Acc, I::Item) -> Acc + Send + 'static,
{
    /// Wraps `iter`, folding with `fold` from `initial`. The accumulated
    /// value arrives on the returned receiver when the tasklet completes;
    /// a cancelled tasklet drops the sender instead.
    pub fn new(
        iter: I,
        per_slice: usize,
        initial: Acc,
        fold: F,
    ) -> (Self, oneshot::Receiver<Acc>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                iter,
                acc: Some(initial),
                fold,
                per_slice: per_slice.max(1),
                out: Some(tx),
            },
            rx,
        )
    }
}

impl<I, Acc, F> Tasklet for ReduceTasklet<I, Acc, F>
where
    I: Iterator + Send + 'static,
    I::Item: Send,
    Acc: Send + 'static,
    F: FnMut(Acc, I::Item) -> Acc + Send + 'static,
{
    fn run(&mut self) -> TaskletProgress {
        let Some(mut acc) = self.acc.take() else {
            return TaskletProgress::Done;
        };
        for _ in 0..self.per_slice {
            match self.iter.next() {
                Some(item) => acc = (self.fold)(acc, item),
                None => {
                    if let Some(out) = self.out.take() {
                        let _ = out.send(acc);
                    }
                    return TaskletProgress::Done;
                }
            }
        }
        self.acc = Some(acc);
        TaskletProgress::MadeProgress
    }
}
