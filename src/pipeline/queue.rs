//! Row queue: FIFO handoff between the driver and the single worker.
//!
//! Two implementations share the [`RowQueue`] contract: [`CondvarRowQueue`] (mutex + condvar,
//! the default) and [`ChannelRowQueue`] (crossbeam channels). Both support batched submission
//! (`add_row_no_signal` for each row, then one `signal`), a terminal "no more rows" mark, and a
//! blocking single-consumer iterator that ends once the backlog drains after that mark, or
//! immediately on cancellation / dispose.

use crossbeam_channel::{Receiver, Sender, TryRecvError, bounded, select, unbounded};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::RowRef;
use crate::pipeline::context::CancelToken;
use crate::utils::config::QUEUE_CANCEL_POLL;

/// Which [`RowQueue`] implementation a host instantiates.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum RowQueueType {
    #[default]
    Condvar,
    Channel,
}

/// Thread-safe FIFO of rows with deferred wake-up. No business validation happens here.
pub trait RowQueue: Send + Sync {
    /// Append and wake the consumer.
    fn add_row(&self, row: RowRef);
    /// Append without waking the consumer; pair with [`RowQueue::signal`].
    fn add_row_no_signal(&self, row: RowRef);
    /// Wake the consumer once after a batch of `add_row_no_signal` calls.
    fn signal(&self);
    /// No more rows will be submitted by the driver. The consumer ends after the backlog drains.
    fn signal_no_more_rows(&self);
    /// Release any waiting consumer; the consumer ends at its next check.
    fn dispose(&self);
    /// Rows currently waiting in the queue.
    fn len(&self) -> usize;
    fn is_completed(&self) -> bool;
    /// Count of signals so far. Rows added with `add_row_no_signal` do not bump it.
    fn generation(&self) -> u64;
    /// Block until a signal newer than `since` arrives, the queue completes, or `timeout` passes.
    /// Returns the current generation.
    fn wait_for_signal(&self, since: u64, timeout: Duration) -> u64;
    /// Blocking dequeue. `None` when completed and drained, cancelled, or disposed.
    fn pop(&self, cancel: &CancelToken) -> Option<RowRef>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl dyn RowQueue + '_ {
    /// Lazy, single-pass sequence over the queue. Only one consumer may exist at a time.
    pub fn consumer<'a>(&'a self, cancel: &'a CancelToken) -> RowConsumer<'a> {
        RowConsumer {
            queue: self,
            cancel,
            done: false,
        }
    }
}

/// Iterator returned by [`RowQueue::consumer`]. Once it yields `None` it stays exhausted.
pub struct RowConsumer<'a> {
    queue: &'a dyn RowQueue,
    cancel: &'a CancelToken,
    done: bool,
}

impl Iterator for RowConsumer<'_> {
    type Item = RowRef;

    fn next(&mut self) -> Option<RowRef> {
        if self.done {
            return None;
        }
        let row = self.queue.pop(self.cancel);
        if row.is_none() {
            self.done = true;
        }
        row
    }
}

pub fn create_row_queue(kind: RowQueueType) -> Box<dyn RowQueue> {
    match kind {
        RowQueueType::Condvar => Box::new(CondvarRowQueue::new()),
        RowQueueType::Channel => Box::new(ChannelRowQueue::new()),
    }
}

// ---- Condvar queue ----

#[derive(Default)]
struct QueueState {
    rows: VecDeque<RowRef>,
    completed: bool,
    disposed: bool,
    generation: u64,
}

/// Mutex-protected deque; the consumer sleeps on a condvar between signals.
#[derive(Default)]
pub struct CondvarRowQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl CondvarRowQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, mut state: MutexGuard<'_, QueueState>) {
        state.generation += 1;
        drop(state);
        self.ready.notify_all();
    }
}

impl RowQueue for CondvarRowQueue {
    fn add_row(&self, row: RowRef) {
        let mut state = self.lock();
        state.rows.push_back(row);
        self.notify(state);
    }

    fn add_row_no_signal(&self, row: RowRef) {
        self.lock().rows.push_back(row);
    }

    fn signal(&self) {
        let state = self.lock();
        self.notify(state);
    }

    fn signal_no_more_rows(&self) {
        let mut state = self.lock();
        state.completed = true;
        self.notify(state);
    }

    fn dispose(&self) {
        let mut state = self.lock();
        state.disposed = true;
        state.rows.clear();
        self.notify(state);
    }

    fn len(&self) -> usize {
        self.lock().rows.len()
    }

    fn is_completed(&self) -> bool {
        self.lock().completed
    }

    fn generation(&self) -> u64 {
        self.lock().generation
    }

    fn wait_for_signal(&self, since: u64, timeout: Duration) -> u64 {
        // No deadline when `timeout` is too large to add to the current instant.
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.lock();
        while state.generation == since && !state.completed && !state.disposed {
            state = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    self.ready
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self.ready.wait(state).unwrap_or_else(PoisonError::into_inner),
            };
        }
        state.generation
    }

    fn pop(&self, cancel: &CancelToken) -> Option<RowRef> {
        let mut state = self.lock();
        loop {
            if state.disposed || cancel.is_cancelled() {
                return None;
            }
            if let Some(row) = state.rows.pop_front() {
                return Some(row);
            }
            if state.completed {
                return None;
            }
            state = self
                .ready
                .wait_timeout(state, QUEUE_CANCEL_POLL)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

// ---- Channel queue ----

/// Unbounded crossbeam channel for rows plus a one-slot wake channel for signals.
///
/// Every send on the row channel can wake a blocked consumer, so `add_row_no_signal` only
/// skips the generation bump here.
pub struct ChannelRowQueue {
    rows_tx: Sender<RowRef>,
    rows_rx: Receiver<RowRef>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    completed: AtomicBool,
    disposed: AtomicBool,
    generation: AtomicU64,
}

impl ChannelRowQueue {
    pub fn new() -> Self {
        let (rows_tx, rows_rx) = unbounded::<RowRef>();
        let (wake_tx, wake_rx) = bounded::<()>(1);
        Self {
            rows_tx,
            rows_rx,
            wake_tx,
            wake_rx,
            completed: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        }
    }

    fn wake(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        let _ = self.wake_tx.try_send(());
    }
}

impl Default for ChannelRowQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl RowQueue for ChannelRowQueue {
    fn add_row(&self, row: RowRef) {
        let _ = self.rows_tx.send(row);
        self.wake();
    }

    fn add_row_no_signal(&self, row: RowRef) {
        let _ = self.rows_tx.send(row);
    }

    fn signal(&self) {
        self.wake();
    }

    fn signal_no_more_rows(&self) {
        self.completed.store(true, Ordering::Release);
        self.wake();
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
        while self.rows_rx.try_recv().is_ok() {}
        self.wake();
    }

    fn len(&self) -> usize {
        self.rows_rx.len()
    }

    fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn wait_for_signal(&self, since: u64, timeout: Duration) -> u64 {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            let current = self.generation();
            if current != since
                || self.is_completed()
                || self.disposed.load(Ordering::Acquire)
            {
                return current;
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return current;
                    }
                    let _ = self.wake_rx.recv_timeout(deadline - now);
                }
                None => {
                    let _ = self.wake_rx.recv();
                }
            }
        }
    }

    fn pop(&self, cancel: &CancelToken) -> Option<RowRef> {
        loop {
            if self.disposed.load(Ordering::Acquire) || cancel.is_cancelled() {
                return None;
            }
            match self.rows_rx.try_recv() {
                Ok(row) => return Some(row),
                Err(TryRecvError::Disconnected) => return None,
                Err(TryRecvError::Empty) => {
                    if self.is_completed() {
                        return None;
                    }
                }
            }
            select! {
                recv(self.rows_rx) -> msg => {
                    if let Ok(row) = msg {
                        if self.disposed.load(Ordering::Acquire) {
                            return None;
                        }
                        return Some(row);
                    }
                }
                recv(self.wake_rx) -> _ => {}
                default(QUEUE_CANCEL_POLL) => {}
            }
        }
    }
}
