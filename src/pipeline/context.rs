//! Run context: cancellation, failure collection and counters shared by a pipeline run.
//! Passed explicitly into every host so independent pipelines never share ambient state.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::PipelineError;

/// Cooperative stop signal checked at every driver and worker loop boundary.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Raw flag, e.g. for a Ctrl+C handler.
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.0)
    }
}

/// Named counters emitted by the engine. Observability only; never read for control flow.
#[derive(Debug, Default)]
pub struct Counters {
    pub rows_added: AtomicU64,
    pub rows_finished: AtomicU64,
    pub rows_removed: AtomicU64,
    pub rows_wiped: AtomicU64,
    pub rows_yielded: AtomicU64,
    pub batches_submitted: AtomicU64,
    pub throttle_waits: AtomicU64,
    pub queue_signals: AtomicU64,
    pub deferred_flushes: AtomicU64,
}

/// Point-in-time copy of [`Counters`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub rows_added: u64,
    pub rows_finished: u64,
    pub rows_removed: u64,
    pub rows_wiped: u64,
    pub rows_yielded: u64,
    pub batches_submitted: u64,
    pub throttle_waits: u64,
    pub queue_signals: u64,
    pub deferred_flushes: u64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CounterSnapshot {
            rows_added: get(&self.rows_added),
            rows_finished: get(&self.rows_finished),
            rows_removed: get(&self.rows_removed),
            rows_wiped: get(&self.rows_wiped),
            rows_yielded: get(&self.rows_yielded),
            batches_submitted: get(&self.batches_submitted),
            throttle_waits: get(&self.throttle_waits),
            queue_signals: get(&self.queue_signals),
            deferred_flushes: get(&self.deferred_flushes),
        }
    }
}

/// Shared context for a pipeline run. Cheap to clone; clones see the same state.
///
/// The engine reports failures here and polls cancellation from here. It never decides
/// whether a run succeeded: callers inspect [`PipelineContext::failures`] afterwards
/// (see [`check_for_failures`](crate::pipeline::check_for_failures)).
#[derive(Clone, Debug, Default)]
pub struct PipelineContext {
    pub cancel: CancelToken,
    pub failures: Arc<Mutex<Vec<PipelineError>>>,
    pub counters: Arc<Counters>,
}

impl PipelineContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn report(&self, failure: PipelineError) {
        log::error!("{}", failure);
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(failure);
    }

    pub fn has_failures(&self) -> bool {
        !self
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    pub fn failure_count(&self) -> usize {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Drain collected failures.
    pub fn take_failures(&self) -> Vec<PipelineError> {
        std::mem::take(&mut *self.failures.lock().unwrap_or_else(PoisonError::into_inner))
    }
}
