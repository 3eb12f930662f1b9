//! Driver loop: buffer input, submit batches, throttle, wipe, and shut the run down.
//!
//! [`Evaluation`] is the driver as a lazy iterator. Each `next()` advances the loop until a
//! finished row is ready to hand out or the run is over, so a streaming caller drives progress
//! by iterating and execution mode simply drains it.

use crossbeam_channel::Receiver;
use log::{debug, warn};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;
use std::time::Instant;

use crate::error::PipelineError;
use crate::pipeline::context::{Counters, PipelineContext};
use crate::pipeline::host::{HostShared, RowHost, RunSummary};
use crate::pipeline::operation::Chain;
use crate::pipeline::source::RowIter;
use crate::pipeline::worker::spawn_worker;
use crate::utils::config::HostConfig;
use crate::RowRef;

/// Whether wiped rows are handed to the caller or dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunMode {
    Execute,
    Evaluate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Feeding,
    Draining,
    Done,
}

/// A running pipeline. Iterating yields finished rows (nothing in execution mode).
///
/// Single-pass and not restartable. Dropping it before it is exhausted disposes the queue,
/// joins the worker and shuts the operations down; unfinished rows are abandoned.
pub struct Evaluation {
    ctx: PipelineContext,
    mode: RunMode,
    phase: Phase,
    run: Option<ActiveRun>,
    ready: VecDeque<RowRef>,
    rows_active_at_end: usize,
}

/// Everything that only exists while the worker is alive.
struct ActiveRun {
    config: HostConfig,
    shared: Arc<HostShared>,
    host: RowHost,
    progress_rx: Receiver<()>,
    worker: Option<JoinHandle<Chain>>,
    input: RowIter,
    no_buffer: bool,
    buffer: Vec<RowRef>,
    last_wipe: Instant,
    started: Instant,
}

impl Evaluation {
    /// A run that never started (configuration or preparation failure).
    pub(crate) fn empty(ctx: PipelineContext, mode: RunMode) -> Self {
        Self {
            ctx,
            mode,
            phase: Phase::Done,
            run: None,
            ready: VecDeque::new(),
            rows_active_at_end: 0,
        }
    }

    pub(crate) fn start(
        config: HostConfig,
        ctx: PipelineContext,
        mode: RunMode,
        chain: Chain,
        input: RowIter,
        no_buffer: bool,
    ) -> Self {
        let (shared, progress_rx) = HostShared::new(config.clone(), ctx.clone(), chain.links());
        let worker = match spawn_worker(chain, Arc::clone(&shared)) {
            Ok(handle) => handle,
            Err(e) => {
                ctx.report(PipelineError::WorkerSpawn(e));
                return Self::empty(ctx, mode);
            }
        };
        debug!(
            "run started: buffer={} limit={} keep_order={} queue={:?}",
            config.input_buffer_size, config.throttling_limit, config.keep_order, config.row_queue
        );
        let buffer = Vec::with_capacity(config.input_buffer_size);
        Self {
            ctx,
            mode,
            phase: Phase::Feeding,
            run: Some(ActiveRun {
                host: RowHost::new(Arc::clone(&shared)),
                config,
                shared,
                progress_rx,
                worker: Some(worker),
                input,
                no_buffer,
                buffer,
                last_wipe: Instant::now(),
                started: Instant::now(),
            }),
            ready: VecDeque::new(),
            rows_active_at_end: 0,
        }
    }

    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done && self.ready.is_empty()
    }

    /// Summary of the run so far; final once the iterator is exhausted.
    pub fn summary(&self) -> RunSummary {
        RunSummary {
            rows_active: match &self.run {
                Some(run) => run.shared.active(),
                None => self.rows_active_at_end,
            },
            cancelled: self.ctx.is_cancelled(),
            failed: self.ctx.has_failures(),
            counters: self.ctx.counters.snapshot(),
        }
    }

    fn step(&mut self) {
        let Some(run) = self.run.as_mut() else {
            self.phase = Phase::Done;
            return;
        };
        let collect = (self.mode == RunMode::Evaluate).then_some(&mut self.ready);
        match self.phase {
            Phase::Feeding => {
                if run.feed(collect) {
                    self.phase = Phase::Draining;
                }
            }
            Phase::Draining => {
                if run.drain(collect) {
                    self.finish();
                }
            }
            Phase::Done => {}
        }
    }

    /// Join the worker, shut the chain down and reclaim what is left.
    fn finish(&mut self) {
        let Some(mut run) = self.run.take() else {
            self.phase = Phase::Done;
            return;
        };
        let collect = (self.mode == RunMode::Evaluate).then_some(&mut self.ready);
        self.rows_active_at_end = run.shutdown(collect);
        self.phase = Phase::Done;
    }
}

impl Iterator for Evaluation {
    type Item = RowRef;

    fn next(&mut self) -> Option<RowRef> {
        loop {
            if let Some(row) = self.ready.pop_front() {
                Counters::bump(&self.ctx.counters.rows_yielded, 1);
                return Some(row);
            }
            if self.phase == Phase::Done {
                return None;
            }
            self.step();
        }
    }
}

impl Drop for Evaluation {
    fn drop(&mut self) {
        if let Some(run) = self.run.as_ref() {
            debug!("evaluation dropped before completion; disposing queue");
            run.shared.queue.dispose();
            self.finish();
        }
    }
}

impl ActiveRun {
    fn stopping(&self) -> bool {
        self.ctx().is_cancelled() || self.shared.worker_exited.load(Ordering::Acquire)
    }

    fn ctx(&self) -> &PipelineContext {
        &self.shared.ctx
    }

    /// Pull one input row and act on it. Returns true once input is exhausted (or the run is
    /// stopping) and the queue has been told no more rows will come.
    fn feed(&mut self, collect: Option<&mut VecDeque<RowRef>>) -> bool {
        let exhausted = if self.stopping() {
            true
        } else {
            match self.input.next() {
                Some(row) => {
                    row.enter_pipeline();
                    self.buffer.push(row);
                    if self.no_buffer || self.buffer.len() >= self.config.input_buffer_size {
                        self.submit();
                        self.throttle();
                    }
                    false
                }
                None => {
                    self.submit();
                    true
                }
            }
        };
        self.maybe_wipe(collect);
        if exhausted {
            debug!(
                "input exhausted after {:?}; {} rows active",
                self.started.elapsed(),
                self.shared.active()
            );
            self.shared.queue.signal_no_more_rows();
        }
        exhausted
    }

    fn submit(&mut self) {
        if self.buffer.is_empty() || self.stopping() {
            return;
        }
        let batch = std::mem::replace(
            &mut self.buffer,
            Vec::with_capacity(self.config.input_buffer_size),
        );
        self.host.add_rows(batch, None);
        Counters::bump(&self.ctx().counters.batches_submitted, 1);
    }

    /// Soft backpressure: wait for progress while too many rows are active, but never longer
    /// than `throttling_max_sleep` in one go.
    fn throttle(&mut self) {
        let limit = self.config.throttling_limit;
        if self.shared.active() <= limit {
            return;
        }
        let started = Instant::now();
        while self.shared.active() > limit && !self.stopping() {
            if started.elapsed() >= self.config.throttling_max_sleep {
                debug!(
                    "throttling: {} rows still active after {:?}; proceeding",
                    self.shared.active(),
                    self.config.throttling_max_sleep
                );
                break;
            }
            Counters::bump(&self.ctx().counters.throttle_waits, 1);
            let _ = self
                .progress_rx
                .recv_timeout(self.config.throttling_sleep_resolution);
        }
    }

    /// Wait for progress, wipe, and report whether the run can be shut down.
    fn drain(&mut self, collect: Option<&mut VecDeque<RowRef>>) -> bool {
        if self.shared.active() == 0 || self.stopping() {
            return true;
        }
        let _ = self.progress_rx.recv_timeout(self.config.main_loop_delay);
        self.maybe_wipe(collect);
        false
    }

    fn maybe_wipe(&mut self, collect: Option<&mut VecDeque<RowRef>>) {
        if self.last_wipe.elapsed() >= self.config.main_loop_delay {
            self.wipe(collect);
        }
    }

    fn wipe(&mut self, collect: Option<&mut VecDeque<RowRef>>) {
        self.wipe_with(self.config.keep_order, collect);
    }

    fn wipe_with(&mut self, keep_order: bool, collect: Option<&mut VecDeque<RowRef>>) {
        let stats = self.shared.live.wipe(keep_order, collect);
        self.last_wipe = Instant::now();
        if stats.wiped > 0 {
            Counters::bump(&self.ctx().counters.rows_wiped, stats.wiped as u64);
        }
    }

    /// Returns the number of rows still active when the run stopped.
    fn shutdown(&mut self, collect: Option<&mut VecDeque<RowRef>>) -> usize {
        let ctx = self.ctx().clone();
        if ctx.is_cancelled() {
            self.shared.queue.dispose();
        }
        // Rows parked in the queue would keep a halted worker's queue alive; release them.
        if self.shared.worker_exited.load(Ordering::Acquire) {
            self.shared.queue.dispose();
        }
        self.shared.queue.signal_no_more_rows();

        match self.worker.take().map(JoinHandle::join) {
            Some(Ok(mut chain)) => {
                for failure in chain.shutdown_all(&ctx) {
                    ctx.report(failure);
                }
            }
            Some(Err(_)) => ctx.report(PipelineError::WorkerPanicked),
            None => {}
        }

        // Worker joined: take every finished row left, in insertion order, also those behind
        // a row that will never finish.
        self.wipe_with(false, collect);
        let active = self.shared.active();
        let counters = ctx.counters.snapshot();
        debug!(
            "run finished in {:?}: {}",
            self.started.elapsed(),
            serde_json::to_string(&counters).unwrap_or_default()
        );
        if active > 0 {
            warn!(
                "run stopped with {} rows active and {} rows still in the live set",
                active,
                self.shared.live.len()
            );
        }
        active
    }
}
