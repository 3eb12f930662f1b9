//! Operation host: the public pipeline engine and the row handle given to operations.

use crossbeam_channel::{Receiver, Sender, bounded};
use log::{debug, trace, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::pipeline::context::{CounterSnapshot, Counters, PipelineContext};
use crate::pipeline::live_set::LiveSet;
use crate::pipeline::operation::{Chain, ChainLinks, Operation};
use crate::pipeline::orchestrator::{Evaluation, RunMode};
use crate::pipeline::queue::{RowQueue, create_row_queue};
use crate::pipeline::source::{RowIter, RowSource};
use crate::pipeline::worker::next_operation;
use crate::utils::config::{HostConfig, PackagePaths};
use crate::{OpId, Row, RowRef};

/// State shared by the driver, the worker and every [`RowHost`] handle of one run.
pub(crate) struct HostShared {
    pub(crate) config: HostConfig,
    pub(crate) ctx: PipelineContext,
    pub(crate) queue: Box<dyn RowQueue>,
    pub(crate) live: LiveSet,
    pub(crate) links: ChainLinks,
    /// Rows that entered the chain and are not yet terminal.
    pub(crate) active: AtomicUsize,
    /// Set by the worker when it leaves its loop for any reason.
    pub(crate) worker_exited: AtomicBool,
    progress_tx: Sender<()>,
}

impl HostShared {
    pub(crate) fn new(
        config: HostConfig,
        ctx: PipelineContext,
        links: ChainLinks,
    ) -> (Arc<Self>, Receiver<()>) {
        let (progress_tx, progress_rx) = bounded::<()>(1);
        let shared = Self {
            queue: create_row_queue(config.row_queue),
            live: LiveSet::new(config.live_set_lock_timeout),
            config,
            ctx,
            links,
            active: AtomicUsize::new(0),
            worker_exited: AtomicBool::new(false),
            progress_tx,
        };
        (Arc::new(shared), progress_rx)
    }

    /// Wake the driver if it is waiting on progress. Never blocks.
    pub(crate) fn notify_progress(&self) {
        let _ = self.progress_tx.try_send(());
    }

    /// A row owned by the worker reached a terminal state.
    pub(crate) fn row_terminated(&self) {
        let before = self.active.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(before > 0, "active row counter underflow");
        self.notify_progress();
    }

    pub(crate) fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

/// Handle to a running host, passed to [`Operation::apply`].
///
/// Operations use it to remove rows or to add new rows (e.g. duplicates) to the chain.
#[derive(Clone)]
pub struct RowHost {
    shared: Arc<HostShared>,
}

impl RowHost {
    pub(crate) fn new(shared: Arc<HostShared>) -> Self {
        Self { shared }
    }

    pub(crate) fn shared(&self) -> &HostShared {
        &self.shared
    }

    pub fn context(&self) -> &PipelineContext {
        &self.shared.ctx
    }

    pub fn config(&self) -> &HostConfig {
        &self.shared.config
    }

    /// Rows that entered the chain and are not yet finished or removed.
    pub fn active_rows(&self) -> usize {
        self.shared.active()
    }

    /// Rows currently held in the live set (not yet wiped).
    pub fn live_rows(&self) -> usize {
        self.shared.live.len()
    }

    /// Add one row. With `source = Some(op)` the row starts at the operation after `op`.
    pub fn add_row(&self, row: RowRef, source: Option<OpId>) {
        self.shared.live.insert(Arc::clone(&row));
        if self.enqueue(&row, source) {
            self.shared.queue.add_row(row);
            Counters::bump(&self.shared.ctx.counters.queue_signals, 1);
        }
    }

    /// Add a batch of rows with a single consumer wake-up.
    pub fn add_rows(&self, rows: Vec<RowRef>, source: Option<OpId>) {
        if rows.is_empty() {
            return;
        }
        self.shared.live.insert_many(&rows);
        let mut submitted = 0_usize;
        for row in rows {
            if self.enqueue(&row, source) {
                self.shared.queue.add_row_no_signal(row);
                submitted += 1;
            }
        }
        if submitted > 0 {
            self.shared.queue.signal();
            Counters::bump(&self.shared.ctx.counters.queue_signals, 1);
        }
    }

    /// Resolve the row's first step. Returns true when it must be queued; rows facing an empty
    /// remainder of the chain are finished on the spot.
    fn enqueue(&self, row: &RowRef, source: Option<OpId>) -> bool {
        Counters::bump(&self.shared.ctx.counters.rows_added, 1);
        row.set_current_operation(source);
        match next_operation(&self.shared.links, row) {
            Some(first) => {
                row.set_current_operation(Some(first));
                self.shared.active.fetch_add(1, Ordering::AcqRel);
                true
            }
            None => {
                if row.finish() {
                    Counters::bump(&self.shared.ctx.counters.rows_finished, 1);
                }
                false
            }
        }
    }

    /// Mark a row as removed. The active counter is settled when the worker next sees the row.
    pub fn remove_row(&self, row: &Row) {
        if row.mark_removed() {
            trace!("row#{} removed", row.id());
            Counters::bump(&self.shared.ctx.counters.rows_removed, 1);
        }
    }

    pub fn remove_rows<'a>(&self, rows: impl IntoIterator<Item = &'a RowRef>) {
        for row in rows {
            self.remove_row(row);
        }
    }
}

/// Outcome of a finished run, for callers and the CLI.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct RunSummary {
    /// Rows still active when the run stopped (non-zero after a failure or cancellation).
    pub rows_active: usize,
    pub cancelled: bool,
    pub failed: bool,
    pub counters: CounterSnapshot,
}

/// The pipeline engine: owns the configuration, the operation chain and the upstream source.
///
/// Runs consume the host. [`OperationHost::execute`] drains the pipeline and discards output;
/// [`OperationHost::evaluate`] returns a lazy iterator of finished rows.
pub struct OperationHost {
    config: HostConfig,
    chain: Chain,
    input: Option<Box<dyn RowSource>>,
}

impl OperationHost {
    pub fn new(config: HostConfig) -> Self {
        Self {
            config,
            chain: Chain::new(),
            input: None,
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    pub fn set_input(&mut self, source: Box<dyn RowSource>) {
        self.input = Some(source);
    }

    /// Builder form of [`OperationHost::set_input`].
    pub fn with_input(mut self, source: impl RowSource + 'static) -> Self {
        self.set_input(Box::new(source));
        self
    }

    pub fn add_operation(&mut self, op: Box<dyn Operation>) -> OpId {
        self.chain.push(op)
    }

    /// Builder form of [`OperationHost::add_operation`].
    pub fn operation(mut self, op: impl Operation + 'static) -> Self {
        self.add_operation(Box::new(op));
        self
    }

    /// Throttling limit the run will use after the deferred-batch starvation guard.
    pub fn effective_throttling_limit(&self) -> usize {
        self.config
            .effective_throttling_limit(self.chain.largest_batch_size())
            .0
    }

    /// Run to completion, discarding finished rows.
    pub fn execute(self, ctx: &PipelineContext) -> RunSummary {
        let mut evaluation = self.start(ctx, RunMode::Execute);
        evaluation.by_ref().for_each(drop);
        evaluation.summary()
    }

    /// Run lazily: finished rows are yielded as the caller iterates.
    pub fn evaluate(self, ctx: &PipelineContext) -> Evaluation {
        self.start(ctx, RunMode::Evaluate)
    }

    fn start(self, ctx: &PipelineContext, mode: RunMode) -> Evaluation {
        let Self {
            mut config,
            mut chain,
            input,
        } = self;
        let ctx = ctx.clone();

        if let Err(e) = config.validate() {
            ctx.report(e);
            return Evaluation::empty(ctx, mode);
        }

        let (limit, raised) = config.effective_throttling_limit(chain.largest_batch_size());
        if raised {
            warn!(
                "throttling_limit {} is below 10x the largest deferred batch size; raised to {}",
                config.throttling_limit, limit
            );
            config.throttling_limit = limit;
        }
        debug!(
            "{} CONFIG:{:#?}",
            PackagePaths::get().pkg_name().to_uppercase(),
            config
        );
        debug!("chain: {:?}", chain.names());

        if let Err(e) = chain.prepare_all(&ctx) {
            ctx.report(e);
            for failure in chain.shutdown_all(&ctx) {
                ctx.report(failure);
            }
            return Evaluation::empty(ctx, mode);
        }

        let no_buffer = input
            .as_ref()
            .is_some_and(|source| source.consumer_should_not_buffer());
        let rows: RowIter = match input {
            Some(source) => source.into_rows(&ctx),
            None => Box::new(std::iter::empty()),
        };
        Evaluation::start(config, ctx, mode, chain, rows, no_buffer)
    }
}

impl RowSource for OperationHost {
    fn into_rows(self: Box<Self>, ctx: &PipelineContext) -> RowIter {
        Box::new(self.evaluate(ctx))
    }
}
