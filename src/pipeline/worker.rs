//! The single worker: pulls rows from the queue and drives each one along the chain.

use log::{debug, error};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};

use crate::error::{PipelineError, PipelineResult};
use crate::pipeline::context::Counters;
use crate::pipeline::host::{HostShared, RowHost};
use crate::pipeline::operation::{Chain, ChainLinks};
use crate::utils::config::PackagePaths;
use crate::{DeferState, OpId, Row, RowRef, RowState};

/// Next step for a row: none once the row is terminal, otherwise the chain's successor of its
/// current operation (or the first operation when it has none).
pub fn next_operation(links: &ChainLinks, row: &Row) -> Option<OpId> {
    if row.state() != RowState::Normal {
        return None;
    }
    links.next_after(row.current_operation())
}

/// What happened to a row during one pass of the worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RowPass {
    Finished,
    Removed,
    /// An operation parked the row during this pass.
    Parked,
    /// The row was dequeued still parked and went back to the queue untouched.
    StillWaiting,
}

/// Marks the worker as exited and wakes the driver, also when an operation panics.
struct ExitGuard<'a>(&'a HostShared);

impl Drop for ExitGuard<'_> {
    fn drop(&mut self) {
        self.0.worker_exited.store(true, Ordering::Release);
        self.0.notify_progress();
    }
}

/// Spawn the worker. It owns the chain while running and hands it back on join.
pub(crate) fn spawn_worker(
    mut chain: Chain,
    shared: Arc<HostShared>,
) -> std::io::Result<JoinHandle<Chain>> {
    thread::Builder::new()
        .name(PackagePaths::get().worker_thread_name().to_string())
        .spawn(move || {
            run_worker_loop(&mut chain, shared);
            chain
        })
}

fn run_worker_loop(chain: &mut Chain, shared: Arc<HostShared>) {
    let _exit = ExitGuard(&shared);
    let host = RowHost::new(Arc::clone(&shared));
    let cancel = shared.ctx.cancel.clone();
    let mut idle = 0_usize;

    for row in shared.queue.consumer(&cancel) {
        let pass = match drive_row(chain, &host, &row) {
            Ok(pass) => pass,
            Err(e) => {
                error!("worker halted with {} rows still active", shared.active());
                shared.ctx.report(e);
                return;
            }
        };
        if pass != RowPass::StillWaiting {
            idle = 0;
            continue;
        }
        idle += 1;
        if idle < shared.queue.len() {
            continue;
        }
        // Every queued row is parked: nothing can progress without more input or a flush.
        idle = 0;
        if shared.queue.is_completed() {
            match chain.flush_deferred(&host, &shared.ctx.counters) {
                Ok(0) => {
                    shared.ctx.report(PipelineError::Flush {
                        operation: row
                            .current_operation()
                            .map(|id| shared.links.name(id).to_string())
                            .unwrap_or_default(),
                        source: anyhow::anyhow!(
                            "rows are parked but no deferred operation holds pending rows"
                        ),
                    });
                    return;
                }
                Ok(n) => debug!("flushed {} deferred operations at end of input", n),
                Err(e) => {
                    shared.ctx.report(e);
                    return;
                }
            }
        } else {
            let generation = shared.queue.generation();
            shared
                .queue
                .wait_for_signal(generation, shared.config.throttling_sleep_resolution);
        }
    }
    debug!("worker: queue drained");
}

/// Apply the row's current operation and keep advancing until the chain ends, the row is
/// removed, or the row is parked by a deferred operation.
fn drive_row(chain: &mut Chain, host: &RowHost, row: &RowRef) -> PipelineResult<RowPass> {
    let shared = host.shared();
    if row.state().is_terminal() {
        // Removed by another row's operation while it sat in the queue.
        shared.row_terminated();
        return Ok(RowPass::Removed);
    }

    loop {
        let Some(op_id) = row.current_operation() else {
            return Ok(finish(shared, row));
        };

        match row.defer_state() {
            DeferState::Wait => {
                shared.queue.add_row_no_signal(Arc::clone(row));
                return Ok(RowPass::StillWaiting);
            }
            DeferState::Done => row.clear_defer(),
            DeferState::None => {
                if let Some(op) = chain.op_mut(op_id) {
                    op.apply(row, host)
                        .map_err(|source| PipelineError::Apply {
                            operation: shared.links.name(op_id).to_string(),
                            row_id: row.id(),
                            source,
                        })?;
                }
                if row.state().is_terminal() {
                    shared.row_terminated();
                    return Ok(RowPass::Removed);
                }
                match row.defer_state() {
                    DeferState::Wait => {
                        shared.queue.add_row_no_signal(Arc::clone(row));
                        return Ok(RowPass::Parked);
                    }
                    DeferState::Done => row.clear_defer(),
                    DeferState::None => {}
                }
            }
        }

        match next_operation(&shared.links, row) {
            Some(next) => row.set_current_operation(Some(next)),
            None => return Ok(finish(shared, row)),
        }
    }
}

fn finish(shared: &HostShared, row: &Row) -> RowPass {
    if row.finish() {
        Counters::bump(&shared.ctx.counters.rows_finished, 1);
    }
    shared.row_terminated();
    RowPass::Finished
}
