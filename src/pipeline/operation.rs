//! Operations and the operation chain.
//!
//! A [`Chain`] stores operations as a flat ordered list (for numbering, prepare and shutdown)
//! and as prev/next links by slot index (for O(1) per-row traversal). Links are copied into
//! [`ChainLinks`] at run start so the host can resolve a row's next step without touching the
//! operations themselves.

use anyhow::Result;
use log::debug;

use crate::OpId;
use crate::RowRef;
use crate::error::{PipelineError, PipelineResult};
use crate::pipeline::context::{Counters, PipelineContext};
use crate::pipeline::host::RowHost;

/// One transformation step applied to one row at a time.
///
/// `apply` runs only on the host's worker thread, so implementations never see concurrent
/// calls. `prepare` and `shutdown` run on the driver thread before and after the worker.
pub trait Operation: Send {
    /// Kind name used to build the default display name, e.g. `SetColumn`.
    fn kind(&self) -> &str;

    /// Validate settings and acquire resources. A failure aborts the run before any row flows.
    fn prepare(&mut self, _ctx: &PipelineContext) -> Result<()> {
        Ok(())
    }

    /// Transform `row` in place. May remove rows or add rows through `host`, or park the row
    /// with [`Row::request_defer`](crate::Row::request_defer) (deferred operations only).
    fn apply(&mut self, row: &RowRef, host: &RowHost) -> Result<()>;

    /// Release resources. Called once after all rows drained, in chain order.
    fn shutdown(&mut self, _ctx: &PipelineContext) -> Result<()> {
        Ok(())
    }

    /// Called when the operation is placed in a chain with its 1-based ordinal and display name.
    fn set_number(&mut self, _number: usize, _name: &str) {}

    /// Deferred-operation marker: `Some(batch_size)` when the operation holds rows in batches.
    fn deferred_batch_size(&self) -> Option<usize> {
        None
    }

    fn as_deferred_mut(&mut self) -> Option<&mut dyn DeferredOperation> {
        None
    }
}

/// Capability of operations that park rows until an internal batch fills.
pub trait DeferredOperation {
    fn batch_size(&self) -> usize;

    /// Rows currently parked in the unresolved batch.
    fn pending(&self) -> usize;

    /// Resolve the current partial batch. Called by the worker when no more rows can arrive.
    fn flush(&mut self, host: &RowHost) -> Result<()>;
}

struct OperationSlot {
    op: Box<dyn Operation>,
    number: usize,
    name: String,
    prev: Option<OpId>,
    next: Option<OpId>,
    prepared: bool,
}

/// Ordered operations with 1-based numbering and prev/next links.
#[derive(Default)]
pub struct Chain {
    slots: Vec<OperationSlot>,
    prefix: String,
}

impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Chain whose display names are prefixed, e.g. `Group#2/then`.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            slots: Vec::new(),
            prefix: prefix.into(),
        }
    }

    /// Append an operation; returns its slot id.
    pub fn push(&mut self, op: Box<dyn Operation>) -> OpId {
        let id = self.slots.len();
        let number = id + 1;
        let name = self.display_name(op.kind(), number);
        self.slots.push(OperationSlot {
            op,
            number,
            name,
            prev: id.checked_sub(1),
            next: None,
            prepared: false,
        });
        if let Some(prev) = id.checked_sub(1) {
            self.slots[prev].next = Some(id);
        }
        let slot = &mut self.slots[id];
        slot.op.set_number(slot.number, &slot.name);
        id
    }

    fn display_name(&self, kind: &str, number: usize) -> String {
        if self.prefix.is_empty() {
            format!("{kind}#{number}")
        } else {
            format!("{}/{kind}#{number}", self.prefix)
        }
    }

    /// Re-prefix and renumber every slot (used when a group learns its own name).
    pub fn set_prefix(&mut self, prefix: impl Into<String>) {
        self.prefix = prefix.into();
        for i in 0..self.slots.len() {
            let name = self.display_name(self.slots[i].op.kind(), self.slots[i].number);
            let slot = &mut self.slots[i];
            slot.name = name;
            slot.op.set_number(slot.number, &slot.name);
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn first(&self) -> Option<OpId> {
        (!self.slots.is_empty()).then_some(0)
    }

    pub fn next(&self, id: OpId) -> Option<OpId> {
        self.slots.get(id).and_then(|s| s.next)
    }

    pub fn prev(&self, id: OpId) -> Option<OpId> {
        self.slots.get(id).and_then(|s| s.prev)
    }

    pub fn number(&self, id: OpId) -> Option<usize> {
        self.slots.get(id).map(|s| s.number)
    }

    pub fn name(&self, id: OpId) -> &str {
        self.slots.get(id).map(|s| s.name.as_str()).unwrap_or("<unknown>")
    }

    pub fn names(&self) -> Vec<String> {
        self.slots.iter().map(|s| s.name.clone()).collect()
    }

    pub(crate) fn op_mut(&mut self, id: OpId) -> Option<&mut (dyn Operation + 'static)> {
        self.slots.get_mut(id).map(|s| s.op.as_mut())
    }

    pub fn links(&self) -> ChainLinks {
        ChainLinks {
            next: self.slots.iter().map(|s| s.next).collect(),
            names: self.names(),
        }
    }

    /// Largest batch size among deferred operations in this chain.
    pub fn largest_batch_size(&self) -> Option<usize> {
        self.slots
            .iter()
            .filter_map(|s| s.op.deferred_batch_size())
            .max()
    }

    /// Prepare every operation in chain order, stopping at the first failure.
    pub fn prepare_all(&mut self, ctx: &PipelineContext) -> PipelineResult<()> {
        for slot in &mut self.slots {
            debug!("preparing {}", slot.name);
            slot.op
                .prepare(ctx)
                .map_err(|source| PipelineError::Prepare {
                    operation: slot.name.clone(),
                    source,
                })?;
            slot.prepared = true;
        }
        Ok(())
    }

    /// Shut down every prepared operation in chain order. Failures are collected, not fatal.
    pub fn shutdown_all(&mut self, ctx: &PipelineContext) -> Vec<PipelineError> {
        let mut failures = Vec::new();
        for slot in self.slots.iter_mut().filter(|s| s.prepared) {
            debug!("shutting down {}", slot.name);
            slot.prepared = false;
            if let Err(source) = slot.op.shutdown(ctx) {
                failures.push(PipelineError::Shutdown {
                    operation: slot.name.clone(),
                    source,
                });
            }
        }
        failures
    }

    /// Flush every deferred operation that holds parked rows. Returns how many were flushed.
    pub(crate) fn flush_deferred(
        &mut self,
        host: &RowHost,
        counters: &Counters,
    ) -> PipelineResult<usize> {
        let mut flushed = 0;
        for slot in &mut self.slots {
            let name = &slot.name;
            if let Some(deferred) = slot.op.as_deferred_mut()
                && deferred.pending() > 0
            {
                debug!("flushing {} pending rows of {}", deferred.pending(), name);
                deferred
                    .flush(host)
                    .map_err(|source| PipelineError::Flush {
                        operation: name.clone(),
                        source,
                    })?;
                Counters::bump(&counters.deferred_flushes, 1);
                flushed += 1;
            }
        }
        Ok(flushed)
    }
}

/// Immutable copy of a chain's forward links, shared by the host and the worker.
#[derive(Clone, Debug, Default)]
pub struct ChainLinks {
    next: Vec<Option<OpId>>,
    names: Vec<String>,
}

impl ChainLinks {
    pub fn len(&self) -> usize {
        self.next.len()
    }

    pub fn is_empty(&self) -> bool {
        self.next.is_empty()
    }

    pub fn name(&self, id: OpId) -> &str {
        self.names.get(id).map(String::as_str).unwrap_or("<unknown>")
    }

    /// Next step for a row: the first operation when it has none yet, otherwise the one after
    /// its current operation.
    pub fn next_after(&self, current: Option<OpId>) -> Option<OpId> {
        match current {
            None => (!self.next.is_empty()).then_some(0),
            Some(id) => self.next.get(id).copied().flatten(),
        }
    }
}
