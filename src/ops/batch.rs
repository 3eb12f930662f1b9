//! Generic deferred operation: parks rows until a batch fills, then hands the batch to a closure.

use anyhow::{Result, bail};
use log::debug;

use crate::pipeline::{DeferredOperation, Operation, PipelineContext, RowHost};
use crate::RowRef;

pub type BatchFn = Box<dyn FnMut(&[RowRef], &RowHost) -> Result<()> + Send>;

/// Deferred operation calling `on_batch` with every full batch (and the final partial one).
/// Rows removed while parked are left out of the batch but still released.
pub struct BatchOperation {
    kind: String,
    batch_size: usize,
    pending: Vec<RowRef>,
    on_batch: BatchFn,
    batches: usize,
}

impl BatchOperation {
    pub fn new(
        kind: impl Into<String>,
        batch_size: usize,
        on_batch: impl FnMut(&[RowRef], &RowHost) -> Result<()> + Send + 'static,
    ) -> Self {
        Self {
            kind: kind.into(),
            batch_size,
            pending: Vec::with_capacity(batch_size),
            on_batch: Box::new(on_batch),
            batches: 0,
        }
    }

    fn resolve(&mut self, host: &RowHost) -> Result<()> {
        let batch = std::mem::take(&mut self.pending);
        let live: Vec<RowRef> = batch
            .iter()
            .filter(|r| !r.state().is_terminal())
            .cloned()
            .collect();
        (self.on_batch)(&live, host)?;
        self.batches += 1;
        for row in &batch {
            row.resolve_defer();
        }
        Ok(())
    }
}

impl Operation for BatchOperation {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn prepare(&mut self, _ctx: &PipelineContext) -> Result<()> {
        if self.batch_size == 0 {
            bail!("batch_size must be greater than 0");
        }
        Ok(())
    }

    fn apply(&mut self, row: &RowRef, host: &RowHost) -> Result<()> {
        row.request_defer();
        self.pending.push(RowRef::clone(row));
        if self.pending.len() >= self.batch_size {
            self.resolve(host)?;
        }
        Ok(())
    }

    fn shutdown(&mut self, _ctx: &PipelineContext) -> Result<()> {
        debug!("{}: {} batches resolved", self.kind, self.batches);
        Ok(())
    }

    fn deferred_batch_size(&self) -> Option<usize> {
        Some(self.batch_size)
    }

    fn as_deferred_mut(&mut self) -> Option<&mut dyn DeferredOperation> {
        Some(self)
    }
}

impl DeferredOperation for BatchOperation {
    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn pending(&self) -> usize {
        self.pending.len()
    }

    fn flush(&mut self, host: &RowHost) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.resolve(host)
    }
}
