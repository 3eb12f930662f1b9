//! Upstream row sources consumed by the host's driver loop.

use crate::pipeline::context::PipelineContext;
use crate::{Row, RowRef};

/// Rows handed to a host by the driver.
pub type RowIter = Box<dyn Iterator<Item = RowRef>>;

/// Upstream collaborator: yields a lazy sequence of rows, once.
pub trait RowSource {
    /// When true the driver submits every row immediately instead of filling its input buffer.
    fn consumer_should_not_buffer(&self) -> bool {
        false
    }

    /// Consume the source into its row sequence.
    fn into_rows(self: Box<Self>, ctx: &PipelineContext) -> RowIter;
}

/// Source over any iterator of rows.
pub struct IterSource<I> {
    iter: I,
    no_buffer: bool,
}

impl<I> IterSource<I>
where
    I: Iterator<Item = RowRef> + 'static,
{
    pub fn new(iter: I) -> Self {
        Self {
            iter,
            no_buffer: false,
        }
    }

    /// Source whose rows must reach the queue one by one (e.g. a live feed).
    pub fn unbuffered(iter: I) -> Self {
        Self {
            iter,
            no_buffer: true,
        }
    }
}

impl<I> RowSource for IterSource<I>
where
    I: Iterator<Item = RowRef> + 'static,
{
    fn consumer_should_not_buffer(&self) -> bool {
        self.no_buffer
    }

    fn into_rows(self: Box<Self>, _ctx: &PipelineContext) -> RowIter {
        Box::new(self.iter)
    }
}

/// Source over owned rows.
pub fn rows_source(rows: Vec<Row>) -> IterSource<impl Iterator<Item = RowRef>> {
    IterSource::new(rows.into_iter().map(Row::into_ref))
}
