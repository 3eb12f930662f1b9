//! Pipeline engine: row queue, operation chain, live row set, worker and driver.

pub mod context;
pub mod error_handler;
pub mod group;
pub mod host;
pub mod live_set;
pub mod operation;
pub mod orchestrator;
pub mod queue;
pub mod source;
pub mod worker;

pub use context::{CancelToken, CounterSnapshot, Counters, PipelineContext};
pub use error_handler::check_for_failures;
pub use group::{OperationGroup, RowPredicate};
pub use host::{OperationHost, RowHost, RunSummary};
pub use live_set::{LiveSet, WipeStats};
pub use operation::{Chain, ChainLinks, DeferredOperation, Operation};
pub use orchestrator::{Evaluation, RunMode};
pub use queue::{
    ChannelRowQueue, CondvarRowQueue, RowConsumer, RowQueue, RowQueueType, create_row_queue,
};
pub use source::{IterSource, RowIter, RowSource, rows_source};
pub use worker::next_operation;
