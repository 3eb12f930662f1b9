//! Pipeline failure taxonomy. Failures are collected in the run context, not raised.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("operation {operation} failed to prepare: {source}")]
    Prepare {
        operation: String,
        source: anyhow::Error,
    },

    #[error("operation {operation} failed on row#{row_id}: {source}")]
    Apply {
        operation: String,
        row_id: u64,
        source: anyhow::Error,
    },

    #[error("operation {operation} failed to flush deferred rows: {source}")]
    Flush {
        operation: String,
        source: anyhow::Error,
    },

    #[error("operation {operation} failed to shut down: {source}")]
    Shutdown {
        operation: String,
        source: anyhow::Error,
    },

    #[error("input line {line}: {source}")]
    Input { line: usize, source: anyhow::Error },

    #[error("operation {child} is deferred and cannot be added to group {group}")]
    InvalidGroupChild { group: String, child: String },

    #[error("failed to spawn worker thread: {0}")]
    WorkerSpawn(std::io::Error),

    #[error("worker thread panicked")]
    WorkerPanicked,
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
