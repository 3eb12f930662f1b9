//! Rowflow: batch row-pipeline engine.
//!
//! Rows flow from a source through an ordered chain of operations driven by a single worker
//! thread, with soft backpressure and ordered or unordered reclamation of finished rows.

pub mod cli;
pub mod error;
pub mod ops;
pub mod pipeline;
pub mod types;
pub mod utils;

/// Re-export types for API
pub use types::*;

pub use error::{PipelineError, PipelineResult};
pub use pipeline::{
    CancelToken, DeferredOperation, Evaluation, IterSource, Operation, OperationGroup,
    OperationHost, PipelineContext, RowHost, RowSource, RunSummary, check_for_failures,
    rows_source,
};
pub use utils::config::HostConfig;

use log::debug;
use std::path::Path;

/// Result alias used by public rowflow API
pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, Error>;

/// Build a host from a pipeline file: `[host]` settings over defaults, operations in file order.
///
/// Relative paths inside the file (e.g. a SQLite writer's database) resolve against the file's
/// directory.
pub fn host_from_file(path: &Path) -> Result<OperationHost> {
    let file = utils::load_pipeline_file(path)?;
    let mut config = HostConfig::default();
    file.apply_to_config(&mut config);
    debug!(
        "{} CONFIG:{:#?}",
        utils::config::PackagePaths::get().pkg_name().to_uppercase(),
        config
    );
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    file.build_host(config, base_dir)
}

/// Run `host` over `rows` to completion and collect the finished rows.
///
/// Failures collected during the run become the returned error; use
/// [`OperationHost::evaluate`] directly to stream rows and inspect failures yourself.
pub fn run_rows(host: OperationHost, rows: Vec<Row>) -> Result<Vec<RowRef>> {
    let ctx = PipelineContext::new();
    let mut evaluation = host.with_input(rows_source(rows)).evaluate(&ctx);
    let out: Vec<RowRef> = evaluation.by_ref().collect();
    check_for_failures(&ctx, &evaluation.summary())?;
    Ok(out)
}
