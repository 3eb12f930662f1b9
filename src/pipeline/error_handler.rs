use anyhow::Result;
use log::error;

use crate::pipeline::context::PipelineContext;
use crate::pipeline::host::RunSummary;

/// Check a finished run: if any failure was collected, log them all and return the first as
/// the error; cancellation alone is reported as an error too so callers exit non-zero.
/// Call after the run's iterator is exhausted (or `execute` returned).
pub fn check_for_failures(ctx: &PipelineContext, summary: &RunSummary) -> Result<()> {
    let failures = ctx.take_failures();
    if let Some(first) = failures.first() {
        if failures.len() > 1 {
            error!("{} failures collected during the run:", failures.len());
            for failure in &failures {
                error!("  {}", failure);
            }
        }
        return Err(anyhow::anyhow!(
            "pipeline failed ({} rows still active): {}",
            summary.rows_active,
            first
        ));
    }
    if summary.cancelled {
        return Err(anyhow::anyhow!(
            "pipeline cancelled with {} rows still active",
            summary.rows_active
        ));
    }
    Ok(())
}
