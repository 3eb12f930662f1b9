//! CLI command handler: load the pipeline file, apply flags, stream rows through the host.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::Ordering;

use crate::cli::arg_parser::Cli;
use crate::cli::jsonl::{JsonLinesSource, write_row};
use crate::cli::progress::{
    ProgressBar, create_counter, flush_progress_remainder, report_progress_batched,
};
use crate::pipeline::{Evaluation, PipelineContext, RunSummary, check_for_failures};
use crate::utils::config::{HostConfig, PROGRESS_UPDATE_BATCH_SIZE};
use crate::utils::{Colors, PipelineFile, load_pipeline_file, setup_logging};

/// Defaults, then the file's `[host]` section, then CLI flags.
pub fn setup_config(cli: &Cli, file: &PipelineFile) -> HostConfig {
    let mut config = HostConfig::default();
    file.apply_to_config(&mut config);
    if let Some(keep_order) = cli.keep_order {
        config.keep_order = keep_order;
    }
    if let Some(buffer) = cli.buffer {
        config.input_buffer_size = buffer;
    }
    if let Some(limit) = cli.throttle {
        config.throttling_limit = limit;
    }
    if let Some(queue) = cli.queue {
        config.row_queue = queue;
    }
    config
}

/// Run the pipeline (stream output by default, drain with --discard). Errors when the run
/// collected failures or was cancelled.
pub fn handle_run(cli: &Cli) -> Result<()> {
    setup_logging(cli.verbose);
    let path = cli.pipeline_path();
    let file = load_pipeline_file(&path)?;
    let config = setup_config(cli, &file);
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    let host = file.build_host(config, base_dir)?;
    debug!("pipeline {}: {:?}", path.display(), host.chain().names());

    let ctx = PipelineContext::new();
    let cancel_flag = ctx.cancel.flag();
    ctrlc::set_handler(move || {
        cancel_flag.store(true, Ordering::Relaxed);
    })
    .context("set Ctrl+C handler")?;

    let source = JsonLinesSource::open(cli.input.as_deref())?;
    let host = host.with_input(source);

    let summary = if cli.discard {
        warn!("DISCARD MODE. FINISHED ROWS ARE NOT WRITTEN.");
        host.execute(&ctx)
    } else {
        let bar = cli.verbose.then(|| create_counter("Rows"));
        let evaluation = host.evaluate(&ctx);
        match cli.output.as_deref() {
            Some(p) => {
                let file = File::create(p)
                    .with_context(|| format!("create output {}", p.display()))?;
                stream_rows(evaluation, BufWriter::new(file), bar.as_ref())?
            }
            None => stream_rows(evaluation, std::io::stdout().lock(), bar.as_ref())?,
        }
    };

    if ctx.is_cancelled() {
        info!("Run cancelled (Ctrl+C).");
    }
    if cli.stats {
        print_summary(&summary)?;
    }
    check_for_failures(&ctx, &summary)
}

/// Write every finished row as it is yielded. A write error cancels the run.
fn stream_rows(
    mut evaluation: Evaluation,
    mut out: impl Write,
    bar: Option<&ProgressBar>,
) -> Result<RunSummary> {
    let mut written = 0_usize;
    while let Some(row) = evaluation.next() {
        if let Err(e) = write_row(&mut out, &row) {
            evaluation.context().cancel.cancel();
            return Err(e);
        }
        written = report_progress_batched(bar, written, PROGRESS_UPDATE_BATCH_SIZE);
    }
    out.flush().context("flush output")?;
    flush_progress_remainder(bar, written, PROGRESS_UPDATE_BATCH_SIZE);
    debug!("{} rows written", written);
    Ok(evaluation.summary())
}

fn print_summary(summary: &RunSummary) -> Result<()> {
    let c = &summary.counters;
    eprintln!(
        "{}  {}  {}",
        Colors::colorize(Colors::FINISHED, &format!("Finished: {}", c.rows_finished)),
        Colors::colorize(Colors::REMOVED, &format!("Removed: {}", c.rows_removed)),
        Colors::colorize(Colors::ACTIVE, &format!("Active: {}", summary.rows_active)),
    );
    if summary.failed {
        eprintln!("{}", Colors::colorize(Colors::FAILED, "Run failed"));
    }
    let json = serde_json::to_string_pretty(summary).context("serialize run summary")?;
    eprintln!("{json}");
    Ok(())
}
