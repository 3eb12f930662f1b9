use clap::Parser;
use std::path::PathBuf;

use crate::pipeline::RowQueueType;
use crate::utils::config::PackagePaths;

/// Run JSON-lines rows through a pipeline of operations.
#[derive(Clone, Parser)]
#[command(name = "rowflow")]
#[command(about = "Run JSON-lines rows through the operation chain of a pipeline file.")]
pub struct Cli {
    /// Pipeline file. Default: `rowflow.toml` in the current directory.
    #[arg(value_name = "PIPELINE")]
    pub pipeline: Option<PathBuf>,

    /// Read rows (one JSON object per line) from FILE instead of stdin.
    #[arg(long, short, value_name = "FILE")]
    pub input: Option<PathBuf>,

    /// Write finished rows to FILE instead of stdout.
    #[arg(long, short, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Run to completion without writing finished rows.
    #[arg(long, conflicts_with = "output")]
    pub discard: bool,

    /// Emit finished rows in input order.
    #[arg(long, short = 'k', num_args = 0..=1, default_missing_value = "true", value_parser = clap::value_parser!(bool))]
    pub keep_order: Option<bool>,

    /// Rows buffered before each batch submit.
    #[arg(long, short = 'b', value_name = "N")]
    pub buffer: Option<usize>,

    /// Max active rows before input is paused.
    #[arg(long, short = 't', value_name = "N")]
    pub throttle: Option<usize>,

    /// Row queue implementation.
    #[arg(long, value_enum)]
    pub queue: Option<RowQueueType>,

    /// Verbose output (debug logs and a row counter).
    #[arg(long, short = 'v')]
    pub verbose: bool,

    /// Print run counters as JSON to stderr when done.
    #[arg(long, short = 's')]
    pub stats: bool,
}

impl Cli {
    /// Pipeline path, defaulting to the package pipeline filename in the current directory.
    pub fn pipeline_path(&self) -> PathBuf {
        self.pipeline
            .clone()
            .unwrap_or_else(|| PathBuf::from(PackagePaths::get().pipeline_filename()))
    }
}
