//! Rowflow CLI: run JSON-lines rows through a pipeline file.

use anyhow::Result;
use clap::Parser;
use rowflow::cli::{Cli, handle_run};
use std::time::Instant;

fn main() -> Result<()> {
    let start_time = Instant::now();
    let cli = Cli::parse();
    handle_run(&cli)?;
    log::debug!("Total time: {:?}", start_time.elapsed());
    Ok(())
}
