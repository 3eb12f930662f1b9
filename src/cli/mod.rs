//! Command-line front end: argument parsing, JSON-lines I/O and the run handler.

pub mod arg_parser;
pub mod jsonl;
pub mod progress;
pub mod run;

pub use arg_parser::Cli;
pub use jsonl::{JsonLinesSource, write_row};
pub use run::{handle_run, setup_config};
