pub mod config;
pub mod logger;
pub mod pipeline_toml;

pub use config::*;
pub use logger::{Colors, setup_logging};
pub use pipeline_toml::{Condition, HostSection, OperationSpec, PipelineFile, load_pipeline_file};
