//! Load a pipeline file: a `[host]` section with engine knobs and an ordered list of
//! `[[operation]]` tables. CLI flags are applied on top by the caller.
//!
//! ```toml
//! [host]
//! input_buffer_size = 50
//! keep_order = true
//!
//! [[operation]]
//! kind = "set"
//! column = "source"
//! value = "import"
//!
//! [[operation]]
//! kind = "group"
//! when = { column = "kind", equals = "a" }
//! then = [{ kind = "tag", tag = "A" }]
//! else = [{ kind = "tag", tag = "B" }]
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ops::{
    DropColumns, DuplicateRow, HashColumns, RemoveIf, RenameColumn, SetColumn, SqliteWriter,
    TagRow,
};
use crate::pipeline::{OperationGroup, OperationHost, RowQueueType};
use crate::utils::config::HostConfig;
use crate::Row;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineFile {
    #[serde(default)]
    pub host: HostSection,
    #[serde(default, rename = "operation")]
    pub operations: Vec<OperationSpec>,
}

/// Engine knobs; durations in milliseconds. Absent fields keep the current value.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostSection {
    pub input_buffer_size: Option<usize>,
    pub throttling_limit: Option<usize>,
    pub throttling_sleep_resolution_ms: Option<u64>,
    pub throttling_max_sleep_ms: Option<u64>,
    pub main_loop_delay_ms: Option<u64>,
    pub keep_order: Option<bool>,
    pub row_queue: Option<RowQueueType>,
    pub live_set_lock_timeout_ms: Option<u64>,
}

/// Row test used by `remove_if` and group guards: column equals a value, or column is present.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Condition {
    pub column: String,
    #[serde(default)]
    pub equals: Option<Value>,
}

impl Condition {
    pub fn matches(&self, row: &Row) -> bool {
        match &self.equals {
            Some(expected) => row.get(&self.column).as_ref() == Some(expected),
            None => row.has(&self.column),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationSpec {
    Set {
        column: String,
        value: Value,
    },
    Rename {
        from: String,
        to: String,
        #[serde(default)]
        strict: bool,
    },
    Drop {
        columns: Vec<String>,
    },
    RemoveIf {
        column: String,
        #[serde(default)]
        equals: Option<Value>,
    },
    Tag {
        tag: Value,
    },
    Duplicate {
        copies: usize,
        #[serde(default)]
        marker: Option<String>,
    },
    Hash {
        #[serde(default)]
        columns: Vec<String>,
        target: String,
    },
    Group {
        #[serde(default)]
        when: Option<Condition>,
        #[serde(default)]
        then: Vec<OperationSpec>,
        #[serde(default, rename = "else")]
        otherwise: Vec<OperationSpec>,
    },
    SqliteWriter {
        path: PathBuf,
        table: String,
        columns: Vec<String>,
        #[serde(default)]
        batch_size: Option<usize>,
    },
}

impl OperationSpec {
    /// Build the operation. Relative writer paths resolve against `base_dir`.
    pub fn build(&self, base_dir: &Path) -> Result<Box<dyn crate::pipeline::Operation>> {
        let op: Box<dyn crate::pipeline::Operation> = match self {
            Self::Set { column, value } => Box::new(SetColumn::new(column.as_str(), value.clone())),
            Self::Rename { from, to, strict } => {
                let op = RenameColumn::new(from.as_str(), to.as_str());
                Box::new(if *strict { op.strict() } else { op })
            }
            Self::Drop { columns } => Box::new(DropColumns::new(columns.iter().cloned())),
            Self::RemoveIf { column, equals } => {
                let condition = Condition {
                    column: column.clone(),
                    equals: equals.clone(),
                };
                Box::new(RemoveIf::new(move |row| condition.matches(row)))
            }
            Self::Tag { tag } => Box::new(TagRow::new(tag.clone())),
            Self::Duplicate { copies, marker } => {
                let op = DuplicateRow::new(*copies);
                Box::new(match marker {
                    Some(m) => op.mark_copies(m.as_str()),
                    None => op,
                })
            }
            Self::Hash { columns, target } => {
                Box::new(HashColumns::new(columns.iter().cloned(), target.as_str()))
            }
            Self::Group {
                when,
                then,
                otherwise,
            } => {
                let mut group = match when.clone() {
                    Some(condition) => OperationGroup::when(move |row| condition.matches(row)),
                    None => OperationGroup::new(),
                };
                for spec in then {
                    group.add_then_operation(spec.build(base_dir)?)?;
                }
                for spec in otherwise {
                    group.add_else_operation(spec.build(base_dir)?)?;
                }
                Box::new(group)
            }
            Self::SqliteWriter {
                path,
                table,
                columns,
                batch_size,
            } => {
                let path = if path.is_absolute() {
                    path.clone()
                } else {
                    base_dir.join(path)
                };
                let writer = SqliteWriter::new(path, table.as_str(), columns.iter().cloned());
                Box::new(match batch_size {
                    Some(n) => writer.with_batch_size(*n),
                    None => writer,
                })
            }
        };
        Ok(op)
    }
}

/// Overwrite config field from file when present.
macro_rules! apply_file_opt {
    ($sec:expr, $cfg:expr, $sec_field:ident => $cfg_field:ident as millis) => {
        if let Some(ms) = $sec.$sec_field {
            $cfg.$cfg_field = Duration::from_millis(ms);
        }
    };
    ($sec:expr, $cfg:expr, $sec_field:ident => $cfg_field:ident) => {
        if let Some(v) = $sec.$sec_field {
            $cfg.$cfg_field = v;
        }
    };
}

impl PipelineFile {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).context("parse pipeline file")
    }

    /// Apply the `[host]` section (only fields present in the file). Call before applying CLI.
    pub fn apply_to_config(&self, config: &mut HostConfig) {
        let host = &self.host;
        apply_file_opt!(host, config, input_buffer_size => input_buffer_size);
        apply_file_opt!(host, config, throttling_limit => throttling_limit);
        apply_file_opt!(host, config, throttling_sleep_resolution_ms => throttling_sleep_resolution as millis);
        apply_file_opt!(host, config, throttling_max_sleep_ms => throttling_max_sleep as millis);
        apply_file_opt!(host, config, main_loop_delay_ms => main_loop_delay as millis);
        apply_file_opt!(host, config, keep_order => keep_order);
        apply_file_opt!(host, config, row_queue => row_queue);
        apply_file_opt!(host, config, live_set_lock_timeout_ms => live_set_lock_timeout as millis);
    }

    /// Build a host with `config` and the file's operations in order.
    pub fn build_host(&self, config: HostConfig, base_dir: &Path) -> Result<OperationHost> {
        let mut host = OperationHost::new(config);
        for (i, spec) in self.operations.iter().enumerate() {
            let op = spec
                .build(base_dir)
                .with_context(|| format!("operation #{}", i + 1))?;
            host.add_operation(op);
        }
        Ok(host)
    }
}

/// Read and parse a pipeline file.
pub fn load_pipeline_file(path: &Path) -> Result<PipelineFile> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("read pipeline file {}", path.display()))?;
    PipelineFile::from_toml_str(&s).with_context(|| path.display().to_string())
}
