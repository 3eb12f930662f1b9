//! SqliteWriter: deferred bulk insert of row columns into a SQLite table, one transaction per batch.

use anyhow::{Context, Result, bail};
use log::debug;
use rusqlite::Connection;
use rusqlite::types::Value as SqlValue;
use serde_json::Value;
use std::path::{Path, PathBuf};

use crate::pipeline::{DeferredOperation, Operation, PipelineContext, RowHost};
use crate::RowRef;

const WAL_PRAGMAS: &str = r#"
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;
PRAGMA cache_size = -64000;
"#;

pub const DEFAULT_WRITER_BATCH_SIZE: usize = 500;

/// Double-quote an identifier for SQL.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// JSON value to a SQLite value. Arrays and objects are stored as JSON text.
fn to_sql_value(value: Option<Value>) -> SqlValue {
    match value {
        None | Some(Value::Null) => SqlValue::Null,
        Some(Value::Bool(b)) => SqlValue::Integer(b as i64),
        Some(Value::Number(n)) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => n.as_f64().map_or(SqlValue::Null, SqlValue::Real),
        },
        Some(Value::String(s)) => SqlValue::Text(s),
        Some(other) => SqlValue::Text(other.to_string()),
    }
}

/// Open (or create) the database, enable WAL and create the target table if missing.
fn open_table(path: &Path, table: &str, columns: &[String]) -> Result<Connection> {
    let conn = Connection::open(path).context("open database")?;
    conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))
        .context("enable WAL")?;
    conn.execute_batch(WAL_PRAGMAS).context("set WAL pragmas")?;
    let cols = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {} ({cols});",
        quote_ident(table)
    ))
    .context("create table")?;
    Ok(conn)
}

/// Insert a batch of rows in a single transaction. Returns batch length.
fn flush_batch(conn: &mut Connection, insert_sql: &str, columns: &[String], batch: &[RowRef]) -> Result<usize> {
    let tx = conn.transaction().context("begin transaction")?;
    let mut stmt = tx.prepare(insert_sql).context("prepare insert")?;
    for row in batch {
        let values: Vec<SqlValue> = columns.iter().map(|c| to_sql_value(row.get(c))).collect();
        stmt.execute(rusqlite::params_from_iter(values))
            .with_context(|| format!("insert row#{}", row.id()))?;
    }
    drop(stmt);
    tx.commit().context("commit transaction")?;
    Ok(batch.len())
}

/// Deferred writer: parks rows until `batch_size` have arrived, inserts them, then lets them continue.
pub struct SqliteWriter {
    path: PathBuf,
    table: String,
    columns: Vec<String>,
    batch_size: usize,
    insert_sql: String,
    conn: Option<Connection>,
    pending: Vec<RowRef>,
    written: usize,
}

impl SqliteWriter {
    pub fn new<S: Into<String>>(
        path: impl Into<PathBuf>,
        table: impl Into<String>,
        columns: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            path: path.into(),
            table: table.into(),
            columns: columns.into_iter().map(Into::into).collect(),
            batch_size: DEFAULT_WRITER_BATCH_SIZE,
            insert_sql: String::new(),
            conn: None,
            pending: Vec::new(),
            written: 0,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    fn write_pending(&mut self) -> Result<()> {
        let batch = std::mem::take(&mut self.pending);
        let Some(conn) = self.conn.as_mut() else {
            bail!("writer used before prepare");
        };
        let live: Vec<RowRef> = batch
            .iter()
            .filter(|r| !r.state().is_terminal())
            .cloned()
            .collect();
        self.written += flush_batch(conn, &self.insert_sql, &self.columns, &live)?;
        for row in &batch {
            row.resolve_defer();
        }
        Ok(())
    }
}

impl Operation for SqliteWriter {
    fn kind(&self) -> &str {
        "SqliteWriter"
    }

    fn prepare(&mut self, _ctx: &PipelineContext) -> Result<()> {
        if self.batch_size == 0 {
            bail!("batch_size must be greater than 0");
        }
        if self.table.is_empty() || self.columns.is_empty() {
            bail!("table and columns are required");
        }
        self.conn = Some(open_table(&self.path, &self.table, &self.columns)?);
        let placeholders = (1..=self.columns.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        self.insert_sql = format!(
            "INSERT INTO {} ({}) VALUES ({placeholders})",
            quote_ident(&self.table),
            self.columns
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", ")
        );
        self.pending.reserve(self.batch_size);
        debug!("{}: writing to {}", self.table, self.path.display());
        Ok(())
    }

    fn apply(&mut self, row: &RowRef, _host: &RowHost) -> Result<()> {
        row.request_defer();
        self.pending.push(RowRef::clone(row));
        if self.pending.len() >= self.batch_size {
            self.write_pending()?;
        }
        Ok(())
    }

    fn shutdown(&mut self, _ctx: &PipelineContext) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
                .context("checkpoint WAL")?;
            conn.close().map_err(|(_, e)| e).context("close database")?;
        }
        debug!("{}: {} rows written", self.table, self.written);
        Ok(())
    }

    fn deferred_batch_size(&self) -> Option<usize> {
        Some(self.batch_size)
    }

    fn as_deferred_mut(&mut self) -> Option<&mut dyn DeferredOperation> {
        Some(self)
    }
}

impl DeferredOperation for SqliteWriter {
    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn pending(&self) -> usize {
        self.pending.len()
    }

    fn flush(&mut self, _host: &RowHost) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.write_pending()
    }
}
