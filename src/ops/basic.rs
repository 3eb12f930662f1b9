//! Simple row operations: column edits, filtering, tagging, duplication, closures.

use anyhow::{Result, bail};
use serde_json::Value;

use crate::pipeline::{Operation, RowHost, RowPredicate};
use crate::{Row, RowRef};

/// Set `column` to a constant.
pub struct SetColumn {
    column: String,
    value: Value,
}

impl SetColumn {
    pub fn new(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }
}

impl Operation for SetColumn {
    fn kind(&self) -> &str {
        "SetColumn"
    }

    fn prepare(&mut self, _ctx: &crate::pipeline::PipelineContext) -> Result<()> {
        if self.column.is_empty() {
            bail!("column name must not be empty");
        }
        Ok(())
    }

    fn apply(&mut self, row: &RowRef, _host: &RowHost) -> Result<()> {
        row.set(&self.column, self.value.clone());
        Ok(())
    }
}

/// Rename a column. Rows without it pass through unless `strict` is set.
pub struct RenameColumn {
    from: String,
    to: String,
    strict: bool,
}

impl RenameColumn {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            strict: false,
        }
    }

    /// Fail the row when the source column is missing.
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }
}

impl Operation for RenameColumn {
    fn kind(&self) -> &str {
        "RenameColumn"
    }

    fn apply(&mut self, row: &RowRef, _host: &RowHost) -> Result<()> {
        let moved = row.with_columns_mut(|columns| match columns.remove(&self.from) {
            Some(v) => {
                columns.insert(self.to.clone(), v);
                true
            }
            None => false,
        });
        if !moved && self.strict {
            bail!("column {} not found", self.from);
        }
        Ok(())
    }
}

pub struct DropColumns {
    columns: Vec<String>,
}

impl DropColumns {
    pub fn new<S: Into<String>>(columns: impl IntoIterator<Item = S>) -> Self {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
        }
    }
}

impl Operation for DropColumns {
    fn kind(&self) -> &str {
        "DropColumns"
    }

    fn apply(&mut self, row: &RowRef, _host: &RowHost) -> Result<()> {
        for c in &self.columns {
            row.remove_column(c);
        }
        Ok(())
    }
}

/// Remove every row matching the predicate.
pub struct RemoveIf {
    predicate: RowPredicate,
}

impl RemoveIf {
    pub fn new(predicate: impl Fn(&Row) -> bool + Send + 'static) -> Self {
        Self {
            predicate: Box::new(predicate),
        }
    }

    pub fn column_equals(column: impl Into<String>, value: impl Into<Value>) -> Self {
        let column = column.into();
        let value = value.into();
        Self::new(move |row| row.get(&column).as_ref() == Some(&value))
    }
}

impl Operation for RemoveIf {
    fn kind(&self) -> &str {
        "RemoveIf"
    }

    fn apply(&mut self, row: &RowRef, host: &RowHost) -> Result<()> {
        if (self.predicate)(row) {
            host.remove_row(row);
        }
        Ok(())
    }
}

/// Set the row's tag side-channel.
pub struct TagRow {
    tag: Value,
}

impl TagRow {
    pub fn new(tag: impl Into<Value>) -> Self {
        Self { tag: tag.into() }
    }
}

impl Operation for TagRow {
    fn kind(&self) -> &str {
        "TagRow"
    }

    fn apply(&mut self, row: &RowRef, _host: &RowHost) -> Result<()> {
        row.set_tag(self.tag.clone());
        Ok(())
    }
}

/// Add `copies` clones of each row. Clones continue after the operation that produced them.
pub struct DuplicateRow {
    copies: usize,
    marker: Option<String>,
}

impl DuplicateRow {
    pub fn new(copies: usize) -> Self {
        Self {
            copies,
            marker: None,
        }
    }

    /// Write the copy index (1..=copies) into `column` on each clone.
    pub fn mark_copies(mut self, column: impl Into<String>) -> Self {
        self.marker = Some(column.into());
        self
    }
}

impl Operation for DuplicateRow {
    fn kind(&self) -> &str {
        "DuplicateRow"
    }

    fn apply(&mut self, row: &RowRef, host: &RowHost) -> Result<()> {
        // The slot being applied; inside a group this is the group itself.
        let source = row.current_operation();
        let copies = (1..=self.copies)
            .map(|n| {
                let copy = Row::from_columns(row.columns());
                if let Some(ref marker) = self.marker {
                    copy.set(marker, n as u64);
                }
                copy.into_ref()
            })
            .collect();
        host.add_rows(copies, source);
        Ok(())
    }
}

pub type ApplyFn = Box<dyn FnMut(&RowRef, &RowHost) -> Result<()> + Send>;

/// Operation backed by a closure.
pub struct FnOperation {
    kind: String,
    apply: ApplyFn,
}

impl FnOperation {
    pub fn new(
        kind: impl Into<String>,
        apply: impl FnMut(&RowRef, &RowHost) -> Result<()> + Send + 'static,
    ) -> Self {
        Self {
            kind: kind.into(),
            apply: Box::new(apply),
        }
    }
}

impl Operation for FnOperation {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn apply(&mut self, row: &RowRef, host: &RowHost) -> Result<()> {
        (self.apply)(row, host)
    }
}
