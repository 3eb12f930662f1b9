//! JSON-lines row input and output.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufRead, BufReader, IsTerminal, Lines, Write};
use std::path::Path;

use crate::error::PipelineError;
use crate::pipeline::{PipelineContext, RowIter, RowSource};
use crate::{Row, RowRef};

/// Rows read one JSON value per line. Blank lines are skipped; the first unreadable or
/// malformed line is reported to the run context and ends the input.
pub struct JsonLinesSource {
    reader: Box<dyn BufRead>,
    interactive: bool,
}

impl JsonLinesSource {
    pub fn new(reader: impl BufRead + 'static) -> Self {
        Self {
            reader: Box::new(reader),
            interactive: false,
        }
    }

    /// Read from `path`, or stdin when `None`. An interactive stdin is not buffered.
    pub fn open(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => {
                let file = File::open(p).with_context(|| format!("open input {}", p.display()))?;
                Ok(Self::new(BufReader::new(file)))
            }
            None => {
                let stdin = std::io::stdin();
                let interactive = stdin.is_terminal();
                Ok(Self {
                    reader: Box::new(stdin.lock()),
                    interactive,
                })
            }
        }
    }
}

impl RowSource for JsonLinesSource {
    fn consumer_should_not_buffer(&self) -> bool {
        self.interactive
    }

    fn into_rows(self: Box<Self>, ctx: &PipelineContext) -> RowIter {
        Box::new(JsonLines {
            lines: self.reader.lines(),
            line: 0,
            ctx: ctx.clone(),
            done: false,
        })
    }
}

struct JsonLines {
    lines: Lines<Box<dyn BufRead>>,
    line: usize,
    ctx: PipelineContext,
    done: bool,
}

impl JsonLines {
    fn fail(&mut self, source: anyhow::Error) -> Option<RowRef> {
        self.done = true;
        self.ctx.report(PipelineError::Input {
            line: self.line,
            source,
        });
        None
    }
}

impl Iterator for JsonLines {
    type Item = RowRef;

    fn next(&mut self) -> Option<RowRef> {
        while !self.done {
            let next = self.lines.next()?;
            self.line += 1;
            let text = match next {
                Ok(text) => text,
                Err(e) => return self.fail(e.into()),
            };
            if text.trim().is_empty() {
                continue;
            }
            return match serde_json::from_str(&text) {
                Ok(value) => Some(Row::from_json(value).into_ref()),
                Err(e) => self.fail(e.into()),
            };
        }
        None
    }
}

/// Write one row as a JSON line.
pub fn write_row(out: &mut impl Write, row: &Row) -> Result<()> {
    serde_json::to_writer(&mut *out, &row.to_json()).context("serialize row")?;
    out.write_all(b"\n").context("write row")?;
    Ok(())
}
