//! Blake3 row hashing: stable fingerprint over selected columns.

use anyhow::{Result, bail};
use serde_json::Value;

use crate::pipeline::{Operation, PipelineContext, RowHost};
use crate::{Row, RowRef};

/// Hash `columns` of `row` in the given order. Missing columns hash as JSON `null`;
/// each value is length-prefixed so `["ab","c"]` and `["a","bc"]` differ.
pub fn hash_columns(row: &Row, columns: &[String]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    for name in columns {
        let value = row.get(name).unwrap_or(Value::Null);
        let bytes = value.to_string();
        hasher.update(&(name.len() as u64).to_le_bytes());
        hasher.update(name.as_bytes());
        hasher.update(&(bytes.len() as u64).to_le_bytes());
        hasher.update(bytes.as_bytes());
    }
    *hasher.finalize().as_bytes()
}

pub fn hash_equals(a: &Option<[u8; 32]>, b: &Option<[u8; 32]>) -> bool {
    match (a, b) {
        (Some(x), Some(y)) => x == y,
        (None, None) => true,
        _ => false,
    }
}

pub fn to_hex(hash: &[u8; 32]) -> String {
    blake3::Hash::from(*hash).to_hex().to_string()
}

/// Write the hex blake3 hash of `columns` into `target`. With no columns, every column except
/// `target` is hashed in name order.
pub struct HashColumns {
    columns: Vec<String>,
    target: String,
}

impl HashColumns {
    pub fn new<S: Into<String>>(
        columns: impl IntoIterator<Item = S>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            target: target.into(),
        }
    }
}

impl Operation for HashColumns {
    fn kind(&self) -> &str {
        "HashColumns"
    }

    fn prepare(&mut self, _ctx: &PipelineContext) -> Result<()> {
        if self.target.is_empty() {
            bail!("hash target column must not be empty");
        }
        if self.columns.contains(&self.target) {
            bail!("hash target {} is also a hashed column", self.target);
        }
        Ok(())
    }

    fn apply(&mut self, row: &RowRef, _host: &RowHost) -> Result<()> {
        let hash = if self.columns.is_empty() {
            let all: Vec<String> = row
                .columns()
                .into_keys()
                .filter(|k| *k != self.target)
                .collect();
            hash_columns(row, &all)
        } else {
            hash_columns(row, &self.columns)
        };
        row.set(&self.target, to_hex(&hash));
        Ok(())
    }
}
