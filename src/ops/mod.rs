//! Built-in operations.

pub mod basic;
pub mod batch;
pub mod hashing;
pub mod sqlite_writer;

pub use basic::{
    DropColumns, DuplicateRow, FnOperation, RemoveIf, RenameColumn, SetColumn, TagRow,
};
pub use batch::BatchOperation;
pub use hashing::{HashColumns, hash_columns, hash_equals, to_hex};
pub use sqlite_writer::SqliteWriter;
