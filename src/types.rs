//! Public and internal types for the rowflow API and pipeline.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Position of an operation inside its chain (0-based slot index).
pub type OpId = usize;

/// Named values of a row. Ordered so JSON output is stable.
pub type Columns = BTreeMap<String, Value>;

/// Shared handle to a row. The engine, the queue and deferred operations all hold clones.
pub type RowRef = Arc<Row>;

const NO_OPERATION: usize = usize::MAX;

static NEXT_ROW_ID: AtomicU64 = AtomicU64::new(0);

/// Lifecycle state of a row inside the engine. Terminal states are never reverted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RowState {
    Normal = 0,
    Finished = 1,
    Removed = 2,
}

impl RowState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RowState::Normal)
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => RowState::Finished,
            2 => RowState::Removed,
            _ => RowState::Normal,
        }
    }
}

/// Deferral state set by deferred operations.
///
/// `Wait` keeps the row parked at its current operation; `Done` lets the worker resume the chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DeferState {
    None = 0,
    Wait = 1,
    Done = 2,
}

impl DeferState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => DeferState::Wait,
            2 => DeferState::Done,
            _ => DeferState::None,
        }
    }
}

/// A mutable bag of named values flowing through the pipeline.
///
/// Column values and the tag sit behind mutexes so any thread may read them; `state`,
/// `defer_state` and `current_operation` are atomics written only by the worker that owns
/// the row during traversal (and by deferred operations through [`Row::request_defer`] /
/// [`Row::resolve_defer`], which also run on the worker).
pub struct Row {
    id: u64,
    columns: Mutex<Columns>,
    tag: Mutex<Option<Value>>,
    state: AtomicU8,
    defer: AtomicU8,
    current: AtomicUsize,
}

impl Row {
    pub fn new() -> Self {
        Self::from_columns(Columns::new())
    }

    pub fn from_columns(columns: Columns) -> Self {
        Self {
            id: NEXT_ROW_ID.fetch_add(1, Ordering::Relaxed),
            columns: Mutex::new(columns),
            tag: Mutex::new(None),
            state: AtomicU8::new(RowState::Normal as u8),
            defer: AtomicU8::new(DeferState::None as u8),
            current: AtomicUsize::new(NO_OPERATION),
        }
    }

    /// Build a row from a JSON object. Non-object values land in a single `value` column.
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Object(map) => Self::from_columns(map.into_iter().collect()),
            other => {
                let mut columns = Columns::new();
                columns.insert("value".to_string(), other);
                Self::from_columns(columns)
            }
        }
    }

    /// Convenience: `Row::with(&[("id", 1.into())])`.
    pub fn with<'a>(pairs: impl IntoIterator<Item = (&'a str, Value)>) -> Self {
        Self::from_columns(pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
    }

    pub fn into_ref(self) -> RowRef {
        Arc::new(self)
    }

    /// Process-unique, immutable identity.
    pub fn id(&self) -> u64 {
        self.id
    }

    fn columns_guard(&self) -> MutexGuard<'_, Columns> {
        self.columns.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, column: &str) -> Option<Value> {
        self.columns_guard().get(column).cloned()
    }

    pub fn get_i64(&self, column: &str) -> Option<i64> {
        self.columns_guard().get(column).and_then(Value::as_i64)
    }

    pub fn get_str(&self, column: &str) -> Option<String> {
        self.columns_guard()
            .get(column)
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    pub fn has(&self, column: &str) -> bool {
        self.columns_guard().contains_key(column)
    }

    pub fn set(&self, column: &str, value: impl Into<Value>) {
        self.columns_guard().insert(column.to_string(), value.into());
    }

    pub fn remove_column(&self, column: &str) -> Option<Value> {
        self.columns_guard().remove(column)
    }

    /// Snapshot of all columns.
    pub fn columns(&self) -> Columns {
        self.columns_guard().clone()
    }

    /// Run `f` with exclusive access to the column map (multi-column edits under one lock).
    pub fn with_columns_mut<R>(&self, f: impl FnOnce(&mut Columns) -> R) -> R {
        f(&mut self.columns_guard())
    }

    pub fn tag(&self) -> Option<Value> {
        self.tag.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set_tag(&self, tag: impl Into<Value>) {
        *self.tag.lock().unwrap_or_else(PoisonError::into_inner) = Some(tag.into());
    }

    pub fn to_json(&self) -> Value {
        Value::Object(self.columns_guard().clone().into_iter().collect::<Map<_, _>>())
    }

    pub fn state(&self) -> RowState {
        RowState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, to: RowState) -> bool {
        self.state
            .compare_exchange(
                RowState::Normal as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Normal -> Finished. Returns false if the row was already terminal.
    pub(crate) fn finish(&self) -> bool {
        self.transition(RowState::Finished)
    }

    /// Normal -> Removed. Returns false if the row was already terminal.
    pub(crate) fn mark_removed(&self) -> bool {
        self.transition(RowState::Removed)
    }

    pub fn defer_state(&self) -> DeferState {
        DeferState::from_u8(self.defer.load(Ordering::Acquire))
    }

    /// Park the row at its current operation until [`Row::resolve_defer`] is called.
    pub fn request_defer(&self) {
        self.defer.store(DeferState::Wait as u8, Ordering::Release);
    }

    /// Mark a parked row as resolved; the worker resumes the chain after the deferring operation.
    pub fn resolve_defer(&self) {
        self.defer.store(DeferState::Done as u8, Ordering::Release);
    }

    pub(crate) fn clear_defer(&self) {
        self.defer.store(DeferState::None as u8, Ordering::Release);
    }

    /// The operation this row is about to be (or was last) submitted to.
    pub fn current_operation(&self) -> Option<OpId> {
        match self.current.load(Ordering::Acquire) {
            NO_OPERATION => None,
            id => Some(id),
        }
    }

    /// Reset lifecycle fields for a row entering a host from its source (e.g. a finished row
    /// yielded by an upstream host). Columns and tag are kept.
    pub(crate) fn enter_pipeline(&self) {
        self.state.store(RowState::Normal as u8, Ordering::Release);
        self.clear_defer();
        self.set_current_operation(None);
    }

    pub(crate) fn set_current_operation(&self, op: Option<OpId>) {
        self.current
            .store(op.unwrap_or(NO_OPERATION), Ordering::Release);
    }
}

impl Default for Row {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Row")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("defer", &self.defer_state())
            .field("current_operation", &self.current_operation())
            .field("columns", &*self.columns_guard())
            .finish()
    }
}

impl fmt::Display for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "row#{} {}", self.id, self.to_json())
    }
}
