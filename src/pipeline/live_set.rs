//! Live row set: every row handed to the host and not yet reclaimed, in insertion order.

use log::warn;
use std::collections::VecDeque;
use std::sync::{PoisonError, RwLock, RwLockWriteGuard, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

use crate::{RowRef, RowState};

/// Back-off between write-lock attempts.
const LOCK_RETRY_PAUSE: Duration = Duration::from_micros(200);

/// Result of one wipe pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WipeStats {
    /// Rows dropped from the set (finished + removed).
    pub wiped: usize,
    /// Finished rows among them (collected when streaming).
    pub finished: usize,
}

/// Membership is guarded by a read/write lock; row fields are not (the worker owns them).
pub struct LiveSet {
    rows: RwLock<VecDeque<RowRef>>,
    lock_timeout: Duration,
}

impl LiveSet {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            rows: RwLock::new(VecDeque::new()),
            lock_timeout,
        }
    }

    /// Write lock with a bounded wait. When the wait exceeds `lock_timeout` the stall is logged
    /// and the attempt continues, so an insert is never dropped.
    fn write(&self) -> RwLockWriteGuard<'_, VecDeque<RowRef>> {
        let mut started = Instant::now();
        loop {
            match self.rows.try_write() {
                Ok(guard) => return guard,
                Err(TryLockError::Poisoned(poisoned)) => return poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => {
                    if started.elapsed() >= self.lock_timeout {
                        warn!(
                            "live row set write lock not acquired within {:?}; still waiting",
                            self.lock_timeout
                        );
                        started = Instant::now();
                    }
                    thread::sleep(LOCK_RETRY_PAUSE);
                }
            }
        }
    }

    pub fn insert(&self, row: RowRef) {
        self.write().push_back(row);
    }

    pub fn insert_many(&self, rows: &[RowRef]) {
        if rows.is_empty() {
            return;
        }
        self.write().extend(rows.iter().cloned());
    }

    pub fn len(&self) -> usize {
        self.rows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of the rows currently in the set, in order.
    pub fn ids(&self) -> Vec<u64> {
        self.rows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|r| r.id())
            .collect()
    }

    /// Hold the read lock for `hold`. Used to exercise the bounded write wait.
    #[doc(hidden)]
    pub fn hold_read_for(&self, hold: Duration) {
        let _guard = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        thread::sleep(hold);
    }

    /// Drop terminal rows from the set.
    ///
    /// `keep_order = false`: one filter pass over the whole set.
    /// `keep_order = true`: only the contiguous terminal prefix, stopping at the first row still
    /// in flight, so collected rows keep insertion order.
    /// Finished rows are appended to `collect` when given; removed rows are just dropped.
    pub fn wipe(&self, keep_order: bool, mut collect: Option<&mut VecDeque<RowRef>>) -> WipeStats {
        let mut stats = WipeStats::default();
        let mut rows = self.write();
        let mut take = |row: RowRef, stats: &mut WipeStats| {
            stats.wiped += 1;
            if row.state() == RowState::Finished {
                stats.finished += 1;
                if let Some(out) = collect.as_deref_mut() {
                    out.push_back(row);
                }
            }
        };
        if keep_order {
            while rows.front().is_some_and(|r| r.state().is_terminal()) {
                if let Some(row) = rows.pop_front() {
                    take(row, &mut stats);
                }
            }
        } else {
            let mut kept = VecDeque::with_capacity(rows.len());
            for row in rows.drain(..) {
                if row.state().is_terminal() {
                    take(row, &mut stats);
                } else {
                    kept.push_back(row);
                }
            }
            *rows = kept;
        }
        stats
    }
}
