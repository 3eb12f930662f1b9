//! Row counter shown on stderr while a run streams output.

use kdam::{Animation, Bar, BarExt};
use std::sync::{Arc, Mutex};

// Progress bar type alias
pub type ProgressBar = Arc<Mutex<Bar>>;

/// Create a counter for unknown total (shows count without percentage)
pub fn create_counter(desc: &'static str) -> ProgressBar {
    Arc::new(Mutex::new(kdam::tqdm!(
        total = 0,
        desc = desc,
        animation = Animation::Classic,
        position = 0,
        unit = " rows"
    )))
}

/// Update progress bar if available
/// Uses try_lock to avoid blocking if mutex is contended (non-blocking)
pub fn update_progress_bar(pb: &ProgressBar, n: usize) {
    if let Ok(mut pb) = pb.try_lock() {
        let _ = pb.update(n);
    }
}

/// Count one row and update the bar every `chunk_size` rows. Returns the new count.
pub fn report_progress_batched(pb: Option<&ProgressBar>, count: usize, chunk_size: usize) -> usize {
    let count = count + 1;
    if let Some(pb) = pb
        && count.is_multiple_of(chunk_size)
    {
        update_progress_bar(pb, chunk_size);
    }
    count
}

/// Final progress update for the remainder after batched updates, then a refresh so the
/// line shows the final count.
pub fn flush_progress_remainder(pb: Option<&ProgressBar>, total: usize, chunk_size: usize) {
    if let Some(pb) = pb {
        let remaining = total % chunk_size;
        if remaining > 0 {
            update_progress_bar(pb, remaining);
        }
        if let Ok(mut bar) = pb.lock() {
            let _ = bar.refresh();
            eprintln!();
        }
    }
}
