//! Application configuration: engine knobs, defaults and validation.
//! Tuning and thresholds in one place.

use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;

use crate::error::{PipelineError, PipelineResult};
use crate::pipeline::queue::RowQueueType;

// ---- Package names (from CARGO_PKG_NAME, cached) ----

/// Package-derived names: built once from `CARGO_PKG_NAME`, then cached.
pub struct PackagePaths {
    pkg_name: &'static str,
    pipeline_filename: String,
    worker_thread_name: String,
}

static PACKAGE_PATHS: OnceLock<PackagePaths> = OnceLock::new();

impl PackagePaths {
    /// Build and cache names from `CARGO_PKG_NAME`. Called once on first use.
    pub fn get() -> &'static PackagePaths {
        PACKAGE_PATHS.get_or_init(|| {
            let pkg = env!("CARGO_PKG_NAME");
            PackagePaths {
                pkg_name: pkg,
                pipeline_filename: format!("{pkg}.toml"),
                worker_thread_name: format!("{pkg}-worker"),
            }
        })
    }

    pub fn pkg_name(&self) -> &str {
        self.pkg_name
    }

    /// Default pipeline file looked up by the CLI when none is given.
    pub fn pipeline_filename(&self) -> &str {
        &self.pipeline_filename
    }

    pub fn worker_thread_name(&self) -> &str {
        &self.worker_thread_name
    }
}

// ---- Engine defaults ----

/// Default values for [`HostConfig`].
pub struct HostDefaults;

impl HostDefaults {
    pub const INPUT_BUFFER_SIZE: usize = 10;
    pub const THROTTLING_LIMIT: usize = 10_000;
    pub const THROTTLING_SLEEP_RESOLUTION: Duration = Duration::from_millis(5);
    pub const THROTTLING_MAX_SLEEP: Duration = Duration::from_secs(10);
    pub const MAIN_LOOP_DELAY: Duration = Duration::from_millis(10);
    pub const LIVE_SET_LOCK_TIMEOUT: Duration = Duration::from_secs(10);
    /// Effective throttling limit is at least this many times the largest deferred batch size.
    pub const DEFERRED_LIMIT_FACTOR: usize = 10;
}

/// Poll interval of a blocked queue consumer; bounds how late it notices cancellation
/// when no one wakes it explicitly.
pub const QUEUE_CANCEL_POLL: Duration = Duration::from_millis(50);

/// Rows between progress bar updates in the CLI (reduce lock contention).
pub const PROGRESS_UPDATE_BATCH_SIZE: usize = 100;

/// Buffering, throttling and reclamation knobs consumed by [`OperationHost`](crate::pipeline::OperationHost).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    /// Rows buffered before they are submitted to the queue as one batch.
    pub input_buffer_size: usize,
    /// Max active rows before the driver pauses submitting more.
    pub throttling_limit: usize,
    /// Poll interval while throttled.
    pub throttling_sleep_resolution: Duration,
    /// Cap on a single throttling pause; the driver proceeds anyway afterwards.
    pub throttling_max_sleep: Duration,
    /// Interval between wipe passes over the live row set.
    pub main_loop_delay: Duration,
    /// Only reclaim the finished prefix of the live set so output keeps input order.
    pub keep_order: bool,
    /// Queue implementation between driver and worker.
    pub row_queue: RowQueueType,
    /// Bounded wait for the live-set write lock before logging and retrying.
    pub live_set_lock_timeout: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            input_buffer_size: HostDefaults::INPUT_BUFFER_SIZE,
            throttling_limit: HostDefaults::THROTTLING_LIMIT,
            throttling_sleep_resolution: HostDefaults::THROTTLING_SLEEP_RESOLUTION,
            throttling_max_sleep: HostDefaults::THROTTLING_MAX_SLEEP,
            main_loop_delay: HostDefaults::MAIN_LOOP_DELAY,
            keep_order: false,
            row_queue: RowQueueType::default(),
            live_set_lock_timeout: HostDefaults::LIVE_SET_LOCK_TIMEOUT,
        }
    }
}

impl HostConfig {
    /// Reject settings the engine cannot run with. Called before any operation is prepared.
    pub fn validate(&self) -> PipelineResult<()> {
        let fail = |msg: &str| Err(PipelineError::Config(msg.to_string()));
        if self.input_buffer_size == 0 {
            return fail("input_buffer_size must be greater than 0");
        }
        if self.throttling_limit == 0 {
            return fail("throttling_limit must be greater than 0");
        }
        if self.throttling_sleep_resolution.is_zero() {
            return fail("throttling_sleep_resolution must be greater than 0");
        }
        if self.throttling_max_sleep < self.throttling_sleep_resolution {
            return fail("throttling_max_sleep must not be shorter than throttling_sleep_resolution");
        }
        if self.main_loop_delay.is_zero() {
            return fail("main_loop_delay must be greater than 0");
        }
        if self.live_set_lock_timeout.is_zero() {
            return fail("live_set_lock_timeout must be greater than 0");
        }
        Ok(())
    }

    /// Throttling limit after the starvation guard: at least `largest_batch * 10`.
    /// Returns `(limit, raised)`.
    pub fn effective_throttling_limit(&self, largest_batch: Option<usize>) -> (usize, bool) {
        let floor = largest_batch
            .map(|b| b.saturating_mul(HostDefaults::DEFERRED_LIMIT_FACTOR))
            .unwrap_or(0);
        if self.throttling_limit < floor {
            (floor, true)
        } else {
            (self.throttling_limit, false)
        }
    }
}
