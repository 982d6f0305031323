//! # Global runtime configuration.
//!
//! Provides [`Config`], the centralized settings for the broker runtime.
//!
//! ## Sentinel values
//! - `executor_concurrency = 0` → unlimited (no cap semaphore created)
//! - `grace = 0s` → no grace window (stragglers are aborted immediately)

use std::time::Duration;

/// Global configuration for the broker runtime.
///
/// Defines:
/// - **Shutdown behavior**: grace period for graceful termination
/// - **Sync cadence**: delay between work-source polls
/// - **Execution limits**: max concurrently processing messages
///
/// ## Field semantics
/// - `grace`: maximum wait for tasks to stop voluntarily (`0s` = abort immediately)
/// - `sync_interval`: pause between work-source sync polls
/// - `executor_concurrency`: processing cap (`0` = unlimited)
#[derive(Clone, Debug)]
pub struct Config {
    /// Maximum time to wait for tasks to finish voluntarily before aborting.
    ///
    /// Applied by `TaskSupervisor::close` and `Scheduler::close`.
    pub grace: Duration,

    /// Delay between work-source sync polls.
    ///
    /// The work source itself may additionally block until changes are
    /// available; this interval only paces the polling loop.
    pub sync_interval: Duration,

    /// Maximum number of messages processing concurrently.
    ///
    /// - `0` = unlimited (no semaphore)
    /// - `n > 0` = at most `n` messages in flight
    pub executor_concurrency: usize,
}

impl Config {
    /// Returns the processing cap as an `Option`.
    ///
    /// - `None` → unlimited (no semaphore)
    /// - `Some(n)` → at most `n` messages in flight
    #[inline]
    pub fn concurrency_limit(&self) -> Option<usize> {
        if self.executor_concurrency == 0 {
            None
        } else {
            Some(self.executor_concurrency)
        }
    }
}

impl Default for Config {
    /// Default configuration:
    ///
    /// - `grace = 30s`
    /// - `sync_interval = 1s`
    /// - `executor_concurrency = 8`
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(30),
            sync_interval: Duration::from_secs(1),
            executor_concurrency: 8,
        }
    }
}
