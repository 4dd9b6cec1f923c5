//! Lifetime statistics and the derived queue snapshot.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

/// Running totals for the lifetime of the process. Never persisted.
#[derive(Debug, Clone)]
pub(crate) struct StatsCounters {
    pub files_handled: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub retries: u64,
    pub total_bytes: u64,
    pub peak_concurrency: usize,
    pub started: Instant,
}

impl StatsCounters {
    pub fn new() -> Self {
        Self {
            files_handled: 0,
            succeeded: 0,
            failed: 0,
            cancelled: 0,
            retries: 0,
            total_bytes: 0,
            peak_concurrency: 0,
            started: Instant::now(),
        }
    }

    pub fn observe_concurrency(&mut self, active: usize) {
        self.peak_concurrency = self.peak_concurrency.max(active);
    }

    pub fn copy(&self) -> Statistics {
        Statistics {
            files_handled: self.files_handled,
            succeeded: self.succeeded,
            failed: self.failed,
            cancelled: self.cancelled,
            retries: self.retries,
            total_bytes: self.total_bytes,
            peak_concurrency: self.peak_concurrency,
            uptime: self.started.elapsed(),
        }
    }
}

/// Copy of the queue's lifetime statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Statistics {
    /// Items admitted.
    pub files_handled: u64,
    /// Items that completed.
    pub succeeded: u64,
    /// Items that failed terminally.
    pub failed: u64,
    /// Items cancelled.
    pub cancelled: u64,
    /// Automatic and operator retries.
    pub retries: u64,
    /// Bytes of completed items only.
    pub total_bytes: u64,
    /// Highest number of simultaneously active items.
    pub peak_concurrency: usize,
    /// Time since the queue was created.
    pub uptime: Duration,
}

/// Derived view over the current item set, recomputed on every call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueSnapshot {
    /// Items being transferred.
    pub active: usize,
    /// Items waiting for a slot.
    pub queued: usize,
    /// Failed items with an automatic retry pending.
    pub retrying: usize,
    /// Completed items.
    pub completed: usize,
    /// Terminally failed items.
    pub failed: usize,
    /// Cancelled items.
    pub cancelled: usize,
    /// Bytes transferred across all items (in-flight attempts included).
    pub bytes_transferred: u64,
    /// Highest number of simultaneously active items.
    pub peak_concurrency: usize,
    /// Configured concurrency limit.
    pub concurrency_limit: usize,
}

impl QueueSnapshot {
    /// True when nothing is active, queued or waiting for a retry.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.active == 0 && self.queued == 0 && self.retrying == 0
    }
}
