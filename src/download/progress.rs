//! Shared per-transfer counters and the progress reporting policy.
//!
//! [`TransferProgress`] is written by the worker after every chunk and read by
//! the queue for snapshots and periodic reports. [`ProgressTracker`] turns
//! those readings into [`ProgressReport`]s according to [`ProgressPolicy`]:
//! large files get a long-interval "still running" update, small files get a
//! single update at a checkpoint percentage.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

/// Smoothing factor for the exponentially weighted speed estimate.
const SPEED_SMOOTHING: f64 = 0.3;

/// Default size above which a file counts as large (500 MiB).
pub const DEFAULT_LARGE_FILE_THRESHOLD: u64 = 500 * 1024 * 1024;

/// Default interval between updates for large files (30 minutes).
pub const DEFAULT_LARGE_FILE_UPDATE_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Default checkpoint for the single small-file update.
pub const DEFAULT_SMALL_FILE_CHECKPOINT_PERCENT: u8 = 50;

/// Live counters for one transfer, shared between its worker and the queue.
#[derive(Debug)]
pub struct TransferProgress {
    bytes: AtomicU64,
    /// Total size in bytes; zero while unknown.
    total: AtomicU64,
    cancelled: AtomicBool,
    started: Instant,
    /// Milliseconds since `started` at the last chunk.
    last_progress_ms: AtomicU64,
}

impl TransferProgress {
    /// Creates counters for a transfer starting now.
    #[must_use]
    pub fn new(declared_size: Option<u64>) -> Self {
        Self {
            bytes: AtomicU64::new(0),
            total: AtomicU64::new(declared_size.unwrap_or(0)),
            cancelled: AtomicBool::new(false),
            started: Instant::now(),
            last_progress_ms: AtomicU64::new(0),
        }
    }

    /// Records the byte count after a chunk and stamps the progress time.
    pub fn record(&self, bytes: u64) {
        self.bytes.fetch_max(bytes, Ordering::SeqCst);
        let ms = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_progress_ms.fetch_max(ms, Ordering::SeqCst);
    }

    /// Resets the byte count (used when a resume was refused and the stream restarts).
    pub fn reset_bytes(&self, bytes: u64) {
        self.bytes.store(bytes, Ordering::SeqCst);
    }

    /// Sets the total once the source reports it, unless a size was declared.
    pub fn learn_total(&self, total: u64) {
        let _ = self
            .total
            .compare_exchange(0, total, Ordering::SeqCst, Ordering::SeqCst);
    }

    /// Bytes written so far.
    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::SeqCst)
    }

    /// Total size, if known.
    #[must_use]
    pub fn total(&self) -> Option<u64> {
        match self.total.load(Ordering::SeqCst) {
            0 => None,
            n => Some(n),
        }
    }

    /// Requests cooperative cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Returns whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Time since the transfer started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Time since the last chunk landed (or since start if none has).
    #[must_use]
    pub fn idle(&self) -> Duration {
        let last = Duration::from_millis(self.last_progress_ms.load(Ordering::SeqCst));
        self.started.elapsed().saturating_sub(last)
    }
}

/// When progress updates are emitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressPolicy {
    /// Files larger than this get periodic updates.
    pub large_file_threshold: u64,
    /// Interval between periodic updates for large files.
    pub large_file_update_interval: Duration,
    /// Percentage at which small files emit their single update.
    pub small_file_checkpoint_percent: u8,
}

impl Default for ProgressPolicy {
    fn default() -> Self {
        Self {
            large_file_threshold: DEFAULT_LARGE_FILE_THRESHOLD,
            large_file_update_interval: DEFAULT_LARGE_FILE_UPDATE_INTERVAL,
            small_file_checkpoint_percent: DEFAULT_SMALL_FILE_CHECKPOINT_PERCENT,
        }
    }
}

/// Which update style produced a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    /// Long-interval "still running" update for a large or unsized file.
    Periodic,
    /// One-shot update for a small file at its checkpoint.
    Checkpoint,
}

/// Structured progress data handed to the notification collaborator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressReport {
    /// Bytes transferred.
    pub bytes: u64,
    /// Total size, if known.
    pub total: Option<u64>,
    /// Completion percentage, if the total is known.
    pub percent: Option<f64>,
    /// Time since the transfer started.
    pub elapsed: Duration,
    /// Smoothed speed in bytes per second.
    pub speed_bps: f64,
    /// Estimated time remaining.
    pub eta: Option<Duration>,
    /// Update style.
    pub kind: ReportKind,
}

/// Per-item reporting state: smoothed speed and what was already reported.
///
/// Reports from one tracker never go backwards in bytes or elapsed time.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    policy: ProgressPolicy,
    smoothed_speed: Option<f64>,
    last_sample: Option<(Duration, u64)>,
    last_report_at: Duration,
    last_reported_bytes: u64,
    checkpoint_sent: bool,
}

impl ProgressTracker {
    /// Creates a tracker with the given policy.
    #[must_use]
    pub fn new(policy: ProgressPolicy) -> Self {
        Self {
            policy,
            smoothed_speed: None,
            last_sample: None,
            last_report_at: Duration::ZERO,
            last_reported_bytes: 0,
            checkpoint_sent: false,
        }
    }

    /// Smoothed speed in bytes per second (zero before two samples).
    #[must_use]
    pub fn speed(&self) -> f64 {
        self.smoothed_speed.unwrap_or(0.0)
    }

    /// Feeds one reading; returns a report when the policy says one is due.
    pub fn observe(
        &mut self,
        bytes: u64,
        total: Option<u64>,
        elapsed: Duration,
    ) -> Option<ProgressReport> {
        self.sample(bytes, elapsed);

        let bytes = bytes.max(self.last_reported_bytes);
        let elapsed = elapsed.max(self.last_report_at);

        let kind = match total {
            Some(total) if total <= self.policy.large_file_threshold => {
                if self.checkpoint_sent || percent_of(bytes, total) < f64::from(self.policy.small_file_checkpoint_percent) {
                    return None;
                }
                self.checkpoint_sent = true;
                ReportKind::Checkpoint
            }
            _ => {
                if elapsed.saturating_sub(self.last_report_at) < self.policy.large_file_update_interval {
                    return None;
                }
                ReportKind::Periodic
            }
        };

        self.last_report_at = elapsed;
        self.last_reported_bytes = bytes;
        Some(self.report(bytes, total, elapsed, kind))
    }

    fn sample(&mut self, bytes: u64, elapsed: Duration) {
        if let Some((prev_elapsed, prev_bytes)) = self.last_sample {
            let dt = elapsed.saturating_sub(prev_elapsed).as_secs_f64();
            if dt > 0.0 {
                #[allow(clippy::cast_precision_loss)]
                let instant = bytes.saturating_sub(prev_bytes) as f64 / dt;
                self.smoothed_speed = Some(match self.smoothed_speed {
                    Some(prev) => SPEED_SMOOTHING * instant + (1.0 - SPEED_SMOOTHING) * prev,
                    None => instant,
                });
            }
        }
        if self.last_sample.is_none_or(|(prev_elapsed, _)| elapsed >= prev_elapsed) {
            self.last_sample = Some((elapsed, bytes));
        }
    }

    fn report(&self, bytes: u64, total: Option<u64>, elapsed: Duration, kind: ReportKind) -> ProgressReport {
        let speed = self.speed();
        let eta = match total {
            Some(total) if speed > 0.0 => {
                #[allow(clippy::cast_precision_loss)]
                let remaining = total.saturating_sub(bytes) as f64;
                Some(Duration::from_secs_f64(remaining / speed))
            }
            _ => None,
        };
        ProgressReport {
            bytes,
            total,
            percent: total.map(|t| percent_of(bytes, t)),
            elapsed,
            speed_bps: speed,
            eta,
            kind,
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn percent_of(bytes: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (bytes as f64 / total as f64 * 100.0).min(100.0)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    fn policy() -> ProgressPolicy {
        ProgressPolicy {
            large_file_threshold: 500 * MIB,
            large_file_update_interval: Duration::from_secs(60),
            small_file_checkpoint_percent: 50,
        }
    }

    #[test]
    fn test_small_file_reports_once_at_checkpoint() {
        let mut tracker = ProgressTracker::new(policy());
        let total = Some(100 * MIB);
        assert!(tracker.observe(10 * MIB, total, Duration::from_secs(5)).is_none());
        assert!(tracker.observe(40 * MIB, total, Duration::from_secs(10)).is_none());

        let report = tracker.observe(55 * MIB, total, Duration::from_secs(15)).unwrap();
        assert_eq!(report.kind, ReportKind::Checkpoint);
        assert!(report.percent.unwrap() >= 50.0);

        assert!(tracker.observe(90 * MIB, total, Duration::from_secs(20)).is_none());
    }

    #[test]
    fn test_large_file_reports_on_interval() {
        let mut tracker = ProgressTracker::new(policy());
        let total = Some(740 * MIB);
        assert!(tracker.observe(10 * MIB, total, Duration::from_secs(30)).is_none());
        let first = tracker.observe(20 * MIB, total, Duration::from_secs(60)).unwrap();
        assert_eq!(first.kind, ReportKind::Periodic);
        assert!(tracker.observe(30 * MIB, total, Duration::from_secs(90)).is_none());
        assert!(tracker.observe(40 * MIB, total, Duration::from_secs(120)).is_some());
    }

    #[test]
    fn test_unknown_size_uses_periodic_updates() {
        let mut tracker = ProgressTracker::new(policy());
        let report = tracker.observe(MIB, None, Duration::from_secs(61)).unwrap();
        assert_eq!(report.kind, ReportKind::Periodic);
        assert!(report.percent.is_none());
        assert!(report.eta.is_none());
    }

    #[test]
    fn test_reports_are_monotonic() {
        let mut tracker = ProgressTracker::new(policy());
        let total = Some(2000 * MIB);
        let a = tracker.observe(300 * MIB, total, Duration::from_secs(60)).unwrap();
        // A stale reading after a restarted stream must not regress.
        let b = tracker.observe(100 * MIB, total, Duration::from_secs(120)).unwrap();
        assert!(b.bytes >= a.bytes);
        assert!(b.elapsed >= a.elapsed);
    }

    #[test]
    fn test_speed_is_smoothed_and_eta_derived() {
        let mut tracker = ProgressTracker::new(policy());
        let total = Some(1000 * MIB);
        tracker.observe(0, total, Duration::ZERO);
        tracker.observe(10 * MIB, total, Duration::from_secs(1));
        assert!((tracker.speed() - (10 * MIB) as f64).abs() < 1.0);

        tracker.observe(30 * MIB, total, Duration::from_secs(2));
        // 0.3 * 20 MiB/s + 0.7 * 10 MiB/s = 13 MiB/s
        assert!((tracker.speed() - (13 * MIB) as f64).abs() < 1.0);

        let report = tracker.observe(40 * MIB, total, Duration::from_secs(60)).unwrap();
        assert!(report.eta.unwrap() > Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transfer_progress_counters() {
        let progress = TransferProgress::new(None);
        assert!(progress.total().is_none());
        progress.learn_total(500);
        progress.learn_total(900);
        assert_eq!(progress.total(), Some(500));

        tokio::time::advance(Duration::from_secs(3)).await;
        progress.record(100);
        progress.record(50);
        assert_eq!(progress.bytes(), 100);
        assert_eq!(progress.idle(), Duration::ZERO);

        assert!(!progress.is_cancelled());
        progress.cancel();
        assert!(progress.is_cancelled());
    }
}
