//! Status emission contract.
//!
//! Every user-visible outcome is a [`StatusEvent`]: structured data handed to
//! a [`Notifier`]. The messaging collaborator decides how to present it;
//! [`render`] supplies default English text for the console and log sinks.
//!
//! # Notifiers
//!
//! - [`LogNotifier`] - Writes events as tracing records
//! - [`ChannelNotifier`] - Forwards events to an mpsc receiver
//! - [`ThrottledNotifier`] - Drops progress updates that arrive too fast per item

use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::classify::{ClassificationCandidate, ManualReason, MediaCategory};
use crate::command::COMMAND_HELP;
use crate::config::SettingsSummary;
use crate::download::{ProgressReport, ReportKind, UpdateThrottle};
use crate::manual::{EntryId, ManualResolutionEntry};
use crate::placement::ConflictPolicy;
use crate::queue::{FailureReason, ItemId, ItemView, QueueSnapshot, Statistics};

/// A status update for the operator.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StatusEvent {
    /// Greeting with the active limits.
    Welcome {
        /// Concurrency limit.
        concurrency: usize,
        /// Aggregate speed cap in Mbps, `0` for unlimited.
        max_speed_mbps: f64,
    },
    /// Command reference.
    Help,
    /// Active configuration.
    Settings {
        /// Copy of the settings.
        settings: SettingsSummary,
    },
    /// Lifetime statistics.
    Statistics {
        /// Copy of the counters.
        stats: Statistics,
        /// Current snapshot.
        snapshot: QueueSnapshot,
    },
    /// Active and queued items.
    QueueListing {
        /// Derived counts.
        snapshot: QueueSnapshot,
        /// Items being transferred.
        active: Vec<ItemView>,
        /// Items waiting, in dispatch order.
        queued: Vec<ItemView>,
    },
    /// Item admitted to the pending sequence.
    Queued {
        /// Item id.
        id: ItemId,
        /// Sanitized filename.
        filename: String,
        /// 1-based place in the pending sequence.
        position: usize,
        /// Declared size.
        size: Option<u64>,
    },
    /// Item dispatched to a worker.
    Started {
        /// Item id.
        id: ItemId,
        /// Sanitized filename.
        filename: String,
        /// Declared size.
        total: Option<u64>,
        /// 1-based attempt number.
        attempt: u32,
    },
    /// Periodic or checkpoint progress.
    Progress {
        /// Item id.
        id: ItemId,
        /// Sanitized filename.
        filename: String,
        /// The report.
        report: ProgressReport,
    },
    /// Transfer finished.
    Completed {
        /// Item id.
        id: ItemId,
        /// Sanitized filename.
        filename: String,
        /// Final size.
        bytes: u64,
        /// Transfer time.
        elapsed: Duration,
    },
    /// Item cancelled by the operator.
    Cancelled {
        /// Item id.
        id: ItemId,
        /// Sanitized filename.
        filename: String,
        /// Bytes transferred before cancellation.
        bytes: u64,
        /// Total size, if known.
        total: Option<u64>,
    },
    /// Cancellation requested for an active item; confirmed by `Cancelled`.
    CancelRequested {
        /// Item id.
        id: ItemId,
    },
    /// Transient failure; another attempt is scheduled.
    Retrying {
        /// Item id.
        id: ItemId,
        /// Sanitized filename.
        filename: String,
        /// Attempt about to be made (1-based retry number).
        attempt: u32,
        /// Retry budget.
        max_retries: u32,
        /// Wait before the retry.
        delay: Duration,
        /// What went wrong.
        reason: FailureReason,
    },
    /// Terminal failure.
    Failed {
        /// Item id.
        id: ItemId,
        /// Sanitized filename.
        filename: String,
        /// What went wrong.
        reason: FailureReason,
        /// Retries already spent.
        retries: u32,
    },
    /// A completed file entered classification.
    ClassificationStarted {
        /// Item id.
        id: ItemId,
        /// Sanitized filename.
        filename: String,
    },
    /// A file was classified confidently.
    Classified {
        /// Item id.
        id: ItemId,
        /// Sanitized filename.
        filename: String,
        /// The candidate.
        candidate: ClassificationCandidate,
    },
    /// A file was moved into the library.
    Placed {
        /// Item id.
        id: ItemId,
        /// Sanitized filename.
        filename: String,
        /// Category it was filed under.
        category: MediaCategory,
        /// Final path.
        destination: PathBuf,
    },
    /// A file needs an operator decision.
    ManualResolutionRequired {
        /// Manual entry id.
        entry: EntryId,
        /// Sanitized filename.
        filename: String,
        /// Why.
        reason: ManualReason,
        /// Best effort candidate.
        candidate: ClassificationCandidate,
    },
    /// The destination already exists; the file stays where it is.
    PlacementConflict {
        /// Sanitized filename.
        filename: String,
        /// Occupied destination.
        destination: PathBuf,
        /// Where the file was left.
        left_at: PathBuf,
    },
    /// Moving the file failed.
    PlacementFailed {
        /// Sanitized filename.
        filename: String,
        /// Error text.
        detail: String,
    },
    /// An entry was skipped and moved to the unmatched root.
    Skipped {
        /// Manual entry id.
        entry: EntryId,
        /// Sanitized filename.
        filename: String,
        /// Final path.
        destination: PathBuf,
    },
    /// Pending manual entries.
    PendingListing {
        /// Entries in insertion order.
        entries: Vec<ManualResolutionEntry>,
    },
    /// An operator command could not be carried out.
    CommandError {
        /// What went wrong.
        message: String,
    },
}

impl StatusEvent {
    /// Short machine-readable name of the event.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Welcome { .. } => "welcome",
            Self::Help => "help",
            Self::Settings { .. } => "settings",
            Self::Statistics { .. } => "statistics",
            Self::QueueListing { .. } => "queue_listing",
            Self::Queued { .. } => "queued",
            Self::Started { .. } => "started",
            Self::Progress { .. } => "progress",
            Self::Completed { .. } => "completed",
            Self::Cancelled { .. } => "cancelled",
            Self::CancelRequested { .. } => "cancel_requested",
            Self::Retrying { .. } => "retrying",
            Self::Failed { .. } => "failed",
            Self::ClassificationStarted { .. } => "classification_started",
            Self::Classified { .. } => "classified",
            Self::Placed { .. } => "placed",
            Self::ManualResolutionRequired { .. } => "manual_resolution_required",
            Self::PlacementConflict { .. } => "placement_conflict",
            Self::PlacementFailed { .. } => "placement_failed",
            Self::Skipped { .. } => "skipped",
            Self::PendingListing { .. } => "pending_listing",
            Self::CommandError { .. } => "command_error",
        }
    }

    /// Queue item the event is about, if any.
    #[must_use]
    pub fn item_id(&self) -> Option<ItemId> {
        match self {
            Self::Queued { id, .. }
            | Self::Started { id, .. }
            | Self::Progress { id, .. }
            | Self::Completed { id, .. }
            | Self::Cancelled { id, .. }
            | Self::CancelRequested { id }
            | Self::Retrying { id, .. }
            | Self::Failed { id, .. }
            | Self::ClassificationStarted { id, .. }
            | Self::Classified { id, .. }
            | Self::Placed { id, .. } => Some(*id),
            _ => None,
        }
    }

    /// True for events that end an item's transfer.
    #[must_use]
    pub fn is_transfer_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Cancelled { .. } | Self::Failed { .. }
        )
    }

    /// True for events reporting something that went wrong.
    #[must_use]
    pub fn is_problem(&self) -> bool {
        matches!(
            self,
            Self::Retrying { .. }
                | Self::Failed { .. }
                | Self::PlacementConflict { .. }
                | Self::PlacementFailed { .. }
                | Self::CommandError { .. }
        )
    }
}

/// Receives status events.
///
/// Implementations must not block: the queue calls `notify` from its own
/// tasks, outside the state lock.
///
/// # Object Safety
///
/// The trait is object safe so the queue and the pipeline can share an
/// `Arc<dyn Notifier>`.
pub trait Notifier: Send + Sync {
    /// Handles one event.
    fn notify(&self, event: StatusEvent);
}

// ==================== Notifiers ====================

/// Writes events as tracing records.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: StatusEvent) {
        let id = event.item_id().map(ItemId::get);
        if event.is_problem() {
            warn!(event = event.kind(), ?id, "{}", render(&event));
        } else {
            info!(event = event.kind(), ?id, "{}", render(&event));
        }
    }
}

/// Forwards events to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<StatusEvent>,
}

impl ChannelNotifier {
    /// Creates a notifier and the receiving end of its channel.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StatusEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, event: StatusEvent) {
        if self.tx.send(event).is_err() {
            debug!("status receiver dropped");
        }
    }
}

/// Drops periodic progress events arriving faster than a minimum interval
/// per item. Everything else passes through.
pub struct ThrottledNotifier {
    inner: Arc<dyn Notifier>,
    throttle: UpdateThrottle<ItemId>,
}

impl ThrottledNotifier {
    /// Wraps `inner` with a per-item minimum interval.
    #[must_use]
    pub fn new(inner: Arc<dyn Notifier>, min_interval: Duration) -> Self {
        Self {
            inner,
            throttle: UpdateThrottle::new(min_interval),
        }
    }
}

impl std::fmt::Debug for ThrottledNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThrottledNotifier").finish_non_exhaustive()
    }
}

impl Notifier for ThrottledNotifier {
    fn notify(&self, event: StatusEvent) {
        match &event {
            StatusEvent::Progress { id, report, .. } if report.kind == ReportKind::Periodic => {
                if !self.throttle.try_acquire(*id) {
                    return;
                }
            }
            other if other.is_transfer_terminal() => {
                if let Some(id) = other.item_id() {
                    self.throttle.forget(&id);
                }
            }
            _ => {}
        }
        self.inner.notify(event);
    }
}

// ==================== Rendering ====================

/// Formats a byte count with decimal units (`740.7 MB`).
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if bytes < 1000 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

/// Formats a duration as `1h 02m`, `3m 05s` or `12s`.
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if hours > 0 {
        format!("{hours}h {minutes:02}m")
    } else if minutes > 0 {
        format!("{minutes}m {seconds:02}s")
    } else {
        format!("{seconds}s")
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn format_speed(bytes_per_sec: f64) -> String {
    format!("{}/s", format_size(bytes_per_sec.max(0.0) as u64))
}

fn format_progress(bytes: u64, total: Option<u64>) -> String {
    match total {
        Some(total) => format!("{} / {}", format_size(bytes), format_size(total)),
        None => format_size(bytes),
    }
}

fn format_speed_cap(mbps: f64) -> String {
    if mbps > 0.0 {
        format!("{mbps} Mbps")
    } else {
        "unlimited".to_string()
    }
}

fn render_settings(settings: &SettingsSummary) -> String {
    let conflicts = match settings.conflict_policy {
        ConflictPolicy::Report => "report and keep in temp",
        ConflictPolicy::RenameWithSuffix => "rename with a numeric suffix",
    };
    format!(
        "Current settings:\nTemp directory: {}\nMovies: {}\nTV shows: {}\nUnmatched: {}\nMax concurrent downloads: {}\nChunk size: {}\nRetries: {} (after {})\nSpeed limit: {}\nPer-file speed limit: {}\nVerify downloads: {}\nConfidence threshold: {:.2}\nTie-break margin: {:.2}\nOn conflict: {conflicts}",
        settings.temp_dir.display(),
        settings.library.movies.display(),
        settings.library.tv.display(),
        settings.library.unmatched.display(),
        settings.concurrency,
        format_size(u64::try_from(settings.chunk_size).unwrap_or(u64::MAX)),
        settings.max_retries,
        format_duration(settings.retry_delay),
        format_speed_cap(settings.max_speed_mbps),
        format_speed_cap(settings.per_file_speed_mbps),
        if settings.verify_downloads { "yes" } else { "no" },
        settings.confidence_threshold,
        settings.tie_break_margin,
    )
}

/// Default English text for an event.
#[must_use]
pub fn render(event: &StatusEvent) -> String {
    match event {
        StatusEvent::Welcome {
            concurrency,
            max_speed_mbps,
        } => format!(
            "Media intake ready. Send files to download.\nMax concurrent downloads: {concurrency}\nSpeed limit: {}\nUse /help for commands.",
            format_speed_cap(*max_speed_mbps)
        ),
        StatusEvent::Settings { settings } => render_settings(settings),
        StatusEvent::Help => {
            let mut text = String::from("Commands:");
            for (usage, description) in COMMAND_HELP {
                let _ = write!(text, "\n{usage} - {description}");
            }
            text
        }
        StatusEvent::Statistics { stats, snapshot } => format!(
            "Statistics (uptime {}):\nFiles handled: {}\nSucceeded: {}\nFailed: {}\nCancelled: {}\nRetries: {}\nDownloaded: {}\nActive: {} / {} (peak {})\nQueued: {}",
            format_duration(stats.uptime),
            stats.files_handled,
            stats.succeeded,
            stats.failed,
            stats.cancelled,
            stats.retries,
            format_size(stats.total_bytes),
            snapshot.active,
            snapshot.concurrency_limit,
            stats.peak_concurrency,
            snapshot.queued,
        ),
        StatusEvent::QueueListing {
            snapshot,
            active,
            queued,
        } => render_listing(snapshot, active, queued),
        StatusEvent::Queued {
            id,
            filename,
            position,
            size,
        } => {
            let size = size.map(|s| format!(" ({})", format_size(s))).unwrap_or_default();
            format!("#{id} {filename}{size} added to download queue at position {position}")
        }
        StatusEvent::Started {
            id,
            filename,
            total,
            attempt,
        } => {
            let size = total.map(|s| format!(" ({})", format_size(s))).unwrap_or_default();
            if *attempt > 1 {
                format!("#{id} Downloading {filename}{size}, attempt {attempt}")
            } else {
                format!("#{id} Downloading {filename}{size}")
            }
        }
        StatusEvent::Progress {
            id,
            filename,
            report,
        } => {
            let mut text = format!(
                "#{id} {filename}: {}",
                format_progress(report.bytes, report.total)
            );
            if let Some(percent) = report.percent {
                let _ = write!(text, " ({percent:.1}%)");
            }
            let _ = write!(text, ", {}", format_speed(report.speed_bps));
            if let Some(eta) = report.eta {
                let _ = write!(text, ", ETA {}", format_duration(eta));
            }
            text
        }
        StatusEvent::Completed {
            id,
            filename,
            bytes,
            elapsed,
        } => format!(
            "#{id} Download complete: {filename} ({}) in {}",
            format_size(*bytes),
            format_duration(*elapsed)
        ),
        StatusEvent::Cancelled {
            id,
            filename,
            bytes,
            total,
        } => format!(
            "#{id} Download cancelled: {filename} at {}",
            format_progress(*bytes, *total)
        ),
        StatusEvent::CancelRequested { id } => {
            format!("#{id} Cancelling, the transfer stops at the next chunk")
        }
        StatusEvent::Retrying {
            id,
            filename,
            attempt,
            max_retries,
            delay,
            reason,
        } => format!(
            "#{id} {filename}: {reason}. Retrying in {} ({attempt}/{max_retries})",
            format_duration(*delay)
        ),
        StatusEvent::Failed {
            id,
            filename,
            reason,
            retries,
        } => {
            if *retries > 0 {
                format!("#{id} Download failed: {filename}: {reason} (after {retries} retries)")
            } else {
                format!("#{id} Download failed: {filename}: {reason}")
            }
        }
        StatusEvent::ClassificationStarted { id, filename } => {
            format!("#{id} Classifying {filename}")
        }
        StatusEvent::Classified {
            id,
            filename,
            candidate,
        } => {
            let mut text = format!("#{id} {filename} identified as {}", candidate.display_title());
            if let Some(year) = candidate.display_year() {
                let _ = write!(text, " ({year})");
            }
            if let (Some(season), Some(episode)) = (candidate.season, candidate.episode) {
                let _ = write!(text, " S{season:02}E{episode:02}");
            }
            let _ = write!(text, " [{}, score {:.2}]", candidate.category, candidate.score);
            text
        }
        StatusEvent::Placed {
            id,
            filename,
            category,
            destination,
        } => format!(
            "#{id} Filed {filename} as {category}: {}",
            destination.display()
        ),
        StatusEvent::ManualResolutionRequired {
            entry,
            filename,
            reason,
            candidate,
        } => {
            let mut text = format!("Manual resolution needed [{entry}] {filename}: {reason}");
            if let Some(best) = &candidate.best_match {
                let _ = write!(text, "\nBest guess: {}", best.title);
                if let Some(year) = best.year {
                    let _ = write!(text, " ({year})");
                }
            }
            let _ = write!(
                text,
                "\nReply /resolve {entry} movie|tv <title> [year] [season] or /skip {entry}"
            );
            text
        }
        StatusEvent::PlacementConflict {
            filename,
            destination,
            left_at,
        } => format!(
            "Cannot file {filename}: {} already exists. File left at {}",
            destination.display(),
            left_at.display()
        ),
        StatusEvent::PlacementFailed { filename, detail } => {
            format!("Cannot file {filename}: {detail}")
        }
        StatusEvent::Skipped {
            entry,
            filename,
            destination,
        } => format!(
            "[{entry}] {filename} skipped, moved to {}",
            destination.display()
        ),
        StatusEvent::PendingListing { entries } => {
            if entries.is_empty() {
                return "No files awaiting manual resolution.".to_string();
            }
            let mut text = format!("{} file(s) awaiting manual resolution:", entries.len());
            for entry in entries {
                let _ = write!(
                    text,
                    "\n[{}] {}: {}",
                    entry.id, entry.download.filename, entry.reason
                );
            }
            text
        }
        StatusEvent::CommandError { message } => message.clone(),
    }
}

fn render_listing(snapshot: &QueueSnapshot, active: &[ItemView], queued: &[ItemView]) -> String {
    if active.is_empty() && queued.is_empty() {
        return "Download queue is empty.".to_string();
    }
    let mut text = format!(
        "Active downloads ({}/{}):",
        snapshot.active, snapshot.concurrency_limit
    );
    for (index, item) in active.iter().enumerate() {
        let _ = write!(
            text,
            "\n{}. #{} {}\n   {}",
            index + 1,
            item.id,
            item.filename,
            format_progress(item.bytes, item.total)
        );
        if let Some(speed) = item.speed_bps {
            let _ = write!(text, " at {}", format_speed(speed));
        }
    }
    if !queued.is_empty() {
        let _ = write!(text, "\nQueued ({}):", queued.len());
        for item in queued {
            let position = item.position.unwrap_or_default();
            let _ = write!(text, "\n{position}. #{} {}", item.id, item.filename);
            if item.retry_count > 0 {
                let _ = write!(text, " (retry {})", item.retry_count);
            }
        }
    }
    if snapshot.retrying > 0 {
        let _ = write!(text, "\nWaiting to retry: {}", snapshot.retrying);
    }
    text
}
