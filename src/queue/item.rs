//! Queue item types and state definitions.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::download::{ProgressPolicy, ProgressTracker, SourceRef, TransferError, TransferProgress};

/// Opaque item identifier, assigned in admission order and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(u64);

impl ItemId {
    /// Wraps a raw id.
    #[must_use]
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw id.
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ItemId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .trim_start_matches('#')
            .parse::<u64>()
            .map(Self)
            .map_err(|_| format!("invalid item id: {s}"))
    }
}

/// Lifecycle state of a queue item.
///
/// `Queued → Active → {Completed | Failed | Cancelled}`. A `Failed` item with a
/// scheduled retry goes back to `Queued`; otherwise `Failed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    /// Waiting in the pending sequence.
    Queued,
    /// A worker is transferring it.
    Active,
    /// Transferred (and verified); handed to classification.
    Completed,
    /// Transfer failed.
    Failed,
    /// Cancelled by request.
    Cancelled,
}

impl ItemState {
    /// Returns the string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ItemState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("invalid item state: {s}")),
        }
    }
}

/// Human-readable cause of a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// The source stopped sending data or never answered.
    TimedOut {
        /// Seconds without progress, when known.
        idle_secs: Option<u64>,
    },
    /// Written size differs from the declared size.
    VerificationFailed {
        /// Declared size.
        expected_bytes: u64,
        /// Size on disk.
        actual_bytes: u64,
    },
    /// The source answered with an error status.
    HttpStatus {
        /// Status code.
        status: u16,
    },
    /// The temp volume is full.
    DiskFull,
    /// Connection-level failure.
    Network {
        /// Error text.
        detail: String,
    },
    /// Local file system failure.
    Io {
        /// Error text.
        detail: String,
    },
    /// No source can open the reference.
    InvalidSource {
        /// The rejected reference.
        source_ref: String,
    },
}

impl FailureReason {
    /// Maps a transfer error onto the reason shown to users.
    #[must_use]
    pub fn from_error(error: &TransferError) -> Self {
        match error {
            TransferError::Timeout { .. } => Self::TimedOut { idle_secs: None },
            TransferError::Stalled { idle, .. } => Self::TimedOut {
                idle_secs: Some(idle.as_secs()),
            },
            TransferError::Verification {
                expected_bytes,
                actual_bytes,
                ..
            } => Self::VerificationFailed {
                expected_bytes: *expected_bytes,
                actual_bytes: *actual_bytes,
            },
            TransferError::HttpStatus { status, .. } => Self::HttpStatus { status: *status },
            TransferError::DiskFull { .. } => Self::DiskFull,
            TransferError::Network { source, .. } => Self::Network {
                detail: source.to_string(),
            },
            TransferError::Io { source, .. } => Self::Io {
                detail: source.to_string(),
            },
            TransferError::InvalidSource { source_ref } => Self::InvalidSource {
                source_ref: source_ref.clone(),
            },
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TimedOut {
                idle_secs: Some(secs),
            } => write!(f, "timed out (no data for {secs}s)"),
            Self::TimedOut { idle_secs: None } => write!(f, "timed out"),
            Self::VerificationFailed {
                expected_bytes,
                actual_bytes,
            } => write!(
                f,
                "verification failed (expected {expected_bytes} bytes, got {actual_bytes})"
            ),
            Self::HttpStatus { status } => write!(f, "source returned HTTP {status}"),
            Self::DiskFull => write!(f, "disk full"),
            Self::Network { detail } => write!(f, "network error: {detail}"),
            Self::Io { detail } => write!(f, "file system error: {detail}"),
            Self::InvalidSource { source_ref } => write!(f, "unsupported source: {source_ref}"),
        }
    }
}

/// A queue item. Owned by the queue state; never handed out by reference.
#[derive(Debug)]
pub(crate) struct DownloadItem {
    pub id: ItemId,
    pub source: SourceRef,
    pub filename: String,
    pub declared_size: Option<u64>,
    pub temp_path: PathBuf,
    pub state: ItemState,
    /// Counters of the current (or last) attempt.
    pub progress: Arc<TransferProgress>,
    /// Kept across attempts so reports never go backwards.
    pub tracker: ProgressTracker,
    /// First dispatch; elapsed time spans every attempt.
    pub started_at: Option<Instant>,
    pub retry_count: u32,
    pub cancel_requested: bool,
    pub retry_scheduled: bool,
    pub failure: Option<FailureReason>,
    /// Final size once Completed.
    pub final_bytes: Option<u64>,
}

impl DownloadItem {
    pub fn new(
        id: ItemId,
        source: SourceRef,
        filename: String,
        declared_size: Option<u64>,
        temp_path: PathBuf,
        policy: ProgressPolicy,
    ) -> Self {
        Self {
            id,
            source,
            filename,
            declared_size,
            temp_path,
            state: ItemState::Queued,
            progress: Arc::new(TransferProgress::new(declared_size)),
            tracker: ProgressTracker::new(policy),
            started_at: None,
            retry_count: 0,
            cancel_requested: false,
            retry_scheduled: false,
            failure: None,
            final_bytes: None,
        }
    }

    /// Bytes transferred by the current attempt, or the final size.
    pub fn bytes(&self) -> u64 {
        self.final_bytes.unwrap_or_else(|| self.progress.bytes())
    }

    /// Declared size, or the size learned from the source.
    pub fn total(&self) -> Option<u64> {
        self.declared_size.or_else(|| self.progress.total())
    }

    /// True once no further transition can happen without an operator retry.
    pub fn is_terminal(&self) -> bool {
        match self.state {
            ItemState::Completed | ItemState::Cancelled => true,
            ItemState::Failed => !self.retry_scheduled,
            ItemState::Queued | ItemState::Active => false,
        }
    }

    pub fn view(&self, position: Option<usize>) -> ItemView {
        let active = self.state == ItemState::Active;
        ItemView {
            id: self.id,
            filename: self.filename.clone(),
            source: self.source.to_string(),
            state: self.state,
            bytes: self.bytes(),
            total: self.total(),
            retry_count: self.retry_count,
            retry_scheduled: self.retry_scheduled,
            failure: self.failure.clone(),
            elapsed: self.started_at.map(|t| t.elapsed()),
            idle: active.then(|| self.progress.idle()),
            speed_bps: active.then(|| self.tracker.speed()),
            position,
        }
    }
}

/// Read-only copy of one item, for status and queue listings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemView {
    /// Item id.
    pub id: ItemId,
    /// Sanitized declared filename.
    pub filename: String,
    /// Source reference as text.
    pub source: String,
    /// Current state.
    pub state: ItemState,
    /// Bytes transferred.
    pub bytes: u64,
    /// Total size, if known.
    pub total: Option<u64>,
    /// Retries spent so far.
    pub retry_count: u32,
    /// Whether an automatic retry is pending.
    pub retry_scheduled: bool,
    /// Cause of the last failure.
    pub failure: Option<FailureReason>,
    /// Time since the latest attempt started.
    pub elapsed: Option<Duration>,
    /// Time since the last chunk (active items only).
    pub idle: Option<Duration>,
    /// Smoothed speed in bytes per second (active items only).
    pub speed_bps: Option<f64>,
    /// 1-based place in the pending sequence (queued items only).
    pub position: Option<usize>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_item_id_parse_and_display() {
        let id: ItemId = "#42".parse().unwrap();
        assert_eq!(id, ItemId::new(42));
        assert_eq!(id.to_string(), "42");
        assert!("abc".parse::<ItemId>().is_err());
    }

    #[test]
    fn test_item_state_round_trip() {
        for state in [
            ItemState::Queued,
            ItemState::Active,
            ItemState::Completed,
            ItemState::Failed,
            ItemState::Cancelled,
        ] {
            assert_eq!(state.as_str().parse::<ItemState>().unwrap(), state);
        }
        assert!("paused".parse::<ItemState>().is_err());
    }

    #[test]
    fn test_failure_reasons_are_distinct() {
        let reasons = [
            FailureReason::from_error(&TransferError::stalled("x", Duration::from_secs(60))),
            FailureReason::from_error(&TransferError::verification("/t", 10, 4)),
            FailureReason::from_error(&TransferError::http_status("x", 404)),
            FailureReason::from_error(&TransferError::DiskFull {
                path: PathBuf::from("/t"),
            }),
        ];
        let messages: Vec<String> = reasons.iter().map(ToString::to_string).collect();
        assert!(messages[0].contains("timed out"));
        assert!(messages[1].contains("verification failed"));
        assert!(messages[2].contains("404"));
        assert_eq!(messages[3], "disk full");
    }

    #[tokio::test]
    async fn test_failed_with_scheduled_retry_is_not_terminal() {
        let mut item = DownloadItem::new(
            ItemId::new(1),
            SourceRef::Opaque("f".to_string()),
            "a.mkv".to_string(),
            Some(10),
            PathBuf::from("/tmp/1_a.mkv.part"),
            ProgressPolicy::default(),
        );
        item.state = ItemState::Failed;
        item.retry_scheduled = true;
        assert!(!item.is_terminal());
        item.retry_scheduled = false;
        assert!(item.is_terminal());
    }
}
