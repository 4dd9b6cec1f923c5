//! Manual resolution queue.
//!
//! Holds completed downloads the classifier could not place confidently,
//! in insertion order, until an operator resolves or skips them. Entries do
//! not expire and live in memory only: a restart loses them, while the files
//! themselves stay in the temp directory.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::classify::{ClassificationCandidate, ManualReason, MediaCategory};
use crate::placement::{PlacementError, PlacementExecutor, PlacementTarget};
use crate::queue::CompletedDownload;

/// Manual entry identifier, assigned in insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(u64);

impl EntryId {
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

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EntryId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .trim_start_matches('#')
            .parse::<u64>()
            .map(Self)
            .map_err(|_| format!("invalid entry id: {s}"))
    }
}

/// A completed download awaiting an operator decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManualResolutionEntry {
    /// Entry id.
    pub id: EntryId,
    /// The downloaded file, still in the temp directory.
    pub download: CompletedDownload,
    /// Best effort classification.
    pub candidate: ClassificationCandidate,
    /// Why it needs an operator.
    pub reason: ManualReason,
    /// When the entry was created.
    pub created_at: SystemTime,
}

/// Operator-supplied metadata replacing the parsed values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataOverride {
    /// Title to file under.
    pub title: Option<String>,
    /// Release year.
    pub year: Option<u16>,
    /// Season number (TV).
    pub season: Option<u32>,
}

/// Errors from resolving or skipping an entry.
#[derive(Debug, Error)]
pub enum ManualError {
    /// No pending entry with this id.
    #[error("no pending manual entry {0}")]
    UnknownEntry(EntryId),

    /// The decision cannot be applied.
    #[error("invalid resolution for entry {id}: {message}")]
    InvalidOverride {
        /// The entry.
        id: EntryId,
        /// What is wrong.
        message: String,
    },

    /// Moving the file failed; the entry stays pending.
    #[error("placement failed for entry {id}: {source}")]
    Placement {
        /// The entry.
        id: EntryId,
        /// The placement error.
        #[source]
        source: PlacementError,
    },
}

/// Successful resolve or skip.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedEntry {
    /// The entry, now removed from the queue.
    pub entry: ManualResolutionEntry,
    /// Where the file went.
    pub destination: PathBuf,
    /// Category it was filed under.
    pub category: MediaCategory,
}

#[derive(Debug, Default)]
struct ManualState {
    entries: Vec<ManualResolutionEntry>,
    next_id: u64,
}

impl ManualState {
    fn take(&mut self, id: EntryId) -> Option<ManualResolutionEntry> {
        let index = self.entries.iter().position(|e| e.id == id)?;
        Some(self.entries.remove(index))
    }

    /// Puts an entry back at its insertion-order position.
    fn restore(&mut self, entry: ManualResolutionEntry) {
        let index = self.entries.partition_point(|e| e.id < entry.id);
        self.entries.insert(index, entry);
    }
}

/// Insertion-ordered queue of files awaiting manual resolution.
#[derive(Debug)]
pub struct ManualResolutionQueue {
    state: Mutex<ManualState>,
    placement: PlacementExecutor,
}

impl ManualResolutionQueue {
    /// Creates an empty queue placing resolved files through `placement`.
    #[must_use]
    pub fn new(placement: PlacementExecutor) -> Self {
        Self {
            state: Mutex::new(ManualState {
                entries: Vec::new(),
                next_id: 1,
            }),
            placement,
        }
    }

    /// Adds an entry at the tail.
    #[instrument(skip_all, fields(item = %download.id, %reason))]
    pub async fn push(
        &self,
        download: CompletedDownload,
        candidate: ClassificationCandidate,
        reason: ManualReason,
    ) -> ManualResolutionEntry {
        let mut state = self.state.lock().await;
        let id = EntryId(state.next_id);
        state.next_id += 1;
        let entry = ManualResolutionEntry {
            id,
            download,
            candidate,
            reason,
            created_at: SystemTime::now(),
        };
        state.entries.push(entry.clone());
        info!(entry = %id, pending = state.entries.len(), "awaiting manual resolution");
        entry
    }

    /// Pending entries in insertion order.
    pub async fn list(&self) -> Vec<ManualResolutionEntry> {
        self.state.lock().await.entries.clone()
    }

    /// One pending entry.
    pub async fn get(&self, id: EntryId) -> Option<ManualResolutionEntry> {
        self.state
            .lock()
            .await
            .entries
            .iter()
            .find(|e| e.id == id)
            .cloned()
    }

    /// Number of pending entries.
    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    /// True when nothing is pending.
    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.entries.is_empty()
    }

    /// Places an entry's file under the operator's category, without another
    /// lookup. Missing override fields fall back to the parsed values.
    ///
    /// # Errors
    ///
    /// - [`ManualError::UnknownEntry`] if no such entry is pending
    /// - [`ManualError::InvalidOverride`] for the unmatched category or an empty title
    /// - [`ManualError::Placement`] if the move fails; the entry stays pending
    #[instrument(skip(self, metadata), fields(entry = %id, %category))]
    pub async fn resolve(
        &self,
        id: EntryId,
        category: MediaCategory,
        metadata: MetadataOverride,
    ) -> Result<ResolvedEntry, ManualError> {
        if category == MediaCategory::Unmatched {
            return Err(ManualError::InvalidOverride {
                id,
                message: "choose movie or tv; use skip for unmatched".to_string(),
            });
        }

        let entry = self
            .state
            .lock()
            .await
            .take(id)
            .ok_or(ManualError::UnknownEntry(id))?;

        let title = metadata
            .title
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| entry.candidate.title.clone());
        if title.is_empty() {
            self.state.lock().await.restore(entry);
            return Err(ManualError::InvalidOverride {
                id,
                message: "a title is required".to_string(),
            });
        }

        let target = PlacementTarget {
            category,
            title,
            year: metadata.year.or(entry.candidate.year),
            season: match category {
                MediaCategory::TvShow => metadata.season.or(entry.candidate.season),
                _ => None,
            },
        };
        debug!(?target, "resolving manual entry");

        self.finish(entry, &target).await
    }

    /// Moves an entry's file to the unmatched root and drops the entry.
    ///
    /// # Errors
    ///
    /// [`ManualError::UnknownEntry`] or [`ManualError::Placement`]; on a
    /// placement error the entry stays pending.
    #[instrument(skip(self), fields(entry = %id))]
    pub async fn skip(&self, id: EntryId) -> Result<ResolvedEntry, ManualError> {
        let entry = self
            .state
            .lock()
            .await
            .take(id)
            .ok_or(ManualError::UnknownEntry(id))?;
        self.finish(entry, &PlacementTarget::unmatched()).await
    }

    async fn finish(
        &self,
        entry: ManualResolutionEntry,
        target: &PlacementTarget,
    ) -> Result<ResolvedEntry, ManualError> {
        let id = entry.id;
        match self
            .placement
            .place(&entry.download.path, &entry.download.filename, target)
            .await
        {
            Ok(destination) => {
                info!(entry = %id, destination = %destination.display(), "manual entry closed");
                Ok(ResolvedEntry {
                    entry,
                    destination,
                    category: target.category,
                })
            }
            Err(source) => {
                self.state.lock().await.restore(entry);
                Err(ManualError::Placement { id, source })
            }
        }
    }
}
