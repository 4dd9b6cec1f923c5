//! Glue between the download queue and the library.
//!
//! Consumes the queue's completion channel: each [`CompletedDownload`] is
//! classified, then either placed or handed to the manual resolution queue.
//! Nothing received here is dropped: every file ends up placed, pending
//! manual resolution, or reported and left in the temp directory.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, instrument, warn};

use crate::classify::{Classification, Classifier};
use crate::manual::{EntryId, ManualResolutionQueue};
use crate::notify::{Notifier, StatusEvent};
use crate::placement::{PlacementError, PlacementExecutor, PlacementTarget};
use crate::queue::CompletedDownload;

/// What happened to one completed download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// Filed into the library.
    Placed(PathBuf),
    /// Waiting for an operator.
    Manual(EntryId),
    /// Destination occupied; file left in the temp directory.
    Conflict(PathBuf),
    /// The move failed; file left in the temp directory.
    PlacementFailed,
}

/// Classification and placement of completed downloads.
pub struct Pipeline {
    classifier: Classifier,
    placement: PlacementExecutor,
    manual: Arc<ManualResolutionQueue>,
    notifier: Arc<dyn Notifier>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("classifier", &self.classifier)
            .field("placement", &self.placement)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Creates a pipeline.
    #[must_use]
    pub fn new(
        classifier: Classifier,
        placement: PlacementExecutor,
        manual: Arc<ManualResolutionQueue>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            classifier,
            placement,
            manual,
            notifier,
        }
    }

    /// The manual resolution queue fed by this pipeline.
    #[must_use]
    pub fn manual(&self) -> &Arc<ManualResolutionQueue> {
        &self.manual
    }

    /// Processes completions until the queue closes the channel.
    pub async fn run(&self, mut completed: mpsc::UnboundedReceiver<CompletedDownload>) {
        while let Some(download) = completed.recv().await {
            self.process(download).await;
        }
        info!("completion channel closed, pipeline stopping");
    }

    /// Classifies one download and places it or queues it for an operator.
    #[instrument(skip_all, fields(id = %download.id, filename = %download.filename))]
    pub async fn process(&self, download: CompletedDownload) -> PipelineOutcome {
        self.notifier.notify(StatusEvent::ClassificationStarted {
            id: download.id,
            filename: download.filename.clone(),
        });

        match self.classifier.classify(&download.filename).await {
            Classification::Confident(candidate) => {
                self.notifier.notify(StatusEvent::Classified {
                    id: download.id,
                    filename: download.filename.clone(),
                    candidate: candidate.clone(),
                });
                let target = PlacementTarget::from_candidate(&candidate);
                self.place(&download, &target).await
            }
            Classification::NeedsManual { candidate, reason } => {
                let filename = download.filename.clone();
                let entry = self.manual.push(download, candidate, reason).await;
                self.notifier.notify(StatusEvent::ManualResolutionRequired {
                    entry: entry.id,
                    filename,
                    reason: entry.reason,
                    candidate: entry.candidate,
                });
                PipelineOutcome::Manual(entry.id)
            }
        }
    }

    async fn place(&self, download: &CompletedDownload, target: &PlacementTarget) -> PipelineOutcome {
        match self
            .placement
            .place(&download.path, &download.filename, target)
            .await
        {
            Ok(destination) => {
                self.notifier.notify(StatusEvent::Placed {
                    id: download.id,
                    filename: download.filename.clone(),
                    category: target.category,
                    destination: destination.clone(),
                });
                PipelineOutcome::Placed(destination)
            }
            Err(PlacementError::Conflict { destination }) => {
                self.notifier.notify(StatusEvent::PlacementConflict {
                    filename: download.filename.clone(),
                    destination: destination.clone(),
                    left_at: download.path.clone(),
                });
                PipelineOutcome::Conflict(destination)
            }
            Err(e) => {
                warn!(error = %e, "placement failed");
                self.notifier.notify(StatusEvent::PlacementFailed {
                    filename: download.filename.clone(),
                    detail: e.to_string(),
                });
                PipelineOutcome::PlacementFailed
            }
        }
    }
}
