//! Transfer worker: streams one file to its temp path in fixed-size chunks.
//!
//! The worker is the only code that touches an item's bytes. It suspends
//! while waiting for the next chunk and while waiting for speed-limiter
//! grants, and checks the cancellation flag at every chunk boundary, so
//! cancellation latency is bounded by one chunk.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, instrument, warn};

use super::progress::TransferProgress;
use super::rate_limiter::SpeedLimiter;
use super::source::{ChunkStream, SourceRef, TransferSource};
use super::TransferError;

/// Default chunk size (1 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Default stall timeout (60 seconds without a chunk).
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Tunables for every transfer run by one queue.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSettings {
    /// Maximum bytes pulled from the source per chunk.
    pub chunk_size: usize,
    /// A chunk read that takes longer than this fails as stalled.
    pub stall_timeout: Duration,
    /// Compare written bytes with the known size on completion.
    pub verify_downloads: bool,
    /// Reopen partial temp files at their current length on retry.
    pub resume_support: bool,
    /// Per-file ceiling in Mbps (`0` = unlimited).
    pub per_file_speed_mbps: f64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
            verify_downloads: true,
            resume_support: true,
            per_file_speed_mbps: 0.0,
        }
    }
}

/// One transfer request.
#[derive(Debug, Clone)]
pub struct TransferJob {
    /// Where the bytes come from.
    pub source: SourceRef,
    /// Where they are written.
    pub temp_path: PathBuf,
    /// Size declared at admission, if any.
    pub declared_size: Option<u64>,
}

/// How a transfer ended when it did not fail.
///
/// Cancellation is an outcome, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// All bytes written (and verified when enabled).
    Completed {
        /// Final size of the temp file.
        bytes: u64,
    },
    /// The cancellation flag was observed; the partial temp file is gone.
    Cancelled {
        /// Bytes written when cancellation was observed.
        bytes: u64,
    },
}

/// Runs transfers against a source under the shared speed limiter.
pub struct TransferWorker {
    source: Arc<dyn TransferSource>,
    limiter: Arc<SpeedLimiter>,
    settings: WorkerSettings,
}

impl std::fmt::Debug for TransferWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferWorker")
            .field("source", &self.source.name())
            .field("limiter", &self.limiter)
            .field("settings", &self.settings)
            .finish()
    }
}

impl TransferWorker {
    /// Creates a worker reading from `source`, debiting `limiter` for every chunk.
    #[must_use]
    pub fn new(
        source: Arc<dyn TransferSource>,
        limiter: Arc<SpeedLimiter>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            source,
            limiter,
            settings,
        }
    }

    /// Returns the worker settings.
    #[must_use]
    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    /// Streams `job` to its temp path, updating `progress` after every chunk.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError`] for network, stall, I/O and verification
    /// failures. The partial temp file is left in place so a retry can resume;
    /// the caller removes it once the item is terminal.
    #[instrument(skip(self, progress), fields(source = %job.source, temp = %job.temp_path.display()))]
    pub async fn run(
        &self,
        job: &TransferJob,
        progress: &TransferProgress,
    ) -> Result<TransferOutcome, TransferError> {
        if progress.is_cancelled() {
            return Ok(self.cancelled(job, progress).await);
        }

        if let Some(parent) = job.temp_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TransferError::io(parent, e))?;
        }

        let resume_from = if self.settings.resume_support {
            existing_len(&job.temp_path).await
        } else {
            0
        };

        let mut stream = self.open(job, resume_from).await?;
        let start = stream.start_offset();
        if resume_from > 0 {
            if start == resume_from {
                info!(offset = start, "resuming partial transfer");
            } else {
                debug!(requested = resume_from, "source refused resume, restarting");
            }
        }

        if let Some(total) = job.declared_size.or_else(|| stream.total_len()) {
            progress.learn_total(total);
        }
        progress.reset_bytes(start);

        let mut file = open_temp(&job.temp_path, start).await?;
        let per_file = SpeedLimiter::from_mbps(self.settings.per_file_speed_mbps);
        let mut written = start;

        loop {
            if progress.is_cancelled() {
                drop(file);
                return Ok(self.cancelled(job, progress).await);
            }

            let Some(chunk) = self.next_chunk(job, stream.as_mut()).await? else {
                break;
            };
            let len = chunk.len() as u64;

            self.limiter.acquire(len).await;
            per_file.acquire(len).await;

            file.write_all(&chunk)
                .await
                .map_err(|e| TransferError::io(&job.temp_path, e))?;
            written += len;
            progress.record(written);
        }

        file.flush()
            .await
            .map_err(|e| TransferError::io(&job.temp_path, e))?;
        drop(file);

        if self.settings.verify_downloads
            && let Some(expected) = progress.total()
            && expected != written
        {
            warn!(expected, written, "size verification failed");
            return Err(TransferError::verification(&job.temp_path, expected, written));
        }

        debug!(bytes = written, "transfer complete");
        Ok(TransferOutcome::Completed { bytes: written })
    }

    async fn open(
        &self,
        job: &TransferJob,
        offset: u64,
    ) -> Result<Box<dyn ChunkStream>, TransferError> {
        match tokio::time::timeout(self.settings.stall_timeout, self.source.open(&job.source, offset)).await {
            Ok(result) => result,
            Err(_) => Err(TransferError::stalled(
                job.source.to_string(),
                self.settings.stall_timeout,
            )),
        }
    }

    async fn next_chunk(
        &self,
        job: &TransferJob,
        stream: &mut dyn ChunkStream,
    ) -> Result<Option<bytes::Bytes>, TransferError> {
        let chunk_size = self.settings.chunk_size.max(1);
        match tokio::time::timeout(self.settings.stall_timeout, stream.next_chunk(chunk_size)).await {
            Ok(result) => result,
            Err(_) => Err(TransferError::stalled(
                job.source.to_string(),
                self.settings.stall_timeout,
            )),
        }
    }

    async fn cancelled(&self, job: &TransferJob, progress: &TransferProgress) -> TransferOutcome {
        remove_partial(&job.temp_path).await;
        let bytes = progress.bytes();
        info!(bytes, "transfer cancelled");
        TransferOutcome::Cancelled { bytes }
    }
}

/// Deletes a partial temp file, ignoring a file that is already gone.
pub async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "removed partial file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove partial file"),
    }
}

async fn existing_len(path: &Path) -> u64 {
    tokio::fs::metadata(path).await.map_or(0, |m| m.len())
}

async fn open_temp(path: &Path, start: u64) -> Result<File, TransferError> {
    if start == 0 {
        return File::create(path)
            .await
            .map_err(|e| TransferError::io(path, e));
    }
    let mut file = OpenOptions::new()
        .write(true)
        .open(path)
        .await
        .map_err(|e| TransferError::io(path, e))?;
    file.set_len(start)
        .await
        .map_err(|e| TransferError::io(path, e))?;
    file.seek(std::io::SeekFrom::Start(start))
        .await
        .map_err(|e| TransferError::io(path, e))?;
    Ok(file)
}
