//! Transfer layer: sources, the chunked worker, speed limiting and retry policy.
//!
//! This module provides everything needed to move one file's bytes from a
//! source reference to a temp path. The queue in [`crate::queue`] decides
//! *when* a transfer runs; this module decides *how*.
//!
//! # Features
//!
//! - Chunked streaming with cooperative cancellation at chunk boundaries
//! - Stall detection (no chunk within a timeout is a transient failure)
//! - Resume of partial temp files via HTTP `Range` or file seek
//! - Aggregate and per-file token-bucket speed limits
//! - Size verification on completion
//!
//! # Example
//!
//! ```no_run
//! use std::path::PathBuf;
//! use std::sync::Arc;
//! use media_intake::download::{
//!     SourceRef, SourceRouter, SpeedLimiter, TransferJob, TransferProgress, TransferWorker,
//!     WorkerSettings,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let worker = TransferWorker::new(
//!     Arc::new(SourceRouter::with_defaults()?),
//!     Arc::new(SpeedLimiter::disabled()),
//!     WorkerSettings::default(),
//! );
//! let job = TransferJob {
//!     source: SourceRef::parse("https://example.com/Movie.2010.mkv"),
//!     temp_path: PathBuf::from("/tmp/intake/1_Movie.2010.mkv.part"),
//!     declared_size: None,
//! };
//! let outcome = worker.run(&job, &TransferProgress::new(None)).await?;
//! println!("{outcome:?}");
//! # Ok(())
//! # }
//! ```

mod error;
pub(crate) mod filename;
mod progress;
pub mod rate_limiter;
mod retry;
mod source;
mod worker;

pub use error::TransferError;
pub use progress::{
    DEFAULT_LARGE_FILE_THRESHOLD, DEFAULT_LARGE_FILE_UPDATE_INTERVAL,
    DEFAULT_SMALL_FILE_CHECKPOINT_PERCENT, ProgressPolicy, ProgressReport, ProgressTracker,
    ReportKind, TransferProgress,
};
pub use rate_limiter::{SpeedLimiter, UpdateThrottle};
pub use retry::{
    DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY, FailureType, RetryDecision, RetryPolicy,
    classify_error,
};
pub use source::{
    CONNECT_TIMEOUT, ChunkStream, FileSource, HttpSource, SourceRef, SourceRouter, TransferSource,
};
pub use worker::{
    DEFAULT_CHUNK_SIZE, DEFAULT_STALL_TIMEOUT, TransferJob, TransferOutcome, TransferWorker,
    WorkerSettings, remove_partial,
};

// Note: we do NOT define module-local Result aliases.
// Use `Result<T, TransferError>` explicitly in function signatures.
