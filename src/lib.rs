//! Media Intake Core Library
//!
//! Downloads media files under bounded concurrency, then classifies them as
//! movies or TV episodes through a metadata lookup and files them into a
//! library tree. Files that cannot be classified confidently wait in a
//! manual resolution queue for an operator decision.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`download`] - Transfer sources, the chunked worker, speed limiting, retry policy
//! - [`queue`] - FIFO download queue with bounded dispatch and cancellation
//! - [`classify`] - Filename parsing, metadata lookup and match scoring
//! - [`placement`] - Moves classified files into the library
//! - [`manual`] - Files awaiting an operator decision
//! - [`pipeline`] - Queue completions to classification and placement
//! - [`notify`] - Status events and notifiers
//! - [`command`] - Operator commands
//! - [`config`] - JSON configuration

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod classify;
pub mod command;
pub mod config;
pub mod download;
pub mod manual;
pub mod notify;
pub mod pipeline;
pub mod placement;
pub mod queue;

// Re-export commonly used types
pub use classify::{Classification, ClassificationCandidate, Classifier, MediaCategory, TmdbLookup};
pub use command::{Command, CommandHandler};
pub use config::{ConfigError, PipelineConfig, SettingsSummary};
pub use download::{SourceRef, SourceRouter, SpeedLimiter, TransferError, TransferWorker};
pub use manual::{ManualError, ManualResolutionQueue};
pub use notify::{Notifier, StatusEvent};
pub use pipeline::Pipeline;
pub use placement::{ConflictPolicy, PlacementError, PlacementExecutor};
pub use queue::{DownloadQueue, ItemId, ItemState, QueueError};
