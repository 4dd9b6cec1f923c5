//! Error types for queue operations.

use thiserror::Error;

use super::{ItemId, ItemState};

/// Minimum allowed concurrency value.
pub const MIN_CONCURRENCY: usize = 1;

/// Maximum allowed concurrency value.
pub const MAX_CONCURRENCY: usize = 100;

/// Errors that can occur during queue operations.
///
/// Cancelling an unknown or terminal item is not an error; see
/// [`super::CancelOutcome`].
#[derive(Debug, Error)]
pub enum QueueError {
    /// Item with the given id was never admitted.
    #[error("queue item not found: {0}")]
    ItemNotFound(ItemId),

    /// Operator retry on an item that is not terminally failed.
    #[error("item {id} cannot be retried while {state}")]
    NotRetryable {
        /// The item.
        id: ItemId,
        /// Its current state.
        state: ItemState,
    },

    /// Invalid concurrency value provided.
    #[error(
        "invalid concurrency value {value}: must be between {MIN_CONCURRENCY} and {MAX_CONCURRENCY}"
    )]
    InvalidConcurrency {
        /// The invalid value that was provided.
        value: usize,
    },

    /// The queue was shut down and accepts no more work.
    #[error("download queue is shut down")]
    ShutDown,
}
