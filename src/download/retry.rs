//! Retry logic with a fixed delay for transient failures.
//!
//! This module provides the [`RetryPolicy`] and [`FailureType`] types for
//! classifying transfer errors and determining retry behavior. The
//! classification stage reuses [`RetryPolicy`] for lookup service errors
//! (see `ClassifierSettings::lookup_retry`).
//!
//! # Overview
//!
//! When a transfer fails, the error is classified into a [`FailureType`]:
//! - [`FailureType::Transient`] - Temporary failures that may succeed on retry
//! - [`FailureType::Fatal`] - Failures that won't succeed regardless of retries
//!
//! The [`RetryPolicy`] then decides whether to retry based on the failure type
//! and how many retries were already spent. Delays are a fixed interval, not
//! exponential.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use media_intake::download::{FailureType, RetryDecision, RetryPolicy};
//!
//! let policy = RetryPolicy::new(3, Duration::from_secs(5));
//!
//! match policy.should_retry(FailureType::Transient, 0) {
//!     RetryDecision::Retry { delay, attempt } => {
//!         assert_eq!(delay, Duration::from_secs(5));
//!         assert_eq!(attempt, 1);
//!     }
//!     RetryDecision::DoNotRetry { reason } => unreachable!("{reason}"),
//! }
//! ```

use std::time::Duration;

use tracing::{debug, instrument};

use super::TransferError;

/// Default maximum number of automatic retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default fixed delay between attempts (5 seconds).
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Classification of transfer failure types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Temporary failure that may succeed on retry.
    ///
    /// Examples: network hiccup, timeout, stalled stream, 5xx responses.
    Transient,

    /// Failure that won't succeed regardless of retries.
    ///
    /// Examples: verification mismatch, disk full, 404, unreadable local file.
    Fatal,
}

/// Decision on whether to retry a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// Which retry this will be (1-indexed).
        attempt: u32,
    },

    /// Do not retry.
    DoNotRetry {
        /// Human-readable reason why retry is not attempted.
        reason: String,
    },
}

/// Retry configuration: a cap on retries and a fixed delay between them.
///
/// An item failing transiently `max_retries` times gets exactly one more
/// attempt; if that also fails it is terminal. It is never retried
/// `max_retries + 1` times.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries after the initial attempt.
    max_retries: u32,

    /// Fixed delay before each retry.
    delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Creates a new retry policy.
    #[must_use]
    pub fn new(max_retries: u32, delay: Duration) -> Self {
        Self { max_retries, delay }
    }

    /// Creates a policy that never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            delay: Duration::ZERO,
        }
    }

    /// Returns the maximum number of retries configured.
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Returns the fixed delay between attempts.
    #[must_use]
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Determines whether to retry a failed attempt.
    ///
    /// # Arguments
    ///
    /// * `failure_type` - Classification of the failure
    /// * `retries_so_far` - How many retries were already performed (0 after the first attempt)
    #[instrument(skip(self), fields(max_retries = self.max_retries))]
    pub fn should_retry(&self, failure_type: FailureType, retries_so_far: u32) -> RetryDecision {
        if failure_type == FailureType::Fatal {
            return RetryDecision::DoNotRetry {
                reason: "fatal failure - retry would not help".to_string(),
            };
        }

        if retries_so_far >= self.max_retries {
            debug!(retries_so_far, max = self.max_retries, "retry budget exhausted");
            return RetryDecision::DoNotRetry {
                reason: format!("max retries ({}) exhausted", self.max_retries),
            };
        }

        debug!(
            next_attempt = retries_so_far + 1,
            delay_ms = self.delay.as_millis(),
            "will retry"
        );

        RetryDecision::Retry {
            delay: self.delay,
            attempt: retries_so_far + 1,
        }
    }
}

/// Classifies a transfer error into a failure type for retry decisions.
///
/// | Error | Type | Rationale |
/// |-------|------|-----------|
/// | Network | Transient | Connection may recover |
/// | Timeout / Stalled | Transient | Source may resume delivering |
/// | HTTP 408, 425, 429, 5xx | Transient | Server-side, temporary |
/// | Other HTTP 4xx | Fatal | Reference is wrong or gone |
/// | Io | Fatal | Local file system issue |
/// | DiskFull | Fatal | Needs operator action |
/// | Verification | Fatal | Source delivered the wrong size |
/// | InvalidSource | Fatal | Won't succeed |
#[must_use]
pub fn classify_error(error: &TransferError) -> FailureType {
    match error {
        TransferError::Network { .. }
        | TransferError::Timeout { .. }
        | TransferError::Stalled { .. } => FailureType::Transient,

        TransferError::HttpStatus { status, .. } => classify_http_status(*status),

        TransferError::Io { .. }
        | TransferError::DiskFull { .. }
        | TransferError::Verification { .. }
        | TransferError::InvalidSource { .. } => FailureType::Fatal,
    }
}

fn classify_http_status(status: u16) -> FailureType {
    match status {
        408 | 425 | 429 | 500..=599 => FailureType::Transient,
        _ => FailureType::Fatal,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn test_retry_policy_default_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries(), 3);
        assert_eq!(policy.delay(), Duration::from_secs(5));
    }

    #[test]
    fn test_retry_policy_fatal_never_retries() {
        let policy = RetryPolicy::default();
        let decision = policy.should_retry(FailureType::Fatal, 0);
        assert!(matches!(decision, RetryDecision::DoNotRetry { .. }));
    }

    #[test]
    fn test_retry_policy_delay_is_fixed() {
        let policy = RetryPolicy::new(5, Duration::from_millis(250));
        for retries in 0..5 {
            match policy.should_retry(FailureType::Transient, retries) {
                RetryDecision::Retry { delay, attempt } => {
                    assert_eq!(delay, Duration::from_millis(250));
                    assert_eq!(attempt, retries + 1);
                }
                RetryDecision::DoNotRetry { reason } => panic!("unexpected stop: {reason}"),
            }
        }
    }

    #[test]
    fn test_retry_policy_stops_exactly_at_cap() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1));
        let mut retries = 0;
        while let RetryDecision::Retry { attempt, .. } =
            policy.should_retry(FailureType::Transient, retries)
        {
            retries = attempt;
        }
        assert_eq!(retries, 3, "must retry exactly max_retries times");
    }

    #[test]
    fn test_retry_policy_no_retry() {
        let policy = RetryPolicy::no_retry();
        match policy.should_retry(FailureType::Transient, 0) {
            RetryDecision::DoNotRetry { reason } => assert!(reason.contains("exhausted")),
            RetryDecision::Retry { .. } => panic!("no_retry policy must not retry"),
        }
    }

    #[test]
    fn test_classify_error_transient_variants() {
        assert_eq!(
            classify_error(&TransferError::timeout("https://x/a")),
            FailureType::Transient
        );
        assert_eq!(
            classify_error(&TransferError::stalled("https://x/a", Duration::from_secs(1))),
            FailureType::Transient
        );
        assert_eq!(
            classify_error(&TransferError::http_status("https://x/a", 503)),
            FailureType::Transient
        );
        assert_eq!(
            classify_error(&TransferError::http_status("https://x/a", 429)),
            FailureType::Transient
        );
    }

    #[test]
    fn test_classify_error_fatal_variants() {
        assert_eq!(
            classify_error(&TransferError::http_status("https://x/a", 404)),
            FailureType::Fatal
        );
        assert_eq!(
            classify_error(&TransferError::verification(PathBuf::from("/t"), 10, 9)),
            FailureType::Fatal
        );
        assert_eq!(
            classify_error(&TransferError::DiskFull {
                path: PathBuf::from("/t")
            }),
            FailureType::Fatal
        );
        assert_eq!(
            classify_error(&TransferError::invalid_source("ftp://nope")),
            FailureType::Fatal
        );
    }
}
