//! Error types for the transfer layer.
//!
//! Every variant carries the source reference or path it concerns so the
//! queue can turn it into a distinct, human-readable failure reason.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while transferring one file.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Network-level error (DNS resolution, connection reset, TLS errors, etc.)
    #[error("network error reading {source_ref}: {source}")]
    Network {
        /// The source being read.
        source_ref: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before the server answered.
    #[error("timeout reading {source_ref}")]
    Timeout {
        /// The source that timed out.
        source_ref: String,
    },

    /// No chunk arrived within the stall timeout.
    #[error("transfer of {source_ref} stalled: no progress for {}s", .idle.as_secs())]
    Stalled {
        /// The source that stopped delivering data.
        source_ref: String,
        /// How long the transfer sat idle.
        idle: Duration,
    },

    /// The source answered with an error status.
    #[error("HTTP {status} reading {source_ref}")]
    HttpStatus {
        /// The source that returned an error status.
        source_ref: String,
        /// The HTTP status code.
        status: u16,
    },

    /// File system error while reading a local source or writing the temp file.
    #[error("IO error on {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The destination volume ran out of space.
    #[error("disk full while writing {path}")]
    DiskFull {
        /// The temp file being written.
        path: PathBuf,
    },

    /// Transferred size does not match the declared size.
    #[error("verification failed for {path}: expected {expected_bytes} bytes, got {actual_bytes}")]
    Verification {
        /// Temp path that failed verification.
        path: PathBuf,
        /// Declared size in bytes.
        expected_bytes: u64,
        /// Bytes actually written.
        actual_bytes: u64,
    },

    /// The source reference cannot be opened by any configured source.
    #[error("invalid source reference: {source_ref}")]
    InvalidSource {
        /// The rejected reference.
        source_ref: String,
    },
}

impl TransferError {
    /// Creates a network error from a reqwest error.
    pub fn network(source_ref: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            source_ref: source_ref.into(),
            source,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(source_ref: impl Into<String>) -> Self {
        Self::Timeout {
            source_ref: source_ref.into(),
        }
    }

    /// Creates a stall error.
    pub fn stalled(source_ref: impl Into<String>, idle: Duration) -> Self {
        Self::Stalled {
            source_ref: source_ref.into(),
            idle,
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(source_ref: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            source_ref: source_ref.into(),
            status,
        }
    }

    /// Creates an IO error, promoting "no space left" to [`TransferError::DiskFull`].
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::StorageFull {
            return Self::DiskFull { path };
        }
        Self::Io { path, source }
    }

    /// Creates a verification mismatch error.
    pub fn verification(path: impl Into<PathBuf>, expected_bytes: u64, actual_bytes: u64) -> Self {
        Self::Verification {
            path: path.into(),
            expected_bytes,
            actual_bytes,
        }
    }

    /// Creates an invalid source error.
    pub fn invalid_source(source_ref: impl Into<String>) -> Self {
        Self::InvalidSource {
            source_ref: source_ref.into(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_error_stalled_display() {
        let error = TransferError::stalled("https://cdn.example/a.mkv", Duration::from_secs(60));
        let msg = error.to_string();
        assert!(msg.contains("stalled"), "Expected 'stalled' in: {msg}");
        assert!(msg.contains("60s"), "Expected idle seconds in: {msg}");
    }

    #[test]
    fn test_transfer_error_io_storage_full_becomes_disk_full() {
        let io_error = std::io::Error::from(std::io::ErrorKind::StorageFull);
        let error = TransferError::io("/tmp/part.mkv", io_error);
        assert!(matches!(error, TransferError::DiskFull { .. }));
        assert!(error.to_string().contains("disk full"));
    }

    #[test]
    fn test_transfer_error_io_other_kind_stays_io() {
        let io_error = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let error = TransferError::io("/tmp/part.mkv", io_error);
        assert!(matches!(error, TransferError::Io { .. }));
        assert!(error.to_string().contains("/tmp/part.mkv"));
    }

    #[test]
    fn test_transfer_error_verification_display() {
        let error = TransferError::verification("/tmp/x.mkv", 100, 42);
        let msg = error.to_string();
        assert!(msg.contains("expected 100 bytes"), "got: {msg}");
        assert!(msg.contains("got 42"), "got: {msg}");
    }
}
