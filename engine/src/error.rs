//! Error types for the upload engine.
//!
//! There are two layers of errors:
//! - `EngineError` is returned directly to the caller when a request is
//!   rejected (busy controller, bad submission). It never lands on a session.
//! - `SessionError` is recorded on the session as `last_error` when a stage
//!   of an accepted submission fails. It wraps `TransferError` (local I/O)
//!   or `SegmentationError` (remote service).
//!
//! Session errors are `Clone` so that snapshots of a session can be handed
//! out freely; I/O sources are kept behind `Arc` for that reason.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::model::SessionState;

/// Errors returned to the caller when a controller request is rejected.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// A session is already in flight (or finished and not yet reset)
    #[error("A session is already active (state: {state})")]
    SessionBusy { state: SessionState },

    /// The submission is malformed (empty filename, bad size, ...)
    #[error("Invalid submission: {reason}")]
    InvalidSubmission { reason: String },

    /// The file extension is not in the configured allow-list
    #[error("Unsupported file type '{extension}' (accepted: {accepted})")]
    UnsupportedFileType { extension: String, accepted: String },

    /// Declared size does not match the bytes supplied
    #[error("Declared size {declared} does not match payload length {actual}")]
    SizeMismatch { declared: u64, actual: u64 },

    /// The requested state change is not an edge of the lifecycle
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: SessionState, to: SessionState },
}

/// Failures while streaming a file to local storage.
#[derive(Debug, Clone, Error)]
pub enum TransferError {
    /// Failed to create the destination's parent directory
    #[error("Failed to create directory: {}", path.display())]
    DirectoryCreationFailed {
        path: PathBuf,
        #[source]
        source: Arc<io::Error>,
    },

    /// Failed to read from the source stream
    #[error("Failed to read upload source")]
    ReadError {
        #[source]
        source: Arc<io::Error>,
    },

    /// Failed to write, flush or rename the destination file
    #[error("Failed to write file: {}", path.display())]
    WriteError {
        path: PathBuf,
        #[source]
        source: Arc<io::Error>,
    },

    /// The source produced a different number of bytes than declared
    #[error("Expected {expected} bytes but the source produced {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    /// The transfer was aborted between chunks
    #[error("Transfer cancelled")]
    Cancelled,
}

impl TransferError {
    pub(crate) fn read(source: io::Error) -> Self {
        TransferError::ReadError {
            source: Arc::new(source),
        }
    }

    pub(crate) fn write(path: impl Into<PathBuf>, source: io::Error) -> Self {
        TransferError::WriteError {
            path: path.into(),
            source: Arc::new(source),
        }
    }

    /// Extract the OS error code from this error, if available.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::DirectoryCreationFailed { source, .. }
            | Self::ReadError { source }
            | Self::WriteError { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

/// Failures reported by the segmentation service client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SegmentationError {
    /// Connection refused or endpoint unreachable
    #[error("Segmentation service unreachable at {endpoint}")]
    Unreachable { endpoint: String },

    /// The service answered with a non-success status
    #[error("Segmentation service returned {status_code}: {body}")]
    ServiceError { status_code: u16, body: String },

    /// The request exceeded the configured timeout and was aborted
    #[error("Segmentation request timed out after {}s", after.as_secs())]
    TimedOut { after: Duration },

    /// Anything else (malformed response, request build failure, ...)
    #[error("Unexpected segmentation failure: {message}")]
    Unexpected { message: String },
}

/// The failure recorded on a session that reached `Complete` without a result.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Segmentation(#[from] SegmentationError),

    #[error("Session cancelled")]
    Cancelled,
}

/// Flat classification of a `SessionError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transfer,
    Unreachable,
    ServiceError,
    TimedOut,
    Unexpected,
    Cancelled,
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transfer(TransferError::Cancelled) | Self::Cancelled => ErrorKind::Cancelled,
            Self::Transfer(_) => ErrorKind::Transfer,
            Self::Segmentation(SegmentationError::Unreachable { .. }) => ErrorKind::Unreachable,
            Self::Segmentation(SegmentationError::ServiceError { .. }) => ErrorKind::ServiceError,
            Self::Segmentation(SegmentationError::TimedOut { .. }) => ErrorKind::TimedOut,
            Self::Segmentation(SegmentationError::Unexpected { .. }) => ErrorKind::Unexpected,
        }
    }

    /// Whether resubmitting the same file could plausibly succeed.
    ///
    /// Nothing is retried automatically; this only informs the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Transfer | ErrorKind::Unreachable | ErrorKind::TimedOut | ErrorKind::Cancelled
        )
    }
}

/// A notification could not be delivered. Logged, never surfaced.
#[derive(Debug, Clone, Error)]
#[error("Notification failed: {0}")]
pub struct NotifyError(pub String);

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse config file {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
