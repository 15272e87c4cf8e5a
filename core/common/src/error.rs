//! Common error types for fitsync.

use std::time::Duration;
use thiserror::Error;

use crate::types::AccountStatus;

/// Top-level error type for fitsync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The network could not be reached.
    #[error("Network error: {0}")]
    Network(String),

    /// The remote account cannot be used right now.
    #[error("Account unavailable: {0}")]
    AccountUnavailable(AccountStatus),

    /// The remote service rejected the request because of quota or rate limits.
    #[error("Throttled: {message}")]
    Throttled {
        message: String,
        /// Delay suggested by the service before the next attempt.
        retry_after: Option<Duration>,
    },

    /// A remote request did not finish in time.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The remote service is temporarily down or busy.
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// The remote service refused the operation.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The record was rejected as malformed or schema-incompatible.
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Durable local state could not be read or written.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The OS refused to register or submit a background job.
    #[error("Scheduling error: {0}")]
    Scheduling(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Work was abandoned because its execution window ended.
    #[error("Cancelled: {0}")]
    Cancelled(String),
}

/// Coarse classification used to decide how a failure is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No network or no usable account; retried on the next trigger.
    Connectivity,
    /// Quota, throttling or timeouts; retried within the current pass.
    RemoteTransient,
    /// Permission or malformed record; never retried.
    RemoteTerminal,
    /// The OS background facility refused a request.
    Scheduling,
    /// Local durable storage failed.
    Persistence,
    /// Programming errors, invalid input, cancellation.
    Internal,
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Network(_) | Error::AccountUnavailable(_) => ErrorKind::Connectivity,
            Error::Throttled { .. } | Error::Timeout(_) | Error::ServiceUnavailable(_) => {
                ErrorKind::RemoteTransient
            }
            Error::PermissionDenied(_) | Error::InvalidRecord(_) | Error::NotFound(_) => {
                ErrorKind::RemoteTerminal
            }
            Error::Scheduling(_) => ErrorKind::Scheduling,
            Error::Persistence(_) | Error::Io(_) | Error::Serialization(_) => {
                ErrorKind::Persistence
            }
            Error::InvalidInput(_) | Error::Cancelled(_) => ErrorKind::Internal,
        }
    }

    /// Whether a later attempt of the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Connectivity | ErrorKind::RemoteTransient
        )
    }

    /// Delay requested by the remote service, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::Throttled { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Shorthand for a throttling error.
    pub fn throttled(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Error::Throttled {
            message: message.into(),
            retry_after,
        }
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
