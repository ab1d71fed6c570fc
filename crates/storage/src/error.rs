//! Storage error types.

use bcv_core::RetryPolicy;
use std::time::Duration;
use thiserror::Error;

/// Storage operation errors.
///
/// Conditional-request outcomes get their own variants so callers can match
/// on them; any other HTTP failure is carried verbatim in [`StorageError::Http`].
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("object not modified: {0}")]
    NotModified(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("access denied: {0}")]
    Forbidden(String),

    #[error("HTTP {status}: {message}")]
    Http {
        status: u16,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("S3 error: {0}")]
    S3(#[from] Box<dyn std::error::Error + Send + Sync>),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid continuation token: {0}")]
    InvalidContinuationToken(String),
}

impl StorageError {
    /// Build the error matching an HTTP status.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            304 => Self::NotModified(message),
            403 => Self::Forbidden(message),
            404 => Self::NotFound(message),
            409 => Self::AlreadyExists(message),
            412 => Self::PreconditionFailed(message),
            _ => Self::Http {
                status,
                message,
                retry_after: None,
            },
        }
    }

    /// HTTP status this error stands for, if any.
    ///
    /// Transport and local failures have no status.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::NotModified(_) => Some(304),
            Self::Forbidden(_) => Some(403),
            Self::NotFound(_) => Some(404),
            Self::AlreadyExists(_) => Some(409),
            Self::PreconditionFailed(_) => Some(412),
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// True if repeating the request may succeed.
    ///
    /// S3 SDK failures without an HTTP response are transport errors
    /// (connect, timeout, truncated body) and are transient. Every other
    /// status-less error is local and is not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::S3(_) => true,
            _ => RetryPolicy::is_retryable(self.status()),
        }
    }

    /// `Retry-After` hint sent by the server, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Http { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [304, 403, 404, 409, 412, 500, 503] {
            assert_eq!(StorageError::from_status(status, "x").status(), Some(status));
        }
        assert!(matches!(
            StorageError::from_status(412, "stale"),
            StorageError::PreconditionFailed(_)
        ));
    }

    #[test]
    fn test_local_errors_have_no_status() {
        let err = StorageError::Io(std::io::Error::other("disk"));
        assert_eq!(err.status(), None);
        assert_eq!(StorageError::Config("bad".into()).status(), None);
    }

    #[test]
    fn test_only_server_and_transport_failures_are_transient() {
        assert!(StorageError::from_status(503, "busy").is_transient());
        assert!(StorageError::from_status(429, "slow down").is_transient());
        assert!(StorageError::S3(Box::new(std::io::Error::other("reset"))).is_transient());
        assert!(!StorageError::from_status(404, "gone").is_transient());
        assert!(!StorageError::InvalidKey("../bad".into()).is_transient());
        assert!(!StorageError::InvalidContinuationToken("x".into()).is_transient());
        assert!(!StorageError::Io(std::io::Error::other("disk")).is_transient());
    }
}
