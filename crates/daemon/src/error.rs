//! Engine error types.
//!
//! Every error maps to the integer code carried on the wire: HTTP statuses
//! from the storage module pass through unchanged, everything else becomes a
//! small internal code.

use bcv_core::retry::HTTP_PRECONDITION_FAILED;
use bcv_metadata::MetadataError;
use bcv_storage::StorageError;
use thiserror::Error;

/// Generic failure.
pub const CODE_ERROR: u32 = 1;
/// Container busy.
pub const CODE_BUSY: u32 = 5;
/// Write attempted on a read-only container.
pub const CODE_READONLY: u32 = 8;
/// Local I/O failure or transport failure without an HTTP status.
pub const CODE_IOERR: u32 = 10;
/// Corrupt manifest or malformed message.
pub const CODE_CORRUPT: u32 = 11;
/// No cache slot available.
pub const CODE_FULL: u32 = 13;
/// API misuse.
pub const CODE_MISUSE: u32 = 21;

/// Engine error type.
#[derive(Debug, Error)]
pub enum BcvError {
    #[error("{0}")]
    Core(#[from] bcv_core::Error),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no such container: {0}")]
    NoSuchContainer(String),

    #[error("container alias already in use: {0}")]
    AliasInUse(String),

    #[error("container busy: {0}")]
    Busy(String),

    #[error("cache is full: every slot is pinned or dirty")]
    CacheFull,

    #[error("container {0} is read-only")]
    ReadOnly(String),

    #[error("misuse: {0}")]
    Misuse(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    /// Failure reported by the other end of a client connection.
    #[error("{message} (code {code})")]
    Remote { code: u32, message: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl BcvError {
    /// Integer error code carried on the wire.
    pub fn code(&self) -> u32 {
        match self {
            Self::Core(bcv_core::Error::Corrupt(_)) => CODE_CORRUPT,
            Self::Core(bcv_core::Error::Config(_) | bcv_core::Error::InvalidNameBytes(_)) => {
                CODE_MISUSE
            }
            Self::Core(_) => CODE_ERROR,
            Self::Storage(e) => e.status().map(u32::from).unwrap_or(CODE_IOERR),
            Self::Metadata(_) | Self::Io(_) => CODE_IOERR,
            Self::NoSuchContainer(_) | Self::AliasInUse(_) | Self::Internal(_) => CODE_ERROR,
            Self::Busy(_) => CODE_BUSY,
            Self::CacheFull => CODE_FULL,
            Self::ReadOnly(_) => CODE_READONLY,
            Self::Misuse(_) => CODE_MISUSE,
            Self::Protocol(_) => CODE_CORRUPT,
            Self::Remote { code, .. } => *code,
        }
    }

    /// True for an optimistic-concurrency conflict: the manifest was
    /// published by someone else since it was last read.
    pub fn is_conflict(&self) -> bool {
        self.code() == u32::from(HTTP_PRECONDITION_FAILED)
    }

    /// Rebuild an error from a wire code and message.
    pub fn from_wire(code: u32, message: Option<String>) -> Self {
        Self::Remote {
            code,
            message: message.unwrap_or_else(|| format!("error code {code}")),
        }
    }
}

/// Cloneable summary of an error, for fanning one failure out to every
/// waiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: u32,
    pub message: String,
}

impl From<&BcvError> for ErrorInfo {
    fn from(err: &BcvError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl From<ErrorInfo> for BcvError {
    fn from(info: ErrorInfo) -> Self {
        Self::Remote {
            code: info.code,
            message: info.message,
        }
    }
}

/// Result type for engine operations.
pub type BcvResult<T> = std::result::Result<T, BcvError>;
