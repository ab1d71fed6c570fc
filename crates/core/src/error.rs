//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("corrupt manifest: {0}")]
    Corrupt(String),

    #[error("invalid block id: {0}")]
    InvalidBlockId(String),

    #[error("invalid database id: {0}")]
    InvalidDbId(String),

    #[error("invalid name-byte width: {0} (must be between {min} and {max})", min = crate::MIN_NAME_BYTES, max = crate::MAX_NAME_BYTES)]
    InvalidNameBytes(usize),

    #[error("invalid database name: {0}")]
    InvalidDbName(String),

    #[error("no such database: {0}")]
    NoSuchDatabase(String),

    #[error("database already exists: {0}")]
    DatabaseExists(String),

    #[error("block {index} out of range for database {name} ({count} blocks)")]
    BlockOutOfRange {
        name: String,
        index: u32,
        count: u32,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Shorthand for a [`Error::Corrupt`] with a formatted message.
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
