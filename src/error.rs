//! Unified error type for compound file operations.

use thiserror::Error;

/// Main error type for compound file operations.
#[derive(Error, Debug)]
pub enum CfbError {
    /// IO error from the backing stream
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The file does not start with the compound file signature
    #[error("not a compound file (bad signature)")]
    BadSignature,

    /// The header declares a major version other than 3 or 4, or the sector
    /// shift does not match the version
    #[error("unsupported compound file version: {0}")]
    UnsupportedVersion(u16),

    /// Structural damage detected while following chains or parsing records
    #[error("corrupted file: {0}")]
    CorruptedFile(String),

    /// Named stream or storage absent from its parent
    #[error("item not found: {0}")]
    NotFound(String),

    /// An item with the same name already exists in the parent
    #[error("item already exists: {0}")]
    DuplicatedItem(String),

    /// Operation not valid in the current state (e.g. commit in read-only mode)
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),

    /// Caller-supplied argument rejected (bad name, out-of-range offset, ...)
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The owning compound file has been closed
    #[error("compound file is closed")]
    Disposed,
}

/// Result type for compound file operations.
pub type Result<T> = std::result::Result<T, CfbError>;

impl From<CfbError> for std::io::Error {
    fn from(err: CfbError) -> Self {
        match err {
            CfbError::Io(e) => e,
            other => std::io::Error::other(other),
        }
    }
}
