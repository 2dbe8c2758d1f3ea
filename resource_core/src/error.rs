//! Error types for resource_core.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using resource_core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while reading, editing or persisting resources.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error occurred during file operations.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Malformed identifier, platform or option value.
    #[error("Invalid argument: {reason}")]
    InvalidArgument { reason: String },

    /// An operation needs a source directory and none was configured.
    #[error("No source path configured")]
    MissingSource,

    /// No resource id given and none could be looked up.
    #[error("No resource id given or resolvable")]
    MissingId,

    /// Persisted record could not be parsed.
    #[error("Parse error at {location}: {reason}")]
    Parse { location: String, reason: String },

    /// Blob bytes do not hash to the checksum they were stored under.
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// A single blob operation failed; the rest of the batch continues.
    #[error("Blob write failed for key {key}: {reason}")]
    BlobWriteFailure { key: String, reason: String },

    /// Stored blob object is corrupted or invalid.
    #[error("Corrupted blob at {path}: {reason}")]
    CorruptedBlob { path: PathBuf, reason: String },

    /// Appended tick is lower than the last tick in the log.
    #[error("Tick {tick} is lower than last appended tick {last}")]
    TickOrder { tick: u64, last: u64 },

    /// Invalid hash format or encoding.
    #[error("Invalid hash: {reason}")]
    InvalidHash { reason: String },

    /// Configuration file could not be loaded.
    #[error("Invalid config {path}: {reason}")]
    Config { path: PathBuf, reason: String },
}

impl Error {
    /// Create an InvalidArgument error.
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Error::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Create a Parse error.
    pub fn parse(location: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Parse {
            location: location.into(),
            reason: reason.into(),
        }
    }

    /// Create a ChecksumMismatch error.
    pub fn checksum_mismatch(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Error::ChecksumMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create a BlobWriteFailure error.
    pub fn blob_write_failure(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::BlobWriteFailure {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create a CorruptedBlob error.
    pub fn corrupted_blob(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::CorruptedBlob {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an InvalidHash error.
    pub fn invalid_hash(reason: impl Into<String>) -> Self {
        Error::InvalidHash {
            reason: reason.into(),
        }
    }

    /// Create a Config error.
    pub fn config(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::Config {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

impl From<tempfile::PersistError> for Error {
    fn from(err: tempfile::PersistError) -> Self {
        Error::Io { source: err.error }
    }
}
