//! Error types for the secure file access layer.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// File access errors
#[derive(Debug, Error)]
pub enum FileError {
    /// Remote path is empty, contains NUL bytes or normalises to the root
    #[error("invalid path: {0:?}")]
    InvalidPath(String),

    /// Remote path resolves outside the sandbox root
    #[error("path escapes root directory: {0:?}")]
    Traversal(String),

    /// Requested file does not exist
    #[error("file not found: {0:?}")]
    NotFound(String),

    /// Requested path exists but is not a regular file
    #[error("not a regular file: {0:?}")]
    NotAFile(String),

    /// Root directory could not be created or canonicalised
    #[error("invalid root directory {path}: {source}")]
    InvalidRoot {
        /// Configured root
        path: PathBuf,
        /// Underlying failure
        source: io::Error,
    },

    /// Filesystem operation failed
    #[error("I/O error on {path}: {source}")]
    Io {
        /// Path being accessed
        path: PathBuf,
        /// Underlying failure
        source: io::Error,
    },

    /// The chunk sink asked to stop after `sent` bytes
    #[error("transfer aborted after {sent} bytes")]
    Aborted {
        /// Bytes handed to the sink before it aborted
        sent: u64,
    },
}

impl FileError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the error is a sandbox rejection
    #[must_use]
    pub fn is_security(&self) -> bool {
        matches!(self, Self::Traversal(_) | Self::InvalidPath(_))
    }
}
