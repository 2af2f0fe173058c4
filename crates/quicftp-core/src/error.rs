//! Error types for quicftp transfers.
//!
//! Every failure that reaches a caller maps onto one [`ErrorKind`]:
//!
//! - **ProtocolFraming**: malformed header or data on an unknown stream
//! - **Security**: a remote path escapes the sandbox root
//! - **NotFound**: the requested file is missing or not a regular file
//! - **Io**: local or remote filesystem failure
//! - **Auth**: missing certificate or failed authentication
//! - **Cancelled**: explicit cancellation
//!
//! Transport failures, timeouts and remote rejections get their own variants
//! but still report one of these kinds.

use quicftp_files::FileError;
use quicftp_transport::TransportError;
use std::borrow::Cow;
use thiserror::Error;

/// Error categories surfaced to users and logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed command header or unattributable data
    ProtocolFraming,
    /// Sandbox violation
    Security,
    /// Missing remote file
    NotFound,
    /// Filesystem or transport failure
    Io,
    /// Authentication failure
    Auth,
    /// Cancelled by the user or operator
    Cancelled,
}

/// Errors that can occur during transfers
#[derive(Debug, Error, Clone)]
pub enum TransferError {
    /// Command header or stream framing violation
    #[error("Protocol framing error: {0}")]
    ProtocolFraming(Cow<'static, str>),

    /// Remote path rejected by the sandbox
    #[error("Security violation: {0}")]
    Security(Cow<'static, str>),

    /// Remote file missing or not a regular file
    #[error("Not found: {0}")]
    NotFound(Cow<'static, str>),

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(String),

    /// Authentication failure
    #[error("Authentication failed: {0}")]
    Auth(Cow<'static, str>),

    /// Transfer cancelled
    #[error("Cancelled: {0}")]
    Cancelled(Cow<'static, str>),

    /// Transport operation failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// Peer answered with an error status
    #[error("Remote error: {0}")]
    Remote(String),

    /// No response within the configured timeout
    #[error("Operation timed out: {0}")]
    Timeout(Cow<'static, str>),

    /// Operation not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),
}

impl TransferError {
    /// Category this error belongs to
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ProtocolFraming(_) => ErrorKind::ProtocolFraming,
            Self::Security(_) => ErrorKind::Security,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Auth(_) => ErrorKind::Auth,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::Remote(reason) => remote_kind(reason),
            Self::Io(_)
            | Self::Transport(_)
            | Self::Timeout(_)
            | Self::InvalidState(_)
            | Self::InvalidConfig(_) => ErrorKind::Io,
        }
    }

    /// Create an invalid state error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_state(context: &'static str) -> Self {
        Self::InvalidState(Cow::Borrowed(context))
    }

    /// Create a timeout error with static context (zero allocation)
    #[must_use]
    pub const fn timeout(context: &'static str) -> Self {
        Self::Timeout(Cow::Borrowed(context))
    }

    /// Create a framing error with static context (zero allocation)
    #[must_use]
    pub const fn framing(context: &'static str) -> Self {
        Self::ProtocolFraming(Cow::Borrowed(context))
    }

    /// Short reason suitable for an `ERR` status line
    #[must_use]
    pub fn status_reason(&self) -> String {
        let kind = match self.kind() {
            ErrorKind::ProtocolFraming => "framing",
            ErrorKind::Security => "security",
            ErrorKind::NotFound => "not-found",
            ErrorKind::Io => "io",
            ErrorKind::Auth => "auth",
            ErrorKind::Cancelled => "cancelled",
        };
        format!("{kind}: {self}").replace('\n', " ")
    }
}

/// Recover the category from a peer's `ERR` reason.
fn remote_kind(reason: &str) -> ErrorKind {
    match reason.split(':').next().unwrap_or_default() {
        "framing" => ErrorKind::ProtocolFraming,
        "security" => ErrorKind::Security,
        "not-found" => ErrorKind::NotFound,
        "auth" => ErrorKind::Auth,
        "cancelled" => ErrorKind::Cancelled,
        _ => ErrorKind::Io,
    }
}

impl From<FileError> for TransferError {
    fn from(err: FileError) -> Self {
        match err {
            FileError::InvalidPath(_) | FileError::Traversal(_) => {
                Self::Security(Cow::Owned(err.to_string()))
            }
            FileError::NotFound(_) | FileError::NotAFile(_) => {
                Self::NotFound(Cow::Owned(err.to_string()))
            }
            FileError::InvalidRoot { .. } | FileError::Io { .. } | FileError::Aborted { .. } => {
                Self::Io(err.to_string())
            }
        }
    }
}

impl From<TransportError> for TransferError {
    fn from(err: TransportError) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<std::io::Error> for TransferError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Result type for transfer operations
pub type Result<T> = std::result::Result<T, TransferError>;
