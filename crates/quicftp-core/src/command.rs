//! Command headers and response status lines.
//!
//! The first bytes on a fresh stream name the operation:
//!
//! ```text
//! UPLOAD <remote-path>\n<file bytes...>
//! DOWNLOAD <remote-path>\n
//! ```
//!
//! The server answers each stream with a status line before any payload:
//!
//! ```text
//! OK <size>\n<file bytes...>      (downloads)
//! OK <bytes written>\n            (uploads)
//! ERR <reason>\n
//! ```

use crate::error::{Result, TransferError};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// Header prefix of an upload command
pub const UPLOAD_PREFIX: &[u8] = b"UPLOAD ";

/// Header prefix of a download command
pub const DOWNLOAD_PREFIX: &[u8] = b"DOWNLOAD ";

/// Default bound on a header or status line, terminator excluded
pub const MAX_HEADER_LEN: usize = 4096;

/// Transfer direction, from the client's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Client sends a file to the server
    Upload,
    /// Client fetches a file from the server
    Download,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Upload => f.write_str("UPLOAD"),
            Self::Download => f.write_str("DOWNLOAD"),
        }
    }
}

/// A parsed command header
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Store the stream payload at the remote path
    Upload(String),
    /// Send the file at the remote path back on this stream
    Download(String),
}

impl Command {
    /// Direction of the command
    #[must_use]
    pub fn direction(&self) -> Direction {
        match self {
            Self::Upload(_) => Direction::Upload,
            Self::Download(_) => Direction::Download,
        }
    }

    /// Remote path named by the command
    #[must_use]
    pub fn remote_path(&self) -> &str {
        match self {
            Self::Upload(path) | Self::Download(path) => path,
        }
    }

    /// Encode the header line, terminator included.
    ///
    /// # Errors
    /// Returns `TransferError::ProtocolFraming` if the path is empty or
    /// contains a newline.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let path = self.remote_path();
        if path.is_empty() {
            return Err(TransferError::framing("remote path is empty"));
        }
        if path.contains('\n') {
            return Err(TransferError::framing("remote path contains a newline"));
        }

        let prefix = match self {
            Self::Upload(_) => UPLOAD_PREFIX,
            Self::Download(_) => DOWNLOAD_PREFIX,
        };
        let mut out = Vec::with_capacity(prefix.len() + path.len() + 1);
        out.extend_from_slice(prefix);
        out.extend_from_slice(path.as_bytes());
        out.push(b'\n');
        Ok(out)
    }

    /// Parse a header line (terminator excluded).
    ///
    /// Returns `None` if the line does not start with a command prefix or the
    /// path is not UTF-8.
    #[must_use]
    pub fn parse(line: &[u8]) -> Option<Self> {
        if let Some(path) = line.strip_prefix(UPLOAD_PREFIX) {
            return std::str::from_utf8(path)
                .ok()
                .map(|p| Self::Upload(p.to_string()));
        }
        if let Some(path) = line.strip_prefix(DOWNLOAD_PREFIX) {
            return std::str::from_utf8(path)
                .ok()
                .map(|p| Self::Download(p.to_string()));
        }
        None
    }
}

/// Whether `bytes` is, or could still grow into, a command header.
#[must_use]
pub fn could_be_command(bytes: &[u8]) -> bool {
    [UPLOAD_PREFIX, DOWNLOAD_PREFIX].iter().any(|prefix| {
        let n = bytes.len().min(prefix.len());
        bytes[..n] == prefix[..n]
    })
}

/// Status line answering a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    /// Success with a byte count (file size or bytes written)
    Ok(u64),
    /// Rejection with a single-line reason
    Err(String),
}

impl Status {
    /// Encode the status line, terminator included
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Ok(size) => format!("OK {size}\n").into_bytes(),
            Self::Err(reason) => format!("ERR {}\n", reason.replace('\n', " ")).into_bytes(),
        }
    }

    /// Parse a status line (terminator excluded).
    ///
    /// # Errors
    /// Returns `TransferError::ProtocolFraming` for anything that is not a
    /// well-formed `OK` or `ERR` line.
    pub fn parse(line: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(line)
            .map_err(|_| TransferError::framing("status line is not UTF-8"))?;
        if let Some(size) = text.strip_prefix("OK ") {
            return size.parse().map(Self::Ok).map_err(|_| {
                TransferError::ProtocolFraming(Cow::Owned(format!("bad size in status {text:?}")))
            });
        }
        if let Some(reason) = text.strip_prefix("ERR ") {
            return Ok(Self::Err(reason.to_string()));
        }
        Err(TransferError::ProtocolFraming(Cow::Owned(format!(
            "unexpected status line {text:?}"
        ))))
    }
}

/// Outcome of feeding bytes to a [`LineAccumulator`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineStatus {
    /// No terminator yet
    Incomplete,
    /// A full line arrived; `rest` holds the bytes after its terminator
    Complete {
        /// Line contents without the terminator
        line: Vec<u8>,
        /// Bytes following the terminator
        rest: Vec<u8>,
    },
    /// The line exceeded the length bound without a terminator
    Overflow,
}

/// Buffers bytes until the first newline, up to a maximum line length.
#[derive(Debug, Clone)]
pub struct LineAccumulator {
    buf: Vec<u8>,
    max_len: usize,
}

impl Default for LineAccumulator {
    fn default() -> Self {
        Self::new(MAX_HEADER_LEN)
    }
}

impl LineAccumulator {
    /// Create an accumulator bounded to `max_len` bytes per line
    #[must_use]
    pub fn new(max_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_len,
        }
    }

    /// Bytes buffered so far
    #[must_use]
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    /// Feed more bytes.
    ///
    /// After `Complete` or `Overflow` the accumulator is empty again.
    pub fn push(&mut self, bytes: &[u8]) -> LineStatus {
        let start = self.buf.len();
        self.buf.extend_from_slice(bytes);

        match self.buf[start..].iter().position(|&b| b == b'\n') {
            Some(pos) => {
                let end = start + pos;
                if end > self.max_len {
                    self.buf.clear();
                    return LineStatus::Overflow;
                }
                let rest = self.buf.split_off(end + 1);
                self.buf.truncate(end);
                LineStatus::Complete {
                    line: std::mem::take(&mut self.buf),
                    rest,
                }
            }
            None if self.buf.len() > self.max_len => {
                self.buf.clear();
                LineStatus::Overflow
            }
            None => LineStatus::Incomplete,
        }
    }

    /// Discard buffered bytes
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}
