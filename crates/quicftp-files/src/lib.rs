//! # quicftp Files
//!
//! Secure file access layer for the quicftp protocol.
//!
//! This crate provides:
//! - Sandboxed resolution of untrusted remote paths ([`Sandbox`])
//! - Fixed-size chunked reads ([`ChunkReader`])
//! - Atomic upload writes and chunked download reads ([`SecureStore`])
//! - Transfer statistics and human-readable size formatting
//!
//! Every filesystem failure is converted into a [`FileError`]; nothing in
//! this crate panics on I/O.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chunker;
pub mod error;
pub mod sandbox;
pub mod stats;
pub mod store;

pub use chunker::ChunkReader;
pub use error::FileError;
pub use sandbox::Sandbox;
pub use stats::{TransferStats, format_bytes, format_speed};
pub use store::{DownloadSource, SecureStore};

/// Chunk size used for streaming file contents (64 KiB)
pub const CHUNK_SIZE: usize = 64 * 1024;
