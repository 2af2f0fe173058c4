//! # quicftp Core
//!
//! Protocol core for quicftp, a file transfer service that runs one file per
//! stream over a multiplexed, encrypted transport.
//!
//! This crate provides:
//! - Command headers and status lines (`UPLOAD <path>\n`, `OK <size>\n`)
//! - Per-stream demultiplexing of command and data bytes
//! - The stream lifecycle registry with progress and speed tracking
//! - Client and server transfer orchestration
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Client / Server                               │
//! │   (upload, download, batches, cancellation, event loop)         │
//! ├──────────────────────────────┬──────────────────────────────────┤
//! │        Demultiplexer         │         StreamRegistry           │
//! │  (header vs. data per stream)│  (Idle → Open → Closed/Error)    │
//! ├──────────────────────────────┴──────────────────────────────────┤
//! │               StreamTransport  /  SecureStore                    │
//! │   (framed stream I/O)          (sandboxed file access)          │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod command;
pub mod config;
pub mod demux;
pub mod error;
pub mod stream;
pub mod transfer;

pub use command::{Command, Direction, LineAccumulator, LineStatus, Status};
pub use config::{ClientConfig, DEFAULT_PORT, ProgressCallback, ServerConfig};
pub use demux::{
    CompletionPolicy, DemuxStats, Demultiplexer, DownloadRequest, PendingUpload, RejectedUpload,
};
pub use error::{ErrorKind, Result, TransferError};
pub use stream::{StreamRecord, StreamRegistry, StreamState};
pub use transfer::{BatchReport, Client, FileOutcome, FileTransfer, Server};

pub use quicftp_transport::StreamId;
