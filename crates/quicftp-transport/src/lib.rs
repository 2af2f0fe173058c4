//! # quicftp Transport
//!
//! Transport adapter boundary for the quicftp file transfer protocol.
//!
//! The protocol runs over a multiplexed, stream-oriented connection (QUIC in
//! production). Everything above this crate only needs three things from it:
//! stream identifiers, ordered byte deliveries per stream, and a way to push
//! bytes out on a stream. This crate provides:
//!
//! - The [`StreamTransport`] trait every binding implements
//! - [`MessageFrame`] and its line-oriented wire codec
//! - [`MemoryTransport`], a connected in-process pair for tests and embedding
//! - [`SpoolTransport`], a file-spool IPC binding used by the CLI
//!
//! ```text
//! ┌──────────────┐   send(peer, id, bytes)   ┌──────────────┐
//! │    client    │ ────────────────────────▶ │    server    │
//! │  (streams)   │ ◀──────────────────────── │  (streams)   │
//! └──────────────┘   receive() -> frame      └──────────────┘
//! ```
//!
//! An empty payload on a stream is the end-of-stream (FIN) marker.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod frame;
pub mod memory;
pub mod spool;
pub mod transport;

pub use frame::{FrameDecoder, FrameError, MAX_FRAME_PAYLOAD, MessageFrame, encode_frame};
pub use memory::MemoryTransport;
pub use spool::SpoolTransport;
pub use transport::{StreamTransport, TransportError, TransportResult, TransportStats};

/// Identifier of a logical stream multiplexed over one connection.
pub type StreamId = u64;
