//! Stream transport trait abstraction.
//!
//! This module defines the `StreamTransport` trait that the transfer layer is
//! written against. A binding multiplexes many logical streams between named
//! peers; each stream delivers its payloads in send order.

use crate::StreamId;
use crate::frame::{FrameError, MessageFrame};
use async_trait::async_trait;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport is closed
    #[error("Transport is closed")]
    Closed,

    /// Binding the local endpoint failed
    #[error("Failed to bind endpoint: {0}")]
    BindFailed(String),

    /// Destination peer is not reachable through this transport
    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    /// Wire frame could not be encoded or decoded
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Transport-specific error
    #[error("Transport error: {0}")]
    Other(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Async transport for stream-multiplexed communication.
///
/// Streams are opened implicitly by the first `send` on a fresh id, the way
/// QUIC opens a stream on first use. The end of a stream is signalled with
/// [`StreamTransport::finish`], which the receiver observes as a frame with an
/// empty payload. An abandoned stream is aborted with
/// [`StreamTransport::reset`] instead, so the receiver can tell a complete
/// stream from a truncated one.
///
/// Received frames carry the *sender's* name in [`MessageFrame::peer`], so a
/// reply can be addressed by echoing it back.
///
/// # Examples
///
/// ```
/// use quicftp_transport::{MemoryTransport, StreamTransport};
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let (client, server) = MemoryTransport::pair("client", "server");
///
/// client.send("server", 1, b"DOWNLOAD notes.txt\n").await?;
/// client.finish("server", 1).await?;
///
/// let frame = server.receive(Duration::from_millis(100)).await?.unwrap();
/// assert_eq!(frame.peer, "client");
/// assert_eq!(frame.stream_id, 1);
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Send a payload on a stream.
    ///
    /// Sending an empty payload is a no-op; use `finish` to end a stream.
    ///
    /// # Arguments
    /// * `peer` - The destination endpoint name
    /// * `stream_id` - The stream to send on
    /// * `payload` - The bytes to deliver
    ///
    /// # Errors
    /// Returns `TransportError` if the send operation fails
    async fn send(&self, peer: &str, stream_id: StreamId, payload: &[u8]) -> TransportResult<()>;

    /// Signal end-of-stream (FIN) for a stream.
    ///
    /// # Errors
    /// Returns `TransportError` if the signal cannot be delivered
    async fn finish(&self, peer: &str, stream_id: StreamId) -> TransportResult<()>;

    /// Abort a stream (RESET_STREAM).
    ///
    /// The receiver discards what it buffered for the stream.
    ///
    /// # Errors
    /// Returns `TransportError` if the signal cannot be delivered
    async fn reset(&self, peer: &str, stream_id: StreamId) -> TransportResult<()>;

    /// Wait up to `timeout` for the next frame.
    ///
    /// Returns `Ok(None)` when nothing arrived in time. Frames are returned in
    /// first-in-first-out order across all streams.
    ///
    /// # Errors
    /// Returns `TransportError` if the receive operation fails
    async fn receive(&self, timeout: Duration) -> TransportResult<Option<MessageFrame>>;

    /// Check whether a frame can be received without waiting.
    fn has_pending(&self) -> bool;

    /// Name of the local endpoint.
    fn local_name(&self) -> &str;

    /// Close the transport and release resources.
    ///
    /// After calling this method, sends return `TransportError::Closed`.
    ///
    /// # Errors
    /// Returns `TransportError` if closing fails
    async fn close(&self) -> TransportResult<()>;

    /// Check if the transport is closed.
    fn is_closed(&self) -> bool;

    /// Get transport statistics (optional).
    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}

/// Transport statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Total payload bytes sent
    pub bytes_sent: u64,
    /// Total payload bytes received
    pub bytes_received: u64,
    /// Total frames sent (FIN included)
    pub frames_sent: u64,
    /// Total frames received (FIN included)
    pub frames_received: u64,
    /// Send errors
    pub send_errors: u64,
    /// Receive errors
    pub recv_errors: u64,
}

impl TransportStats {
    /// Create new empty statistics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful send
    pub fn record_send(&mut self, bytes: usize) {
        self.bytes_sent += bytes as u64;
        self.frames_sent += 1;
    }

    /// Record a successful receive
    pub fn record_recv(&mut self, bytes: usize) {
        self.bytes_received += bytes as u64;
        self.frames_received += 1;
    }

    /// Record a send error
    pub fn record_send_error(&mut self) {
        self.send_errors += 1;
    }

    /// Record a receive error
    pub fn record_recv_error(&mut self) {
        self.recv_errors += 1;
    }
}

/// Lock-free counters shared by the bundled transports.
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    send_errors: AtomicU64,
    recv_errors: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn record_send(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_recv(&self, bytes: usize) {
        self.bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_send_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_recv_error(&self) {
        self.recv_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> TransportStats {
        TransportStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            recv_errors: self.recv_errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_stats() {
        let mut stats = TransportStats::new();
        assert_eq!(stats.bytes_sent, 0);
        assert_eq!(stats.frames_sent, 0);

        stats.record_send(100);
        assert_eq!(stats.bytes_sent, 100);
        assert_eq!(stats.frames_sent, 1);

        stats.record_recv(200);
        assert_eq!(stats.bytes_received, 200);
        assert_eq!(stats.frames_received, 1);

        stats.record_send_error();
        stats.record_recv_error();
        assert_eq!(stats.send_errors, 1);
        assert_eq!(stats.recv_errors, 1);
    }

    #[test]
    fn test_stats_counters_snapshot() {
        let counters = StatsCounters::default();
        counters.record_send(10);
        counters.record_send(0);
        counters.record_recv(7);
        counters.record_send_error();

        let stats = counters.snapshot();
        assert_eq!(stats.bytes_sent, 10);
        assert_eq!(stats.frames_sent, 2);
        assert_eq!(stats.bytes_received, 7);
        assert_eq!(stats.frames_received, 1);
        assert_eq!(stats.send_errors, 1);
        assert_eq!(stats.recv_errors, 0);
    }

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::Closed;
        assert_eq!(err.to_string(), "Transport is closed");

        let err = TransportError::UnknownPeer("server-9".to_string());
        assert_eq!(err.to_string(), "Unknown peer: server-9");

        let err = TransportError::BindFailed("test".to_string());
        assert!(err.to_string().contains("Failed to bind"));

        let err = TransportError::Other("test error".to_string());
        assert_eq!(err.to_string(), "Transport error: test error");
    }

    #[test]
    fn test_transport_error_from_io() {
        let io_err = std::io::Error::other("test");
        let transport_err = TransportError::from(io_err);

        assert!(matches!(transport_err, TransportError::Io(_)));
    }

    #[test]
    fn test_transport_error_from_frame() {
        let err = TransportError::from(FrameError::PayloadTooLarge(usize::MAX));
        assert!(matches!(err, TransportError::Frame(_)));
    }
}
