//! In-process transport connecting exactly two endpoints.
//!
//! Used by tests and by embedders that run client and server in the same
//! process. Each endpoint owns its inbox; nothing is shared globally, so any
//! number of independent pairs can coexist.

use crate::StreamId;
use crate::frame::MessageFrame;
use crate::transport::{StatsCounters, StreamTransport, TransportError, TransportResult, TransportStats};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};

/// One end of a connected in-memory transport pair.
#[derive(Debug)]
pub struct MemoryTransport {
    local: String,
    remote: String,
    outbox: mpsc::UnboundedSender<MessageFrame>,
    inbox: Mutex<mpsc::UnboundedReceiver<MessageFrame>>,
    inbox_len: Arc<AtomicUsize>,
    remote_inbox_len: Arc<AtomicUsize>,
    closed: AtomicBool,
    stats: StatsCounters,
}

impl MemoryTransport {
    /// Create two connected endpoints named `a` and `b`.
    ///
    /// Frames sent by `a` to `b` are received by `b` with `peer == a` and
    /// vice versa.
    #[must_use]
    pub fn pair(a: &str, b: &str) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        let a_len = Arc::new(AtomicUsize::new(0));
        let b_len = Arc::new(AtomicUsize::new(0));

        let left = Self {
            local: a.to_string(),
            remote: b.to_string(),
            outbox: a_tx,
            inbox: Mutex::new(a_rx),
            inbox_len: Arc::clone(&a_len),
            remote_inbox_len: Arc::clone(&b_len),
            closed: AtomicBool::new(false),
            stats: StatsCounters::default(),
        };
        let right = Self {
            local: b.to_string(),
            remote: a.to_string(),
            outbox: b_tx,
            inbox: Mutex::new(b_rx),
            inbox_len: b_len,
            remote_inbox_len: a_len,
            closed: AtomicBool::new(false),
            stats: StatsCounters::default(),
        };
        (left, right)
    }

    /// Name of the connected endpoint
    #[must_use]
    pub fn remote_name(&self) -> &str {
        &self.remote
    }

    fn push(&self, peer: &str, frame: MessageFrame) -> TransportResult<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }
        if peer != self.remote {
            self.stats.record_send_error();
            return Err(TransportError::UnknownPeer(peer.to_string()));
        }

        let len = frame.payload.len();
        // Count before sending so the receiver never observes a negative length.
        self.remote_inbox_len.fetch_add(1, Ordering::AcqRel);
        if self.outbox.send(frame).is_err() {
            self.remote_inbox_len.fetch_sub(1, Ordering::AcqRel);
            self.stats.record_send_error();
            return Err(TransportError::Closed);
        }
        self.stats.record_send(len);
        Ok(())
    }
}

#[async_trait]
impl StreamTransport for MemoryTransport {
    async fn send(&self, peer: &str, stream_id: StreamId, payload: &[u8]) -> TransportResult<()> {
        if payload.is_empty() {
            return Ok(());
        }
        self.push(
            peer,
            MessageFrame::new(self.local.clone(), stream_id, payload.to_vec()),
        )
    }

    async fn finish(&self, peer: &str, stream_id: StreamId) -> TransportResult<()> {
        self.push(peer, MessageFrame::fin(self.local.clone(), stream_id))
    }

    async fn reset(&self, peer: &str, stream_id: StreamId) -> TransportResult<()> {
        self.push(peer, MessageFrame::reset(self.local.clone(), stream_id))
    }

    async fn receive(&self, timeout: Duration) -> TransportResult<Option<MessageFrame>> {
        let mut inbox = self.inbox.lock().await;
        match tokio::time::timeout(timeout, inbox.recv()).await {
            Ok(Some(frame)) => {
                self.inbox_len.fetch_sub(1, Ordering::AcqRel);
                self.stats.record_recv(frame.payload.len());
                Ok(Some(frame))
            }
            Ok(None) => {
                self.stats.record_recv_error();
                Err(TransportError::Closed)
            }
            Err(_) => Ok(None),
        }
    }

    fn has_pending(&self) -> bool {
        self.inbox_len.load(Ordering::Acquire) > 0
    }

    fn local_name(&self) -> &str {
        &self.local
    }

    async fn close(&self) -> TransportResult<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    fn stats(&self) -> TransportStats {
        self.stats.snapshot()
    }
}
