//! File-spool transport for inter-process use on one host.
//!
//! Every endpoint owns an inbox file `<dir>/<name>.queue`. Senders append
//! whole encoded frames to the destination's inbox; the owner tails its inbox
//! from a remembered offset and decodes incrementally.
//!
//! Appends and compaction hold an exclusive advisory lock on the inbox. Once
//! the owner has consumed at least [`COMPACT_THRESHOLD`] bytes and nothing
//! newer was appended, it truncates the inbox back to zero. The inbox is
//! removed when the endpoint closes or is dropped.
//!
//! This stands in for a real network binding where none is available; it
//! carries the same frame contract as any other [`StreamTransport`].

use crate::StreamId;
use crate::frame::{FrameDecoder, MessageFrame, encode_frame};
use crate::transport::{StatsCounters, StreamTransport, TransportError, TransportResult, TransportStats};
use async_trait::async_trait;
use fs2::FileExt;
use std::collections::VecDeque;
use std::io::{SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Default interval between inbox polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Consumed inbox bytes that trigger compaction.
pub const COMPACT_THRESHOLD: u64 = 64 * 1024;

#[derive(Debug, Default)]
struct InboxReader {
    decoder: FrameDecoder,
    ready: VecDeque<MessageFrame>,
}

/// Spool-directory transport endpoint.
#[derive(Debug)]
pub struct SpoolTransport {
    dir: PathBuf,
    local: String,
    inbox: PathBuf,
    reader: Mutex<InboxReader>,
    offset: AtomicU64,
    ready_len: AtomicUsize,
    poll_interval: Duration,
    closed: AtomicBool,
    stats: StatsCounters,
}

impl SpoolTransport {
    /// Bind `local_name` in the spool directory `dir`.
    ///
    /// Creates the directory if needed and truncates any stale inbox left by a
    /// previous endpoint with the same name.
    ///
    /// # Errors
    /// Returns `TransportError::BindFailed` if the directory or inbox cannot be
    /// created, or `TransportError::InvalidConfig` for an empty name.
    pub async fn bind(dir: impl AsRef<Path>, local_name: &str) -> TransportResult<Self> {
        if local_name.is_empty() || local_name.contains('\n') {
            return Err(TransportError::InvalidConfig(format!(
                "invalid endpoint name {local_name:?}"
            )));
        }

        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| TransportError::BindFailed(format!("{}: {e}", dir.display())))?;

        let inbox = queue_path(&dir, local_name);
        tokio::fs::File::create(&inbox)
            .await
            .map_err(|e| TransportError::BindFailed(format!("{}: {e}", inbox.display())))?;

        tracing::debug!("Spool endpoint {} bound at {}", local_name, inbox.display());

        Ok(Self {
            dir,
            local: local_name.to_string(),
            inbox,
            reader: Mutex::new(InboxReader::default()),
            offset: AtomicU64::new(0),
            ready_len: AtomicUsize::new(0),
            poll_interval: DEFAULT_POLL_INTERVAL,
            closed: AtomicBool::new(false),
            stats: StatsCounters::default(),
        })
    }

    /// Override the inbox poll interval
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Path of this endpoint's inbox file
    #[must_use]
    pub fn inbox_path(&self) -> &Path {
        &self.inbox
    }

    async fn append(&self, peer: &str, frame: MessageFrame) -> TransportResult<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }

        let target = queue_path(&self.dir, peer);
        if !tokio::fs::try_exists(&target).await.unwrap_or(false) {
            self.stats.record_send_error();
            return Err(TransportError::UnknownPeer(peer.to_string()));
        }

        let len = frame.payload.len();
        let bytes = encode_frame(&frame)?;
        let result = tokio::task::spawn_blocking(move || append_locked(&target, &bytes))
            .await
            .map_err(|e| TransportError::Other(format!("spool writer panicked: {e}")))?;

        match result {
            Ok(()) => {
                self.stats.record_send(len);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.stats.record_send_error();
                Err(TransportError::UnknownPeer(peer.to_string()))
            }
            Err(e) => {
                self.stats.record_send_error();
                Err(TransportError::Io(e))
            }
        }
    }

    /// Read whatever was appended to the inbox since the last poll.
    async fn fill(&self, reader: &mut InboxReader) -> TransportResult<()> {
        let offset = self.offset.load(Ordering::Acquire);
        let mut file = tokio::fs::File::open(&self.inbox).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut fresh = Vec::new();
        let read = file.read_to_end(&mut fresh).await?;
        if read == 0 {
            return Ok(());
        }
        self.offset.fetch_add(read as u64, Ordering::AcqRel);

        reader.decoder.extend(&fresh);
        loop {
            match reader.decoder.next_frame() {
                Ok(Some(frame)) => reader.ready.push_back(frame),
                Ok(None) => break,
                Err(e) => {
                    self.stats.record_recv_error();
                    tracing::warn!("Corrupt frame in {}: {}", self.inbox.display(), e);
                    return Err(e.into());
                }
            }
        }
        self.ready_len.store(reader.ready.len(), Ordering::Release);

        let consumed = self.offset.load(Ordering::Acquire);
        if reader.decoder.buffered() == 0 && consumed >= COMPACT_THRESHOLD {
            self.compact(consumed).await;
        }
        Ok(())
    }

    /// Truncate the inbox if everything in it has been consumed.
    async fn compact(&self, consumed: u64) {
        let inbox = self.inbox.clone();
        match tokio::task::spawn_blocking(move || truncate_if_consumed(&inbox, consumed)).await {
            Ok(Ok(true)) => {
                self.offset.store(0, Ordering::Release);
                tracing::trace!("Compacted {} ({} bytes)", self.inbox.display(), consumed);
            }
            Ok(Ok(false)) => {}
            Ok(Err(e)) => tracing::warn!("Failed to compact {}: {}", self.inbox.display(), e),
            Err(e) => tracing::warn!("Spool compaction panicked: {}", e),
        }
    }

    fn remove_inbox(&self) {
        match std::fs::remove_file(&self.inbox) {
            Ok(()) => tracing::debug!("Removed inbox {}", self.inbox.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove {}: {}", self.inbox.display(), e),
        }
    }
}

impl Drop for SpoolTransport {
    fn drop(&mut self) {
        self.remove_inbox();
    }
}

#[async_trait]
impl StreamTransport for SpoolTransport {
    async fn send(&self, peer: &str, stream_id: StreamId, payload: &[u8]) -> TransportResult<()> {
        if payload.is_empty() {
            return Ok(());
        }
        self.append(
            peer,
            MessageFrame::new(self.local.clone(), stream_id, payload.to_vec()),
        )
        .await
    }

    async fn finish(&self, peer: &str, stream_id: StreamId) -> TransportResult<()> {
        self.append(peer, MessageFrame::fin(self.local.clone(), stream_id))
            .await
    }

    async fn reset(&self, peer: &str, stream_id: StreamId) -> TransportResult<()> {
        self.append(peer, MessageFrame::reset(self.local.clone(), stream_id))
            .await
    }

    async fn receive(&self, timeout: Duration) -> TransportResult<Option<MessageFrame>> {
        let deadline = Instant::now() + timeout;
        let mut reader = self.reader.lock().await;

        loop {
            if let Some(frame) = reader.ready.pop_front() {
                self.ready_len.store(reader.ready.len(), Ordering::Release);
                self.stats.record_recv(frame.payload.len());
                return Ok(Some(frame));
            }
            if self.closed.load(Ordering::Relaxed) {
                return Err(TransportError::Closed);
            }

            self.fill(&mut reader).await?;
            if !reader.ready.is_empty() {
                continue;
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    fn has_pending(&self) -> bool {
        if self.ready_len.load(Ordering::Acquire) > 0 {
            return true;
        }
        std::fs::metadata(&self.inbox)
            .map(|m| m.len() > self.offset.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    fn local_name(&self) -> &str {
        &self.local
    }

    async fn close(&self) -> TransportResult<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.remove_inbox();
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    fn stats(&self) -> TransportStats {
        self.stats.snapshot()
    }
}

fn append_locked(target: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = std::fs::OpenOptions::new().append(true).open(target)?;
    file.lock_exclusive()?;
    let written = file.write_all(bytes).and_then(|()| file.flush());
    FileExt::unlock(&file)?;
    written
}

fn truncate_if_consumed(inbox: &Path, consumed: u64) -> std::io::Result<bool> {
    let file = std::fs::OpenOptions::new().write(true).open(inbox)?;
    file.lock_exclusive()?;
    let truncated = match file.metadata() {
        Ok(meta) if meta.len() == consumed => file.set_len(0).map(|()| true),
        Ok(_) => Ok(false),
        Err(e) => Err(e),
    };
    FileExt::unlock(&file)?;
    truncated
}

/// Inbox path for an endpoint name, with unsafe filename characters replaced.
fn queue_path(dir: &Path, name: &str) -> PathBuf {
    let file: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    dir.join(format!("{file}.queue"))
}
