//! Command/data demultiplexing.
//!
//! Turns raw per-stream deliveries into discrete operations. Each stream,
//! keyed by `(peer, stream id)`, moves through:
//!
//! ```text
//!            header bytes             drain / take
//!  (new) ───────────────▶ Header ──▶ Upload | Download ──────────▶ Retired
//!                           │                                         │
//!                           └── not a command: dropped       FIN ─────┴──▶ (gone)
//! ```
//!
//! A stream is classified as command-carrying at most once. Data for a stream
//! with no recorded command is dropped and only logged. A reset from the peer
//! discards the stream in any state, and streams idle for too long can be
//! evicted with [`Demultiplexer::evict_idle`].

use crate::command::{Command, LineAccumulator, LineStatus, MAX_HEADER_LEN, could_be_command};
use quicftp_transport::StreamId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// When an upload stream counts as fully received
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompletionPolicy {
    /// Complete as soon as any payload is buffered (legacy heuristic).
    ///
    /// Payload arriving in later deliveries is lost, and empty uploads
    /// never complete.
    FirstData,
    /// Complete once the transport signals end-of-stream
    #[default]
    EndOfStream,
}

/// An upload whose payload is fully buffered and ready to persist
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingUpload {
    /// Sending peer
    pub peer: String,
    /// Stream the upload arrived on
    pub stream_id: StreamId,
    /// Untrusted remote path from the header
    pub remote_path: String,
    /// Uploaded bytes
    pub payload: Vec<u8>,
}

/// A recorded download command awaiting a handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    /// Requesting peer
    pub peer: String,
    /// Stream to answer on
    pub stream_id: StreamId,
    /// Untrusted remote path from the header
    pub remote_path: String,
}

/// An upload abandoned because it grew past the size limit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedUpload {
    /// Sending peer
    pub peer: String,
    /// Stream the upload arrived on
    pub stream_id: StreamId,
    /// Untrusted remote path from the header
    pub remote_path: String,
    /// Bytes received before rejection
    pub received: u64,
}

/// Demultiplexer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DemuxStats {
    /// Non-empty deliveries seen
    pub deliveries: u64,
    /// Deliveries dropped as unattributable or malformed
    pub dropped: u64,
    /// Command headers parsed
    pub headers: u64,
    /// Streams discarded because the peer reset them
    pub resets: u64,
    /// Streams evicted after going idle
    pub evicted: u64,
}

#[derive(Debug)]
enum SlotState {
    Header(LineAccumulator),
    Upload { remote_path: String, buffer: Vec<u8> },
    Download { remote_path: String },
    Retired,
}

#[derive(Debug)]
struct StreamSlot {
    state: SlotState,
    fin: bool,
    last_activity: Instant,
}

type StreamKey = (String, StreamId);

/// Classifies deliveries and assembles per-stream upload buffers.
#[derive(Debug)]
pub struct Demultiplexer {
    policy: CompletionPolicy,
    max_header_len: usize,
    max_upload_size: u64,
    streams: BTreeMap<StreamKey, StreamSlot>,
    rejected: Vec<RejectedUpload>,
    stats: DemuxStats,
}

impl Default for Demultiplexer {
    fn default() -> Self {
        Self::new(CompletionPolicy::default())
    }
}

impl Demultiplexer {
    /// Create a demultiplexer with the given completion policy
    #[must_use]
    pub fn new(policy: CompletionPolicy) -> Self {
        Self {
            policy,
            max_header_len: MAX_HEADER_LEN,
            max_upload_size: u64::MAX,
            streams: BTreeMap::new(),
            rejected: Vec::new(),
            stats: DemuxStats::default(),
        }
    }

    /// Bound header lines to `len` bytes
    #[must_use]
    pub fn with_max_header_len(mut self, len: usize) -> Self {
        self.max_header_len = len;
        self
    }

    /// Reject uploads larger than `size` bytes
    #[must_use]
    pub fn with_max_upload_size(mut self, size: u64) -> Self {
        self.max_upload_size = size;
        self
    }

    /// Active completion policy
    #[must_use]
    pub fn policy(&self) -> CompletionPolicy {
        self.policy
    }

    /// Handle one delivery of bytes on a stream.
    pub fn on_stream_data(&mut self, peer: &str, stream_id: StreamId, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.stats.deliveries += 1;

        let key = (peer.to_string(), stream_id);
        let Some(slot) = self.streams.get_mut(&key) else {
            if !could_be_command(bytes) {
                self.drop_delivery(peer, stream_id, bytes.len(), "data on stream without command");
                return;
            }
            let slot = StreamSlot {
                state: SlotState::Header(LineAccumulator::new(self.max_header_len)),
                fin: false,
                last_activity: Instant::now(),
            };
            self.streams.insert(key.clone(), slot);
            self.on_header_bytes(key, bytes);
            return;
        };

        if slot.fin {
            self.drop_delivery(peer, stream_id, bytes.len(), "data after end of stream");
            return;
        }
        slot.last_activity = Instant::now();

        match &mut slot.state {
            SlotState::Header(_) => self.on_header_bytes(key, bytes),
            SlotState::Upload { buffer, .. } => {
                buffer.extend_from_slice(bytes);
                self.enforce_upload_limit(&key);
            }
            SlotState::Download { .. } => {
                self.drop_delivery(peer, stream_id, bytes.len(), "data on download stream");
            }
            SlotState::Retired => {
                self.drop_delivery(peer, stream_id, bytes.len(), "data on retired stream");
            }
        }
    }

    fn on_header_bytes(&mut self, key: StreamKey, bytes: &[u8]) {
        let Some(slot) = self.streams.get_mut(&key) else {
            return;
        };
        let SlotState::Header(acc) = &mut slot.state else {
            return;
        };

        match acc.push(bytes) {
            LineStatus::Incomplete => {
                if !could_be_command(acc.buffered()) {
                    let len = acc.buffered().len();
                    self.streams.remove(&key);
                    self.drop_delivery(&key.0, key.1, len, "not a command header");
                }
            }
            LineStatus::Overflow => {
                self.streams.remove(&key);
                self.drop_delivery(&key.0, key.1, bytes.len(), "header exceeds length limit");
            }
            LineStatus::Complete { line, rest } => match Command::parse(&line) {
                Some(Command::Upload(remote_path)) => {
                    tracing::debug!("{}/{}: UPLOAD {}", key.0, key.1, remote_path);
                    self.stats.headers += 1;
                    slot.state = SlotState::Upload {
                        remote_path,
                        buffer: rest,
                    };
                    self.enforce_upload_limit(&key);
                }
                Some(Command::Download(remote_path)) => {
                    tracing::debug!("{}/{}: DOWNLOAD {}", key.0, key.1, remote_path);
                    self.stats.headers += 1;
                    slot.state = SlotState::Download { remote_path };
                    if !rest.is_empty() {
                        tracing::debug!(
                            "{}/{}: ignoring {} bytes after DOWNLOAD header",
                            key.0,
                            key.1,
                            rest.len()
                        );
                    }
                }
                None => {
                    self.streams.remove(&key);
                    self.drop_delivery(&key.0, key.1, line.len(), "malformed command header");
                }
            },
        }
    }

    fn enforce_upload_limit(&mut self, key: &StreamKey) {
        let Some(slot) = self.streams.get_mut(key) else {
            return;
        };
        let SlotState::Upload {
            remote_path,
            buffer,
        } = &mut slot.state
        else {
            return;
        };
        if buffer.len() as u64 <= self.max_upload_size {
            return;
        }

        let rejected = RejectedUpload {
            peer: key.0.clone(),
            stream_id: key.1,
            remote_path: std::mem::take(remote_path),
            received: buffer.len() as u64,
        };
        tracing::warn!(
            "Upload of {:?} on {}/{} exceeds {} bytes, rejecting",
            rejected.remote_path,
            key.0,
            key.1,
            self.max_upload_size
        );
        slot.state = SlotState::Retired;
        if slot.fin {
            self.streams.remove(key);
        }
        self.rejected.push(rejected);
    }

    /// Record end-of-stream for a stream.
    pub fn on_stream_finished(&mut self, peer: &str, stream_id: StreamId) {
        let key = (peer.to_string(), stream_id);
        let Some(slot) = self.streams.get_mut(&key) else {
            tracing::trace!("{}/{}: end of untracked stream", peer, stream_id);
            return;
        };
        slot.fin = true;

        match &slot.state {
            SlotState::Header(acc) => {
                if !acc.buffered().is_empty() {
                    tracing::debug!(
                        "{}/{}: stream ended inside header, discarding {} bytes",
                        peer,
                        stream_id,
                        acc.buffered().len()
                    );
                }
                self.streams.remove(&key);
            }
            SlotState::Retired => {
                self.streams.remove(&key);
            }
            SlotState::Upload { .. } | SlotState::Download { .. } => {}
        }
    }

    /// Discard a stream the peer aborted.
    ///
    /// Whatever was buffered is dropped; an unfinished upload never becomes a
    /// [`PendingUpload`].
    pub fn on_stream_reset(&mut self, peer: &str, stream_id: StreamId) {
        let key = (peer.to_string(), stream_id);
        match self.streams.remove(&key) {
            Some(slot) => {
                self.stats.resets += 1;
                let buffered = match &slot.state {
                    SlotState::Upload { buffer, .. } => buffer.len(),
                    SlotState::Header(acc) => acc.buffered().len(),
                    SlotState::Download { .. } | SlotState::Retired => 0,
                };
                tracing::debug!(
                    "{}/{}: reset by peer, discarding {} bytes",
                    peer,
                    stream_id,
                    buffered
                );
            }
            None => tracing::trace!("{}/{}: reset of untracked stream", peer, stream_id),
        }
    }

    /// Drop streams with no delivery for at least `max_idle` before `now`.
    ///
    /// Returns the number of streams evicted.
    pub fn evict_idle(&mut self, now: Instant, max_idle: Duration) -> usize {
        let before = self.streams.len();
        self.streams.retain(|(peer, stream_id), slot| {
            let idle = now.saturating_duration_since(slot.last_activity);
            if idle < max_idle {
                return true;
            }
            tracing::warn!(
                "{}/{}: no data for {:?}, evicting stream",
                peer,
                stream_id,
                idle
            );
            false
        });
        let evicted = before - self.streams.len();
        self.stats.evicted += evicted as u64;
        evicted
    }

    /// Take every upload that is complete under the active policy.
    pub fn drain_completed_uploads(&mut self) -> Vec<PendingUpload> {
        let policy = self.policy;
        let mut completed = Vec::new();
        let mut finished = Vec::new();

        for (key, slot) in &mut self.streams {
            let SlotState::Upload {
                remote_path,
                buffer,
            } = &mut slot.state
            else {
                continue;
            };
            let ready = match policy {
                CompletionPolicy::FirstData => !buffer.is_empty(),
                CompletionPolicy::EndOfStream => slot.fin,
            };
            if !ready {
                continue;
            }

            completed.push(PendingUpload {
                peer: key.0.clone(),
                stream_id: key.1,
                remote_path: std::mem::take(remote_path),
                payload: std::mem::take(buffer),
            });
            if slot.fin {
                finished.push(key.clone());
            } else {
                slot.state = SlotState::Retired;
            }
        }

        for key in finished {
            self.streams.remove(&key);
        }
        completed
    }

    /// Take every recorded download command.
    pub fn take_download_requests(&mut self) -> Vec<DownloadRequest> {
        let mut requests = Vec::new();
        let mut finished = Vec::new();

        for (key, slot) in &mut self.streams {
            let SlotState::Download { remote_path } = &mut slot.state else {
                continue;
            };
            requests.push(DownloadRequest {
                peer: key.0.clone(),
                stream_id: key.1,
                remote_path: std::mem::take(remote_path),
            });
            if slot.fin {
                finished.push(key.clone());
            } else {
                slot.state = SlotState::Retired;
            }
        }

        for key in finished {
            self.streams.remove(&key);
        }
        requests
    }

    /// Take uploads rejected for exceeding the size limit.
    pub fn take_rejected(&mut self) -> Vec<RejectedUpload> {
        std::mem::take(&mut self.rejected)
    }

    /// Number of streams with retained state
    #[must_use]
    pub fn pending_streams(&self) -> usize {
        self.streams.len()
    }

    /// Counters since creation
    #[must_use]
    pub fn stats(&self) -> DemuxStats {
        self.stats
    }

    fn drop_delivery(&mut self, peer: &str, stream_id: StreamId, len: usize, reason: &str) {
        self.stats.dropped += 1;
        tracing::debug!(
            "Dropped {} bytes on {}/{}: {}",
            len,
            peer,
            stream_id,
            reason
        );
    }
}
