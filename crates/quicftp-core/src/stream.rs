//! Stream lifecycle management.
//!
//! The [`StreamRegistry`] is the single source of truth for in-flight
//! transfers. Every record moves through
//!
//! ```text
//! Idle ──▶ Open ──▶ Closed
//!   │        │
//!   └────────┴────▶ Error
//! ```
//!
//! and never leaves a terminal state. All access goes through one lock, so a
//! reader never observes a record half-updated.

use crate::command::Direction;
use quicftp_transport::StreamId;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// Stream lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamState {
    /// Registered, not started
    Idle,
    /// Transfer in progress
    Open,
    /// Finished successfully
    Closed,
    /// Failed or cancelled
    Error,
}

impl StreamState {
    /// Whether no further transition is possible
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Error)
    }
}

/// One logical transfer
#[derive(Debug, Clone)]
pub struct StreamRecord {
    /// Unique id, never reused
    pub id: StreamId,
    /// Transfer direction
    pub direction: Direction,
    /// Remote path as supplied (untrusted)
    pub remote_path: String,
    /// Lifecycle state
    pub state: StreamState,
    /// Bytes moved so far
    pub bytes_transferred: u64,
    /// Expected size (0 while unknown)
    pub total_bytes: u64,
    /// Higher is served preferentially
    pub priority: i32,
    /// When the transfer was opened
    pub start_time: Instant,
    /// Current throughput in bytes/sec
    pub current_speed: f64,
    /// Average throughput in bytes/sec
    pub average_speed: f64,
}

impl StreamRecord {
    /// Fraction complete, or `None` while the total is unknown
    #[must_use]
    pub fn progress(&self) -> Option<f64> {
        if self.total_bytes == 0 {
            return None;
        }
        Some((self.bytes_transferred as f64 / self.total_bytes as f64).min(1.0))
    }

    fn refresh_speed(&mut self) {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            let speed = self.bytes_transferred as f64 / elapsed;
            self.current_speed = speed;
            self.average_speed = speed;
        }
    }
}

#[derive(Debug)]
struct Inner {
    records: BTreeMap<StreamId, StreamRecord>,
    next_id: StreamId,
}

/// Registry of stream records.
///
/// # Examples
///
/// ```
/// use quicftp_core::{Direction, StreamRegistry, StreamState};
///
/// let registry = StreamRegistry::new();
/// let id = registry.create("docs/a.txt", 1024, 0, Direction::Upload);
/// assert!(registry.update_progress(id, 512));
/// registry.complete(id);
/// assert_eq!(registry.get(id).unwrap().state, StreamState::Closed);
/// ```
#[derive(Debug)]
pub struct StreamRegistry {
    inner: Mutex<Inner>,
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamRegistry {
    /// Create an empty registry; ids start at 1
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                records: BTreeMap::new(),
                next_id: 1,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(
        &self,
        remote_path: String,
        total_bytes: u64,
        priority: i32,
        direction: Direction,
        state: StreamState,
    ) -> StreamId {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.records.insert(
            id,
            StreamRecord {
                id,
                direction,
                remote_path,
                state,
                bytes_transferred: 0,
                total_bytes,
                priority,
                start_time: Instant::now(),
                current_speed: 0.0,
                average_speed: 0.0,
            },
        );
        id
    }

    /// Allocate an id and insert an Open record started now.
    pub fn create(
        &self,
        remote_path: impl Into<String>,
        total_bytes: u64,
        priority: i32,
        direction: Direction,
    ) -> StreamId {
        let id = self.insert(
            remote_path.into(),
            total_bytes,
            priority,
            direction,
            StreamState::Open,
        );
        tracing::trace!("Stream {} opened ({})", id, direction);
        id
    }

    /// Allocate an id and insert an Idle record, to be opened later.
    pub fn register(
        &self,
        remote_path: impl Into<String>,
        total_bytes: u64,
        priority: i32,
        direction: Direction,
    ) -> StreamId {
        self.insert(
            remote_path.into(),
            total_bytes,
            priority,
            direction,
            StreamState::Idle,
        )
    }

    /// Move an Idle record to Open and restart its clock.
    ///
    /// Returns `false` if the record is unknown or not Idle.
    pub fn open(&self, id: StreamId) -> bool {
        let mut inner = self.lock();
        match inner.records.get_mut(&id) {
            Some(record) if record.state == StreamState::Idle => {
                record.state = StreamState::Open;
                record.start_time = Instant::now();
                true
            }
            _ => false,
        }
    }

    /// Record progress on an Open stream and recompute its speed.
    ///
    /// Returns `false` (and changes nothing) if the id is unknown or the
    /// record is not Open. An Idle record must be [`open`](Self::open)ed
    /// first; queued transfers report no progress.
    pub fn update_progress(&self, id: StreamId, bytes_transferred: u64) -> bool {
        let mut inner = self.lock();
        match inner.records.get_mut(&id) {
            Some(record) if record.state == StreamState::Open => {
                record.bytes_transferred = bytes_transferred;
                record.refresh_speed();
                true
            }
            _ => false,
        }
    }

    /// Set the expected size once it becomes known.
    pub fn set_total_bytes(&self, id: StreamId, total_bytes: u64) -> bool {
        let mut inner = self.lock();
        match inner.records.get_mut(&id) {
            Some(record) if !record.state.is_terminal() => {
                record.total_bytes = total_bytes;
                true
            }
            _ => false,
        }
    }

    /// Finalize a record as Closed. No-op if absent or already terminal.
    pub fn complete(&self, id: StreamId) {
        let mut inner = self.lock();
        if let Some(record) = inner.records.get_mut(&id) {
            if record.state.is_terminal() {
                return;
            }
            record.refresh_speed();
            record.state = StreamState::Closed;
            tracing::trace!("Stream {} closed after {} bytes", id, record.bytes_transferred);
        }
    }

    /// Finalize a record as Error. No-op if absent or already terminal.
    ///
    /// The reason is logged, not stored.
    pub fn mark_error(&self, id: StreamId, reason: &str) {
        let mut inner = self.lock();
        if let Some(record) = inner.records.get_mut(&id) {
            if record.state.is_terminal() {
                return;
            }
            record.state = StreamState::Error;
            tracing::debug!("Stream {} ({}) failed: {}", id, record.remote_path, reason);
        }
    }

    /// Move an Open record to Error atomically, for cancellation.
    ///
    /// Returns `false` unless the record existed and was Open.
    pub fn cancel(&self, id: StreamId, reason: &str) -> bool {
        let mut inner = self.lock();
        match inner.records.get_mut(&id) {
            Some(record) if record.state == StreamState::Open => {
                record.state = StreamState::Error;
                tracing::debug!("Stream {} ({}) cancelled: {}", id, record.remote_path, reason);
                true
            }
            _ => false,
        }
    }

    /// Delete a record regardless of state. Returns whether it existed.
    pub fn remove(&self, id: StreamId) -> bool {
        self.lock().records.remove(&id).is_some()
    }

    /// Remove every Closed or Error record, returning how many were removed.
    pub fn evict_finished(&self) -> usize {
        let mut inner = self.lock();
        let before = inner.records.len();
        inner.records.retain(|_, r| !r.state.is_terminal());
        before - inner.records.len()
    }

    /// Copy of a record
    #[must_use]
    pub fn get(&self, id: StreamId) -> Option<StreamRecord> {
        self.lock().records.get(&id).cloned()
    }

    /// State of a record
    #[must_use]
    pub fn state(&self, id: StreamId) -> Option<StreamState> {
        self.lock().records.get(&id).map(|r| r.state)
    }

    /// Ids of Open records
    #[must_use]
    pub fn active_ids(&self) -> Vec<StreamId> {
        self.lock()
            .records
            .values()
            .filter(|r| r.state == StreamState::Open)
            .map(|r| r.id)
            .collect()
    }

    /// Ids of Open records with the given priority
    #[must_use]
    pub fn ids_by_priority(&self, priority: i32) -> Vec<StreamId> {
        self.lock()
            .records
            .values()
            .filter(|r| r.state == StreamState::Open && r.priority == priority)
            .map(|r| r.id)
            .collect()
    }

    /// Sum of bytes transferred over Open records
    #[must_use]
    pub fn total_active_bytes(&self) -> u64 {
        self.lock()
            .records
            .values()
            .filter(|r| r.state == StreamState::Open)
            .map(|r| r.bytes_transferred)
            .sum()
    }

    /// Sum of bytes transferred over all records
    #[must_use]
    pub fn total_bytes_transferred(&self) -> u64 {
        self.lock()
            .records
            .values()
            .map(|r| r.bytes_transferred)
            .sum()
    }

    /// Mean average speed over records with a positive speed, or 0
    #[must_use]
    pub fn average_speed_across_streams(&self) -> f64 {
        let inner = self.lock();
        let (sum, count) = inner
            .records
            .values()
            .filter(|r| r.average_speed > 0.0)
            .fold((0.0, 0usize), |(sum, n), r| (sum + r.average_speed, n + 1));
        if count == 0 { 0.0 } else { sum / count as f64 }
    }

    /// Copies of all records, ordered by id
    #[must_use]
    pub fn snapshot(&self) -> Vec<StreamRecord> {
        self.lock().records.values().cloned().collect()
    }

    /// Number of records held
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    /// Whether the registry holds no records
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
