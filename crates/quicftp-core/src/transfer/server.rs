//! Server-side transfer orchestration.
//!
//! The server pulls frames from the transport, feeds them through the
//! [`Demultiplexer`], persists completed uploads through the [`SecureStore`]
//! and spawns one task per download request.
//!
//! # Transfer Log
//!
//! Every transfer is logged once when it starts and once when it ends:
//!
//! ```text
//! Upload - File: foo/local.txt (3 B) - Starting
//! Upload - File: foo/local.txt (3 B) - Completed - Speed: 1.46 KB/s
//! ```

use crate::command::{Direction, Status};
use crate::config::ServerConfig;
use crate::demux::{DemuxStats, Demultiplexer, DownloadRequest, PendingUpload, RejectedUpload};
use crate::error::{ErrorKind, Result, TransferError};
use crate::stream::StreamRegistry;
use dashmap::DashMap;
use quicftp_files::{SecureStore, TransferStats, format_bytes, format_speed};
use quicftp_transport::{MessageFrame, StreamId, StreamTransport, TransportError};
use std::borrow::Cow;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Frames handled per `process_events` call before dispatching
const MAX_FRAMES_PER_POLL: usize = 1024;

/// How long `stop` waits for in-flight downloads
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// File transfer server over a [`StreamTransport`].
pub struct Server<T> {
    transport: Arc<T>,
    config: ServerConfig,
    store: SecureStore,
    demux: Mutex<Demultiplexer>,
    registry: Arc<StreamRegistry>,
    peers: DashMap<String, Instant>,
    active_downloads: Arc<AtomicUsize>,
    running: AtomicBool,
}

impl<T: StreamTransport + 'static> Server<T> {
    /// Validate `config`, open the sandbox root and start serving on `transport`.
    ///
    /// # Errors
    /// Returns `TransferError::InvalidConfig` for a bad configuration,
    /// `TransferError::Auth` if the certificate or key file is missing, or
    /// `TransferError::Io` if the root directory cannot be created.
    pub async fn start(config: ServerConfig, transport: T) -> Result<Self> {
        config.validate()?;

        for (what, path) in [("Certificate", &config.cert_path), ("Key", &config.key_path)] {
            if !tokio::fs::try_exists(path).await.unwrap_or(false) {
                tracing::error!("{} file not found: {}", what, path.display());
                return Err(TransferError::Auth(Cow::Owned(format!(
                    "{} file not found: {}",
                    what.to_lowercase(),
                    path.display()
                ))));
            }
        }

        let store = SecureStore::open(&config.root_dir)?;
        let demux = Demultiplexer::new(config.completion)
            .with_max_header_len(config.max_header_len)
            .with_max_upload_size(config.max_upload_size);

        tracing::info!("Server starting on port {}", config.port);
        tracing::info!("Certificate: {}", config.cert_path.display());
        tracing::info!("Private key: {}", config.key_path.display());
        tracing::info!("Root directory: {}", store.sandbox().root().display());
        tracing::info!(
            "Listening as {} (completion: {:?})",
            transport.local_name(),
            config.completion
        );

        Ok(Self {
            transport: Arc::new(transport),
            config,
            store,
            demux: Mutex::new(demux),
            registry: Arc::new(StreamRegistry::new()),
            peers: DashMap::new(),
            active_downloads: Arc::new(AtomicUsize::new(0)),
            running: AtomicBool::new(true),
        })
    }

    /// Whether the server accepts events
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Server configuration
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Registry of server-side transfer records
    #[must_use]
    pub fn registry(&self) -> &StreamRegistry {
        &self.registry
    }

    /// Demultiplexer counters
    #[must_use]
    pub fn demux_stats(&self) -> DemuxStats {
        self.lock_demux().stats()
    }

    /// Streams the demultiplexer still holds state for
    #[must_use]
    pub fn pending_streams(&self) -> usize {
        self.lock_demux().pending_streams()
    }

    /// Distinct peers seen since start
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Download tasks still sending
    #[must_use]
    pub fn active_downloads(&self) -> usize {
        self.active_downloads.load(Ordering::Acquire)
    }

    /// Wait up to `timeout` for frames, then handle everything that is ready.
    ///
    /// Completed uploads are persisted and acknowledged before this returns.
    /// Download requests are handed to background tasks. Returns the number
    /// of frames consumed.
    ///
    /// # Errors
    /// Returns `TransferError::InvalidState` after [`Server::stop`], or
    /// `TransferError::Transport` if the transport fails.
    pub async fn process_events(&self, timeout: Duration) -> Result<usize> {
        if !self.is_running() {
            return Err(TransferError::invalid_state("server is not running"));
        }
        let first = self.transport.receive(timeout).await;
        self.handle_received(first).await
    }

    /// Process events until `shutdown` resolves or the transport closes,
    /// then [`stop`](Server::stop).
    ///
    /// # Errors
    /// Returns the error that stopped the loop, other than a closed transport.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let poll = self.config.poll_interval;

        let outcome = loop {
            if !self.is_running() {
                break Ok(());
            }
            // Only the receive is raced against shutdown; dispatch always completes.
            let received = tokio::select! {
                () = &mut shutdown => {
                    tracing::info!("Shutdown requested");
                    break Ok(());
                }
                received = self.transport.receive(poll) => received,
            };
            if matches!(received, Err(TransportError::Closed)) {
                tracing::info!("Transport closed");
                break Ok(());
            }
            match self.handle_received(received).await {
                Ok(_) => {}
                Err(_) if self.transport.is_closed() => {
                    tracing::info!("Transport closed");
                    break Ok(());
                }
                Err(e) => break Err(e),
            }
        };

        self.stop().await;
        outcome
    }

    /// Stop accepting events, let running downloads finish and close the
    /// transport.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }

        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while self.active_downloads() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        if self.active_downloads() > 0 {
            tracing::warn!(
                "Stopping with {} downloads still in flight",
                self.active_downloads()
            );
        }

        if let Err(e) = self.transport.close().await {
            tracing::warn!("Failed to close transport: {}", e);
        }
        tracing::info!("Server stopped");
    }

    async fn handle_received(
        &self,
        first: std::result::Result<Option<MessageFrame>, TransportError>,
    ) -> Result<usize> {
        let mut processed = 0;
        if let Some(frame) = first? {
            self.ingest(frame);
            processed += 1;
        }
        while processed < MAX_FRAMES_PER_POLL && self.transport.has_pending() {
            match self.transport.receive(Duration::ZERO).await? {
                Some(frame) => {
                    self.ingest(frame);
                    processed += 1;
                }
                None => break,
            }
        }

        self.dispatch().await;
        Ok(processed)
    }

    fn ingest(&self, frame: MessageFrame) {
        if self.peers.insert(frame.peer.clone(), Instant::now()).is_none() {
            tracing::info!("[CONNECTION] New peer: {}", frame.peer);
        }

        let mut demux = self.lock_demux();
        if frame.is_reset() {
            demux.on_stream_reset(&frame.peer, frame.stream_id);
        } else if frame.is_fin() {
            demux.on_stream_finished(&frame.peer, frame.stream_id);
        } else {
            demux.on_stream_data(&frame.peer, frame.stream_id, &frame.payload);
        }
    }

    async fn dispatch(&self) {
        let (uploads, downloads, rejected) = {
            let mut demux = self.lock_demux();
            let evicted = demux.evict_idle(Instant::now(), self.config.stream_idle_timeout);
            if evicted > 0 {
                tracing::warn!("[CLEANUP] Dropped {} idle stream(s)", evicted);
            }
            (
                demux.drain_completed_uploads(),
                demux.take_download_requests(),
                demux.take_rejected(),
            )
        };

        for upload in rejected {
            self.reject_upload(upload).await;
        }
        for upload in uploads {
            self.persist_upload(upload).await;
        }
        for request in downloads {
            self.spawn_download(request);
        }
    }

    async fn persist_upload(&self, upload: PendingUpload) {
        let size = upload.payload.len() as u64;
        let id = self
            .registry
            .create(&upload.remote_path, size, 0, Direction::Upload);
        log_transfer(Direction::Upload, &upload.remote_path, size, "Starting");

        let status = match self.store.write_upload(&upload.remote_path, upload.payload).await {
            Ok(stats) => {
                self.registry.update_progress(id, stats.bytes);
                self.registry.complete(id);
                log_completed(Direction::Upload, &upload.remote_path, &stats);
                Status::Ok(stats.bytes)
            }
            Err(e) => {
                let err = TransferError::from(e);
                self.registry.mark_error(id, &err.to_string());
                log_failure(Direction::Upload, &upload.remote_path, &err);
                Status::Err(err.status_reason())
            }
        };

        reply(self.transport.as_ref(), &upload.peer, upload.stream_id, &status).await;
    }

    async fn reject_upload(&self, upload: RejectedUpload) {
        let id = self
            .registry
            .create(&upload.remote_path, upload.received, 0, Direction::Upload);
        let err = TransferError::Io(format!(
            "upload exceeds {} limit",
            format_bytes(self.config.max_upload_size)
        ));
        self.registry.mark_error(id, &err.to_string());
        log_failure(Direction::Upload, &upload.remote_path, &err);
        reply(
            self.transport.as_ref(),
            &upload.peer,
            upload.stream_id,
            &Status::Err(err.status_reason()),
        )
        .await;
    }

    fn spawn_download(&self, request: DownloadRequest) {
        let transport = Arc::clone(&self.transport);
        let store = self.store.clone();
        let registry = Arc::clone(&self.registry);
        let active = Arc::clone(&self.active_downloads);

        active.fetch_add(1, Ordering::AcqRel);
        tokio::spawn(async move {
            serve_download(transport, store, registry, request).await;
            active.fetch_sub(1, Ordering::AcqRel);
        });
    }

    fn lock_demux(&self) -> MutexGuard<'_, Demultiplexer> {
        self.demux.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn serve_download<T: StreamTransport>(
    transport: Arc<T>,
    store: SecureStore,
    registry: Arc<StreamRegistry>,
    request: DownloadRequest,
) {
    let DownloadRequest {
        peer,
        stream_id,
        remote_path,
    } = request;
    let id = registry.create(&remote_path, 0, 0, Direction::Download);

    let source = match store.open_download(&remote_path).await {
        Ok(source) => source,
        Err(e) => {
            let err = TransferError::from(e);
            registry.mark_error(id, &err.to_string());
            log_failure(Direction::Download, &remote_path, &err);
            reply(transport.as_ref(), &peer, stream_id, &Status::Err(err.status_reason())).await;
            return;
        }
    };

    registry.set_total_bytes(id, source.size);
    log_transfer(Direction::Download, &remote_path, source.size, "Starting");

    if let Err(e) = transport
        .send(&peer, stream_id, &Status::Ok(source.size).encode())
        .await
    {
        let err = TransferError::from(e);
        registry.mark_error(id, &err.to_string());
        log_failure(Direction::Download, &remote_path, &err);
        return;
    }

    let mut sent = 0u64;
    let result = store
        .stream_download(&source, |chunk| {
            sent += chunk.len() as u64;
            let progress = sent;
            let transport = Arc::clone(&transport);
            let registry = Arc::clone(&registry);
            let peer = peer.clone();
            async move {
                match transport.send(&peer, stream_id, &chunk).await {
                    Ok(()) => {
                        registry.update_progress(id, progress);
                        true
                    }
                    Err(e) => {
                        tracing::warn!("Download send to {} failed: {}", peer, e);
                        false
                    }
                }
            }
        })
        .await;

    if let Err(e) = transport.finish(&peer, stream_id).await {
        tracing::debug!("Failed to finish stream {} for {}: {}", stream_id, peer, e);
    }

    match result {
        Ok(stats) => {
            registry.complete(id);
            log_completed(Direction::Download, &remote_path, &stats);
        }
        Err(e) => {
            let err = TransferError::from(e);
            registry.mark_error(id, &err.to_string());
            log_failure(Direction::Download, &remote_path, &err);
        }
    }
}

/// Send a status line and close the stream.
async fn reply<T: StreamTransport + ?Sized>(
    transport: &T,
    peer: &str,
    stream_id: StreamId,
    status: &Status,
) {
    let result = match transport.send(peer, stream_id, &status.encode()).await {
        Ok(()) => transport.finish(peer, stream_id).await,
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        tracing::warn!("Failed to answer stream {} of {}: {}", stream_id, peer, e);
    }
}

fn operation(direction: Direction) -> &'static str {
    match direction {
        Direction::Upload => "Upload",
        Direction::Download => "Download",
    }
}

fn log_transfer(direction: Direction, path: &str, size: u64, status: &str) {
    let operation = operation(direction);
    tracing::info!(
        operation,
        path,
        size,
        status,
        "{} - File: {} ({}) - {}",
        operation,
        path,
        format_bytes(size),
        status
    );
}

fn log_completed(direction: Direction, path: &str, stats: &TransferStats) {
    let operation = operation(direction);
    let speed = format_speed(stats.speed());
    tracing::info!(
        operation,
        path,
        size = stats.bytes,
        status = "Completed",
        speed = %speed,
        "{} - File: {} ({}) - Completed - Speed: {}",
        operation,
        path,
        format_bytes(stats.bytes),
        speed
    );
}

fn log_failure(direction: Direction, path: &str, err: &TransferError) {
    match err.kind() {
        ErrorKind::Security => tracing::warn!(
            "{} rejected: path traversal attempt - File: {} - {}",
            operation(direction),
            path,
            err
        ),
        _ => tracing::warn!("{} failed: {} - File: {}", operation(direction), err, path),
    }
}
