//! Client-side transfer orchestration.
//!
//! # Stream Flow
//!
//! ```text
//! Client                                Server
//!   |-- UPLOAD path\n + chunks + FIN ---->|
//!   |<--------------- OK <written>\n FIN -|
//!   |                                     |
//!   |-- DOWNLOAD path\n + FIN ----------->|
//!   |<----- OK <size>\n + chunks + FIN ---|
//! ```
//!
//! A background task routes incoming frames to the transfer that owns the
//! stream. Stream ids come from the client's [`StreamRegistry`].

use crate::command::{Command, Direction, LineAccumulator, LineStatus, Status};
use crate::config::{ClientConfig, ProgressCallback};
use crate::error::{Result, TransferError};
use crate::stream::{StreamRegistry, StreamState};
use dashmap::DashMap;
use quicftp_files::ChunkReader;
use quicftp_transport::{StreamId, StreamTransport, TransportError};
use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;

/// Reason recorded when a transfer is cancelled through [`Client::cancel`]
pub const CANCELLED_BY_USER: &str = "Cancelled by user";

type Routes = Arc<DashMap<StreamId, mpsc::UnboundedSender<Vec<u8>>>>;

/// One file in a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTransfer {
    /// Local file (source of uploads, destination of downloads)
    pub local: PathBuf,
    /// Remote path on the server
    pub remote: String,
}

impl FileTransfer {
    /// Create a batch entry
    pub fn new(local: impl Into<PathBuf>, remote: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            remote: remote.into(),
        }
    }
}

/// Result of one batch entry
#[derive(Debug, Clone)]
pub struct FileOutcome {
    /// Stream the entry was registered under
    pub stream_id: StreamId,
    /// The entry itself
    pub file: FileTransfer,
    /// Bytes transferred, or why it failed
    pub result: Result<u64>,
}

/// Per-file results of a batch, in submission order
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    /// One outcome per submitted file
    pub outcomes: Vec<FileOutcome>,
}

impl BatchReport {
    /// Whether every file succeeded
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }

    /// Outcomes that failed
    pub fn failures(&self) -> impl Iterator<Item = &FileOutcome> {
        self.outcomes.iter().filter(|o| o.result.is_err())
    }

    /// Bytes moved by successful entries
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().ok())
            .sum()
    }
}

struct ClientInner<T> {
    transport: Arc<T>,
    server: String,
    config: ClientConfig,
    registry: Arc<StreamRegistry>,
    routes: Routes,
    progress: RwLock<Option<ProgressCallback>>,
    authenticated: AtomicBool,
    running: Arc<AtomicBool>,
}

impl<T> Drop for ClientInner<T> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

/// File transfer client bound to one server endpoint.
///
/// Cloning is cheap; clones share the transport, registry and routes.
pub struct Client<T> {
    inner: Arc<ClientInner<T>>,
}

impl<T> Clone for Client<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: StreamTransport + 'static> Client<T> {
    /// Attach to `server` over `transport` and start routing responses.
    ///
    /// # Errors
    /// Returns `TransferError::InvalidConfig` if `config` is invalid.
    pub async fn connect(transport: T, server: impl Into<String>, config: ClientConfig) -> Result<Self> {
        config.validate()?;

        let transport = Arc::new(transport);
        let server = server.into();
        let routes: Routes = Arc::new(DashMap::new());
        let running = Arc::new(AtomicBool::new(true));

        tokio::spawn(receive_loop(
            Arc::clone(&transport),
            server.clone(),
            Arc::clone(&routes),
            Arc::clone(&running),
            config.poll_interval,
        ));

        tracing::info!("Connected to {} as {}", server, transport.local_name());

        let progress = RwLock::new(config.progress.clone());
        Ok(Self {
            inner: Arc::new(ClientInner {
                transport,
                server,
                config,
                registry: Arc::new(StreamRegistry::new()),
                routes,
                progress,
                authenticated: AtomicBool::new(false),
                running,
            }),
        })
    }

    /// Present the client certificate.
    ///
    /// Certificate validation is the transport's job; this only checks that
    /// the file exists.
    ///
    /// # Errors
    /// Returns `TransferError::Auth` if the certificate file is missing.
    pub async fn authenticate(&self, cert_path: impl AsRef<Path>) -> Result<()> {
        let cert_path = cert_path.as_ref();
        if !tokio::fs::try_exists(cert_path).await.unwrap_or(false) {
            tracing::error!("Certificate file not found: {}", cert_path.display());
            return Err(TransferError::Auth(Cow::Owned(format!(
                "certificate file not found: {}",
                cert_path.display()
            ))));
        }
        self.inner.authenticated.store(true, Ordering::Release);
        tracing::info!("Authenticated with {}", cert_path.display());
        Ok(())
    }

    /// Whether the client is authenticated and still connected
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.authenticated.load(Ordering::Acquire)
            && self.inner.running.load(Ordering::Acquire)
            && !self.inner.transport.is_closed()
    }

    /// The registry holding this client's stream records
    #[must_use]
    pub fn registry(&self) -> &StreamRegistry {
        &self.inner.registry
    }

    /// Shared handle to the registry, for observers that outlive a borrow
    #[must_use]
    pub fn shared_registry(&self) -> Arc<StreamRegistry> {
        Arc::clone(&self.inner.registry)
    }

    /// Server endpoint name
    #[must_use]
    pub fn server(&self) -> &str {
        &self.inner.server
    }

    /// Replace the progress callback
    pub fn set_progress_callback(&self, callback: Option<ProgressCallback>) {
        *self
            .inner
            .progress
            .write()
            .unwrap_or_else(PoisonError::into_inner) = callback;
    }

    /// Upload one local file to `remote`.
    ///
    /// # Errors
    /// Returns `TransferError::NotFound` if the local file is missing, and
    /// any transport, remote or cancellation error from the transfer. The
    /// stream record is marked Error in every failure case.
    pub async fn upload_file(&self, local: impl AsRef<Path>, remote: &str) -> Result<u64> {
        self.ensure_ready()?;
        let local = local.as_ref();
        let size = local_file_size(local).await?;

        let id = self
            .inner
            .registry
            .create(remote, size, self.inner.config.priority, Direction::Upload);
        let result = self.run_upload(id, local, remote, size).await;
        self.settle(id, result)
    }

    /// Download `remote` into a local file.
    ///
    /// The file is written next to `local` under a temporary name and moved
    /// into place once every announced byte has arrived.
    ///
    /// # Errors
    /// Returns `TransferError::Remote` if the server rejects the request, and
    /// any transport, I/O or cancellation error from the transfer.
    pub async fn download_file(&self, remote: &str, local: impl AsRef<Path>) -> Result<u64> {
        self.ensure_ready()?;
        let id = self
            .inner
            .registry
            .create(remote, 0, self.inner.config.priority, Direction::Download);
        let result = self.run_download(id, remote, local.as_ref()).await;
        self.settle(id, result)
    }

    /// Upload many files with bounded concurrency.
    ///
    /// Every entry is registered before any transfer starts. A failing entry
    /// is marked Error and does not stop its siblings.
    ///
    /// # Errors
    /// Fails only if the client is not ready; per-file errors are in the report.
    pub async fn upload_files(&self, files: Vec<FileTransfer>) -> Result<BatchReport> {
        self.ensure_ready()?;
        Ok(self.run_batch(Direction::Upload, files).await)
    }

    /// Download many files with bounded concurrency.
    ///
    /// # Errors
    /// Fails only if the client is not ready; per-file errors are in the report.
    pub async fn download_files(&self, files: Vec<FileTransfer>) -> Result<BatchReport> {
        self.ensure_ready()?;
        Ok(self.run_batch(Direction::Download, files).await)
    }

    /// Cancel an Open transfer.
    ///
    /// Marks the record Error with reason "Cancelled by user" and resets the
    /// stream, so the server discards whatever it buffered for it. Returns
    /// `false` if the record is unknown or not Open.
    pub async fn cancel(&self, stream_id: StreamId) -> bool {
        if !self.inner.registry.cancel(stream_id, CANCELLED_BY_USER) {
            return false;
        }
        if let Err(e) = self
            .inner
            .transport
            .reset(&self.inner.server, stream_id)
            .await
        {
            tracing::warn!("Failed to reset cancelled stream {}: {}", stream_id, e);
        }
        self.inner.routes.remove(&stream_id);
        tracing::info!("Cancelled stream {}", stream_id);
        true
    }

    /// Stop routing responses and close the transport.
    ///
    /// # Errors
    /// Returns the transport's close error.
    pub async fn disconnect(&self) -> Result<()> {
        self.inner.running.store(false, Ordering::Release);
        self.inner.authenticated.store(false, Ordering::Release);
        self.inner.routes.clear();
        self.inner.transport.close().await?;
        tracing::info!("Disconnected from {}", self.inner.server);
        Ok(())
    }

    fn ensure_ready(&self) -> Result<()> {
        if !self.inner.authenticated.load(Ordering::Acquire) {
            return Err(TransferError::Auth(Cow::Borrowed("not authenticated")));
        }
        if !self.inner.running.load(Ordering::Acquire) || self.inner.transport.is_closed() {
            return Err(TransferError::invalid_state("client is disconnected"));
        }
        Ok(())
    }

    fn settle(&self, id: StreamId, result: Result<u64>) -> Result<u64> {
        match &result {
            Ok(bytes) => {
                self.inner.registry.complete(id);
                tracing::debug!("Stream {} finished: {} bytes", id, bytes);
            }
            Err(e) => self.inner.registry.mark_error(id, &e.to_string()),
        }
        result
    }

    async fn run_batch(&self, direction: Direction, files: Vec<FileTransfer>) -> BatchReport {
        let registry = &self.inner.registry;
        let mut ids = Vec::with_capacity(files.len());
        for file in &files {
            let size = match direction {
                Direction::Upload => tokio::fs::metadata(&file.local)
                    .await
                    .map(|m| m.len())
                    .unwrap_or(0),
                Direction::Download => 0,
            };
            ids.push(registry.register(&file.remote, size, self.inner.config.priority, direction));
        }

        let semaphore = Arc::new(Semaphore::new(self.inner.config.max_concurrent));
        let mut tasks = JoinSet::new();
        for (index, (id, file)) in ids.iter().copied().zip(files.iter().cloned()).enumerate() {
            let client = self.clone();
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => client.run_registered(direction, id, &file).await,
                    Err(_) => Err(TransferError::invalid_state("batch aborted")),
                };
                (index, result)
            });
        }

        let mut results: Vec<Option<Result<u64>>> = vec![None; files.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(e) => tracing::error!("Batch task failed: {}", e),
            }
        }

        let outcomes = ids
            .into_iter()
            .zip(files)
            .zip(results)
            .map(|((stream_id, file), result)| {
                let result = result.unwrap_or_else(|| {
                    registry.mark_error(stream_id, "transfer task aborted");
                    Err(TransferError::invalid_state("transfer task aborted"))
                });
                FileOutcome {
                    stream_id,
                    file,
                    result,
                }
            })
            .collect();
        BatchReport { outcomes }
    }

    async fn run_registered(&self, direction: Direction, id: StreamId, file: &FileTransfer) -> Result<u64> {
        if !self.inner.registry.open(id) {
            return Err(TransferError::invalid_state("stream is no longer idle"));
        }
        let result = match direction {
            Direction::Upload => match local_file_size(&file.local).await {
                Ok(total) => {
                    self.inner.registry.set_total_bytes(id, total);
                    self.run_upload(id, &file.local, &file.remote, total).await
                }
                Err(e) => Err(e),
            },
            Direction::Download => self.run_download(id, &file.remote, &file.local).await,
        };
        if let Err(e) = &result {
            tracing::warn!("{} {} failed: {}", direction, file.remote, e);
        }
        self.settle(id, result)
    }

    async fn run_upload(&self, id: StreamId, local: &Path, remote: &str, total: u64) -> Result<u64> {
        let header = Command::Upload(remote.to_string()).encode()?;
        let file = tokio::fs::File::open(local)
            .await
            .map_err(|e| TransferError::Io(format!("{}: {e}", local.display())))?;
        let mut reader = ChunkReader::with_chunk_size(file, self.inner.config.chunk_size);

        let mut rx = self.open_route(id);
        let mut stream_open = false;
        let result = async {
            let transport = &self.inner.transport;
            let server = self.inner.server.as_str();

            transport.send(server, id, &header).await?;
            stream_open = true;
            let mut sent = 0u64;
            while let Some(chunk) = reader
                .next_chunk()
                .await
                .map_err(|e| TransferError::Io(format!("{}: {e}", local.display())))?
            {
                self.check_cancelled(id)?;
                transport.send(server, id, &chunk).await?;
                sent += chunk.len() as u64;
                self.record_progress(id, sent, total);
            }
            self.check_cancelled(id)?;
            transport.finish(server, id).await?;
            stream_open = false;

            if self.inner.config.confirm_uploads {
                match self.read_status(id, &mut rx).await?.0 {
                    Status::Ok(written) if written == sent => {}
                    Status::Ok(written) => {
                        return Err(TransferError::Io(format!(
                            "server stored {written} of {sent} bytes"
                        )));
                    }
                    Status::Err(reason) => return Err(TransferError::Remote(reason)),
                }
            }
            Ok(sent)
        }
        .await;

        // Abort rather than FIN so the server drops the partial upload.
        if stream_open {
            if let Err(e) = self.inner.transport.reset(&self.inner.server, id).await {
                tracing::warn!("Failed to reset stream {}: {}", id, e);
            }
        }
        self.inner.routes.remove(&id);
        result
    }

    async fn run_download(&self, id: StreamId, remote: &str, local: &Path) -> Result<u64> {
        let header = Command::Download(remote.to_string()).encode()?;
        let mut rx = self.open_route(id);
        let result = self.receive_download(id, &header, local, &mut rx).await;
        self.inner.routes.remove(&id);
        result
    }

    async fn receive_download(
        &self,
        id: StreamId,
        header: &[u8],
        local: &Path,
        rx: &mut mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> Result<u64> {
        let transport = &self.inner.transport;
        let server = self.inner.server.as_str();
        transport.send(server, id, header).await?;
        transport.finish(server, id).await?;

        let (status, rest) = self.read_status(id, rx).await?;
        let size = match status {
            Status::Ok(size) => size,
            Status::Err(reason) => return Err(TransferError::Remote(reason)),
        };
        self.inner.registry.set_total_bytes(id, size);

        let dir = match local.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| TransferError::Io(format!("{}: {e}", dir.display())))?;
        let (file, tmp_path) = tempfile::Builder::new()
            .prefix(".quicftp-")
            .suffix(".part")
            .tempfile_in(&dir)
            .map_err(|e| TransferError::Io(format!("{}: {e}", dir.display())))?
            .into_parts();
        let mut file = tokio::fs::File::from_std(file);

        let mut received = 0u64;
        let mut pending = (!rest.is_empty()).then_some(rest);
        loop {
            let chunk = match pending.take() {
                Some(chunk) => chunk,
                None => match self.next_delivery(id, rx).await? {
                    Some(chunk) => chunk,
                    None => break,
                },
            };
            self.check_cancelled(id)?;

            received += chunk.len() as u64;
            if received > size {
                return Err(TransferError::framing("server sent more bytes than announced"));
            }
            file.write_all(&chunk).await?;
            self.record_progress(id, received, size);
        }

        if received != size {
            return Err(TransferError::Io(format!(
                "short download: received {received} of {size} bytes"
            )));
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        tmp_path
            .persist(local)
            .map_err(|e| TransferError::Io(format!("{}: {}", local.display(), e.error)))?;
        Ok(received)
    }

    fn open_route(&self, id: StreamId) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.routes.insert(id, tx);
        rx
    }

    /// Next payload on the stream; `None` at end-of-stream.
    async fn next_delivery(
        &self,
        id: StreamId,
        rx: &mut mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> Result<Option<Vec<u8>>> {
        match tokio::time::timeout(self.inner.config.response_timeout, rx.recv()).await {
            Err(_) => Err(TransferError::timeout("no response from server")),
            Ok(None) => Err(self.closed_reason(id)),
            Ok(Some(payload)) if payload.is_empty() => Ok(None),
            Ok(Some(payload)) => Ok(Some(payload)),
        }
    }

    async fn read_status(
        &self,
        id: StreamId,
        rx: &mut mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> Result<(Status, Vec<u8>)> {
        let mut line = LineAccumulator::default();
        loop {
            let Some(bytes) = self.next_delivery(id, rx).await? else {
                return Err(TransferError::framing("stream ended before status line"));
            };
            match line.push(&bytes) {
                LineStatus::Incomplete => {}
                LineStatus::Overflow => return Err(TransferError::framing("status line too long")),
                LineStatus::Complete { line, rest } => return Ok((Status::parse(&line)?, rest)),
            }
        }
    }

    fn check_cancelled(&self, id: StreamId) -> Result<()> {
        if self.inner.registry.state(id) == Some(StreamState::Error) {
            return Err(TransferError::Cancelled(Cow::Borrowed(CANCELLED_BY_USER)));
        }
        Ok(())
    }

    fn closed_reason(&self, id: StreamId) -> TransferError {
        if self.inner.registry.state(id) == Some(StreamState::Error) {
            TransferError::Cancelled(Cow::Borrowed(CANCELLED_BY_USER))
        } else {
            TransferError::Transport("connection closed".to_string())
        }
    }

    fn record_progress(&self, id: StreamId, bytes: u64, total: u64) {
        self.inner.registry.update_progress(id, bytes);
        let callback = self
            .inner
            .progress
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            callback(id, bytes, total);
        }
    }
}

async fn local_file_size(path: &Path) -> Result<u64> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Ok(meta.len()),
        Ok(_) => Err(TransferError::NotFound(Cow::Owned(format!(
            "not a regular file: {}",
            path.display()
        )))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(TransferError::NotFound(
            Cow::Owned(format!("local file not found: {}", path.display())),
        )),
        Err(e) => Err(TransferError::Io(format!("{}: {e}", path.display()))),
    }
}

async fn receive_loop<T: StreamTransport>(
    transport: Arc<T>,
    server: String,
    routes: Routes,
    running: Arc<AtomicBool>,
    poll_interval: Duration,
) {
    while running.load(Ordering::Acquire) {
        match transport.receive(poll_interval).await {
            Ok(Some(frame)) => {
                if frame.peer != server {
                    tracing::debug!("Ignoring frame from unexpected peer {}", frame.peer);
                    continue;
                }
                if frame.is_reset() {
                    tracing::debug!("Server reset stream {}", frame.stream_id);
                    routes.remove(&frame.stream_id);
                    continue;
                }
                match routes.get(&frame.stream_id) {
                    Some(route) => {
                        let _ = route.send(frame.payload);
                    }
                    None => tracing::debug!(
                        "Dropped {} bytes on unrouted stream {}",
                        frame.payload.len(),
                        frame.stream_id
                    ),
                }
            }
            Ok(None) => {}
            Err(TransportError::Closed) => {
                tracing::debug!("Transport closed, stopping receive loop");
                break;
            }
            Err(e) => {
                tracing::warn!("Receive failed: {}", e);
                tokio::time::sleep(poll_interval).await;
            }
        }
    }
    routes.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use quicftp_transport::MemoryTransport;
    use tempfile::TempDir;

    async fn client_with_cert(dir: &TempDir) -> (Client<MemoryTransport>, MemoryTransport) {
        let (local, remote) = MemoryTransport::pair("client", "server");
        let client = Client::connect(local, "server", ClientConfig::default())
            .await
            .unwrap();
        let cert = dir.path().join("client.crt");
        std::fs::write(&cert, b"cert").unwrap();
        client.authenticate(&cert).await.unwrap();
        (client, remote)
    }

    #[tokio::test]
    async fn test_authenticate_missing_cert() {
        let (local, _remote) = MemoryTransport::pair("client", "server");
        let client = Client::connect(local, "server", ClientConfig::default())
            .await
            .unwrap();
        let err = client.authenticate("/nonexistent/client.crt").await.unwrap_err();
        assert!(matches!(err, TransferError::Auth(_)));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_transfer_requires_authentication() {
        let (local, _remote) = MemoryTransport::pair("client", "server");
        let client = Client::connect(local, "server", ClientConfig::default())
            .await
            .unwrap();
        let err = client.download_file("a.txt", "/tmp/never").await.unwrap_err();
        assert!(matches!(err, TransferError::Auth(_)));
        assert!(client.registry().is_empty());
    }

    #[tokio::test]
    async fn test_upload_missing_local_file() {
        let dir = TempDir::new().unwrap();
        let (client, _remote) = client_with_cert(&dir).await;
        let err = client
            .upload_file(dir.path().join("missing.txt"), "x")
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::NotFound(_)));
        assert!(client.registry().is_empty());
    }

    #[tokio::test]
    async fn test_upload_sends_header_chunks_and_fin() {
        let dir = TempDir::new().unwrap();
        let (local, remote) = MemoryTransport::pair("client", "server");
        let config = ClientConfig {
            confirm_uploads: false,
            chunk_size: 4,
            ..Default::default()
        };
        let client = Client::connect(local, "server", config).await.unwrap();
        let cert = dir.path().join("c.crt");
        std::fs::write(&cert, b"c").unwrap();
        client.authenticate(&cert).await.unwrap();

        let file = dir.path().join("local.txt");
        std::fs::write(&file, b"abcdefghij").unwrap();
        let sent = client.upload_file(&file, "foo/local.txt").await.unwrap();
        assert_eq!(sent, 10);

        let mut payloads = Vec::new();
        while let Some(frame) = remote.receive(Duration::from_millis(20)).await.unwrap() {
            payloads.push(frame.payload);
        }
        assert_eq!(
            payloads,
            vec![
                b"UPLOAD foo/local.txt\n".to_vec(),
                b"abcd".to_vec(),
                b"efgh".to_vec(),
                b"ij".to_vec(),
                Vec::new(),
            ]
        );

        let record = client.registry().get(1).unwrap();
        assert_eq!(record.state, StreamState::Closed);
        assert_eq!(record.bytes_transferred, 10);
    }

    #[tokio::test]
    async fn test_download_rejected_by_server() {
        let dir = TempDir::new().unwrap();
        let (client, remote) = client_with_cert(&dir).await;
        let dest = dir.path().join("out.txt");

        let server = tokio::spawn(async move {
            let header = remote.receive(Duration::from_secs(1)).await.unwrap().unwrap();
            assert_eq!(header.payload, b"DOWNLOAD ../../etc/passwd\n");
            remote
                .send("client", header.stream_id, b"ERR security: path escapes root\n")
                .await
                .unwrap();
            remote.finish("client", header.stream_id).await.unwrap();
            remote
        });

        let err = client
            .download_file("../../etc/passwd", &dest)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Security);
        assert!(!dest.exists());
        assert_eq!(client.registry().state(1), Some(StreamState::Error));
        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn test_download_short_payload_fails() {
        let dir = TempDir::new().unwrap();
        let (client, remote) = client_with_cert(&dir).await;
        let dest = dir.path().join("out.bin");

        let server = tokio::spawn(async move {
            let header = remote.receive(Duration::from_secs(1)).await.unwrap().unwrap();
            remote.send("client", header.stream_id, b"OK 10\nabc").await.unwrap();
            remote.finish("client", header.stream_id).await.unwrap();
            remote
        });

        let err = client.download_file("f.bin", &dest).await.unwrap_err();
        assert!(matches!(err, TransferError::Io(_)));
        assert!(!dest.exists());
        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_open_stream() {
        let dir = TempDir::new().unwrap();
        let (client, remote) = client_with_cert(&dir).await;

        let id = client.registry().create("big.bin", 100, 0, Direction::Upload);
        assert!(client.cancel(id).await);
        assert_eq!(client.registry().state(id), Some(StreamState::Error));
        assert!(!client.cancel(id).await);

        let reset = remote.receive(Duration::from_millis(100)).await.unwrap().unwrap();
        assert!(reset.is_reset());
        assert!(!reset.is_fin());
        assert_eq!(reset.stream_id, id);
    }

    #[tokio::test]
    async fn test_failed_upload_resets_stream() {
        let dir = TempDir::new().unwrap();
        let (client, remote) = client_with_cert(&dir).await;

        // Opening a directory succeeds but reading it fails after the header.
        let id = client.registry().create("dir.bin", 0, 0, Direction::Upload);
        let err = client
            .run_upload(id, dir.path(), "dir.bin", 0)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Io(_)));

        let header = remote.receive(Duration::from_millis(100)).await.unwrap().unwrap();
        assert_eq!(header.payload, b"UPLOAD dir.bin\n");
        let reset = remote.receive(Duration::from_millis(100)).await.unwrap().unwrap();
        assert!(reset.is_reset());
        assert_eq!(reset.stream_id, id);
        assert!(remote.receive(Duration::from_millis(20)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_batch_upload_missing_file_not_found() {
        let dir = TempDir::new().unwrap();
        let (client, remote) = client_with_cert(&dir).await;

        let report = client
            .upload_files(vec![FileTransfer::new(dir.path().join("gone.txt"), "gone.txt")])
            .await
            .unwrap();
        let err = report.outcomes[0].result.as_ref().unwrap_err();
        assert!(matches!(err, TransferError::NotFound(_)));
        assert_eq!(
            client.registry().state(report.outcomes[0].stream_id),
            Some(StreamState::Error)
        );
        assert!(remote.receive(Duration::from_millis(20)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancel_unknown_stream() {
        let dir = TempDir::new().unwrap();
        let (client, _remote) = client_with_cert(&dir).await;
        assert!(!client.cancel(77).await);
    }

    #[tokio::test]
    async fn test_disconnect() {
        let dir = TempDir::new().unwrap();
        let (client, _remote) = client_with_cert(&dir).await;
        client.disconnect().await.unwrap();
        assert!(!client.is_connected());
        assert!(client.upload_file("x", "y").await.is_err());
    }

    #[test]
    fn test_batch_report() {
        let report = BatchReport {
            outcomes: vec![
                FileOutcome {
                    stream_id: 1,
                    file: FileTransfer::new("a", "a"),
                    result: Ok(5),
                },
                FileOutcome {
                    stream_id: 2,
                    file: FileTransfer::new("b", "b"),
                    result: Err(TransferError::invalid_state("x")),
                },
            ],
        };
        assert!(!report.all_succeeded());
        assert_eq!(report.failures().count(), 1);
        assert_eq!(report.total_bytes(), 5);
        assert!(BatchReport::default().all_succeeded());
    }
}
