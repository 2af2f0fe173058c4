//! Sandboxed upload writes and chunked download reads.
//!
//! Uploads are written to a temporary file in the destination directory and
//! renamed into place, so an interrupted write never leaves a truncated file
//! at the final path. Concurrent uploads to one path resolve as last writer
//! wins.

use crate::chunker::ChunkReader;
use crate::error::FileError;
use crate::sandbox::Sandbox;
use crate::stats::TransferStats;
use crate::CHUNK_SIZE;
use std::future::Future;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

/// A resolved, readable file ready to be streamed to a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadSource {
    /// Absolute path inside the sandbox
    pub path: PathBuf,
    /// File size at the time it was opened
    pub size: u64,
}

/// File access confined to a [`Sandbox`].
#[derive(Debug, Clone)]
pub struct SecureStore {
    sandbox: Sandbox,
    chunk_size: usize,
}

impl SecureStore {
    /// Create a store over `sandbox` with the default chunk size
    #[must_use]
    pub fn new(sandbox: Sandbox) -> Self {
        Self {
            sandbox,
            chunk_size: CHUNK_SIZE,
        }
    }

    /// Open a sandbox at `root` and wrap it in a store
    ///
    /// # Errors
    /// Returns `FileError::InvalidRoot` if the root is unusable
    pub fn open(root: impl AsRef<Path>) -> Result<Self, FileError> {
        Ok(Self::new(Sandbox::new(root)?))
    }

    /// Override the download chunk size
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// The sandbox this store is confined to
    #[must_use]
    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    /// Persist an uploaded payload at `remote_path`.
    ///
    /// Parent directories are created as needed. The payload is written to a
    /// temporary file beside the target and atomically renamed over it.
    ///
    /// # Errors
    /// Returns a sandbox error if the path is rejected (nothing is written),
    /// or `FileError::Io` if any filesystem step fails.
    pub async fn write_upload(
        &self,
        remote_path: &str,
        bytes: Vec<u8>,
    ) -> Result<TransferStats, FileError> {
        let sandbox = self.sandbox.clone();
        let remote = remote_path.to_string();
        let start = Instant::now();

        let (target, written) = blocking(move || {
            let target = sandbox.resolve(&remote)?;
            let parent = target
                .parent()
                .ok_or_else(|| FileError::InvalidPath(remote.clone()))?;
            std::fs::create_dir_all(parent).map_err(|e| FileError::io(parent, e))?;

            // The directory chain may have changed since resolution.
            let real_parent = parent
                .canonicalize()
                .map_err(|e| FileError::io(parent, e))?;
            if !sandbox.contains(&real_parent) {
                return Err(FileError::Traversal(remote));
            }

            let mut tmp = tempfile::Builder::new()
                .prefix(".quicftp-")
                .suffix(".part")
                .tempfile_in(&real_parent)
                .map_err(|e| FileError::io(&real_parent, e))?;
            tmp.write_all(&bytes)
                .and_then(|()| tmp.as_file().sync_all())
                .map_err(|e| FileError::io(tmp.path(), e))?;
            tmp.persist(&target)
                .map_err(|e| FileError::io(&target, e.error))?;
            Ok((target, bytes.len() as u64))
        })
        .await?;

        let stats = TransferStats::new(written, start.elapsed());
        tracing::debug!("Wrote {} bytes to {}", written, target.display());
        Ok(stats)
    }

    /// Resolve `remote_path` and check it names a readable regular file.
    ///
    /// # Errors
    /// Returns a sandbox error, `FileError::NotFound` if the file is missing,
    /// or `FileError::NotAFile` if the path is a directory or special file.
    pub async fn open_download(&self, remote_path: &str) -> Result<DownloadSource, FileError> {
        let sandbox = self.sandbox.clone();
        let remote = remote_path.to_string();
        blocking(move || {
            let path = sandbox.resolve(&remote)?;
            let meta = match std::fs::metadata(&path) {
                Ok(meta) => meta,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Err(FileError::NotFound(remote));
                }
                Err(e) => return Err(FileError::io(&path, e)),
            };
            if !meta.is_file() {
                return Err(FileError::NotAFile(remote));
            }
            Ok(DownloadSource {
                path,
                size: meta.len(),
            })
        })
        .await
    }

    /// Stream an opened file to `sink` in fixed-size chunks.
    ///
    /// The sink returns `false` to stop; bytes already handed over stay sent.
    ///
    /// # Errors
    /// Returns `FileError::Aborted` if the sink stops the transfer, or
    /// `FileError::Io` if reading fails.
    pub async fn stream_download<F, Fut>(
        &self,
        source: &DownloadSource,
        mut sink: F,
    ) -> Result<TransferStats, FileError>
    where
        F: FnMut(Vec<u8>) -> Fut,
        Fut: Future<Output = bool>,
    {
        let start = Instant::now();
        let file = tokio::fs::File::open(&source.path)
            .await
            .map_err(|e| FileError::io(&source.path, e))?;
        let mut reader = ChunkReader::with_chunk_size(file, self.chunk_size);

        let mut sent = 0u64;
        while let Some(chunk) = reader
            .next_chunk()
            .await
            .map_err(|e| FileError::io(&source.path, e))?
        {
            let len = chunk.len() as u64;
            if !sink(chunk).await {
                return Err(FileError::Aborted { sent });
            }
            sent += len;
        }

        Ok(TransferStats::new(sent, start.elapsed()))
    }

    /// Resolve `remote_path` and stream it to `sink`.
    ///
    /// # Errors
    /// See [`SecureStore::open_download`] and [`SecureStore::stream_download`].
    pub async fn read_for_download<F, Fut>(
        &self,
        remote_path: &str,
        sink: F,
    ) -> Result<TransferStats, FileError>
    where
        F: FnMut(Vec<u8>) -> Fut,
        Fut: Future<Output = bool>,
    {
        let source = self.open_download(remote_path).await?;
        self.stream_download(&source, sink).await
    }
}

async fn blocking<T, F>(f: F) -> Result<T, FileError>
where
    F: FnOnce() -> Result<T, FileError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| FileError::io(PathBuf::new(), io::Error::other(e)))?
}
