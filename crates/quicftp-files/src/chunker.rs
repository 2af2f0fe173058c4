//! Fixed-size chunked reading.

use crate::CHUNK_SIZE;
use std::io;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Reads a source in fixed-size chunks.
///
/// Every chunk except the last is exactly `chunk_size` bytes, regardless of
/// how the underlying reader splits its reads.
#[derive(Debug)]
pub struct ChunkReader<R> {
    inner: R,
    chunk_size: usize,
    done: bool,
}

impl ChunkReader<tokio::fs::File> {
    /// Open a file for chunked reading with the default chunk size
    ///
    /// # Errors
    /// Returns the error from opening the file
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = tokio::fs::File::open(path).await?;
        Ok(Self::new(file))
    }
}

impl<R: AsyncRead + Unpin> ChunkReader<R> {
    /// Create a reader with the default chunk size
    pub fn new(inner: R) -> Self {
        Self::with_chunk_size(inner, CHUNK_SIZE)
    }

    /// Create a reader with a custom chunk size (minimum 1 byte)
    pub fn with_chunk_size(inner: R, chunk_size: usize) -> Self {
        Self {
            inner,
            chunk_size: chunk_size.max(1),
            done: false,
        }
    }

    /// Get chunk size
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Read the next chunk, or `None` at end of input.
    ///
    /// # Errors
    /// Returns any error from the underlying reader
    pub async fn next_chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
        if self.done {
            return Ok(None);
        }

        let mut chunk = vec![0u8; self.chunk_size];
        let mut filled = 0;
        while filled < chunk.len() {
            let n = self.inner.read(&mut chunk[filled..]).await?;
            if n == 0 {
                self.done = true;
                break;
            }
            filled += n;
        }

        if filled == 0 {
            return Ok(None);
        }
        chunk.truncate(filled);
        Ok(Some(chunk))
    }
}

/// Calculate number of chunks for a file
#[must_use]
pub fn chunk_count(file_size: u64, chunk_size: usize) -> u64 {
    file_size.div_ceil(chunk_size.max(1) as u64)
}
