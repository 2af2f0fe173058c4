//! Server and client configuration

use crate::demux::CompletionPolicy;
use crate::error::{Result, TransferError};
use std::borrow::Cow;
use std::path::PathBuf;
use std::time::Duration;

/// Default server port
pub const DEFAULT_PORT: u16 = 4433;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port the server is reachable on
    pub port: u16,

    /// TLS certificate presented to clients
    pub cert_path: PathBuf,

    /// Private key for `cert_path`
    pub key_path: PathBuf,

    /// Directory all remote paths are confined to
    pub root_dir: PathBuf,

    /// Upper bound on one transport poll
    pub poll_interval: Duration,

    /// When uploads count as complete
    pub completion: CompletionPolicy,

    /// Longest accepted command header
    pub max_header_len: usize,

    /// Largest upload buffered in memory
    pub max_upload_size: u64,

    /// Streams without a delivery for this long are dropped
    pub stream_idle_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            cert_path: PathBuf::from("server.crt"),
            key_path: PathBuf::from("server.key"),
            root_dir: PathBuf::from("."),
            poll_interval: Duration::from_millis(100),
            completion: CompletionPolicy::EndOfStream,
            max_header_len: crate::command::MAX_HEADER_LEN,
            max_upload_size: 1024 * 1024 * 1024,
            stream_idle_timeout: Duration::from_secs(300),
        }
    }
}

impl ServerConfig {
    /// Check values that would make the server unusable
    ///
    /// # Errors
    /// Returns `TransferError::InvalidConfig` describing the first problem.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(invalid("port must be between 1 and 65535"));
        }
        if self.poll_interval.is_zero() {
            return Err(invalid("poll interval must be positive"));
        }
        if self.max_header_len < 16 {
            return Err(invalid("max header length must be at least 16 bytes"));
        }
        if self.stream_idle_timeout.is_zero() {
            return Err(invalid("stream idle timeout must be positive"));
        }
        Ok(())
    }
}

/// Progress callback: `(stream id, bytes transferred, total bytes)`
pub type ProgressCallback = std::sync::Arc<dyn Fn(u64, u64, u64) + Send + Sync>;

/// Client configuration
#[derive(Clone)]
pub struct ClientConfig {
    /// Bytes per data send
    pub chunk_size: usize,

    /// Batch transfers running at once
    pub max_concurrent: usize,

    /// Priority recorded on new streams
    pub priority: i32,

    /// Longest wait for the next response frame
    pub response_timeout: Duration,

    /// Upper bound on one transport poll in the receive loop
    pub poll_interval: Duration,

    /// Wait for the server's `OK`/`ERR` after each upload
    pub confirm_uploads: bool,

    /// Invoked after every chunk
    pub progress: Option<ProgressCallback>,
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("chunk_size", &self.chunk_size)
            .field("max_concurrent", &self.max_concurrent)
            .field("priority", &self.priority)
            .field("response_timeout", &self.response_timeout)
            .field("poll_interval", &self.poll_interval)
            .field("confirm_uploads", &self.confirm_uploads)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            chunk_size: quicftp_files::CHUNK_SIZE,
            max_concurrent: 4,
            priority: 0,
            response_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(50),
            confirm_uploads: true,
            progress: None,
        }
    }
}

impl ClientConfig {
    /// Check values that would make the client unusable
    ///
    /// # Errors
    /// Returns `TransferError::InvalidConfig` describing the first problem.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || self.chunk_size > quicftp_transport::MAX_FRAME_PAYLOAD {
            return Err(invalid("chunk size must be between 1 byte and 16 MiB"));
        }
        if self.max_concurrent == 0 {
            return Err(invalid("max concurrent transfers must be at least 1"));
        }
        if self.response_timeout.is_zero() || self.poll_interval.is_zero() {
            return Err(invalid("timeouts must be positive"));
        }
        Ok(())
    }
}

fn invalid(msg: &'static str) -> TransferError {
    TransferError::InvalidConfig(Cow::Borrowed(msg))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_defaults_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.port, 4433);
        assert_eq!(config.completion, CompletionPolicy::EndOfStream);
    }

    #[test]
    fn test_server_rejects_port_zero() {
        let config = ServerConfig {
            port: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(TransferError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_server_rejects_zero_idle_timeout() {
        let config = ServerConfig {
            stream_idle_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_client_defaults_valid() {
        let config = ClientConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.chunk_size, 64 * 1024);
    }

    #[test]
    fn test_client_rejects_zero_workers() {
        let config = ClientConfig {
            max_concurrent: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_client_debug_hides_callback() {
        let config = ClientConfig {
            progress: Some(std::sync::Arc::new(|_, _, _| {})),
            ..Default::default()
        };
        assert!(format!("{config:?}").contains("progress: true"));
    }
}
