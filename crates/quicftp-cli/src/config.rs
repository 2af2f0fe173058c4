//! Configuration file for the quicftp CLI.

use quicftp_core::{ClientConfig, CompletionPolicy, DEFAULT_PORT, ServerConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// quicftp configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Server settings
    pub server: ServerSection,
    /// Client settings
    pub client: ClientSection,
    /// Transport settings
    pub transport: TransportSection,
    /// Logging settings
    pub logging: LoggingConfig,
}

/// `[server]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Root directory when none is given on the command line
    pub root_dir: PathBuf,
    /// Event loop poll interval in milliseconds
    pub poll_interval_ms: u64,
    /// When uploads count as complete
    pub completion: CompletionPolicy,
    /// Largest accepted upload in bytes
    pub max_upload_size: u64,
    /// Seconds before a silent stream is dropped
    pub stream_idle_timeout_secs: u64,
}

/// `[client]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    /// Client certificate when `--cert` is not given
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert: Option<PathBuf>,
    /// Chunk size in bytes
    pub chunk_size: usize,
    /// Concurrent transfers per batch
    pub max_concurrent: usize,
    /// Seconds to wait for a server response
    pub response_timeout_secs: u64,
    /// Wait for the server to acknowledge uploads
    pub confirm_uploads: bool,
}

/// `[transport]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSection {
    /// Spool directory shared by client and server
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spool_dir: Option<PathBuf>,
    /// Inbox poll interval in milliseconds
    pub poll_interval_ms: u64,
}

/// `[logging]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        let defaults = ServerConfig::default();
        Self {
            root_dir: defaults.root_dir,
            poll_interval_ms: defaults.poll_interval.as_millis() as u64,
            completion: defaults.completion,
            max_upload_size: defaults.max_upload_size,
            stream_idle_timeout_secs: defaults.stream_idle_timeout.as_secs(),
        }
    }
}

impl Default for ClientSection {
    fn default() -> Self {
        let defaults = ClientConfig::default();
        Self {
            cert: None,
            chunk_size: defaults.chunk_size,
            max_concurrent: defaults.max_concurrent,
            response_timeout_secs: defaults.response_timeout.as_secs(),
            confirm_uploads: defaults.confirm_uploads,
        }
    }
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            spool_dir: None,
            poll_interval_ms: 10,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Cannot read config {}: {e}", path.display()))?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("quicftp/config.toml")
    }

    /// Load the default config file if there is one, defaults otherwise
    ///
    /// # Errors
    ///
    /// Returns an error if the default file exists but cannot be parsed.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Spool directory, preferring `cli_override`
    #[must_use]
    pub fn spool_dir(&self, cli_override: Option<PathBuf>) -> PathBuf {
        cli_override
            .or_else(|| self.transport.spool_dir.clone())
            .unwrap_or_else(|| std::env::temp_dir().join("quicftp-spool"))
    }

    /// Transport poll interval
    #[must_use]
    pub fn transport_poll_interval(&self) -> Duration {
        Duration::from_millis(self.transport.poll_interval_ms)
    }

    /// Build the server configuration from command-line values and this file
    #[must_use]
    pub fn server_config(
        &self,
        port: u16,
        cert_path: PathBuf,
        key_path: PathBuf,
        root_dir: Option<PathBuf>,
    ) -> ServerConfig {
        ServerConfig {
            port,
            cert_path,
            key_path,
            root_dir: root_dir.unwrap_or_else(|| self.server.root_dir.clone()),
            poll_interval: Duration::from_millis(self.server.poll_interval_ms),
            completion: self.server.completion,
            max_upload_size: self.server.max_upload_size,
            stream_idle_timeout: Duration::from_secs(self.server.stream_idle_timeout_secs),
            ..ServerConfig::default()
        }
    }

    /// Build the client configuration, with `jobs` overriding the file
    #[must_use]
    pub fn client_config(&self, jobs: Option<usize>) -> ClientConfig {
        ClientConfig {
            chunk_size: self.client.chunk_size,
            max_concurrent: jobs.unwrap_or(self.client.max_concurrent),
            response_timeout: Duration::from_secs(self.client.response_timeout_secs),
            confirm_uploads: self.client.confirm_uploads,
            ..ClientConfig::default()
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        if self.client.chunk_size == 0 || self.client.chunk_size > 16 * 1024 * 1024 {
            anyhow::bail!("Chunk size must be between 1 and 16MB");
        }

        if self.client.max_concurrent == 0 || self.client.max_concurrent > 1000 {
            anyhow::bail!("Max concurrent transfers must be between 1 and 1000");
        }

        if self.client.response_timeout_secs == 0 {
            anyhow::bail!("Response timeout must be at least 1 second");
        }

        if self.server.poll_interval_ms == 0 || self.transport.poll_interval_ms == 0 {
            anyhow::bail!("Poll intervals must be positive");
        }

        Ok(())
    }
}

/// Spool endpoint name for a server given as `host[:port]`.
///
/// # Errors
///
/// Returns an error if the port is not a valid non-zero number.
pub fn server_endpoint(server: &str) -> anyhow::Result<String> {
    let port = match server.rsplit_once(':') {
        Some((host, port)) => {
            if host.is_empty() {
                anyhow::bail!("Server '{server}' has empty hostname");
            }
            port.parse::<u16>()
                .map_err(|_| anyhow::anyhow!("Server '{server}' has invalid port: {port}"))?
        }
        None => DEFAULT_PORT,
    };
    if port == 0 {
        anyhow::bail!("Server '{server}' has invalid port: 0");
    }
    Ok(format!("server-{port}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.client.chunk_size, 64 * 1024);
        assert_eq!(config.client.max_concurrent, 4);
        assert_eq!(config.server.completion, CompletionPolicy::EndOfStream);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        config.logging.level = "debug".to_string();
        config.client.chunk_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [server]
            completion = "first-data"

            [client]
            max_concurrent = 8
            "#,
        )
        .unwrap();
        assert_eq!(config.server.completion, CompletionPolicy::FirstData);
        assert_eq!(config.client.max_concurrent, 8);
        assert_eq!(config.client.chunk_size, 64 * 1024);
        assert_eq!(config.transport.poll_interval_ms, 10);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[transport]\npoll_interval_ms = 25\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.transport.poll_interval_ms, 25);
        assert!(Config::load(dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn test_toml_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(config.client.chunk_size, deserialized.client.chunk_size);
        assert_eq!(config.server.root_dir, deserialized.server.root_dir);
    }

    #[test]
    fn test_cli_overrides() {
        let config = Config::default();
        let server = config.server_config(9000, "a.crt".into(), "a.key".into(), None);
        assert_eq!(server.port, 9000);
        assert_eq!(server.root_dir, PathBuf::from("."));

        let client = config.client_config(Some(2));
        assert_eq!(client.max_concurrent, 2);
        assert_eq!(
            config.spool_dir(Some("/x".into())),
            PathBuf::from("/x")
        );
    }

    #[test]
    fn test_server_endpoint() {
        assert_eq!(server_endpoint("localhost:9000").unwrap(), "server-9000");
        assert_eq!(server_endpoint("localhost").unwrap(), "server-4433");
        assert!(server_endpoint("localhost:0").is_err());
        assert!(server_endpoint("localhost:http").is_err());
        assert!(server_endpoint(":80").is_err());
    }
}
