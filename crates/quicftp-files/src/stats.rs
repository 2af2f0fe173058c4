//! Transfer statistics and size formatting.

use std::time::Duration;

/// Outcome of a completed file read or write.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TransferStats {
    /// Bytes moved
    pub bytes: u64,
    /// Wall time spent
    pub elapsed: Duration,
}

impl TransferStats {
    /// Create statistics from a byte count and elapsed time
    #[must_use]
    pub fn new(bytes: u64, elapsed: Duration) -> Self {
        Self { bytes, elapsed }
    }

    /// Throughput in bytes per second (0 when no time elapsed)
    #[must_use]
    pub fn speed(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.bytes as f64 / secs
        } else {
            0.0
        }
    }
}

/// Format a byte count as a human-readable size (`1.50 KB`).
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }

    format!("{size:.2} {}", UNITS[unit])
}

/// Format a throughput in bytes per second (`2.00 MB/s`).
#[must_use]
pub fn format_speed(bytes_per_sec: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_sec.max(0.0) as u64))
}
