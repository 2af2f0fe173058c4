//! Transfer progress display with progress bars.

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use quicftp_core::{ProgressCallback, StreamId, StreamRegistry};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

const TEMPLATE: &str =
    "{msg:30!} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})";

/// One progress bar per stream, created on the first progress report.
#[derive(Clone)]
pub struct BatchProgress {
    multi: MultiProgress,
    bars: Arc<Mutex<HashMap<StreamId, ProgressBar>>>,
    registry: Arc<StreamRegistry>,
}

impl BatchProgress {
    /// Create a display labelling bars from `registry`.
    ///
    /// With `visible == false` nothing is drawn, so log output stays readable.
    #[must_use]
    pub fn new(registry: Arc<StreamRegistry>, visible: bool) -> Self {
        let target = if visible {
            ProgressDrawTarget::stderr()
        } else {
            ProgressDrawTarget::hidden()
        };
        Self {
            multi: MultiProgress::with_draw_target(target),
            bars: Arc::new(Mutex::new(HashMap::new())),
            registry,
        }
    }

    /// Callback feeding this display, for `Client::set_progress_callback`
    #[must_use]
    pub fn callback(&self) -> ProgressCallback {
        let this = self.clone();
        Arc::new(move |stream_id, bytes, total| this.update(stream_id, bytes, total))
    }

    /// Move the bar of `stream_id` to `bytes` of `total`
    pub fn update(&self, stream_id: StreamId, bytes: u64, total: u64) {
        let mut bars = self.bars.lock().unwrap_or_else(PoisonError::into_inner);
        let bar = bars
            .entry(stream_id)
            .or_insert_with(|| self.add_bar(stream_id, total));
        if total > 0 && bar.length() != Some(total) {
            bar.set_length(total);
        }
        bar.set_position(bytes);
    }

    /// Finish the bar of `stream_id` with a final message
    pub fn finish(&self, stream_id: StreamId, msg: String) {
        let bars = self.bars.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(bar) = bars.get(&stream_id) {
            bar.finish_with_message(msg);
        }
    }

    /// Abandon the bar of `stream_id` (for errors)
    pub fn abandon(&self, stream_id: StreamId, msg: String) {
        let bars = self.bars.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(bar) = bars.get(&stream_id) {
            bar.abandon_with_message(msg);
        }
    }

    fn add_bar(&self, stream_id: StreamId, total: u64) -> ProgressBar {
        let bar = self.multi.add(ProgressBar::new(total));
        bar.set_style(
            ProgressStyle::with_template(TEMPLATE)
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        let label = self
            .registry
            .get(stream_id)
            .map_or_else(|| format!("stream {stream_id}"), |r| r.remote_path);
        bar.set_message(label);
        bar
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quicftp_core::Direction;

    #[test]
    fn test_bars_created_on_first_update() {
        let registry = Arc::new(StreamRegistry::new());
        let id = registry.create("a.txt", 10, 0, Direction::Upload);
        let progress = BatchProgress::new(Arc::clone(&registry), false);

        let callback = progress.callback();
        callback(id, 4, 10);
        callback(id, 10, 10);

        let bars = progress.bars.lock().unwrap();
        let bar = bars.get(&id).unwrap();
        assert_eq!(bar.position(), 10);
        assert_eq!(bar.length(), Some(10));
        assert_eq!(bar.message(), "a.txt");
    }

    #[test]
    fn test_unknown_stream_label() {
        let progress = BatchProgress::new(Arc::new(StreamRegistry::new()), false);
        progress.update(9, 1, 0);
        progress.finish(9, "done".to_string());
        let bars = progress.bars.lock().unwrap();
        assert_eq!(bars.get(&9).unwrap().message(), "done");
    }
}
