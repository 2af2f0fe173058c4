//! Fuzz target for the demultiplexer
//!
//! Feeds arbitrary deliveries, end-of-stream and reset events across a few
//! streams.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use quicftp_core::{CompletionPolicy, Demultiplexer};

#[derive(Debug, Arbitrary)]
enum Event {
    Data { stream: u8, bytes: Vec<u8> },
    Finish { stream: u8 },
    Reset { stream: u8 },
    Drain,
}

#[derive(Debug, Arbitrary)]
struct Input {
    first_data: bool,
    events: Vec<Event>,
}

fuzz_target!(|input: Input| {
    let policy = if input.first_data {
        CompletionPolicy::FirstData
    } else {
        CompletionPolicy::EndOfStream
    };
    let mut demux = Demultiplexer::new(policy)
        .with_max_header_len(256)
        .with_max_upload_size(4096);

    for event in input.events {
        match event {
            Event::Data { stream, bytes } => {
                demux.on_stream_data("peer", u64::from(stream % 8), &bytes);
            }
            Event::Finish { stream } => demux.on_stream_finished("peer", u64::from(stream % 8)),
            Event::Reset { stream } => demux.on_stream_reset("peer", u64::from(stream % 8)),
            Event::Drain => {
                for upload in demux.drain_completed_uploads() {
                    assert!(upload.payload.len() <= 4096);
                }
                let _ = demux.take_download_requests();
                let _ = demux.take_rejected();
            }
        }
    }
    assert!(demux.pending_streams() <= 8);
});
