//! Fuzz target for the spool frame decoder
//!
//! Arbitrary queue contents must decode or fail, never panic, and the
//! decoder must stay usable after an error.

#![no_main]

use libfuzzer_sys::fuzz_target;
use quicftp_transport::{FrameDecoder, encode_frame};

fuzz_target!(|data: &[u8]| {
    let mut decoder = FrameDecoder::new();
    let split = data.first().map_or(0, |b| *b as usize % (data.len() + 1));
    decoder.extend(&data[..split]);
    decoder.extend(&data[split..]);

    while let Ok(Some(frame)) = decoder.next_frame() {
        // Whatever decodes must encode back to something decodable.
        if let Ok(bytes) = encode_frame(&frame) {
            let mut again = FrameDecoder::new();
            again.extend(&bytes);
            assert_eq!(again.next_frame().ok().flatten(), Some(frame));
        }
    }
});
