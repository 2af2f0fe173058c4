//! Fuzz target for command headers and status lines
//!
//! Tests that header and status parsing handle arbitrary input without panicking.

#![no_main]

use libfuzzer_sys::fuzz_target;
use quicftp_core::{Command, LineAccumulator, LineStatus, Status};

fuzz_target!(|data: &[u8]| {
    if let Some(command) = Command::parse(data) {
        if let Ok(encoded) = command.encode() {
            assert_eq!(Command::parse(&encoded[..encoded.len() - 1]), Some(command));
        }
    }

    let _ = Status::parse(data);

    let mut acc = LineAccumulator::new(64);
    for piece in data.chunks(7) {
        if let LineStatus::Complete { line, .. } = acc.push(piece) {
            assert!(line.len() <= 64);
            assert!(!line.contains(&b'\n'));
        }
    }
});
