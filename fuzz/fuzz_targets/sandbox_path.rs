//! Fuzz target for sandbox path resolution
//!
//! Whatever an untrusted remote path looks like, a successful resolution
//! must land inside the root.

#![no_main]

use libfuzzer_sys::fuzz_target;
use quicftp_files::Sandbox;
use std::sync::OnceLock;
use tempfile::TempDir;

static ROOT: OnceLock<(TempDir, Sandbox)> = OnceLock::new();

fuzz_target!(|data: &[u8]| {
    let Ok(remote) = std::str::from_utf8(data) else {
        return;
    };
    let (_dir, sandbox) = ROOT.get_or_init(|| {
        let dir = TempDir::new().unwrap();
        let sandbox = Sandbox::new(dir.path()).unwrap();
        (dir, sandbox)
    });

    if let Ok(resolved) = sandbox.resolve(remote) {
        assert!(resolved.starts_with(sandbox.root()));
    }
});
