//! End-to-end transfer tests.
//!
//! Every test drives a real server loop and client over an in-memory
//! transport pair and checks the files that land on disk.

use quicftp_core::{
    ClientConfig, CompletionPolicy, Direction, ErrorKind, FileTransfer, StreamState, TransferError,
};
use quicftp_integration_tests::{Harness, pattern};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

// ============================================================================
// Uploads
// ============================================================================

#[tokio::test]
async fn test_upload_lands_in_root() {
    let h = Harness::start().await;
    let local = h.write_local("local.txt", b"abc");

    let sent = h.client.upload_file(&local, "foo/local.txt").await.unwrap();
    assert_eq!(sent, 3);
    assert_eq!(std::fs::read(h.root.join("foo/local.txt")).unwrap(), b"abc");

    let record = h.client.registry().get(1).unwrap();
    assert_eq!(record.state, StreamState::Closed);
    assert_eq!(record.direction, Direction::Upload);
    assert_eq!(record.bytes_transferred, 3);

    let server_records = h.server.registry().snapshot();
    assert_eq!(server_records.len(), 1);
    assert_eq!(server_records[0].state, StreamState::Closed);
    assert_eq!(server_records[0].remote_path, "foo/local.txt");

    h.shutdown().await;
}

#[tokio::test]
async fn test_upload_overwrites_existing_file() {
    let h = Harness::start().await;
    h.write_remote("same.txt", b"old contents that are longer");
    let local = h.write_local("same.txt", b"new");

    h.client.upload_file(&local, "same.txt").await.unwrap();
    assert_eq!(std::fs::read(h.root.join("same.txt")).unwrap(), b"new");

    h.shutdown().await;
}

#[tokio::test]
async fn test_upload_traversal_rejected() {
    let h = Harness::start().await;
    let local = h.write_local("evil.txt", b"payload");

    let err = h
        .client
        .upload_file(&local, "../../escaped.txt")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Security);
    assert!(!h.outside_root().join("escaped.txt").exists());
    assert_eq!(h.client.registry().state(1), Some(StreamState::Error));

    h.shutdown().await;
}

#[tokio::test]
async fn test_upload_over_size_limit_rejected() {
    let h = Harness::start_with(|c| c.max_upload_size = 1000, ClientConfig::default()).await;
    let local = h.write_local("big.bin", &pattern(5000));

    let err = h.client.upload_file(&local, "big.bin").await.unwrap_err();
    assert!(matches!(err, TransferError::Remote(_)));
    assert!(!h.root.join("big.bin").exists());

    h.shutdown().await;
}

#[tokio::test]
async fn test_upload_missing_local_file() {
    let h = Harness::start().await;
    let err = h
        .client
        .upload_file(h.local("nope.txt"), "nope.txt")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(h.client.registry().is_empty());

    h.shutdown().await;
}

// ============================================================================
// Downloads
// ============================================================================

#[tokio::test]
async fn test_download_traversal_rejected() {
    let h = Harness::start().await;
    let dest = h.local("passwd");

    let err = h
        .client
        .download_file("../../etc/passwd", &dest)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Security);
    assert!(!dest.exists());

    let records = h.server.registry().snapshot();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].state, StreamState::Error);
    assert_eq!(records[0].bytes_transferred, 0);

    h.shutdown().await;
}

#[tokio::test]
async fn test_download_missing_file() {
    let h = Harness::start().await;
    let dest = h.local("missing.txt");

    let err = h.client.download_file("missing.txt", &dest).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(!dest.exists());

    h.shutdown().await;
}

#[tokio::test]
async fn test_download_directory_is_not_a_file() {
    let h = Harness::start().await;
    std::fs::create_dir_all(h.root.join("subdir")).unwrap();

    let err = h
        .client
        .download_file("subdir", h.local("subdir"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    h.shutdown().await;
}

#[tokio::test]
async fn test_download_creates_destination_directories() {
    let h = Harness::start().await;
    h.write_remote("docs/readme.md", b"# hello");
    let dest = h.local("nested/deeper/readme.md");

    let received = h.client.download_file("/docs/readme.md", &dest).await.unwrap();
    assert_eq!(received, 7);
    assert_eq!(std::fs::read(&dest).unwrap(), b"# hello");

    let record = h.client.registry().get(1).unwrap();
    assert_eq!(record.total_bytes, 7);
    assert_eq!(record.state, StreamState::Closed);

    h.shutdown().await;
}

// ============================================================================
// Round trips across chunk boundaries
// ============================================================================

#[tokio::test]
async fn test_round_trip_sizes() {
    let h = Harness::start().await;
    let chunk = quicftp_files::CHUNK_SIZE;

    for (i, len) in [0, 1, chunk - 1, chunk, chunk + 1, 3 * chunk + 17]
        .into_iter()
        .enumerate()
    {
        let data = pattern(len);
        let name = format!("file-{i}.bin");
        let local = h.write_local(&name, &data);

        let sent = h.client.upload_file(&local, &name).await.unwrap();
        assert_eq!(sent, len as u64);
        assert_eq!(std::fs::read(h.root.join(&name)).unwrap(), data);

        let dest = h.local(&format!("back/{name}"));
        let received = h.client.download_file(&name, &dest).await.unwrap();
        assert_eq!(received, len as u64);
        assert_eq!(std::fs::read(&dest).unwrap(), data, "size {len}");
    }

    h.shutdown().await;
}

#[tokio::test]
async fn test_progress_callback_reaches_total() {
    let h = Harness::start().await;
    let len = 3 * quicftp_files::CHUNK_SIZE + 5;
    let local = h.write_local("progress.bin", &pattern(len));

    let last = Arc::new(AtomicU64::new(0));
    let calls = Arc::new(AtomicU64::new(0));
    {
        let last = Arc::clone(&last);
        let calls = Arc::clone(&calls);
        h.client.set_progress_callback(Some(Arc::new(move |_, bytes, total| {
            assert!(bytes <= total);
            last.store(bytes, Ordering::SeqCst);
            calls.fetch_add(1, Ordering::SeqCst);
        })));
    }

    h.client.upload_file(&local, "progress.bin").await.unwrap();
    assert_eq!(last.load(Ordering::SeqCst), len as u64);
    assert_eq!(calls.load(Ordering::SeqCst), 4);

    h.shutdown().await;
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn test_cancel_marks_error_once() {
    let h = Harness::start().await;

    let id = h
        .client
        .registry()
        .create("large.bin", 10 * 1024 * 1024, 0, Direction::Upload);
    assert!(h.client.cancel(id).await);

    let record = h.client.registry().get(id).unwrap();
    assert_eq!(record.state, StreamState::Error);
    assert!(!h.client.cancel(id).await);
    assert!(h.client.registry().active_ids().is_empty());

    h.shutdown().await;
}

#[tokio::test]
async fn test_cancel_during_upload() {
    let h = Harness::start_with(
        |_| {},
        ClientConfig {
            chunk_size: 1024,
            ..Default::default()
        },
    )
    .await;
    let local = h.write_local("slow.bin", &pattern(256 * 1024));

    // Cancel from inside the progress callback after the first chunk.
    let client = h.client.clone();
    let cancelled = Arc::new(Mutex::new(false));
    {
        let cancelled = Arc::clone(&cancelled);
        h.client.set_progress_callback(Some(Arc::new(move |id, _, _| {
            let mut done = cancelled.lock().unwrap();
            if !*done {
                *done = true;
                assert!(client.registry().cancel(id, "Cancelled by user"));
            }
        })));
    }

    let err = h.client.upload_file(&local, "slow.bin").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(h.client.registry().state(1), Some(StreamState::Error));

    h.client.set_progress_callback(None);
    h.shutdown().await;
}

#[tokio::test]
async fn test_cancel_keeps_existing_remote_file() {
    let h = Harness::start_with(
        |_| {},
        ClientConfig {
            chunk_size: 1024,
            ..Default::default()
        },
    )
    .await;
    let original = h.write_remote("report.bin", b"previous contents");
    let local = h.write_local("report.bin", &pattern(64 * 1024));

    let client = h.client.clone();
    let cancelled = Arc::new(Mutex::new(false));
    {
        let cancelled = Arc::clone(&cancelled);
        h.client.set_progress_callback(Some(Arc::new(move |id, sent, _| {
            let mut done = cancelled.lock().unwrap();
            if !*done && sent >= 4096 {
                *done = true;
                assert!(client.registry().cancel(id, "Cancelled by user"));
            }
        })));
    }

    let err = h.client.upload_file(&local, "report.bin").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    h.client.set_progress_callback(None);

    // The server drops the aborted stream instead of committing it.
    let mut waited = 0;
    while h.server.pending_streams() > 0 && waited < 200 {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        waited += 1;
    }
    assert_eq!(h.server.pending_streams(), 0);
    assert!(h.server.demux_stats().resets >= 1);
    assert_eq!(std::fs::read(&original).unwrap(), b"previous contents");
    assert!(
        h.server
            .registry()
            .snapshot()
            .iter()
            .all(|record| record.remote_path != "report.bin")
    );

    h.shutdown().await;
}

// ============================================================================
// Batches
// ============================================================================

#[tokio::test]
async fn test_batch_upload_isolates_failures() {
    let h = Harness::start_with(
        |_| {},
        ClientConfig {
            max_concurrent: 2,
            ..Default::default()
        },
    )
    .await;
    let a = h.write_local("a.txt", b"alpha");
    let c = h.write_local("c.txt", b"gamma");

    let report = h
        .client
        .upload_files(vec![
            FileTransfer::new(&a, "a.txt"),
            FileTransfer::new(h.local("b.txt"), "b.txt"),
            FileTransfer::new(&c, "c.txt"),
        ])
        .await
        .unwrap();

    assert!(!report.all_succeeded());
    assert_eq!(report.failures().count(), 1);
    assert_eq!(report.outcomes[1].file.remote, "b.txt");
    assert_eq!(
        report.outcomes[1].result.as_ref().unwrap_err().kind(),
        ErrorKind::NotFound
    );
    assert_eq!(report.total_bytes(), 10);

    let registry = h.client.registry();
    assert_eq!(registry.state(report.outcomes[0].stream_id), Some(StreamState::Closed));
    assert_eq!(registry.state(report.outcomes[1].stream_id), Some(StreamState::Error));
    assert_eq!(registry.state(report.outcomes[2].stream_id), Some(StreamState::Closed));

    assert_eq!(std::fs::read(h.root.join("a.txt")).unwrap(), b"alpha");
    assert_eq!(std::fs::read(h.root.join("c.txt")).unwrap(), b"gamma");
    assert!(!h.root.join("b.txt").exists());

    h.shutdown().await;
}

#[tokio::test]
async fn test_batch_download_concurrent() {
    let h = Harness::start_with(
        |_| {},
        ClientConfig {
            max_concurrent: 3,
            ..Default::default()
        },
    )
    .await;

    let mut files = Vec::new();
    for i in 0..8 {
        let data = pattern(10_000 + i * 7_919);
        h.write_remote(&format!("batch/{i}.bin"), &data);
        files.push(FileTransfer::new(
            h.local(&format!("out/{i}.bin")),
            format!("batch/{i}.bin"),
        ));
    }

    let report = h.client.download_files(files.clone()).await.unwrap();
    assert!(report.all_succeeded());
    for (i, file) in files.iter().enumerate() {
        assert_eq!(std::fs::read(&file.local).unwrap(), pattern(10_000 + i * 7_919));
    }
    assert!(h.client.registry().active_ids().is_empty());

    h.shutdown().await;
}

#[tokio::test]
async fn test_empty_batch_succeeds() {
    let h = Harness::start().await;
    let report = h.client.upload_files(Vec::new()).await.unwrap();
    assert!(report.all_succeeded());
    assert!(report.outcomes.is_empty());
    h.shutdown().await;
}

// ============================================================================
// Server behaviour
// ============================================================================

#[tokio::test]
async fn test_first_data_policy_without_confirmation() {
    let h = Harness::start_with(
        |c| c.completion = CompletionPolicy::FirstData,
        ClientConfig {
            confirm_uploads: false,
            ..Default::default()
        },
    )
    .await;
    let local = h.write_local("tiny.txt", b"one chunk");

    h.client.upload_file(&local, "tiny.txt").await.unwrap();

    // The server persists as soon as it sees data; poll until it has.
    let target = h.root.join("tiny.txt");
    for _ in 0..100 {
        if target.exists() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(std::fs::read(&target).unwrap(), b"one chunk");

    h.shutdown().await;
}

#[tokio::test]
async fn test_server_counts_headers() {
    let h = Harness::start().await;
    let local = h.write_local("x.txt", b"x");
    h.client.upload_file(&local, "x.txt").await.unwrap();
    h.client.download_file("x.txt", h.local("x-copy.txt")).await.unwrap();

    let stats = h.server.demux_stats();
    assert_eq!(stats.headers, 2);
    assert_eq!(stats.dropped, 0);
    assert_eq!(h.server.peer_count(), 1);

    h.shutdown().await;
}
