//! Property-based tests for quicftp
//!
//! Uses proptest to verify invariants across large input spaces.

use proptest::prelude::*;

// ============================================================================
// Sandbox Resolution Properties
// ============================================================================

mod sandbox_properties {
    use super::*;
    use quicftp_files::{FileError, Sandbox};
    use tempfile::TempDir;

    fn segment() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("..".to_string()),
            Just(".".to_string()),
            Just(String::new()),
            "[a-z]{1,6}",
            "[a-z ]{1,6}\\.txt",
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Any path that resolves stays inside the root
        #[test]
        fn resolved_paths_stay_in_root(
            segments in prop::collection::vec(segment(), 1..8),
            leading_slash in any::<bool>(),
        ) {
            let dir = TempDir::new().unwrap();
            let sandbox = Sandbox::new(dir.path()).unwrap();

            let mut remote = segments.join("/");
            if leading_slash {
                remote.insert(0, '/');
            }

            if let Ok(resolved) = sandbox.resolve(&remote) {
                prop_assert!(resolved.starts_with(sandbox.root()));
                prop_assert!(sandbox.contains(&resolved));
            }
        }

        /// Existing files resolve to exactly their own path
        #[test]
        fn existing_files_resolve_in_place(
            dirs in prop::collection::vec("[a-z]{1,6}", 0..3),
            name in "[a-z]{1,6}\\.txt",
            contents in prop::collection::vec(any::<u8>(), 0..64),
            leading_slash in any::<bool>(),
        ) {
            let dir = TempDir::new().unwrap();
            let sandbox = Sandbox::new(dir.path()).unwrap();

            let mut relative = dirs.join("/");
            if !relative.is_empty() {
                relative.push('/');
            }
            relative.push_str(&name);
            let expected = sandbox.root().join(&relative);
            std::fs::create_dir_all(expected.parent().unwrap()).unwrap();
            std::fs::write(&expected, &contents).unwrap();

            let remote = if leading_slash { format!("/{relative}") } else { relative };
            let resolved = sandbox.resolve(&remote).unwrap();
            prop_assert_eq!(resolved.as_os_str(), expected.as_os_str());
            let meta = std::fs::metadata(&resolved).unwrap();
            prop_assert!(meta.is_file());
            prop_assert_eq!(meta.len(), contents.len() as u64);
        }

        /// A path that climbs above the root first is always rejected
        #[test]
        fn leading_parent_rejected(
            tail in prop::collection::vec("[a-z]{1,6}", 0..4),
        ) {
            let dir = TempDir::new().unwrap();
            let sandbox = Sandbox::new(dir.path()).unwrap();

            let mut remote = String::from("..");
            for part in &tail {
                remote.push('/');
                remote.push_str(part);
            }

            let result = sandbox.resolve(&remote);
            prop_assert!(matches!(result, Err(FileError::Traversal(_))));
        }
    }
}

// ============================================================================
// Demultiplexer Properties
// ============================================================================

mod demux_properties {
    use super::*;
    use quicftp_core::{CompletionPolicy, Demultiplexer};

    /// Split `bytes` at the given (unsorted, possibly repeated) offsets
    fn fragment(bytes: &[u8], cuts: &[usize]) -> Vec<Vec<u8>> {
        let mut cuts: Vec<usize> = cuts.iter().map(|c| c % (bytes.len() + 1)).collect();
        cuts.push(0);
        cuts.push(bytes.len());
        cuts.sort_unstable();
        cuts.dedup();
        cuts.windows(2).map(|w| bytes[w[0]..w[1]].to_vec()).collect()
    }

    proptest! {
        /// Upload reassembly does not depend on how deliveries are split
        #[test]
        fn upload_invariant_under_fragmentation(
            path in "[a-z]{1,8}(/[a-z]{1,8}){0,2}",
            payload in prop::collection::vec(any::<u8>(), 0..2048),
            cuts in prop::collection::vec(any::<usize>(), 0..12),
        ) {
            let mut stream = format!("UPLOAD {path}\n").into_bytes();
            stream.extend_from_slice(&payload);

            let mut demux = Demultiplexer::new(CompletionPolicy::EndOfStream);
            for piece in fragment(&stream, &cuts) {
                demux.on_stream_data("peer", 7, &piece);
            }
            prop_assert!(demux.drain_completed_uploads().is_empty());

            demux.on_stream_finished("peer", 7);
            let uploads = demux.drain_completed_uploads();
            prop_assert_eq!(uploads.len(), 1);
            prop_assert_eq!(&uploads[0].remote_path, &path);
            prop_assert_eq!(&uploads[0].payload, &payload);
            prop_assert_eq!(demux.pending_streams(), 0);
        }

        /// Bytes that never form a command header produce nothing
        #[test]
        fn garbage_never_classified(
            garbage in "[a-z0-9 ]{1,64}",
        ) {
            let mut demux = Demultiplexer::default();
            demux.on_stream_data("peer", 1, garbage.as_bytes());
            demux.on_stream_finished("peer", 1);
            prop_assert!(demux.drain_completed_uploads().is_empty());
            prop_assert!(demux.take_download_requests().is_empty());
        }
    }
}

// ============================================================================
// Stream Registry Properties
// ============================================================================

mod registry_properties {
    use super::*;
    use quicftp_core::{Direction, StreamRegistry, StreamState};

    #[derive(Debug, Clone)]
    enum Op {
        Progress(u64),
        Complete,
        Error,
        Cancel,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u64..10_000).prop_map(Op::Progress),
            Just(Op::Complete),
            Just(Op::Error),
            Just(Op::Cancel),
        ]
    }

    proptest! {
        /// The first terminal transition wins; later ones change nothing
        #[test]
        fn terminal_state_is_final(ops in prop::collection::vec(op(), 1..20)) {
            let registry = StreamRegistry::new();
            let id = registry.create("p", 10_000, 0, Direction::Download);
            let mut expected: Option<StreamState> = None;
            let mut bytes = 0;

            for op in ops {
                match op {
                    Op::Progress(n) => {
                        let accepted = registry.update_progress(id, n);
                        prop_assert_eq!(accepted, expected.is_none());
                        if accepted {
                            bytes = n;
                        }
                    }
                    Op::Complete => {
                        registry.complete(id);
                        expected.get_or_insert(StreamState::Closed);
                    }
                    Op::Error => {
                        registry.mark_error(id, "failed");
                        expected.get_or_insert(StreamState::Error);
                    }
                    Op::Cancel => {
                        let cancelled = registry.cancel(id, "Cancelled by user");
                        prop_assert_eq!(cancelled, expected.is_none());
                        expected.get_or_insert(StreamState::Error);
                    }
                }
            }

            let record = registry.get(id).unwrap();
            prop_assert_eq!(record.state, expected.unwrap_or(StreamState::Open));
            prop_assert_eq!(record.bytes_transferred, bytes);
        }

        /// Active byte totals only count Open records
        #[test]
        fn active_totals_match_open_records(
            sizes in prop::collection::vec((0u64..1_000_000, any::<bool>()), 0..16),
        ) {
            let registry = StreamRegistry::new();
            let mut expected = 0u64;
            for (size, finish) in &sizes {
                let id = registry.create("f", *size, 0, Direction::Upload);
                registry.update_progress(id, *size);
                if *finish {
                    registry.complete(id);
                } else {
                    expected += *size;
                }
            }
            prop_assert_eq!(registry.total_active_bytes(), expected);
            prop_assert_eq!(
                registry.active_ids().len(),
                sizes.iter().filter(|(_, finish)| !finish).count()
            );
        }
    }
}
