//! Property-based tests for LANBEAM
//!
//! Uses proptest to verify invariants across large input spaces.

use proptest::prelude::*;

// ============================================================================
// Reassembly Properties
// ============================================================================

mod reassembly_properties {
    use super::*;
    use lanbeam_files::{
        ChannelMessage, ControlFrame, DataFrame, MemorySink, ReceiveEvent, Reassembler,
    };
    use std::sync::Arc;

    fn chunked(data: &[u8], cuts: &[usize]) -> Vec<Vec<u8>> {
        let mut bounds: Vec<usize> = cuts.iter().map(|c| c % (data.len() + 1)).collect();
        bounds.push(0);
        bounds.push(data.len());
        bounds.sort_unstable();
        bounds.dedup();
        bounds.windows(2).map(|w| data[w[0]..w[1]].to_vec()).collect()
    }

    proptest! {
        /// Any chunking of a file reassembles to the same bytes
        #[test]
        fn reassembly_independent_of_chunking(
            data in proptest::collection::vec(any::<u8>(), 0..4096),
            cuts in proptest::collection::vec(any::<usize>(), 0..16),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let sink = MemorySink::new();
            let meta = lanbeam_files::FileMetadata {
                id: "f1".to_string(),
                name: "blob.bin".to_string(),
                size: data.len() as u64,
                mime: "application/octet-stream".to_string(),
            };

            let events = rt.block_on(async {
                let mut rx = Reassembler::new(Arc::new(sink.clone()));
                let mut events = Vec::new();
                let mut msgs = vec![ChannelMessage::Text(ControlFrame::start(&meta).encode().unwrap())];
                for chunk in chunked(&data, &cuts) {
                    msgs.push(ChannelMessage::Binary(DataFrame::new("f1", &chunk).encode().unwrap()));
                }
                msgs.push(ChannelMessage::Text(ControlFrame::end("f1").encode().unwrap()));
                for msg in &msgs {
                    events.extend(rx.handle(msg).await);
                }
                events
            });

            let completed = events
                .iter()
                .any(|e| matches!(e, ReceiveEvent::Completed { received, .. } if *received == data.len() as u64));
            prop_assert!(completed);
            let file = sink.file("f1").unwrap();
            prop_assert!(file.closed);
            prop_assert_eq!(file.data, data);
        }
    }
}

// ============================================================================
// Naming Properties
// ============================================================================

mod naming_properties {
    use super::*;
    use lanbeam_files::sink::sanitize_file_name;
    use lanbeam_signal::names::generate_unique_name;
    use std::collections::HashSet;

    proptest! {
        /// Announced names never escape the download directory
        #[test]
        fn sanitized_names_are_bare(name in ".{0,64}") {
            let clean = sanitize_file_name(&name);
            prop_assert!(!clean.is_empty());
            prop_assert!(!clean.contains('/'));
            prop_assert!(!clean.contains('\\'));
            prop_assert!(!clean.starts_with('.'));
            prop_assert!(!clean.chars().any(char::is_control));
        }

        /// Generated display names avoid every taken name
        #[test]
        fn unique_names_avoid_taken(seed in any::<u64>(), count in 0usize..40) {
            use rand::SeedableRng;
            let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
            let mut taken = HashSet::new();
            for _ in 0..count {
                let name = generate_unique_name(&mut rng, &taken);
                prop_assert!(!taken.contains(&name));
                taken.insert(name);
            }
            prop_assert_eq!(taken.len(), count);
        }
    }
}

// ============================================================================
// Transfer Record Properties
// ============================================================================

mod record_properties {
    use super::*;
    use lanbeam_core::{FileInfo, IncomingTransfer, PeerId};

    fn files(sizes: &[(u8, u32)]) -> Vec<FileInfo> {
        sizes
            .iter()
            .map(|(id, size)| FileInfo {
                id: format!("f{id}"),
                name: format!("f{id}.bin"),
                size: u64::from(*size),
                mime: String::new(),
            })
            .collect()
    }

    proptest! {
        /// Merging never duplicates a file and keeps the size total exact
        #[test]
        fn merge_keeps_totals(
            first in proptest::collection::vec((0u8..16, any::<u32>()), 1..8),
            second in proptest::collection::vec((0u8..16, any::<u32>()), 0..8),
        ) {
            let mut first_files = files(&first);
            let mut seen = std::collections::HashSet::new();
            first_files.retain(|f| seen.insert(f.id.clone()));

            let mut transfer = IncomingTransfer::new(PeerId::from("1-s"), first_files);
            prop_assert!(transfer.merge(files(&second)));

            let mut ids: Vec<&str> = transfer.files.iter().map(|f| f.id.as_str()).collect();
            let before = ids.len();
            ids.sort_unstable();
            ids.dedup();
            prop_assert_eq!(ids.len(), before);
            prop_assert_eq!(transfer.total_size, transfer.files.iter().map(|f| f.size).sum::<u64>());
        }

        /// Progress stays within 0..=100 whatever the peer reports
        #[test]
        fn progress_bounded(
            sizes in proptest::collection::vec((0u8..16, any::<u32>()), 1..8),
            reported in proptest::collection::vec(any::<u32>(), 0..8),
        ) {
            let mut transfer = IncomingTransfer::new(PeerId::from("1-s"), files(&sizes));
            let ids: Vec<String> = transfer.files.iter().map(|f| f.id.clone()).collect();
            for (id, received) in ids.iter().zip(reported) {
                transfer.record(id, u64::from(received) * 2);
            }
            let progress = transfer.progress();
            prop_assert!((0.0..=100.0).contains(&progress));
        }

        /// Send percentage stays within 0..=100
        #[test]
        fn send_percent_bounded(done in any::<u64>(), total in any::<u64>()) {
            let p = lanbeam_files::sender::percent(done, total);
            prop_assert!((0.0..=100.0).contains(&p));
        }
    }
}
