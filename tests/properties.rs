//! Property tests for the item lifecycle, progress watermark and the
//! delete-only-after-confirm rule.

mod common;

use common::{
    FakeSink, FakeSource, items, rate_limited, remote, set_aside_files, staged_files, test_config,
    transient,
};
use proptest::prelude::*;
use relaysync::checkpoint::{AggregateProgress, CheckpointSink, PipelineIdentity};
use relaysync::{
    ItemState, MemoryCheckpointSink, Pipeline, RemoteError, ResumeMode, SinkClient, SourceClient,
    SourceItem, TransferItem,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const ALL_STATES: [ItemState; 7] = [
    ItemState::Queued,
    ItemState::Downloading,
    ItemState::Downloaded,
    ItemState::Uploading,
    ItemState::Uploaded,
    ItemState::Cleaned,
    ItemState::Failed,
];

fn transfer_item(position: u64) -> TransferItem {
    TransferItem::new(
        SourceItem {
            position,
            file_name: format!("item-{position}.bin"),
            size: 10,
            locator: None,
        },
        Path::new("/staging"),
    )
}

/// Forward path an item takes, ending in `Cleaned` or in `Failed` at
/// `fail_at` (0 = never).
fn lifecycle(fail_at: usize) -> Vec<ItemState> {
    let happy = [
        ItemState::Downloading,
        ItemState::Downloaded,
        ItemState::Uploading,
        ItemState::Uploaded,
        ItemState::Cleaned,
    ];
    match fail_at {
        0 => happy.to_vec(),
        n => {
            let mut path = happy[..n.min(happy.len()) - 1].to_vec();
            path.push(ItemState::Failed);
            path
        }
    }
}

proptest! {
    #[test]
    fn prop_cleaned_only_reached_from_uploaded(
        steps in proptest::collection::vec(0usize..ALL_STATES.len(), 1..40)
    ) {
        let mut item = transfer_item(1);
        for idx in steps {
            let before = item.state();
            let next = ALL_STATES[idx];
            match item.transition(next) {
                Ok(()) => {
                    prop_assert!(!before.is_terminal());
                    if next == ItemState::Cleaned {
                        prop_assert_eq!(before, ItemState::Uploaded);
                    }
                    prop_assert_eq!(item.state(), next);
                }
                Err(_) => prop_assert_eq!(item.state(), before),
            }
        }
    }

    #[test]
    fn prop_watermark_is_terminal_prefix(
        fail_at in proptest::collection::vec(prop_oneof![Just(0usize), 1usize..=4], 1..12),
        schedule in proptest::collection::vec(any::<prop::sample::Index>(), 0..120),
    ) {
        let progress = AggregateProgress::new(PipelineIdentity::new(1, "prop"));
        let mut entries: Vec<(TransferItem, Vec<ItemState>)> = fail_at
            .iter()
            .enumerate()
            .map(|(i, f)| (transfer_item(i as u64 + 1), lifecycle(*f)))
            .collect();
        for (item, _) in &entries {
            progress.record(item);
        }

        let mut steps = schedule.into_iter();
        loop {
            let pending: Vec<usize> = entries
                .iter()
                .enumerate()
                .filter(|(_, (item, _))| !item.state().is_terminal())
                .map(|(i, _)| i)
                .collect();
            if pending.is_empty() {
                break;
            }
            // Scheduled steps first, then drain in order.
            let pick = match steps.next() {
                Some(ix) => pending[ix.index(pending.len())],
                None => pending[0],
            };
            let (item, path) = &mut entries[pick];
            let next = path.remove(0);
            item.transition(next).unwrap();
            progress.record(item);

            let snapshot = progress.snapshot();
            prop_assert!(snapshot.counters.is_consistent());
            let prefix = entries
                .iter()
                .take_while(|(item, _)| item.state().is_terminal())
                .count() as u64;
            let expected = if prefix == 0 { None } else { Some(prefix) };
            prop_assert_eq!(snapshot.last_processed_position, expected);
        }

        let snapshot = progress.snapshot();
        let failed = fail_at.iter().filter(|f| **f != 0).count() as u64;
        prop_assert_eq!(snapshot.counters.discovered, fail_at.len() as u64);
        prop_assert_eq!(snapshot.counters.failed, failed);
        prop_assert_eq!(snapshot.counters.cleaned, fail_at.len() as u64 - failed);
        prop_assert_eq!(snapshot.in_flight(), 0);
    }
}

#[derive(Debug, Clone)]
enum Script {
    Transient,
    RateLimited,
    Fatal,
}

impl Script {
    fn error(&self) -> RemoteError {
        match self {
            Script::Transient => transient(),
            Script::RateLimited => rate_limited(),
            Script::Fatal => RemoteError::Fatal("rejected".to_string()),
        }
    }
}

fn script() -> impl Strategy<Value = Script> {
    prop_oneof![
        4 => Just(Script::Transient),
        3 => Just(Script::RateLimited),
        1 => Just(Script::Fatal),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn prop_staged_file_removed_iff_every_sink_confirmed(
        upload_scripts in proptest::collection::vec(
            proptest::collection::vec(script(), 0..3), 1..7),
        download_transients in proptest::collection::vec(0usize..=3, 1..7),
    ) {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let count = upload_scripts.len() as u64;

        let outcome = rt.block_on(async {
            let tmp = TempDir::new().unwrap();
            let staging = tmp.path().join("staging");
            let source = Arc::new(FakeSource::new(items(count, 50), &staging));
            let primary = Arc::new(FakeSink::new("primary"));
            let mirror = Arc::new(FakeSink::new("mirror"));

            for (i, errors) in upload_scripts.iter().enumerate() {
                let name = remote(i as u64 + 1);
                // Alternate which sink the script hits.
                let sink = if i % 2 == 0 { &primary } else { &mirror };
                sink.fail_upload(&name, errors.iter().map(Script::error).collect());
            }
            for (i, n) in download_transients.iter().take(count as usize).enumerate() {
                source.fail_download(i as u64 + 1, vec![transient(); *n]);
            }

            let source_client: Arc<dyn SourceClient> = source.clone();
            let sinks = vec![
                primary.clone() as Arc<dyn SinkClient>,
                mirror.clone() as Arc<dyn SinkClient>,
            ];
            let checkpoints: Arc<dyn CheckpointSink> = Arc::new(MemoryCheckpointSink::new());
            let pipeline = Pipeline::new(
                test_config(&staging, 1_000, 2),
                source_client,
                sinks,
                checkpoints,
            )
            .unwrap();
            let summary = tokio::time::timeout(
                Duration::from_secs(30),
                pipeline.run(ResumeMode::Fresh),
            )
            .await
            .expect("run timed out")
            .unwrap();

            let unconfirmed = (1..=count)
                .filter(|p| {
                    let name = remote(*p);
                    primary.upload_count(&name) == 0 || mirror.upload_count(&name) == 0
                })
                .count();
            let resident = staged_files(&staging);
            let set_aside = set_aside_files(&staging);
            let missing = primary.missing_files().len() + mirror.missing_files().len();
            (summary, unconfirmed, resident, set_aside, missing)
        });
        let (summary, unconfirmed, resident, set_aside, missing) = outcome;

        let expected_failed = upload_scripts
            .iter()
            .filter(|errors| errors.iter().any(|e| matches!(e, Script::Fatal)))
            .count();

        prop_assert_eq!(missing, 0);
        prop_assert_eq!(resident, 0);
        prop_assert_eq!(set_aside, unconfirmed);
        prop_assert_eq!(unconfirmed, expected_failed);
        prop_assert_eq!(summary.failed.len(), expected_failed);
        prop_assert_eq!(summary.snapshot.counters.failed, expected_failed as u64);
        prop_assert_eq!(
            summary.snapshot.counters.cleaned + summary.snapshot.counters.failed,
            count
        );
        prop_assert_eq!(summary.snapshot.counters.uploaded, summary.snapshot.counters.cleaned);
        prop_assert_eq!(summary.snapshot.last_processed_position, Some(count));
        prop_assert!(summary.snapshot.counters.is_consistent());
    }
}
