//! Cleanup stage.
//!
//! Deletes staged files of uploaded items. A file is only removed once the
//! item is `Uploaded` and every required sink confirmed it.

use super::{mark_failed, sleep_or_cancel, RunLog, RetryPolicy, Stage};
use crate::checkpoint::{AggregateProgress, CleanedNotifier};
use crate::disk::DiskMonitor;
use crate::models::{ItemState, Result, SyncError, TransferItem};
use crate::pipeline::StageReceiver;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Single cleanup task.
pub struct CleanupWorker {
    required_sinks: Vec<String>,
    progress: Arc<AggregateProgress>,
    log: Arc<RunLog>,
    disk: Arc<DiskMonitor>,
    notifier: CleanedNotifier,
    policy: RetryPolicy,
}

impl CleanupWorker {
    pub fn new(
        required_sinks: Vec<String>,
        progress: Arc<AggregateProgress>,
        log: Arc<RunLog>,
        disk: Arc<DiskMonitor>,
        notifier: CleanedNotifier,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            required_sinks,
            progress,
            log,
            disk,
            notifier,
            policy,
        }
    }

    /// Run until the cleanup queue is closed and drained or `cancel` fires.
    pub async fn run(self, input: StageReceiver<TransferItem>, cancel: CancellationToken) {
        let mut cleaned = 0u64;

        while let Some(mut item) = input.dequeue(&cancel).await {
            let ready = item.state() == ItemState::Uploaded
                && item.confirmed_by_all(self.required_sinks.iter().map(String::as_str));
            if !ready {
                error!(
                    position = item.position,
                    state = %item.state(),
                    confirmed = item.confirmed.len(),
                    "Refusing to delete a file that is not confirmed by every sink"
                );
                let kept = item.local_path.clone();
                mark_failed(
                    &mut item,
                    Stage::Cleanup,
                    "not confirmed by every sink",
                    Some(kept),
                    &self.progress,
                    &self.log,
                );
                continue;
            }

            match self.delete(&mut item, &cancel).await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => break,
                Err(e) => {
                    let kept = item.local_path.clone();
                    mark_failed(
                        &mut item,
                        Stage::Cleanup,
                        &e.to_string(),
                        Some(kept),
                        &self.progress,
                        &self.log,
                    );
                    continue;
                }
            }

            if let Err(e) = item.transition(ItemState::Cleaned) {
                error!(position = item.position, error = %e, "Cleanup transition rejected");
                continue;
            }
            self.progress.record(&item);
            self.log.record_completed(&item);
            self.notifier.item_cleaned();
            self.disk.scan_now().await;
            cleaned += 1;

            info!(
                position = item.position,
                file = %item.file_name,
                latency_ms = item.latency_ms().unwrap_or_default(),
                "Cleaned"
            );
        }

        debug!(cleaned, "Cleanup stage finished");
    }

    /// Remove the staged file. A file that is already gone counts as removed.
    async fn delete(&self, item: &mut TransferItem, cancel: &CancellationToken) -> Result<()> {
        loop {
            let err = match tokio::fs::remove_file(&item.local_path).await {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(path = %item.local_path.display(), "Staged file already gone");
                    return Ok(());
                }
                Err(e) => e,
            };

            if item.stage_failures >= self.policy.max_retries {
                return Err(SyncError::io("deleting staged file", err));
            }
            item.note_retry(err.to_string(), true);
            let wait = self.policy.backoff(item.stage_failures);
            warn!(
                path = %item.local_path.display(),
                error = %err,
                wait_ms = wait.as_millis() as u64,
                "Delete failed, retrying"
            );
            if !sleep_or_cancel(wait, cancel).await {
                return Err(SyncError::Cancelled);
            }
        }
    }
}
