//! Download stage.
//!
//! A single driver walks the source in position order. Before each item is
//! downloaded the driver waits until the staging area has room for it, so
//! the disk budget holds even with many small items in flight downstream.

use super::{mark_failed, sleep_or_cancel, RunLog, RetryDecision, RetryPolicy, Stage};
use crate::checkpoint::{AggregateProgress, SyncStatus};
use crate::client::SourceClient;
use crate::disk::DiskMonitor;
use crate::models::{ItemState, RemoteError, Result, SourceItem, SyncError, TransferItem};
use crate::pipeline::StageSender;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pulls items from the source and stages them on local disk.
pub struct DownloadDriver {
    source: Arc<dyn SourceClient>,
    disk: Arc<DiskMonitor>,
    progress: Arc<AggregateProgress>,
    log: Arc<RunLog>,
    policy: RetryPolicy,
    staging_dir: PathBuf,
    /// How long to wait for room before logging again
    space_wait: Duration,
}

impl DownloadDriver {
    pub fn new(
        source: Arc<dyn SourceClient>,
        disk: Arc<DiskMonitor>,
        progress: Arc<AggregateProgress>,
        log: Arc<RunLog>,
        policy: RetryPolicy,
        space_wait: Duration,
    ) -> Self {
        let staging_dir = disk.staging_dir().to_path_buf();
        Self {
            source,
            disk,
            progress,
            log,
            policy,
            staging_dir,
            space_wait,
        }
    }

    /// Enumerate the source strictly after `start_after` until it is
    /// exhausted or `cancel` fires.
    ///
    /// Dropping `out` on return is what closes the upload queue.
    pub async fn run(
        self,
        start_after: Option<u64>,
        out: StageSender<TransferItem>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut cursor = start_after;
        let mut admitted = 0u64;
        info!(after = ?start_after, "Download stage started");

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let next = match self.next_source_item(cursor, &cancel).await {
                Ok(Some(next)) => next,
                Ok(None) => {
                    info!(admitted, "Source exhausted");
                    break;
                }
                Err(e) if e.is_cancelled() => break,
                Err(e) => return Err(e),
            };

            if cursor.is_some_and(|c| next.position <= c) {
                return Err(SyncError::InvalidInput(format!(
                    "source returned position {} after {:?}",
                    next.position, cursor
                )));
            }
            cursor = Some(next.position);

            let item = TransferItem::new(next, &self.staging_dir);
            self.progress.record(&item);
            admitted += 1;

            if !self.wait_for_room(&item, &cancel).await {
                break;
            }

            match self.download_item(item, &out, &cancel).await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => break,
                Err(SyncError::QueueClosed) => {
                    warn!("Upload queue closed, stopping downloads");
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        debug!(admitted, "Download stage finished");
        Ok(())
    }

    async fn next_source_item(
        &self,
        cursor: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<Option<SourceItem>> {
        let mut failures = 0u32;
        loop {
            let err = match self.policy.attempt(self.source.next_item(cursor)).await {
                Ok(next) => return Ok(next),
                Err(e) => e,
            };

            let wait = match &err {
                RemoteError::Transient(_) if failures < self.policy.max_retries => {
                    failures += 1;
                    self.policy.backoff(failures)
                }
                RemoteError::RateLimited { retry_after, .. } => {
                    retry_after.unwrap_or(self.policy.rate_limit_cooldown)
                }
                _ => return Err(err.into()),
            };

            warn!(
                after = ?cursor,
                error = %err,
                wait_ms = wait.as_millis() as u64,
                "Listing source failed, retrying"
            );
            if !sleep_or_cancel(wait, cancel).await {
                return Err(SyncError::Cancelled);
            }
        }
    }

    /// Wait until `item` fits in the disk budget. Returns false on cancel.
    async fn wait_for_room(&self, item: &TransferItem, cancel: &CancellationToken) -> bool {
        let mut paused_here = false;
        if !self.disk.budget().fits(item.size) {
            paused_here = self
                .progress
                .transition_status(SyncStatus::Running, SyncStatus::Paused);
            let budget = self.disk.budget();
            info!(
                position = item.position,
                size = item.size,
                current_bytes = budget.current_bytes,
                max_bytes = budget.max_bytes,
                "Staging area full, waiting for cleanup"
            );
        }

        let admitted = loop {
            match self
                .disk
                .wait_for_room(item.size, self.space_wait, cancel)
                .await
            {
                Ok(()) => break true,
                Err(SyncError::Timeout(_)) => {
                    info!(
                        position = item.position,
                        usage_gb = self.disk.usage_gb(),
                        max_gb = self.disk.max_gb(),
                        "Still waiting for staging space"
                    );
                    self.disk.scan_now().await;
                }
                Err(_) => break false,
            }
        };

        if paused_here {
            self.progress
                .transition_status(SyncStatus::Paused, SyncStatus::Running);
        }
        admitted
    }

    /// Download `item` with retries and hand it to the upload queue.
    ///
    /// A permanent failure marks the item failed and returns `Ok`.
    async fn download_item(
        &self,
        mut item: TransferItem,
        out: &StageSender<TransferItem>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        loop {
            item.transition(ItemState::Downloading)?;
            self.progress.record(&item);

            let descriptor = item.source_item();
            let err = match self
                .policy
                .attempt(self.source.download(&descriptor, &item.local_path))
                .await
            {
                Ok(()) => {
                    item.transition(ItemState::Downloaded)?;
                    self.progress.record(&item);
                    self.disk.scan_now().await;
                    debug!(
                        position = item.position,
                        file = %item.file_name,
                        bytes = item.size,
                        "Downloaded"
                    );
                    return out.enqueue(item, cancel).await;
                }
                Err(e) => e,
            };

            remove_partial(&item.local_path).await;

            match self.policy.decide(Stage::Download, &item, &err) {
                RetryDecision::Retry { after, charged } => {
                    item.note_retry(err.to_string(), charged);
                    item.transition(ItemState::Queued)?;
                    warn!(
                        position = item.position,
                        attempt = item.retry_count,
                        error = %err,
                        wait_ms = after.as_millis() as u64,
                        "Download failed, retrying"
                    );
                    if !sleep_or_cancel(after, cancel).await {
                        return Err(SyncError::Cancelled);
                    }
                }
                _ => {
                    mark_failed(
                        &mut item,
                        Stage::Download,
                        &err.to_string(),
                        None,
                        &self.progress,
                        &self.log,
                    );
                    self.disk.scan_now().await;
                    return Ok(());
                }
            }
        }
    }
}

/// Best-effort removal of a partially written file.
async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed partial download"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Could not remove partial download"),
    }
}
