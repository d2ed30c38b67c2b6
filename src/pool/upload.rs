//! Upload stage.
//!
//! A pool of workers shares the upload queue. Each item is pushed to every
//! configured sink; sinks that already confirmed are skipped on retry, so
//! a retry never re-uploads to a sink that has the file.
//!
//! Sinks receive the position-prefixed staged name rather than the display
//! name. When a sink gives up, the staged file is moved under `failed/`
//! so it stops counting against the disk budget.

use super::{mark_failed, sleep_or_cancel, RunLog, RetryDecision, RetryPolicy, Stage};
use crate::checkpoint::{AggregateProgress, SyncStatus};
use crate::client::{SinkClient, SinkGate};
use crate::disk::DiskMonitor;
use crate::models::{ItemState, RemoteError, Result, SyncError, TransferItem};
use crate::pipeline::{StageReceiver, StageSender};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Upload worker pool.
pub struct UploadPool {
    sinks: Vec<Arc<dyn SinkClient>>,
    gate: Arc<SinkGate>,
    disk: Arc<DiskMonitor>,
    progress: Arc<AggregateProgress>,
    log: Arc<RunLog>,
    policy: RetryPolicy,
    workers: usize,
}

impl UploadPool {
    pub fn new(
        sinks: Vec<Arc<dyn SinkClient>>,
        gate: Arc<SinkGate>,
        disk: Arc<DiskMonitor>,
        progress: Arc<AggregateProgress>,
        log: Arc<RunLog>,
        policy: RetryPolicy,
        workers: usize,
    ) -> Self {
        Self {
            sinks,
            gate,
            disk,
            progress,
            log,
            policy,
            workers: workers.max(1),
        }
    }

    /// Spawn the workers. Each holds a clone of `output`; the cleanup queue
    /// closes when the last worker exits.
    pub fn spawn(
        self: Arc<Self>,
        input: StageReceiver<TransferItem>,
        output: StageSender<TransferItem>,
        cancel: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        (0..self.workers)
            .map(|id| {
                let pool = Arc::clone(&self);
                let input = input.clone();
                let output = output.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { pool.run_worker(id, input, output, cancel).await })
            })
            .collect()
    }

    async fn run_worker(
        &self,
        id: usize,
        input: StageReceiver<TransferItem>,
        output: StageSender<TransferItem>,
        cancel: CancellationToken,
    ) {
        debug!(worker = id, "Upload worker started");

        while let Some(mut item) = input.dequeue(&cancel).await {
            match self.upload_item(&mut item, &cancel).await {
                Ok(true) => {
                    if let Err(e) = output.enqueue(item, &cancel).await {
                        debug!(worker = id, error = %e, "Cleanup queue unavailable");
                        break;
                    }
                }
                Ok(false) => {
                    let reason = item
                        .last_error
                        .clone()
                        .unwrap_or_else(|| "upload failed".to_string());
                    self.fail_item(&mut item, &reason).await;
                }
                Err(e) if e.is_cancelled() => break,
                Err(e) => {
                    error!(worker = id, position = item.position, error = %e, "Upload worker error");
                    self.fail_item(&mut item, &e.to_string()).await;
                }
            }
        }

        debug!(worker = id, "Upload worker finished");
    }

    /// Mark `item` failed and move its staged file out of the budget.
    async fn fail_item(&self, item: &mut TransferItem, reason: &str) {
        let kept = self.set_aside(item).await;
        mark_failed(item, Stage::Upload, reason, kept, &self.progress, &self.log);
        self.disk.scan_now().await;
    }

    /// Move the staged file of `item` under `failed/`.
    ///
    /// Falls back to leaving it in place when the move fails. Returns where
    /// the file ended up, or `None` if there was no file.
    async fn set_aside(&self, item: &mut TransferItem) -> Option<PathBuf> {
        let failed_dir = self.disk.failed_dir();
        let file_name = item.local_path.file_name()?.to_owned();
        let dest = failed_dir.join(file_name);

        let moved = match tokio::fs::create_dir_all(&failed_dir).await {
            Ok(()) => tokio::fs::rename(&item.local_path, &dest).await,
            Err(e) => Err(e),
        };
        match moved {
            Ok(()) => {
                warn!(
                    position = item.position,
                    path = %dest.display(),
                    "Staged file set aside after failed upload"
                );
                item.local_path = dest.clone();
                Some(dest)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(
                    position = item.position,
                    path = %item.local_path.display(),
                    error = %e,
                    "Could not set staged file aside, keeping it in staging"
                );
                Some(item.local_path.clone())
            }
        }
    }

    /// Upload `item` to every sink that has not confirmed it yet.
    ///
    /// Returns `Ok(false)` when a sink gave up on the item.
    async fn upload_item(&self, item: &mut TransferItem, cancel: &CancellationToken) -> Result<bool> {
        for sink in &self.sinks {
            if item.is_confirmed_by(sink.name()) {
                continue;
            }
            if !self.upload_to(item, sink.as_ref(), cancel).await? {
                return Ok(false);
            }
        }

        if item.state() == ItemState::Downloaded {
            item.transition(ItemState::Uploading)?;
        }
        item.transition(ItemState::Uploaded)?;
        self.progress.record(item);
        info!(
            position = item.position,
            file = %item.file_name,
            bytes = item.size,
            sinks = item.confirmed.len(),
            retries = item.retry_count,
            "Uploaded"
        );
        Ok(true)
    }

    /// Upload to one sink until it confirms, gives up, or `cancel` fires.
    async fn upload_to(
        &self,
        item: &mut TransferItem,
        sink: &dyn SinkClient,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let name = sink.name();
        let remote_name = item.remote_name();
        let mut suspended_here = false;

        loop {
            self.gate.wait_ready(name, cancel).await?;
            if suspended_here {
                self.progress
                    .transition_status(SyncStatus::Paused, SyncStatus::Running);
                suspended_here = false;
            }

            if item.state() == ItemState::Downloaded {
                item.transition(ItemState::Uploading)?;
                self.progress.record(item);
            }

            let err = match self
                .policy
                .attempt(sink.upload(&item.local_path, &remote_name))
                .await
            {
                Ok(remote) => {
                    self.gate.record_success(name);
                    debug!(position = item.position, sink = name, id = %remote.id, "Sink confirmed");
                    item.confirm(remote);
                    return Ok(true);
                }
                Err(e) => e,
            };

            match self.policy.decide(Stage::Upload, item, &err) {
                RetryDecision::Retry { after, charged } => {
                    item.note_retry(err.to_string(), charged);
                    warn!(
                        position = item.position,
                        sink = name,
                        attempt = item.retry_count,
                        error = %err,
                        "Upload failed, retrying"
                    );
                    if let RemoteError::RateLimited { retry_after, .. } = &err {
                        // Every worker backs off from this sink, not just us.
                        self.gate.record_rate_limited(name, *retry_after);
                    } else if !sleep_or_cancel(after, cancel).await {
                        return Err(SyncError::Cancelled);
                    }
                }
                RetryDecision::SuspendStage(cooldown) => {
                    item.note_retry(err.to_string(), false);
                    self.gate.suspend_for(cooldown, err.to_string());
                    suspended_here = self
                        .progress
                        .transition_status(SyncStatus::Running, SyncStatus::Paused);
                }
                RetryDecision::AwaitReauth => {
                    item.note_retry(err.to_string(), false);
                    self.gate.require_reauth(err.to_string());
                    self.progress.set_status(SyncStatus::Error);
                }
                RetryDecision::GiveUp => {
                    item.last_error = Some(format!("{name}: {err}"));
                    return Ok(false);
                }
            }

            item.transition(ItemState::Downloaded)?;
        }
    }
}
