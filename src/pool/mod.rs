//! Stage workers.
//!
//! - `DownloadDriver`: single task pulling from the source, gated on disk
//! - `UploadPool`: N workers pushing staged files to every sink
//! - `CleanupWorker`: single task deleting files once all sinks confirmed
//! - `RetryPolicy`: failure classification to retry decisions

mod cleanup;
mod download;
mod retry;
mod upload;

pub use cleanup::*;
pub use download::*;
pub use retry::*;
pub use upload::*;

use crate::checkpoint::AggregateProgress;
use crate::models::{ItemState, TransferItem};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Item that ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedItem {
    pub position: u64,
    pub file_name: String,
    pub stage: Stage,
    pub retry_count: u32,
    pub error: String,
    /// Where the staged file was left, if it was kept
    pub kept_at: Option<PathBuf>,
}

/// Per-item outcomes worth reporting at the end of a run.
#[derive(Debug, Default)]
pub struct RunLog {
    failed: Mutex<Vec<FailedItem>>,
    /// Retry counts of items that completed after retrying
    retried: Mutex<BTreeMap<u64, u32>>,
}

impl RunLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_failure(&self, failed: FailedItem) {
        self.failed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(failed);
    }

    /// Note a cleaned item; only items that needed retries are kept.
    pub fn record_completed(&self, item: &TransferItem) {
        if item.retry_count > 0 {
            self.retried
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(item.position, item.retry_count);
        }
    }

    /// Failed items ordered by position.
    pub fn failed(&self) -> Vec<FailedItem> {
        let mut items = self
            .failed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        items.sort_by_key(|f| f.position);
        items
    }

    pub fn retried(&self) -> BTreeMap<u64, u32> {
        self.retried
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn failure_count(&self) -> usize {
        self.failed.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Move `item` to `Failed`, count it and keep it for the run summary.
pub(crate) fn mark_failed(
    item: &mut TransferItem,
    stage: Stage,
    error: &str,
    kept_at: Option<PathBuf>,
    progress: &AggregateProgress,
    log: &RunLog,
) {
    if let Err(e) = item.transition(ItemState::Failed) {
        error!(position = item.position, error = %e, "Cannot mark item failed");
        return;
    }
    item.last_error = Some(error.to_string());
    progress.record(item);
    log.record_failure(FailedItem {
        position: item.position,
        file_name: item.file_name.clone(),
        stage,
        retry_count: item.retry_count,
        error: error.to_string(),
        kept_at,
    });
    warn!(
        position = item.position,
        file = %item.file_name,
        stage = %stage,
        retries = item.retry_count,
        error,
        "Item failed permanently"
    );
}

/// Sleep for `duration` unless cancelled first. Returns false on cancel.
pub(crate) async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
