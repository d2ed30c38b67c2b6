//! Pipeline coordinator.
//!
//! Pipeline flow:
//! Source → Download driver → (upload queue) → Upload pool → (cleanup queue)
//! → Cleanup worker, with the disk monitor gating downloads and the
//! checkpoint scheduler saving progress alongside.
//!
//! Shutdown order on normal completion: the download driver returns and
//! drops the upload queue sender, upload workers drain and exit, the
//! cleanup queue closes, cleanup drains and exits, then the background
//! tasks stop and a final checkpoint is written.

use super::stage_queue;
use crate::checkpoint::{
    AggregateProgress, CheckpointScheduler, CheckpointSink, CheckpointStore, LoadOutcome,
    PipelineIdentity, ProgressSnapshot, SyncStatus,
};
use crate::client::{SinkClient, SinkGate, SourceClient};
use crate::disk::{DiskBudget, DiskEvent, DiskMonitor};
use crate::models::{Config, ConfigError, Result, SyncError};
use crate::pool::{CleanupWorker, DownloadDriver, FailedItem, RunLog, RetryPolicy, UploadPool};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Where a run starts in the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeMode {
    /// Start from the beginning with zeroed counters.
    Fresh,
    /// Continue after the latest checkpoint, or start fresh if none exists.
    FromCheckpoint,
    /// Start strictly after an operator-chosen position.
    FromPosition(u64),
}

/// Outcome of a finished run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub snapshot: ProgressSnapshot,
    pub failed: Vec<FailedItem>,
    /// Retry counts of completed items that needed retries, by position
    pub retried: BTreeMap<u64, u32>,
    /// Stopped by the cancellation signal
    pub cancelled: bool,
    /// Whether the shutdown checkpoint was written
    pub checkpoint_saved: bool,
    /// Why the download stage stopped early, if it did
    pub stop_error: Option<String>,
    pub elapsed: Duration,
}

impl RunSummary {
    /// Every discovered item reached a terminal state.
    pub fn is_complete(&self) -> bool {
        self.snapshot.status == SyncStatus::Completed && self.snapshot.in_flight() == 0
    }
}

/// Configured pipeline, ready to start.
pub struct Pipeline {
    config: Config,
    source: Arc<dyn SourceClient>,
    sinks: Vec<Arc<dyn SinkClient>>,
    checkpoint_sink: Arc<dyn CheckpointSink>,
}

impl Pipeline {
    /// Validate the configuration and wire the collaborators.
    pub fn new(
        config: Config,
        source: Arc<dyn SourceClient>,
        sinks: Vec<Arc<dyn SinkClient>>,
        checkpoint_sink: Arc<dyn CheckpointSink>,
    ) -> Result<Self> {
        config.validate()?;
        if sinks.is_empty() {
            return Err(ConfigError::NoSinks.into());
        }
        let mut names: Vec<&str> = sinks.iter().map(|s| s.name()).collect();
        names.sort_unstable();
        if let Some(dup) = names.windows(2).find(|w| w[0] == w[1]) {
            return Err(ConfigError::DuplicateSink(dup[0].to_string()).into());
        }

        Ok(Self {
            config,
            source,
            sinks,
            checkpoint_sink,
        })
    }

    pub fn identity(&self) -> PipelineIdentity {
        PipelineIdentity::new(self.config.source.id, self.config.source.name.clone())
    }

    /// Start and wait for the run to finish.
    pub async fn run(&self, resume: ResumeMode) -> Result<RunSummary> {
        self.start(resume).await?.wait().await
    }

    /// Start all stages and return a handle to the running pipeline.
    ///
    /// Fails before anything runs if the staging directory cannot be
    /// created or the checkpoint to resume from is unreadable.
    pub async fn start(&self, resume: ResumeMode) -> Result<PipelineHandle> {
        let staging = &self.config.staging;
        tokio::fs::create_dir_all(&staging.dir)
            .await
            .map_err(|e| SyncError::io("creating staging directory", e))?;

        let identity = self.identity();
        let store = Arc::new(CheckpointStore::new(
            Arc::clone(&self.checkpoint_sink),
            identity.clone(),
            self.config.checkpoint.write_timeout(),
        ));
        let progress = Arc::new(self.initial_progress(&store, identity, resume).await?);
        let start_after = progress.last_processed_position();

        let policy = RetryPolicy::from_config(&self.config.retry);
        let disk = Arc::new(DiskMonitor::from_config(staging));
        disk.scan_now().await;
        let gate = Arc::new(SinkGate::new(policy.rate_limit_cooldown));
        let log = Arc::new(RunLog::new());

        let cancel = CancellationToken::new();
        let background = CancellationToken::new();
        let capacity = self.config.workers.queue_capacity;
        let (upload_tx, upload_rx) = stage_queue(capacity);
        let (cleanup_tx, cleanup_rx) = stage_queue(capacity);

        info!(
            run_id = %store.run_id(),
            source = %self.config.source.name,
            after = ?start_after,
            sinks = self.sinks.len(),
            upload_workers = self.config.workers.upload,
            max_gb = disk.max_gb(),
            "Starting pipeline"
        );

        // Background: disk polling and checkpoint triggers.
        let monitor_task = {
            let disk = Arc::clone(&disk);
            let background = background.clone();
            tokio::spawn(async move { disk.run(background).await })
        };
        let scheduler = Arc::new(CheckpointScheduler::new(
            Arc::clone(&store),
            Arc::clone(&progress),
            self.config.checkpoint.interval(),
            self.config.checkpoint.every_cleaned,
        ));
        let (notifier, cleaned_rx) = CheckpointScheduler::channel();
        let scheduler_task = {
            let scheduler = Arc::clone(&scheduler);
            let background = background.clone();
            tokio::spawn(async move { scheduler.run(cleaned_rx, background).await })
        };

        // Stages.
        let download = DownloadDriver::new(
            Arc::clone(&self.source),
            Arc::clone(&disk),
            Arc::clone(&progress),
            Arc::clone(&log),
            policy.clone(),
            staging.space_wait(),
        );
        let download_task = tokio::spawn(download.run(start_after, upload_tx, cancel.clone()));

        let uploads = Arc::new(UploadPool::new(
            self.sinks.clone(),
            Arc::clone(&gate),
            Arc::clone(&disk),
            Arc::clone(&progress),
            Arc::clone(&log),
            policy.clone(),
            self.config.workers.upload,
        ));
        let upload_tasks = uploads.spawn(upload_rx, cleanup_tx, cancel.clone());

        let cleanup = CleanupWorker::new(
            self.sinks.iter().map(|s| s.name().to_string()).collect(),
            Arc::clone(&progress),
            Arc::clone(&log),
            Arc::clone(&disk),
            notifier,
            policy,
        );
        let cleanup_task = tokio::spawn(cleanup.run(cleanup_rx, cancel.clone()));

        let run = RunTasks {
            run_id: store.run_id(),
            started: Instant::now(),
            download: download_task,
            uploads: upload_tasks,
            cleanup: cleanup_task,
            monitor: monitor_task,
            scheduler_task,
            scheduler,
            progress: Arc::clone(&progress),
            log,
            gate: Arc::clone(&gate),
            cancel: cancel.clone(),
            background,
        };

        Ok(PipelineHandle {
            run_id: store.run_id(),
            cancel,
            progress,
            gate,
            disk,
            task: tokio::spawn(run.supervise()),
        })
    }

    async fn initial_progress(
        &self,
        store: &CheckpointStore,
        identity: PipelineIdentity,
        resume: ResumeMode,
    ) -> Result<AggregateProgress> {
        match resume {
            ResumeMode::Fresh => Ok(AggregateProgress::new(identity)),
            ResumeMode::FromPosition(position) => {
                info!(position, "Starting after operator-chosen position");
                let progress = AggregateProgress::new(identity);
                progress.override_position(position);
                Ok(progress)
            }
            ResumeMode::FromCheckpoint => match store.load().await? {
                LoadOutcome::Found(doc) => {
                    info!(
                        position = ?doc.last_processed_position,
                        previous_status = ?doc.status,
                        "Resuming from checkpoint"
                    );
                    Ok(AggregateProgress::resume(&doc.to_snapshot()))
                }
                LoadOutcome::NotFound => {
                    info!("No checkpoint found, starting fresh");
                    Ok(AggregateProgress::new(identity))
                }
            },
        }
    }
}

/// Everything the supervisor needs to wind a run down.
struct RunTasks {
    run_id: Uuid,
    started: Instant,
    download: JoinHandle<Result<()>>,
    uploads: Vec<JoinHandle<()>>,
    cleanup: JoinHandle<()>,
    monitor: JoinHandle<()>,
    scheduler_task: JoinHandle<()>,
    scheduler: Arc<CheckpointScheduler>,
    progress: Arc<AggregateProgress>,
    log: Arc<RunLog>,
    gate: Arc<SinkGate>,
    cancel: CancellationToken,
    background: CancellationToken,
}

impl RunTasks {
    async fn supervise(self) -> Result<RunSummary> {
        let download_result = match self.download.await {
            Ok(res) => res,
            Err(e) => Err(SyncError::Internal(format!("download task failed: {e}"))),
        };
        if let Err(e) = &download_result {
            error!(error = %e, "Download stage stopped early");
        }

        for task in self.uploads {
            if let Err(e) = task.await {
                error!(error = %e, "Upload worker task failed");
            }
        }
        if let Err(e) = self.cleanup.await {
            error!(error = %e, "Cleanup task failed");
        }

        self.background.cancel();
        if let Err(e) = self.monitor.await {
            warn!(error = %e, "Disk monitor task failed");
        }
        if let Err(e) = self.scheduler_task.await {
            warn!(error = %e, "Checkpoint scheduler task failed");
        }

        let cancelled = self.cancel.is_cancelled();
        let status = if cancelled {
            SyncStatus::Paused
        } else if download_result.is_err() || self.gate.awaiting_reauth() {
            SyncStatus::Error
        } else {
            SyncStatus::Completed
        };
        self.progress.set_status(status);
        let checkpoint_saved = self.scheduler.save_now("shutdown").await;

        let snapshot = self.progress.snapshot();
        let failed = self.log.failed();
        info!(
            status = ?status,
            failed = failed.len(),
            position = ?snapshot.last_processed_position,
            "{}",
            snapshot.summary(Utc::now())
        );

        Ok(RunSummary {
            run_id: self.run_id,
            snapshot,
            failed,
            retried: self.log.retried(),
            cancelled,
            checkpoint_saved,
            stop_error: download_result.err().map(|e| e.to_string()),
            elapsed: self.started.elapsed(),
        })
    }
}

/// Operator handle to a running pipeline.
pub struct PipelineHandle {
    run_id: Uuid,
    cancel: CancellationToken,
    progress: Arc<AggregateProgress>,
    gate: Arc<SinkGate>,
    disk: Arc<DiskMonitor>,
    task: JoinHandle<Result<RunSummary>>,
}

impl PipelineHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Stop admitting items; in-flight remote calls finish their current
    /// stage and a final checkpoint is written.
    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            info!("Cancellation requested");
            self.cancel.cancel();
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.progress.snapshot()
    }

    pub fn disk_budget(&self) -> DiskBudget {
        self.disk.budget()
    }

    pub fn disk_events(&self) -> broadcast::Receiver<DiskEvent> {
        self.disk.subscribe()
    }

    pub fn awaiting_reauth(&self) -> bool {
        self.gate.awaiting_reauth()
    }

    /// Lift a quota suspension or an expired-credentials hold.
    pub fn resume_uploads(&self) -> bool {
        let was_held = self.gate.resume();
        self.progress
            .transition_status(SyncStatus::Error, SyncStatus::Running);
        was_held
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the run to wind down.
    pub async fn wait(self) -> Result<RunSummary> {
        self.task
            .await
            .map_err(|e| SyncError::Internal(format!("pipeline supervisor failed: {e}")))?
    }
}
