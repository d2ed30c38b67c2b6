//! Disk monitor for the staging directory.
//!
//! - `current_bytes` is recomputed by walking the staging directory
//! - `paused` flips on when usage goes above the budget and off once it is
//!   back at or under the resume threshold (the budget itself unless a
//!   resume ratio is configured)
//! - A failed scan keeps the previous reading and never flips the flag
//! - Files kept after a permanent failure live under `failed/` and are not
//!   charged to the budget
//! - State is published on a `watch` channel, transitions on a `broadcast`

use crate::models::{Result, StagingConfig, SyncError};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;
const EVENT_CAPACITY: usize = 64;

/// Subdirectory of staging holding files of permanently failed items.
pub const FAILED_DIR: &str = "failed";

/// Published disk state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DiskBudget {
    pub max_bytes: u64,
    pub current_bytes: u64,
    pub paused: bool,
}

impl DiskBudget {
    /// Whether an item of `size` bytes may be staged now.
    ///
    /// An item larger than the whole budget only fits into an empty
    /// staging area.
    pub fn fits(&self, size: u64) -> bool {
        !self.paused
            && (self.current_bytes == 0 || self.current_bytes.saturating_add(size) <= self.max_bytes)
    }

    pub fn remaining_bytes(&self) -> u64 {
        self.max_bytes.saturating_sub(self.current_bytes)
    }
}

/// Pause/resume transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DiskEvent {
    Paused { current_bytes: u64, max_bytes: u64 },
    Resumed { current_bytes: u64, max_bytes: u64 },
}

/// Watches the staging directory against a byte budget.
#[derive(Debug)]
pub struct DiskMonitor {
    staging_dir: PathBuf,
    max_bytes: u64,
    resume_bytes: u64,
    poll_interval: Duration,
    state: watch::Sender<DiskBudget>,
    events: broadcast::Sender<DiskEvent>,
    /// Scans apply in the order they were started.
    scan_lock: Mutex<()>,
}

impl DiskMonitor {
    pub fn new(staging_dir: impl Into<PathBuf>, max_bytes: u64, poll_interval: Duration) -> Self {
        let (state, _) = watch::channel(DiskBudget {
            max_bytes,
            current_bytes: 0,
            paused: false,
        });
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            staging_dir: staging_dir.into(),
            max_bytes,
            resume_bytes: max_bytes,
            poll_interval,
            state,
            events,
            scan_lock: Mutex::new(()),
        }
    }

    /// Only resume once usage drops to `ratio * max_bytes`.
    pub fn with_resume_ratio(mut self, ratio: f64) -> Self {
        self.resume_bytes = (self.max_bytes as f64 * ratio.clamp(0.0, 1.0)) as u64;
        self
    }

    pub fn from_config(config: &StagingConfig) -> Self {
        let monitor = Self::new(&config.dir, config.max_bytes(), config.poll_interval());
        match config.resume_ratio {
            Some(ratio) => monitor.with_resume_ratio(ratio),
            None => monitor,
        }
    }

    /// Where files of permanently failed items are moved to.
    pub fn failed_dir(&self) -> PathBuf {
        self.staging_dir.join(FAILED_DIR)
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    pub fn budget(&self) -> DiskBudget {
        *self.state.borrow()
    }

    /// Non-blocking pause check.
    pub fn is_paused(&self) -> bool {
        self.state.borrow().paused
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiskEvent> {
        self.events.subscribe()
    }

    pub fn watch(&self) -> watch::Receiver<DiskBudget> {
        self.state.subscribe()
    }

    pub fn usage_gb(&self) -> f64 {
        self.budget().current_bytes as f64 / BYTES_PER_GB
    }

    pub fn max_gb(&self) -> f64 {
        self.max_bytes as f64 / BYTES_PER_GB
    }

    /// Apply a fresh measurement and return the transition it caused.
    pub fn apply_reading(&self, current_bytes: u64) -> Option<DiskEvent> {
        let max_bytes = self.max_bytes;
        let resume_bytes = self.resume_bytes;
        let mut event = None;

        self.state.send_if_modified(|budget| {
            let before = *budget;
            budget.current_bytes = current_bytes;
            if !budget.paused && current_bytes > max_bytes {
                budget.paused = true;
                event = Some(DiskEvent::Paused {
                    current_bytes,
                    max_bytes,
                });
            } else if budget.paused && current_bytes <= resume_bytes {
                budget.paused = false;
                event = Some(DiskEvent::Resumed {
                    current_bytes,
                    max_bytes,
                });
            }
            *budget != before
        });

        match event {
            Some(DiskEvent::Paused { current_bytes, .. }) => {
                warn!(
                    current_bytes,
                    max_bytes,
                    usage_gb = current_bytes as f64 / BYTES_PER_GB,
                    "Disk budget exceeded, pausing downloads"
                );
            }
            Some(DiskEvent::Resumed { current_bytes, .. }) => {
                info!(current_bytes, max_bytes, "Disk space available, resuming downloads");
            }
            None => {}
        }
        if let Some(ev) = event {
            // No subscribers is fine.
            let _ = self.events.send(ev);
        }
        event
    }

    /// Measure the staging directory now and apply the result.
    ///
    /// On a scan failure the previous reading is kept.
    pub async fn scan_now(&self) -> u64 {
        let _guard = self.scan_lock.lock().await;
        let dir = self.staging_dir.clone();

        let measured = tokio::task::spawn_blocking(move || measure_dir(&dir))
            .await
            .map_err(|e| std::io::Error::other(e.to_string()))
            .and_then(|r| r);

        match measured {
            Ok(bytes) => {
                self.apply_reading(bytes);
                bytes
            }
            Err(e) => {
                let kept = self.budget().current_bytes;
                warn!(
                    dir = %self.staging_dir.display(),
                    error = %e,
                    kept_bytes = kept,
                    "Staging scan failed, keeping previous reading"
                );
                kept
            }
        }
    }

    /// Rescan every poll interval until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.poll_interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        debug!(
            dir = %self.staging_dir.display(),
            max_gb = self.max_gb(),
            "Disk monitor started"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.scan_now().await;
                }
            }
        }
        debug!("Disk monitor stopped");
    }

    /// Block until downloads are not paused.
    pub async fn wait_for_space(&self, deadline: Duration, cancel: &CancellationToken) -> Result<()> {
        self.wait_until(deadline, cancel, |b| !b.paused).await
    }

    /// Block until an item of `size` bytes fits in the remaining budget.
    pub async fn wait_for_room(
        &self,
        size: u64,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.wait_until(deadline, cancel, |b| b.fits(size)).await
    }

    async fn wait_until(
        &self,
        deadline: Duration,
        cancel: &CancellationToken,
        ready: impl Fn(&DiskBudget) -> bool,
    ) -> Result<()> {
        let mut rx = self.state.subscribe();
        let wait = async {
            rx.wait_for(|b| ready(b))
                .await
                .map(|_| ())
                .map_err(|_| SyncError::Internal("disk monitor dropped".to_string()))
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(SyncError::Cancelled),
            res = tokio::time::timeout(deadline, wait) => match res {
                Ok(inner) => inner,
                Err(_) => Err(SyncError::Timeout(deadline)),
            },
        }
    }
}

/// Sum of file sizes under `dir`. A missing directory is empty.
///
/// Unreadable entries below the root are skipped, and so is the top-level
/// `failed/` directory.
pub fn measure_dir(dir: &Path) -> std::io::Result<u64> {
    match std::fs::metadata(dir) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not a directory", dir.display()),
            ))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    }

    let total = WalkDir::new(dir)
        .into_iter()
        .filter_entry(|entry| !(entry.depth() == 1 && entry.file_name() == FAILED_DIR))
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum();
    Ok(total)
}
