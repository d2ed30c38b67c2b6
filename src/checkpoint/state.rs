//! Aggregate progress for a pipeline run.
//!
//! - Counters only move through `AggregateProgress::record`, under one lock
//! - Readers get a `ProgressSnapshot` copy, never a live reference
//! - `last_processed_position` is a watermark: it only passes an item once
//!   that item and every admitted item before it reached a terminal state
//! - Counters contributed by items at or below the watermark are kept
//!   separately as "settled", so a resumed run can rebase onto them and
//!   recount everything after the watermark exactly once

use crate::models::{ItemState, TransferItem};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use tracing::warn;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Overall status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Running,
    Paused,
    Completed,
    Error,
}

/// Which source a pipeline (and its checkpoints) belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineIdentity {
    pub source_id: i64,
    pub source_name: String,
}

impl PipelineIdentity {
    pub fn new(source_id: i64, source_name: impl Into<String>) -> Self {
        Self {
            source_id,
            source_name: source_name.into(),
        }
    }

    /// Stable key for checkpoint lookup. The display name may change
    /// between runs, the id may not.
    pub fn key(&self) -> String {
        format!("source-{}", self.source_id)
    }
}

/// Per-stage counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressCounters {
    pub discovered: u64,
    pub downloaded: u64,
    pub uploaded: u64,
    pub cleaned: u64,
    pub failed: u64,
}

impl ProgressCounters {
    fn add(&mut self, other: &ProgressCounters) {
        self.discovered += other.discovered;
        self.downloaded += other.downloaded;
        self.uploaded += other.uploaded;
        self.cleaned += other.cleaned;
        self.failed += other.failed;
    }

    /// `downloaded ≥ uploaded ≥ cleaned`.
    pub fn is_consistent(&self) -> bool {
        self.downloaded >= self.uploaded && self.uploaded >= self.cleaned
    }
}

/// Immutable copy of the aggregate progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub identity: PipelineIdentity,
    pub last_processed_position: Option<u64>,
    pub counters: ProgressCounters,
    pub settled: ProgressCounters,
    pub settled_bytes: u64,
    pub total_bytes_transferred: u64,
    pub status: SyncStatus,
    pub started_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

impl ProgressSnapshot {
    /// Share of discovered items that have been uploaded.
    pub fn progress_percent(&self) -> f64 {
        let total = self.counters.discovered.max(1);
        (self.counters.uploaded as f64 / total as f64) * 100.0
    }

    pub fn transferred_gb(&self) -> f64 {
        self.total_bytes_transferred as f64 / BYTES_PER_GB
    }

    /// Items admitted but not yet terminal.
    pub fn in_flight(&self) -> u64 {
        self.counters
            .discovered
            .saturating_sub(self.counters.cleaned + self.counters.failed)
    }

    /// One-line operator summary.
    pub fn summary(&self, now: DateTime<Utc>) -> String {
        let elapsed = now - self.started_at;
        format!(
            "{}/{} uploaded ({:.1}%), {} cleaned, {} failed, {:.2}GB transferred, runtime {}h{:02}m",
            self.counters.uploaded,
            self.counters.discovered,
            self.progress_percent(),
            self.counters.cleaned,
            self.counters.failed,
            self.transferred_gb(),
            elapsed.num_hours(),
            elapsed.num_minutes() % 60,
        )
    }
}

/// What one admitted item has added to the counters so far.
#[derive(Debug, Clone, Copy, Default)]
struct Contribution {
    counters: ProgressCounters,
    bytes: u64,
    terminal: bool,
}

#[derive(Debug)]
struct ProgressInner {
    identity: PipelineIdentity,
    watermark: Option<u64>,
    counters: ProgressCounters,
    settled: ProgressCounters,
    settled_bytes: u64,
    total_bytes: u64,
    status: SyncStatus,
    started_at: DateTime<Utc>,
    last_updated_at: DateTime<Utc>,
    /// Admitted positions above the watermark, in source order.
    open: BTreeMap<u64, Contribution>,
}

impl ProgressInner {
    fn is_settled(&self, position: u64) -> bool {
        self.watermark.is_some_and(|w| position <= w)
    }

    /// Fold the terminal prefix of `open` into the settled counters.
    fn advance_watermark(&mut self) {
        while let Some(entry) = self.open.first_entry() {
            if !entry.get().terminal {
                break;
            }
            let (position, contribution) = entry.remove_entry();
            self.settled.add(&contribution.counters);
            self.settled_bytes += contribution.bytes;
            self.watermark = Some(self.watermark.map_or(position, |w| w.max(position)));
        }
    }

    fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            identity: self.identity.clone(),
            last_processed_position: self.watermark,
            counters: self.counters,
            settled: self.settled,
            settled_bytes: self.settled_bytes,
            total_bytes_transferred: self.total_bytes,
            status: self.status,
            started_at: self.started_at,
            last_updated_at: self.last_updated_at,
        }
    }
}

/// Concurrently updated progress of one pipeline run.
#[derive(Debug)]
pub struct AggregateProgress {
    inner: Mutex<ProgressInner>,
}

impl AggregateProgress {
    /// Fresh progress for a new run.
    pub fn new(identity: PipelineIdentity) -> Self {
        let now = Utc::now();
        Self::from_inner(ProgressInner {
            identity,
            watermark: None,
            counters: ProgressCounters::default(),
            settled: ProgressCounters::default(),
            settled_bytes: 0,
            total_bytes: 0,
            status: SyncStatus::Running,
            started_at: now,
            last_updated_at: now,
            open: BTreeMap::new(),
        })
    }

    /// Rebuild progress from a checkpoint snapshot.
    ///
    /// Live counters are rebased to the settled ones: anything after the
    /// watermark will be re-discovered and recounted by this run.
    pub fn resume(snapshot: &ProgressSnapshot) -> Self {
        Self::from_inner(ProgressInner {
            identity: snapshot.identity.clone(),
            watermark: snapshot.last_processed_position,
            counters: snapshot.settled,
            settled: snapshot.settled,
            settled_bytes: snapshot.settled_bytes,
            total_bytes: snapshot.settled_bytes,
            status: SyncStatus::Running,
            started_at: snapshot.started_at,
            last_updated_at: Utc::now(),
            open: BTreeMap::new(),
        })
    }

    fn from_inner(inner: ProgressInner) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ProgressInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply the counter change for `item`'s current state.
    ///
    /// `Queued` admits the item, `Downloaded`/`Uploaded` count stage
    /// completions, `Cleaned`/`Failed` are terminal. In-progress states only
    /// refresh the update time.
    pub fn record(&self, item: &TransferItem) {
        let mut inner = self.lock();
        let position = item.position;
        let state = item.state();

        let mut delta = ProgressCounters::default();
        let mut bytes = 0;
        match state {
            ItemState::Queued => {
                if inner.open.contains_key(&position) {
                    warn!(position, "Item admitted twice, ignoring");
                    return;
                }
                delta.discovered = 1;
            }
            ItemState::Downloaded => delta.downloaded = 1,
            ItemState::Uploaded => {
                delta.uploaded = 1;
                bytes = item.size;
            }
            ItemState::Cleaned => delta.cleaned = 1,
            ItemState::Failed => delta.failed = 1,
            ItemState::Downloading | ItemState::Uploading => {
                inner.last_updated_at = Utc::now();
                return;
            }
        }

        let mut next = inner.counters;
        next.add(&delta);
        if !next.is_consistent() {
            warn!(
                position,
                state = %state,
                "Rejected progress update that would break downloaded ≥ uploaded ≥ cleaned"
            );
            return;
        }
        inner.counters = next;
        inner.total_bytes += bytes;

        if inner.is_settled(position) {
            // Re-recorded below the watermark: count it as settled directly.
            inner.settled.add(&delta);
            inner.settled_bytes += bytes;
        } else {
            let entry = inner.open.entry(position).or_default();
            entry.counters.add(&delta);
            entry.bytes += bytes;
            if state.is_terminal() {
                entry.terminal = true;
            }
            inner.advance_watermark();
        }

        inner.last_updated_at = Utc::now();
    }

    /// Set the run status.
    pub fn set_status(&self, status: SyncStatus) {
        let mut inner = self.lock();
        if inner.status != status {
            inner.status = status;
            inner.last_updated_at = Utc::now();
        }
    }

    /// Set the status to `to` only if it is currently `from`.
    pub fn transition_status(&self, from: SyncStatus, to: SyncStatus) -> bool {
        let mut inner = self.lock();
        if inner.status != from {
            return false;
        }
        inner.status = to;
        inner.last_updated_at = Utc::now();
        true
    }

    /// Move the watermark to an operator-chosen position.
    ///
    /// Only valid before any item has been admitted.
    pub fn override_position(&self, position: u64) {
        let mut inner = self.lock();
        inner.watermark = Some(position);
        inner.last_updated_at = Utc::now();
    }

    pub fn status(&self) -> SyncStatus {
        self.lock().status
    }

    pub fn last_processed_position(&self) -> Option<u64> {
        self.lock().watermark
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> ProgressSnapshot {
        self.lock().snapshot()
    }
}
