//! Work items and their lifecycle.
//!
//! A `TransferItem` is owned by exactly one stage at a time; the hand-off
//! queues move it by value. Transitions are validated so that an item can
//! never reach `Cleaned` without passing through `Uploaded`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use super::{Result, SyncError};

/// Descriptor handed out by the source client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceItem {
    /// Ordinal / message identifier at the source
    pub position: u64,

    /// File name to stage and upload under
    pub file_name: String,

    /// Declared size in bytes
    #[serde(default)]
    pub size: u64,

    /// Adapter-specific locator (URL, path, message reference)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locator: Option<String>,
}

/// Reference returned by a sink after a confirmed upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRef {
    /// Sink that confirmed the upload
    pub sink: String,
    /// Remote identifier (file id, object key, path)
    pub id: String,
}

/// Lifecycle state of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemState {
    Queued,
    Downloading,
    Downloaded,
    Uploading,
    Uploaded,
    Cleaned,
    Failed,
}

impl ItemState {
    /// `Cleaned` and `Failed` accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Cleaned | Self::Failed)
    }

    /// Whether `self -> next` is a legal edge of the state machine.
    pub fn can_transition_to(self, next: ItemState) -> bool {
        use ItemState::*;
        match (self, next) {
            (Queued, Downloading) => true,
            (Downloading, Downloaded) => true,
            (Downloaded, Uploading) => true,
            (Uploading, Uploaded) => true,
            (Uploaded, Cleaned) => true,
            // Retried attempts go back to the stage's input state.
            (Downloading, Queued) => true,
            (Uploading, Downloaded) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ItemState::Queued => "queued",
            ItemState::Downloading => "downloading",
            ItemState::Downloaded => "downloaded",
            ItemState::Uploading => "uploading",
            ItemState::Uploaded => "uploaded",
            ItemState::Cleaned => "cleaned",
            ItemState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Unit of work flowing through the pipeline.
#[derive(Debug, Clone)]
pub struct TransferItem {
    pub position: u64,
    pub file_name: String,
    pub local_path: PathBuf,
    pub size: u64,
    pub locator: Option<String>,
    state: ItemState,
    /// Retried attempts across all stages
    pub retry_count: u32,
    /// Budget-consuming failures in the current stage
    pub stage_failures: u32,
    pub last_error: Option<String>,
    /// Confirmed uploads keyed by sink name
    pub confirmed: BTreeMap<String, RemoteRef>,
    pub queued_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TransferItem {
    /// Accept a source descriptor into the pipeline.
    pub fn new(source: SourceItem, staging_dir: &std::path::Path) -> Self {
        let local_path = staging_dir.join(staged_file_name(source.position, &source.file_name));
        Self {
            position: source.position,
            file_name: source.file_name,
            local_path,
            size: source.size,
            locator: source.locator,
            state: ItemState::Queued,
            retry_count: 0,
            stage_failures: 0,
            last_error: None,
            confirmed: BTreeMap::new(),
            queued_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn state(&self) -> ItemState {
        self.state
    }

    /// Descriptor view, as handed to the source client.
    pub fn source_item(&self) -> SourceItem {
        SourceItem {
            position: self.position,
            file_name: self.file_name.clone(),
            size: self.size,
            locator: self.locator.clone(),
        }
    }

    /// Move to `next`, validating the edge.
    ///
    /// Completing a stage clears `last_error` and resets the per-stage
    /// failure budget. Retry edges back to a stage's input state keep both.
    /// Terminal states stamp `completed_at`.
    pub fn transition(&mut self, next: ItemState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(SyncError::InvalidTransition {
                position: self.position,
                from: self.state,
                to: next,
            });
        }

        let forward = matches!(
            (self.state, next),
            (ItemState::Downloading, ItemState::Downloaded)
                | (ItemState::Uploading, ItemState::Uploaded)
                | (ItemState::Uploaded, ItemState::Cleaned)
        );
        self.state = next;
        if forward {
            self.last_error = None;
            self.stage_failures = 0;
        }
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Record a failed attempt that will be retried.
    ///
    /// `charged` attempts count against the per-stage budget.
    pub fn note_retry(&mut self, error: impl Into<String>, charged: bool) {
        self.retry_count += 1;
        if charged {
            self.stage_failures += 1;
        }
        self.last_error = Some(error.into());
    }

    /// Record a confirmed upload for `remote.sink`.
    pub fn confirm(&mut self, remote: RemoteRef) {
        self.confirmed.insert(remote.sink.clone(), remote);
    }

    pub fn is_confirmed_by(&self, sink: &str) -> bool {
        self.confirmed.contains_key(sink)
    }

    /// True once every sink in `required` has confirmed.
    pub fn confirmed_by_all<'a>(&self, mut required: impl Iterator<Item = &'a str>) -> bool {
        required.all(|sink| self.confirmed.contains_key(sink))
    }

    /// Name the item is stored under in every sink.
    ///
    /// Same as the staged file name, so two items sharing a display name
    /// never overwrite each other remotely and a re-upload of the same
    /// position lands on the same object.
    pub fn remote_name(&self) -> String {
        staged_file_name(self.position, &self.file_name)
    }

    /// Time from admission to terminal state, if terminal.
    pub fn latency_ms(&self) -> Option<i64> {
        self.completed_at
            .map(|done| (done - self.queued_at).num_milliseconds())
    }
}

/// Local file name for a staged item.
///
/// The position prefix keeps two source items with the same display name
/// from colliding in the staging directory.
pub fn staged_file_name(position: u64, file_name: &str) -> String {
    let sanitized: String = file_name
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c => c,
        })
        .collect();
    let sanitized = match sanitized.as_str() {
        "" | "." | ".." => "item".to_string(),
        _ => sanitized,
    };
    format!("{position}_{sanitized}")
}
