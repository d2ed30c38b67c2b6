//! Durable checkpoint storage.
//!
//! - `CheckpointSink`: append-only transport for encoded documents
//! - `FileCheckpointSink`: one JSONL log per pipeline identity
//! - `MemoryCheckpointSink`: in-process sink for dry runs and tests
//! - `CheckpointStore`: encodes snapshots, serializes writes, bounds their
//!   duration and decodes the latest document on resume

use super::{CheckpointDocument, PipelineIdentity, ProgressSnapshot};
use crate::models::{Result, SyncError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Durable external sink for checkpoint documents.
#[async_trait]
pub trait CheckpointSink: Send + Sync {
    /// Append one encoded document for `identity`.
    async fn append(&self, identity: &PipelineIdentity, document: &str) -> Result<()>;

    /// Most recently appended document for `identity`, if any.
    async fn find_latest(&self, identity: &PipelineIdentity) -> Result<Option<String>>;
}

/// Checkpoint log stored as JSONL files in a directory.
///
/// Every save appends one line and syncs the file. A crash mid-append can
/// leave a torn last line; `find_latest` skips lines that are not complete
/// JSON values. Once the log holds more than `max_entries` lines it is
/// rewritten to the newest half via write-then-rename.
pub struct FileCheckpointSink {
    dir: PathBuf,
    max_entries: usize,
}

impl FileCheckpointSink {
    /// Create the sink, creating `dir` if needed.
    pub async fn new(dir: &Path, max_entries: usize) -> Result<Self> {
        fs::create_dir_all(dir)
            .await
            .map_err(|e| SyncError::io("creating checkpoint dir", e))?;

        Ok(Self {
            dir: dir.to_path_buf(),
            max_entries: max_entries.max(1),
        })
    }

    /// Path of the log for `identity`.
    pub fn log_path(&self, identity: &PipelineIdentity) -> PathBuf {
        self.dir.join(format!("{}.jsonl", identity.key()))
    }

    async fn read_lines(&self, path: &Path) -> Result<Vec<String>> {
        match fs::read_to_string(path).await {
            Ok(content) => Ok(content
                .lines()
                .filter(|l| !l.trim().is_empty())
                .map(str::to_string)
                .collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(SyncError::io("reading checkpoint log", e)),
        }
    }

    async fn compact(&self, path: &Path) -> Result<()> {
        let lines = self.read_lines(path).await?;
        if lines.len() <= self.max_entries {
            return Ok(());
        }

        let keep = (self.max_entries / 2).max(1);
        let tail = &lines[lines.len() - keep..];
        let mut content = tail.join("\n");
        content.push('\n');

        let temp_path = path.with_extension("jsonl.tmp");
        fs::write(&temp_path, content)
            .await
            .map_err(|e| SyncError::io("writing compacted checkpoint log", e))?;
        fs::rename(&temp_path, path)
            .await
            .map_err(|e| SyncError::io("renaming compacted checkpoint log", e))?;

        debug!(path = %path.display(), kept = keep, dropped = lines.len() - keep, "Checkpoint log compacted");
        Ok(())
    }
}

#[async_trait]
impl CheckpointSink for FileCheckpointSink {
    async fn append(&self, identity: &PipelineIdentity, document: &str) -> Result<()> {
        if document.contains('\n') {
            return Err(SyncError::InvalidInput(
                "checkpoint documents must be single-line".to_string(),
            ));
        }

        let path = self.log_path(identity);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| SyncError::io("opening checkpoint log", e))?;

        let mut line = String::with_capacity(document.len() + 1);
        line.push_str(document);
        line.push('\n');
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| SyncError::io("appending checkpoint", e))?;
        file.sync_all()
            .await
            .map_err(|e| SyncError::io("syncing checkpoint log", e))?;
        drop(file);

        self.compact(&path).await
    }

    async fn find_latest(&self, identity: &PipelineIdentity) -> Result<Option<String>> {
        let path = self.log_path(identity);
        let lines = self.read_lines(&path).await?;

        for (idx, line) in lines.iter().enumerate().rev() {
            if serde_json::from_str::<serde_json::Value>(line).is_ok() {
                return Ok(Some(line.clone()));
            }
            warn!(
                path = %path.display(),
                line = idx + 1,
                "Skipping torn checkpoint entry"
            );
        }
        Ok(None)
    }
}

/// In-memory checkpoint sink.
#[derive(Default)]
pub struct MemoryCheckpointSink {
    logs: StdMutex<HashMap<String, Vec<String>>>,
}

impl MemoryCheckpointSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All documents appended for `identity`, oldest first.
    pub fn documents(&self, identity: &PipelineIdentity) -> Vec<String> {
        self.logs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&identity.key())
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl CheckpointSink for MemoryCheckpointSink {
    async fn append(&self, identity: &PipelineIdentity, document: &str) -> Result<()> {
        self.logs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(identity.key())
            .or_default()
            .push(document.to_string());
        Ok(())
    }

    async fn find_latest(&self, identity: &PipelineIdentity) -> Result<Option<String>> {
        Ok(self
            .logs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&identity.key())
            .and_then(|docs| docs.last().cloned()))
    }
}

/// Result of looking up the latest checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// A valid document was found.
    Found(CheckpointDocument),
    /// This pipeline has never written a checkpoint.
    NotFound,
}

/// Encodes, writes and reloads checkpoints for one pipeline.
pub struct CheckpointStore {
    sink: std::sync::Arc<dyn CheckpointSink>,
    identity: PipelineIdentity,
    run_id: Uuid,
    write_timeout: Duration,
    /// Serializes concurrent saves.
    write_lock: Mutex<()>,
}

impl CheckpointStore {
    pub fn new(
        sink: std::sync::Arc<dyn CheckpointSink>,
        identity: PipelineIdentity,
        write_timeout: Duration,
    ) -> Self {
        Self {
            sink,
            identity,
            run_id: Uuid::new_v4(),
            write_timeout,
            write_lock: Mutex::new(()),
        }
    }

    pub fn identity(&self) -> &PipelineIdentity {
        &self.identity
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Encode `snapshot` and append it to the sink.
    ///
    /// Bounded by the write timeout; a slow or failed write returns
    /// `CheckpointWrite` and leaves the previous checkpoint in place.
    pub async fn save(&self, snapshot: &ProgressSnapshot) -> Result<()> {
        let document = CheckpointDocument::from_snapshot(self.run_id, snapshot).encode()?;

        let write = async {
            let _guard = self.write_lock.lock().await;
            self.sink.append(&self.identity, &document).await
        };

        match tokio::time::timeout(self.write_timeout, write).await {
            Ok(Ok(())) => {
                debug!(
                    position = ?snapshot.last_processed_position,
                    cleaned = snapshot.counters.cleaned,
                    "Checkpoint saved"
                );
                Ok(())
            }
            Ok(Err(e)) => Err(SyncError::CheckpointWrite(e.to_string())),
            Err(_) => Err(SyncError::CheckpointWrite(format!(
                "write did not finish within {:?}",
                self.write_timeout
            ))),
        }
    }

    /// Load the latest checkpoint for this pipeline.
    pub async fn load(&self) -> Result<LoadOutcome> {
        let Some(text) = self.sink.find_latest(&self.identity).await? else {
            return Ok(LoadOutcome::NotFound);
        };

        let doc = CheckpointDocument::decode(&text)?;
        if doc.pipeline.source_id != self.identity.source_id {
            return Err(SyncError::MalformedCheckpoint(format!(
                "checkpoint belongs to source {} not {}",
                doc.pipeline.source_id, self.identity.source_id
            )));
        }

        info!(
            position = ?doc.last_processed_position,
            uploaded = doc.counters.uploaded,
            discovered = doc.counters.discovered,
            written_by = %doc.run_id,
            "Loaded checkpoint"
        );
        Ok(LoadOutcome::Found(doc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{AggregateProgress, SyncStatus};
    use crate::models::{ItemState, SourceItem, TransferItem};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn identity() -> PipelineIdentity {
        PipelineIdentity::new(7, "backups")
    }

    fn busy_progress() -> AggregateProgress {
        let progress = AggregateProgress::new(identity());
        for position in 1..=12u64 {
            let mut item = TransferItem::new(
                SourceItem {
                    position,
                    file_name: format!("{position}.dat"),
                    size: 1_000 + position,
                    locator: None,
                },
                Path::new("/tmp/staging"),
            );
            progress.record(&item);
            let stop = match position % 3 {
                0 => ItemState::Downloaded,
                1 => ItemState::Uploaded,
                _ => ItemState::Cleaned,
            };
            for next in [
                ItemState::Downloading,
                ItemState::Downloaded,
                ItemState::Uploading,
                ItemState::Uploaded,
                ItemState::Cleaned,
            ] {
                item.transition(next).unwrap();
                progress.record(&item);
                if next == stop {
                    break;
                }
            }
        }
        progress.set_status(SyncStatus::Paused);
        progress
    }

    #[tokio::test]
    async fn test_round_trip_through_file_sink() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(FileCheckpointSink::new(dir.path(), 100).await.unwrap());
        let store = CheckpointStore::new(sink, identity(), Duration::from_secs(5));

        let progress = busy_progress();
        let snapshot = progress.snapshot();
        store.save(&snapshot).await.unwrap();

        match store.load().await.unwrap() {
            LoadOutcome::Found(doc) => {
                assert_eq!(doc.to_snapshot(), snapshot);
                assert_eq!(doc.run_id, store.run_id());
            }
            LoadOutcome::NotFound => panic!("checkpoint not found"),
        }
    }

    #[tokio::test]
    async fn test_missing_checkpoint_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(FileCheckpointSink::new(dir.path(), 100).await.unwrap());
        let store = CheckpointStore::new(sink, identity(), Duration::from_secs(5));
        assert_eq!(store.load().await.unwrap(), LoadOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_latest_document_wins_and_torn_tail_is_skipped() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(FileCheckpointSink::new(dir.path(), 100).await.unwrap());
        let store = CheckpointStore::new(sink.clone(), identity(), Duration::from_secs(5));

        let progress = busy_progress();
        store.save(&progress.snapshot()).await.unwrap();
        progress.set_status(SyncStatus::Completed);
        let last = progress.snapshot();
        store.save(&last).await.unwrap();

        // Simulate a crash in the middle of a third append.
        let path = sink.log_path(&identity());
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("{\"version\":1,\"run_id\":\"");
        std::fs::write(&path, content).unwrap();

        match store.load().await.unwrap() {
            LoadOutcome::Found(doc) => assert_eq!(doc.status, SyncStatus::Completed),
            LoadOutcome::NotFound => panic!("checkpoint not found"),
        }
    }

    #[tokio::test]
    async fn test_garbage_checkpoint_is_malformed() {
        let sink = Arc::new(MemoryCheckpointSink::new());
        sink.append(&identity(), r#"{"version":1,"hello":"world"}"#)
            .await
            .unwrap();
        let store = CheckpointStore::new(sink, identity(), Duration::from_secs(5));
        assert!(matches!(
            store.load().await,
            Err(SyncError::MalformedCheckpoint(_))
        ));
    }

    #[tokio::test]
    async fn test_log_is_compacted() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(FileCheckpointSink::new(dir.path(), 4).await.unwrap());
        let store = CheckpointStore::new(sink.clone(), identity(), Duration::from_secs(5));
        let progress = busy_progress();
        for _ in 0..9 {
            store.save(&progress.snapshot()).await.unwrap();
        }
        let lines = std::fs::read_to_string(sink.log_path(&identity()))
            .unwrap()
            .lines()
            .count();
        assert!(lines <= 4, "log has {lines} lines");
        assert!(matches!(store.load().await.unwrap(), LoadOutcome::Found(_)));
    }

    #[tokio::test]
    async fn test_concurrent_saves_are_serialized() {
        let sink = Arc::new(MemoryCheckpointSink::new());
        let store = Arc::new(CheckpointStore::new(
            sink.clone(),
            identity(),
            Duration::from_secs(5),
        ));
        let progress = Arc::new(busy_progress());

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            let progress = Arc::clone(&progress);
            handles.push(tokio::spawn(async move {
                store.save(&progress.snapshot()).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        let docs = sink.documents(&identity());
        assert_eq!(docs.len(), 16);
        for doc in docs {
            CheckpointDocument::decode(&doc).unwrap();
        }
    }
}
