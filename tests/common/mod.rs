//! Shared fakes for pipeline integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use relaysync::models::{
    CheckpointConfig, Config, RetryConfig, SinkConfig, StagingConfig, WorkerConfig,
};
use relaysync::checkpoint::{CheckpointSink, PipelineIdentity};
use relaysync::{
    RemoteError, RemoteRef, SinkClient, SourceClient, SourceItem, SyncError,
};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

/// Config tuned for fast tests.
pub fn test_config(staging: &Path, max_bytes: u64, upload_workers: usize) -> Config {
    Config {
        staging: StagingConfig {
            dir: staging.to_path_buf(),
            max_bytes: Some(max_bytes),
            poll_interval_ms: 20,
            space_wait_secs: 1,
            ..StagingConfig::default()
        },
        workers: WorkerConfig {
            upload: upload_workers,
            queue_capacity: 4,
        },
        retry: RetryConfig {
            max_retries: 3,
            attempt_timeout_secs: 10,
            backoff_base_ms: 5,
            backoff_max_ms: 20,
            rate_limit_cooldown_ms: 5,
            quota_cooldown_secs: 1,
        },
        checkpoint: CheckpointConfig {
            interval_secs: 3600,
            every_cleaned: 1,
            write_timeout_secs: 5,
            ..CheckpointConfig::default()
        },
        sinks: vec![SinkConfig {
            name: "fake".to_string(),
            root: PathBuf::from("/unused"),
        }],
        ..Config::default()
    }
}

pub fn items(count: u64, size: u64) -> Vec<SourceItem> {
    (1..=count)
        .map(|position| SourceItem {
            position,
            file_name: format!("item-{position}.bin"),
            size,
            locator: None,
        })
        .collect()
}

/// Name sinks receive for the item at `position` built by [`items`].
pub fn remote(position: u64) -> String {
    format!("{position}_item-{position}.bin")
}

/// Regular files directly under `dir`.
pub fn staged_files(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
                .count()
        })
        .unwrap_or(0)
}

/// Files of permanently failed items, set aside under `failed/`.
pub fn set_aside_files(staging: &Path) -> usize {
    staged_files(&staging.join("failed"))
}

/// In-memory source that writes `size` zero bytes per download.
pub struct FakeSource {
    items: Vec<SourceItem>,
    staging: PathBuf,
    failures: Mutex<HashMap<u64, VecDeque<RemoteError>>>,
    /// `after` argument of every listing call
    pub listings: Mutex<Vec<Option<u64>>>,
    /// Positions of successful downloads, in order
    pub downloaded: Mutex<Vec<u64>>,
    /// Largest number of files seen in staging right after a download
    pub max_resident: Mutex<usize>,
}

impl FakeSource {
    pub fn new(items: Vec<SourceItem>, staging: &Path) -> Self {
        Self {
            items,
            staging: staging.to_path_buf(),
            failures: Mutex::new(HashMap::new()),
            listings: Mutex::new(Vec::new()),
            downloaded: Mutex::new(Vec::new()),
            max_resident: Mutex::new(0),
        }
    }

    /// Fail the next downloads of `position` with `errors`, in order.
    pub fn fail_download(&self, position: u64, errors: Vec<RemoteError>) {
        self.failures
            .lock()
            .unwrap()
            .insert(position, errors.into());
    }

    pub fn downloaded(&self) -> Vec<u64> {
        self.downloaded.lock().unwrap().clone()
    }

    pub fn listings(&self) -> Vec<Option<u64>> {
        self.listings.lock().unwrap().clone()
    }

    pub fn max_resident(&self) -> usize {
        *self.max_resident.lock().unwrap()
    }
}

#[async_trait]
impl SourceClient for FakeSource {
    async fn next_item(&self, after: Option<u64>) -> Result<Option<SourceItem>, RemoteError> {
        self.listings.lock().unwrap().push(after);
        Ok(self
            .items
            .iter()
            .find(|i| after.is_none_or(|a| i.position > a))
            .cloned())
    }

    async fn download(&self, item: &SourceItem, dest: &Path) -> Result<(), RemoteError> {
        let scripted = self
            .failures
            .lock()
            .unwrap()
            .get_mut(&item.position)
            .and_then(|q| q.pop_front());
        if let Some(err) = scripted {
            return Err(err);
        }

        tokio::fs::write(dest, vec![0u8; item.size as usize])
            .await
            .map_err(|e| RemoteError::from_io("writing", &e))?;
        self.downloaded.lock().unwrap().push(item.position);

        let resident = staged_files(&self.staging);
        let mut max = self.max_resident.lock().unwrap();
        *max = (*max).max(resident);
        Ok(())
    }
}

/// Sink that records uploads and can be scripted to fail.
pub struct FakeSink {
    name: String,
    delay: Duration,
    /// Positions at or above this upload with `slow_delay`
    slow_from: Option<(u64, Duration)>,
    failures: Mutex<HashMap<String, VecDeque<RemoteError>>>,
    /// File names of confirmed uploads, in completion order
    pub uploads: Mutex<Vec<String>>,
    /// Attempts per file name, failures included
    pub attempts: Mutex<HashMap<String, u32>>,
    /// Uploads whose staged file was missing at upload time
    pub missing_files: Mutex<Vec<String>>,
}

impl FakeSink {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            delay: Duration::ZERO,
            slow_from: None,
            failures: Mutex::new(HashMap::new()),
            uploads: Mutex::new(Vec::new()),
            attempts: Mutex::new(HashMap::new()),
            missing_files: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn slow_from(mut self, position: u64, delay: Duration) -> Self {
        self.slow_from = Some((position, delay));
        self
    }

    /// Fail the next uploads of `file_name` with `errors`, in order.
    pub fn fail_upload(&self, file_name: &str, errors: Vec<RemoteError>) {
        self.failures
            .lock()
            .unwrap()
            .insert(file_name.to_string(), errors.into());
    }

    pub fn uploads(&self) -> Vec<String> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn upload_count(&self, file_name: &str) -> usize {
        self.uploads
            .lock()
            .unwrap()
            .iter()
            .filter(|f| f.as_str() == file_name)
            .count()
    }

    pub fn attempts(&self, file_name: &str) -> u32 {
        self.attempts
            .lock()
            .unwrap()
            .get(file_name)
            .copied()
            .unwrap_or(0)
    }

    pub fn missing_files(&self) -> Vec<String> {
        self.missing_files.lock().unwrap().clone()
    }
}

fn position_of(file_name: &str) -> Option<u64> {
    file_name.split_once('_')?.0.parse().ok()
}

#[async_trait]
impl SinkClient for FakeSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn upload(&self, path: &Path, file_name: &str) -> Result<RemoteRef, RemoteError> {
        *self
            .attempts
            .lock()
            .unwrap()
            .entry(file_name.to_string())
            .or_default() += 1;

        if !path.exists() {
            self.missing_files
                .lock()
                .unwrap()
                .push(file_name.to_string());
        }

        let scripted = self
            .failures
            .lock()
            .unwrap()
            .get_mut(file_name)
            .and_then(|q| q.pop_front());
        if let Some(err) = scripted {
            return Err(err);
        }

        let mut delay = self.delay;
        if let (Some((from, slow)), Some(position)) = (self.slow_from, position_of(file_name)) {
            if position >= from {
                delay = slow;
            }
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.uploads.lock().unwrap().push(file_name.to_string());
        Ok(RemoteRef {
            sink: self.name.clone(),
            id: format!("{}/{}", self.name, file_name),
        })
    }
}

pub fn rate_limited() -> RemoteError {
    RemoteError::RateLimited {
        message: "429 Too Many Requests".to_string(),
        retry_after: Some(Duration::from_millis(10)),
    }
}

pub fn transient() -> RemoteError {
    RemoteError::Transient("connection reset".to_string())
}

/// Checkpoint store whose writes always fail.
#[derive(Debug, Default)]
pub struct FailingCheckpointSink {
    pub attempts: Mutex<u32>,
}

impl FailingCheckpointSink {
    pub fn attempts(&self) -> u32 {
        *self.attempts.lock().unwrap()
    }
}

#[async_trait]
impl CheckpointSink for FailingCheckpointSink {
    async fn append(&self, _identity: &PipelineIdentity, _document: &str) -> relaysync::Result<()> {
        *self.attempts.lock().unwrap() += 1;
        Err(SyncError::io(
            "appending checkpoint",
            std::io::Error::other("store unavailable"),
        ))
    }

    async fn find_latest(&self, _identity: &PipelineIdentity) -> relaysync::Result<Option<String>> {
        Ok(None)
    }
}
