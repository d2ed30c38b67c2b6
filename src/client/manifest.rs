//! JSONL manifest source.
//!
//! Each line of the manifest describes one item:
//! `{"position": 101, "file_name": "clip.mp4", "size": 52428800, "locator": "media/clip.mp4"}`
//!
//! Relative locators are resolved against the manifest's directory.
//! Downloading copies the located file into the staging path.

use super::SourceClient;
use crate::models::{RemoteError, Result, SourceItem, SyncError};
use async_trait::async_trait;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Source backed by a manifest file.
#[derive(Debug, Clone)]
pub struct ManifestSource {
    /// Sorted by position, no duplicates
    items: Vec<SourceItem>,
    base_dir: PathBuf,
}

impl ManifestSource {
    /// Load a JSONL manifest.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| SyncError::io("opening manifest", e))?;
        let reader = BufReader::new(file);
        let mut items = Vec::new();

        for (line_num, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| SyncError::io("reading manifest", e))?;
            if line.trim().is_empty() {
                continue;
            }
            let item: SourceItem = serde_json::from_str(&line)
                .map_err(|e| SyncError::ParseError(format!("Line {}: {}", line_num + 1, e)))?;
            items.push(item);
        }

        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let source = Self::from_items(items, base_dir)?;
        info!(count = source.items.len(), manifest = %path.display(), "Loaded manifest");
        Ok(source)
    }

    /// Build from already parsed items.
    pub fn from_items(mut items: Vec<SourceItem>, base_dir: impl Into<PathBuf>) -> Result<Self> {
        items.sort_by_key(|i| i.position);
        if let Some(pair) = items.windows(2).find(|w| w[0].position == w[1].position) {
            return Err(SyncError::ParseError(format!(
                "position {} listed twice in manifest",
                pair[0].position
            )));
        }
        Ok(Self {
            items,
            base_dir: base_dir.into(),
        })
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn resolve(&self, locator: &str) -> PathBuf {
        let path = Path::new(locator);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }
}

#[async_trait]
impl SourceClient for ManifestSource {
    async fn next_item(&self, after: Option<u64>) -> std::result::Result<Option<SourceItem>, RemoteError> {
        let idx = match after {
            Some(p) => self.items.partition_point(|i| i.position <= p),
            None => 0,
        };
        Ok(self.items.get(idx).cloned())
    }

    async fn download(&self, item: &SourceItem, dest: &Path) -> std::result::Result<(), RemoteError> {
        let locator = item.locator.as_deref().ok_or_else(|| {
            RemoteError::Fatal(format!("item {} has no locator", item.position))
        })?;
        let src = self.resolve(locator);

        let copied = tokio::fs::copy(&src, dest)
            .await
            .map_err(|e| RemoteError::from_io("copying from manifest locator", &e))?;

        if item.size > 0 && copied != item.size {
            return Err(RemoteError::Fatal(format!(
                "item {} declared {} bytes but {} were read",
                item.position, item.size, copied
            )));
        }

        debug!(position = item.position, bytes = copied, "Downloaded from manifest");
        Ok(())
    }
}
