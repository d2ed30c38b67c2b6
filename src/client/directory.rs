//! Directory sink with dated upload folders.
//!
//! Uploads land in `<root>/<YYYY-MM-DD>/<file_name>`. The folder for the
//! current day is created once and remembered by the sink instance.
//! A `file_name` must be a single plain path component; anything else is
//! refused before touching the filesystem.

use super::SinkClient;
use crate::models::{RemoteError, RemoteRef};
use async_trait::async_trait;
use chrono::{Local, NaiveDate};
use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Remembers which dated folder was last resolved.
#[derive(Debug, Default)]
pub struct DatedFolderCache {
    current: Mutex<Option<(NaiveDate, PathBuf)>>,
}

impl DatedFolderCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folder for `date` under `root`, created on first use.
    pub async fn folder_for(
        &self,
        root: &Path,
        date: NaiveDate,
    ) -> Result<PathBuf, RemoteError> {
        let mut current = self.current.lock().await;
        if let Some((cached, path)) = current.as_ref() {
            if *cached == date {
                return Ok(path.clone());
            }
        }

        let folder = root.join(date.format("%Y-%m-%d").to_string());
        tokio::fs::create_dir_all(&folder)
            .await
            .map_err(|e| RemoteError::from_io("creating dated folder", &e))?;
        info!(folder = %folder.display(), "Using upload folder");

        *current = Some((date, folder.clone()));
        Ok(folder)
    }
}

/// Sink that copies files into a local (or mounted) directory tree.
#[derive(Debug)]
pub struct DirectorySink {
    name: String,
    root: PathBuf,
    folders: DatedFolderCache,
}

impl DirectorySink {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            folders: DatedFolderCache::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Copy `path` into the folder for `date`.
    pub async fn upload_on(
        &self,
        date: NaiveDate,
        path: &Path,
        file_name: &str,
    ) -> Result<RemoteRef, RemoteError> {
        let file_name = single_component(file_name)?;
        let folder = self.folders.folder_for(&self.root, date).await?;
        let dest = folder.join(file_name);

        let bytes = tokio::fs::copy(path, &dest)
            .await
            .map_err(|e| RemoteError::from_io("copying into sink", &e))?;

        let id = dest
            .strip_prefix(&self.root)
            .unwrap_or(&dest)
            .to_string_lossy()
            .into_owned();
        debug!(sink = %self.name, id = %id, bytes, "Uploaded");

        Ok(RemoteRef {
            sink: self.name.clone(),
            id,
        })
    }
}

fn single_component(file_name: &str) -> Result<&OsStr, RemoteError> {
    let mut parts = Path::new(file_name).components();
    match (parts.next(), parts.next()) {
        (Some(Component::Normal(name)), None) => Ok(name),
        _ => Err(RemoteError::Fatal(format!(
            "remote file name {file_name:?} is not a plain file name"
        ))),
    }
}

#[async_trait]
impl SinkClient for DirectorySink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn upload(&self, path: &Path, file_name: &str) -> Result<RemoteRef, RemoteError> {
        self.upload_on(Local::now().date_naive(), path, file_name)
            .await
    }
}
