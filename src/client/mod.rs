//! Remote collaborators.
//!
//! The pipeline only talks to the outside world through these traits:
//! - `SourceClient`: enumerates items after a position and downloads one
//! - `SinkClient`: uploads one staged file and returns a remote reference
//!
//! `SinkGate` holds the upload-side backoff shared by every worker.
//! `ManifestSource` and `DirectorySink` are local reference adapters.

mod directory;
mod gate;
mod manifest;

pub use directory::*;
pub use gate::*;
pub use manifest::*;

use crate::models::{RemoteError, RemoteRef, SourceItem};
use async_trait::async_trait;
use std::path::Path;

/// Remote source of transferable items.
#[async_trait]
pub trait SourceClient: Send + Sync {
    /// First item strictly after `after` in source order, or `None` once
    /// the source is exhausted.
    async fn next_item(&self, after: Option<u64>) -> Result<Option<SourceItem>, RemoteError>;

    /// Write the bytes of `item` to `dest`.
    async fn download(&self, item: &SourceItem, dest: &Path) -> Result<(), RemoteError>;
}

/// Remote upload destination.
#[async_trait]
pub trait SinkClient: Send + Sync {
    /// Name used for confirmations and logs.
    fn name(&self) -> &str;

    /// Upload the staged file at `path` under `file_name`.
    ///
    /// Uploading the same file twice must be harmless.
    async fn upload(&self, path: &Path, file_name: &str) -> Result<RemoteRef, RemoteError>;
}
