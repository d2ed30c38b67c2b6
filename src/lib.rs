//! relaysync - resumable, disk-bounded download → upload → cleanup pipeline.
//!
//! ## Architecture
//!
//! Items flow through three stages connected by bounded queues:
//! - **Download**: a single driver walks the source in position order and
//!   stages each item locally, gated by the disk monitor
//! - **Upload**: a worker pool pushes staged files to every sink, sharing
//!   per-sink backoff and stage-wide holds through the sink gate
//! - **Cleanup**: a single worker deletes staged files once every sink
//!   confirmed the upload
//!
//! ## Resumability
//!
//! Progress is summarized by a watermark (`last_processed_position`) that
//! only advances over items that reached a terminal state in source order.
//! Checkpoints are versioned JSON documents appended to a durable sink; a
//! resumed run enumerates the source strictly after the watermark.

pub mod checkpoint;
pub mod client;
pub mod disk;
pub mod models;
pub mod pipeline;
pub mod pool;

// Re-exports for convenience
pub use checkpoint::{
    AggregateProgress, CheckpointDocument, CheckpointSink, CheckpointStore, FileCheckpointSink,
    MemoryCheckpointSink, ProgressSnapshot, SyncStatus,
};
pub use client::{DirectorySink, ManifestSource, SinkClient, SourceClient};
pub use disk::{DiskBudget, DiskMonitor};
pub use models::{
    Config, ItemState, RemoteError, RemoteRef, Result, SourceItem, SyncError, TransferItem,
};
pub use pipeline::{Pipeline, PipelineHandle, ResumeMode, RunSummary};
pub use pool::{FailedItem, RetryPolicy};
