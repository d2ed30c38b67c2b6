//! Checkpoint module for resumable pipeline execution.
//!
//! Provides:
//! - `AggregateProgress`: concurrently updated counters and watermark
//! - `CheckpointDocument`: versioned JSON schema of a snapshot
//! - `CheckpointStore`: durable save/load against a `CheckpointSink`
//! - `CheckpointScheduler`: timer, cleaned-count and shutdown triggers

mod document;
mod scheduler;
mod state;
mod store;

pub use document::*;
pub use scheduler::*;
pub use state::*;
pub use store::*;
