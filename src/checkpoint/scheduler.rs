//! Checkpoint triggers.
//!
//! A save happens on a fixed timer, after every N cleaned items, and once
//! more when the pipeline shuts down. Failed saves are logged and left for
//! the next trigger.

use super::{AggregateProgress, CheckpointStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Sending half handed to the cleanup stage.
#[derive(Debug, Clone)]
pub struct CleanedNotifier {
    tx: mpsc::UnboundedSender<()>,
}

impl CleanedNotifier {
    /// Report one more cleaned item.
    pub fn item_cleaned(&self) {
        // The scheduler may already be gone during shutdown.
        let _ = self.tx.send(());
    }
}

/// Drives periodic and event-based checkpoint saves.
pub struct CheckpointScheduler {
    store: Arc<CheckpointStore>,
    progress: Arc<AggregateProgress>,
    interval: Duration,
    every_cleaned: u64,
}

impl CheckpointScheduler {
    pub fn new(
        store: Arc<CheckpointStore>,
        progress: Arc<AggregateProgress>,
        interval: Duration,
        every_cleaned: u64,
    ) -> Self {
        Self {
            store,
            progress,
            interval,
            every_cleaned,
        }
    }

    /// Channel for cleaned-item notifications.
    pub fn channel() -> (CleanedNotifier, mpsc::UnboundedReceiver<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (CleanedNotifier { tx }, rx)
    }

    /// Save the current progress. Returns whether the write succeeded.
    pub async fn save_now(&self, reason: &str) -> bool {
        let snapshot = self.progress.snapshot();
        match self.store.save(&snapshot).await {
            Ok(()) => {
                debug!(reason, position = ?snapshot.last_processed_position, "Checkpoint written");
                true
            }
            Err(e) => {
                warn!(reason, error = %e, "Checkpoint save failed, will retry on next trigger");
                false
            }
        }
    }

    /// Run until `cancel` fires or every notifier is dropped.
    ///
    /// The shutdown save is left to the caller so it can set the final
    /// status first.
    pub async fn run(&self, mut cleaned: mpsc::UnboundedReceiver<()>, cancel: CancellationToken) {
        let period = self.interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut since_last = 0u64;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.save_now("timer").await;
                    since_last = 0;
                }
                msg = cleaned.recv() => {
                    if msg.is_none() {
                        break;
                    }
                    since_last += 1;
                    if self.every_cleaned > 0 && since_last >= self.every_cleaned {
                        self.save_now("cleaned").await;
                        since_last = 0;
                    }
                }
            }
        }
    }
}
