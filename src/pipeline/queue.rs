//! Bounded hand-off queues between stages.
//!
//! The queue closes once every `StageSender` is dropped; receivers then
//! drain what is left and get `None`. Several workers can share one
//! `StageReceiver`.

use crate::models::{Result, SyncError};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Create a queue holding at most `capacity` items.
pub fn stage_queue<T>(capacity: usize) -> (StageSender<T>, StageReceiver<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        StageSender { tx },
        StageReceiver {
            rx: Arc::new(Mutex::new(rx)),
        },
    )
}

/// Producer end.
#[derive(Debug)]
pub struct StageSender<T> {
    tx: mpsc::Sender<T>,
}

impl<T> Clone for StageSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> StageSender<T> {
    /// Wait for room and hand over `item`.
    ///
    /// Fails with `Cancelled` if the signal fires first and `QueueClosed`
    /// if every receiver is gone. The item is dropped in both cases.
    pub async fn enqueue(&self, item: T, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SyncError::Cancelled),
            res = self.tx.send(item) => res.map_err(|_| SyncError::QueueClosed),
        }
    }

    /// Free slots right now.
    pub fn capacity(&self) -> usize {
        self.tx.capacity()
    }
}

/// Consumer end, shareable between workers.
#[derive(Debug)]
pub struct StageReceiver<T> {
    rx: Arc<Mutex<mpsc::Receiver<T>>>,
}

impl<T> Clone for StageReceiver<T> {
    fn clone(&self) -> Self {
        Self {
            rx: Arc::clone(&self.rx),
        }
    }
}

impl<T> StageReceiver<T> {
    /// Next item, or `None` on cancellation or once the queue is closed
    /// and drained.
    pub async fn dequeue(&self, cancel: &CancellationToken) -> Option<T> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            item = async { self.rx.lock().await.recv().await } => item,
        }
    }
}
