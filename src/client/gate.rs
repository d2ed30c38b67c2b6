//! Shared admission gate for the upload stage.
//!
//! - Rate limiting is per sink: one worker's 429 makes every worker back
//!   off from that sink, and a success resets the backoff
//! - Quota exhaustion suspends the whole stage for a cooldown
//! - Expired credentials hold the whole stage until `resume` is called

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::models::{Result, SyncError};

/// Backoff state for a single sink.
#[derive(Debug, Default)]
pub struct SinkBackoffState {
    /// Consecutive rate-limit responses
    pub consecutive_rate_limits: u32,
    /// Back off until this time
    pub backoff_until: Option<Instant>,
}

impl SinkBackoffState {
    /// Time left before the next attempt.
    pub fn wait_time(&self) -> Duration {
        let now = Instant::now();
        self.backoff_until
            .filter(|&t| t > now)
            .map(|t| t - now)
            .unwrap_or(Duration::ZERO)
    }

    /// Record a rate-limit response and return the resulting backoff.
    ///
    /// A server hint wins; otherwise the cooldown doubles per consecutive
    /// response up to `ceiling`.
    pub fn record_rate_limited(
        &mut self,
        hint: Option<Duration>,
        cooldown: Duration,
        ceiling: Duration,
    ) -> Duration {
        self.consecutive_rate_limits += 1;
        let backoff = hint.unwrap_or_else(|| {
            let factor = 2u32.saturating_pow(self.consecutive_rate_limits.saturating_sub(1));
            cooldown.saturating_mul(factor).min(ceiling)
        });
        self.backoff_until = Some(Instant::now() + backoff);
        backoff
    }

    pub fn record_success(&mut self) {
        if self.consecutive_rate_limits > 0 {
            self.consecutive_rate_limits = 0;
            self.backoff_until = None;
        }
    }
}

/// Stage-wide hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageHold {
    Open,
    /// Quota exhausted; retry after `until`.
    Suspended { until: Instant, reason: String },
    /// Credentials must be renewed by the operator.
    AwaitingReauth { reason: String },
}

/// Upload-stage gate shared by all upload workers.
#[derive(Debug)]
pub struct SinkGate {
    sinks: DashMap<String, SinkBackoffState>,
    hold: watch::Sender<StageHold>,
    cooldown: Duration,
    ceiling: Duration,
    total_rate_limits: AtomicU64,
    total_suspensions: AtomicU64,
    total_wait_ms: AtomicU64,
}

impl SinkGate {
    /// `cooldown` is the rate-limit backoff used when the remote sends no
    /// hint.
    pub fn new(cooldown: Duration) -> Self {
        let (hold, _) = watch::channel(StageHold::Open);
        Self {
            sinks: DashMap::new(),
            hold,
            cooldown,
            ceiling: cooldown.saturating_mul(16),
            total_rate_limits: AtomicU64::new(0),
            total_suspensions: AtomicU64::new(0),
            total_wait_ms: AtomicU64::new(0),
        }
    }

    pub fn hold(&self) -> StageHold {
        self.hold.borrow().clone()
    }

    pub fn awaiting_reauth(&self) -> bool {
        matches!(*self.hold.borrow(), StageHold::AwaitingReauth { .. })
    }

    /// Record a rate-limit response from `sink`.
    pub fn record_rate_limited(&self, sink: &str, hint: Option<Duration>) -> Duration {
        self.total_rate_limits.fetch_add(1, Ordering::Relaxed);
        let mut state = self.sinks.entry(sink.to_string()).or_default();
        let backoff = state.record_rate_limited(hint, self.cooldown, self.ceiling);
        warn!(
            sink,
            consecutive = state.consecutive_rate_limits,
            backoff_ms = backoff.as_millis() as u64,
            "Rate limited, backing off"
        );
        backoff
    }

    pub fn record_success(&self, sink: &str) {
        if let Some(mut state) = self.sinks.get_mut(sink) {
            state.record_success();
        }
    }

    /// Suspend the stage for `cooldown`. A longer existing suspension wins;
    /// an auth hold is not downgraded.
    pub fn suspend_for(&self, cooldown: Duration, reason: impl Into<String>) {
        let until = Instant::now() + cooldown;
        let reason = reason.into();
        let applied = self.hold.send_if_modified(|hold| match hold {
            StageHold::AwaitingReauth { .. } => false,
            StageHold::Suspended { until: current, .. } if *current >= until => false,
            _ => {
                *hold = StageHold::Suspended {
                    until,
                    reason: reason.clone(),
                };
                true
            }
        });
        if applied {
            self.total_suspensions.fetch_add(1, Ordering::Relaxed);
            warn!(
                cooldown_secs = cooldown.as_secs(),
                reason = %reason,
                "Quota exceeded, suspending uploads"
            );
        }
    }

    /// Hold the stage until `resume` is called.
    pub fn require_reauth(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let applied = self.hold.send_if_modified(|hold| {
            if matches!(hold, StageHold::AwaitingReauth { .. }) {
                return false;
            }
            *hold = StageHold::AwaitingReauth {
                reason: reason.clone(),
            };
            true
        });
        if applied {
            error!(reason = %reason, "Sink credentials expired, uploads held until re-authentication");
        }
    }

    /// Lift any stage-wide hold. Returns whether one was active.
    pub fn resume(&self) -> bool {
        let was_held = self.hold.send_if_modified(|hold| {
            if *hold == StageHold::Open {
                return false;
            }
            *hold = StageHold::Open;
            true
        });
        if was_held {
            info!("Uploads resumed");
        }
        was_held
    }

    /// Wait until the stage is open and `sink` is out of backoff.
    pub async fn wait_ready(&self, sink: &str, cancel: &CancellationToken) -> Result<()> {
        let mut rx = self.hold.subscribe();

        loop {
            let hold = rx.borrow_and_update().clone();
            match hold {
                StageHold::Open => {}
                StageHold::Suspended { until, .. } if until > Instant::now() => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                        _ = tokio::time::sleep_until(until) => {
                            self.hold.send_if_modified(|h| match h {
                                StageHold::Suspended { until: u, .. } if *u <= Instant::now() => {
                                    *h = StageHold::Open;
                                    true
                                }
                                _ => false,
                            });
                        }
                        _ = rx.changed() => {}
                    }
                    continue;
                }
                StageHold::Suspended { .. } => {
                    self.hold.send_if_modified(|h| {
                        if matches!(h, StageHold::Suspended { until, .. } if *until <= Instant::now()) {
                            *h = StageHold::Open;
                            true
                        } else {
                            false
                        }
                    });
                    continue;
                }
                StageHold::AwaitingReauth { .. } => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                        _ = rx.changed() => {}
                    }
                    continue;
                }
            }

            let wait = self
                .sinks
                .get(sink)
                .map(|s| s.wait_time())
                .unwrap_or(Duration::ZERO);
            if wait.is_zero() {
                return Ok(());
            }

            debug!(sink, wait_ms = wait.as_millis() as u64, "Waiting for sink backoff");
            self.total_wait_ms
                .fetch_add(wait.as_millis() as u64, Ordering::Relaxed);
            tokio::select! {
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    pub fn stats(&self) -> GateStats {
        GateStats {
            total_rate_limits: self.total_rate_limits.load(Ordering::Relaxed),
            total_suspensions: self.total_suspensions.load(Ordering::Relaxed),
            total_wait_secs: self.total_wait_ms.load(Ordering::Relaxed) as f64 / 1000.0,
            sinks_tracked: self.sinks.len(),
        }
    }
}

/// Gate statistics.
#[derive(Debug, Clone)]
pub struct GateStats {
    pub total_rate_limits: u64,
    pub total_suspensions: u64,
    pub total_wait_secs: f64,
    pub sinks_tracked: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_backoff_doubles_without_hint() {
        let mut state = SinkBackoffState::default();
        let base = Duration::from_secs(1);
        let ceiling = Duration::from_secs(5);
        assert_eq!(state.record_rate_limited(None, base, ceiling), base);
        assert_eq!(
            state.record_rate_limited(None, base, ceiling),
            Duration::from_secs(2)
        );
        assert_eq!(
            state.record_rate_limited(None, base, ceiling),
            Duration::from_secs(4)
        );
        assert_eq!(state.record_rate_limited(None, base, ceiling), ceiling);
        state.record_success();
        assert_eq!(state.wait_time(), Duration::ZERO);
    }

    #[test]
    fn test_hint_wins() {
        let mut state = SinkBackoffState::default();
        let d = state.record_rate_limited(
            Some(Duration::from_millis(1500)),
            Duration::from_secs(60),
            Duration::from_secs(600),
        );
        assert_eq!(d, Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_blocks_only_that_sink() {
        let gate = SinkGate::new(Duration::from_secs(10));
        gate.record_rate_limited("slow", None);
        let cancel = CancellationToken::new();

        let start = Instant::now();
        gate.wait_ready("fast", &cancel).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);

        gate.wait_ready("slow", &cancel).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspension_expires() {
        let gate = SinkGate::new(Duration::from_secs(1));
        gate.suspend_for(Duration::from_secs(3600), "dailyLimitExceeded");
        assert!(matches!(gate.hold(), StageHold::Suspended { .. }));

        let start = Instant::now();
        gate.wait_ready("any", &CancellationToken::new())
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_secs(3600));
        assert_eq!(gate.hold(), StageHold::Open);
        assert_eq!(gate.stats().total_suspensions, 1);
    }

    #[tokio::test]
    async fn test_reauth_hold_until_resume() {
        let gate = Arc::new(SinkGate::new(Duration::from_secs(1)));
        gate.require_reauth("invalid_grant");
        gate.suspend_for(Duration::from_secs(1), "quota");
        assert!(gate.awaiting_reauth());

        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.wait_ready("drive", &CancellationToken::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        assert!(gate.resume());
        waiter.await.unwrap().unwrap();
        assert!(!gate.resume());
    }

    #[tokio::test]
    async fn test_cancel_releases_waiters() {
        let gate = SinkGate::new(Duration::from_secs(1));
        gate.require_reauth("401");
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(gate.wait_ready("drive", &cancel).await.unwrap_err().is_cancelled());
    }
}
