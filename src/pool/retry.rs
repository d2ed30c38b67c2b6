//! Retry policy for remote calls.
//!
//! Only the classification of a `RemoteError` matters here:
//! - `Transient`: exponential backoff, charged against the stage budget
//! - `RateLimited`: cooldown, not charged
//! - `QuotaExceeded` / `AuthExpired`: stage-wide hold on upload, permanent
//!   on download
//! - `Fatal`: permanent for the item

use crate::models::{RemoteError, RetryConfig, TransferItem};
use serde::Serialize;
use std::future::Future;
use std::time::Duration;

/// Stage a failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Download,
    Upload,
    Cleanup,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Stage::Download => "download",
            Stage::Upload => "upload",
            Stage::Cleanup => "cleanup",
        })
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after `after`; `charged` attempts consume budget.
    Retry { after: Duration, charged: bool },
    /// Hold the whole stage for the cooldown, then retry.
    SuspendStage(Duration),
    /// Hold the whole stage until credentials are renewed, then retry.
    AwaitReauth,
    /// Give up on this item.
    GiveUp,
}

/// Retry and timeout settings shared by all stages.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub attempt_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub rate_limit_cooldown: Duration,
    pub quota_cooldown: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            attempt_timeout: Duration::from_secs(config.attempt_timeout_secs),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
            rate_limit_cooldown: Duration::from_millis(config.rate_limit_cooldown_ms),
            quota_cooldown: Duration::from_secs(config.quota_cooldown_secs),
        }
    }

    /// Backoff before the retry following `failures` charged failures.
    pub fn backoff(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.saturating_sub(1));
        self.backoff_base.saturating_mul(factor).min(self.backoff_max)
    }

    /// Decide how to handle `err` for `item` in `stage`.
    pub fn decide(&self, stage: Stage, item: &TransferItem, err: &RemoteError) -> RetryDecision {
        match err {
            RemoteError::Transient(_) => {
                if item.stage_failures < self.max_retries {
                    RetryDecision::Retry {
                        after: self.backoff(item.stage_failures + 1),
                        charged: true,
                    }
                } else {
                    RetryDecision::GiveUp
                }
            }
            RemoteError::RateLimited { retry_after, .. } => RetryDecision::Retry {
                after: retry_after.unwrap_or(self.rate_limit_cooldown),
                charged: false,
            },
            RemoteError::QuotaExceeded(_) if stage == Stage::Upload => {
                RetryDecision::SuspendStage(self.quota_cooldown)
            }
            RemoteError::AuthExpired(_) if stage == Stage::Upload => RetryDecision::AwaitReauth,
            RemoteError::QuotaExceeded(_) | RemoteError::AuthExpired(_) | RemoteError::Fatal(_) => {
                RetryDecision::GiveUp
            }
        }
    }

    /// Run one remote call under the per-attempt timeout.
    ///
    /// A call that runs out of time counts as a transient failure.
    pub async fn attempt<T, F>(&self, call: F) -> Result<T, RemoteError>
    where
        F: Future<Output = Result<T, RemoteError>>,
    {
        match tokio::time::timeout(self.attempt_timeout, call).await {
            Ok(res) => res,
            Err(_) => Err(RemoteError::Transient(format!(
                "attempt timed out after {:?}",
                self.attempt_timeout
            ))),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceItem;
    use std::path::Path;

    fn item() -> TransferItem {
        TransferItem::new(
            SourceItem {
                position: 1,
                file_name: "a".to_string(),
                size: 1,
                locator: None,
            },
            Path::new("/s"),
        )
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            attempt_timeout: Duration::from_millis(50),
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_millis(350),
            rate_limit_cooldown: Duration::from_secs(60),
            quota_cooldown: Duration::from_secs(86_400),
        }
    }

    #[test]
    fn test_transient_budget_is_bounded() {
        let p = policy();
        let mut it = item();
        let err = RemoteError::Transient("503".to_string());

        let mut waits = Vec::new();
        loop {
            match p.decide(Stage::Download, &it, &err) {
                RetryDecision::Retry { after, charged } => {
                    assert!(charged);
                    waits.push(after.as_millis());
                    it.note_retry("503", charged);
                }
                RetryDecision::GiveUp => break,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(waits, vec![100, 200, 350]);
        assert_eq!(it.retry_count, 3);
    }

    #[test]
    fn test_rate_limit_is_free() {
        let p = policy();
        let mut it = item();
        it.stage_failures = 3;
        let err = RemoteError::RateLimited {
            message: "429".to_string(),
            retry_after: Some(Duration::from_secs(2)),
        };
        assert_eq!(
            p.decide(Stage::Upload, &it, &err),
            RetryDecision::Retry {
                after: Duration::from_secs(2),
                charged: false
            }
        );
    }

    #[test]
    fn test_stage_wide_holds_only_on_upload() {
        let p = policy();
        let it = item();
        let quota = RemoteError::QuotaExceeded("storageQuotaExceeded".to_string());
        let auth = RemoteError::AuthExpired("invalid_grant".to_string());

        assert_eq!(
            p.decide(Stage::Upload, &it, &quota),
            RetryDecision::SuspendStage(Duration::from_secs(86_400))
        );
        assert_eq!(p.decide(Stage::Upload, &it, &auth), RetryDecision::AwaitReauth);
        assert_eq!(p.decide(Stage::Download, &it, &quota), RetryDecision::GiveUp);
        assert_eq!(
            p.decide(Stage::Upload, &it, &RemoteError::Fatal("x".to_string())),
            RetryDecision::GiveUp
        );
    }

    #[tokio::test]
    async fn test_attempt_timeout_is_transient() {
        let p = policy();
        let res: Result<(), RemoteError> = p
            .attempt(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(res, Err(RemoteError::Transient(_))));
    }
}
