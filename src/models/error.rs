//! Error types for relaysync.
//!
//! Taxonomy:
//! - Remote failures are classified (`RemoteError`) so stages can decide
//!   between retry, cooldown, stage suspension and permanent failure
//! - Local failures (`SyncError`) cover IO, checkpoint documents, invalid
//!   state transitions and cancellation

use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;

use super::ItemState;

/// Top-level error type for relaysync.
#[derive(Debug, Error)]
pub enum SyncError {
    // ═══════════════════════════════════════════════════════════════════
    // Expected failures (bad input, bad documents)
    // ═══════════════════════════════════════════════════════════════════
    #[error("Configuration error: {0}")]
    Config(#[from] super::ConfigError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Malformed checkpoint document: {0}")]
    MalformedCheckpoint(String),

    #[error("Checkpoint schema version {found} is newer than supported version {supported}")]
    UnsupportedCheckpointVersion { found: u32, supported: u32 },

    // ═══════════════════════════════════════════════════════════════════
    // Infrastructure failures
    // ═══════════════════════════════════════════════════════════════════
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Checkpoint write failed: {0}")]
    CheckpointWrite(String),

    // ═══════════════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════════════
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Stage queue closed")]
    QueueClosed,

    // ═══════════════════════════════════════════════════════════════════
    // Invariant violations (bugs, should not happen)
    // ═══════════════════════════════════════════════════════════════════
    #[error("Invalid transition for item {position}: {from} -> {to}")]
    InvalidTransition {
        position: u64,
        from: ItemState,
        to: ItemState,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Whether this error came from the cancellation signal.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Classified failure reported by a remote source or sink client.
///
/// The classification is the only part of the remote API's error model the
/// pipeline depends on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// Network blip or timeout; retry with exponential backoff.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Remote asked us to slow down; retry after the cooldown.
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    /// Remote quota is exhausted; the whole upload stage waits it out.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Credentials are no longer valid; operator must re-authenticate.
    #[error("authentication expired: {0}")]
    AuthExpired(String),

    /// Permanent failure for this item.
    #[error("fatal: {0}")]
    Fatal(String),
}

/// Coarse classification, used for logging and policy lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteErrorKind {
    Transient,
    RateLimited,
    QuotaExceeded,
    AuthExpired,
    Fatal,
}

static RATE_LIMIT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b429\b|too many requests|rate ?limit|userRateLimitExceeded")
        .expect("static regex")
});

static QUOTA_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)quota|daily ?limit|insufficient storage").expect("static regex")
});

static AUTH_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)invalid_grant|expired or revoked|unauthori[sz]ed|\b401\b")
        .expect("static regex")
});

static NETWORK_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)connection|network|timeout|timed out|temporarily unavailable|\b50[234]\b")
        .expect("static regex")
});

impl RemoteError {
    pub fn kind(&self) -> RemoteErrorKind {
        match self {
            Self::Transient(_) => RemoteErrorKind::Transient,
            Self::RateLimited { .. } => RemoteErrorKind::RateLimited,
            Self::QuotaExceeded(_) => RemoteErrorKind::QuotaExceeded,
            Self::AuthExpired(_) => RemoteErrorKind::AuthExpired,
            Self::Fatal(_) => RemoteErrorKind::Fatal,
        }
    }

    /// Check if the same item may be attempted again.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Fatal(_))
    }

    /// Cooldown hint from the remote, if it sent one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Classify a free-form error message from a remote API.
    ///
    /// Order matters: quota messages often mention "limit" too, so quota is
    /// checked before rate limiting.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        if QUOTA_PATTERN.is_match(&message) {
            Self::QuotaExceeded(message)
        } else if RATE_LIMIT_PATTERN.is_match(&message) {
            Self::RateLimited {
                message,
                retry_after: None,
            }
        } else if AUTH_PATTERN.is_match(&message) {
            Self::AuthExpired(message)
        } else if NETWORK_PATTERN.is_match(&message) {
            Self::Transient(message)
        } else {
            Self::Fatal(message)
        }
    }

    /// Classify a local IO failure raised while talking to a remote.
    pub fn from_io(context: &str, err: &std::io::Error) -> Self {
        use std::io::ErrorKind;

        let message = format!("{context}: {err}");
        match err.kind() {
            ErrorKind::StorageFull => Self::QuotaExceeded(message),
            ErrorKind::PermissionDenied => Self::AuthExpired(message),
            ErrorKind::NotFound | ErrorKind::InvalidInput | ErrorKind::InvalidData => {
                Self::Fatal(message)
            }
            ErrorKind::TimedOut
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe => Self::Transient(message),
            _ => Self::classify(message),
        }
    }
}

/// Result type alias for relaysync.
pub type Result<T> = std::result::Result<T, SyncError>;
