//! Versioned checkpoint document.
//!
//! The document is a typed JSON schema. Decoding first reads `version`
//! so that a document written by a newer release is reported as such
//! instead of as a generic parse failure.

use super::{PipelineIdentity, ProgressCounters, ProgressSnapshot, SyncStatus};
use crate::models::{Result, SyncError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current schema version.
pub const CHECKPOINT_VERSION: u32 = 1;

/// Settled part of the counters (items at or below the watermark).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettledBlock {
    #[serde(flatten)]
    pub counters: ProgressCounters,
    pub bytes_transferred: u64,
}

/// Durable snapshot of a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointDocument {
    pub version: u32,
    /// Run that wrote this document
    pub run_id: Uuid,
    pub pipeline: PipelineIdentity,
    pub last_processed_position: Option<u64>,
    pub counters: ProgressCounters,
    pub settled: SettledBlock,
    pub total_bytes_transferred: u64,
    pub status: SyncStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct VersionHeader {
    version: u32,
}

impl CheckpointDocument {
    /// Capture `snapshot` as a document written by `run_id`.
    pub fn from_snapshot(run_id: Uuid, snapshot: &ProgressSnapshot) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            run_id,
            pipeline: snapshot.identity.clone(),
            last_processed_position: snapshot.last_processed_position,
            counters: snapshot.counters,
            settled: SettledBlock {
                counters: snapshot.settled,
                bytes_transferred: snapshot.settled_bytes,
            },
            total_bytes_transferred: snapshot.total_bytes_transferred,
            status: snapshot.status,
            started_at: snapshot.started_at,
            updated_at: snapshot.last_updated_at,
        }
    }

    /// The snapshot this document describes.
    pub fn to_snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            identity: self.pipeline.clone(),
            last_processed_position: self.last_processed_position,
            counters: self.counters,
            settled: self.settled.counters,
            settled_bytes: self.settled.bytes_transferred,
            total_bytes_transferred: self.total_bytes_transferred,
            status: self.status,
            started_at: self.started_at,
            last_updated_at: self.updated_at,
        }
    }

    /// Serialize to a single-line JSON document.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| SyncError::Internal(format!("Serializing checkpoint: {e}")))
    }

    /// Parse a document, checking the schema version first.
    pub fn decode(text: &str) -> Result<Self> {
        let header: VersionHeader = serde_json::from_str(text)
            .map_err(|e| SyncError::MalformedCheckpoint(format!("missing version: {e}")))?;

        if header.version > CHECKPOINT_VERSION {
            return Err(SyncError::UnsupportedCheckpointVersion {
                found: header.version,
                supported: CHECKPOINT_VERSION,
            });
        }

        let doc: Self = serde_json::from_str(text)
            .map_err(|e| SyncError::MalformedCheckpoint(e.to_string()))?;
        doc.validate()?;
        Ok(doc)
    }

    fn validate(&self) -> Result<()> {
        if !self.counters.is_consistent() {
            return Err(SyncError::MalformedCheckpoint(format!(
                "counters violate downloaded ≥ uploaded ≥ cleaned: {:?}",
                self.counters
            )));
        }
        if !self.settled.counters.is_consistent() {
            return Err(SyncError::MalformedCheckpoint(format!(
                "settled counters violate downloaded ≥ uploaded ≥ cleaned: {:?}",
                self.settled.counters
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_doc() -> CheckpointDocument {
        CheckpointDocument {
            version: CHECKPOINT_VERSION,
            run_id: Uuid::new_v4(),
            pipeline: PipelineIdentity::new(-1001234567890, "photos"),
            last_processed_position: Some(123_456),
            counters: ProgressCounters {
                discovered: 1_024,
                downloaded: 987,
                uploaded: 950,
                cleaned: 949,
                failed: 12,
            },
            settled: SettledBlock {
                counters: ProgressCounters {
                    discovered: 960,
                    downloaded: 948,
                    uploaded: 948,
                    cleaned: 948,
                    failed: 12,
                },
                bytes_transferred: 77_000_000_000,
            },
            total_bytes_transferred: 80_123_456_789,
            status: SyncStatus::Paused,
            started_at: Utc.with_ymd_and_hms(2026, 3, 1, 8, 30, 0).unwrap(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_multi_digit_values_survive_encoding() {
        let doc = sample_doc();
        let text = doc.encode().unwrap();
        assert!(text.contains("\"last_processed_position\":123456"));
        assert!(text.contains("\"status\":\"paused\""));
        assert!(!text.contains('\n'));

        let back = CheckpointDocument::decode(&text).unwrap();
        assert_eq!(back, doc);
    }

    #[test]
    fn test_snapshot_conversion_is_lossless() {
        let doc = sample_doc();
        let back = CheckpointDocument::from_snapshot(doc.run_id, &doc.to_snapshot());
        assert_eq!(back, doc);
    }

    #[test]
    fn test_newer_version_is_reported() {
        let mut doc = sample_doc();
        doc.version = CHECKPOINT_VERSION + 1;
        let text = serde_json::to_string(&doc).unwrap();
        assert!(matches!(
            CheckpointDocument::decode(&text),
            Err(SyncError::UnsupportedCheckpointVersion { found, .. }) if found == CHECKPOINT_VERSION + 1
        ));
    }

    #[test]
    fn test_malformed_documents_are_errors() {
        assert!(matches!(
            CheckpointDocument::decode("🔄 Sync State\n```json\n{}\n```"),
            Err(SyncError::MalformedCheckpoint(_))
        ));
        assert!(matches!(
            CheckpointDocument::decode(r#"{"version":1,"run_id":"nope"}"#),
            Err(SyncError::MalformedCheckpoint(_))
        ));

        let mut doc = sample_doc();
        doc.counters.cleaned = doc.counters.uploaded + 1;
        let text = serde_json::to_string(&doc).unwrap();
        assert!(matches!(
            CheckpointDocument::decode(&text),
            Err(SyncError::MalformedCheckpoint(_))
        ));
    }
}
