//! Run checkpoints.
//!
//! A checkpoint is an immutable snapshot of run progress, persisted as JSON
//! in `run_checkpoints` keyed by process name and creation time. Only the
//! latest one is read back, and only on resume.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Progress counters captured by a checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointStats {
    pub total_issues: u64,
    pub processed_issues: u64,
    pub successful_issues: u64,
    pub failed_issues: u64,
    pub skipped_issues: u64,
    /// Index of the last completed batch, counted across resumed segments.
    pub current_batch: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_processed_key: Option<String>,
    /// Free-form per-phase statistics (grouping report, load state, ...).
    #[serde(default)]
    pub phase_stats: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingCheckpoint {
    pub id: String,
    pub process_name: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub stats: CheckpointStats,
}

impl ProcessingCheckpoint {
    pub fn new(process_name: impl Into<String>, stats: CheckpointStats) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            process_name: process_name.into(),
            created_at: Utc::now(),
            stats,
        }
    }

    /// A run may resume from here if it made progress and has not already
    /// failed past the abort threshold.
    pub fn can_resume(&self, max_errors_before_abort: usize) -> bool {
        self.stats.processed_issues > 0
            && self.stats.failed_issues < max_errors_before_abort as u64
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}
