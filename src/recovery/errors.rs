//! Error taxonomy for the corpus pipeline.
//!
//! Failures are classified exactly once, when they are captured into an
//! [`ErrorRecord`]. Structured errors (store, `sqlx`, I/O, JSON) are
//! classified by type; anything else falls back to a best-effort scan of
//! the message for well-known markers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Database,
    Processing,
    Timeout,
    Memory,
    Validation,
    Network,
    System,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::Database => "database",
            ErrorType::Processing => "processing",
            ErrorType::Timeout => "timeout",
            ErrorType::Memory => "memory",
            ErrorType::Validation => "validation",
            ErrorType::Network => "network",
            ErrorType::System => "system",
        }
    }
}

impl std::fmt::Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

const CRITICAL_MARKERS: &[&str] = &["critical", "fatal", "corrupt"];
const MEMORY_MARKERS: &[&str] = &["out of memory", "memory", "allocation failed", "heap"];
const TIMEOUT_MARKERS: &[&str] = &["timed out", "timeout", "deadline"];
const NETWORK_MARKERS: &[&str] = &["network", "connection", "socket", "econnrefused", "dns"];
const DATABASE_MARKERS: &[&str] = &["sqlite", "database", "sql", "constraint", "locked", "busy"];
const VALIDATION_MARKERS: &[&str] = &["invalid", "validation", "malformed", "missing field", "parse"];
const SYSTEM_MARKERS: &[&str] = &["permission denied", "no such file", "eacces", "enoent"];

fn contains_any(haystack: &str, markers: &[&str]) -> bool {
    markers.iter().any(|m| haystack.contains(m))
}

/// Classify a failure. Checks every error in the `anyhow` chain for a
/// structured type before falling back to message markers.
pub fn classify_error(err: &anyhow::Error) -> ErrorType {
    for cause in err.chain() {
        if let Some(store) = cause.downcast_ref::<StoreError>() {
            return match store {
                StoreError::Timeout { .. } => ErrorType::Timeout,
                StoreError::RetryExhausted { .. } | StoreError::Database { .. } => {
                    ErrorType::Database
                }
            };
        }
        if cause.downcast_ref::<sqlx::Error>().is_some() {
            return ErrorType::Database;
        }
        if cause.downcast_ref::<serde_json::Error>().is_some() {
            return ErrorType::Validation;
        }
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            use std::io::ErrorKind;
            return match io.kind() {
                ErrorKind::TimedOut => ErrorType::Timeout,
                ErrorKind::OutOfMemory => ErrorType::Memory,
                ErrorKind::ConnectionRefused
                | ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::NotConnected
                | ErrorKind::AddrInUse
                | ErrorKind::AddrNotAvailable
                | ErrorKind::BrokenPipe => ErrorType::Network,
                ErrorKind::InvalidData | ErrorKind::InvalidInput => ErrorType::Validation,
                _ => ErrorType::System,
            };
        }
    }
    classify_message(&format!("{err:#}"))
}

/// Marker-based classification; a heuristic, not a guarantee.
pub fn classify_message(message: &str) -> ErrorType {
    let lower = message.to_lowercase();
    if contains_any(&lower, MEMORY_MARKERS) {
        ErrorType::Memory
    } else if contains_any(&lower, TIMEOUT_MARKERS) {
        ErrorType::Timeout
    } else if contains_any(&lower, NETWORK_MARKERS) {
        ErrorType::Network
    } else if contains_any(&lower, DATABASE_MARKERS) {
        ErrorType::Database
    } else if contains_any(&lower, VALIDATION_MARKERS) {
        ErrorType::Validation
    } else if contains_any(&lower, SYSTEM_MARKERS) {
        ErrorType::System
    } else {
        ErrorType::Processing
    }
}

pub fn severity_for(error_type: ErrorType, retry_count: u32, message: &str) -> Severity {
    if contains_any(&message.to_lowercase(), CRITICAL_MARKERS) {
        return Severity::Critical;
    }
    match error_type {
        ErrorType::Timeout | ErrorType::Memory if retry_count >= 1 => Severity::High,
        ErrorType::Database if retry_count >= 2 => Severity::High,
        _ if retry_count >= 3 => Severity::High,
        ErrorType::Validation if retry_count == 0 => Severity::Low,
        _ => Severity::Medium,
    }
}

/// Where a failure happened.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorContext {
    pub process_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
}

impl ErrorContext {
    pub fn new(process_name: impl Into<String>) -> Self {
        Self {
            process_name: process_name.into(),
            ..Self::default()
        }
    }

    pub fn batch(mut self, batch_id: impl Into<String>) -> Self {
        self.batch_id = Some(batch_id.into());
        self
    }

    pub fn record(mut self, key: impl Into<String>) -> Self {
        self.record_key = Some(key.into());
        self
    }

    pub fn operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }
}

/// A classified failure. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub error_type: ErrorType,
    pub severity: Severity,
    pub message: String,
    pub context: ErrorContext,
    pub retry_count: u32,
    /// Innermost cause, when the error wrapped another.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

impl ErrorRecord {
    /// Capture and classify `err`.
    pub fn capture(err: &anyhow::Error, context: ErrorContext, retry_count: u32) -> Self {
        let message = format!("{err:#}");
        let error_type = classify_error(err);
        let severity = severity_for(error_type, retry_count, &message);
        let source = err
            .chain()
            .skip(1)
            .last()
            .map(|cause| cause.to_string());
        Self {
            error_type,
            severity,
            message,
            context,
            retry_count,
            source,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Context};

    #[test]
    fn store_errors_classify_structurally() {
        let timeout = anyhow::Error::new(StoreError::Timeout {
            operation: "run".into(),
            timeout_ms: 10,
        });
        assert_eq!(classify_error(&timeout), ErrorType::Timeout);

        let exhausted = anyhow::Error::new(StoreError::RetryExhausted {
            operation: "run".into(),
            attempts: 3,
            kind: crate::store::FailureKind::Busy,
            last_error: sqlx::Error::PoolTimedOut,
        })
        .context("persisting batch 4");
        assert_eq!(classify_error(&exhausted), ErrorType::Database);
    }

    #[test]
    fn io_errors_classify_by_kind() {
        let refused: anyhow::Error =
            std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused").into();
        assert_eq!(classify_error(&refused), ErrorType::Network);

        let timed_out = anyhow::Error::new(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "slow disk",
        ))
        .context("scoring batch");
        assert_eq!(classify_error(&timed_out), ErrorType::Timeout);
    }

    #[test]
    fn messages_fall_back_to_markers() {
        assert_eq!(classify_error(&anyhow!("out of memory while scoring")), ErrorType::Memory);
        assert_eq!(classify_error(&anyhow!("invalid ticket key")), ErrorType::Validation);
        assert_eq!(classify_error(&anyhow!("database is locked")), ErrorType::Database);
        assert_eq!(classify_error(&anyhow!("scorer gave up")), ErrorType::Processing);
    }

    #[test]
    fn severity_escalates_with_retries() {
        assert_eq!(severity_for(ErrorType::Timeout, 0, "t"), Severity::Medium);
        assert_eq!(severity_for(ErrorType::Timeout, 1, "t"), Severity::High);
        assert_eq!(severity_for(ErrorType::Memory, 1, "m"), Severity::High);
        assert_eq!(severity_for(ErrorType::Database, 1, "d"), Severity::Medium);
        assert_eq!(severity_for(ErrorType::Database, 2, "d"), Severity::High);
        assert_eq!(severity_for(ErrorType::Processing, 3, "p"), Severity::High);
        assert_eq!(severity_for(ErrorType::Validation, 0, "v"), Severity::Low);
        assert_eq!(severity_for(ErrorType::Validation, 0, "Fatal: index corrupt"), Severity::Critical);
    }

    #[test]
    fn capture_keeps_context_and_root_cause() {
        let err = Err::<(), _>(std::io::Error::new(std::io::ErrorKind::Other, "disk gone"))
            .context("writing terms")
            .unwrap_err();
        let record = ErrorRecord::capture(
            &err,
            ErrorContext::new("build").batch("batch-3").record("T-9"),
            2,
        );
        assert_eq!(record.error_type, ErrorType::System);
        assert_eq!(record.retry_count, 2);
        assert_eq!(record.source.as_deref(), Some("disk gone"));
        assert_eq!(record.context.record_key.as_deref(), Some("T-9"));
        assert!(record.message.contains("writing terms"));

        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"error_type\":\"system\""));
        let back: ErrorRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.context, record.context);
    }
}
