//! Error recovery for long pipeline runs.
//!
//! The [`RecoveryManager`] owns three concerns:
//!
//! | Concern | Where |
//! |---------|-------|
//! | Error capture, classification, persistence | [`errors`], `error_log` table |
//! | Continue/halt decisions over a rolling window | [`RecoveryManager::should_continue`] |
//! | Checkpoints and resume | [`checkpoint`], `run_checkpoints` table |
//!
//! Per-item retries with skip-or-fail semantics live in
//! [`RecoveryManager::process_batch`].

pub mod checkpoint;
pub mod errors;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use sqlx::Row;
use tracing::{debug, info, warn};

use crate::config::RecoveryConfig;
use crate::models::WorkItem;
use crate::store::ResilientStore;

pub use checkpoint::{CheckpointStats, ProcessingCheckpoint};
pub use errors::{ErrorContext, ErrorRecord, ErrorType, Severity};

/// Result of [`RecoveryManager::should_continue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinueDecision {
    pub proceed: bool,
    pub reason: Option<String>,
}

impl ContinueDecision {
    fn proceed() -> Self {
        Self {
            proceed: true,
            reason: None,
        }
    }

    fn halt(reason: String) -> Self {
        Self {
            proceed: false,
            reason: Some(reason),
        }
    }
}

/// Per-batch processing summary.
#[derive(Debug)]
pub struct BatchOutcome<R> {
    pub successful: usize,
    pub failed: usize,
    pub skipped: usize,
    pub results: Vec<R>,
    pub errors: Vec<ErrorRecord>,
    pub failed_keys: Vec<String>,
    pub skipped_keys: Vec<String>,
    /// False when the batch halted early or its failure rate exceeded the
    /// degradation threshold.
    pub can_continue: bool,
    pub halted: Option<String>,
}

impl<R> BatchOutcome<R> {
    fn new() -> Self {
        Self {
            successful: 0,
            failed: 0,
            skipped: 0,
            results: Vec::new(),
            errors: Vec::new(),
            failed_keys: Vec::new(),
            skipped_keys: Vec::new(),
            can_continue: true,
            halted: None,
        }
    }

    pub fn attempted(&self) -> usize {
        self.successful + self.failed + self.skipped
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ErrorAnalysis {
    pub total: usize,
    pub by_type: BTreeMap<String, usize>,
    pub by_severity: BTreeMap<String, usize>,
    pub top_messages: Vec<(String, usize)>,
    pub error_prone_records: Vec<(String, usize)>,
}

const TOP_N: usize = 10;

fn top_counts(counts: HashMap<String, usize>) -> Vec<(String, usize)> {
    let mut entries: Vec<(String, usize)> = counts.into_iter().collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    entries.truncate(TOP_N);
    entries
}

pub struct RecoveryManager {
    store: Arc<ResilientStore>,
    config: RecoveryConfig,
    history: VecDeque<ErrorRecord>,
}

impl RecoveryManager {
    pub fn new(store: Arc<ResilientStore>, config: RecoveryConfig) -> Self {
        Self {
            store,
            config,
            history: VecDeque::new(),
        }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    pub fn errors(&self) -> impl Iterator<Item = &ErrorRecord> {
        self.history.iter()
    }

    /// Classify `err`, record it, and return the record.
    pub async fn capture(
        &mut self,
        err: &anyhow::Error,
        context: ErrorContext,
        retry_count: u32,
    ) -> ErrorRecord {
        let record = ErrorRecord::capture(err, context, retry_count);
        self.record_error(record.clone()).await;
        record
    }

    /// Append to the in-memory history and the persistent log. Failing to
    /// persist is logged, never propagated.
    pub async fn record_error(&mut self, record: ErrorRecord) {
        debug!(
            error_type = %record.error_type,
            severity = %record.severity,
            key = record.context.record_key.as_deref().unwrap_or("-"),
            "recorded error: {}",
            record.message
        );

        if let Err(e) = self.persist_error(&record).await {
            warn!(error = %e, "failed to persist error record");
        }

        self.history.push_back(record);
        while self.history.len() > self.config.error_log_limit {
            self.history.pop_front();
        }
    }

    async fn persist_error(&self, record: &ErrorRecord) -> Result<()> {
        let payload = serde_json::to_string(record)?;
        self.store
            .run(
                "INSERT INTO error_log \
                 (process_name, created_at, error_type, severity, message, record_key, retry_count, payload) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                &[
                    record.context.process_name.as_str().into(),
                    record.timestamp.timestamp_millis().into(),
                    record.error_type.as_str().into(),
                    record.severity.as_str().into(),
                    record.message.as_str().into(),
                    record.context.record_key.as_deref().into(),
                    (record.retry_count as i64).into(),
                    payload.into(),
                ],
            )
            .await?;
        self.store
            .run(
                "DELETE FROM error_log WHERE id NOT IN \
                 (SELECT id FROM error_log ORDER BY id DESC LIMIT ?)",
                &[self.config.error_log_limit.into()],
            )
            .await?;
        Ok(())
    }

    /// Reload the most recent persisted errors for `process_name` into the
    /// in-memory history. Returns how many were loaded.
    pub async fn load_error_history(&mut self, process_name: &str) -> Result<usize> {
        let rows = self
            .store
            .all(
                "SELECT payload FROM error_log WHERE process_name = ? ORDER BY id DESC LIMIT ?",
                &[process_name.into(), self.config.error_log_limit.into()],
            )
            .await?;

        let mut loaded = Vec::with_capacity(rows.len());
        for row in rows.iter().rev() {
            let payload: String = row.get("payload");
            match serde_json::from_str::<ErrorRecord>(&payload) {
                Ok(record) => loaded.push(record),
                Err(e) => warn!(error = %e, "skipping unreadable error_log entry"),
            }
        }

        let count = loaded.len();
        self.history.extend(loaded);
        while self.history.len() > self.config.error_log_limit {
            self.history.pop_front();
        }
        Ok(count)
    }

    /// Decide whether `process_name` may keep going, looking only at errors
    /// inside the rolling window.
    pub fn should_continue(&self, process_name: &str) -> ContinueDecision {
        let window_start = Utc::now() - ChronoDuration::seconds(self.config.error_window_secs as i64);
        let recent: Vec<&ErrorRecord> = self
            .history
            .iter()
            .filter(|r| r.context.process_name == process_name && r.timestamp >= window_start)
            .collect();

        if let Some(critical) = recent.iter().find(|r| r.severity == Severity::Critical) {
            return ContinueDecision::halt(format!("critical error: {}", critical.message));
        }
        if recent.len() > self.config.max_errors_before_abort {
            return ContinueDecision::halt(format!(
                "{} errors in the last {}s exceeds limit of {}",
                recent.len(),
                self.config.error_window_secs,
                self.config.max_errors_before_abort
            ));
        }
        let memory = recent
            .iter()
            .filter(|r| r.error_type == ErrorType::Memory)
            .count();
        if memory > self.config.max_memory_errors {
            return ContinueDecision::halt(format!(
                "{memory} memory errors exceeds limit of {}",
                self.config.max_memory_errors
            ));
        }
        ContinueDecision::proceed()
    }

    /// Run `worker` over every item, retrying failures with backoff.
    ///
    /// An item that still fails after `max_retries` retries is skipped when
    /// `skip_corrupted_records` is set, and counted as failed otherwise. A
    /// critical error ends retries for that item at once. Processing halts
    /// before the next item whenever [`should_continue`](Self::should_continue)
    /// says so.
    pub async fn process_batch<T, R, F, Fut>(
        &mut self,
        items: Vec<T>,
        mut worker: F,
        batch_id: &str,
        process_name: &str,
    ) -> BatchOutcome<R>
    where
        T: WorkItem + Clone,
        F: FnMut(T) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let total = items.len();
        let mut outcome = BatchOutcome::new();

        for item in items {
            let decision = self.should_continue(process_name);
            if !decision.proceed {
                let reason = decision.reason.unwrap_or_default();
                warn!(batch = batch_id, reason = %reason, "halting batch");
                outcome.halted = Some(reason);
                break;
            }

            let key = item.item_key().to_string();
            let mut retry: u32 = 0;
            loop {
                match worker(item.clone()).await {
                    Ok(result) => {
                        outcome.successful += 1;
                        outcome.results.push(result);
                        break;
                    }
                    Err(err) => {
                        let context = ErrorContext::new(process_name)
                            .batch(batch_id)
                            .record(key.as_str())
                            .operation("process_item");
                        let record = self.capture(&err, context, retry).await;
                        let critical = record.severity == Severity::Critical;
                        outcome.errors.push(record);

                        if critical || retry >= self.config.max_retries {
                            if self.config.skip_corrupted_records {
                                warn!(key = %key, retries = retry, "skipping record: {err:#}");
                                outcome.skipped += 1;
                                outcome.skipped_keys.push(key);
                            } else {
                                warn!(key = %key, retries = retry, "record failed: {err:#}");
                                outcome.failed += 1;
                                outcome.failed_keys.push(key);
                            }
                            break;
                        }

                        retry += 1;
                        tokio::time::sleep(self.config.retry_delay(retry)).await;
                    }
                }
            }
        }

        let failure_rate = if total == 0 {
            0.0
        } else {
            outcome.failed as f64 / total as f64
        };
        outcome.can_continue = outcome.halted.is_none()
            && failure_rate <= self.config.graceful_degradation_threshold;

        debug!(
            batch = batch_id,
            successful = outcome.successful,
            failed = outcome.failed,
            skipped = outcome.skipped,
            can_continue = outcome.can_continue,
            "batch processed"
        );
        outcome
    }

    pub async fn create_checkpoint(
        &self,
        process_name: &str,
        stats: &CheckpointStats,
    ) -> Result<String> {
        let checkpoint = ProcessingCheckpoint::new(process_name, stats.clone());
        let payload = checkpoint.to_json()?;
        self.store
            .run(
                "INSERT INTO run_checkpoints (id, process_name, created_at, payload) VALUES (?, ?, ?, ?)",
                &[
                    checkpoint.id.as_str().into(),
                    process_name.into(),
                    checkpoint.created_at.timestamp_millis().into(),
                    payload.into(),
                ],
            )
            .await
            .with_context(|| format!("failed to write checkpoint for {process_name}"))?;

        info!(
            id = %checkpoint.id,
            processed = stats.processed_issues,
            batch = stats.current_batch,
            "checkpoint created"
        );
        Ok(checkpoint.id)
    }

    pub async fn latest_checkpoint(&self, process_name: &str) -> Result<Option<ProcessingCheckpoint>> {
        Ok(self.list_checkpoints(process_name, 1).await?.into_iter().next())
    }

    pub async fn list_checkpoints(
        &self,
        process_name: &str,
        limit: usize,
    ) -> Result<Vec<ProcessingCheckpoint>> {
        let rows = self
            .store
            .all(
                "SELECT payload FROM run_checkpoints WHERE process_name = ? \
                 ORDER BY created_at DESC, rowid DESC LIMIT ?",
                &[process_name.into(), limit.into()],
            )
            .await?;
        rows.iter()
            .map(|row| {
                let payload: String = row.get("payload");
                ProcessingCheckpoint::from_json(&payload).context("unreadable checkpoint payload")
            })
            .collect()
    }

    /// Load checkpoint `id` if a run may resume from it.
    pub async fn resume_from_checkpoint(&self, id: &str) -> Result<Option<ProcessingCheckpoint>> {
        let row = self
            .store
            .get("SELECT payload FROM run_checkpoints WHERE id = ?", &[id.into()])
            .await?;
        let Some(row) = row else {
            warn!(id, "checkpoint not found");
            return Ok(None);
        };
        let payload: String = row.get("payload");
        let checkpoint = ProcessingCheckpoint::from_json(&payload)?;

        if !checkpoint.can_resume(self.config.max_errors_before_abort) {
            warn!(
                id,
                processed = checkpoint.stats.processed_issues,
                failed = checkpoint.stats.failed_issues,
                "checkpoint is not resumable"
            );
            return Ok(None);
        }
        info!(
            id,
            processed = checkpoint.stats.processed_issues,
            batch = checkpoint.stats.current_batch,
            "resuming from checkpoint"
        );
        Ok(Some(checkpoint))
    }

    pub fn analysis(&self) -> ErrorAnalysis {
        let mut by_type = BTreeMap::new();
        let mut by_severity = BTreeMap::new();
        let mut messages: HashMap<String, usize> = HashMap::new();
        let mut keys: HashMap<String, usize> = HashMap::new();

        for record in &self.history {
            *by_type.entry(record.error_type.to_string()).or_insert(0) += 1;
            *by_severity.entry(record.severity.to_string()).or_insert(0) += 1;
            *messages.entry(record.message.clone()).or_insert(0) += 1;
            if let Some(key) = &record.context.record_key {
                *keys.entry(key.clone()).or_insert(0) += 1;
            }
        }

        ErrorAnalysis {
            total: self.history.len(),
            by_type,
            by_severity,
            top_messages: top_counts(messages),
            error_prone_records: top_counts(keys),
        }
    }

    /// Human-readable summary of recorded errors for `process_name`.
    pub fn recovery_report(&self, process_name: &str) -> String {
        let analysis = self.analysis();
        let decision = self.should_continue(process_name);

        let mut out = String::new();
        let title = format!("Recovery report: {process_name}");
        out.push_str(&title);
        out.push('\n');
        out.push_str(&"=".repeat(title.len()));
        out.push('\n');
        out.push_str(&format!("  Errors recorded:  {}\n", analysis.total));
        match &decision.reason {
            None => out.push_str("  Can continue:     yes\n"),
            Some(reason) => out.push_str(&format!("  Can continue:     no ({reason})\n")),
        }

        if analysis.total == 0 {
            return out;
        }

        out.push_str("\n  By type:\n");
        for (name, count) in &analysis.by_type {
            out.push_str(&format!("    {name:<12} {count}\n"));
        }
        out.push_str("\n  By severity:\n");
        for (name, count) in &analysis.by_severity {
            out.push_str(&format!("    {name:<12} {count}\n"));
        }
        out.push_str("\n  Top messages:\n");
        for (message, count) in &analysis.top_messages {
            out.push_str(&format!("    {count:>5}  {message}\n"));
        }
        if !analysis.error_prone_records.is_empty() {
            out.push_str("\n  Most error-prone records:\n");
            for (key, count) in &analysis.error_prone_records {
                out.push_str(&format!("    {count:>5}  {key}\n"));
            }
        }
        out
    }
}
