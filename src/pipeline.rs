//! Corpus build pipeline.
//!
//! A build runs these phases in order:
//!
//! 1. **Load**: page through `records` in key order. A page that stays
//!    unavailable after `page_retries` retries ends loading early and the
//!    run continues with what it has (`load_incomplete`).
//! 2. **Group**: partition records into relation-connected groups with the
//!    [`GroupingEngine`].
//! 3. **Pack**: fill batches of about `target_batch_size` records without
//!    splitting a group, unless the group alone exceeds the target.
//! 4. **Process**: score each batch and persist every record in its own
//!    transaction under [`RecoveryManager::process_batch`]. A checkpoint is
//!    written every `checkpoint_every` batches.
//! 5. **Finalize**: rebuild `corpus_terms` from `record_terms` and write a
//!    final checkpoint.
//!
//! # Resume
//!
//! With [`RunOptions::resume`], the latest resumable checkpoint is
//! authoritative: outcomes recorded after its batch are discarded, records
//! with a recorded outcome are not processed again, and counters and batch
//! numbering continue from the checkpoint.
//!
//! # Failure
//!
//! Any error after preparation is recorded in the error log with the phase
//! it came from, and the run ends with a checkpoint of the records already
//! committed plus a logged recovery report, the same way a policy halt does.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use chrono::Utc;
use serde::Serialize;
use sqlx::Row;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::db;
use crate::grouping::{GroupingEngine, GroupingReport};
use crate::models::{Batch, Group, Record, ScoredRecord};
use crate::progress::{format_number, BuildProgressEvent, BuildProgressReporter};
use crate::recovery::{BatchOutcome, CheckpointStats, ErrorContext, RecoveryManager};
use crate::scorer::{create_scorer, Scorer};
use crate::store::{PageStatus, ResilientStore, StoreError};

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub resume: bool,
    /// Stop after this many batches, leaving a checkpoint to resume from.
    pub max_batches: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub process_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resumed_from: Option<String>,
    pub records_loaded: usize,
    pub load_incomplete: bool,
    pub records_pending: usize,
    pub batches_run: usize,
    pub successful: usize,
    pub failed: usize,
    pub skipped: usize,
    /// False when `max_batches` stopped the run before every batch ran.
    pub completed: bool,
    pub totals: CheckpointStats,
    pub grouping: GroupingReport,
    pub checkpoint_id: String,
    pub elapsed_ms: u64,
}

/// Pack groups into batches of about `target` records.
///
/// Whole groups are never split across batches unless a single group is
/// larger than `target`; such a group is split into contiguous chunks of
/// `target` records. Batch indices start at `first_index`.
pub fn pack_batches(groups: Vec<Vec<Record>>, target: usize, first_index: usize) -> Vec<Batch> {
    let target = target.max(1);
    let mut batches = Vec::new();
    let mut current: Vec<Record> = Vec::new();

    let flush = |records: Vec<Record>, batches: &mut Vec<Batch>| {
        if !records.is_empty() {
            let index = first_index + batches.len();
            batches.push(Batch { index, records });
        }
    };

    for group in groups {
        if group.len() > target {
            flush(std::mem::take(&mut current), &mut batches);
            let mut rest = group;
            while !rest.is_empty() {
                let tail = rest.split_off(target.min(rest.len()));
                flush(rest, &mut batches);
                rest = tail;
            }
            continue;
        }
        if current.len() + group.len() > target {
            flush(std::mem::take(&mut current), &mut batches);
        }
        current.extend(group);
    }
    flush(current, &mut batches);
    batches
}

/// Resolve group keys back into records, in group order.
fn materialize(groups: &[Group], records: Vec<Record>) -> Vec<Vec<Record>> {
    let mut by_key: HashMap<String, Record> =
        records.into_iter().map(|r| (r.key.clone(), r)).collect();
    groups
        .iter()
        .map(|g| g.keys.iter().filter_map(|k| by_key.remove(k)).collect::<Vec<_>>())
        .filter(|g| !g.is_empty())
        .collect()
}

const UPSERT_DOCUMENT_SQL: &str = "INSERT INTO corpus_documents \
     (record_key, token_count, term_count, batch_index, updated_at) VALUES (?, ?, ?, ?, ?) \
     ON CONFLICT(record_key) DO UPDATE SET token_count = excluded.token_count, \
     term_count = excluded.term_count, batch_index = excluded.batch_index, \
     updated_at = excluded.updated_at";

const UPSERT_OUTCOME_SQL: &str = "INSERT INTO record_outcomes \
     (process_name, record_key, outcome, batch_index) VALUES (?, ?, ?, ?) \
     ON CONFLICT(process_name, record_key) DO UPDATE SET outcome = excluded.outcome, \
     batch_index = excluded.batch_index";

/// Write one scored record: its document row, its terms and its outcome.
/// Every statement is idempotent, so the transaction may be replayed.
async fn persist_scored(
    store: &ResilientStore,
    scored: ScoredRecord,
    batch_index: usize,
    process_name: &str,
) -> Result<(), StoreError> {
    let process_name = process_name.to_string();
    store
        .transaction("persist_record", move |conn| {
            let scored = scored.clone();
            let process_name = process_name.clone();
            Box::pin(async move {
                let now = Utc::now().timestamp_millis();
                sqlx::query(UPSERT_DOCUMENT_SQL)
                    .bind(scored.key.as_str())
                    .bind(scored.token_count as i64)
                    .bind(scored.terms.len() as i64)
                    .bind(batch_index as i64)
                    .bind(now)
                    .execute(&mut *conn)
                    .await?;
                sqlx::query("DELETE FROM record_terms WHERE record_key = ?")
                    .bind(scored.key.as_str())
                    .execute(&mut *conn)
                    .await?;
                for (term, count) in &scored.terms {
                    sqlx::query("INSERT INTO record_terms (record_key, term, count) VALUES (?, ?, ?)")
                        .bind(scored.key.as_str())
                        .bind(term.as_str())
                        .bind(*count as i64)
                        .execute(&mut *conn)
                        .await?;
                }
                sqlx::query(UPSERT_OUTCOME_SQL)
                    .bind(process_name.as_str())
                    .bind(scored.key.as_str())
                    .bind("success")
                    .bind(batch_index as i64)
                    .execute(&mut *conn)
                    .await?;
                Ok::<_, sqlx::Error>(())
            })
        })
        .await
}

/// Counters that are durable so far and the phase currently running.
struct RunState {
    totals: CheckpointStats,
    stage: &'static str,
}

/// A stop decided by the recovery policy rather than by an error.
#[derive(Debug, thiserror::Error)]
#[error("build halted: {0}")]
struct Halted(String);

pub struct Pipeline {
    config: Config,
    store: Arc<ResilientStore>,
    recovery: RecoveryManager,
    scorer: Box<dyn Scorer>,
    progress: Box<dyn BuildProgressReporter>,
}

impl Pipeline {
    pub fn new(
        config: Config,
        store: Arc<ResilientStore>,
        recovery: RecoveryManager,
        scorer: Box<dyn Scorer>,
        progress: Box<dyn BuildProgressReporter>,
    ) -> Self {
        Self {
            config,
            store,
            recovery,
            scorer,
            progress,
        }
    }

    /// Wire a pipeline from configuration alone.
    pub fn from_config(
        config: Config,
        store: Arc<ResilientStore>,
        progress: Box<dyn BuildProgressReporter>,
    ) -> Self {
        let recovery = RecoveryManager::new(store.clone(), config.recovery.clone());
        let scorer = create_scorer(config.pipeline.scorer);
        Self::new(config, store, recovery, scorer, progress)
    }

    pub fn recovery(&self) -> &RecoveryManager {
        &self.recovery
    }

    pub async fn run(&mut self, options: RunOptions) -> Result<RunSummary> {
        let started = Instant::now();
        let process = self.config.pipeline.process_name.clone();

        // Nothing has been processed yet, so the latest checkpoint on disk
        // still describes this process; only the error is recorded.
        let (totals, resumed_from) = match self.prepare(&process, options.resume).await {
            Ok(prepared) => prepared,
            Err(err) => {
                let context = ErrorContext::new(process.as_str()).operation("prepare");
                self.recovery.capture(&err, context, 0).await;
                error!("{}", self.recovery.recovery_report(&process));
                return Err(err.context("build failed while preparing"));
            }
        };

        let mut state = RunState {
            totals,
            stage: "load_records",
        };
        match self
            .build(&process, options, resumed_from, &mut state, started)
            .await
        {
            Ok(summary) => Ok(summary),
            Err(err) => match err.downcast::<Halted>() {
                Ok(Halted(reason)) => Err(self.abort(&process, &state.totals, &reason).await),
                Err(err) => Err(self.fail(&process, &state, err).await),
            },
        }
    }

    /// Every phase after `prepare`. `state` always holds the progress that is
    /// durable so far, so a failure at any point can be checkpointed.
    async fn build(
        &mut self,
        process: &str,
        options: RunOptions,
        resumed_from: Option<String>,
        state: &mut RunState,
        started: Instant,
    ) -> Result<RunSummary> {
        state.stage = "load_records";
        let (records, load_incomplete) = self.load_all().await?;
        let records_loaded = records.len();
        state.totals.total_issues = records_loaded as u64;

        let pending = if resumed_from.is_some() {
            state.stage = "recorded_keys";
            let done = self.recorded_keys(process).await?;
            records
                .into_iter()
                .filter(|r| !done.contains(&r.key))
                .collect::<Vec<_>>()
        } else {
            records
        };
        let records_pending = pending.len();

        state.stage = "group";
        let grouping = GroupingEngine::new(self.config.grouping.clone()).group(&pending);
        if grouping.report.degraded() {
            warn!(report = ?grouping.report, "grouping degraded");
        }
        self.progress.report(BuildProgressEvent::Grouped {
            records: records_pending as u64,
            groups: grouping.groups.len() as u64,
        });
        state.totals.phase_stats.insert(
            "grouping".to_string(),
            serde_json::to_value(&grouping.report)?,
        );
        state
            .totals
            .phase_stats
            .insert("load_incomplete".to_string(), load_incomplete.into());

        let batches = pack_batches(
            materialize(&grouping.groups, pending),
            self.config.pipeline.target_batch_size,
            state.totals.current_batch as usize + 1,
        );
        info!(
            records = records_pending,
            groups = grouping.groups.len(),
            batches = batches.len(),
            "starting batch processing"
        );

        let mut summary = RunSummary {
            process_name: process.to_string(),
            resumed_from,
            records_loaded,
            load_incomplete,
            records_pending,
            batches_run: 0,
            successful: 0,
            failed: 0,
            skipped: 0,
            completed: true,
            totals: CheckpointStats::default(),
            grouping: grouping.report.clone(),
            checkpoint_id: String::new(),
            elapsed_ms: 0,
        };

        let checkpoint_every = self.config.pipeline.checkpoint_every.max(1);
        for batch in batches {
            if let Some(max) = options.max_batches {
                if summary.batches_run >= max {
                    info!(max, "batch limit reached, stopping");
                    summary.completed = false;
                    break;
                }
            }

            let decision = self.recovery.should_continue(process);
            if !decision.proceed {
                return Err(Halted(decision.reason.unwrap_or_default()).into());
            }

            state.stage = "process_batch";
            let outcome = self.process(&batch, process).await;

            // Successful records are committed along with their outcome rows,
            // so they count before the remaining outcomes are written.
            let totals = &mut state.totals;
            totals.processed_issues += outcome.successful as u64;
            totals.successful_issues += outcome.successful as u64;
            totals.current_batch = batch.index as u64;
            totals.last_processed_key = batch.last_key().map(str::to_string);
            summary.successful += outcome.successful;

            state.stage = "record_outcomes";
            self.record_unsuccessful(&outcome, batch.index, process).await?;

            let totals = &mut state.totals;
            totals.processed_issues += (outcome.failed + outcome.skipped) as u64;
            totals.failed_issues += outcome.failed as u64;
            totals.skipped_issues += outcome.skipped as u64;
            summary.batches_run += 1;
            summary.failed += outcome.failed;
            summary.skipped += outcome.skipped;

            self.progress.report(BuildProgressEvent::Processing {
                batch: batch.index as u64,
                n: (summary.successful + summary.failed + summary.skipped) as u64,
                total: records_pending as u64,
            });

            if !outcome.can_continue {
                let reason = outcome.halted.unwrap_or_else(|| {
                    format!(
                        "batch {} failure rate {}/{} exceeds threshold {}",
                        batch.index,
                        outcome.failed,
                        batch.len(),
                        self.config.recovery.graceful_degradation_threshold
                    )
                });
                return Err(Halted(reason).into());
            }

            if summary.batches_run % checkpoint_every == 0 {
                state.stage = "checkpoint";
                self.recovery.create_checkpoint(process, &state.totals).await?;
            }
        }

        if summary.completed {
            state.stage = "finalize_terms";
            self.finalize_terms().await?;
        }
        state.stage = "checkpoint";
        let mut totals = state.totals.clone();
        totals
            .phase_stats
            .insert("completed".to_string(), summary.completed.into());
        summary.checkpoint_id = self.recovery.create_checkpoint(process, &totals).await?;
        summary.totals = totals;
        summary.elapsed_ms = started.elapsed().as_millis() as u64;

        info!(
            batches = summary.batches_run,
            successful = summary.successful,
            failed = summary.failed,
            skipped = summary.skipped,
            completed = summary.completed,
            elapsed_ms = summary.elapsed_ms,
            "build finished"
        );
        Ok(summary)
    }

    /// Establish starting counters: from the latest checkpoint on resume,
    /// from scratch otherwise.
    async fn prepare(
        &mut self,
        process: &str,
        resume: bool,
    ) -> Result<(CheckpointStats, Option<String>)> {
        if resume {
            let resumable = match self.recovery.latest_checkpoint(process).await? {
                Some(latest) => self.recovery.resume_from_checkpoint(&latest.id).await?,
                None => {
                    info!(process, "no checkpoint to resume from, starting fresh");
                    None
                }
            };
            if let Some(checkpoint) = resumable {
                self.store
                    .run(
                        "DELETE FROM record_outcomes WHERE process_name = ? AND batch_index > ?",
                        &[process.into(), (checkpoint.stats.current_batch as i64).into()],
                    )
                    .await?;
                let restored = self.recovery.load_error_history(process).await?;
                info!(
                    id = %checkpoint.id,
                    batch = checkpoint.stats.current_batch,
                    restored_errors = restored,
                    "resuming build"
                );
                let mut stats = checkpoint.stats;
                stats.phase_stats.clear();
                return Ok((stats, Some(checkpoint.id)));
            }
        }

        self.store
            .run("DELETE FROM record_outcomes WHERE process_name = ?", &[process.into()])
            .await?;
        self.store
            .exec("DELETE FROM record_terms; DELETE FROM corpus_documents; DELETE FROM corpus_terms;")
            .await?;
        Ok((CheckpointStats::default(), None))
    }

    async fn load_all(&self) -> Result<(Vec<Record>, bool)> {
        let chunk = self.config.pipeline.load_chunk_size.max(1);
        let retries = self.config.pipeline.page_retries;
        let delay = Duration::from_millis(self.config.pipeline.page_retry_delay_ms);

        let mut records = Vec::new();
        loop {
            let offset = records.len();
            let mut page = self.store.load_records(offset, chunk).await?;
            let mut attempt = 0;
            while page.status == PageStatus::Unavailable && attempt < retries {
                attempt += 1;
                warn!(offset, attempt, "record page unavailable, retrying");
                tokio::time::sleep(delay).await;
                page = self.store.load_records(offset, chunk).await?;
            }

            match page.status {
                PageStatus::Unavailable => {
                    warn!(
                        offset,
                        loaded = records.len(),
                        "giving up on remaining records, continuing with a partial load"
                    );
                    return Ok((records, true));
                }
                PageStatus::More => {
                    records.extend(page.records);
                    self.progress.report(BuildProgressEvent::Loading {
                        loaded: records.len() as u64,
                    });
                }
                PageStatus::Done => {
                    records.extend(page.records);
                    self.progress.report(BuildProgressEvent::Loading {
                        loaded: records.len() as u64,
                    });
                    return Ok((records, false));
                }
            }
        }
    }

    async fn recorded_keys(&self, process: &str) -> Result<HashSet<String>> {
        let rows = self
            .store
            .all(
                "SELECT record_key FROM record_outcomes WHERE process_name = ?",
                &[process.into()],
            )
            .await?;
        Ok(rows.iter().map(|r| r.get::<String, _>("record_key")).collect())
    }

    /// Score `batch`, then persist each record under recovery. If the batch
    /// cannot be scored as a whole, records are scored one at a time so a
    /// single bad record cannot sink its batch.
    async fn process(&mut self, batch: &Batch, process: &str) -> BatchOutcome<String> {
        let batch_id = format!("batch-{}", batch.index);
        let mut prescored: HashMap<String, ScoredRecord> = match self.scorer.score_batch(batch) {
            Ok(scored) => scored.into_iter().map(|s| (s.key.clone(), s)).collect(),
            Err(err) => {
                warn!(batch = batch.index, "batch scoring failed, scoring records individually: {err:#}");
                let context = ErrorContext::new(process)
                    .batch(batch_id.as_str())
                    .operation("score_batch");
                self.recovery.capture(&err, context, 0).await;
                HashMap::new()
            }
        };

        let store: &ResilientStore = &self.store;
        let scorer: &dyn Scorer = self.scorer.as_ref();
        let index = batch.index;
        let worker = |record: Record| {
            let scored = prescored.remove(&record.key);
            async move {
                let scored = match scored {
                    Some(scored) => scored,
                    None => scorer
                        .score_batch(&Batch {
                            index,
                            records: vec![record],
                        })?
                        .into_iter()
                        .next()
                        .ok_or_else(|| anyhow!("scorer produced no output"))?,
                };
                let key = scored.key.clone();
                persist_scored(store, scored, index, process).await?;
                Ok::<_, anyhow::Error>(key)
            }
        };

        self.recovery
            .process_batch(batch.records.clone(), worker, &batch_id, process)
            .await
    }

    async fn record_unsuccessful(
        &self,
        outcome: &BatchOutcome<String>,
        index: usize,
        process: &str,
    ) -> Result<()> {
        for (keys, label) in [(&outcome.failed_keys, "failed"), (&outcome.skipped_keys, "skipped")] {
            for key in keys {
                self.store
                    .run(
                        UPSERT_OUTCOME_SQL,
                        &[process.into(), key.as_str().into(), label.into(), index.into()],
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Rebuild document frequencies from the persisted per-record terms.
    async fn finalize_terms(&self) -> Result<()> {
        let terms = self
            .store
            .transaction("finalize_terms", |conn| {
                Box::pin(async move {
                    sqlx::query("DELETE FROM corpus_terms")
                        .execute(&mut *conn)
                        .await?;
                    let inserted = sqlx::query(
                        "INSERT INTO corpus_terms (term, doc_freq, total_count) \
                         SELECT term, COUNT(*), SUM(count) FROM record_terms GROUP BY term",
                    )
                    .execute(&mut *conn)
                    .await?
                    .rows_affected();
                    Ok::<_, sqlx::Error>(inserted)
                })
            })
            .await?;
        info!(terms, "corpus terms finalized");
        Ok(())
    }

    /// Write a final checkpoint, log the recovery report and build the error
    /// that ends the run.
    async fn abort(&self, process: &str, totals: &CheckpointStats, reason: &str) -> anyhow::Error {
        let mut totals = totals.clone();
        totals
            .phase_stats
            .insert("halted".to_string(), reason.into());
        if let Err(e) = self.recovery.create_checkpoint(process, &totals).await {
            warn!(error = %e, "failed to write final checkpoint");
        }
        error!("{}", self.recovery.recovery_report(process));
        error!(reason, "build halted");
        anyhow!("build halted: {reason}")
    }

    /// Record an unexpected error from `state.stage`, then halt with a
    /// checkpoint of the progress made so far.
    async fn fail(&mut self, process: &str, state: &RunState, err: anyhow::Error) -> anyhow::Error {
        let context = ErrorContext::new(process).operation(state.stage);
        self.recovery.capture(&err, context, 0).await;
        let reason = format!("{} failed: {err:#}", state.stage);
        let _ = self.abort(process, &state.totals, &reason).await;
        err.context(format!("build halted during {}", state.stage))
    }
}

/// Run the `build` command: wire a pipeline from `config`, run it and
/// print the summary on stdout.
pub async fn run_build(
    config: &Config,
    options: RunOptions,
    progress: Box<dyn BuildProgressReporter>,
) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = Arc::new(ResilientStore::new(pool.clone(), config.store.clone()));
    let mut pipeline = Pipeline::from_config(config.clone(), store.clone(), progress);

    let result = pipeline.run(options).await;
    let health = store.health_check();
    if !health.healthy {
        warn!(issues = ?health.issues, "store unhealthy after build");
    }
    pool.close().await;

    let summary = result?;
    print_summary(&summary);
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!("Build {}", if summary.completed { "complete" } else { "paused" });
    if let Some(id) = &summary.resumed_from {
        println!("  Resumed from:  {}", id);
    }
    println!(
        "  Records:       {} loaded, {} pending{}",
        format_number(summary.records_loaded as u64),
        format_number(summary.records_pending as u64),
        if summary.load_incomplete { " (load incomplete)" } else { "" }
    );
    println!(
        "  Groups:        {} ({} singletons, largest {}){}",
        summary.grouping.groups,
        summary.grouping.singletons,
        summary.grouping.largest_group,
        if summary.grouping.degraded() { " degraded" } else { "" }
    );
    println!("  Batches:       {}", summary.batches_run);
    println!(
        "  Outcomes:      {} ok, {} failed, {} skipped",
        summary.successful, summary.failed, summary.skipped
    );
    println!(
        "  Totals:        {} / {} processed through batch {}",
        summary.totals.processed_issues, summary.totals.total_issues, summary.totals.current_batch
    );
    println!("  Checkpoint:    {}", summary.checkpoint_id);
    println!("  Elapsed:       {}ms", summary.elapsed_ms);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(keys: &[&str]) -> Vec<Record> {
        keys.iter().map(|k| Record::new(*k, "s")).collect()
    }

    fn shape(batches: &[Batch]) -> Vec<(usize, Vec<String>)> {
        batches
            .iter()
            .map(|b| (b.index, b.records.iter().map(|r| r.key.clone()).collect()))
            .collect()
    }

    #[test]
    fn groups_are_packed_whole() {
        let batches = pack_batches(
            vec![group(&["A", "B", "F"]), group(&["C", "D"]), group(&["E"])],
            4,
            1,
        );
        assert_eq!(
            shape(&batches),
            vec![
                (1, vec!["A".into(), "B".into(), "F".into()]),
                (2, vec!["C".into(), "D".into(), "E".into()]),
            ]
        );
    }

    #[test]
    fn oversized_group_is_split_contiguously() {
        let batches = pack_batches(
            vec![group(&["X"]), group(&["A", "B", "C", "D", "E"]), group(&["Y"])],
            2,
            7,
        );
        assert_eq!(
            shape(&batches),
            vec![
                (7, vec!["X".into()]),
                (8, vec!["A".into(), "B".into()]),
                (9, vec!["C".into(), "D".into()]),
                (10, vec!["E".into()]),
                (11, vec!["Y".into()]),
            ]
        );
    }

    #[test]
    fn empty_input_yields_no_batches() {
        assert!(pack_batches(Vec::new(), 10, 1).is_empty());
    }

    #[test]
    fn materialize_keeps_group_order_and_drops_unknown_keys() {
        let groups = vec![
            Group {
                keys: vec!["B".into(), "A".into()],
            },
            Group {
                keys: vec!["missing".into()],
            },
            Group::singleton("C"),
        ];
        let out = materialize(&groups, group(&["A", "B", "C"]));
        let keys: Vec<Vec<&str>> = out
            .iter()
            .map(|g| g.iter().map(|r| r.key.as_str()).collect())
            .collect();
        assert_eq!(keys, vec![vec!["B", "A"], vec!["C"]]);
    }
}
