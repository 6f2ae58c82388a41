//! Resilient wrapper around the SQLite pool.
//!
//! Every store operation goes through [`ResilientStore::execute`], which
//! races the operation against a timeout and retries transient failures
//! (busy/locked database, disk I/O, read-only writes) with exponential
//! backoff. Each call is folded into running statistics that back
//! [`ResilientStore::health_check`].
//!
//! # Cancellation
//!
//! A timed-out attempt is cancelled by dropping its future. The operation
//! receives an [`OpContext`] carrying its deadline so long-running work can
//! stop early. Dropping a `sqlx` transaction before commit rolls it back,
//! but a commit already handed to SQLite may still land after the caller
//! gave up; every write the pipeline issues is an idempotent upsert keyed
//! by record, so such a late commit leaves the corpus consistent.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteQueryResult, SqliteRow};
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::StoreConfig;
use crate::models::Record;

/// How a failed attempt is treated by the retry loop. Computed once from
/// the `sqlx` error when the failure is captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// `SQLITE_BUSY` or pool acquisition timeout.
    Busy,
    /// `SQLITE_LOCKED`.
    Locked,
    /// `SQLITE_IOERR` or a transport-level I/O error.
    Io,
    /// `SQLITE_READONLY`.
    ReadOnly,
    Permanent,
}

impl FailureKind {
    pub fn is_transient(self) -> bool {
        !matches!(self, FailureKind::Permanent)
    }

    pub fn is_lock_contention(self) -> bool {
        matches!(self, FailureKind::Busy | FailureKind::Locked)
    }
}

/// Classify a SQLite result code (primary or extended, as a decimal string).
pub fn classify_sqlite_code(code: &str) -> Option<FailureKind> {
    let code: i64 = code.trim().parse().ok()?;
    Some(match code & 0xff {
        5 => FailureKind::Busy,
        6 => FailureKind::Locked,
        8 => FailureKind::ReadOnly,
        10 => FailureKind::Io,
        _ => FailureKind::Permanent,
    })
}

fn classify_message(message: &str) -> FailureKind {
    let lower = message.to_lowercase();
    if lower.contains("database is locked") || lower.contains("sqlite_busy") {
        FailureKind::Busy
    } else if lower.contains("table is locked") || lower.contains("sqlite_locked") {
        FailureKind::Locked
    } else if lower.contains("disk i/o error") || lower.contains("sqlite_ioerr") {
        FailureKind::Io
    } else if lower.contains("readonly database") || lower.contains("sqlite_readonly") {
        FailureKind::ReadOnly
    } else {
        FailureKind::Permanent
    }
}

pub fn classify(err: &sqlx::Error) -> FailureKind {
    match err {
        sqlx::Error::Database(db) => db
            .code()
            .and_then(|code| classify_sqlite_code(&code))
            .filter(|kind| kind.is_transient())
            .unwrap_or_else(|| classify_message(db.message())),
        sqlx::Error::Io(_) => FailureKind::Io,
        sqlx::Error::PoolTimedOut => FailureKind::Busy,
        other => classify_message(&other.to_string()),
    }
}

/// Errors surfaced by [`ResilientStore`].
#[derive(Error, Debug)]
pub enum StoreError {
    /// The operation did not finish before its deadline.
    #[error("store operation '{operation}' timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Every attempt failed with a transient error.
    #[error("store operation '{operation}' failed after {attempts} attempts: {last_error}")]
    RetryExhausted {
        operation: String,
        attempts: u32,
        kind: FailureKind,
        #[source]
        last_error: sqlx::Error,
    },

    /// A permanent failure; never retried.
    #[error("store operation '{operation}' failed: {source}")]
    Database {
        operation: String,
        #[source]
        source: sqlx::Error,
    },
}

impl StoreError {
    pub fn operation(&self) -> &str {
        match self {
            StoreError::Timeout { operation, .. }
            | StoreError::RetryExhausted { operation, .. }
            | StoreError::Database { operation, .. } => operation,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, StoreError::Timeout { .. })
    }

    /// True when the store may recover on its own (timeouts and exhausted
    /// transient retries), as opposed to a permanent failure.
    pub fn is_temporary(&self) -> bool {
        matches!(
            self,
            StoreError::Timeout { .. } | StoreError::RetryExhausted { .. }
        )
    }
}

/// Per-attempt context handed to the wrapped operation.
#[derive(Debug, Clone, Copy)]
pub struct OpContext {
    /// 1-based attempt number.
    pub attempt: u32,
    pub deadline: Instant,
}

impl OpContext {
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

/// Bookkeeping for one attempt; only aggregated into [`StoreStats`].
#[derive(Debug, Clone, Copy)]
pub struct OperationAttempt {
    pub attempt: u32,
    pub elapsed: Duration,
    pub timed_out: bool,
    pub lock_contended: bool,
}

/// Snapshot of the running call statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub total_calls: u64,
    pub failed_calls: u64,
    pub timeouts: u64,
    pub retried_calls: u64,
    pub lock_contended_calls: u64,
    pub total_attempts: u64,
    pub total_duration_ms: f64,
    pub max_duration_ms: f64,
}

impl StoreStats {
    fn rate(&self, n: u64) -> f64 {
        if self.total_calls == 0 {
            0.0
        } else {
            n as f64 / self.total_calls as f64
        }
    }

    pub fn timeout_rate(&self) -> f64 {
        self.rate(self.timeouts)
    }

    pub fn retry_rate(&self) -> f64 {
        self.rate(self.retried_calls)
    }

    pub fn lock_contention_rate(&self) -> f64 {
        self.rate(self.lock_contended_calls)
    }

    pub fn average_duration_ms(&self) -> f64 {
        if self.total_calls == 0 {
            0.0
        } else {
            self.total_duration_ms / self.total_calls as f64
        }
    }

    fn record(&mut self, duration: Duration, attempts: &[OperationAttempt], failed: bool) {
        let ms = duration.as_secs_f64() * 1000.0;
        self.total_calls += 1;
        self.total_attempts += attempts.len() as u64;
        self.total_duration_ms += ms;
        if ms > self.max_duration_ms {
            self.max_duration_ms = ms;
        }
        if failed {
            self.failed_calls += 1;
        }
        if attempts.len() > 1 {
            self.retried_calls += 1;
        }
        if attempts.iter().any(|a| a.timed_out) {
            self.timeouts += 1;
        }
        if attempts.iter().any(|a| a.lock_contended) {
            self.lock_contended_calls += 1;
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Health {
    pub healthy: bool,
    pub issues: Vec<String>,
}

/// Outcome of a paginated read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageStatus {
    /// A full page was returned; more rows may follow.
    More,
    /// The last page; there is no more data.
    Done,
    /// The read gave up after timeouts or exhausted retries. This says
    /// nothing about whether more data exists.
    Unavailable,
}

#[derive(Debug, Clone)]
pub struct Page {
    pub records: Vec<Record>,
    pub status: PageStatus,
}

impl Page {
    fn unavailable() -> Self {
        Self {
            records: Vec::new(),
            status: PageStatus::Unavailable,
        }
    }
}

/// A positional SQL parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<usize> for SqlValue {
    fn from(v: usize) -> Self {
        SqlValue::Integer(v as i64)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Real(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

fn bind_params<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    params: &[SqlValue],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for param in params {
        query = match param {
            SqlValue::Null => query.bind(None::<String>),
            SqlValue::Integer(v) => query.bind(*v),
            SqlValue::Real(v) => query.bind(*v),
            SqlValue::Text(v) => query.bind(v.clone()),
        };
    }
    query
}

/// Boxed future returned by a transaction's unit of work.
pub type TxFuture<'c, T> = Pin<Box<dyn Future<Output = Result<T, sqlx::Error>> + Send + 'c>>;

const LOAD_RECORDS_SQL: &str = "SELECT key, summary, description, comments, urls, artifacts, pages \
     FROM records ORDER BY key LIMIT ? OFFSET ?";

/// Timeout- and retry-wrapped access to the SQLite pool.
pub struct ResilientStore {
    pool: SqlitePool,
    config: StoreConfig,
    stats: Mutex<StoreStats>,
}

impl ResilientStore {
    pub fn new(pool: SqlitePool, config: StoreConfig) -> Self {
        Self {
            pool,
            config,
            stats: Mutex::new(StoreStats::default()),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Run `op` under a timeout, retrying transient failures.
    ///
    /// `timeout` defaults to `store.operation_timeout_ms`. Permanent
    /// failures return after exactly one attempt; timeouts are not retried.
    pub async fn execute<T, F, Fut>(
        &self,
        name: &str,
        timeout: Option<Duration>,
        mut op: F,
    ) -> Result<T, StoreError>
    where
        F: FnMut(OpContext) -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        let timeout = timeout.unwrap_or_else(|| self.config.operation_timeout());
        let max_attempts = self.config.max_attempts.max(1);
        let started = Instant::now();
        let mut attempts: Vec<OperationAttempt> = Vec::with_capacity(1);
        let mut attempt = 0u32;

        let result = loop {
            attempt += 1;
            let attempt_start = Instant::now();
            let ctx = OpContext {
                attempt,
                deadline: attempt_start + timeout,
            };

            match tokio::time::timeout(timeout, op(ctx)).await {
                Ok(Ok(value)) => {
                    attempts.push(OperationAttempt {
                        attempt,
                        elapsed: attempt_start.elapsed(),
                        timed_out: false,
                        lock_contended: false,
                    });
                    break Ok(value);
                }
                Ok(Err(err)) => {
                    let kind = classify(&err);
                    attempts.push(OperationAttempt {
                        attempt,
                        elapsed: attempt_start.elapsed(),
                        timed_out: false,
                        lock_contended: kind.is_lock_contention(),
                    });

                    if !kind.is_transient() {
                        break Err(StoreError::Database {
                            operation: name.to_string(),
                            source: err,
                        });
                    }
                    if attempt >= max_attempts {
                        warn!(operation = name, attempts = attempt, error = %err, "store retries exhausted");
                        break Err(StoreError::RetryExhausted {
                            operation: name.to_string(),
                            attempts: attempt,
                            kind,
                            last_error: err,
                        });
                    }

                    let delay = self.config.backoff_delay(attempt);
                    debug!(
                        operation = name,
                        attempt,
                        ?kind,
                        retry_in_ms = delay.as_millis() as u64,
                        "transient store failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(_) => {
                    attempts.push(OperationAttempt {
                        attempt,
                        elapsed: attempt_start.elapsed(),
                        timed_out: true,
                        lock_contended: false,
                    });
                    warn!(
                        operation = name,
                        timeout_ms = timeout.as_millis() as u64,
                        "store operation timed out"
                    );
                    break Err(StoreError::Timeout {
                        operation: name.to_string(),
                        timeout_ms: timeout.as_millis() as u64,
                    });
                }
            }
        };

        let elapsed = started.elapsed();
        if let Ok(mut stats) = self.stats.lock() {
            stats.record(elapsed, &attempts, result.is_err());
        }
        result
    }

    /// Fetch at most one row.
    pub async fn get(&self, sql: &str, params: &[SqlValue]) -> Result<Option<SqliteRow>, StoreError> {
        let pool = &self.pool;
        self.execute("get", None, move |_| {
            let query = bind_params(sqlx::query(sql), params);
            async move { query.fetch_optional(pool).await }
        })
        .await
    }

    /// Fetch every row.
    pub async fn all(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqliteRow>, StoreError> {
        let pool = &self.pool;
        self.execute("all", None, move |_| {
            let query = bind_params(sqlx::query(sql), params);
            async move { query.fetch_all(pool).await }
        })
        .await
    }

    /// Execute a single write statement.
    pub async fn run(&self, sql: &str, params: &[SqlValue]) -> Result<SqliteQueryResult, StoreError> {
        let pool = &self.pool;
        self.execute("run", None, move |_| {
            let query = bind_params(sqlx::query(sql), params);
            async move { query.execute(pool).await }
        })
        .await
    }

    /// Execute a parameterless, possibly multi-statement, script.
    pub async fn exec(&self, sql: &str) -> Result<(), StoreError> {
        let pool = &self.pool;
        self.execute("exec", None, move |_| async move {
            sqlx::raw_sql(sql).execute(pool).await.map(|_| ())
        })
        .await
    }

    /// Run `work` inside a transaction, with the longer transaction timeout.
    ///
    /// The whole transaction is retried on transient failure, so `work` must
    /// be safe to run again from scratch.
    pub async fn transaction<T, F>(&self, name: &str, work: F) -> Result<T, StoreError>
    where
        F: for<'c> Fn(&'c mut SqliteConnection) -> TxFuture<'c, T>,
    {
        let pool = &self.pool;
        let work = &work;
        self.execute(name, Some(self.config.transaction_timeout()), move |_| async move {
            let mut tx = pool.begin().await?;
            let value = work(&mut *tx).await?;
            tx.commit().await?;
            Ok::<_, sqlx::Error>(value)
        })
        .await
    }

    /// Read one page of records in key order.
    ///
    /// Timeouts and exhausted retries degrade to a
    /// [`PageStatus::Unavailable`] page instead of an error; permanent
    /// failures are still returned as `Err`.
    pub async fn load_records(&self, offset: usize, limit: usize) -> Result<Page, StoreError> {
        let pool = &self.pool;
        let rows = self
            .execute("load_records", None, move |_| async move {
                sqlx::query(LOAD_RECORDS_SQL)
                    .bind(limit as i64)
                    .bind(offset as i64)
                    .fetch_all(pool)
                    .await
            })
            .await;

        let rows = match rows {
            Ok(rows) => rows,
            Err(err) if err.is_temporary() => {
                warn!(offset, limit, error = %err, "record page unavailable");
                return Ok(Page::unavailable());
            }
            Err(err) => return Err(err),
        };

        let records = rows
            .iter()
            .map(record_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| StoreError::Database {
                operation: "load_records".to_string(),
                source,
            })?;

        let status = if records.len() < limit {
            PageStatus::Done
        } else {
            PageStatus::More
        };
        Ok(Page { records, status })
    }

    pub fn stats(&self) -> StoreStats {
        self.stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn health_check(&self) -> Health {
        let stats = self.stats();
        let mut issues = Vec::new();

        if stats.timeout_rate() > 0.10 {
            issues.push(format!(
                "high timeout rate: {:.1}%",
                stats.timeout_rate() * 100.0
            ));
        }
        if stats.lock_contention_rate() > 0.20 {
            issues.push(format!(
                "high lock contention rate: {:.1}%",
                stats.lock_contention_rate() * 100.0
            ));
        }
        if stats.average_duration_ms() > self.config.slow_operation_ms as f64 {
            issues.push(format!(
                "slow operations: average {:.0}ms",
                stats.average_duration_ms()
            ));
        }

        Health {
            healthy: issues.is_empty(),
            issues,
        }
    }
}

fn record_from_row(row: &SqliteRow) -> Result<Record, sqlx::Error> {
    Ok(Record {
        key: row.try_get("key")?,
        summary: row.try_get::<Option<String>, _>("summary")?.unwrap_or_default(),
        description: row.try_get("description")?,
        comments: row.try_get("comments")?,
        urls: row.try_get("urls")?,
        artifacts: row.try_get("artifacts")?,
        pages: row.try_get("pages")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::cell::Cell;

    fn lazy_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_lazy("sqlite::memory:")
            .unwrap()
    }

    fn store_with(config: StoreConfig) -> ResilientStore {
        ResilientStore::new(lazy_pool(), config)
    }

    fn io_error() -> sqlx::Error {
        sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "disk I/O error",
        ))
    }

    fn retry_config() -> StoreConfig {
        StoreConfig {
            max_attempts: 4,
            base_delay_ms: 100,
            backoff_multiplier: 2.0,
            max_delay_ms: 10_000,
            ..StoreConfig::default()
        }
    }

    #[test]
    fn sqlite_codes_classify_by_primary_code() {
        assert_eq!(classify_sqlite_code("5"), Some(FailureKind::Busy));
        assert_eq!(classify_sqlite_code("517"), Some(FailureKind::Busy));
        assert_eq!(classify_sqlite_code("6"), Some(FailureKind::Locked));
        assert_eq!(classify_sqlite_code("8"), Some(FailureKind::ReadOnly));
        assert_eq!(classify_sqlite_code("266"), Some(FailureKind::Io));
        assert_eq!(classify_sqlite_code("19"), Some(FailureKind::Permanent));
        assert_eq!(classify_sqlite_code("nope"), None);
    }

    #[test]
    fn sqlx_errors_classify() {
        assert_eq!(classify(&io_error()), FailureKind::Io);
        assert_eq!(classify(&sqlx::Error::PoolTimedOut), FailureKind::Busy);
        assert_eq!(classify(&sqlx::Error::RowNotFound), FailureKind::Permanent);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_back_off_then_succeed() {
        let store = store_with(retry_config());
        let calls = Cell::new(0u32);
        let started = Instant::now();

        let value = store
            .execute("flaky", None, |ctx| {
                calls.set(calls.get() + 1);
                async move {
                    if ctx.attempt <= 2 {
                        Err(io_error())
                    } else {
                        Ok(ctx.attempt * 10)
                    }
                }
            })
            .await
            .unwrap();

        // Two failures: 100ms + 200ms of backoff.
        let elapsed = started.elapsed();
        assert_eq!(value, 30);
        assert_eq!(calls.get(), 3);
        assert!(elapsed >= Duration::from_millis(295), "{:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(305), "{:?}", elapsed);

        let stats = store.stats();
        assert_eq!(stats.total_calls, 1);
        assert_eq!(stats.retried_calls, 1);
        assert_eq!(stats.total_attempts, 3);
        assert_eq!(stats.failed_calls, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_are_not_retried() {
        let store = store_with(retry_config());
        let calls = Cell::new(0u32);

        let err = store
            .execute("lookup", None, |_| {
                calls.set(calls.get() + 1);
                async { Err::<(), _>(sqlx::Error::RowNotFound) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.get(), 1);
        assert!(matches!(err, StoreError::Database { .. }));
        assert_eq!(err.operation(), "lookup");
    }

    #[tokio::test(start_paused = true)]
    async fn exhausting_attempts_reports_count_and_last_error() {
        let store = store_with(retry_config());
        let calls = Cell::new(0u32);

        let err = store
            .execute("write", None, |_| {
                calls.set(calls.get() + 1);
                async { Err::<(), _>(io_error()) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.get(), 4);
        match err {
            StoreError::RetryExhausted {
                attempts, kind, ..
            } => {
                assert_eq!(attempts, 4);
                assert_eq!(kind, FailureKind::Io);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.stats().failed_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_operation_times_out_and_marks_health() {
        let store = store_with(retry_config());

        let err = store
            .execute("slow", Some(Duration::from_millis(50)), |ctx| async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, sqlx::Error>(ctx.expired())
            })
            .await
            .unwrap_err();

        match &err {
            StoreError::Timeout {
                operation,
                timeout_ms,
            } => {
                assert_eq!(operation, "slow");
                assert_eq!(*timeout_ms, 50);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.is_temporary());

        let health = store.health_check();
        assert!(!health.healthy);
        assert!(health.issues.iter().any(|i| i.contains("timeout")));
    }

    #[tokio::test(start_paused = true)]
    async fn lock_contention_above_fifth_of_calls_marks_health() {
        let store = store_with(StoreConfig {
            slow_operation_ms: 60_000,
            ..retry_config()
        });

        // One call in four waits on a busy pool before succeeding.
        for call in 0..4u32 {
            store
                .execute("read", None, |ctx| async move {
                    if call == 0 && ctx.attempt == 1 {
                        Err(sqlx::Error::PoolTimedOut)
                    } else {
                        Ok(())
                    }
                })
                .await
                .unwrap();
        }

        let stats = store.stats();
        assert_eq!(stats.lock_contended_calls, 1);
        assert_eq!(stats.timeouts, 0);
        let health = store.health_check();
        assert!(!health.healthy);
        assert_eq!(health.issues.len(), 1, "{:?}", health.issues);
        assert!(health.issues[0].contains("lock contention"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_average_latency_marks_health() {
        let store = store_with(StoreConfig {
            slow_operation_ms: 100,
            ..retry_config()
        });

        store
            .execute("scan", Some(Duration::from_secs(5)), |_| async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok::<_, sqlx::Error>(())
            })
            .await
            .unwrap();

        let stats = store.stats();
        assert_eq!(stats.timeouts, 0);
        assert!(stats.average_duration_ms() >= 500.0);
        let health = store.health_check();
        assert!(!health.healthy);
        assert_eq!(health.issues.len(), 1, "{:?}", health.issues);
        assert!(health.issues[0].contains("slow operations"));
    }

    #[tokio::test]
    async fn fresh_store_is_healthy() {
        let store = store_with(StoreConfig::default());
        let health = store.health_check();
        assert!(health.healthy);
        assert!(health.issues.is_empty());
    }

    #[tokio::test]
    async fn pages_through_records_in_key_order() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = crate::config::Config::with_db_path(tmp.path().join("store.sqlite"));
        let pool = crate::db::connect(&config).await.unwrap();
        let store = ResilientStore::new(pool, StoreConfig::default());
        store.exec(crate::migrate::SCHEMA).await.unwrap();

        for key in ["T-5", "T-1", "T-3", "T-2", "T-4"] {
            store
                .run(
                    "INSERT INTO records (key, summary) VALUES (?, ?)",
                    &[key.into(), format!("summary {key}").into()],
                )
                .await
                .unwrap();
        }

        let first = store.load_records(0, 2).await.unwrap();
        assert_eq!(first.status, PageStatus::More);
        assert_eq!(first.records[0].key, "T-1");
        assert_eq!(first.records[1].key, "T-2");

        let last = store.load_records(4, 2).await.unwrap();
        assert_eq!(last.status, PageStatus::Done);
        assert_eq!(last.records.len(), 1);
        assert_eq!(last.records[0].key, "T-5");

        let row = store
            .get("SELECT summary FROM records WHERE key = ?", &["T-3".into()])
            .await
            .unwrap()
            .unwrap();
        let summary: String = row.get("summary");
        assert_eq!(summary, "summary T-3");
    }

    #[tokio::test]
    async fn starved_page_read_is_unavailable_not_empty() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut config = crate::config::Config::with_db_path(tmp.path().join("starved.sqlite"));
        config.db.max_connections = 1;
        let pool = crate::db::connect(&config).await.unwrap();
        let store = ResilientStore::new(
            pool.clone(),
            StoreConfig {
                operation_timeout_ms: 50,
                ..StoreConfig::default()
            },
        );
        store.exec(crate::migrate::SCHEMA).await.unwrap();

        let held = pool.acquire().await.unwrap();
        let page = store.load_records(0, 10).await.unwrap();
        drop(held);

        assert_eq!(page.status, PageStatus::Unavailable);
        assert!(page.records.is_empty());
    }

    #[tokio::test]
    async fn transaction_commits_unit_of_work() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = crate::config::Config::with_db_path(tmp.path().join("tx.sqlite"));
        let pool = crate::db::connect(&config).await.unwrap();
        let store = ResilientStore::new(pool, StoreConfig::default());
        store.exec(crate::migrate::SCHEMA).await.unwrap();

        let inserted = store
            .transaction("seed", |conn| {
                Box::pin(async move {
                    let mut n = 0;
                    for key in ["A", "B"] {
                        n += sqlx::query("INSERT INTO records (key, summary) VALUES (?, 'x')")
                            .bind(key)
                            .execute(&mut *conn)
                            .await?
                            .rows_affected();
                    }
                    Ok::<_, sqlx::Error>(n)
                })
            })
            .await
            .unwrap();
        assert_eq!(inserted, 2);

        let rows = store.all("SELECT key FROM records", &[]).await.unwrap();
        assert_eq!(rows.len(), 2);
    }
}
