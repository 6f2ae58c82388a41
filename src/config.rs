use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::scorer::ScorerKind;

/// Immutable run configuration, parsed once from TOML and threaded through
/// constructors. Nothing mutates it after [`load_config`] returns.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub grouping: GroupingConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

/// Timeout and retry policy for every store operation.
#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
    #[serde(default = "default_transaction_timeout_ms")]
    pub transaction_timeout_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Average latency above this is reported by the health check.
    #[serde(default = "default_slow_operation_ms")]
    pub slow_operation_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            operation_timeout_ms: default_operation_timeout_ms(),
            transaction_timeout_ms: default_transaction_timeout_ms(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            slow_operation_ms: default_slow_operation_ms(),
        }
    }
}

fn default_operation_timeout_ms() -> u64 {
    30_000
}
fn default_transaction_timeout_ms() -> u64 {
    120_000
}
fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    100
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_max_delay_ms() -> u64 {
    5_000
}
fn default_slow_operation_ms() -> u64 {
    1_000
}

impl StoreConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }

    /// Backoff before retrying after failed attempt number `attempt` (1-based):
    /// `base * multiplier^(attempt-1)`, capped at `max_delay_ms`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1) as i32;
        let raw = self.base_delay_ms as f64 * self.backoff_multiplier.powi(exp);
        let capped = raw.min(self.max_delay_ms as f64);
        Duration::from_millis(capped.round() as u64)
    }
}

/// Safeguards for the relation-graph grouping pass. A cap of `0` disables
/// that safeguard, except `total_timeout_ms`, which is always enforced.
#[derive(Debug, Deserialize, Clone)]
pub struct GroupingConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_max_group_size")]
    pub max_group_size: usize,
    #[serde(default = "default_max_stack_size")]
    pub max_stack_size: usize,
    #[serde(default = "default_component_timeout_ms")]
    pub component_timeout_ms: u64,
    #[serde(default = "default_total_timeout_ms")]
    pub total_timeout_ms: u64,
    /// Skip the search up front when the reachable estimate exceeds
    /// `max_group_size * preemptive_skip_factor`.
    #[serde(default = "default_preemptive_skip_factor")]
    pub preemptive_skip_factor: usize,
    #[serde(default = "default_max_field_chars")]
    pub max_field_chars: usize,
    #[serde(default = "default_max_values_per_field")]
    pub max_values_per_field: usize,
}

impl Default for GroupingConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_group_size: default_max_group_size(),
            max_stack_size: default_max_stack_size(),
            component_timeout_ms: default_component_timeout_ms(),
            total_timeout_ms: default_total_timeout_ms(),
            preemptive_skip_factor: default_preemptive_skip_factor(),
            max_field_chars: default_max_field_chars(),
            max_values_per_field: default_max_values_per_field(),
        }
    }
}

fn default_max_iterations() -> usize {
    100_000
}
fn default_max_group_size() -> usize {
    500
}
fn default_max_stack_size() -> usize {
    50_000
}
fn default_component_timeout_ms() -> u64 {
    5_000
}
fn default_total_timeout_ms() -> u64 {
    300_000
}
fn default_preemptive_skip_factor() -> usize {
    10
}
fn default_max_field_chars() -> usize {
    10_000
}
fn default_max_values_per_field() -> usize {
    100
}

impl GroupingConfig {
    pub fn component_timeout(&self) -> Option<Duration> {
        (self.component_timeout_ms > 0).then(|| Duration::from_millis(self.component_timeout_ms))
    }

    pub fn total_timeout(&self) -> Duration {
        Duration::from_millis(self.total_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RecoveryConfig {
    #[serde(default = "default_item_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    #[serde(default = "default_true")]
    pub skip_corrupted_records: bool,
    #[serde(default = "default_max_errors_before_abort")]
    pub max_errors_before_abort: usize,
    #[serde(default = "default_graceful_degradation_threshold")]
    pub graceful_degradation_threshold: f64,
    #[serde(default = "default_error_window_secs")]
    pub error_window_secs: u64,
    #[serde(default = "default_max_memory_errors")]
    pub max_memory_errors: usize,
    #[serde(default = "default_error_log_limit")]
    pub error_log_limit: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_item_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            skip_corrupted_records: true,
            max_errors_before_abort: default_max_errors_before_abort(),
            graceful_degradation_threshold: default_graceful_degradation_threshold(),
            error_window_secs: default_error_window_secs(),
            max_memory_errors: default_max_memory_errors(),
            error_log_limit: default_error_log_limit(),
        }
    }
}

fn default_item_retries() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    1_000
}
fn default_retry_max_delay_ms() -> u64 {
    30_000
}
fn default_true() -> bool {
    true
}
fn default_max_errors_before_abort() -> usize {
    100
}
fn default_graceful_degradation_threshold() -> f64 {
    0.1
}
fn default_error_window_secs() -> u64 {
    300
}
fn default_max_memory_errors() -> usize {
    3
}
fn default_error_log_limit() -> usize {
    1_000
}

impl RecoveryConfig {
    /// Backoff before item retry number `retry` (1-based), doubling from the base.
    pub fn retry_delay(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(20);
        let ms = self
            .retry_base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.retry_max_delay_ms);
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_process_name")]
    pub process_name: String,
    #[serde(default = "default_load_chunk_size")]
    pub load_chunk_size: usize,
    #[serde(default = "default_target_batch_size")]
    pub target_batch_size: usize,
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: usize,
    #[serde(default = "default_page_retries")]
    pub page_retries: u32,
    #[serde(default = "default_page_retry_delay_ms")]
    pub page_retry_delay_ms: u64,
    #[serde(default)]
    pub scorer: ScorerKind,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            process_name: default_process_name(),
            load_chunk_size: default_load_chunk_size(),
            target_batch_size: default_target_batch_size(),
            checkpoint_every: default_checkpoint_every(),
            page_retries: default_page_retries(),
            page_retry_delay_ms: default_page_retry_delay_ms(),
            scorer: ScorerKind::default(),
        }
    }
}

fn default_process_name() -> String {
    "corpus-build".to_string()
}
fn default_load_chunk_size() -> usize {
    1_000
}
fn default_target_batch_size() -> usize {
    100
}
fn default_checkpoint_every() -> usize {
    10
}
fn default_page_retries() -> u32 {
    2
}
fn default_page_retry_delay_ms() -> u64 {
    2_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Default configuration around a database path. Used by tests and
    /// tooling that do not read a config file.
    pub fn with_db_path(path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: path.into(),
                max_connections: default_max_connections(),
            },
            store: StoreConfig::default(),
            grouping: GroupingConfig::default(),
            recovery: RecoveryConfig::default(),
            pipeline: PipelineConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.db.max_connections == 0 {
            anyhow::bail!("db.max_connections must be >= 1");
        }

        // Validate store
        if self.store.max_attempts == 0 {
            anyhow::bail!("store.max_attempts must be >= 1");
        }
        if self.store.backoff_multiplier < 1.0 {
            anyhow::bail!("store.backoff_multiplier must be >= 1.0");
        }
        if self.store.operation_timeout_ms == 0 || self.store.transaction_timeout_ms == 0 {
            anyhow::bail!("store timeouts must be > 0");
        }

        // Validate pipeline
        if self.pipeline.load_chunk_size == 0 {
            anyhow::bail!("pipeline.load_chunk_size must be > 0");
        }
        if self.pipeline.target_batch_size == 0 {
            anyhow::bail!("pipeline.target_batch_size must be > 0");
        }
        if self.pipeline.process_name.trim().is_empty() {
            anyhow::bail!("pipeline.process_name must not be empty");
        }

        // Validate recovery
        if !(0.0..=1.0).contains(&self.recovery.graceful_degradation_threshold) {
            anyhow::bail!("recovery.graceful_degradation_threshold must be in [0.0, 1.0]");
        }
        if self.recovery.error_log_limit == 0 {
            anyhow::bail!("recovery.error_log_limit must be > 0");
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}
