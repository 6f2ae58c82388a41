//! Checkpoint and error history commands.
//!
//! `tcorp checkpoints` lists recent run checkpoints for the configured
//! process; `tcorp errors` restores the persisted error log and prints the
//! recovery report.

use std::sync::Arc;

use anyhow::Result;

use crate::config::Config;
use crate::db;
use crate::recovery::RecoveryManager;
use crate::stats::format_ts_relative;
use crate::store::ResilientStore;

async fn open_recovery(config: &Config) -> Result<(sqlx::SqlitePool, RecoveryManager)> {
    let pool = db::connect(config).await?;
    let store = Arc::new(ResilientStore::new(pool.clone(), config.store.clone()));
    Ok((pool, RecoveryManager::new(store, config.recovery.clone())))
}

pub async fn run_checkpoints(config: &Config, limit: usize) -> Result<()> {
    let (pool, recovery) = open_recovery(config).await?;
    let process = &config.pipeline.process_name;
    let checkpoints = recovery.list_checkpoints(process, limit).await?;

    if checkpoints.is_empty() {
        println!("No checkpoints for {}.", process);
    } else {
        println!(
            "{:<36}  {:>6}  {:>10}  {:>7}  {:>7}  {:<9}  CREATED",
            "ID", "BATCH", "PROCESSED", "FAILED", "SKIPPED", "RESUMABLE"
        );
        for cp in &checkpoints {
            println!(
                "{:<36}  {:>6}  {:>10}  {:>7}  {:>7}  {:<9}  {}",
                cp.id,
                cp.stats.current_batch,
                cp.stats.processed_issues,
                cp.stats.failed_issues,
                cp.stats.skipped_issues,
                if cp.can_resume(config.recovery.max_errors_before_abort) {
                    "yes"
                } else {
                    "no"
                },
                format_ts_relative(cp.created_at.timestamp())
            );
        }
    }

    pool.close().await;
    Ok(())
}

pub async fn run_errors(config: &Config) -> Result<()> {
    let (pool, mut recovery) = open_recovery(config).await?;
    let process = &config.pipeline.process_name;
    recovery.load_error_history(process).await?;
    print!("{}", recovery.recovery_report(process));
    pool.close().await;
    Ok(())
}
