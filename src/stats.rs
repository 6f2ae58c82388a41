//! Database statistics and health overview.
//!
//! Provides a quick summary of the corpus: input records, scored documents,
//! vocabulary size, per-outcome counts for the configured process, the
//! latest checkpoint and recent error volume. Used by `tcorp stats` to give
//! confidence that builds are progressing as expected.

use anyhow::Result;
use sqlx::Row;

use crate::config::Config;
use crate::db;
use crate::recovery::ProcessingCheckpoint;

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let process = &config.pipeline.process_name;

    let total_records: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM records")
        .fetch_one(&pool)
        .await?;

    let total_documents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM corpus_documents")
        .fetch_one(&pool)
        .await?;

    let total_terms: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM corpus_terms")
        .fetch_one(&pool)
        .await?;

    let total_errors: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM error_log WHERE process_name = ?")
            .bind(process.as_str())
            .fetch_one(&pool)
            .await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Ticket Corpus — Database Stats");
    println!("==============================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Records:     {}", total_records);
    println!(
        "  Documents:   {} / {} ({}%)",
        total_documents,
        total_records,
        if total_records > 0 {
            (total_documents * 100) / total_records
        } else {
            0
        }
    );
    println!("  Terms:       {}", total_terms);

    let outcome_rows = sqlx::query(
        r#"
        SELECT outcome, COUNT(*) AS n, MAX(batch_index) AS last_batch
        FROM record_outcomes
        WHERE process_name = ?
        GROUP BY outcome
        ORDER BY n DESC
        "#,
    )
    .bind(process.as_str())
    .fetch_all(&pool)
    .await?;

    if !outcome_rows.is_empty() {
        println!();
        println!("  Outcomes ({}):", process);
        println!("  {:<12} {:>8} {:>12}", "OUTCOME", "RECORDS", "LAST BATCH");
        println!("  {}", "-".repeat(34));
        for row in &outcome_rows {
            let outcome: String = row.get("outcome");
            let n: i64 = row.get("n");
            let last_batch: i64 = row.get("last_batch");
            println!("  {:<12} {:>8} {:>12}", outcome, n, last_batch);
        }
    }

    let checkpoint_row = sqlx::query(
        "SELECT payload FROM run_checkpoints WHERE process_name = ? \
         ORDER BY created_at DESC, rowid DESC LIMIT 1",
    )
    .bind(process.as_str())
    .fetch_optional(&pool)
    .await?;

    println!();
    match checkpoint_row {
        Some(row) => {
            let payload: String = row.get("payload");
            let checkpoint = ProcessingCheckpoint::from_json(&payload)?;
            println!(
                "  Checkpoint:  {} ({})",
                checkpoint.id,
                format_ts_relative(checkpoint.created_at.timestamp())
            );
            println!(
                "               batch {}, {} / {} processed, {} failed, {} skipped",
                checkpoint.stats.current_batch,
                checkpoint.stats.processed_issues,
                checkpoint.stats.total_issues,
                checkpoint.stats.failed_issues,
                checkpoint.stats.skipped_issues
            );
        }
        None => println!("  Checkpoint:  never"),
    }
    println!("  Errors:      {}", total_errors);
    println!();

    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
pub fn format_ts_relative(ts: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_scale_units() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn relative_times() {
        let now = chrono::Utc::now().timestamp();
        assert_eq!(format_ts_relative(now), "just now");
        assert_eq!(format_ts_relative(now - 120), "2 mins ago");
        assert_eq!(format_ts_relative(now - 3600), "1 hour ago");
    }
}
