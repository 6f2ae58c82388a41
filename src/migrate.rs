use anyhow::Result;

use crate::config::Config;
use crate::db;
use crate::store::ResilientStore;

/// Full schema. Every statement is idempotent.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    key TEXT PRIMARY KEY,
    summary TEXT NOT NULL DEFAULT '',
    description TEXT,
    comments TEXT,
    urls TEXT,
    artifacts TEXT,
    pages TEXT
);

CREATE TABLE IF NOT EXISTS corpus_documents (
    record_key TEXT PRIMARY KEY,
    token_count INTEGER NOT NULL,
    term_count INTEGER NOT NULL,
    batch_index INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS record_terms (
    record_key TEXT NOT NULL,
    term TEXT NOT NULL,
    count INTEGER NOT NULL,
    PRIMARY KEY (record_key, term)
);

CREATE TABLE IF NOT EXISTS corpus_terms (
    term TEXT PRIMARY KEY,
    doc_freq INTEGER NOT NULL,
    total_count INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS record_outcomes (
    process_name TEXT NOT NULL,
    record_key TEXT NOT NULL,
    outcome TEXT NOT NULL,
    batch_index INTEGER NOT NULL,
    PRIMARY KEY (process_name, record_key)
);

CREATE TABLE IF NOT EXISTS run_checkpoints (
    id TEXT PRIMARY KEY,
    process_name TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    payload TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS error_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    process_name TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    error_type TEXT NOT NULL,
    severity TEXT NOT NULL,
    message TEXT NOT NULL,
    record_key TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    payload TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_record_terms_term ON record_terms(term);
CREATE INDEX IF NOT EXISTS idx_outcomes_batch ON record_outcomes(process_name, batch_index);
CREATE INDEX IF NOT EXISTS idx_checkpoints_process ON run_checkpoints(process_name, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_error_log_process ON error_log(process_name, id DESC);
"#;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = ResilientStore::new(pool.clone(), config.store.clone());

    store.exec(SCHEMA).await?;

    pool.close().await;
    Ok(())
}
