//! # Database — Embedded SQLite Store
//!
//! Async storage for tasks, history, the billable counter and persisted
//! settings via `sqlx::SqlitePool`. The schema is created on connect and a
//! one-shot migration folds legacy soft-deleted rows into `image_deleted`.
//!
//! ## Schema
//!
//! - `generation_tasks`: one row per generation request, with a
//!   processing → completed | failed lifecycle
//! - `generation_histories`: one row per successfully saved image, never
//!   physically deleted
//! - `generation_stats`: singleton billable counter (row `id = 1`)
//! - `app_configs`: key/value settings (token, platform, disclaimer)
//!
//! ## Module Structure
//!
//! - [`tasks`] — task lifecycle and the stale-task sweep
//! - [`history`] — history append, filtered paging, soft deletes
//! - [`stats`] — billable counter
//! - [`settings`] — persisted key/value configuration
//!
//! Timestamps are always bound as `DateTime<Utc>` so every row shares one
//! text encoding and range comparisons stay lexicographic.

mod history;
mod settings;
mod stats;
mod tasks;

pub use history::{day_window, HistoryQuery, PageParams};
pub use settings::{KEY_API_KEY, KEY_DISCLAIMER, KEY_PLATFORM};
pub use tasks::{STATUS_COMPLETED, STATUS_FAILED, STATUS_PROCESSING};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

// ── Task types ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct TaskRow {
    pub id: i64,
    pub task_id: String,
    pub status: String,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub kind: String,
    pub prompt: String,
    pub ref_images: String,
    pub image_url: String,
    pub error_msg: String,
    pub started_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub image_count: i64,
}

pub struct NewTask<'a> {
    pub task_id: &'a str,
    pub kind: &'a str,
    pub prompt: &'a str,
    pub ref_images: &'a str,
    pub image_count: i64,
}

// ── History types ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct HistoryRow {
    pub id: i64,
    pub prompt: String,
    pub original_prompt: String,
    pub image_url: String,
    pub file_name: String,
    pub ref_images: String,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub kind: String,
    pub image_deleted: Option<bool>,
    pub aspect_ratio: String,
    pub image_size: String,
    pub batch_id: Option<String>,
    pub batch_index: Option<i64>,
    pub batch_total: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Batch membership of a history row.
#[derive(Debug, Clone)]
pub struct BatchSlot {
    pub batch_id: String,
    pub index: i64,
    pub total: i64,
}

pub struct NewHistory<'a> {
    pub prompt: &'a str,
    pub image_url: &'a str,
    pub ref_images: &'a str,
    pub kind: &'a str,
    pub aspect_ratio: &'a str,
    pub image_size: &'a str,
    pub batch: Option<BatchSlot>,
}

// ── Database ────────────────────────────────────────────────────

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS generation_tasks (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id     TEXT NOT NULL UNIQUE,
    status      TEXT NOT NULL DEFAULT 'processing',
    type        TEXT NOT NULL,
    prompt      TEXT NOT NULL DEFAULT '',
    ref_images  TEXT NOT NULL DEFAULT '[]',
    image_url   TEXT NOT NULL DEFAULT '',
    error_msg   TEXT NOT NULL DEFAULT '',
    started_at  TEXT NOT NULL,
    image_count INTEGER NOT NULL DEFAULT 1,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_generation_tasks_status ON generation_tasks (status, started_at);

CREATE TABLE IF NOT EXISTS generation_histories (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    prompt          TEXT NOT NULL DEFAULT '',
    original_prompt TEXT NOT NULL DEFAULT '',
    image_url       TEXT NOT NULL DEFAULT '',
    file_name       TEXT NOT NULL DEFAULT '',
    ref_images      TEXT NOT NULL DEFAULT '[]',
    type            TEXT NOT NULL DEFAULT 'create',
    image_deleted   BOOLEAN DEFAULT 0,
    aspect_ratio    TEXT NOT NULL DEFAULT '',
    image_size      TEXT NOT NULL DEFAULT '',
    batch_id        TEXT,
    batch_index     INTEGER,
    batch_total     INTEGER,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_generation_histories_created ON generation_histories (created_at);
CREATE INDEX IF NOT EXISTS idx_generation_histories_batch ON generation_histories (batch_id);

CREATE TABLE IF NOT EXISTS generation_stats (
    id          INTEGER PRIMARY KEY,
    total_count INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS app_configs (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    config_key      TEXT NOT NULL UNIQUE,
    config_value    TEXT NOT NULL DEFAULT '',
    encrypted_value TEXT NOT NULL DEFAULT ''
);
"#;

/// Columns older databases may lack; added in place on connect.
const HISTORY_LATE_COLUMNS: &[(&str, &str)] = &[
    ("type", "TEXT NOT NULL DEFAULT 'create'"),
    ("image_deleted", "BOOLEAN DEFAULT 0"),
    ("aspect_ratio", "TEXT NOT NULL DEFAULT ''"),
    ("image_size", "TEXT NOT NULL DEFAULT ''"),
    ("batch_id", "TEXT"),
    ("batch_index", "INTEGER"),
    ("batch_total", "INTEGER"),
];

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database file and bring the schema up
    /// to date.
    pub async fn connect(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create database directory {}", dir.display()))?;
        }
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await
            .with_context(|| format!("failed to open database {}", path.display()))?;
        let db = Database { pool };
        db.migrate().await?;
        info!(path = %path.display(), "database ready");
        Ok(db)
    }

    /// Private in-memory database on a single pinned connection.
    pub async fn connect_in_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;
        let db = Database { pool };
        db.migrate().await?;
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .context("failed to create schema")?;

        for (column, decl) in HISTORY_LATE_COLUMNS {
            if !self.has_column("generation_histories", column).await? {
                let sql = format!("ALTER TABLE generation_histories ADD COLUMN {} {}", column, decl);
                sqlx::query(&sql).execute(&self.pool).await?;
                info!(column, "added history column");
            }
        }

        if self.has_column("generation_histories", "deleted_at").await? {
            let moved = sqlx::query(
                "UPDATE generation_histories SET image_deleted = 1
                 WHERE deleted_at IS NOT NULL AND (image_deleted IS NULL OR image_deleted = 0)",
            )
            .execute(&self.pool)
            .await?
            .rows_affected();
            if moved > 0 {
                info!(rows = moved, "migrated legacy soft-deleted history rows");
            }
        }
        Ok(())
    }

    async fn has_column(&self, table: &str, column: &str) -> Result<bool> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM pragma_table_info(?) WHERE name = ?")
                .bind(table)
                .bind(column)
                .fetch_one(&self.pool)
                .await?;
        Ok(count > 0)
    }

    /// Health check: `SELECT 1`, used by `/readyz`.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────
