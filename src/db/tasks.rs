//! Task lifecycle — create, terminal transitions, stale sweep.
//!
//! A task row is written before any upstream call and moves exactly once
//! from `processing` to `completed` or `failed`. Both transitions are a
//! single conditional `UPDATE ... WHERE status = 'processing'`, so a late
//! completion racing the stale-task sweep simply affects zero rows.

use super::{Database, NewTask, TaskRow};
use anyhow::Result;
use chrono::{DateTime, Utc};

const TASK_COLUMNS: &str = "id, task_id, status, type, COALESCE(prompt, '') AS prompt,
    COALESCE(ref_images, '[]') AS ref_images, COALESCE(image_url, '') AS image_url,
    COALESCE(error_msg, '') AS error_msg, started_at, created_at, updated_at,
    COALESCE(image_count, 1) AS image_count";

pub const STATUS_PROCESSING: &str = "processing";
pub const STATUS_COMPLETED: &str = "completed";
pub const STATUS_FAILED: &str = "failed";

impl Database {
    /// Insert a new `processing` task; `started_at` is fixed here for good.
    pub async fn create_task(&self, task: &NewTask<'_>) -> Result<i64> {
        let now = Utc::now();
        let id = sqlx::query(
            "INSERT INTO generation_tasks
               (task_id, status, type, prompt, ref_images, image_url, error_msg,
                started_at, image_count, created_at, updated_at)
             VALUES (?, 'processing', ?, ?, ?, '', '', ?, ?, ?, ?)",
        )
        .bind(task.task_id)
        .bind(task.kind)
        .bind(task.prompt)
        .bind(task.ref_images)
        .bind(now)
        .bind(task.image_count)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        Ok(id)
    }

    /// `processing → completed`. Returns false, leaving the row untouched,
    /// when the task is already terminal, unknown, or `image_url` is empty.
    pub async fn complete_task(&self, task_id: &str, image_url: &str) -> Result<bool> {
        if image_url.is_empty() {
            return Ok(false);
        }
        let affected = sqlx::query(
            "UPDATE generation_tasks
             SET status = 'completed', image_url = ?, updated_at = ?
             WHERE task_id = ? AND status = 'processing'",
        )
        .bind(image_url)
        .bind(Utc::now())
        .bind(task_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected == 1)
    }

    /// `processing → failed`. Same preconditions as [`Database::complete_task`]
    /// with a non-empty error message.
    pub async fn fail_task(&self, task_id: &str, error_msg: &str) -> Result<bool> {
        if error_msg.is_empty() {
            return Ok(false);
        }
        let affected = sqlx::query(
            "UPDATE generation_tasks
             SET status = 'failed', error_msg = ?, updated_at = ?
             WHERE task_id = ? AND status = 'processing'",
        )
        .bind(error_msg)
        .bind(Utc::now())
        .bind(task_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected == 1)
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<TaskRow>> {
        let sql = format!("SELECT {} FROM generation_tasks WHERE task_id = ?", TASK_COLUMNS);
        let row = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Tasks still `processing`, newest first, optionally of one type.
    pub async fn list_processing_tasks(&self, kind: Option<&str>) -> Result<Vec<TaskRow>> {
        let rows = match kind.filter(|k| !k.is_empty()) {
            Some(kind) => {
                let sql = format!(
                    "SELECT {} FROM generation_tasks
                     WHERE status = 'processing' AND type = ?
                     ORDER BY created_at DESC, id DESC",
                    TASK_COLUMNS
                );
                sqlx::query_as::<_, TaskRow>(&sql)
                    .bind(kind)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let sql = format!(
                    "SELECT {} FROM generation_tasks
                     WHERE status = 'processing'
                     ORDER BY created_at DESC, id DESC",
                    TASK_COLUMNS
                );
                sqlx::query_as::<_, TaskRow>(&sql)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(rows)
    }

    /// Fail every `processing` task that started before `threshold`.
    /// Returns the number of rows flipped.
    pub async fn reap_stale_tasks(&self, threshold: DateTime<Utc>, reason: &str) -> Result<u64> {
        let affected = sqlx::query(
            "UPDATE generation_tasks
             SET status = 'failed', error_msg = ?, updated_at = ?
             WHERE status = 'processing' AND started_at < ?",
        )
        .bind(reason)
        .bind(Utc::now())
        .bind(threshold)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected)
    }

    /// Overwrite `started_at`. Only for tests that need aged tasks.
    #[doc(hidden)]
    pub async fn backdate_task(&self, task_id: &str, started_at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE generation_tasks SET started_at = ?, created_at = ? WHERE task_id = ?")
            .bind(started_at)
            .bind(started_at)
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
