//! Billable counter — a single row, only ever incremented.

use super::Database;
use anyhow::Result;

impl Database {
    pub async fn total_count(&self) -> Result<i64> {
        let total: Option<i64> =
            sqlx::query_scalar("SELECT total_count FROM generation_stats ORDER BY id LIMIT 1")
                .fetch_optional(&self.pool)
                .await?;
        Ok(total.unwrap_or(0))
    }

    /// Add `by` to the counter in one statement and return the new total.
    pub async fn increment_total_count(&self, by: i64) -> Result<i64> {
        let total: i64 = sqlx::query_scalar(
            "INSERT INTO generation_stats (id, total_count) VALUES (1, ?)
             ON CONFLICT(id) DO UPDATE SET total_count = total_count + excluded.total_count
             RETURNING total_count",
        )
        .bind(by)
        .fetch_one(&self.pool)
        .await?;
        Ok(total)
    }
}
