//! History ledger — append on success, filtered paging, soft deletes.
//!
//! Rows are never removed. A user delete unlinks the image file (done by the
//! caller) and sets `image_deleted`; the billable counter is not touched.

use super::{Database, HistoryRow, NewHistory};
use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{QueryBuilder, Sqlite};

const HISTORY_COLUMNS: &str = "id, COALESCE(prompt, '') AS prompt,
    COALESCE(original_prompt, '') AS original_prompt, COALESCE(image_url, '') AS image_url,
    COALESCE(file_name, '') AS file_name, COALESCE(ref_images, '') AS ref_images,
    COALESCE(type, 'create') AS type, image_deleted,
    COALESCE(aspect_ratio, '') AS aspect_ratio, COALESCE(image_size, '') AS image_size,
    batch_id, batch_index, batch_total, created_at, updated_at";

const DEFAULT_PAGE_SIZE: i64 = 100;
const MAX_PAGE_SIZE: i64 = 10_000;

/// Normalised paging: `page >= 1`, `1 <= page_size <= 10000`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageParams {
    pub page: i64,
    pub page_size: i64,
}

impl PageParams {
    /// Lenient parse of raw query values; garbage falls back to defaults.
    pub fn from_raw(page: Option<&str>, page_size: Option<&str>) -> Self {
        let page = page.and_then(|p| p.trim().parse::<i64>().ok()).unwrap_or(1);
        let page_size = page_size
            .and_then(|p| p.trim().parse::<i64>().ok())
            .unwrap_or(DEFAULT_PAGE_SIZE);
        Self::new(page, page_size)
    }

    pub fn new(page: i64, page_size: i64) -> Self {
        let page = page.max(1);
        let page_size = if page_size <= 0 {
            DEFAULT_PAGE_SIZE
        } else {
            page_size.min(MAX_PAGE_SIZE)
        };
        PageParams { page, page_size }
    }

    pub fn offset(&self) -> i64 {
        (self.page - 1).saturating_mul(self.page_size)
    }
}

impl Default for PageParams {
    fn default() -> Self {
        PageParams::new(1, DEFAULT_PAGE_SIZE)
    }
}

/// `[day 00:00 UTC, day + 24h)`.
pub fn day_window(day: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = day.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc();
    (start, start + chrono::Duration::hours(24))
}

#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    pub kind: Option<String>,
    pub day: Option<NaiveDate>,
    pub page: PageParams,
}

impl Database {
    pub async fn insert_history(&self, entry: &NewHistory<'_>) -> Result<i64> {
        let now = Utc::now();
        let file_name = crate::urls::file_name(entry.image_url);
        let (batch_id, batch_index, batch_total) = match &entry.batch {
            Some(b) => (Some(b.batch_id.as_str()), Some(b.index), Some(b.total)),
            None => (None, None, None),
        };
        let id = sqlx::query(
            "INSERT INTO generation_histories
               (prompt, original_prompt, image_url, file_name, ref_images, type, image_deleted,
                aspect_ratio, image_size, batch_id, batch_index, batch_total, created_at, updated_at)
             VALUES (?, '', ?, ?, ?, ?, 0, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(entry.prompt)
        .bind(entry.image_url)
        .bind(file_name)
        .bind(entry.ref_images)
        .bind(entry.kind)
        .bind(entry.aspect_ratio)
        .bind(entry.image_size)
        .bind(batch_id)
        .bind(batch_index)
        .bind(batch_total)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        Ok(id)
    }

    /// Visible history (non-empty URL, not deleted), newest first.
    pub async fn query_history(&self, q: &HistoryQuery) -> Result<Vec<HistoryRow>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {} FROM generation_histories
             WHERE image_url IS NOT NULL AND image_url != ''
               AND (image_deleted = 0 OR image_deleted IS NULL)",
            HISTORY_COLUMNS
        ));
        if let Some(day) = q.day {
            let (start, end) = day_window(day);
            qb.push(" AND created_at >= ").push_bind(start);
            qb.push(" AND created_at < ").push_bind(end);
        }
        if let Some(kind) = q.kind.as_deref().filter(|k| !k.is_empty()) {
            qb.push(" AND type = ").push_bind(kind.to_string());
        }
        qb.push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(q.page.page_size)
            .push(" OFFSET ")
            .push_bind(q.page.offset());
        let rows = qb.build_query_as::<HistoryRow>().fetch_all(&self.pool).await?;
        Ok(rows)
    }

    pub async fn get_history(&self, id: i64) -> Result<Option<HistoryRow>> {
        let sql = format!("SELECT {} FROM generation_histories WHERE id = ?", HISTORY_COLUMNS);
        let row = sqlx::query_as::<_, HistoryRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn histories_by_ids(&self, ids: &[i64]) -> Result<Vec<HistoryRow>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {} FROM generation_histories WHERE id IN (",
            HISTORY_COLUMNS
        ));
        let mut sep = qb.separated(", ");
        for id in ids {
            sep.push_bind(*id);
        }
        sep.push_unseparated(")");
        let rows = qb.build_query_as::<HistoryRow>().fetch_all(&self.pool).await?;
        Ok(rows)
    }

    pub async fn histories_by_batch(&self, batch_id: &str) -> Result<Vec<HistoryRow>> {
        let sql = format!(
            "SELECT {} FROM generation_histories WHERE batch_id = ? ORDER BY batch_index",
            HISTORY_COLUMNS
        );
        let rows = sqlx::query_as::<_, HistoryRow>(&sql)
            .bind(batch_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub async fn histories_on_day(&self, day: NaiveDate) -> Result<Vec<HistoryRow>> {
        let (start, end) = day_window(day);
        let sql = format!(
            "SELECT {} FROM generation_histories WHERE created_at >= ? AND created_at < ?",
            HISTORY_COLUMNS
        );
        let rows = sqlx::query_as::<_, HistoryRow>(&sql)
            .bind(start)
            .bind(end)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub async fn mark_history_deleted(&self, ids: &[i64]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("UPDATE generation_histories SET image_deleted = 1, updated_at = ");
        qb.push_bind(Utc::now());
        qb.push(" WHERE id IN (");
        let mut sep = qb.separated(", ");
        for id in ids {
            sep.push_bind(*id);
        }
        sep.push_unseparated(")");
        let affected = qb.build().execute(&self.pool).await?.rows_affected();
        Ok(affected)
    }

    pub async fn mark_batch_deleted(&self, batch_id: &str) -> Result<u64> {
        let affected = sqlx::query(
            "UPDATE generation_histories SET image_deleted = 1, updated_at = ? WHERE batch_id = ?",
        )
        .bind(Utc::now())
        .bind(batch_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected)
    }

    pub async fn mark_day_deleted(&self, day: NaiveDate) -> Result<u64> {
        let (start, end) = day_window(day);
        let affected = sqlx::query(
            "UPDATE generation_histories SET image_deleted = 1, updated_at = ?
             WHERE created_at >= ? AND created_at < ?",
        )
        .bind(Utc::now())
        .bind(start)
        .bind(end)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected)
    }

    /// Overwrite `created_at`. Only for tests that need dated rows.
    #[doc(hidden)]
    pub async fn backdate_history(&self, id: i64, created_at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE generation_histories SET created_at = ? WHERE id = ?")
            .bind(created_at)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
