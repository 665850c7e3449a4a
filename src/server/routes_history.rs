//! History read model and soft deletes.
//!
//! | Endpoint | Filter |
//! |----------|--------|
//! | `GET /history` | optional `date` and `type` |
//! | `GET /history/white-background` etc. | fixed type, `date` ignored |
//!
//! Deletes unlink the image file and flag the row; rows and the billable
//! counter are never touched otherwise.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path as AxumPath, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

use super::{error_response, AppState};
use crate::db::{HistoryQuery, HistoryRow, PageParams};
use crate::engine::GenerationType;
use crate::urls::UrlRewriter;

const DELETED: &str = "删除成功";
const UPDATE_FAILED: &str = "更新记录失败";

#[derive(Debug, Serialize)]
pub(super) struct HistoryResponse {
    id: i64,
    prompt: String,
    original_prompt: String,
    image_url: String,
    file_name: String,
    ref_images: String,
    #[serde(rename = "type")]
    kind: String,
    image_deleted: Option<bool>,
    aspect_ratio: String,
    image_size: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    batch_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    batch_index: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    batch_total: Option<i64>,
}

impl HistoryResponse {
    fn from_row(row: HistoryRow, rewriter: &UrlRewriter) -> Self {
        let aspect_ratio = if row.aspect_ratio.is_empty() {
            "1:1".to_string()
        } else {
            row.aspect_ratio
        };
        let image_size = if row.image_size.is_empty() {
            "2K".to_string()
        } else {
            row.image_size
        };
        HistoryResponse {
            id: row.id,
            prompt: row.prompt,
            original_prompt: row.original_prompt,
            image_url: rewriter.to_absolute(&row.image_url),
            file_name: row.file_name,
            ref_images: rewriter.ref_images_json(&row.ref_images),
            kind: row.kind,
            image_deleted: row.image_deleted,
            aspect_ratio,
            image_size,
            created_at: row.created_at,
            updated_at: row.updated_at,
            batch_id: row.batch_id,
            batch_index: row.batch_index,
            batch_total: row.batch_total,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct HistoryParams {
    date: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    page: Option<String>,
    page_size: Option<String>,
}

impl HistoryParams {
    fn page(&self) -> PageParams {
        PageParams::from_raw(self.page.as_deref(), self.page_size.as_deref())
    }
}

fn parse_day(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").ok()
}

async fn list(state: &AppState, query: HistoryQuery, failure: &str) -> Response {
    match state.db.query_history(&query).await {
        Ok(rows) => {
            let body: Vec<HistoryResponse> = rows
                .into_iter()
                .map(|row| HistoryResponse::from_row(row, &state.rewriter))
                .collect();
            Json(body).into_response()
        }
        Err(e) => {
            error!(error = %e, "history query failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, failure)
        }
    }
}

/// GET /history. An unparsable `date` is ignored rather than rejected.
pub(super) async fn handler_history(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HistoryParams>,
) -> Response {
    let query = HistoryQuery {
        kind: params.kind.clone().filter(|k| !k.is_empty()),
        day: params.date.as_deref().and_then(parse_day),
        page: params.page(),
    };
    list(&state, query, "获取历史记录失败").await
}

async fn typed(state: &AppState, params: &HistoryParams, kind: GenerationType, failure: &str) -> Response {
    let query = HistoryQuery {
        kind: Some(kind.as_str().to_string()),
        day: None,
        page: params.page(),
    };
    list(state, query, failure).await
}

pub(super) async fn handler_history_white_background(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HistoryParams>,
) -> Response {
    typed(&state, &params, GenerationType::WhiteBackground, "获取白底图历史记录失败").await
}

pub(super) async fn handler_history_clothing_change(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HistoryParams>,
) -> Response {
    typed(&state, &params, GenerationType::ClothingChange, "获取换装历史记录失败").await
}

pub(super) async fn handler_history_product_scene(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HistoryParams>,
) -> Response {
    typed(&state, &params, GenerationType::ProductScene, "获取商品图历史记录失败").await
}

pub(super) async fn handler_history_light_shadow(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HistoryParams>,
) -> Response {
    typed(&state, &params, GenerationType::LightShadow, "获取光影融合历史记录失败").await
}

async fn unlink_all(state: &AppState, rows: &[HistoryRow]) {
    for row in rows {
        state.artifacts.remove_generated(&row.image_url).await;
    }
}

fn deleted(count: u64) -> Response {
    Json(serde_json::json!({"message": DELETED, "deleted": count})).into_response()
}

/// DELETE /history/:id
pub(super) async fn handler_history_delete(
    State(state): State<Arc<AppState>>,
    AxumPath(raw_id): AxumPath<String>,
) -> Response {
    let Ok(id) = raw_id.parse::<u32>() else {
        return error_response(StatusCode::BAD_REQUEST, "无效的记录 ID");
    };
    let id = i64::from(id);
    let row = match state.db.get_history(id).await {
        Ok(Some(row)) => row,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "记录不存在"),
        Err(e) => {
            error!(id, error = %e, "history lookup failed");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "查询记录失败");
        }
    };
    state.artifacts.remove_generated(&row.image_url).await;
    match state.db.mark_history_deleted(&[id]).await {
        Ok(_) => {
            info!(id, "history entry deleted");
            Json(serde_json::json!({"message": DELETED})).into_response()
        }
        Err(e) => {
            error!(id, error = %e, "failed to flag history entry");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, UPDATE_FAILED)
        }
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct BatchDeletePayload {
    ids: Vec<i64>,
}

/// POST /history/batch-delete
pub(super) async fn handler_history_batch_delete(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<BatchDeletePayload>, JsonRejection>,
) -> Response {
    let Ok(Json(payload)) = payload else {
        return error_response(StatusCode::BAD_REQUEST, "无效的请求参数");
    };
    if payload.ids.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "请选择要删除的记录");
    }
    match state.db.histories_by_ids(&payload.ids).await {
        Ok(rows) => unlink_all(&state, &rows).await,
        Err(e) => error!(error = %e, "history lookup failed, flagging without unlinking"),
    }
    match state.db.mark_history_deleted(&payload.ids).await {
        Ok(n) => {
            info!(count = n, "history entries deleted");
            deleted(n)
        }
        Err(e) => {
            error!(error = %e, "failed to flag history entries");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, UPDATE_FAILED)
        }
    }
}

/// DELETE /history/batch/:batch_id
pub(super) async fn handler_history_delete_batch(
    State(state): State<Arc<AppState>>,
    AxumPath(batch_id): AxumPath<String>,
) -> Response {
    if batch_id.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "无效的批次 ID");
    }
    let rows = match state.db.histories_by_batch(&batch_id).await {
        Ok(rows) => rows,
        Err(e) => {
            error!(batch_id = %batch_id, error = %e, "batch lookup failed");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "查询批次记录失败");
        }
    };
    if rows.is_empty() {
        return error_response(StatusCode::NOT_FOUND, "批次不存在");
    }
    unlink_all(&state, &rows).await;
    match state.db.mark_batch_deleted(&batch_id).await {
        Ok(n) => {
            info!(batch_id = %batch_id, count = n, "batch deleted");
            deleted(n)
        }
        Err(e) => {
            error!(batch_id = %batch_id, error = %e, "failed to flag batch");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "更新批次记录失败")
        }
    }
}

/// DELETE /history/date/:date
pub(super) async fn handler_history_delete_date(
    State(state): State<Arc<AppState>>,
    AxumPath(raw_date): AxumPath<String>,
) -> Response {
    let Some(day) = parse_day(&raw_date) else {
        return error_response(StatusCode::BAD_REQUEST, "无效的日期格式，请使用 YYYY-MM-DD");
    };
    let rows = match state.db.histories_on_day(day).await {
        Ok(rows) => rows,
        Err(e) => {
            error!(date = %day, error = %e, "day lookup failed");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "查询记录失败");
        }
    };
    if rows.is_empty() {
        return error_response(StatusCode::NOT_FOUND, "该日期没有记录");
    }
    unlink_all(&state, &rows).await;
    match state.db.mark_day_deleted(day).await {
        Ok(n) => {
            info!(date = %day, count = n, "day deleted");
            deleted(n)
        }
        Err(e) => {
            error!(date = %day, error = %e, "failed to flag day");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, UPDATE_FAILED)
        }
    }
}
