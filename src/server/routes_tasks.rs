//! Task polling: `GET /tasks/processing` and `GET /tasks/:id`.

use axum::extract::{Path as AxumPath, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;

use super::{error_response, AppState};
use crate::db::TaskRow;
use crate::urls::UrlRewriter;

#[derive(Debug, Serialize)]
pub(super) struct TaskResponse {
    id: i64,
    task_id: String,
    status: String,
    #[serde(rename = "type")]
    kind: String,
    prompt: String,
    ref_images: String,
    image_url: String,
    error_msg: String,
    started_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    image_count: i64,
}

impl TaskResponse {
    fn from_row(row: TaskRow, rewriter: &UrlRewriter) -> Self {
        TaskResponse {
            id: row.id,
            task_id: row.task_id,
            status: row.status,
            kind: row.kind,
            prompt: row.prompt,
            ref_images: rewriter.ref_images_json(&row.ref_images),
            image_url: rewriter.to_absolute(&row.image_url),
            error_msg: row.error_msg,
            started_at: row.started_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            image_count: row.image_count,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct ProcessingParams {
    #[serde(rename = "type")]
    kind: Option<String>,
}

/// Lets a restarted client resume polling whatever was in flight.
pub(super) async fn handler_tasks_processing(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ProcessingParams>,
) -> Response {
    let kind = params.kind.as_deref().filter(|k| !k.is_empty());
    match state.db.list_processing_tasks(kind).await {
        Ok(rows) => {
            let body: Vec<TaskResponse> = rows
                .into_iter()
                .map(|row| TaskResponse::from_row(row, &state.rewriter))
                .collect();
            Json(body).into_response()
        }
        Err(e) => {
            error!(error = %e, "failed to list processing tasks");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "获取处理中任务失败")
        }
    }
}

pub(super) async fn handler_task_get(
    State(state): State<Arc<AppState>>,
    AxumPath(task_id): AxumPath<String>,
) -> Response {
    match state.db.get_task(&task_id).await {
        Ok(Some(row)) => Json(TaskResponse::from_row(row, &state.rewriter)).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "任务不存在"),
        Err(e) => {
            error!(task_id = %task_id, error = %e, "task lookup failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "查询任务失败")
        }
    }
}
