//! Billable-image counter.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::sync::Arc;
use tracing::error;

use super::{error_response, AppState};

pub(super) async fn handler_generation_count(State(state): State<Arc<AppState>>) -> Response {
    match state.db.total_count().await {
        Ok(total) => Json(serde_json::json!({ "total_count": total })).into_response(),
        Err(e) => {
            error!(error = %e, "failed to read generation count");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "获取统计失败")
        }
    }
}

/// Manual +1 kept for older clients.
pub(super) async fn handler_increment_count(State(state): State<Arc<AppState>>) -> Response {
    match state.db.increment_total_count(1).await {
        Ok(total) => Json(serde_json::json!({ "total_count": total })).into_response(),
        Err(e) => {
            error!(error = %e, "failed to increment generation count");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "更新统计失败")
        }
    }
}
