//! Credential endpoints.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, info};

use super::{error_response, AppState};
use crate::credentials::{full_masked_key, mask_for_log, masked_key};
use crate::providers::Platform;

const BAD_PARAMS: &str = "参数错误";
const EMPTY_KEY: &str = "API Key 不能为空";

/// GET /config/check: masked token, disclaimer flag and a live quota probe.
pub(super) async fn handler_config_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let cred = state.credentials.snapshot().await;
    let (mut remain, mut used, mut token_name) = (0.0, 0.0, String::new());
    if cred.has_token() {
        if let Some(info) = state.providers.probe_all(&cred.token).await {
            remain = info.remain;
            used = info.used;
            token_name = info.name;
        }
    }
    Json(serde_json::json!({
        "has_api_key": cred.has_token(),
        "masked_key": masked_key(&cred.token),
        "full_masked_key": full_masked_key(&cred.token),
        "raw_key": cred.token,
        "disclaimer_agreed": cred.disclaimer_agreed,
        "remain": remain,
        "used": used,
        "token_name": token_name,
    }))
}

#[derive(Deserialize)]
pub(super) struct ApiKeyPayload {
    #[serde(default)]
    api_key: String,
    #[serde(default)]
    skip_validate: bool,
}

/// POST /config/apikey: store a token bound to the platform that
/// recognises it.
pub(super) async fn handler_set_api_key(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ApiKeyPayload>, JsonRejection>,
) -> Response {
    let Ok(Json(payload)) = payload else {
        return error_response(StatusCode::BAD_REQUEST, BAD_PARAMS);
    };
    if payload.api_key.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, EMPTY_KEY);
    }

    let detected = state.providers.probe_all(&payload.api_key).await;
    let platform = match detected {
        Some(info) => info.platform,
        None if payload.skip_validate => {
            info!("platform detection inconclusive, storing with default platform");
            Platform::default()
        }
        None => return error_response(StatusCode::BAD_REQUEST, "无效的 API Key"),
    };

    if let Err(e) = state.credentials.set_token(&payload.api_key, platform).await {
        error!(token = %mask_for_log(&payload.api_key), error = %e, "failed to store api key");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "保存 API Key 失败");
    }
    Json(serde_json::json!({"status": "success"})).into_response()
}

#[derive(Deserialize)]
pub(super) struct ValidatePayload {
    #[serde(default)]
    api_key: String,
}

/// POST /config/apikey/validate: probe without storing.
pub(super) async fn handler_validate_api_key(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ValidatePayload>, JsonRejection>,
) -> Response {
    let Ok(Json(payload)) = payload else {
        return error_response(StatusCode::BAD_REQUEST, BAD_PARAMS);
    };
    if payload.api_key.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, EMPTY_KEY);
    }
    match state.providers.probe_all(&payload.api_key).await {
        Some(info) => Json(serde_json::json!({
            "valid": true,
            "name": info.name,
            "remain": info.remain,
            "used": info.used,
        }))
        .into_response(),
        None => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "valid": false,
                "error": "无效的 API Key 或未找到数据",
            })),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
pub(super) struct DisclaimerPayload {
    #[serde(default)]
    agreed: bool,
}

/// POST /config/disclaimer
pub(super) async fn handler_set_disclaimer(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<DisclaimerPayload>, JsonRejection>,
) -> Response {
    let Ok(Json(payload)) = payload else {
        return error_response(StatusCode::BAD_REQUEST, BAD_PARAMS);
    };
    if let Err(e) = state.credentials.set_disclaimer(payload.agreed).await {
        error!(error = %e, "failed to store disclaimer flag");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "保存失败");
    }
    Json(serde_json::json!({"status": "success", "agreed": payload.agreed})).into_response()
}
