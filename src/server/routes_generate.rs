//! POST /generate: multipart in, task id or SSE stream out.

use axum::extract::multipart::{Multipart, MultipartRejection};
use axum::extract::State;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{error, warn};

use super::{error_response, AppState};
use crate::engine::{GenerateParams, ReferenceUpload};

const NO_TOKEN: &str = "请先配置 API Key";
const TASK_CREATE_FAILED: &str = "创建任务失败";
const BAD_FORM: &str = "无效的请求参数";

#[derive(Default)]
struct GenerateForm {
    prompt: String,
    aspect_ratio: String,
    image_size: String,
    kind: String,
    count: Option<String>,
    images: Vec<ReferenceUpload>,
}

async fn read_form(mut multipart: Multipart) -> Result<GenerateForm, Response> {
    let mut form = GenerateForm::default();
    while let Some(field) = multipart.next_field().await.map_err(|e| {
        warn!(error = %e, "malformed multipart body");
        error_response(StatusCode::BAD_REQUEST, BAD_FORM)
    })? {
        let name = field.name().unwrap_or("").to_string();
        if name == "images" || name == "images[]" {
            let file_name = field.file_name().unwrap_or("upload").to_string();
            let bytes = field.bytes().await.map_err(|e| {
                warn!(error = %e, "failed to read uploaded image");
                error_response(StatusCode::BAD_REQUEST, BAD_FORM)
            })?;
            form.images.push(ReferenceUpload {
                file_name,
                bytes: bytes.to_vec(),
            });
            continue;
        }
        let value = field
            .text()
            .await
            .map_err(|_| error_response(StatusCode::BAD_REQUEST, BAD_FORM))?;
        match name.as_str() {
            "prompt" => form.prompt = value,
            "aspectRatio" => form.aspect_ratio = value,
            "imageSize" => form.image_size = value,
            "type" => form.kind = value,
            "count" => form.count = Some(value),
            _ => {}
        }
    }
    Ok(form)
}

pub(super) async fn handler_generate(
    State(state): State<Arc<AppState>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    let cred = state.credentials.snapshot().await;
    if !cred.has_token() {
        return error_response(StatusCode::UNAUTHORIZED, NO_TOKEN);
    }
    let Some(target) = state.upstream_target(&cred) else {
        return error_response(StatusCode::UNAUTHORIZED, NO_TOKEN);
    };

    let form = match multipart {
        Ok(multipart) => match read_form(multipart).await {
            Ok(form) => form,
            Err(resp) => return resp,
        },
        Err(e) => {
            warn!(error = %e, "generate request is not multipart");
            return error_response(StatusCode::BAD_REQUEST, BAD_FORM);
        }
    };

    let params = GenerateParams::normalise(
        &form.kind,
        &form.prompt,
        &form.aspect_ratio,
        &form.image_size,
        form.count.as_deref(),
    );
    let refs = state.engine.prepare_references(form.images);

    if !params.is_batch() {
        return match state.engine.start_single(target, params, refs).await {
            Ok(accepted) => Json(accepted).into_response(),
            Err(e) => {
                error!(error = %e, "failed to create task");
                error_response(StatusCode::INTERNAL_SERVER_ERROR, TASK_CREATE_FAILED)
            }
        };
    }

    let handle = match state.engine.start_batch(target, params, refs).await {
        Ok(handle) => handle,
        Err(e) => {
            error!(error = %e, "failed to create task");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, TASK_CREATE_FAILED);
        }
    };

    let mut events = handle.events;
    let stream = async_stream::stream! {
        while let Some(event) = events.recv().await {
            match Event::default().event("message").json_data(&event) {
                Ok(frame) => yield Ok::<Event, Infallible>(frame),
                Err(e) => warn!(error = %e, "failed to encode batch event"),
            }
        }
    };

    let mut response = Sse::new(stream).into_response();
    response
        .headers_mut()
        .insert(header::CONNECTION, HeaderValue::from_static("close"));
    response
}
