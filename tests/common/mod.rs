//! Shared test helpers for integration tests.
//!
//! Every app gets its own temp directories and in-memory store, so tests
//! run in parallel without touching each other or the network.

#![allow(dead_code)]

pub mod mock_upstream;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use clap::Parser;
use http_body_util::BodyExt;
use sigma::config::Config;
use sigma::db::Database;
use sigma::providers::{Platform, Provider, ProviderSet, SheetScale};
use sigma::server::{build_router, AppState};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

use mock_upstream::{MockUpstream, AI_PREFIX, VE_PREFIX};

pub const LIVE_PORT: u16 = 8080;
pub const BOUNDARY: &str = "sigma-test-boundary";

pub struct TestApp {
    pub router: Router,
    pub state: Arc<AppState>,
    pub dir: TempDir,
}

impl TestApp {
    pub fn app(&self) -> Router {
        self.router.clone()
    }
}

/// Config rooted in `dir`, with port discovery off.
pub fn test_config(dir: &TempDir, extra: &[&str]) -> Config {
    let root = dir.path();
    let mut args: Vec<String> = vec![
        "sigma".into(),
        "--output-dir".into(),
        root.join("output").display().to_string(),
        "--upload-dir".into(),
        root.join("uploads").display().to_string(),
        "--db-path".into(),
        root.join("history.db").display().to_string(),
        "--port".into(),
        LIVE_PORT.to_string(),
        "--auto-port-discovery".into(),
        "false".into(),
        "--production".into(),
        "false".into(),
    ];
    args.extend(extra.iter().map(|s| s.to_string()));
    Config::try_parse_from(args).unwrap()
}

/// Both platforms pointed at `base` (`<base>/ve`, `<base>/ai`).
pub fn providers_at(base: &str) -> ProviderSet {
    ProviderSet::new(vec![
        Provider::new(
            Platform::VectorEngine,
            &format!("{}{}", base, VE_PREFIX),
            "",
            "",
            Duration::from_secs(2),
            false,
            SheetScale::Rounded {
                divisor: 1_000_000.0,
                price: 0.265,
            },
        )
        .unwrap(),
        Provider::new(
            Platform::Aiaimi,
            &format!("{}{}", base, AI_PREFIX),
            "",
            "",
            Duration::from_secs(2),
            true,
            SheetScale::Linear {
                divisor: 500_000.0,
                price: 1.5,
            },
        )
        .unwrap(),
    ])
}

/// Full router over an in-memory store. Without a mock, providers point at
/// a closed local port so every probe fails fast.
pub async fn build_test_app(mock: Option<&MockUpstream>) -> TestApp {
    build_test_app_with(mock, &[]).await
}

pub async fn build_test_app_with(mock: Option<&MockUpstream>, extra: &[&str]) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir, extra);
    let artifacts =
        sigma::artifacts::ArtifactStore::new(config.images_dir(), config.uploads_dir());
    artifacts.ensure_dirs().unwrap();
    let db = Database::connect_in_memory().await.unwrap();
    let base = mock
        .map(|m| m.url())
        .unwrap_or_else(|| "http://127.0.0.1:1".to_string());
    let state = AppState::with_providers(config, db, LIVE_PORT, providers_at(&base))
        .await
        .unwrap();
    TestApp {
        router: build_router(Arc::clone(&state)),
        state,
        dir,
    }
}

pub async fn read_json(response: axum::response::Response) -> (StatusCode, serde_json::Value) {
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&body).unwrap_or(serde_json::json!(null));
    (status, json)
}

pub async fn get(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    read_json(response).await
}

pub async fn send_json(
    app: Router,
    method: Method,
    uri: &str,
    body: serde_json::Value,
) -> (StatusCode, serde_json::Value) {
    let response = app
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    read_json(response).await
}

pub async fn delete(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = app
        .oneshot(
            Request::builder()
                .method(Method::DELETE)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    read_json(response).await
}

/// Multipart body builder for `POST /generate`.
#[derive(Default)]
pub struct Form {
    body: Vec<u8>,
}

impl Form {
    pub fn new() -> Self {
        Form::default()
    }

    pub fn text(mut self, name: &str, value: &str) -> Self {
        self.body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                BOUNDARY, name, value
            )
            .as_bytes(),
        );
        self
    }

    pub fn file(mut self, name: &str, file_name: &str, bytes: &[u8]) -> Self {
        self.body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
                BOUNDARY, name, file_name
            )
            .as_bytes(),
        );
        self.body.extend_from_slice(bytes);
        self.body.extend_from_slice(b"\r\n");
        self
    }

    pub fn request(mut self) -> Request<Body> {
        self.body
            .extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
        Request::builder()
            .method(Method::POST)
            .uri("/generate")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(self.body))
            .unwrap()
    }
}

/// Store `token` through the API so its platform gets probed and bound.
pub async fn configure_token(app: &TestApp, token: &str) {
    let (status, body) = send_json(
        app.app(),
        Method::POST,
        "/config/apikey",
        serde_json::json!({"api_key": token}),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
}

/// Poll `GET /tasks/:id` until the task leaves `processing`.
pub async fn wait_for_task(app: &TestApp, task_id: &str) -> serde_json::Value {
    for _ in 0..200 {
        let (status, task) = get(app.app(), &format!("/tasks/{}", task_id)).await;
        assert_eq!(status, StatusCode::OK);
        if task["status"] != "processing" {
            return task;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("task {} never finished", task_id);
}

/// Every `data:` payload of an SSE body, in order.
pub fn sse_events(body: &[u8]) -> Vec<serde_json::Value> {
    String::from_utf8_lossy(body)
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| serde_json::from_str(data.trim()).unwrap())
        .collect()
}
