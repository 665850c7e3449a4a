//! # Mock Upstream — Scripted Provider Server for Tests
//!
//! One in-process axum server on `127.0.0.1:0` that plays both reseller
//! platforms. Each platform lives under its own prefix (`/ve`, `/ai`) and
//! answers the token search, billing and generation endpoints the gateway
//! calls. Generation replies are popped from a FIFO script so a test can
//! decide exactly which slots succeed.
//!
//! ```text
//! MockUpstream::start()
//!   └─ TcpListener::bind("127.0.0.1:0")
//!   └─ axum::serve(listener, router)       (background tokio task)
//!   └─ Arc<Mutex<MockState>>               (script + request log)
//! ```

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

pub const VE_PREFIX: &str = "/ve";
pub const AI_PREFIX: &str = "/ai";

/// Bytes served as "image" data. The gateway never decodes them.
pub const FAKE_PNG: &[u8] = b"\x89PNG\r\n\x1a\nfake-image-bytes";

/// One scripted answer to a generation request.
#[derive(Debug, Clone)]
pub enum Reply {
    /// `inlineData` part carrying [`FAKE_PNG`].
    Inline,
    /// A text part with arbitrary content (markdown image or plain text).
    Text(String),
    /// Non-2xx status with `{"error":{"message": ..}}`.
    Error(u16, String),
    /// 200 with an empty candidate list.
    NoCandidates,
    /// Wait, then answer with the inner reply.
    Delayed(Duration, Box<Reply>),
}

impl Reply {
    pub fn markdown_data_url(subtype: &str) -> Reply {
        Reply::Text(format!(
            "here you go ![x](data:image/{};base64,{})",
            subtype,
            STANDARD.encode(FAKE_PNG)
        ))
    }

    pub fn quota() -> Reply {
        Reply::Error(429, "quota exceeded for this token".to_string())
    }
}

/// A generation call as seen by the mock.
#[derive(Debug, Clone)]
pub struct RecordedGenerate {
    pub platform: String,
    pub model: String,
    pub auth: Option<String>,
    pub body: serde_json::Value,
}

#[derive(Debug)]
struct MockState {
    script: VecDeque<Reply>,
    fallback: Reply,
    /// prefix → tokens that platform recognises
    tokens: HashMap<String, HashSet<String>>,
    hard_limit_usd: f64,
    total_usage: f64,
    billing_fails: bool,
    generates: Vec<RecordedGenerate>,
}

type Shared = Arc<Mutex<MockState>>;

pub struct MockUpstream {
    addr: SocketAddr,
    state: Shared,
    _server: tokio::task::JoinHandle<()>,
}

impl MockUpstream {
    pub async fn start() -> MockUpstream {
        let state: Shared = Arc::new(Mutex::new(MockState {
            script: VecDeque::new(),
            fallback: Reply::Inline,
            tokens: HashMap::new(),
            hard_limit_usd: 100.0,
            total_usage: 0.0,
            billing_fails: false,
            generates: Vec::new(),
        }));

        let router = Router::new()
            .route("/{platform}/api/token/search", get(handle_token_search))
            .route(
                "/{platform}/v1/dashboard/billing/subscription",
                get(handle_subscription),
            )
            .route("/{platform}/v1/dashboard/billing/usage", get(handle_usage))
            .route("/{platform}/v1beta/models/{model}", post(handle_generate))
            .route("/files/{name}", get(handle_file))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        MockUpstream {
            addr,
            state,
            _server: server,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn platform_url(&self, prefix: &str) -> String {
        format!("{}{}", self.url(), prefix)
    }

    /// Make the platform under `prefix` recognise `token`.
    pub fn accept_token(&self, prefix: &str, token: &str) {
        let mut st = self.state.lock().unwrap();
        st.tokens
            .entry(prefix.trim_start_matches('/').to_string())
            .or_default()
            .insert(token.to_string());
    }

    /// Queue generation replies, consumed in arrival order.
    pub fn script(&self, replies: impl IntoIterator<Item = Reply>) {
        self.state.lock().unwrap().script.extend(replies);
    }

    /// Reply used once the script runs dry.
    pub fn set_fallback(&self, reply: Reply) {
        self.state.lock().unwrap().fallback = reply;
    }

    pub fn set_billing(&self, hard_limit_usd: f64, total_usage: f64) {
        let mut st = self.state.lock().unwrap();
        st.hard_limit_usd = hard_limit_usd;
        st.total_usage = total_usage;
    }

    pub fn fail_billing(&self) {
        self.state.lock().unwrap().billing_fails = true;
    }

    pub fn generates(&self) -> Vec<RecordedGenerate> {
        self.state.lock().unwrap().generates.clone()
    }
}

async fn handle_token_search(
    State(state): State<Shared>,
    Path(platform): Path<String>,
    Query(q): Query<HashMap<String, String>>,
) -> Json<serde_json::Value> {
    let token = q.get("token").cloned().unwrap_or_default();
    let known = state
        .lock()
        .unwrap()
        .tokens
        .get(&platform)
        .is_some_and(|set| set.contains(&token));
    if known {
        Json(json!({
            "success": true,
            "data": [{
                "name": format!("{}-token", platform),
                "remain_quota": 2_650_000.0,
                "used_quota": 530_000.0,
            }]
        }))
    } else {
        Json(json!({"success": true, "data": []}))
    }
}

async fn handle_subscription(State(state): State<Shared>) -> Response {
    let st = state.lock().unwrap();
    if st.billing_fails {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    Json(json!({"hard_limit_usd": st.hard_limit_usd})).into_response()
}

async fn handle_usage(State(state): State<Shared>) -> Response {
    let st = state.lock().unwrap();
    if st.billing_fails {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    Json(json!({"total_usage": st.total_usage})).into_response()
}

async fn handle_generate(
    State(state): State<Shared>,
    Path((platform, model)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Response {
    let reply = {
        let mut st = state.lock().unwrap();
        st.generates.push(RecordedGenerate {
            platform,
            model,
            auth: headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            body,
        });
        let fallback = st.fallback.clone();
        st.script.pop_front().unwrap_or(fallback)
    };
    render(reply).await
}

async fn render(mut reply: Reply) -> Response {
    loop {
        match reply {
            Reply::Delayed(wait, inner) => {
                tokio::time::sleep(wait).await;
                reply = *inner;
            }
            Reply::Inline => {
                return Json(json!({
                    "candidates": [{"content": {"parts": [
                        {"inlineData": {"mimeType": "image/png", "data": STANDARD.encode(FAKE_PNG)}}
                    ]}}]
                }))
                .into_response()
            }
            Reply::Text(text) => {
                return Json(json!({
                    "candidates": [{"content": {"parts": [{"text": text}]}}]
                }))
                .into_response()
            }
            Reply::NoCandidates => return Json(json!({"candidates": []})).into_response(),
            Reply::Error(code, message) => {
                let status =
                    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                return (status, Json(json!({"error": {"message": message}}))).into_response();
            }
        }
    }
}

async fn handle_file(Path(name): Path<String>) -> Response {
    if name.starts_with("missing") {
        return StatusCode::NOT_FOUND.into_response();
    }
    ([(header::CONTENT_TYPE, "image/webp")], FAKE_PNG).into_response()
}
