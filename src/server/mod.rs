//! # Server — HTTP Facade
//!
//! Axum router for the desktop client: configuration, generation (JSON or
//! SSE), history, tasks, stats and balance, plus static mounts for saved
//! artifacts and the health/metrics endpoints.
//!
//! ## Startup order
//!
//! 1. Create the artifact directories and open the store (both fatal).
//! 2. Pick the listening port (fatal when busy and discovery is off).
//! 3. Load credentials, then re-probe the platform in the background.
//! 4. Start the reaper; its first sweep runs immediately.
//! 5. Bind, publish the port file when discovery is on, serve until
//!    SIGINT/SIGTERM. The port file is removed on the way out.

mod routes_balance;
mod routes_config;
mod routes_generate;
mod routes_health;
mod routes_history;
mod routes_stats;
mod routes_tasks;

use anyhow::{Context, Result};
use axum::extract::{DefaultBodyLimit, Request};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use std::sync::Arc;
use std::time::Duration;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::services::ServeDir;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn, Instrument};

use crate::artifacts::ArtifactStore;
use crate::config::{Config, SensitivityFilter};
use crate::credentials::{Credential, CredentialStore};
use crate::db::Database;
use crate::engine::{Engine, UpstreamTarget};
use crate::port::{self, PortFile};
use crate::prom_metrics::{self, Metrics};
use crate::providers::ProviderSet;
use crate::reaper;
use crate::upstream::UpstreamClient;
use crate::urls::UrlRewriter;

pub struct AppState {
    pub config: Config,
    pub db: Database,
    pub credentials: CredentialStore,
    pub providers: ProviderSet,
    pub artifacts: ArtifactStore,
    pub rewriter: UrlRewriter,
    pub engine: Arc<Engine>,
    pub prom_metrics: Arc<Metrics>,
}

impl AppState {
    /// Wire every component for a listener on `live_port`.
    pub async fn build(config: Config, db: Database, live_port: u16) -> Result<Arc<Self>> {
        let providers = ProviderSet::from_config(&config)?;
        Self::with_providers(config, db, live_port, providers).await
    }

    pub async fn with_providers(
        config: Config,
        db: Database,
        live_port: u16,
        providers: ProviderSet,
    ) -> Result<Arc<Self>> {
        let prom_metrics = Arc::new(Metrics::new());
        let artifacts = ArtifactStore::new(config.images_dir(), config.uploads_dir());
        let rewriter = UrlRewriter::new(live_port, config.base_url.as_deref());
        let credentials =
            CredentialStore::load(db.clone(), config.api_key.as_deref(), config.disclaimer_agreed)
                .await?;
        let upstream = UpstreamClient::new(
            artifacts.clone(),
            prom_metrics.upstream_request_seconds.clone(),
        )?
        .with_download_limit(config.max_download_bytes);
        let engine = Arc::new(Engine::new(
            db.clone(),
            artifacts.clone(),
            upstream,
            SensitivityFilter::new(config.sensitivity_keywords()),
            rewriter.clone(),
            Arc::clone(&prom_metrics),
        ));
        Ok(Arc::new(AppState {
            config,
            db,
            credentials,
            providers,
            artifacts,
            rewriter,
            engine,
            prom_metrics,
        }))
    }

    /// Generation endpoint and token for one request. `AI_SERVICE_URL`
    /// overrides the platform binding.
    pub(super) fn upstream_target(&self, cred: &Credential) -> Option<UpstreamTarget> {
        let url = match self
            .config
            .ai_service_url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
        {
            Some(url) => url.to_string(),
            None => self
                .providers
                .get(cred.platform)?
                .generate_url(self.config.model()),
        };
        Some(UpstreamTarget {
            url,
            token: cred.token.clone(),
        })
    }
}

/// `(status, {"error": message})`, the error shape of every handler.
pub(super) fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

/// Records request latency, propagates or mints `x-request-id`, and runs
/// the handler inside a `request` span.
async fn metrics_middleware(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let method = req.method().to_string();
    let raw_path = req.uri().path().to_string();
    let norm_path = normalize_path(&raw_path);
    let start = std::time::Instant::now();

    let span = tracing::info_span!(
        "request",
        request_id = %request_id,
        method = %method,
        path = %raw_path,
    );
    let mut response = next.run(req).instrument(span).await;

    state
        .prom_metrics
        .http_request_duration
        .get_or_create(&prom_metrics::HttpLabel {
            method,
            path: norm_path,
        })
        .observe(start.elapsed().as_secs_f64());

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// Collapse numeric ids, UUIDs and dates into placeholders so labels stay
/// bounded.
fn normalize_path(path: &str) -> String {
    path.split('/')
        .map(|seg| {
            if seg.is_empty() {
                seg.to_string()
            } else if seg.chars().all(|c| c.is_ascii_digit()) {
                ":id".to_string()
            } else if seg.len() == 36 && seg.chars().filter(|c| *c == '-').count() == 4 {
                ":uuid".to_string()
            } else if chrono::NaiveDate::parse_from_str(seg, "%Y-%m-%d").is_ok() {
                ":date".to_string()
            } else {
                seg.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_credentials(true)
        .allow_methods([
            Method::POST,
            Method::GET,
            Method::OPTIONS,
            Method::PUT,
            Method::DELETE,
        ])
        .allow_headers(AllowHeaders::mirror_request())
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let body_limit = state.config.max_upload_bytes;
    Router::new()
        .route("/config/check", get(routes_config::handler_config_check))
        .route("/config/apikey", post(routes_config::handler_set_api_key))
        .route(
            "/config/apikey/validate",
            post(routes_config::handler_validate_api_key),
        )
        .route(
            "/config/disclaimer",
            post(routes_config::handler_set_disclaimer),
        )
        .route("/generate", post(routes_generate::handler_generate))
        .route("/history", get(routes_history::handler_history))
        .route(
            "/history/white-background",
            get(routes_history::handler_history_white_background),
        )
        .route(
            "/history/clothing-change",
            get(routes_history::handler_history_clothing_change),
        )
        .route(
            "/history/product-scene",
            get(routes_history::handler_history_product_scene),
        )
        .route(
            "/history/light-shadow",
            get(routes_history::handler_history_light_shadow),
        )
        .route(
            "/history/{id}",
            delete(routes_history::handler_history_delete),
        )
        .route(
            "/history/batch-delete",
            post(routes_history::handler_history_batch_delete),
        )
        .route(
            "/history/batch/{batch_id}",
            delete(routes_history::handler_history_delete_batch),
        )
        .route(
            "/history/date/{date}",
            delete(routes_history::handler_history_delete_date),
        )
        .route(
            "/tasks/processing",
            get(routes_tasks::handler_tasks_processing),
        )
        .route("/tasks/{id}", get(routes_tasks::handler_task_get))
        .route(
            "/stats/generation-count",
            get(routes_stats::handler_generation_count),
        )
        .route(
            "/stats/increment-count",
            post(routes_stats::handler_increment_count),
        )
        .route("/balance", get(routes_balance::handler_balance))
        .route("/healthz", get(routes_health::handler_healthz))
        .route("/readyz", get(routes_health::handler_readyz))
        .route("/metrics", get(routes_health::handler_metrics))
        .nest_service("/images", ServeDir::new(state.artifacts.images_dir()))
        .nest_service("/uploads", ServeDir::new(state.artifacts.uploads_dir()))
        .layer(cors_layer())
        .layer(CatchPanicLayer::new())
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            metrics_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(60),
        ))
        .with_state(state)
}

pub async fn run(config: Config) -> Result<()> {
    let artifacts = ArtifactStore::new(config.images_dir(), config.uploads_dir());
    artifacts.ensure_dirs()?;
    let db = Database::connect(&config.db_path).await?;

    let port = port::choose_port(
        config.port,
        config.auto_port_discovery,
        config.max_port_attempts,
    )?;
    if port != config.port {
        info!(configured = config.port, port, "configured port busy, using next free port");
    }

    let state = AppState::build(config, db, port).await?;

    let detect_state = Arc::clone(&state);
    tokio::spawn(async move {
        detect_state
            .credentials
            .auto_detect(&detect_state.providers)
            .await;
    });
    reaper::spawn(state.db.clone(), Arc::clone(&state.prom_metrics));

    let auto_port = state.config.auto_port_discovery;
    let port_file_name = state.config.port_file_name.clone();
    let app = build_router(Arc::clone(&state));

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    let _port_file = if auto_port {
        match PortFile::publish(&port_file_name, port) {
            Ok(file) => Some(file),
            Err(e) => {
                warn!(error = %e, "failed to write port file");
                None
            }
        }
    } else {
        None
    };

    info!(url = %state.rewriter.base(), "sigma listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("received SIGINT, shutting down"),
                    _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
                info!("received SIGINT, shutting down");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("received SIGINT, shutting down");
    }
}
