//! Low-balance hint for the client banner. Never fails.

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use std::sync::Arc;
use tracing::debug;

use super::AppState;

const LOW_BALANCE_THRESHOLD: f64 = 2.0;

pub(super) async fn handler_balance(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let cred = state.credentials.snapshot().await;
    let low = if !cred.has_token() {
        false
    } else {
        match state.providers.get(cred.platform) {
            Some(provider) => match provider.balance(&cred.token).await {
                Ok(balance) => balance < LOW_BALANCE_THRESHOLD,
                Err(e) => {
                    debug!(error = %e, "balance lookup failed");
                    false
                }
            },
            None => false,
        }
    };
    Json(serde_json::json!({ "lowBalance": low }))
}
