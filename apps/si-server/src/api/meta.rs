use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::AppState;

/// Liveness probe.
#[utoipa::path(get, path = "/healthz", tag = "Meta", responses((status = 200, body = serde_json::Value)))]
pub async fn healthz() -> impl IntoResponse {
    Json(json!({"ok": true}))
}

/// Service identity and endpoint index.
#[utoipa::path(get, path = "/about", tag = "Meta", responses((status = 200, body = serde_json::Value)))]
pub async fn about(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "name": "si-server",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": &*state.endpoints(),
    }))
}
