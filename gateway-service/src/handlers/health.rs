use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::AppState;

/// Liveness plus a usage store ping.
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let store = state.gateway.quota().health_check().await;
    let status = if store.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if store.is_ok() { "ok" } else { "degraded" },
            "service": state.config.service_name,
            "version": env!("CARGO_PKG_VERSION"),
            "usage_store": store.is_ok(),
            "active_sessions": state.gateway.active_sessions(),
        })),
    )
}

/// Ready once the usage store answers and an upstream responder is configured.
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let store_ok = state.gateway.quota().health_check().await.is_ok();
    let upstream_ok = state.gateway.responder_model().is_some();

    let status = if store_ok && upstream_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "ready": store_ok && upstream_ok,
            "usage_store": store_ok,
            "upstream": upstream_ok,
        })),
    )
}
