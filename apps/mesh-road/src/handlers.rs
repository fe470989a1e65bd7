use axum::{extract::State, http::header, http::StatusCode, response::IntoResponse, Json};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use tracing::error;

use crate::registry::Registry;

pub async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Current roster, for diagnostics.
pub async fn list_peers(State(registry): State<Registry>) -> impl IntoResponse {
    match registry.presence().await {
        Ok(presence) => Json(presence).into_response(),
        Err(e) => {
            error!("Failed to read presence: {}", e);
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}

pub async fn render_metrics(State(handle): State<PrometheusHandle>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        handle.render(),
    )
}
