//! Operational endpoints
//!
//! - /metrics: Prometheus text format
//! - /health: liveness and database reachability

use axum::{
    Json, Router,
    extract::{MatchedPath, Request, State},
    http::{StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus::{Encoder, TextEncoder};

use crate::AppState;
use crate::metrics::REGISTRY;

/// Metrics endpoint handler
///
/// Returns all metrics in Prometheus text format.
async fn metrics_handler() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    match encoder.encode_to_string(&metric_families) {
        Ok(metrics_text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, encoder.format_type())],
            metrics_text,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response()
        }
    }
}

/// GET /health
async fn health(State(state): State<AppState>) -> Response {
    match state.db.count_local_actors().await {
        Ok(local_actors) => Json(serde_json::json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "localActors": local_actors,
        }))
        .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "status": "unavailable" })),
            )
                .into_response()
        }
    }
}

/// Count requests by route template and status
pub async fn track_requests(
    matched_path: Option<MatchedPath>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().to_string();
    let endpoint = matched_path
        .as_ref()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let response = next.run(request).await;

    crate::metrics::HTTP_REQUESTS_TOTAL
        .with_label_values(&[&method, &endpoint, response.status().as_str()])
        .inc();
    response
}

/// Create the operational router
pub fn ops_router() -> Router<AppState> {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health))
}
