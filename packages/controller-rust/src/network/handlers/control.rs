//! Explicit shutdown trigger.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::json;

use super::AppState;

/// `POST /shutdown`: starts a graceful shutdown and returns immediately.
///
/// Responds 202 with the resulting health state. Repeated calls are
/// harmless.
pub async fn shutdown_handler(
    State(state): State<AppState>,
) -> (StatusCode, Json<serde_json::Value>) {
    tracing::info!("shutdown requested over HTTP");
    state.shutdown.trigger_shutdown();
    (
        StatusCode::ACCEPTED,
        Json(json!({ "state": state.shutdown.health_state().as_str() })),
    )
}
