//! Aggregate health endpoint.

use axum::response::{IntoResponse, Json};
use axum::extract::State;

use crate::state::AppState;

/// GET /api/health — store, orchestrator, and connector health plus
/// process uptime. Degrades rather than failing: individual probe errors
/// are reported inline.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let task_count = match state.store.task_count().await {
        Ok(count) => serde_json::json!({"status": "healthy", "tasks": count}),
        Err(e) => serde_json::json!({"status": "unhealthy", "error": e.to_string()}),
    };

    let gemini = state.orchestrator.health().await;
    let connector = state.broker.health();

    let overall = if task_count["status"] == "healthy"
        && gemini.status != "unhealthy"
        && (connector.is_connected || !state.config.connector.enabled)
    {
        "healthy"
    } else {
        "degraded"
    };

    Json(serde_json::json!({
        "status": overall,
        "uptime_secs": state.uptime_secs(),
        "version": env!("CARGO_PKG_VERSION"),
        "store": task_count,
        "gemini": gemini,
        "connector": connector,
        "event_subscribers": state.events.subscriber_count(),
    }))
}
