//! System endpoints: health check and the widget type catalog.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde::Serialize;
use utoipa::ToSchema;

use crate::app_state::AppState;
use crate::domain::{EventKind, WidgetType};
use crate::resilience::CircuitState;

/// Health check response.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// `healthy`, or `degraded` while any backend circuit is open.
    status: &'static str,
    timestamp: String,
    version: String,
    /// Live WebSocket connections.
    connections: usize,
    /// Operations whose circuit is not closed.
    open_circuits: Vec<String>,
}

/// `GET /health`: Service health status.
#[utoipa::path(
    get,
    path = "/health",
    tag = "System",
    summary = "Health check",
    description = "Returns service health, version, live connection count and any backend operation whose circuit is not closed. Always 200; a tripped circuit only degrades snapshots.",
    responses(
        (status = 200, description = "Service is up", body = HealthResponse),
    )
)]
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.service.stats().await;
    let open_circuits: Vec<String> = stats
        .breakers
        .iter()
        .filter(|b| b.state != CircuitState::Closed)
        .map(|b| b.operation.clone())
        .collect();
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: if open_circuits.is_empty() { "healthy" } else { "degraded" },
            timestamp: Utc::now().to_rfc3339(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            connections: stats.connections.active,
            open_circuits,
        }),
    )
}

/// Widget type catalog entry.
#[derive(Debug, Serialize, ToSchema)]
pub struct WidgetTypeInfo {
    widget_type: &'static str,
    /// `event_type` values delivered to this widget type.
    event_types: Vec<&'static str>,
    /// Backend operation that seeds the widget's snapshot.
    snapshot_operation: &'static str,
}

/// `GET /config/widget-types`: List supported widget types.
#[utoipa::path(
    get,
    path = "/config/widget-types",
    tag = "System",
    summary = "List supported widget types",
    description = "Returns every widget type a dashboard may subscribe to, with the event types it receives.",
    responses(
        (status = 200, description = "Widget type catalog", body = Vec<WidgetTypeInfo>),
    )
)]
pub async fn widget_types_handler() -> impl IntoResponse {
    let types: Vec<WidgetTypeInfo> = WidgetType::ALL
        .into_iter()
        .map(|widget_type| WidgetTypeInfo {
            widget_type: widget_type.as_str(),
            event_types: EventKind::ALL
                .into_iter()
                .filter(|kind| widget_type.accepts(*kind))
                .map(EventKind::as_str)
                .collect(),
            snapshot_operation: widget_type.snapshot_operation(),
        })
        .collect();
    (StatusCode::OK, Json(types))
}

/// System routes mounted at the root level (not under /api/v1).
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_handler))
        .route("/config/widget-types", get(widget_types_handler))
}
