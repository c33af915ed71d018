//! Runtime observability: gateway counters and active widgets.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};

use crate::api::dto::{StatsResponse, WidgetDto, WidgetListResponse};
use crate::app_state::AppState;

/// `GET /stats`: Connection, broadcaster and breaker counters.
#[utoipa::path(
    get,
    path = "/api/v1/stats",
    tag = "Monitoring",
    summary = "Gateway statistics",
    description = "Returns live connection counts, dropped frames, broadcaster counters and the state of every backend circuit breaker.",
    responses(
        (status = 200, description = "Current counters", body = StatsResponse),
    )
)]
pub async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.service.stats().await;
    (StatusCode::OK, Json(StatsResponse::from(stats)))
}

/// `GET /widgets`: Widgets with at least one subscriber.
#[utoipa::path(
    get,
    path = "/api/v1/widgets",
    tag = "Monitoring",
    summary = "List active widgets",
    description = "Returns every widget that currently has subscribers, with its type and subscriber count.",
    responses(
        (status = 200, description = "Active widgets", body = WidgetListResponse),
    )
)]
pub async fn list_widgets(State(state): State<AppState>) -> impl IntoResponse {
    let widgets: Vec<WidgetDto> = state
        .service
        .widgets()
        .await
        .into_iter()
        .map(WidgetDto::from)
        .collect();
    let total = widgets.len();
    (StatusCode::OK, Json(WidgetListResponse { widgets, total }))
}

/// Monitoring routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/stats", get(stats_handler))
        .route("/widgets", get(list_widgets))
}
