//! Domain event ingestion for upstream producers.

use axum::extract::State;
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};

use crate::api::dto::{PublishEventRequest, PublishEventResponse};
use crate::app_state::AppState;
use crate::auth::bearer_token;
use crate::error::{ErrorResponse, GatewayError};

/// `POST /events`: Publish a domain event onto the bus.
///
/// # Errors
///
/// Returns [`GatewayError`] on missing or insufficient credentials, or an
/// invalid payload.
#[utoipa::path(
    post,
    path = "/api/v1/events",
    tag = "Events",
    summary = "Publish a domain event",
    description = "Accepts an asset, tag, reader or capacity event from an upstream producer and hands it to the broadcaster. Requires a bearer token with the `admin` or `operator` role.",
    request_body = PublishEventRequest,
    responses(
        (status = 202, description = "Event accepted", body = PublishEventResponse),
        (status = 400, description = "Invalid event payload", body = ErrorResponse),
        (status = 401, description = "Missing or unknown credential", body = ErrorResponse),
        (status = 403, description = "Role may not publish", body = ErrorResponse),
    ),
    security(("bearer" = []))
)]
pub async fn publish_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<PublishEventRequest>,
) -> Result<impl IntoResponse, GatewayError> {
    let credential = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(bearer_token);
    let identity = state.service.authenticate(credential).await?;
    if !identity.role.can_publish() {
        return Err(GatewayError::Forbidden(format!(
            "role {} may not publish events",
            identity.role
        )));
    }

    let event = req.into_event()?;
    let event_id = event.event_id;
    let event_type = event.event_type_str().to_string();
    let receivers = state.service.publish(event);

    tracing::debug!(%event_id, event_type = %event_type, subject = %identity.subject, receivers, "event ingested");

    Ok((
        StatusCode::ACCEPTED,
        Json(PublishEventResponse {
            event_id,
            event_type,
            receivers,
        }),
    ))
}

/// Event ingestion routes.
pub fn routes() -> Router<AppState> {
    Router::new().route("/events", post(publish_event))
}
