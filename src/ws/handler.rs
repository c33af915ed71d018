//! Axum WebSocket upgrade handler.

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use axum::response::IntoResponse;
use serde::Deserialize;

use super::connection::run_connection;
use crate::app_state::AppState;
use crate::auth::bearer_token;
use crate::service::Handshake;

/// Query parameters accepted on `GET /ws`.
#[derive(Debug, Default, Deserialize)]
pub struct WsParams {
    /// Bearer credential, for clients that cannot set headers.
    pub token: Option<String>,
    /// Set to `true` to receive compressed update payloads.
    #[serde(default)]
    pub compression: bool,
}

/// `GET /ws`: Upgrade HTTP connection to WebSocket.
///
/// The credential is taken from `Authorization: Bearer` first, then from
/// `?token=`. Validation happens after the upgrade so a rejection can be
/// reported with an `error` frame and a close code.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let credential = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(bearer_token)
        .map(str::to_string)
        .or(params.token);
    let handshake = Handshake {
        credential,
        accepts_compression: params.compression,
    };
    let service = Arc::clone(&state.service);

    ws.on_upgrade(move |socket| run_connection(socket, service, handshake))
}
