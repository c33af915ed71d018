//! Per-socket read/write loop.
//!
//! Inbound frames are parsed and dispatched to the [`DistributionService`];
//! outbound frames are drained from the connection's queue. Every inbound
//! frame, whatever its kind, counts as a heartbeat.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};

use super::messages::{ClientMessage, ServerMessage};
use crate::domain::{ConnectionId, WidgetId};
use crate::error::GatewayError;
use crate::service::{DistributionService, Handshake};

type WsSender = SplitSink<WebSocket, Message>;

/// Runs the read/write loop for a single WebSocket connection.
///
/// Rejected handshakes get an `error` frame followed by a close frame:
/// 1008 (policy violation) for authentication failures, 1013 (try again
/// later) when the gateway is full.
pub async fn run_connection(
    socket: WebSocket,
    service: Arc<DistributionService>,
    handshake: Handshake,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let connection = match service.accept(handshake).await {
        Ok(connection) => connection,
        Err(err) => {
            reject(&mut ws_tx, &err).await;
            return;
        }
    };
    let connection_id = connection.id();
    let outbound = Arc::clone(connection.outbound());

    loop {
        tokio::select! {
            inbound = ws_rx.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    let _ = service.touch(connection_id).await;
                    handle_text_message(&service, connection_id, text.as_str()).await;
                }
                Some(Ok(Message::Binary(_))) => {
                    let _ = service.touch(connection_id).await;
                    let err = GatewayError::InvalidMessage("binary frames are not supported".to_string());
                    send_error(&service, connection_id, None, &err).await;
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                    let _ = service.touch(connection_id).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(err)) => {
                    tracing::debug!(%connection_id, error = %err, "ws read failed");
                    break;
                }
            },
            frame = outbound.next_frame() => match frame {
                Some(frame) => {
                    if ws_tx.send(Message::text(&*frame)).await.is_err() {
                        break;
                    }
                }
                None => {
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::AWAY,
                            reason: "connection closed by server".into(),
                        })))
                        .await;
                    break;
                }
            },
        }
    }

    service.disconnect(connection_id).await;
    tracing::debug!(%connection_id, "ws connection closed");
}

async fn reject(ws_tx: &mut WsSender, err: &GatewayError) {
    let code = match err {
        GatewayError::CapacityExceeded { .. } => close_code::AGAIN,
        _ => close_code::POLICY,
    };
    if let Ok(json) = ServerMessage::from_error(None, err).to_json() {
        let _ = ws_tx.send(Message::text(json)).await;
    }
    let _ = ws_tx
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: err.wire_code().into(),
        })))
        .await;
}

/// Parses and dispatches one text frame. Failures are reported to the
/// client as `error` frames and never close the connection.
async fn handle_text_message(service: &DistributionService, connection_id: ConnectionId, text: &str) {
    let result = match ClientMessage::parse(text) {
        Ok(ClientMessage::Subscribe {
            widget_id,
            widget_type,
            options,
        }) => service
            .subscribe(connection_id, widget_id.clone(), widget_type, options)
            .await
            .map(drop)
            .map_err(|err| (Some(widget_id), err)),
        Ok(ClientMessage::Unsubscribe { widget_id }) => service
            .unsubscribe(connection_id, widget_id.clone())
            .await
            .map(drop)
            .map_err(|err| (Some(widget_id), err)),
        Ok(ClientMessage::Heartbeat { timestamp }) => service
            .heartbeat(connection_id, timestamp)
            .await
            .map_err(|err| (None, err)),
        Ok(ClientMessage::HeartbeatAck { .. }) => Ok(()),
        Err(err) => Err((None, err)),
    };

    if let Err((widget_id, err)) = result {
        send_error(service, connection_id, widget_id, &err).await;
    }
}

async fn send_error(
    service: &DistributionService,
    connection_id: ConnectionId,
    widget_id: Option<WidgetId>,
    err: &GatewayError,
) {
    tracing::debug!(%connection_id, code = err.wire_code(), error = %err, "request failed");
    let _ = service
        .connections()
        .send(connection_id, &ServerMessage::from_error(widget_id, err))
        .await;
}
