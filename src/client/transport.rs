//! Client transport: establishes a link to the gateway and exposes it as a
//! pair of message channels.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;

use crate::domain::ConnectionId;
use crate::error::GatewayError;
use crate::ws::messages::{ClientMessage, ServerMessage};

/// An established, acknowledged link.
///
/// Dropping `outgoing` closes the transport; `incoming` yields `None` once
/// the transport is gone.
#[derive(Debug)]
pub struct TransportLink {
    /// Id the server assigned in its `connected` frame.
    pub connection_id: ConnectionId,
    /// Heartbeat cadence the server announced.
    pub heartbeat_interval: Duration,
    /// Messages to send.
    pub outgoing: mpsc::UnboundedSender<ClientMessage>,
    /// Messages received, starting after `connected`.
    pub incoming: mpsc::UnboundedReceiver<ServerMessage>,
}

/// Opens links to the gateway.
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    /// Connects and waits for the server's `connected` frame.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::Authentication`] if the server rejected the
    ///   credential. Callers must not retry this.
    /// - [`GatewayError::CapacityExceeded`] if the server is full.
    /// - [`GatewayError::Transport`] for network or protocol failures.
    async fn connect(&self) -> Result<TransportLink, GatewayError>;
}

/// [`Connector`] over `tokio-tungstenite`.
#[derive(Clone)]
pub struct WsConnector {
    url: String,
    token: Option<String>,
    accepts_compression: bool,
    handshake_timeout: Duration,
}

impl fmt::Debug for WsConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsConnector")
            .field("url", &self.url)
            .field("token", &self.token.as_ref().map(|_| "***"))
            .field("accepts_compression", &self.accepts_compression)
            .finish()
    }
}

impl WsConnector {
    /// Creates a connector for a `ws://` or `wss://` endpoint.
    #[must_use]
    pub fn new(url: impl Into<String>, token: Option<String>, accepts_compression: bool) -> Self {
        Self {
            url: url.into(),
            token,
            accepts_compression,
            handshake_timeout: Duration::from_secs(10),
        }
    }

    /// Overrides the handshake timeout (default 10 s).
    #[must_use]
    pub const fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    fn endpoint(&self) -> String {
        if self.accepts_compression {
            let separator = if self.url.contains('?') { '&' } else { '?' };
            format!("{}{separator}compression=true", self.url)
        } else {
            self.url.clone()
        }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<TransportLink, GatewayError> {
        let mut request = self
            .endpoint()
            .into_client_request()
            .map_err(|e| GatewayError::Transport(format!("invalid gateway url: {e}")))?;
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| GatewayError::Transport(format!("invalid token: {e}")))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (stream, _response) =
            tokio::time::timeout(self.handshake_timeout, tokio_tungstenite::connect_async(request))
                .await
                .map_err(|_| GatewayError::Transport("handshake timed out".to_string()))?
                .map_err(|e| GatewayError::Transport(format!("connect failed: {e}")))?;
        let (mut sink, mut source) = stream.split();

        let greeting = tokio::time::timeout(self.handshake_timeout, async {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(Message::Text(text)) => return Some(ServerMessage::parse(text.as_str())),
                    Ok(Message::Close(_)) | Err(_) => return None,
                    Ok(_) => {}
                }
            }
            None
        })
        .await
        .map_err(|_| GatewayError::Transport("no greeting from server".to_string()))?;

        let (connection_id, heartbeat_interval) = match greeting {
            Some(Ok(ServerMessage::Connected {
                connection_id,
                heartbeat_interval_ms,
            })) => (connection_id, Duration::from_millis(heartbeat_interval_ms)),
            Some(Ok(ServerMessage::Error { code, message, .. })) => {
                return Err(GatewayError::from_handshake_rejection(&code, message));
            }
            Some(Ok(other)) => {
                return Err(GatewayError::Transport(format!(
                    "unexpected first frame: {other:?}"
                )));
            }
            Some(Err(err)) => return Err(err),
            None => {
                return Err(GatewayError::Transport(
                    "connection closed during handshake".to_string(),
                ));
            }
        };

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (incoming_tx, incoming) = mpsc::unbounded_channel::<ServerMessage>();

        tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                let Ok(json) = message.to_json() else {
                    continue;
                };
                if sink.send(Message::text(json)).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(Message::Text(text)) => match ServerMessage::parse(text.as_str()) {
                        Ok(message) => {
                            if incoming_tx.send(message).is_err() {
                                break;
                            }
                        }
                        Err(err) => tracing::warn!(error = %err, "unparseable server frame"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            tracing::debug!(%connection_id, "transport reader finished");
        });

        tracing::info!(%connection_id, url = %self.url, "connected to gateway");
        Ok(TransportLink {
            connection_id,
            heartbeat_interval,
            outgoing,
            incoming,
        })
    }
}
