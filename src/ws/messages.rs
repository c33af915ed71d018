//! WebSocket protocol: client requests and server frames.
//!
//! Every message is a JSON object with a `type` discriminator. Frames are
//! validated here, at the boundary, so the rest of the crate only sees
//! well-formed values.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{ConnectionId, OutboundFrame, SubscriptionOptions, WidgetId, WidgetType};
use crate::error::GatewayError;

/// Messages a dashboard client sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Subscribe to (or re-subscribe to) a widget.
    Subscribe {
        /// Widget to subscribe to.
        widget_id: WidgetId,
        /// Type of the widget.
        widget_type: WidgetType,
        /// Subscription options.
        #[serde(default)]
        options: SubscriptionOptions,
    },
    /// Stop receiving updates for a widget.
    Unsubscribe {
        /// Widget to unsubscribe from.
        widget_id: WidgetId,
    },
    /// Client liveness signal.
    Heartbeat {
        /// Client send time.
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },
    /// Reply to a server heartbeat probe.
    HeartbeatAck {
        /// Echoed probe time.
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },
}

impl ClientMessage {
    /// Parses a text frame.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidMessage`] for malformed JSON, an
    /// unknown `type`, or a field that fails validation.
    pub fn parse(text: &str) -> Result<Self, GatewayError> {
        serde_json::from_str(text).map_err(|e| GatewayError::InvalidMessage(e.to_string()))
    }

    /// Serializes the message to JSON.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Serialization`] on encoder failure.
    pub fn to_json(&self) -> Result<String, GatewayError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Frames the gateway sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// First frame after a successful handshake.
    Connected {
        /// Server-assigned connection id.
        connection_id: ConnectionId,
        /// Expected client heartbeat cadence.
        heartbeat_interval_ms: u64,
    },
    /// Subscription acknowledged.
    Subscribed {
        /// Subscribed widget.
        widget_id: WidgetId,
    },
    /// Unsubscription acknowledged.
    Unsubscribed {
        /// Unsubscribed widget.
        widget_id: WidgetId,
    },
    /// A batch of events for one widget, oldest first.
    Update {
        /// Target widget.
        widget_id: WidgetId,
        /// JSON array of events, or a base64 deflate string when
        /// `compressed` is set.
        data: Value,
        /// Whether `data` is compressed.
        compressed: bool,
        /// Number of events in the batch.
        batch_size: usize,
        /// Flush time.
        timestamp: DateTime<Utc>,
    },
    /// Initial state for a newly subscribed widget.
    Snapshot {
        /// Target widget.
        widget_id: WidgetId,
        /// Backend-provided state.
        data: Value,
        /// Fetch time.
        timestamp: DateTime<Utc>,
    },
    /// Server liveness probe.
    Heartbeat {
        /// Probe time.
        timestamp: DateTime<Utc>,
    },
    /// Reply to a client heartbeat.
    HeartbeatAck {
        /// Echoed client time.
        timestamp: DateTime<Utc>,
    },
    /// Operation or lifecycle error.
    Error {
        /// Widget the error relates to, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        widget_id: Option<WidgetId>,
        /// Stable error code.
        code: String,
        /// Human-readable message.
        message: String,
        /// Retry hint for transient failures.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_after_ms: Option<u64>,
    },
}

impl ServerMessage {
    /// Builds an `error` frame from a gateway error.
    #[must_use]
    pub fn from_error(widget_id: Option<WidgetId>, err: &GatewayError) -> Self {
        Self::Error {
            widget_id,
            code: err.wire_code().to_string(),
            message: err.to_string(),
            retry_after_ms: err.retry_after_ms(),
        }
    }

    /// Builds an `error` frame with an explicit code.
    #[must_use]
    pub fn error(widget_id: Option<WidgetId>, code: &str, message: impl Into<String>) -> Self {
        Self::Error {
            widget_id,
            code: code.to_string(),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// Parses a text frame received by a client.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidMessage`] if the frame is not a known
    /// server message.
    pub fn parse(text: &str) -> Result<Self, GatewayError> {
        serde_json::from_str(text).map_err(|e| GatewayError::InvalidMessage(e.to_string()))
    }

    /// Serializes the message to JSON.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Serialization`] on encoder failure.
    pub fn to_json(&self) -> Result<String, GatewayError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Serializes the message into a single-rendition outbound frame.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Serialization`] on encoder failure.
    pub fn to_frame(&self) -> Result<OutboundFrame, GatewayError> {
        Ok(OutboundFrame::text(self.to_json()?))
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_parses_with_default_options() {
        let raw = r#"{"type":"subscribe","widget_id":"dock-map","widget_type":"asset_location"}"#;
        let Ok(ClientMessage::Subscribe {
            widget_id,
            widget_type,
            options,
        }) = ClientMessage::parse(raw)
        else {
            panic!("subscribe rejected");
        };
        assert_eq!(widget_id.as_str(), "dock-map");
        assert_eq!(widget_type, WidgetType::AssetLocation);
        assert!(options.filter.location_ids.is_empty());
    }

    #[test]
    fn subscribe_with_filter() {
        let raw = r#"{"type":"subscribe","widget_id":"w","widget_type":"reader_health",
                      "options":{"filter":{"reader_ids":["r-1","r-2"]}}}"#;
        let Ok(ClientMessage::Subscribe { options, .. }) = ClientMessage::parse(raw) else {
            panic!("subscribe with filter rejected");
        };
        assert_eq!(options.filter.reader_ids, vec!["r-1", "r-2"]);
    }

    #[test]
    fn heartbeat_without_timestamp_is_accepted() {
        assert!(matches!(
            ClientMessage::parse(r#"{"type":"heartbeat"}"#),
            Ok(ClientMessage::Heartbeat { .. })
        ));
    }

    #[test]
    fn malformed_frames_are_invalid_messages() {
        for raw in [
            "not json",
            r#"{"type":"teleport"}"#,
            r#"{"type":"subscribe","widget_id":"","widget_type":"asset_location"}"#,
            r#"{"type":"subscribe","widget_id":"w","widget_type":"weather"}"#,
            r#"{"type":"unsubscribe"}"#,
        ] {
            assert!(
                matches!(ClientMessage::parse(raw), Err(GatewayError::InvalidMessage(_))),
                "accepted {raw}"
            );
        }
    }

    #[test]
    fn error_frame_omits_absent_fields() {
        let err = GatewayError::InvalidMessage("bad".to_string());
        let Ok(json) = ServerMessage::from_error(None, &err).to_json() else {
            panic!("serialization failed");
        };
        assert!(json.contains(r#""type":"error""#));
        assert!(json.contains(r#""code":"invalid_message""#));
        assert!(!json.contains("widget_id"));
        assert!(!json.contains("retry_after_ms"));
    }

    #[test]
    fn update_frame_parses_back() {
        let Ok(widget_id) = WidgetId::new("w1") else {
            panic!("valid widget id rejected");
        };
        let msg = ServerMessage::Update {
            widget_id,
            data: serde_json::json!([{"event_type": "tag_read"}]),
            compressed: false,
            batch_size: 1,
            timestamp: Utc::now(),
        };
        let Ok(json) = msg.to_json() else {
            panic!("serialization failed");
        };
        let Ok(parsed) = ServerMessage::parse(&json) else {
            panic!("update frame rejected");
        };
        assert_eq!(parsed, msg);
    }
}
