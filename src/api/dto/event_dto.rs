//! Event ingestion DTOs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::domain::{DomainEvent, EventPayload};
use crate::error::GatewayError;

/// Request body for `POST /api/v1/events`.
///
/// ```json
/// {
///   "source_id": "reader-gw-2",
///   "payload": {
///     "event_type": "tag_read",
///     "tag_id": "E200-3412",
///     "reader_id": "rdr-9",
///     "location_id": "dock-3"
///   }
/// }
/// ```
#[derive(Debug, Deserialize, ToSchema)]
pub struct PublishEventRequest {
    /// Producer identifier.
    pub source_id: String,
    /// Observation time; defaults to the time of ingestion.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    /// Tagged event payload (`event_type` discriminator).
    #[schema(value_type = Object)]
    pub payload: serde_json::Value,
}

impl PublishEventRequest {
    /// Validates the payload and builds a domain event.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidRequest`] if `source_id` is blank or
    /// the payload is not a known event shape.
    pub fn into_event(self) -> Result<DomainEvent, GatewayError> {
        if self.source_id.trim().is_empty() {
            return Err(GatewayError::InvalidRequest(
                "source_id must not be empty".to_string(),
            ));
        }
        let payload: EventPayload = serde_json::from_value(self.payload)
            .map_err(|e| GatewayError::InvalidRequest(format!("invalid event payload: {e}")))?;
        let mut event = DomainEvent::new(self.source_id, payload);
        if let Some(timestamp) = self.timestamp {
            event.timestamp = timestamp;
        }
        Ok(event)
    }
}

/// Response body for `POST /api/v1/events` (202 Accepted).
#[derive(Debug, Serialize, ToSchema)]
pub struct PublishEventResponse {
    /// Assigned event id.
    pub event_id: uuid::Uuid,
    /// Event type.
    pub event_type: String,
    /// Bus receivers that will observe the event.
    pub receivers: usize,
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn valid_payload_becomes_event() {
        let request = PublishEventRequest {
            source_id: "reader-gw-2".to_string(),
            timestamp: None,
            payload: json!({
                "event_type": "tag_read",
                "tag_id": "E200-3412",
                "reader_id": "rdr-9",
                "location_id": "dock-3"
            }),
        };
        let Ok(event) = request.into_event() else {
            panic!("valid payload rejected");
        };
        assert_eq!(event.event_type_str(), "tag_read");
        assert_eq!(event.reader_id(), Some("rdr-9"));
    }

    #[test]
    fn unknown_event_type_is_invalid_request() {
        let request = PublishEventRequest {
            source_id: "x".to_string(),
            timestamp: None,
            payload: json!({"event_type": "door_opened"}),
        };
        assert!(matches!(
            request.into_event(),
            Err(GatewayError::InvalidRequest(_))
        ));
    }
}
