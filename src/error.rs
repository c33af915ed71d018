//! Gateway error types with wire-code and HTTP status mapping.
//!
//! [`GatewayError`] is the central error type. Every variant has a stable
//! string code used in WebSocket `error` frames, a numeric code for REST
//! error bodies, and an HTTP status code.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use utoipa::ToSchema;

use crate::domain::{ConnectionId, WidgetId, WidgetType};

/// Structured JSON error response body.
///
/// ```json
/// {
///   "error": {
///     "code": 1001,
///     "message": "invalid request: unknown event type",
///     "details": null
///   }
/// }
/// ```
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    /// Structured error payload.
    pub error: ErrorBody,
}

/// Inner error body with numeric code and human-readable message.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    /// Numeric error code.
    pub code: u32,
    /// Human-readable error message.
    pub message: String,
    /// Optional additional details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Server and client error enum.
///
/// # Error Code Ranges
///
/// | Range     | Category            | HTTP Status                  |
/// |-----------|---------------------|------------------------------|
/// | 1000–1999 | Validation          | 400 Bad Request              |
/// | 2000–2999 | Auth / Lifecycle    | 401 / 403 / 404 / 503        |
/// | 3000–3999 | Server / Transport  | 500 / 504                    |
/// | 4000–4999 | Backend resilience  | 429 / 502 / 503 / 504        |
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Handshake credential missing or rejected. Not retried.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Authenticated identity lacks the role for the operation.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Active connection count reached the configured maximum.
    #[error("connection capacity of {max} reached")]
    CapacityExceeded {
        /// Configured maximum number of connections.
        max: usize,
    },

    /// A subscribe did not complete within the bounded timeout. Safe to retry.
    #[error("subscription to {widget_id} timed out after {timeout_ms} ms")]
    SubscriptionTimeout {
        /// Widget the subscribe targeted.
        widget_id: WidgetId,
        /// Timeout that elapsed.
        timeout_ms: u64,
    },

    /// A frame could not be handed to a connection's outbound queue.
    #[error("delivery to {connection_id} failed: {reason}")]
    Delivery {
        /// Target connection.
        connection_id: ConnectionId,
        /// Why delivery failed.
        reason: String,
    },

    /// The named circuit is open; the call was not attempted.
    #[error("circuit open for {operation}; retry after {retry_after_ms} ms")]
    CircuitOpen {
        /// Protected operation name (`service.operation`).
        operation: String,
        /// Milliseconds until a trial call may be attempted.
        retry_after_ms: u64,
    },

    /// The caller's role exceeded its quota for backend calls.
    #[error("rate limit exceeded for role {role}; retry after {retry_after_ms} ms")]
    RateLimitExceeded {
        /// Role whose quota was exhausted.
        role: String,
        /// Milliseconds until the oldest call leaves the window.
        retry_after_ms: u64,
    },

    /// A backend call returned an error.
    #[error("backend call {operation} failed: {message}")]
    BackendFailure {
        /// Protected operation name.
        operation: String,
        /// Error reported by the backend.
        message: String,
    },

    /// A backend call exceeded its timeout.
    #[error("backend call {operation} timed out after {timeout_ms} ms")]
    BackendTimeout {
        /// Protected operation name.
        operation: String,
        /// Timeout that elapsed.
        timeout_ms: u64,
    },

    /// No live connection with the given id.
    #[error("connection not found: {0}")]
    ConnectionNotFound(ConnectionId),

    /// The widget id is already registered with another widget type.
    #[error("widget {widget_id} is registered as {existing}, not {requested}")]
    WidgetTypeMismatch {
        /// Widget id in conflict.
        widget_id: WidgetId,
        /// Type already registered for the widget.
        existing: WidgetType,
        /// Type requested by the subscriber.
        requested: WidgetType,
    },

    /// A protocol frame could not be parsed or validated.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// A REST request failed validation.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The client gave up reconnecting after the configured attempts.
    #[error("reconnect gave up after {attempts} attempts")]
    ReconnectExhausted {
        /// Consecutive failed attempts.
        attempts: u32,
    },

    /// JSON encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Transport-level failure (socket closed, I/O error).
    #[error("transport error: {0}")]
    Transport(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Returns the stable string code used in WebSocket `error` frames.
    #[must_use]
    pub const fn wire_code(&self) -> &'static str {
        match self {
            Self::Authentication(_) => "authentication_failed",
            Self::Forbidden(_) => "forbidden",
            Self::CapacityExceeded { .. } => "capacity_exceeded",
            Self::SubscriptionTimeout { .. } => "subscription_timeout",
            Self::Delivery { .. } => "delivery_failed",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Self::BackendFailure { .. } => "backend_failure",
            Self::BackendTimeout { .. } => "backend_timeout",
            Self::ConnectionNotFound(_) => "connection_not_found",
            Self::WidgetTypeMismatch { .. } => "widget_type_mismatch",
            Self::InvalidMessage(_) => "invalid_message",
            Self::InvalidRequest(_) => "invalid_request",
            Self::ReconnectExhausted { .. } => "reconnect_exhausted",
            Self::Serialization(_) => "serialization_error",
            Self::Transport(_) => "transport_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Returns the numeric error code for this variant.
    #[must_use]
    pub const fn error_code(&self) -> u32 {
        match self {
            Self::InvalidRequest(_) => 1001,
            Self::InvalidMessage(_) => 1002,
            Self::WidgetTypeMismatch { .. } => 1003,
            Self::Serialization(_) => 1004,
            Self::Authentication(_) => 2001,
            Self::Forbidden(_) => 2002,
            Self::CapacityExceeded { .. } => 2003,
            Self::ConnectionNotFound(_) => 2004,
            Self::SubscriptionTimeout { .. } => 2005,
            Self::Internal(_) => 3000,
            Self::Delivery { .. } => 3001,
            Self::Transport(_) => 3002,
            Self::ReconnectExhausted { .. } => 3003,
            Self::CircuitOpen { .. } => 4001,
            Self::RateLimitExceeded { .. } => 4002,
            Self::BackendFailure { .. } => 4003,
            Self::BackendTimeout { .. } => 4004,
        }
    }

    /// Returns the HTTP status code for this variant.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_)
            | Self::InvalidMessage(_)
            | Self::WidgetTypeMismatch { .. }
            | Self::Serialization(_) => StatusCode::BAD_REQUEST,
            Self::Authentication(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::ConnectionNotFound(_) => StatusCode::NOT_FOUND,
            Self::CapacityExceeded { .. } | Self::CircuitOpen { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::BackendFailure { .. } => StatusCode::BAD_GATEWAY,
            Self::SubscriptionTimeout { .. } | Self::BackendTimeout { .. } => {
                StatusCode::GATEWAY_TIMEOUT
            }
            Self::Internal(_)
            | Self::Delivery { .. }
            | Self::Transport(_)
            | Self::ReconnectExhausted { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns the retry-after hint, if the error carries one.
    #[must_use]
    pub const fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Self::CircuitOpen { retry_after_ms, .. }
            | Self::RateLimitExceeded { retry_after_ms, .. } => Some(*retry_after_ms),
            _ => None,
        }
    }

    /// Returns `true` if the error ends the connection it occurred on.
    #[must_use]
    pub const fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Self::Authentication(_) | Self::CapacityExceeded { .. }
        )
    }

    /// Rebuilds a handshake rejection from the code the server sent.
    ///
    /// Used by the client transport to turn the server's `error` frame back
    /// into the matching variant.
    #[must_use]
    pub fn from_handshake_rejection(code: &str, message: String) -> Self {
        match code {
            "authentication_failed" => Self::Authentication(message),
            "capacity_exceeded" => Self::CapacityExceeded { max: 0 },
            _ => Self::Transport(format!("{code}: {message}")),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.error_code(),
                message: self.to_string(),
                details: self.retry_after_ms().map(|ms| format!("retry_after_ms={ms}")),
            },
        };
        let mut response = axum::Json(body).into_response();
        *response.status_mut() = status;
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circuit_open_carries_retry_hint() {
        let err = GatewayError::CircuitOpen {
            operation: "asset-service.snapshot".to_string(),
            retry_after_ms: 1500,
        };
        assert_eq!(err.wire_code(), "circuit_open");
        assert_eq!(err.retry_after_ms(), Some(1500));
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(!err.is_connection_fatal());
    }

    #[test]
    fn lifecycle_errors_are_connection_fatal() {
        assert!(GatewayError::Authentication("bad token".to_string()).is_connection_fatal());
        assert!(GatewayError::CapacityExceeded { max: 10 }.is_connection_fatal());
    }

    #[test]
    fn handshake_rejection_round_trips_auth() {
        let err = GatewayError::from_handshake_rejection(
            "authentication_failed",
            "unknown token".to_string(),
        );
        assert!(matches!(err, GatewayError::Authentication(_)));
    }

    #[test]
    fn rate_limited_maps_to_429() {
        let err = GatewayError::RateLimitExceeded {
            role: "viewer".to_string(),
            retry_after_ms: 200,
        };
        assert_eq!(err.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err.error_code(), 4002);
    }
}
