//! Type-safe connection and widget identifiers.
//!
//! [`ConnectionId`] wraps a server-generated UUID v4. [`WidgetId`] wraps the
//! client-chosen name of a dashboard widget and is validated when it crosses
//! the protocol boundary.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

/// Maximum accepted length of a widget identifier, in bytes.
pub const MAX_WIDGET_ID_LEN: usize = 128;

/// Unique identifier for a live WebSocket connection.
///
/// Generated once on handshake and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(uuid::Uuid);

impl ConnectionId {
    /// Creates a new random `ConnectionId` (UUID v4).
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Creates a `ConnectionId` from an existing [`uuid::Uuid`].
    #[must_use]
    pub const fn from_uuid(uuid: uuid::Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the inner [`uuid::Uuid`].
    #[must_use]
    pub const fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a string was rejected as a [`WidgetId`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WidgetIdError {
    /// The identifier was empty or only whitespace.
    #[error("widget id must not be empty")]
    Empty,
    /// The identifier exceeded [`MAX_WIDGET_ID_LEN`].
    #[error("widget id exceeds {MAX_WIDGET_ID_LEN} bytes")]
    TooLong,
}

/// Identifier of a dashboard widget (a named slice of live data).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct WidgetId(String);

impl WidgetId {
    /// Validates and wraps a widget identifier.
    ///
    /// # Errors
    ///
    /// Returns [`WidgetIdError`] if the value is blank or too long.
    pub fn new(value: impl Into<String>) -> Result<Self, WidgetIdError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(WidgetIdError::Empty);
        }
        if value.len() > MAX_WIDGET_ID_LEN {
            return Err(WidgetIdError::TooLong);
        }
        Ok(Self(value))
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WidgetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for WidgetId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::new(raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn connection_ids_are_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }

    #[test]
    fn connection_id_displays_as_uuid() {
        let s = ConnectionId::new().to_string();
        assert_eq!(s.len(), 36);
    }

    #[test]
    fn widget_id_rejects_blank() {
        assert_eq!(WidgetId::new("  "), Err(WidgetIdError::Empty));
    }

    #[test]
    fn widget_id_rejects_oversized() {
        let long = "w".repeat(MAX_WIDGET_ID_LEN + 1);
        assert_eq!(WidgetId::new(long), Err(WidgetIdError::TooLong));
    }

    #[test]
    fn widget_id_deserialize_validates() {
        let ok: Result<WidgetId, _> = serde_json::from_str("\"dock-3-map\"");
        let Ok(id) = ok else {
            panic!("valid widget id rejected");
        };
        assert_eq!(id.as_str(), "dock-3-map");

        let bad: Result<WidgetId, _> = serde_json::from_str("\"\"");
        assert!(bad.is_err());
    }
}
