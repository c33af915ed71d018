//! Domain events published by upstream producers.
//!
//! Producers (asset tracking, reader monitoring, location management) emit
//! a [`DomainEvent`] through the [`super::EventBus`]. Events are immutable and
//! shared between widget batches as `Arc<DomainEvent>`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Operational status reported by an RFID reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReaderStatus {
    /// Reader is connected and reporting reads.
    Online,
    /// Reader is connected but reporting errors or low signal.
    Degraded,
    /// Reader stopped reporting.
    Offline,
}

/// Discriminator of an event payload, used for widget-type matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// An asset changed location.
    AssetMoved,
    /// A reader observed a tag.
    TagRead,
    /// A reader changed status.
    ReaderStatusChanged,
    /// A location's occupancy changed.
    CapacityChanged,
}

impl EventKind {
    /// Every event kind.
    pub const ALL: [Self; 4] = [
        Self::AssetMoved,
        Self::TagRead,
        Self::ReaderStatusChanged,
        Self::CapacityChanged,
    ];

    /// Returns the wire name used in the payload's `event_type` field.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AssetMoved => "asset_moved",
            Self::TagRead => "tag_read",
            Self::ReaderStatusChanged => "reader_status_changed",
            Self::CapacityChanged => "capacity_changed",
        }
    }
}

/// Variant-specific event content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum EventPayload {
    /// An asset was observed in a new location.
    AssetMoved {
        /// Asset identifier.
        asset_id: String,
        /// Previous location, if known.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_location_id: Option<String>,
        /// New location.
        to_location_id: String,
        /// Reader that produced the observation, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reader_id: Option<String>,
    },

    /// A parsed tag read from a reader.
    TagRead {
        /// Raw tag identifier (EPC).
        tag_id: String,
        /// Asset the tag is attached to, if resolved.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        asset_id: Option<String>,
        /// Reader that read the tag.
        reader_id: String,
        /// Location of the reader.
        location_id: String,
        /// Received signal strength in dBm.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rssi: Option<i16>,
    },

    /// A reader's health changed.
    ReaderStatusChanged {
        /// Reader identifier.
        reader_id: String,
        /// Location of the reader.
        location_id: String,
        /// New status.
        status: ReaderStatus,
        /// Status before the change, if known.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous_status: Option<ReaderStatus>,
    },

    /// A location's occupancy changed.
    CapacityChanged {
        /// Location identifier.
        location_id: String,
        /// Number of assets currently in the location.
        occupancy: u32,
        /// Configured capacity of the location.
        capacity: u32,
    },
}

/// Immutable state-change notification from an upstream producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    /// Unique event identifier.
    pub event_id: uuid::Uuid,
    /// Identifier of the producer that emitted the event.
    pub source_id: String,
    /// When the producer observed the change.
    pub timestamp: DateTime<Utc>,
    /// Event content.
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl DomainEvent {
    /// Creates an event stamped with a fresh id and the current time.
    #[must_use]
    pub fn new(source_id: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4(),
            source_id: source_id.into(),
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Returns the payload discriminator.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self.payload {
            EventPayload::AssetMoved { .. } => EventKind::AssetMoved,
            EventPayload::TagRead { .. } => EventKind::TagRead,
            EventPayload::ReaderStatusChanged { .. } => EventKind::ReaderStatusChanged,
            EventPayload::CapacityChanged { .. } => EventKind::CapacityChanged,
        }
    }

    /// Returns the event type as a static string slice.
    #[must_use]
    pub const fn event_type_str(&self) -> &'static str {
        self.kind().as_str()
    }

    /// Returns every location the event touches.
    #[must_use]
    pub fn location_ids(&self) -> Vec<&str> {
        match &self.payload {
            EventPayload::AssetMoved {
                from_location_id,
                to_location_id,
                ..
            } => from_location_id
                .as_deref()
                .into_iter()
                .chain(std::iter::once(to_location_id.as_str()))
                .collect(),
            EventPayload::TagRead { location_id, .. }
            | EventPayload::ReaderStatusChanged { location_id, .. }
            | EventPayload::CapacityChanged { location_id, .. } => vec![location_id.as_str()],
        }
    }

    /// Returns the asset involved, if any.
    #[must_use]
    pub fn asset_id(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::AssetMoved { asset_id, .. } => Some(asset_id),
            EventPayload::TagRead { asset_id, .. } => asset_id.as_deref(),
            EventPayload::ReaderStatusChanged { .. } | EventPayload::CapacityChanged { .. } => {
                None
            }
        }
    }

    /// Returns the reader involved, if any.
    #[must_use]
    pub fn reader_id(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::AssetMoved { reader_id, .. } => reader_id.as_deref(),
            EventPayload::TagRead { reader_id, .. }
            | EventPayload::ReaderStatusChanged { reader_id, .. } => Some(reader_id),
            EventPayload::CapacityChanged { .. } => None,
        }
    }
}
