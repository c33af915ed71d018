//! Widget types and per-subscription filters.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::domain_event::{DomainEvent, EventKind};

/// Kind of dashboard widget, which determines the events it receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WidgetType {
    /// Live asset positions (asset moves and tag reads).
    AssetLocation,
    /// Reader health panel.
    ReaderHealth,
    /// Location occupancy gauges.
    LocationCapacity,
    /// Unfiltered activity feed of every event kind.
    ActivityFeed,
}

impl WidgetType {
    /// Every widget type.
    pub const ALL: [Self; 4] = [
        Self::AssetLocation,
        Self::ReaderHealth,
        Self::LocationCapacity,
        Self::ActivityFeed,
    ];

    /// Returns `true` if widgets of this type consume events of `kind`.
    #[must_use]
    pub const fn accepts(self, kind: EventKind) -> bool {
        match self {
            Self::AssetLocation => matches!(kind, EventKind::AssetMoved | EventKind::TagRead),
            Self::ReaderHealth => matches!(kind, EventKind::ReaderStatusChanged),
            Self::LocationCapacity => matches!(kind, EventKind::CapacityChanged),
            Self::ActivityFeed => true,
        }
    }

    /// Returns the backend operation that serves this widget's snapshot.
    ///
    /// Operation names follow `service.operation` and each one gets its own
    /// circuit breaker.
    #[must_use]
    pub const fn snapshot_operation(self) -> &'static str {
        match self {
            Self::AssetLocation => "asset-service.snapshot",
            Self::ReaderHealth => "reader-service.snapshot",
            Self::LocationCapacity => "location-service.snapshot",
            Self::ActivityFeed => "activity-service.snapshot",
        }
    }

    /// Returns the wire name of the widget type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AssetLocation => "asset_location",
            Self::ReaderHealth => "reader_health",
            Self::LocationCapacity => "location_capacity",
            Self::ActivityFeed => "activity_feed",
        }
    }
}

impl fmt::Display for WidgetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Narrowing filter for a subscription. Empty lists match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WidgetFilter {
    /// Only events touching one of these locations.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub location_ids: Vec<String>,
    /// Only events about one of these assets.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub asset_ids: Vec<String>,
    /// Only events produced by one of these readers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reader_ids: Vec<String>,
}

impl WidgetFilter {
    /// Returns `true` if the event passes every non-empty criterion.
    #[must_use]
    pub fn matches(&self, event: &DomainEvent) -> bool {
        let location_ok = self.location_ids.is_empty()
            || event
                .location_ids()
                .iter()
                .any(|loc| self.location_ids.iter().any(|want| want == loc));
        let asset_ok = self.asset_ids.is_empty()
            || event
                .asset_id()
                .is_some_and(|asset| self.asset_ids.iter().any(|want| want == asset));
        let reader_ok = self.reader_ids.is_empty()
            || event
                .reader_id()
                .is_some_and(|reader| self.reader_ids.iter().any(|want| want == reader));
        location_ok && asset_ok && reader_ok
    }
}

/// Options attached to a subscribe request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionOptions {
    /// Event filter for this subscription.
    #[serde(default)]
    pub filter: WidgetFilter,
}
