//! Observability DTOs for the stats and widget listing endpoints.

use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;

use crate::domain::WidgetSummary;
use crate::resilience::BreakerSnapshot;
use crate::service::{BroadcasterStats, ConnectionStats, GatewayStats};

/// Connection counters.
#[derive(Debug, Serialize, ToSchema)]
pub struct ConnectionStatsDto {
    /// Live connections.
    pub active: usize,
    /// Configured ceiling.
    pub max_connections: usize,
    /// Handshakes accepted since start.
    pub accepted_total: u64,
    /// Handshakes rejected since start.
    pub rejected_total: u64,
    /// Connections evicted for missed heartbeats.
    pub stale_evictions_total: u64,
    /// Frames dropped by full outbound queues.
    pub dropped_frames_total: u64,
}

impl From<ConnectionStats> for ConnectionStatsDto {
    fn from(stats: ConnectionStats) -> Self {
        Self {
            active: stats.active,
            max_connections: stats.max_connections,
            accepted_total: stats.accepted_total,
            rejected_total: stats.rejected_total,
            stale_evictions_total: stats.stale_evictions_total,
            dropped_frames_total: stats.dropped_frames_total,
        }
    }
}

/// Broadcaster counters.
#[derive(Debug, Serialize, ToSchema)]
pub struct BroadcasterStatsDto {
    /// Events consumed from the bus.
    pub events_received: u64,
    /// Widget matches across all events.
    pub widget_matches: u64,
    /// Update frames built.
    pub batches_flushed: u64,
    /// Update frames with a compressed rendition.
    pub compressed_batches: u64,
    /// Per-connection deliveries.
    pub frames_delivered: u64,
    /// Events lost to bus lag.
    pub events_lagged: u64,
    /// Snapshots delivered.
    pub snapshots_delivered: u64,
    /// Snapshot fetch failures.
    pub snapshot_failures: u64,
    /// Events waiting in batch buffers.
    pub buffered_events: usize,
}

impl From<BroadcasterStats> for BroadcasterStatsDto {
    fn from(stats: BroadcasterStats) -> Self {
        Self {
            events_received: stats.events_received,
            widget_matches: stats.widget_matches,
            batches_flushed: stats.batches_flushed,
            compressed_batches: stats.compressed_batches,
            frames_delivered: stats.frames_delivered,
            events_lagged: stats.events_lagged,
            snapshots_delivered: stats.snapshots_delivered,
            snapshot_failures: stats.snapshot_failures,
            buffered_events: stats.buffered_events,
        }
    }
}

/// State of one backend circuit breaker.
#[derive(Debug, Serialize, ToSchema)]
pub struct BreakerDto {
    /// Operation name (`service.operation`).
    pub operation: String,
    /// `closed`, `open` or `half_open`.
    pub state: String,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Failures in the rolling window.
    pub window_failures: usize,
    /// Times the breaker has opened.
    pub times_opened: u64,
}

impl From<BreakerSnapshot> for BreakerDto {
    fn from(snapshot: BreakerSnapshot) -> Self {
        Self {
            operation: snapshot.operation,
            state: snapshot.state.to_string(),
            consecutive_failures: snapshot.consecutive_failures,
            window_failures: snapshot.window_failures,
            times_opened: snapshot.times_opened,
        }
    }
}

/// Response body for `GET /api/v1/stats`.
#[derive(Debug, Serialize, ToSchema)]
pub struct StatsResponse {
    /// Connection counters.
    pub connections: ConnectionStatsDto,
    /// Widgets with at least one subscriber.
    pub widgets: usize,
    /// Broadcaster counters.
    pub broadcaster: BroadcasterStatsDto,
    /// Backend breakers.
    pub breakers: Vec<BreakerDto>,
    /// Event bus receivers.
    pub bus_receivers: usize,
    /// Service start time.
    pub started_at: DateTime<Utc>,
    /// Seconds since start.
    pub uptime_secs: i64,
}

impl From<GatewayStats> for StatsResponse {
    fn from(stats: GatewayStats) -> Self {
        Self {
            connections: stats.connections.into(),
            widgets: stats.widgets,
            broadcaster: stats.broadcaster.into(),
            breakers: stats.breakers.into_iter().map(BreakerDto::from).collect(),
            bus_receivers: stats.bus_receivers,
            started_at: stats.started_at,
            uptime_secs: (Utc::now() - stats.started_at).num_seconds(),
        }
    }
}

/// One active widget.
#[derive(Debug, Serialize, ToSchema)]
pub struct WidgetDto {
    /// Widget identifier.
    pub widget_id: String,
    /// Widget type.
    pub widget_type: String,
    /// Subscribed connections.
    pub subscribers: usize,
}

impl From<WidgetSummary> for WidgetDto {
    fn from(summary: WidgetSummary) -> Self {
        Self {
            widget_id: summary.widget_id.to_string(),
            widget_type: summary.widget_type.to_string(),
            subscribers: summary.subscribers,
        }
    }
}

/// Response body for `GET /api/v1/widgets`.
#[derive(Debug, Serialize, ToSchema)]
pub struct WidgetListResponse {
    /// Active widgets sorted by id.
    pub widgets: Vec<WidgetDto>,
    /// Number of active widgets.
    pub total: usize,
}
