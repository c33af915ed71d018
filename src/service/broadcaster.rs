//! Update broadcaster: turns domain events into batched widget updates.
//!
//! Events are resolved to the widgets they concern and appended to one
//! [`BatchBuffer`] per widget. A buffer is flushed as a single `update`
//! frame when it fills up or when its window (measured from its first
//! event) elapses. Large batches also get a compressed rendition that only
//! compression-capable connections receive.
//!
//! The buffer map's lock is held across a flush, so two flushes of the same
//! widget can never interleave and per-widget order is preserved.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, broadcast, watch};
use tokio::time::Instant;

use crate::auth::Identity;
use crate::clock::Clock;
use crate::codec;
use crate::config::BatchConfig;
use crate::domain::{
    ConnectionId, DomainEvent, OutboundFrame, SubscriptionOptions, SubscriptionRegistry, WidgetId,
    WidgetType,
};
use crate::error::GatewayError;
use crate::resilience::{BackendGateway, SnapshotProvider, SnapshotRequest};
use crate::ws::messages::ServerMessage;

use super::batch::BatchBuffer;
use super::connection_manager::ConnectionManager;

/// Wire code of the non-fatal error sent when seeding fails.
pub const SNAPSHOT_UNAVAILABLE: &str = "snapshot_unavailable";

/// Result of seeding a widget for one subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOutcome {
    /// A `snapshot` frame was queued.
    Delivered,
    /// The backend had nothing to seed with.
    Empty,
    /// The fetch failed; a `snapshot_unavailable` error was queued instead.
    Unavailable,
}

#[derive(Debug, Default)]
struct Counters {
    events_received: AtomicU64,
    widget_matches: AtomicU64,
    batches_flushed: AtomicU64,
    compressed_batches: AtomicU64,
    frames_delivered: AtomicU64,
    events_lagged: AtomicU64,
    snapshots_delivered: AtomicU64,
    snapshot_failures: AtomicU64,
}

/// Broadcaster counters for the stats endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcasterStats {
    /// Events consumed from the bus.
    pub events_received: u64,
    /// Sum over events of the number of widgets each matched.
    pub widget_matches: u64,
    /// Update frames built.
    pub batches_flushed: u64,
    /// Update frames that carried a compressed rendition.
    pub compressed_batches: u64,
    /// Per-connection frame deliveries.
    pub frames_delivered: u64,
    /// Events skipped because the broadcaster lagged the bus.
    pub events_lagged: u64,
    /// Snapshot frames delivered.
    pub snapshots_delivered: u64,
    /// Snapshot fetches that failed.
    pub snapshot_failures: u64,
    /// Events currently buffered across all widgets.
    pub buffered_events: usize,
}

/// Batching fan-out engine between the event bus and the registry.
#[derive(Debug)]
pub struct UpdateBroadcaster {
    registry: Arc<SubscriptionRegistry>,
    connections: Arc<ConnectionManager>,
    backend: Arc<BackendGateway>,
    snapshots: Arc<dyn SnapshotProvider>,
    buffers: AsyncMutex<HashMap<WidgetId, BatchBuffer>>,
    config: BatchConfig,
    clock: Arc<dyn Clock>,
    counters: Counters,
}

impl UpdateBroadcaster {
    /// Creates a broadcaster with empty buffers.
    #[must_use]
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        connections: Arc<ConnectionManager>,
        backend: Arc<BackendGateway>,
        snapshots: Arc<dyn SnapshotProvider>,
        config: BatchConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            connections,
            backend,
            snapshots,
            buffers: AsyncMutex::new(HashMap::new()),
            config,
            clock,
            counters: Counters::default(),
        }
    }

    /// Buffers an event for every widget it matches, flushing any buffer it
    /// fills. Returns the number of matched widgets.
    pub async fn on_domain_event(&self, event: Arc<DomainEvent>) -> usize {
        self.counters.events_received.fetch_add(1, Ordering::Relaxed);
        let widgets = self.registry.matching_widgets(&event).await;
        if widgets.is_empty() {
            tracing::trace!(event_id = %event.event_id, "event matched no widget");
            return 0;
        }
        self.counters
            .widget_matches
            .fetch_add(widgets.len() as u64, Ordering::Relaxed);

        let now = self.clock.now();
        let mut buffers = self.buffers.lock().await;
        for widget_id in &widgets {
            let full = buffers
                .entry(widget_id.clone())
                .or_insert_with(|| BatchBuffer::new(self.config.max_batch_size))
                .push(Arc::clone(&event), now);
            if full && let Some(mut buffer) = buffers.remove(widget_id) {
                self.flush_widget(widget_id, buffer.take()).await;
            }
        }
        widgets.len()
    }

    /// Flushes every buffer whose window has elapsed at `now`. Returns the
    /// number of batches flushed.
    pub async fn flush_due(&self, now: Instant) -> usize {
        let mut buffers = self.buffers.lock().await;
        let due: Vec<WidgetId> = buffers
            .iter()
            .filter(|(_, buffer)| buffer.is_due(now, self.config.window))
            .map(|(widget_id, _)| widget_id.clone())
            .collect();
        for widget_id in &due {
            if let Some(mut buffer) = buffers.remove(widget_id) {
                self.flush_widget(widget_id, buffer.take()).await;
            }
        }
        due.len()
    }

    /// Flushes every non-empty buffer regardless of its window.
    pub async fn flush_all(&self) -> usize {
        let mut buffers = self.buffers.lock().await;
        let drained: Vec<(WidgetId, BatchBuffer)> = buffers.drain().collect();
        let mut flushed = 0;
        for (widget_id, mut buffer) in drained {
            if !buffer.is_empty() {
                self.flush_widget(&widget_id, buffer.take()).await;
                flushed += 1;
            }
        }
        flushed
    }

    async fn flush_widget(&self, widget_id: &WidgetId, events: Vec<Arc<DomainEvent>>) -> usize {
        if events.is_empty() {
            return 0;
        }
        let batch_size = events.len();
        let delivered = self
            .registry
            .fanout(widget_id, &events, |share| match self.build_frame(widget_id, share) {
                Ok(frame) => {
                    self.counters.batches_flushed.fetch_add(1, Ordering::Relaxed);
                    if frame.is_compressed() {
                        self.counters.compressed_batches.fetch_add(1, Ordering::Relaxed);
                    }
                    Some(frame)
                }
                Err(err) => {
                    tracing::warn!(%widget_id, batch_size = share.len(), error = %err, "failed to build update frame");
                    None
                }
            })
            .await;
        self.counters
            .frames_delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        tracing::debug!(%widget_id, batch_size, delivered, "batch flushed");
        delivered
    }

    fn build_frame(
        &self,
        widget_id: &WidgetId,
        events: &[Arc<DomainEvent>],
    ) -> Result<OutboundFrame, GatewayError> {
        let data = serde_json::to_value(events.iter().map(Arc::as_ref).collect::<Vec<&DomainEvent>>())?;
        let timestamp = Utc::now();
        let plain = ServerMessage::Update {
            widget_id: widget_id.clone(),
            data: data.clone(),
            compressed: false,
            batch_size: events.len(),
            timestamp,
        }
        .to_json()?;

        if plain.len() <= self.config.compression_threshold {
            return Ok(OutboundFrame::text(plain));
        }

        let compressed = ServerMessage::Update {
            widget_id: widget_id.clone(),
            data: Value::String(codec::compress_value(&data)?),
            compressed: true,
            batch_size: events.len(),
            timestamp,
        }
        .to_json()?;
        Ok(OutboundFrame::with_compressed(plain, compressed))
    }

    /// Fetches an initial snapshot for a widget and queues it for one
    /// connection.
    ///
    /// Failures never affect the subscription: the subscriber gets a
    /// non-fatal `snapshot_unavailable` error and keeps receiving live
    /// updates.
    pub async fn seed_snapshot(
        &self,
        connection_id: ConnectionId,
        identity: &Identity,
        widget_id: WidgetId,
        widget_type: WidgetType,
        options: SubscriptionOptions,
    ) -> SnapshotOutcome {
        let operation = widget_type.snapshot_operation();
        let request = SnapshotRequest {
            operation: operation.to_string(),
            widget_id: widget_id.clone(),
            widget_type,
            options,
            subject: identity.subject.clone(),
        };

        let fetched = self
            .backend
            .call(operation, identity.role, || self.snapshots.fetch(&request))
            .await;

        let (message, outcome) = match fetched {
            Ok(Some(data)) => (
                ServerMessage::Snapshot {
                    widget_id,
                    data,
                    timestamp: Utc::now(),
                },
                SnapshotOutcome::Delivered,
            ),
            Ok(None) => {
                tracing::debug!(%widget_id, operation, "backend returned no snapshot");
                return SnapshotOutcome::Empty;
            }
            Err(err) => {
                self.counters.snapshot_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(%widget_id, operation, error = %err, "snapshot unavailable");
                (
                    ServerMessage::Error {
                        widget_id: Some(widget_id),
                        code: SNAPSHOT_UNAVAILABLE.to_string(),
                        message: err.to_string(),
                        retry_after_ms: err.retry_after_ms(),
                    },
                    SnapshotOutcome::Unavailable,
                )
            }
        };

        match self.connections.send(connection_id, &message).await {
            Ok(_) if outcome == SnapshotOutcome::Delivered => {
                self.counters.snapshots_delivered.fetch_add(1, Ordering::Relaxed);
            }
            Ok(_) => {}
            Err(err) => {
                tracing::debug!(%connection_id, error = %err, "subscriber gone before snapshot");
            }
        }
        outcome
    }

    /// Counter snapshot.
    pub async fn stats(&self) -> BroadcasterStats {
        let buffered_events: usize = self.buffers.lock().await.values().map(BatchBuffer::len).sum();
        BroadcasterStats {
            events_received: self.counters.events_received.load(Ordering::Relaxed),
            widget_matches: self.counters.widget_matches.load(Ordering::Relaxed),
            batches_flushed: self.counters.batches_flushed.load(Ordering::Relaxed),
            compressed_batches: self.counters.compressed_batches.load(Ordering::Relaxed),
            frames_delivered: self.counters.frames_delivered.load(Ordering::Relaxed),
            events_lagged: self.counters.events_lagged.load(Ordering::Relaxed),
            snapshots_delivered: self.counters.snapshots_delivered.load(Ordering::Relaxed),
            snapshot_failures: self.counters.snapshot_failures.load(Ordering::Relaxed),
            buffered_events,
        }
    }

    /// Driver loop: consumes the event bus and flushes due buffers every
    /// `flush_tick` until the bus closes or `shutdown` flips to `true`.
    /// Remaining buffers are drained before returning.
    pub async fn run(
        self: Arc<Self>,
        mut events: broadcast::Receiver<Arc<DomainEvent>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(self.config.flush_tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                received = events.recv() => match received {
                    Ok(event) => {
                        self.on_domain_event(event).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        self.counters.events_lagged.fetch_add(skipped, Ordering::Relaxed);
                        tracing::warn!(skipped, "broadcaster lagged behind event bus");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = ticker.tick() => {
                    self.flush_due(self.clock.now()).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        let drained = self.flush_all().await;
        tracing::info!(drained, "broadcaster stopped");
    }
}
