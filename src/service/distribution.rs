//! Distribution service: the single entry point the transport layers use.
//!
//! Owns the registry, connection manager, broadcaster, backend gateway and
//! event bus, and wires them together. Protocol acknowledgements
//! (`subscribed`, `unsubscribed`, `heartbeat_ack`) are queued here so the
//! socket loop only has to translate frames.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::auth::{Identity, IdentityValidator};
use crate::clock::Clock;
use crate::config::GatewayConfig;
use crate::domain::{
    ConnectionId, DomainEvent, EventBus, SubscribeAck, SubscriptionOptions, SubscriptionRegistry,
    WidgetId, WidgetSummary, WidgetType,
};
use crate::error::GatewayError;
use crate::resilience::{BackendGateway, BreakerSnapshot, SnapshotProvider};
use crate::ws::messages::ServerMessage;

use super::broadcaster::{BroadcasterStats, UpdateBroadcaster};
use super::connection_manager::{Connection, ConnectionManager, ConnectionStats, Handshake};

/// Aggregated runtime counters.
#[derive(Debug, Clone)]
pub struct GatewayStats {
    /// Connection counters.
    pub connections: ConnectionStats,
    /// Widgets with at least one subscriber.
    pub widgets: usize,
    /// Broadcaster counters.
    pub broadcaster: BroadcasterStats,
    /// State of every backend breaker created so far.
    pub breakers: Vec<BreakerSnapshot>,
    /// Receivers attached to the event bus.
    pub bus_receivers: usize,
    /// Service start time.
    pub started_at: DateTime<Utc>,
}

/// Handles of the long-running tasks started by
/// [`DistributionService::spawn_background_tasks`].
#[derive(Debug)]
pub struct BackgroundTasks {
    /// Broadcaster driver.
    pub broadcaster: JoinHandle<()>,
    /// Heartbeat sweeper.
    pub heartbeat: JoinHandle<()>,
}

impl BackgroundTasks {
    /// Waits for both tasks to finish.
    pub async fn join(self) {
        if let Err(err) = self.broadcaster.await {
            tracing::error!(error = %err, "broadcaster task failed");
        }
        if let Err(err) = self.heartbeat.await {
            tracing::error!(error = %err, "heartbeat task failed");
        }
    }
}

/// Facade over the distribution pipeline.
#[derive(Debug)]
pub struct DistributionService {
    registry: Arc<SubscriptionRegistry>,
    connections: Arc<ConnectionManager>,
    broadcaster: Arc<UpdateBroadcaster>,
    backend: Arc<BackendGateway>,
    validator: Arc<dyn IdentityValidator>,
    event_bus: EventBus,
    heartbeat_interval_ms: u64,
    started_at: DateTime<Utc>,
}

impl DistributionService {
    /// Builds the pipeline from configuration and collaborators.
    #[must_use]
    pub fn new(
        config: &GatewayConfig,
        validator: Arc<dyn IdentityValidator>,
        snapshots: Arc<dyn SnapshotProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let registry = Arc::new(SubscriptionRegistry::new(config.subscribe_timeout));
        let connections = Arc::new(ConnectionManager::new(
            Arc::clone(&registry),
            Arc::clone(&validator),
            Arc::clone(&clock),
            config.max_connections,
            config.outbound_queue_capacity,
            config.heartbeat,
        ));
        let backend = Arc::new(BackendGateway::new(
            config.breaker,
            config.rate_limit.clone(),
            config.backend_timeout,
            Arc::clone(&clock),
        ));
        let broadcaster = Arc::new(UpdateBroadcaster::new(
            Arc::clone(&registry),
            Arc::clone(&connections),
            Arc::clone(&backend),
            snapshots,
            config.batch,
            clock,
        ));
        Self {
            registry,
            connections,
            broadcaster,
            backend,
            validator,
            event_bus: EventBus::new(config.event_bus_capacity),
            heartbeat_interval_ms: u64::try_from(config.heartbeat.interval.as_millis())
                .unwrap_or(u64::MAX),
            started_at: Utc::now(),
        }
    }

    /// The event bus producers publish to.
    #[must_use]
    pub const fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// The connection manager.
    #[must_use]
    pub const fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    /// The update broadcaster.
    #[must_use]
    pub const fn broadcaster(&self) -> &Arc<UpdateBroadcaster> {
        &self.broadcaster
    }

    /// The subscription registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Heartbeat cadence announced to clients.
    #[must_use]
    pub const fn heartbeat_interval_ms(&self) -> u64 {
        self.heartbeat_interval_ms
    }

    /// Validates a bearer credential for REST callers.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Authentication`] if the credential is missing
    /// or rejected.
    pub async fn authenticate(&self, credential: Option<&str>) -> Result<Identity, GatewayError> {
        let credential =
            credential.ok_or_else(|| GatewayError::Authentication("missing credential".to_string()))?;
        self.validator.validate(credential).await
    }

    /// Opens a connection. See [`ConnectionManager::accept`].
    ///
    /// # Errors
    ///
    /// Returns the handshake rejection.
    pub async fn accept(&self, handshake: Handshake) -> Result<Arc<Connection>, GatewayError> {
        self.connections.accept(handshake).await
    }

    /// Subscribes a connection to a widget and queues the `subscribed` ack.
    ///
    /// On the widget's first subscriber a snapshot fetch is started in the
    /// background; its result (or a `snapshot_unavailable` error) follows the
    /// ack on the same connection.
    ///
    /// # Errors
    ///
    /// Returns the subscribe failure; nothing is queued in that case.
    pub async fn subscribe(
        &self,
        connection_id: ConnectionId,
        widget_id: WidgetId,
        widget_type: WidgetType,
        options: SubscriptionOptions,
    ) -> Result<SubscribeAck, GatewayError> {
        let ack = self
            .connections
            .subscribe(connection_id, widget_id.clone(), widget_type, options.clone())
            .await?;
        self.connections
            .send(
                connection_id,
                &ServerMessage::Subscribed {
                    widget_id: widget_id.clone(),
                },
            )
            .await?;

        if ack.first_subscriber
            && let Some(connection) = self.connections.get(connection_id).await
        {
            let broadcaster = Arc::clone(&self.broadcaster);
            let identity = connection.identity().clone();
            tokio::spawn(async move {
                broadcaster
                    .seed_snapshot(connection_id, &identity, widget_id, widget_type, options)
                    .await;
            });
        }
        Ok(ack)
    }

    /// Unsubscribes a connection from a widget and queues the
    /// `unsubscribed` ack. Unsubscribing from an unknown widget is not an
    /// error.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ConnectionNotFound`] if the connection is gone.
    pub async fn unsubscribe(
        &self,
        connection_id: ConnectionId,
        widget_id: WidgetId,
    ) -> Result<bool, GatewayError> {
        let removed = self.connections.unsubscribe(connection_id, &widget_id).await?;
        self.connections
            .send(connection_id, &ServerMessage::Unsubscribed { widget_id })
            .await?;
        Ok(removed)
    }

    /// Records liveness for any inbound frame.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ConnectionNotFound`] if the connection is gone.
    pub async fn touch(&self, connection_id: ConnectionId) -> Result<(), GatewayError> {
        self.connections.record_heartbeat(connection_id).await
    }

    /// Answers a client heartbeat.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ConnectionNotFound`] if the connection is gone.
    pub async fn heartbeat(
        &self,
        connection_id: ConnectionId,
        timestamp: DateTime<Utc>,
    ) -> Result<(), GatewayError> {
        self.connections.record_heartbeat(connection_id).await?;
        self.connections
            .send(connection_id, &ServerMessage::HeartbeatAck { timestamp })
            .await?;
        Ok(())
    }

    /// Tears a connection down.
    pub async fn disconnect(&self, connection_id: ConnectionId) -> bool {
        self.connections.disconnect(connection_id).await
    }

    /// Publishes a domain event. Returns the number of bus receivers.
    pub fn publish(&self, event: DomainEvent) -> usize {
        tracing::debug!(
            event_id = %event.event_id,
            event_type = event.event_type_str(),
            source_id = %event.source_id,
            "domain event published"
        );
        self.event_bus.publish(event)
    }

    /// Active widgets with their subscriber counts.
    pub async fn widgets(&self) -> Vec<WidgetSummary> {
        self.registry.widgets().await
    }

    /// Aggregated counters.
    pub async fn stats(&self) -> GatewayStats {
        GatewayStats {
            connections: self.connections.stats().await,
            widgets: self.registry.widget_count().await,
            broadcaster: self.broadcaster.stats().await,
            breakers: self.backend.breaker_snapshots(),
            bus_receivers: self.event_bus.receiver_count(),
            started_at: self.started_at,
        }
    }

    /// Starts the broadcaster driver and heartbeat monitor.
    ///
    /// The broadcaster's bus receiver is attached before this returns, so
    /// every event published afterwards is seen.
    #[must_use]
    pub fn spawn_background_tasks(&self, shutdown: watch::Receiver<bool>) -> BackgroundTasks {
        let events = self.event_bus.subscribe();
        let broadcaster =
            tokio::spawn(Arc::clone(&self.broadcaster).run(events, shutdown.clone()));
        let heartbeat = tokio::spawn(Arc::clone(&self.connections).run_heartbeat_monitor(shutdown));
        tracing::info!("background tasks started");
        BackgroundTasks {
            broadcaster,
            heartbeat,
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::auth::StaticTokenValidator;
    use crate::clock::SystemClock;
    use crate::domain::{EventPayload, ReaderStatus};
    use crate::resilience::NoSnapshotProvider;

    fn service() -> DistributionService {
        let Ok(validator) = StaticTokenValidator::parse("t:alice:viewer") else {
            panic!("token table rejected");
        };
        DistributionService::new(
            &GatewayConfig::default(),
            Arc::new(validator),
            Arc::new(NoSnapshotProvider),
            Arc::new(SystemClock),
        )
    }

    fn widget(name: &str) -> WidgetId {
        let Ok(id) = WidgetId::new(name) else {
            panic!("valid widget id rejected");
        };
        id
    }

    async fn open(service: &DistributionService) -> Arc<Connection> {
        let Ok(connection) = service
            .accept(Handshake {
                credential: Some("t".to_string()),
                accepts_compression: false,
            })
            .await
        else {
            panic!("handshake rejected");
        };
        assert!(matches!(
            next(&connection).await,
            ServerMessage::Connected { .. }
        ));
        connection
    }

    async fn next(connection: &Connection) -> ServerMessage {
        let Some(frame) = connection.outbound().next_frame().await else {
            panic!("queue closed");
        };
        let Ok(message) = ServerMessage::parse(&frame) else {
            panic!("unparseable frame");
        };
        message
    }

    fn reader_offline(reader: &str) -> DomainEvent {
        DomainEvent::new(
            "reader-monitor",
            EventPayload::ReaderStatusChanged {
                reader_id: reader.to_string(),
                location_id: "dock".to_string(),
                status: ReaderStatus::Offline,
                previous_status: Some(ReaderStatus::Online),
            },
        )
    }

    #[tokio::test]
    async fn resubscribe_is_acknowledged_again_without_duplicates() {
        let service = service();
        let connection = open(&service).await;
        let id = connection.id();

        for expected_first in [true, false] {
            let Ok(ack) = service
                .subscribe(id, widget("readers"), WidgetType::ReaderHealth, SubscriptionOptions::default())
                .await
            else {
                panic!("subscribe failed");
            };
            assert_eq!(ack.first_subscriber, expected_first);
            assert!(matches!(
                next(&connection).await,
                ServerMessage::Subscribed { .. }
            ));
        }
        assert_eq!(service.registry().subscriber_count(&widget("readers")).await, 1);
    }

    #[tokio::test]
    async fn widget_type_conflict_is_rejected() {
        let service = service();
        let connection = open(&service).await;
        let id = connection.id();
        let _ = service
            .subscribe(id, widget("w"), WidgetType::ReaderHealth, SubscriptionOptions::default())
            .await;
        let result = service
            .subscribe(id, widget("w"), WidgetType::AssetLocation, SubscriptionOptions::default())
            .await;
        assert!(matches!(result, Err(GatewayError::WidgetTypeMismatch { .. })));
    }

    #[tokio::test]
    async fn unsubscribe_unknown_widget_is_acknowledged() {
        let service = service();
        let connection = open(&service).await;
        let result = service.unsubscribe(connection.id(), widget("never")).await;
        assert!(matches!(result, Ok(false)));
        assert!(matches!(
            next(&connection).await,
            ServerMessage::Unsubscribed { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn published_events_reach_subscribers_in_order() {
        let service = service();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = service.spawn_background_tasks(shutdown_rx);

        let connection = open(&service).await;
        let _ = service
            .subscribe(
                connection.id(),
                widget("readers"),
                WidgetType::ReaderHealth,
                SubscriptionOptions::default(),
            )
            .await;
        let _ = next(&connection).await;

        assert_eq!(service.publish(reader_offline("r-1")), 1);
        assert_eq!(service.publish(reader_offline("r-2")), 1);

        let update = tokio::time::timeout(Duration::from_secs(1), next(&connection)).await;
        let Ok(ServerMessage::Update { data, batch_size, .. }) = update else {
            panic!("no update delivered");
        };
        assert_eq!(batch_size, 2);
        let readers: Vec<&str> = data
            .as_array()
            .map(|events| {
                events
                    .iter()
                    .filter_map(|e| e.get("reader_id").and_then(serde_json::Value::as_str))
                    .collect()
            })
            .unwrap_or_default();
        assert_eq!(readers, vec!["r-1", "r-2"]);

        let _ = shutdown_tx.send(true);
        tasks.join().await;
    }

    #[tokio::test]
    async fn heartbeat_is_acknowledged_with_client_timestamp() {
        let service = service();
        let connection = open(&service).await;
        let sent = Utc::now();
        assert!(service.heartbeat(connection.id(), sent).await.is_ok());
        let ServerMessage::HeartbeatAck { timestamp } = next(&connection).await else {
            panic!("expected heartbeat_ack");
        };
        assert_eq!(timestamp, sent);
    }

    #[tokio::test]
    async fn rest_authentication_requires_known_token() {
        let service = service();
        assert!(service.authenticate(Some("t")).await.is_ok());
        assert!(service.authenticate(Some("x")).await.is_err());
        assert!(service.authenticate(None).await.is_err());
    }
}
