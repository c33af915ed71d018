//! Connection table: handshake, heartbeat liveness, per-connection
//! subscriptions and teardown.
//!
//! # Locking
//!
//! Each [`Connection`] has a session mutex guarding its widget set and
//! closed flag. Subscribe, unsubscribe and teardown run under that lock and
//! take the registry lock inside it, never the other way round. Fanout only
//! touches the registry and the outbound queue, so it never waits on a
//! session.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, RwLock, watch};
use tokio::time::Instant;

use crate::auth::{Identity, IdentityValidator};
use crate::clock::Clock;
use crate::config::HeartbeatConfig;
use crate::domain::{
    ConnectionId, DeliveryOutcome, OutboundFrame, OutboundQueue, SubscribeAck, SubscriberHandle,
    SubscriptionOptions, SubscriptionRegistry, WidgetId, WidgetType,
};
use crate::error::GatewayError;
use crate::ws::messages::ServerMessage;

/// What a client presents when opening a connection.
#[derive(Debug, Clone, Default)]
pub struct Handshake {
    /// Bearer credential, if any was supplied.
    pub credential: Option<String>,
    /// Whether the client can decode compressed update payloads.
    pub accepts_compression: bool,
}

#[derive(Debug, Default)]
struct SessionState {
    widgets: HashSet<WidgetId>,
    closed: bool,
}

/// One live client connection.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    identity: Identity,
    accepts_compression: bool,
    connected_at: DateTime<Utc>,
    session: AsyncMutex<SessionState>,
    last_heartbeat: Mutex<Instant>,
    outbound: Arc<OutboundQueue>,
}

impl Connection {
    fn new(identity: Identity, accepts_compression: bool, queue_capacity: usize, now: Instant) -> Self {
        Self {
            id: ConnectionId::new(),
            identity,
            accepts_compression,
            connected_at: Utc::now(),
            session: AsyncMutex::new(SessionState::default()),
            last_heartbeat: Mutex::new(now),
            outbound: Arc::new(OutboundQueue::new(queue_capacity)),
        }
    }

    /// Connection identifier.
    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    /// Authenticated identity.
    #[must_use]
    pub const fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Whether the client advertised compression support.
    #[must_use]
    pub const fn accepts_compression(&self) -> bool {
        self.accepts_compression
    }

    /// Wall-clock handshake time.
    #[must_use]
    pub const fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// The connection's outbound queue. The socket writer drains it.
    #[must_use]
    pub const fn outbound(&self) -> &Arc<OutboundQueue> {
        &self.outbound
    }

    /// Builds the handle the registry stores for this connection.
    #[must_use]
    pub fn handle(&self) -> SubscriberHandle {
        SubscriberHandle::new(self.id, self.accepts_compression, Arc::clone(&self.outbound))
    }

    /// Instant of the last inbound frame.
    #[must_use]
    pub fn last_heartbeat(&self) -> Instant {
        *self.last_heartbeat.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn touch(&self, now: Instant) {
        let mut last = self.last_heartbeat.lock().unwrap_or_else(PoisonError::into_inner);
        if now > *last {
            *last = now;
        }
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_heartbeat())
    }

    /// Widgets this connection is subscribed to, sorted.
    pub async fn subscribed_widgets(&self) -> Vec<WidgetId> {
        let session = self.session.lock().await;
        let mut widgets: Vec<WidgetId> = session.widgets.iter().cloned().collect();
        widgets.sort();
        widgets
    }

    /// Returns `true` once the connection has been torn down.
    pub async fn is_closed(&self) -> bool {
        self.session.lock().await.closed
    }
}

/// Connection counters for the stats endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
    /// Live connections.
    pub active: usize,
    /// Configured ceiling.
    pub max_connections: usize,
    /// Handshakes accepted since start.
    pub accepted_total: u64,
    /// Handshakes rejected since start (auth or capacity).
    pub rejected_total: u64,
    /// Connections torn down for missing heartbeats.
    pub stale_evictions_total: u64,
    /// Frames evicted from outbound queues since start.
    pub dropped_frames_total: u64,
}

/// Owner of every live [`Connection`].
#[derive(Debug)]
pub struct ConnectionManager {
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    registry: Arc<SubscriptionRegistry>,
    validator: Arc<dyn IdentityValidator>,
    clock: Arc<dyn Clock>,
    max_connections: usize,
    queue_capacity: usize,
    heartbeat: HeartbeatConfig,
    accepted_total: AtomicU64,
    rejected_total: AtomicU64,
    stale_evictions_total: AtomicU64,
    dropped_by_closed: AtomicU64,
}

impl ConnectionManager {
    /// Creates an empty connection table.
    #[must_use]
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        validator: Arc<dyn IdentityValidator>,
        clock: Arc<dyn Clock>,
        max_connections: usize,
        queue_capacity: usize,
        heartbeat: HeartbeatConfig,
    ) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            registry,
            validator,
            clock,
            max_connections,
            queue_capacity,
            heartbeat,
            accepted_total: AtomicU64::new(0),
            rejected_total: AtomicU64::new(0),
            stale_evictions_total: AtomicU64::new(0),
            dropped_by_closed: AtomicU64::new(0),
        }
    }

    /// The registry connections subscribe into.
    #[must_use]
    pub const fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Validates a handshake and registers a new connection.
    ///
    /// The `connected` frame is already queued on the returned connection.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::Authentication`] if the credential is missing or
    ///   rejected by the identity validator.
    /// - [`GatewayError::CapacityExceeded`] if the table is full.
    pub async fn accept(&self, handshake: Handshake) -> Result<Arc<Connection>, GatewayError> {
        let identity = match handshake.credential.as_deref() {
            Some(credential) => self.validator.validate(credential).await,
            None => Err(GatewayError::Authentication("missing credential".to_string())),
        };
        let identity = identity.inspect_err(|err| {
            self.rejected_total.fetch_add(1, Ordering::Relaxed);
            tracing::info!(error = %err, "handshake rejected");
        })?;

        let connection = Arc::new(Connection::new(
            identity,
            handshake.accepts_compression,
            self.queue_capacity,
            self.clock.now(),
        ));
        let greeting = ServerMessage::Connected {
            connection_id: connection.id,
            heartbeat_interval_ms: u64::try_from(self.heartbeat.interval.as_millis())
                .unwrap_or(u64::MAX),
        }
        .to_frame()?;
        connection.handle().deliver(&greeting);

        {
            let mut connections = self.connections.write().await;
            if connections.len() >= self.max_connections {
                self.rejected_total.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(max = self.max_connections, "connection capacity reached");
                return Err(GatewayError::CapacityExceeded {
                    max: self.max_connections,
                });
            }
            connections.insert(connection.id, Arc::clone(&connection));
        }

        self.accepted_total.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            connection_id = %connection.id,
            subject = %connection.identity.subject,
            role = %connection.identity.role,
            compression = connection.accepts_compression,
            "connection accepted"
        );
        Ok(connection)
    }

    /// Looks up a live connection.
    pub async fn get(&self, connection_id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.read().await.get(&connection_id).map(Arc::clone)
    }

    async fn require(&self, connection_id: ConnectionId) -> Result<Arc<Connection>, GatewayError> {
        self.get(connection_id)
            .await
            .ok_or(GatewayError::ConnectionNotFound(connection_id))
    }

    /// Number of live connections.
    pub async fn count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Marks the connection alive at the current instant.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ConnectionNotFound`] for an unknown id.
    pub async fn record_heartbeat(&self, connection_id: ConnectionId) -> Result<(), GatewayError> {
        let connection = self.require(connection_id).await?;
        connection.touch(self.clock.now());
        Ok(())
    }

    /// Subscribes a connection to a widget.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::ConnectionNotFound`] if the connection is gone or
    ///   being torn down.
    /// - Any error from [`SubscriptionRegistry::subscribe`].
    pub async fn subscribe(
        &self,
        connection_id: ConnectionId,
        widget_id: WidgetId,
        widget_type: WidgetType,
        options: SubscriptionOptions,
    ) -> Result<SubscribeAck, GatewayError> {
        let connection = self.require(connection_id).await?;
        let mut session = connection.session.lock().await;
        if session.closed {
            return Err(GatewayError::ConnectionNotFound(connection_id));
        }
        let ack = self
            .registry
            .subscribe(connection.handle(), widget_id.clone(), widget_type, options)
            .await?;
        session.widgets.insert(widget_id);
        Ok(ack)
    }

    /// Unsubscribes a connection from a widget.
    ///
    /// Returns `true` if the connection was subscribed.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ConnectionNotFound`] if the connection is gone.
    pub async fn unsubscribe(
        &self,
        connection_id: ConnectionId,
        widget_id: &WidgetId,
    ) -> Result<bool, GatewayError> {
        let connection = self.require(connection_id).await?;
        let mut session = connection.session.lock().await;
        if session.closed {
            return Err(GatewayError::ConnectionNotFound(connection_id));
        }
        session.widgets.remove(widget_id);
        Ok(self.registry.unsubscribe(connection_id, widget_id).await)
    }

    /// Tears a connection down. Returns `false` if it was already gone.
    pub async fn disconnect(&self, connection_id: ConnectionId) -> bool {
        let Some(connection) = self.get(connection_id).await else {
            return false;
        };
        self.teardown(&connection, None).await
    }

    /// Runs teardown exactly once. With `stale_after`, teardown only
    /// proceeds if the connection is still idle past it once the session
    /// lock is held.
    async fn teardown(&self, connection: &Arc<Connection>, stale_after: Option<Duration>) -> bool {
        let removed = {
            let mut session = connection.session.lock().await;
            if session.closed {
                return false;
            }
            if let Some(limit) = stale_after
                && connection.idle_for(self.clock.now()) <= limit
            {
                return false;
            }
            session.closed = true;
            let widgets = std::mem::take(&mut session.widgets);
            self.registry
                .remove_connection(connection.id, widgets.iter())
                .await
        };

        connection.outbound.close();
        self.dropped_by_closed
            .fetch_add(connection.outbound.dropped(), Ordering::Relaxed);
        self.connections.write().await.remove(&connection.id);
        tracing::info!(
            connection_id = %connection.id,
            subscriptions_removed = removed,
            stale = stale_after.is_some(),
            "connection closed"
        );
        true
    }

    /// Tears down every connection idle for longer than
    /// `interval × missed_threshold`. Returns the evicted ids.
    pub async fn sweep_stale(
        &self,
        now: Instant,
        interval: Duration,
        missed_threshold: u32,
    ) -> Vec<ConnectionId> {
        let stale_after = interval.saturating_mul(missed_threshold);
        let candidates: Vec<Arc<Connection>> = self
            .connections
            .read()
            .await
            .values()
            .filter(|c| c.idle_for(now) > stale_after)
            .map(Arc::clone)
            .collect();

        let mut evicted = Vec::new();
        for connection in candidates {
            if self.teardown(&connection, Some(stale_after)).await {
                self.stale_evictions_total.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    connection_id = %connection.id,
                    idle_ms = u64::try_from(connection.idle_for(now).as_millis()).unwrap_or(u64::MAX),
                    "stale connection evicted"
                );
                evicted.push(connection.id);
            }
        }
        evicted
    }

    /// Sends a `heartbeat` probe to every connection idle for at least
    /// `interval`. Returns the number of probes queued.
    pub async fn probe_idle(&self, now: Instant, interval: Duration) -> usize {
        let idle: Vec<Arc<Connection>> = self
            .connections
            .read()
            .await
            .values()
            .filter(|c| c.idle_for(now) >= interval)
            .map(Arc::clone)
            .collect();
        if idle.is_empty() {
            return 0;
        }
        let Ok(frame) = (ServerMessage::Heartbeat {
            timestamp: Utc::now(),
        })
        .to_frame() else {
            return 0;
        };
        idle.iter()
            .filter(|c| c.handle().deliver(&frame) != DeliveryOutcome::Closed)
            .count()
    }

    /// Queues a frame for one connection.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::ConnectionNotFound`] for an unknown id.
    /// - [`GatewayError::Delivery`] if the connection's queue is closed.
    pub async fn deliver(
        &self,
        connection_id: ConnectionId,
        frame: &OutboundFrame,
    ) -> Result<DeliveryOutcome, GatewayError> {
        let connection = self.require(connection_id).await?;
        match connection.handle().deliver(frame) {
            DeliveryOutcome::Closed => Err(GatewayError::Delivery {
                connection_id,
                reason: "outbound queue closed".to_string(),
            }),
            outcome => Ok(outcome),
        }
    }

    /// Serializes and queues a server message for one connection.
    ///
    /// # Errors
    ///
    /// See [`deliver`](Self::deliver); also fails on serialization errors.
    pub async fn send(
        &self,
        connection_id: ConnectionId,
        message: &ServerMessage,
    ) -> Result<DeliveryOutcome, GatewayError> {
        self.deliver(connection_id, &message.to_frame()?).await
    }

    /// Snapshot of connection counters.
    pub async fn stats(&self) -> ConnectionStats {
        let connections = self.connections.read().await;
        let live_dropped: u64 = connections.values().map(|c| c.outbound.dropped()).sum();
        ConnectionStats {
            active: connections.len(),
            max_connections: self.max_connections,
            accepted_total: self.accepted_total.load(Ordering::Relaxed),
            rejected_total: self.rejected_total.load(Ordering::Relaxed),
            stale_evictions_total: self.stale_evictions_total.load(Ordering::Relaxed),
            dropped_frames_total: live_dropped
                .saturating_add(self.dropped_by_closed.load(Ordering::Relaxed)),
        }
    }

    /// Periodic liveness task: probes idle connections and evicts stale
    /// ones every heartbeat interval until `shutdown` flips to `true`.
    pub async fn run_heartbeat_monitor(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = self.heartbeat.interval;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = self.clock.now();
                    let evicted = self
                        .sweep_stale(now, interval, self.heartbeat.missed_threshold)
                        .await;
                    let probed = self.probe_idle(now, interval).await;
                    tracing::debug!(evicted = evicted.len(), probed, "heartbeat sweep");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("heartbeat monitor stopped");
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenValidator;
    use crate::clock::ManualClock;
    use crate::domain::{DomainEvent, EventPayload};

    struct Fixture {
        clock: Arc<ManualClock>,
        registry: Arc<SubscriptionRegistry>,
        manager: ConnectionManager,
    }

    fn fixture(max_connections: usize) -> Fixture {
        let clock = Arc::new(ManualClock::new());
        let registry = Arc::new(SubscriptionRegistry::default());
        let Ok(validator) = StaticTokenValidator::parse("good:alice:viewer,ops:olga:operator")
        else {
            panic!("token table rejected");
        };
        let manager = ConnectionManager::new(
            Arc::clone(&registry),
            Arc::new(validator),
            Arc::clone(&clock) as Arc<dyn Clock>,
            max_connections,
            16,
            HeartbeatConfig::default(),
        );
        Fixture {
            clock,
            registry,
            manager,
        }
    }

    fn handshake(token: &str) -> Handshake {
        Handshake {
            credential: Some(token.to_string()),
            accepts_compression: false,
        }
    }

    fn widget(name: &str) -> WidgetId {
        let Ok(id) = WidgetId::new(name) else {
            panic!("valid widget id rejected");
        };
        id
    }

    async fn accept(manager: &ConnectionManager) -> Arc<Connection> {
        let Ok(connection) = manager.accept(handshake("good")).await else {
            panic!("handshake rejected");
        };
        connection
    }

    #[tokio::test]
    async fn accept_queues_connected_frame() {
        let f = fixture(10);
        let connection = accept(&f.manager).await;
        let Some(frame) = connection.outbound().next_frame().await else {
            panic!("no greeting");
        };
        let Ok(ServerMessage::Connected { connection_id, .. }) = ServerMessage::parse(&frame)
        else {
            panic!("first frame was not `connected`");
        };
        assert_eq!(connection_id, connection.id());
        assert_eq!(connection.identity().subject, "alice");
    }

    #[tokio::test]
    async fn bad_or_missing_credentials_are_rejected() {
        let f = fixture(10);
        assert!(matches!(
            f.manager.accept(handshake("bad")).await,
            Err(GatewayError::Authentication(_))
        ));
        assert!(matches!(
            f.manager.accept(Handshake::default()).await,
            Err(GatewayError::Authentication(_))
        ));
        assert_eq!(f.manager.count().await, 0);
        assert_eq!(f.manager.stats().await.rejected_total, 2);
    }

    #[tokio::test]
    async fn capacity_is_enforced() {
        let f = fixture(2);
        let _a = accept(&f.manager).await;
        let _b = accept(&f.manager).await;
        assert!(matches!(
            f.manager.accept(handshake("good")).await,
            Err(GatewayError::CapacityExceeded { max: 2 })
        ));
        assert_eq!(f.manager.count().await, 2);
    }

    #[tokio::test]
    async fn concurrent_handshakes_never_exceed_capacity() {
        let f = Arc::new(fixture(5));
        let mut tasks = Vec::new();
        for _ in 0..20 {
            let f = Arc::clone(&f);
            tasks.push(tokio::spawn(async move {
                f.manager.accept(handshake("good")).await.is_ok()
            }));
        }
        let mut accepted = 0;
        for task in tasks {
            if task.await.unwrap_or(false) {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 5);
        assert_eq!(f.manager.count().await, 5);
    }

    #[tokio::test]
    async fn disconnect_purges_registry_exactly_once() {
        let f = fixture(10);
        let connection = accept(&f.manager).await;
        let id = connection.id();
        for name in ["w1", "w2"] {
            let result = f
                .manager
                .subscribe(id, widget(name), WidgetType::ActivityFeed, SubscriptionOptions::default())
                .await;
            assert!(result.is_ok());
        }
        assert_eq!(f.registry.widget_count().await, 2);

        assert!(f.manager.disconnect(id).await);
        assert!(!f.manager.disconnect(id).await);
        assert_eq!(f.registry.widget_count().await, 0);
        assert!(connection.outbound().is_closed());
        assert!(connection.is_closed().await);
    }

    #[tokio::test]
    async fn no_delivery_after_disconnect() {
        let f = fixture(10);
        let connection = accept(&f.manager).await;
        let id = connection.id();
        let _ = f
            .manager
            .subscribe(id, widget("w1"), WidgetType::ActivityFeed, SubscriptionOptions::default())
            .await;
        f.manager.disconnect(id).await;

        let event = DomainEvent::new(
            "test",
            EventPayload::CapacityChanged {
                location_id: "dock".to_string(),
                occupancy: 1,
                capacity: 2,
            },
        );
        assert!(f.registry.matching_widgets(&event).await.is_empty());
        let events = [Arc::new(event)];
        assert_eq!(
            f.registry
                .fanout(&widget("w1"), &events, |_| Some(OutboundFrame::text("x")))
                .await,
            0
        );
        assert!(matches!(
            f.manager.deliver(id, &OutboundFrame::text("x")).await,
            Err(GatewayError::ConnectionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn subscribe_after_teardown_is_refused() {
        let f = fixture(10);
        let connection = accept(&f.manager).await;
        let id = connection.id();
        f.manager.disconnect(id).await;
        let result = f
            .manager
            .subscribe(id, widget("w1"), WidgetType::ReaderHealth, SubscriptionOptions::default())
            .await;
        assert!(matches!(result, Err(GatewayError::ConnectionNotFound(_))));
        assert_eq!(f.registry.widget_count().await, 0);
    }

    #[tokio::test]
    async fn stale_connections_are_swept_and_fresh_ones_kept() {
        let f = fixture(10);
        let stale = accept(&f.manager).await;
        let fresh = accept(&f.manager).await;
        let _ = f
            .manager
            .subscribe(
                stale.id(),
                widget("w1"),
                WidgetType::AssetLocation,
                SubscriptionOptions::default(),
            )
            .await;

        f.clock.advance(Duration::from_secs(60));
        assert!(f.manager.record_heartbeat(fresh.id()).await.is_ok());
        f.clock.advance(Duration::from_secs(31));

        let interval = Duration::from_secs(30);
        let evicted = f.manager.sweep_stale(f.clock.now(), interval, 3).await;
        assert_eq!(evicted, vec![stale.id()]);
        assert_eq!(f.registry.widget_count().await, 0);
        assert!(f.manager.get(fresh.id()).await.is_some());
        assert_eq!(f.manager.stats().await.stale_evictions_total, 1);
    }

    #[tokio::test]
    async fn heartbeat_racing_sweep_wins() {
        let f = fixture(10);
        let racing = accept(&f.manager).await;
        let silent = accept(&f.manager).await;
        f.clock.advance(Duration::from_secs(91));
        assert!(f.manager.record_heartbeat(racing.id()).await.is_ok());

        // Both connections look stale at the sweep instant; the re-check
        // under the session lock must spare the one that just heartbeated.
        let sweep_now = f.clock.now() + Duration::from_secs(91);
        assert!(racing.idle_for(sweep_now) > Duration::from_secs(90));
        let evicted = f
            .manager
            .sweep_stale(sweep_now, Duration::from_secs(30), 3)
            .await;

        assert_eq!(evicted, vec![silent.id()]);
        assert!(f.manager.get(racing.id()).await.is_some());
        assert!(!racing.is_closed().await);
        assert_eq!(f.manager.count().await, 1);
    }

    #[tokio::test]
    async fn idle_connections_get_probed() {
        let f = fixture(10);
        let connection = accept(&f.manager).await;
        let _ = connection.outbound().next_frame().await;
        f.clock.advance(Duration::from_secs(30));
        let probed = f
            .manager
            .probe_idle(f.clock.now(), Duration::from_secs(30))
            .await;
        assert_eq!(probed, 1);
        let Some(frame) = connection.outbound().next_frame().await else {
            panic!("no probe queued");
        };
        assert!(matches!(
            ServerMessage::parse(&frame),
            Ok(ServerMessage::Heartbeat { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_connection_heartbeat_is_not_found() {
        let f = fixture(10);
        assert!(matches!(
            f.manager.record_heartbeat(ConnectionId::new()).await,
            Err(GatewayError::ConnectionNotFound(_))
        ));
    }
}
