//! Dashboard-side session: remembers subscription intent, keeps the link
//! alive and routes updates to widget callbacks.
//!
//! Subscriptions are recorded locally before anything is sent. While the
//! session is disconnected that record is the outbound queue: every
//! successful connect replays it, so widgets survive reconnects without the
//! caller doing anything.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::reconnect::{ConnectionState, ReconnectDecision, ReconnectionController, RetryPolicy};
use super::transport::{Connector, TransportLink};
use crate::codec::decompress_value;
use crate::domain::{ConnectionId, SubscriptionOptions, WidgetId, WidgetType};
use crate::error::GatewayError;
use crate::ws::messages::{ClientMessage, ServerMessage};

/// Client-side tuning.
#[derive(Debug, Clone, Copy)]
pub struct ClientConfig {
    /// Cadence of client heartbeats. The server's announced interval wins
    /// when it is shorter.
    pub heartbeat_interval: Duration,
    /// How long a subscribe may go unacknowledged before it is resent.
    pub ack_timeout: Duration,
    /// Resends before the widget is told the subscribe failed.
    pub max_ack_retries: u32,
    /// Reconnect backoff.
    pub retry: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            ack_timeout: Duration::from_secs(5),
            max_ack_retries: 3,
            retry: RetryPolicy::default(),
        }
    }
}

/// Handle for one registered callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(u64);

/// What a widget callback receives.
#[derive(Debug, Clone, PartialEq)]
pub enum WidgetUpdate {
    /// A batch of live events, oldest first, already decompressed.
    Events {
        /// Target widget.
        widget_id: WidgetId,
        /// Event payloads.
        events: Vec<Value>,
        /// Server flush time.
        timestamp: DateTime<Utc>,
    },
    /// Initial state.
    Snapshot {
        /// Target widget.
        widget_id: WidgetId,
        /// Backend-provided state.
        data: Value,
        /// Fetch time.
        timestamp: DateTime<Utc>,
    },
    /// The server or the session reported a problem with this widget.
    Error {
        /// Target widget.
        widget_id: WidgetId,
        /// Stable error code.
        code: String,
        /// Human-readable message.
        message: String,
    },
}

impl WidgetUpdate {
    /// Widget the update is addressed to.
    #[must_use]
    pub const fn widget_id(&self) -> &WidgetId {
        match self {
            Self::Events { widget_id, .. }
            | Self::Snapshot { widget_id, .. }
            | Self::Error { widget_id, .. } => widget_id,
        }
    }
}

/// Widget callback. Errors and panics are logged and contained.
pub type WidgetCallback = Arc<dyn Fn(&WidgetUpdate) -> anyhow::Result<()> + Send + Sync>;

struct LocalSubscription {
    widget_type: WidgetType,
    options: SubscriptionOptions,
    callbacks: Vec<(CallbackId, WidgetCallback)>,
    pending_ack: Option<PendingAck>,
}

impl fmt::Debug for LocalSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalSubscription")
            .field("widget_type", &self.widget_type)
            .field("options", &self.options)
            .field("callbacks", &self.callbacks.len())
            .field("pending_ack", &self.pending_ack)
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingAck {
    sent_at: Instant,
    retries: u32,
}

#[derive(Debug)]
struct SessionInner {
    controller: ReconnectionController,
    widgets: BTreeMap<WidgetId, LocalSubscription>,
    outgoing: Option<mpsc::UnboundedSender<ClientMessage>>,
    connection_id: Option<ConnectionId>,
    supervisor: Option<JoinHandle<()>>,
    closed: bool,
}

/// A reconnecting client session.
#[derive(Debug)]
pub struct ClientSession {
    connector: Arc<dyn Connector>,
    config: ClientConfig,
    inner: Mutex<SessionInner>,
    next_callback: AtomicU64,
    closed: watch::Sender<bool>,
    connecting: AsyncMutex<()>,
}

fn send(outgoing: Option<&mpsc::UnboundedSender<ClientMessage>>, message: ClientMessage) -> bool {
    match outgoing {
        Some(tx) => tx.send(message).is_ok(),
        None => false,
    }
}

fn subscribe_message(widget_id: &WidgetId, sub: &LocalSubscription) -> ClientMessage {
    ClientMessage::Subscribe {
        widget_id: widget_id.clone(),
        widget_type: sub.widget_type,
        options: sub.options.clone(),
    }
}

impl ClientSession {
    /// Creates a disconnected session.
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>, config: ClientConfig) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            connector,
            config,
            inner: Mutex::new(SessionInner {
                controller: ReconnectionController::new(config.retry),
                widgets: BTreeMap::new(),
                outgoing: None,
                connection_id: None,
                supervisor: None,
                closed: false,
            }),
            next_callback: AtomicU64::new(1),
            closed,
            connecting: AsyncMutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.lock().controller.state()
    }

    /// Id of the live connection, if any.
    #[must_use]
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.lock().connection_id
    }

    /// Widgets with at least one local callback.
    #[must_use]
    pub fn subscribed_widgets(&self) -> Vec<WidgetId> {
        self.lock().widgets.keys().cloned().collect()
    }

    /// Connects, retrying with backoff, and replays every remembered
    /// subscription.
    ///
    /// Resets an exhausted reconnection controller. Once connected, a
    /// background task keeps the link alive and reconnects on loss. A call
    /// made while that task is backing off replaces it, so the session never
    /// holds more than one transport. Concurrent calls are serialized.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::Authentication`] if the server rejected the
    ///   credential; this is never retried.
    /// - [`GatewayError::ReconnectExhausted`] after the retry policy's
    ///   `max_attempts` consecutive failures.
    /// - [`GatewayError::Transport`] if the session was closed meanwhile.
    pub async fn connect(self: &Arc<Self>) -> Result<(), GatewayError> {
        let _connecting = self.connecting.lock().await;
        let previous = {
            let mut inner = self.lock();
            if inner.controller.state() == ConnectionState::Connected {
                return Ok(());
            }
            inner.closed = false;
            inner.supervisor.take()
        };
        if let Some(previous) = previous {
            previous.abort();
            if previous.await.is_err() {
                tracing::debug!("previous supervisor stopped");
            }
        }
        {
            let mut inner = self.lock();
            // An aborted supervisor may have installed a link nobody pumps.
            inner.outgoing = None;
            inner.connection_id = None;
            inner.controller.reset();
        }
        self.closed.send_replace(false);

        let (incoming, heartbeat_interval) = self.establish().await?;
        let supervisor = tokio::spawn(Arc::clone(self).supervise(incoming, heartbeat_interval));
        self.lock().supervisor = Some(supervisor);
        Ok(())
    }

    async fn establish(
        &self,
    ) -> Result<(mpsc::UnboundedReceiver<ServerMessage>, Duration), GatewayError> {
        loop {
            {
                let mut inner = self.lock();
                if inner.closed {
                    return Err(GatewayError::Transport("session closed".to_string()));
                }
                inner.controller.begin_attempt()?;
            }

            let decision = match self.connector.connect().await {
                Ok(link) => return Ok(self.install(link)),
                Err(err @ GatewayError::Authentication(_)) => {
                    self.lock().controller.on_transport_closed();
                    tracing::warn!(error = %err, "gateway rejected credential");
                    return Err(err);
                }
                Err(err) => {
                    tracing::debug!(error = %err, "connect attempt failed");
                    self.lock().controller.on_connect_failed()
                }
            };

            match decision {
                ReconnectDecision::RetryAfter(delay) => tokio::time::sleep(delay).await,
                ReconnectDecision::GiveUp => {
                    return Err(GatewayError::ReconnectExhausted {
                        attempts: self.lock().controller.attempt(),
                    });
                }
            }
        }
    }

    fn install(&self, link: TransportLink) -> (mpsc::UnboundedReceiver<ServerMessage>, Duration) {
        let TransportLink {
            connection_id,
            heartbeat_interval,
            outgoing,
            incoming,
        } = link;

        let mut guard = self.lock();
        let inner = &mut *guard;
        inner.controller.on_connected();
        inner.connection_id = Some(connection_id);

        let now = Instant::now();
        for (widget_id, sub) in &mut inner.widgets {
            send(Some(&outgoing), subscribe_message(widget_id, sub));
            sub.pending_ack = Some(PendingAck {
                sent_at: now,
                retries: 0,
            });
        }
        tracing::info!(
            %connection_id,
            replayed = inner.widgets.len(),
            "session connected"
        );
        inner.outgoing = Some(outgoing);

        let interval = if heartbeat_interval.is_zero() {
            self.config.heartbeat_interval
        } else {
            heartbeat_interval.min(self.config.heartbeat_interval)
        };
        (incoming, interval)
    }

    async fn supervise(
        self: Arc<Self>,
        mut incoming: mpsc::UnboundedReceiver<ServerMessage>,
        mut heartbeat_interval: Duration,
    ) {
        loop {
            self.pump(&mut incoming, heartbeat_interval).await;

            {
                let mut inner = self.lock();
                inner.outgoing = None;
                inner.connection_id = None;
                inner.controller.on_transport_closed();
                if inner.closed {
                    return;
                }
            }
            tracing::info!("transport lost, reconnecting");

            match self.establish().await {
                Ok((next, interval)) => {
                    incoming = next;
                    heartbeat_interval = interval;
                }
                Err(err) => {
                    tracing::error!(error = %err, "reconnect abandoned");
                    self.notify_all(err.wire_code(), &err.to_string());
                    return;
                }
            }
        }
    }

    async fn pump(
        &self,
        incoming: &mut mpsc::UnboundedReceiver<ServerMessage>,
        heartbeat_interval: Duration,
    ) {
        let mut closed = self.closed.subscribe();
        let mut heartbeat =
            tokio::time::interval_at(Instant::now() + heartbeat_interval, heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ack_check =
            tokio::time::interval_at(Instant::now() + self.config.ack_timeout, self.config.ack_timeout);
        ack_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = closed.wait_for(|closed| *closed) => return,
                message = incoming.recv() => match message {
                    Some(message) => self.on_message(message),
                    None => return,
                },
                _ = heartbeat.tick() => {
                    let inner = self.lock();
                    send(
                        inner.outgoing.as_ref(),
                        ClientMessage::Heartbeat { timestamp: Utc::now() },
                    );
                }
                _ = ack_check.tick() => self.check_pending_acks(Instant::now()),
            }
        }
    }

    /// Registers a callback for a widget and returns its handle.
    ///
    /// The first callback for a widget records the subscription and sends
    /// it if the session is connected; otherwise it goes out on the next
    /// successful connect. Later callbacks join the existing subscription.
    pub fn subscribe<F>(
        &self,
        widget_id: WidgetId,
        widget_type: WidgetType,
        options: SubscriptionOptions,
        callback: F,
    ) -> CallbackId
    where
        F: Fn(&WidgetUpdate) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = CallbackId(self.next_callback.fetch_add(1, Ordering::Relaxed));
        let callback: WidgetCallback = Arc::new(callback);

        let mut guard = self.lock();
        let inner = &mut *guard;
        if let Some(sub) = inner.widgets.get_mut(&widget_id) {
            sub.callbacks.push((id, callback));
            return id;
        }

        let mut sub = LocalSubscription {
            widget_type,
            options,
            callbacks: vec![(id, callback)],
            pending_ack: None,
        };
        if send(inner.outgoing.as_ref(), subscribe_message(&widget_id, &sub)) {
            sub.pending_ack = Some(PendingAck {
                sent_at: Instant::now(),
                retries: 0,
            });
        }
        tracing::debug!(%widget_id, %widget_type, "widget subscribed locally");
        inner.widgets.insert(widget_id, sub);
        id
    }

    /// Removes one callback, or all of them when `callback` is `None`.
    ///
    /// When no callbacks remain the widget is forgotten and, if connected,
    /// the server is told to unsubscribe. Returns `false` if nothing was
    /// registered under the given widget or handle.
    pub fn unsubscribe(&self, widget_id: &WidgetId, callback: Option<CallbackId>) -> bool {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let Some(sub) = inner.widgets.get_mut(widget_id) else {
            return false;
        };

        let before = sub.callbacks.len();
        match callback {
            Some(id) => sub.callbacks.retain(|(cb, _)| *cb != id),
            None => sub.callbacks.clear(),
        }
        let removed = sub.callbacks.len() < before;

        if sub.callbacks.is_empty() {
            inner.widgets.remove(widget_id);
            send(
                inner.outgoing.as_ref(),
                ClientMessage::Unsubscribe {
                    widget_id: widget_id.clone(),
                },
            );
            tracing::debug!(%widget_id, "widget forgotten");
        }
        removed
    }

    /// Handles one server message.
    pub fn on_message(&self, message: ServerMessage) {
        match message {
            ServerMessage::Update {
                widget_id,
                data,
                compressed,
                timestamp,
                ..
            } => {
                let update = match decode_events(data, compressed) {
                    Ok(events) => WidgetUpdate::Events {
                        widget_id,
                        events,
                        timestamp,
                    },
                    Err(err) => WidgetUpdate::Error {
                        widget_id,
                        code: err.wire_code().to_string(),
                        message: err.to_string(),
                    },
                };
                self.dispatch(&update);
            }
            ServerMessage::Snapshot {
                widget_id,
                data,
                timestamp,
            } => self.dispatch(&WidgetUpdate::Snapshot {
                widget_id,
                data,
                timestamp,
            }),
            ServerMessage::Subscribed { widget_id } => {
                if let Some(sub) = self.lock().widgets.get_mut(&widget_id) {
                    sub.pending_ack = None;
                }
            }
            ServerMessage::Unsubscribed { widget_id } => {
                tracing::trace!(%widget_id, "unsubscribe acknowledged");
            }
            ServerMessage::Heartbeat { timestamp } => {
                let inner = self.lock();
                send(
                    inner.outgoing.as_ref(),
                    ClientMessage::HeartbeatAck { timestamp },
                );
            }
            ServerMessage::HeartbeatAck { .. } => {}
            ServerMessage::Error {
                widget_id: Some(widget_id),
                code,
                message,
                ..
            } => {
                if let Some(sub) = self.lock().widgets.get_mut(&widget_id) {
                    sub.pending_ack = None;
                }
                self.dispatch(&WidgetUpdate::Error {
                    widget_id,
                    code,
                    message,
                });
            }
            ServerMessage::Error {
                widget_id: None,
                code,
                message,
                ..
            } => {
                tracing::warn!(%code, %message, "gateway error");
            }
            ServerMessage::Connected { connection_id, .. } => {
                tracing::debug!(%connection_id, "ignoring repeated connected frame");
            }
        }
    }

    /// Resends subscribes whose ack is overdue; after `max_ack_retries`
    /// resends the widget's callbacks receive a `subscription_timeout`
    /// error instead.
    pub fn check_pending_acks(&self, now: Instant) {
        let mut failed = Vec::new();
        {
            let mut guard = self.lock();
            let inner = &mut *guard;
            let Some(outgoing) = inner.outgoing.as_ref() else {
                return;
            };
            for (widget_id, sub) in &mut inner.widgets {
                let Some(pending) = sub.pending_ack else {
                    continue;
                };
                if now.saturating_duration_since(pending.sent_at) < self.config.ack_timeout {
                    continue;
                }
                if pending.retries < self.config.max_ack_retries {
                    send(Some(outgoing), subscribe_message(widget_id, sub));
                    sub.pending_ack = Some(PendingAck {
                        sent_at: now,
                        retries: pending.retries.saturating_add(1),
                    });
                    tracing::debug!(%widget_id, retry = pending.retries.saturating_add(1), "resending subscribe");
                } else {
                    sub.pending_ack = None;
                    failed.push(widget_id.clone());
                }
            }
        }

        for widget_id in failed {
            tracing::warn!(%widget_id, "subscribe never acknowledged");
            let err = GatewayError::SubscriptionTimeout {
                widget_id: widget_id.clone(),
                timeout_ms: u64::try_from(self.config.ack_timeout.as_millis()).unwrap_or(u64::MAX),
            };
            self.dispatch(&WidgetUpdate::Error {
                widget_id,
                code: err.wire_code().to_string(),
                message: err.to_string(),
            });
        }
    }

    /// Closes the transport and stops reconnecting. Local subscriptions are
    /// kept, so a later [`connect`](Self::connect) restores them.
    pub fn close(&self) {
        {
            let mut inner = self.lock();
            if let Some(supervisor) = inner.supervisor.take() {
                supervisor.abort();
            }
            inner.closed = true;
            inner.outgoing = None;
            inner.connection_id = None;
            inner.controller.on_transport_closed();
        }
        self.closed.send_replace(true);
        tracing::info!("session closed");
    }

    fn dispatch(&self, update: &WidgetUpdate) {
        let callbacks: Vec<(CallbackId, WidgetCallback)> = {
            let inner = self.lock();
            match inner.widgets.get(update.widget_id()) {
                Some(sub) => sub
                    .callbacks
                    .iter()
                    .map(|(id, cb)| (*id, Arc::clone(cb)))
                    .collect(),
                None => {
                    tracing::trace!(widget_id = %update.widget_id(), "update for unknown widget");
                    return;
                }
            }
        };

        for (id, callback) in callbacks {
            match std::panic::catch_unwind(AssertUnwindSafe(|| callback(update))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::warn!(widget_id = %update.widget_id(), callback = id.0, error = %err, "widget callback failed");
                }
                Err(_) => {
                    tracing::error!(widget_id = %update.widget_id(), callback = id.0, "widget callback panicked");
                }
            }
        }
    }

    fn notify_all(&self, code: &str, message: &str) {
        let widgets = self.subscribed_widgets();
        for widget_id in widgets {
            self.dispatch(&WidgetUpdate::Error {
                widget_id,
                code: code.to_string(),
                message: message.to_string(),
            });
        }
    }
}

fn decode_events(data: Value, compressed: bool) -> Result<Vec<Value>, GatewayError> {
    let data = if compressed {
        let Value::String(encoded) = data else {
            return Err(GatewayError::InvalidMessage(
                "compressed payload is not a string".to_string(),
            ));
        };
        decompress_value(&encoded)?
    } else {
        data
    };
    match data {
        Value::Array(events) => Ok(events),
        other => Ok(vec![other]),
    }
}
