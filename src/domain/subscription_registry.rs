//! In-memory widget → subscriber mapping.
//!
//! [`SubscriptionRegistry`] keeps one entry per widget holding the handles of
//! every subscribed connection, plus a widget-type index used to resolve
//! which widgets an event concerns. An entry is evicted the moment its last
//! subscriber leaves.
//!
//! # Concurrency
//!
//! All state sits behind a single [`tokio::sync::RwLock`]. Fanout and event
//! resolution take the read side and run concurrently; subscribe,
//! unsubscribe and connection purge take the write side. Write acquisition
//! for subscribe is bounded by the configured subscribe timeout.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::outbound::{DeliveryOutcome, OutboundFrame, SubscriberHandle};
use super::{ConnectionId, DomainEvent, SubscriptionOptions, WidgetId, WidgetType};
use crate::error::GatewayError;

/// One connection's subscription to a widget.
#[derive(Debug, Clone)]
pub struct Subscription {
    /// Delivery path to the subscribing connection.
    pub handle: SubscriberHandle,
    /// Options supplied with the latest subscribe.
    pub options: SubscriptionOptions,
    /// When the subscription was first created.
    pub subscribed_at: DateTime<Utc>,
}

/// All subscriptions to a single widget.
#[derive(Debug, Clone)]
pub struct WidgetEntry {
    /// Widget type fixed by the first subscriber.
    pub widget_type: WidgetType,
    /// Subscribers keyed by connection.
    pub subscribers: HashMap<ConnectionId, Subscription>,
}

impl WidgetEntry {
    /// Returns `true` if any subscriber's filter accepts the event.
    #[must_use]
    pub fn matches(&self, event: &DomainEvent) -> bool {
        self.widget_type.accepts(event.kind())
            && self
                .subscribers
                .values()
                .any(|sub| sub.options.filter.matches(event))
    }
}

/// Acknowledgement of a successful subscribe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeAck {
    /// Widget that was subscribed.
    pub widget_id: WidgetId,
    /// `true` if this subscribe moved the widget from zero to one subscriber.
    pub first_subscriber: bool,
    /// `true` if the connection was already subscribed (options replaced).
    pub resubscribed: bool,
}

/// Summary of one widget entry, for observability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WidgetSummary {
    /// Widget identifier.
    pub widget_id: WidgetId,
    /// Widget type.
    pub widget_type: WidgetType,
    /// Number of subscribed connections.
    pub subscribers: usize,
}

#[derive(Debug, Default)]
struct RegistryState {
    widgets: HashMap<WidgetId, WidgetEntry>,
    by_type: HashMap<WidgetType, HashSet<WidgetId>>,
}

impl RegistryState {
    /// Removes one association, evicting the widget if it became empty.
    fn detach(&mut self, connection_id: ConnectionId, widget_id: &WidgetId) -> bool {
        let Some(entry) = self.widgets.get_mut(widget_id) else {
            return false;
        };
        let removed = entry.subscribers.remove(&connection_id).is_some();
        if entry.subscribers.is_empty() {
            let widget_type = entry.widget_type;
            self.widgets.remove(widget_id);
            if let Some(ids) = self.by_type.get_mut(&widget_type) {
                ids.remove(widget_id);
                if ids.is_empty() {
                    self.by_type.remove(&widget_type);
                }
            }
            tracing::debug!(%widget_id, "widget evicted, no subscribers left");
        }
        removed
    }
}

/// Central store of widget subscriptions.
#[derive(Debug)]
pub struct SubscriptionRegistry {
    state: RwLock<RegistryState>,
    subscribe_timeout: Duration,
}

impl SubscriptionRegistry {
    /// Default bound on a subscribe's lock acquisition.
    pub const DEFAULT_SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(5);

    /// Creates an empty registry with the given subscribe timeout.
    #[must_use]
    pub fn new(subscribe_timeout: Duration) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            subscribe_timeout,
        }
    }

    /// Creates or joins a widget entry for the handle's connection.
    ///
    /// At most one subscription exists per `(connection, widget)`; a repeat
    /// subscribe replaces the stored options.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::SubscriptionTimeout`] if the registry could
    /// not be locked within the subscribe timeout, or
    /// [`GatewayError::WidgetTypeMismatch`] if the widget id is registered
    /// under another type.
    pub async fn subscribe(
        &self,
        handle: SubscriberHandle,
        widget_id: WidgetId,
        widget_type: WidgetType,
        options: SubscriptionOptions,
    ) -> Result<SubscribeAck, GatewayError> {
        let Ok(mut state) = tokio::time::timeout(self.subscribe_timeout, self.state.write()).await
        else {
            return Err(GatewayError::SubscriptionTimeout {
                widget_id,
                timeout_ms: u64::try_from(self.subscribe_timeout.as_millis()).unwrap_or(u64::MAX),
            });
        };

        if let Some(entry) = state.widgets.get(&widget_id)
            && entry.widget_type != widget_type
        {
            return Err(GatewayError::WidgetTypeMismatch {
                widget_id,
                existing: entry.widget_type,
                requested: widget_type,
            });
        }

        let connection_id = handle.connection_id();
        let first_subscriber = !state.widgets.contains_key(&widget_id);
        let entry = state
            .widgets
            .entry(widget_id.clone())
            .or_insert_with(|| WidgetEntry {
                widget_type,
                subscribers: HashMap::new(),
            });

        let resubscribed = match entry.subscribers.get_mut(&connection_id) {
            Some(existing) => {
                existing.options = options;
                existing.handle = handle;
                true
            }
            None => {
                entry.subscribers.insert(
                    connection_id,
                    Subscription {
                        handle,
                        options,
                        subscribed_at: Utc::now(),
                    },
                );
                false
            }
        };

        state
            .by_type
            .entry(widget_type)
            .or_default()
            .insert(widget_id.clone());

        tracing::debug!(
            %widget_id,
            %connection_id,
            %widget_type,
            first_subscriber,
            resubscribed,
            "subscription registered"
        );

        Ok(SubscribeAck {
            widget_id,
            first_subscriber,
            resubscribed,
        })
    }

    /// Removes a connection's subscription to a widget.
    ///
    /// Returns `true` if an association was removed.
    pub async fn unsubscribe(&self, connection_id: ConnectionId, widget_id: &WidgetId) -> bool {
        self.state.write().await.detach(connection_id, widget_id)
    }

    /// Removes every listed subscription of a connection in one write.
    ///
    /// Returns the number of associations removed.
    pub async fn remove_connection<'a>(
        &self,
        connection_id: ConnectionId,
        widgets: impl IntoIterator<Item = &'a WidgetId>,
    ) -> usize {
        let mut state = self.state.write().await;
        widgets
            .into_iter()
            .filter(|widget_id| state.detach(connection_id, widget_id))
            .count()
    }

    /// Delivers a batch to every subscriber of a widget, narrowed by each
    /// subscriber's own filter.
    ///
    /// `build` turns a subscriber's share of `events` into a frame. It runs
    /// once per distinct share; subscribers whose filter rejects every event,
    /// and shares `build` declines, get nothing. Returns the number of
    /// connections a frame was queued for. Unknown widgets are a no-op
    /// returning zero.
    pub async fn fanout<F>(
        &self,
        widget_id: &WidgetId,
        events: &[Arc<DomainEvent>],
        mut build: F,
    ) -> usize
    where
        F: FnMut(&[Arc<DomainEvent>]) -> Option<OutboundFrame>,
    {
        let state = self.state.read().await;
        let Some(entry) = state.widgets.get(widget_id) else {
            return 0;
        };
        let mut frames: HashMap<Vec<usize>, Option<OutboundFrame>> = HashMap::new();
        let mut delivered = 0;
        for sub in entry.subscribers.values() {
            let share: Vec<usize> = events
                .iter()
                .enumerate()
                .filter(|(_, event)| sub.options.filter.matches(event))
                .map(|(index, _)| index)
                .collect();
            if share.is_empty() {
                continue;
            }
            let frame = frames.entry(share).or_insert_with_key(|share| {
                let batch: Vec<Arc<DomainEvent>> = share
                    .iter()
                    .filter_map(|index| events.get(*index))
                    .map(Arc::clone)
                    .collect();
                build(&batch)
            });
            if let Some(frame) = frame
                && sub.handle.deliver(frame) != DeliveryOutcome::Closed
            {
                delivered += 1;
            }
        }
        delivered
    }

    /// Resolves the widgets whose type and filters match an event.
    pub async fn matching_widgets(&self, event: &DomainEvent) -> Vec<WidgetId> {
        let state = self.state.read().await;
        let kind = event.kind();
        state
            .by_type
            .iter()
            .filter(|(widget_type, _)| widget_type.accepts(kind))
            .flat_map(|(_, ids)| ids.iter())
            .filter(|id| state.widgets.get(*id).is_some_and(|entry| entry.matches(event)))
            .cloned()
            .collect()
    }

    /// Returns `true` if the connection is subscribed to the widget.
    pub async fn contains(&self, connection_id: ConnectionId, widget_id: &WidgetId) -> bool {
        self.state
            .read()
            .await
            .widgets
            .get(widget_id)
            .is_some_and(|entry| entry.subscribers.contains_key(&connection_id))
    }

    /// Returns the number of subscribers of a widget (zero if absent).
    pub async fn subscriber_count(&self, widget_id: &WidgetId) -> usize {
        self.state
            .read()
            .await
            .widgets
            .get(widget_id)
            .map_or(0, |entry| entry.subscribers.len())
    }

    /// Returns the number of widgets with at least one subscriber.
    pub async fn widget_count(&self) -> usize {
        self.state.read().await.widgets.len()
    }

    /// Returns a summary of every widget entry, sorted by widget id.
    pub async fn widgets(&self) -> Vec<WidgetSummary> {
        let state = self.state.read().await;
        let mut summaries: Vec<WidgetSummary> = state
            .widgets
            .iter()
            .map(|(widget_id, entry)| WidgetSummary {
                widget_id: widget_id.clone(),
                widget_type: entry.widget_type,
                subscribers: entry.subscribers.len(),
            })
            .collect();
        summaries.sort_by(|a, b| a.widget_id.cmp(&b.widget_id));
        summaries
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new(Self::DEFAULT_SUBSCRIBE_TIMEOUT)
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::domain::outbound::OutboundQueue;
    use crate::domain::{EventPayload, WidgetFilter};

    fn widget(name: &str) -> WidgetId {
        let Ok(id) = WidgetId::new(name) else {
            panic!("valid widget id");
        };
        id
    }

    fn subscriber() -> (SubscriberHandle, Arc<OutboundQueue>) {
        let queue = Arc::new(OutboundQueue::new(16));
        let handle = SubscriberHandle::new(ConnectionId::new(), false, Arc::clone(&queue));
        (handle, queue)
    }

    fn capacity_event(location: &str) -> DomainEvent {
        DomainEvent::new(
            "locations",
            EventPayload::CapacityChanged {
                location_id: location.to_string(),
                occupancy: 1,
                capacity: 5,
            },
        )
    }

    #[tokio::test]
    async fn first_subscribe_reports_transition() {
        let registry = SubscriptionRegistry::default();
        let (a, _qa) = subscriber();
        let (b, _qb) = subscriber();
        let id = widget("gauge");

        let Ok(first) = registry
            .subscribe(a, id.clone(), WidgetType::LocationCapacity, SubscriptionOptions::default())
            .await
        else {
            panic!("subscribe failed");
        };
        assert!(first.first_subscriber);

        let Ok(second) = registry
            .subscribe(b, id.clone(), WidgetType::LocationCapacity, SubscriptionOptions::default())
            .await
        else {
            panic!("subscribe failed");
        };
        assert!(!second.first_subscriber);
        assert_eq!(registry.subscriber_count(&id).await, 2);
    }

    #[tokio::test]
    async fn repeat_subscribe_keeps_one_association() {
        let registry = SubscriptionRegistry::default();
        let (a, _qa) = subscriber();
        let id = widget("gauge");
        for _ in 0..3 {
            let _ = registry
                .subscribe(
                    a.clone(),
                    id.clone(),
                    WidgetType::LocationCapacity,
                    SubscriptionOptions::default(),
                )
                .await;
        }
        assert_eq!(registry.subscriber_count(&id).await, 1);
    }

    #[tokio::test]
    async fn type_mismatch_is_rejected() {
        let registry = SubscriptionRegistry::default();
        let (a, _qa) = subscriber();
        let (b, _qb) = subscriber();
        let id = widget("panel");
        let _ = registry
            .subscribe(a, id.clone(), WidgetType::ReaderHealth, SubscriptionOptions::default())
            .await;
        let result = registry
            .subscribe(b, id, WidgetType::AssetLocation, SubscriptionOptions::default())
            .await;
        assert!(matches!(result, Err(GatewayError::WidgetTypeMismatch { .. })));
    }

    #[tokio::test]
    async fn last_unsubscribe_evicts_widget() {
        let registry = SubscriptionRegistry::default();
        let (a, _qa) = subscriber();
        let conn = a.connection_id();
        let id = widget("gauge");
        let _ = registry
            .subscribe(a, id.clone(), WidgetType::LocationCapacity, SubscriptionOptions::default())
            .await;

        assert!(registry.unsubscribe(conn, &id).await);
        assert_eq!(registry.widget_count().await, 0);
        assert!(registry.matching_widgets(&capacity_event("dock")).await.is_empty());
        assert!(!registry.unsubscribe(conn, &id).await);
    }

    #[tokio::test]
    async fn fanout_without_subscribers_is_noop() {
        let registry = SubscriptionRegistry::default();
        let events = [Arc::new(capacity_event("dock"))];
        let delivered = registry
            .fanout(&widget("nobody"), &events, |_| Some(OutboundFrame::text("{}")))
            .await;
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn no_ghost_delivery_after_unsubscribe() {
        let registry = SubscriptionRegistry::default();
        let (a, qa) = subscriber();
        let (b, qb) = subscriber();
        let conn_a = a.connection_id();
        let id = widget("gauge");
        for handle in [a, b] {
            let _ = registry
                .subscribe(
                    handle,
                    id.clone(),
                    WidgetType::LocationCapacity,
                    SubscriptionOptions::default(),
                )
                .await;
        }

        registry.unsubscribe(conn_a, &id).await;
        let events = [Arc::new(capacity_event("dock"))];
        let delivered = registry
            .fanout(&id, &events, |_| Some(OutboundFrame::text("tick")))
            .await;

        assert_eq!(delivered, 1);
        assert!(qa.is_empty());
        assert_eq!(qb.len(), 1);
    }

    #[tokio::test]
    async fn fanout_narrows_batch_per_subscriber_filter() {
        let registry = SubscriptionRegistry::default();
        let (dock_sub, dock_queue) = subscriber();
        let (yard_sub, yard_queue) = subscriber();
        let (all_sub, all_queue) = subscriber();
        let id = widget("gauges");
        for (handle, location) in [(dock_sub, Some("dock")), (yard_sub, Some("yard")), (all_sub, None)] {
            let options = SubscriptionOptions {
                filter: WidgetFilter {
                    location_ids: location.map(str::to_string).into_iter().collect(),
                    ..WidgetFilter::default()
                },
            };
            let _ = registry
                .subscribe(handle, id.clone(), WidgetType::LocationCapacity, options)
                .await;
        }

        let events = [
            Arc::new(capacity_event("dock")),
            Arc::new(capacity_event("gate")),
            Arc::new(capacity_event("dock")),
        ];
        let mut sizes = Vec::new();
        let delivered = registry
            .fanout(&id, &events, |batch| {
                sizes.push(batch.len());
                Some(OutboundFrame::text(batch.len().to_string()))
            })
            .await;

        assert_eq!(delivered, 2);
        assert!(yard_queue.is_empty());
        assert_eq!(dock_queue.len(), 1);
        assert_eq!(all_queue.len(), 1);
        sizes.sort_unstable();
        assert_eq!(sizes, vec![2, 3]);
    }

    #[tokio::test]
    async fn matching_honors_type_and_filter() {
        let registry = SubscriptionRegistry::default();
        let (a, _qa) = subscriber();
        let (b, _qb) = subscriber();
        let dock = widget("dock-gauge");
        let readers = widget("readers");
        let options = SubscriptionOptions {
            filter: WidgetFilter {
                location_ids: vec!["dock".to_string()],
                ..WidgetFilter::default()
            },
        };
        let _ = registry
            .subscribe(a, dock.clone(), WidgetType::LocationCapacity, options)
            .await;
        let _ = registry
            .subscribe(b, readers, WidgetType::ReaderHealth, SubscriptionOptions::default())
            .await;

        assert_eq!(registry.matching_widgets(&capacity_event("dock")).await, vec![dock]);
        assert!(registry.matching_widgets(&capacity_event("yard")).await.is_empty());
    }

    #[tokio::test]
    async fn remove_connection_purges_all_its_widgets() {
        let registry = SubscriptionRegistry::default();
        let (a, _qa) = subscriber();
        let (b, _qb) = subscriber();
        let conn = a.connection_id();
        let ids = [widget("one"), widget("two")];
        for id in &ids {
            let _ = registry
                .subscribe(
                    a.clone(),
                    id.clone(),
                    WidgetType::ActivityFeed,
                    SubscriptionOptions::default(),
                )
                .await;
        }
        let _ = registry
            .subscribe(b, widget("two"), WidgetType::ActivityFeed, SubscriptionOptions::default())
            .await;

        assert_eq!(registry.remove_connection(conn, ids.iter()).await, 2);
        assert_eq!(registry.widget_count().await, 1);
        assert_eq!(registry.subscriber_count(&widget("two")).await, 1);
    }

    #[tokio::test]
    async fn subscribe_times_out_when_registry_is_held() {
        let registry = Arc::new(SubscriptionRegistry::new(Duration::from_millis(20)));
        let guard = registry.state.write().await;
        let (a, _qa) = subscriber();
        let result = registry
            .subscribe(a, widget("slow"), WidgetType::ActivityFeed, SubscriptionOptions::default())
            .await;
        drop(guard);
        assert!(matches!(result, Err(GatewayError::SubscriptionTimeout { .. })));
    }
}
