//! Broadcast channel carrying domain events from producers to the
//! broadcaster.
//!
//! [`EventBus`] wraps a [`tokio::sync::broadcast`] channel of
//! `Arc<DomainEvent>`. Upstream producers (in-process, or through the
//! ingestion endpoint) publish; the update broadcaster is the consumer.

use std::sync::Arc;

use tokio::sync::broadcast;

use super::DomainEvent;

/// Broadcast bus for [`DomainEvent`]s.
///
/// When the ring buffer is full, the oldest events are dropped for lagging
/// receivers, which observe a `Lagged` error with the number skipped.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Arc<DomainEvent>>,
}

impl EventBus {
    /// Creates a new `EventBus` with the given channel capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes an event to all receivers.
    ///
    /// Returns the number of receivers that will observe the event; zero
    /// when nobody is listening.
    pub fn publish(&self, event: DomainEvent) -> usize {
        self.sender.send(Arc::new(event)).unwrap_or(0)
    }

    /// Creates a new receiver that will see all future events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.sender.subscribe()
    }

    /// Returns the current number of active receivers.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::domain::EventPayload;

    fn make_event(location: &str) -> DomainEvent {
        DomainEvent::new(
            "locations",
            EventPayload::CapacityChanged {
                location_id: location.to_string(),
                occupancy: 3,
                capacity: 10,
            },
        )
    }

    #[test]
    fn publish_without_receivers_returns_zero() {
        let bus = EventBus::new(16);
        assert_eq!(bus.publish(make_event("dock-1")), 0);
    }

    #[tokio::test]
    async fn subscriber_receives_event() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        let event = make_event("dock-1");
        let id = event.event_id;
        bus.publish(event);

        let Ok(received) = rx.recv().await else {
            panic!("expected to receive event");
        };
        assert_eq!(received.event_id, id);
    }

    #[tokio::test]
    async fn multiple_subscribers_share_the_same_allocation() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        assert_eq!(bus.publish(make_event("dock-2")), 2);

        let (Ok(e1), Ok(e2)) = (rx1.recv().await, rx2.recv().await) else {
            panic!("receivers failed");
        };
        assert!(Arc::ptr_eq(&e1, &e2));
    }

    #[test]
    fn receiver_count_tracks_subscribers() {
        let bus = EventBus::new(16);
        assert_eq!(bus.receiver_count(), 0);
        let rx1 = bus.subscribe();
        let _rx2 = bus.subscribe();
        assert_eq!(bus.receiver_count(), 2);
        drop(rx1);
        assert_eq!(bus.receiver_count(), 1);
    }
}
