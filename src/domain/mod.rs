//! Domain layer: identifiers, events, widgets, delivery primitives and the
//! subscription registry.
//!
//! Nothing in here knows about sockets or HTTP. The service layer composes
//! these pieces into the connection manager and the broadcaster.

pub mod domain_event;
pub mod event_bus;
pub mod ids;
pub mod outbound;
pub mod subscription_registry;
pub mod widget;

pub use domain_event::{DomainEvent, EventKind, EventPayload, ReaderStatus};
pub use event_bus::EventBus;
pub use ids::{ConnectionId, WidgetId};
pub use outbound::{DeliveryOutcome, OutboundFrame, OutboundQueue, SubscriberHandle};
pub use subscription_registry::{SubscribeAck, SubscriptionRegistry, WidgetSummary};
pub use widget::{SubscriptionOptions, WidgetFilter, WidgetType};
