//! # livetrack-gateway
//!
//! Real-time widget distribution for RFID asset-tracking dashboards.
//!
//! Backend producers publish domain events (asset moves, tag reads, reader
//! health, location capacity). The gateway batches them per widget,
//! optionally compresses them, and fans them out over WebSockets to every
//! dashboard subscribed to that widget. A reconnecting client session lives
//! in [`client`].
//!
//! ## Architecture
//!
//! ```text
//! Producers (POST /api/v1/events)          Dashboards (/ws)
//!     │                                        │
//!     ├── EventBus (domain/)                   ├── WS Handler (ws/)
//!     │                                        │
//!     ├── UpdateBroadcaster (service/) ──────► ConnectionManager (service/)
//!     │        │                               │
//!     │        ├── SubscriptionRegistry (domain/)
//!     │        └── BackendGateway (resilience/)
//!     │               ├── RateLimiter
//!     │               └── CircuitBreaker per operation
//!     │
//!     └── ClientSession (client/) ◄── wire ── OutboundQueue per connection
//! ```

pub mod api;
pub mod app_state;
pub mod auth;
pub mod client;
pub mod clock;
pub mod codec;
pub mod config;
pub mod domain;
pub mod error;
pub mod resilience;
pub mod service;
pub mod ws;
