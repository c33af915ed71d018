//! Dashboard client: a reconnecting session over the gateway's WebSocket
//! protocol.
//!
//! [`ClientSession`] owns subscription intent and callback dispatch,
//! [`ReconnectionController`] decides when to retry, and a [`Connector`]
//! supplies transports ([`WsConnector`] in production).

pub mod reconnect;
pub mod session;
pub mod transport;

pub use reconnect::{ConnectionState, ReconnectDecision, ReconnectionController, RetryPolicy};
pub use session::{CallbackId, ClientConfig, ClientSession, WidgetCallback, WidgetUpdate};
pub use transport::{Connector, TransportLink, WsConnector};
