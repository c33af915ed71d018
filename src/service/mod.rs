//! Service layer: connection lifecycle, batching broadcaster and the
//! [`DistributionService`] facade the transport layers call into.

pub mod batch;
pub mod broadcaster;
pub mod connection_manager;
pub mod distribution;

pub use batch::BatchBuffer;
pub use broadcaster::{BroadcasterStats, SNAPSHOT_UNAVAILABLE, SnapshotOutcome, UpdateBroadcaster};
pub use connection_manager::{Connection, ConnectionManager, ConnectionStats, Handshake};
pub use distribution::{BackgroundTasks, DistributionService, GatewayStats};
