//! Backend protection: circuit breakers, role rate limits and snapshot
//! providers.

pub mod backend;
pub mod circuit_breaker;
pub mod rate_limiter;
pub mod snapshot;

pub use backend::BackendGateway;
pub use circuit_breaker::{BreakerPermit, BreakerSnapshot, CircuitBreaker, CircuitState};
pub use rate_limiter::RateLimiter;
pub use snapshot::{HttpSnapshotProvider, NoSnapshotProvider, SnapshotProvider, SnapshotRequest};
