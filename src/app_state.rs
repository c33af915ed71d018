//! Shared application state injected into all Axum handlers.

use std::sync::Arc;

use crate::service::DistributionService;

/// Shared application state available to all handlers via Axum's
/// `State` extractor.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Distribution pipeline: connections, subscriptions, broadcaster.
    pub service: Arc<DistributionService>,
}

impl AppState {
    /// Wraps a service for the router.
    #[must_use]
    pub const fn new(service: Arc<DistributionService>) -> Self {
        Self { service }
    }
}
