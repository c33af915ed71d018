//! Backend snapshot providers used to seed newly subscribed widgets.

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::domain::{SubscriptionOptions, WidgetId, WidgetType};

/// Request for the current state of a widget.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotRequest {
    /// Backend operation, e.g. `asset-service.snapshot`.
    pub operation: String,
    /// Widget being seeded.
    pub widget_id: WidgetId,
    /// Widget type.
    pub widget_type: WidgetType,
    /// Options of the subscription that triggered the seed.
    pub options: SubscriptionOptions,
    /// Subject of the requesting identity.
    pub subject: String,
}

/// Source of widget snapshots.
#[async_trait]
pub trait SnapshotProvider: Send + Sync + fmt::Debug {
    /// Fetches the current state for a widget. `Ok(None)` means the backend
    /// has nothing to seed with.
    ///
    /// # Errors
    ///
    /// Returns an error on transport or backend failure. The caller counts
    /// it against the operation's circuit breaker.
    async fn fetch(&self, request: &SnapshotRequest) -> anyhow::Result<Option<Value>>;
}

/// Provider that never has a snapshot. Used when no backend is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSnapshotProvider;

#[async_trait]
impl SnapshotProvider for NoSnapshotProvider {
    async fn fetch(&self, _request: &SnapshotRequest) -> anyhow::Result<Option<Value>> {
        Ok(None)
    }
}

/// Provider that POSTs the request to `{base_url}/snapshots`.
///
/// `404` is treated as "no snapshot"; other non-success statuses are errors.
#[derive(Debug, Clone)]
pub struct HttpSnapshotProvider {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpSnapshotProvider {
    /// Creates a provider for the given base URL.
    #[must_use]
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: format!("{}/snapshots", base_url.trim_end_matches('/')),
        }
    }

    /// Returns the full endpoint URL.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl SnapshotProvider for HttpSnapshotProvider {
    async fn fetch(&self, request: &SnapshotRequest) -> anyhow::Result<Option<Value>> {
        let response = self.client.post(&self.endpoint).json(request).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response.error_for_status()?;
        let body: Value = response.json().await?;
        Ok(Some(body))
    }
}
