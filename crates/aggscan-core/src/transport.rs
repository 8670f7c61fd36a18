//! Single-request transport seam
//!
//! The scan runner never speaks HTTP itself. It hands a target and an opaque
//! query to an injected [`AggregationTransport`] and classifies whatever
//! [`TransportError`] comes back.

use crate::error::TransportError;
use aggscan_registry::ScanEntry;
use std::time::Duration;

/// Opaque aggregation query payload
pub type AggregationQuery = serde_json::Value;

/// Opaque aggregation response
pub type AggregationResponse = serde_json::Value;

/// Where (and as whom) a request is sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportTarget {
    /// API domain
    pub domain: String,
    /// Credential
    pub credential: String,
    /// Application id, when the API scopes requests by app
    pub app_id: Option<String>,
}

impl From<&ScanEntry> for TransportTarget {
    fn from(entry: &ScanEntry) -> Self {
        Self {
            domain: entry.domain.clone(),
            credential: entry.credential.clone(),
            app_id: Some(entry.entity_id.clone()),
        }
    }
}

/// Issues one aggregation request
#[async_trait::async_trait]
pub trait AggregationTransport: Send + Sync {
    /// Send a query and return the raw response
    ///
    /// # Errors
    /// A `TransportError` carrying the HTTP status and/or body text so the
    /// caller can classify it.
    async fn send(
        &self,
        target: &TransportTarget,
        payload: &AggregationQuery,
    ) -> Result<AggregationResponse, TransportError>;
}

/// Run `send` under a timeout; expiry becomes a retryable timeout error
///
/// Dropping the transport future aborts the underlying request.
pub(crate) async fn send_with_timeout(
    transport: &dyn AggregationTransport,
    target: &TransportTarget,
    payload: &AggregationQuery,
    timeout: Duration,
) -> Result<AggregationResponse, TransportError> {
    match tokio::time::timeout(timeout, transport.send(target, payload)).await {
        Ok(result) => result,
        Err(_elapsed) => Err(TransportError::timeout(timeout)),
    }
}
