//! Outbound notification seams
//!
//! Fire-and-forget hooks consumed by UI and export layers. The runner never
//! looks at what they do.

use crate::transport::AggregationResponse;
use aggscan_registry::ScanEntry;

/// Progress notifications for a running scan
///
/// All methods default to no-ops so consumers implement only what they show.
pub trait ProgressCallbacks: Send + Sync {
    /// Requests completed out of the currently known total
    fn on_api_progress(&self, _completed: u64, _total: u64) {}

    /// Responses handed to the sink out of those received so far
    fn on_processing_progress(&self, _completed: u64, _total: u64) {}

    /// Informational status line
    fn on_api_status(&self, _message: &str) {}

    /// Request-side failure
    fn on_api_error(&self, _message: &str) {}

    /// Response-handling failure
    fn on_processing_error(&self, _message: &str) {}
}

/// Callbacks that ignore everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCallbacks;

impl ProgressCallbacks for NoopCallbacks {}

/// Consumes raw responses of successfully fetched entities
pub trait ResponseSink: Send + Sync {
    /// Called once per response, in aggregation order, after the entity's
    /// fetch has fully resolved
    ///
    /// # Errors
    /// A message reported through `on_processing_error`; it does not fail the
    /// entity.
    fn on_response(&self, entry: &ScanEntry, response: &AggregationResponse) -> Result<(), String>;
}

/// Sink that drops every response
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardSink;

impl ResponseSink for DiscardSink {
    fn on_response(&self, _entry: &ScanEntry, _response: &AggregationResponse) -> Result<(), String> {
        Ok(())
    }
}
