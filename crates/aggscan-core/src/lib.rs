//! Aggscan Core - deep-dive aggregation scan runner
//!
//! Fetches a server-limited dataset per (entity, credential) pair:
//! - Narrows the time window when the API rejects or times out a request
//! - Splits windows into staggered chunk requests when asked to
//! - Runs entries with bounded concurrency and dispatch spacing
//! - Reports stalled work through an advisory watchdog
//! - Summarises partial failures without aborting the scan
//!
//! # Example
//!
//! ```rust,ignore
//! use aggscan_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example(transport: Arc<dyn AggregationTransport>) -> Result<(), ScanError> {
//! let orchestrator = ScanOrchestrator::new(
//!     ScanConfig::new().with_concurrency(2),
//!     transport,
//!     Arc::new(DateRangePayloadBuilder::ending_today()),
//! )?;
//!
//! let entries = vec![ScanEntry::new("app-1", "eu.example.com", "secret")];
//! let summary = orchestrator.run_scan(entries, 180, Arc::new(NoopCallbacks)).await?;
//! println!("{} succeeded, {} failed", summary.success_count, summary.failures.len());
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]

pub mod activity;
pub mod callbacks;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod orchestrator;
pub mod payload;
pub mod telemetry;
pub mod transport;
pub mod watchdog;
pub mod window;

pub use activity::ActivityTracker;
pub use callbacks::{DiscardSink, NoopCallbacks, ProgressCallbacks, ResponseSink};
pub use config::{ScanConfig, DEFAULT_FALLBACK_WINDOWS};
pub use dispatcher::{ConcurrencyDispatcher, DispatchStats};
pub use error::{
    AggregationError, ConfigError, ErrorClass, ScanError, TransportError, TransportErrorKind,
};
pub use orchestrator::{EntityOutcome, FailureDetail, ScanOrchestrator, ScanSummary};
pub use payload::{split_window, DateRange, DateRangePayloadBuilder, PayloadBuilder};
pub use transport::{AggregationQuery, AggregationResponse, AggregationTransport, TransportTarget};
pub use watchdog::{
    LogStallObserver, StallObserver, StallReport, StallWatchdog, StalledEntry, WatchdogHandle,
    WatchdogStats,
};
pub use window::{
    fallback_windows, DispatchAttempt, NoopPlanObserver, PlanObserver, WindowFallbackExecutor,
    WindowOutcome,
};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for running scans
    pub use crate::{
        AggregationError, AggregationQuery, AggregationResponse, AggregationTransport,
        DateRangePayloadBuilder, NoopCallbacks, PayloadBuilder, ProgressCallbacks, ResponseSink,
        ScanConfig, ScanError, ScanOrchestrator, ScanSummary, TransportError, TransportTarget,
    };
    pub use aggscan_registry::{CallRegistry, CallStatus, ScanEntry};
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
