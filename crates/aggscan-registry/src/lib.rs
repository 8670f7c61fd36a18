//! Aggscan Registry - pending and recorded aggregation calls
//!
//! The registry is the only shared mutable state of a scan:
//! - Stages one queued record per scan entry
//! - Tracks the `queued -> in-flight -> completed | failed` lifecycle
//! - Keeps per-window planned/settled request counts
//! - Appends every terminal outcome to an audit log
//! - Notifies observers on every change
//!
//! # Example
//!
//! ```rust
//! use aggscan_registry::{CallRegistry, Resolution, ScanEntry};
//!
//! let registry = CallRegistry::new();
//! registry.stage(&[ScanEntry::new("app-1", "eu", "secret")], 30);
//!
//! let record = registry.take_next_queued().unwrap();
//! registry.mark_started(record.call_id);
//! registry.resolve(record.call_id, Resolution::completed(1));
//!
//! let progress = registry.summarize_progress();
//! assert_eq!(progress.completed, progress.total);
//! ```

#![warn(unreachable_pub)]

pub mod registry;
pub mod types;

pub use registry::{CallRegistry, RegistryRevision, DEEP_DIVE_OPERATION};
pub use types::{
    CallId, CallStatus, PendingCallRecord, PlanReason, ProgressSummary, QueueKey,
    RecordedCallRecord, Resolution, ScanEntry, ScanId, TerminalStatus, WindowPlan,
};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
