//! Data model for the call registry
//!
//! Defines the records the registry owns:
//! - Scan entries (caller input, immutable)
//! - Pending call records and their window plans
//! - Recorded (terminal) call outcomes
//! - Progress summaries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use ulid::Ulid;

/// One unit of work: fetch deep-dive metadata for an entity with a credential
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanEntry {
    /// Application / entity identifier
    pub entity_id: String,
    /// Optional sub-group (e.g. a platform or region) within the entity
    #[serde(default)]
    pub sub_group_id: String,
    /// API domain the credential belongs to
    pub domain: String,
    /// API credential used for this entity
    pub credential: String,
    /// Human-readable application name
    #[serde(default)]
    pub app_name: String,
}

impl ScanEntry {
    /// Create a new entry
    #[inline]
    #[must_use]
    pub fn new(
        entity_id: impl Into<String>,
        domain: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            sub_group_id: String::new(),
            domain: domain.into(),
            credential: credential.into(),
            app_name: String::new(),
        }
    }

    /// With sub-group id
    #[inline]
    #[must_use]
    pub fn with_sub_group(mut self, sub_group_id: impl Into<String>) -> Self {
        self.sub_group_id = sub_group_id.into();
        self
    }

    /// With application name
    #[inline]
    #[must_use]
    pub fn with_app_name(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = app_name.into();
        self
    }

    /// Deduplication signature for this entry
    #[inline]
    #[must_use]
    pub fn queue_key(&self) -> QueueKey {
        QueueKey::new(&self.entity_id, &self.sub_group_id)
    }

    /// Name of the first required field that is blank, if any
    #[must_use]
    pub fn missing_field(&self) -> Option<&'static str> {
        if self.entity_id.trim().is_empty() {
            Some("entity_id")
        } else if self.domain.trim().is_empty() {
            Some("domain")
        } else if self.credential.trim().is_empty() {
            Some("credential")
        } else {
            None
        }
    }

    /// Label used in logs and failure reports
    #[must_use]
    pub fn label(&self) -> String {
        let name = if self.app_name.is_empty() {
            self.entity_id.as_str()
        } else {
            self.app_name.as_str()
        };
        if self.sub_group_id.is_empty() {
            name.to_string()
        } else {
            format!("{name} [{}]", self.sub_group_id)
        }
    }
}

/// Deterministic signature of `(entity_id, sub_group_id)`
///
/// Hex-encoded SHA-256 over the trimmed entity id, a NUL separator and the
/// trimmed sub-group id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct QueueKey(String);

impl QueueKey {
    /// Compute the key for an entity / sub-group pair
    #[must_use]
    pub fn new(entity_id: &str, sub_group_id: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(entity_id.trim().as_bytes());
        hasher.update([0u8]);
        hasher.update(sub_group_id.trim().as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Hex representation
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for log lines
    #[inline]
    #[must_use]
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl std::fmt::Display for QueueKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of one staged scan (ULID for sortability)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ScanId(pub Ulid);

impl ScanId {
    /// Generate new scan ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ScanId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ScanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle to a record in one scan's staged table
///
/// Row indices restart at zero on every `stage`, so the handle also names the
/// scan; handles from an earlier scan never match the current table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CallId {
    /// Scan the row belongs to
    pub scan_id: ScanId,
    /// Row index within that scan
    pub index: usize,
}

impl CallId {
    /// Handle for row `index` of `scan_id`
    #[inline]
    #[must_use]
    pub fn new(scan_id: ScanId, index: usize) -> Self {
        Self { scan_id, index }
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.scan_id, self.index)
    }
}

/// Pending call state machine
///
/// `Queued -> InFlight -> Completed | Failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallStatus {
    /// Waiting for a dispatch slot
    Queued,
    /// Request issued, not yet resolved
    InFlight,
    /// Terminal success
    Completed,
    /// Terminal failure
    Failed,
}

impl CallStatus {
    /// The one status progress accounting treats as resolved
    pub const RESOLVED: CallStatus = CallStatus::Completed;

    /// Whether this is the resolved sentinel
    #[inline]
    #[must_use]
    pub fn is_resolved(self) -> bool {
        self == Self::RESOLVED
    }

    /// Whether no further transitions happen without re-staging
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Stable label
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InFlight => "in-flight",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal statuses accepted by `CallRegistry::resolve`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TerminalStatus {
    /// Success
    Completed,
    /// Failure
    Failed,
}

impl From<TerminalStatus> for CallStatus {
    fn from(status: TerminalStatus) -> Self {
        match status {
            TerminalStatus::Completed => CallStatus::Completed,
            TerminalStatus::Failed => CallStatus::Failed,
        }
    }
}

/// Outcome handed to `CallRegistry::resolve`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Terminal status
    pub status: TerminalStatus,
    /// Error detail or note
    pub error: Option<String>,
    /// Number of datasets (raw responses) obtained
    pub dataset_count: usize,
    /// Window that produced the data, when a request succeeded
    pub applied_window: Option<u32>,
}

impl Resolution {
    /// Note attached to duplicate entries skipped by the dispatcher
    pub const DUPLICATE_NOTE: &'static str = "duplicate skipped";

    /// Successful resolution
    #[inline]
    #[must_use]
    pub fn completed(dataset_count: usize) -> Self {
        Self {
            status: TerminalStatus::Completed,
            error: None,
            dataset_count,
            applied_window: None,
        }
    }

    /// Record the window that actually served the data
    #[inline]
    #[must_use]
    pub fn with_applied_window(mut self, window_days: u32) -> Self {
        self.applied_window = Some(window_days);
        self
    }

    /// Failed resolution
    #[inline]
    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: TerminalStatus::Failed,
            error: Some(error.into()),
            dataset_count: 0,
            applied_window: None,
        }
    }

    /// Duplicate entry, resolved without a request
    #[inline]
    #[must_use]
    pub fn duplicate() -> Self {
        Self {
            status: TerminalStatus::Completed,
            error: Some(Self::DUPLICATE_NOTE.to_string()),
            dataset_count: 0,
            applied_window: None,
        }
    }
}

/// Why a window plan was recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlanReason {
    /// Single request covering the full requested window
    FullWindow,
    /// Smaller window after a retryable failure
    Fallback,
    /// Window split into chunks by a chunk-size hint
    ForcedChunk,
}

impl std::fmt::Display for PlanReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::FullWindow => "full-window",
            Self::Fallback => "fallback",
            Self::ForcedChunk => "forced-chunk",
        })
    }
}

/// Planned vs settled sub-requests for one attempted window size
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowPlan {
    /// Window size in days
    pub window_size: u32,
    /// Sub-requests planned for this window
    pub planned: u32,
    /// Sub-requests that returned (success or failure)
    pub settled: u32,
    /// Why the plan exists
    pub reason: PlanReason,
}

/// A staged aggregation call (owned by the registry)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCallRecord {
    /// Row id in the staged table
    pub call_id: CallId,
    /// Scan the record belongs to
    pub scan_id: ScanId,
    /// Deduplication signature
    pub queue_key: QueueKey,
    /// The entry being fetched
    pub entry: ScanEntry,
    /// Operation name
    pub operation: String,
    /// Requested lookback in days
    pub lookback_days: u32,
    /// Current status
    pub status: CallStatus,
    /// When the record was staged
    pub queued_at: DateTime<Utc>,
    /// When dispatch started
    pub started_at: Option<DateTime<Utc>>,
    /// When the record reached a terminal state
    pub completed_at: Option<DateTime<Utc>>,
    /// Error detail or note
    pub error: Option<String>,
    /// Known number of requests (never decreases within a scan)
    pub request_count: u32,
    /// Window that served the data; below `lookback_days` when narrowed
    pub applied_window: Option<u32>,
    /// Per-window planning bookkeeping
    pub planned_windows: Vec<WindowPlan>,
}

impl PendingCallRecord {
    /// Entity id shortcut
    #[inline]
    #[must_use]
    pub fn entity_id(&self) -> &str {
        &self.entry.entity_id
    }

    /// Sub-group id shortcut
    #[inline]
    #[must_use]
    pub fn sub_group_id(&self) -> &str {
        &self.entry.sub_group_id
    }

    /// Whether the data covers less than the requested lookback
    #[inline]
    #[must_use]
    pub fn is_narrowed(&self) -> bool {
        self.applied_window.is_some_and(|w| w < self.lookback_days)
    }
}

/// Append-only log entry for a terminal outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedCallRecord {
    /// Scan the outcome belongs to
    pub scan_id: ScanId,
    /// Entity id
    pub entity_id: String,
    /// Sub-group id
    pub sub_group_id: String,
    /// Requested lookback in days
    pub lookback_days: u32,
    /// Window that served the data
    pub applied_window: Option<u32>,
    /// Requests spent on the entity
    pub request_count: u32,
    /// Datasets obtained
    pub dataset_count: usize,
    /// Terminal status
    pub status: CallStatus,
    /// Error detail or note
    pub error: Option<String>,
    /// When the outcome was recorded
    pub recorded_at: DateTime<Utc>,
}

impl RecordedCallRecord {
    /// Whether the data covers less than the requested lookback
    #[inline]
    #[must_use]
    pub fn is_narrowed(&self) -> bool {
        self.applied_window.is_some_and(|w| w < self.lookback_days)
    }
}

/// Request-count based progress
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSummary {
    /// Sum of request counts over all records
    pub total: u64,
    /// Sum of request counts over resolved records
    pub completed: u64,
    /// Sum of request counts over failed records
    pub failed: u64,
}

impl ProgressSummary {
    /// Requests that reached any terminal state
    #[inline]
    #[must_use]
    pub fn settled(&self) -> u64 {
        self.completed + self.failed
    }
}
