//! Scan orchestrator
//!
//! Top-level entry point for a deep-dive scan:
//! 1. Validate entries and stage them in the registry
//! 2. Start the dispatcher and the stall watchdog
//! 3. Wait until the registry drains
//! 4. Stop the watchdog and summarise failures
//!
//! Per-entity failures never abort a scan; they are reported through the
//! progress callbacks and returned in the summary.

use crate::activity::ActivityTracker;
use crate::callbacks::{DiscardSink, ProgressCallbacks, ResponseSink};
use crate::config::ScanConfig;
use crate::dispatcher::{ConcurrencyDispatcher, DispatchStats};
use crate::error::ScanError;
use crate::payload::PayloadBuilder;
use crate::transport::AggregationTransport;
use crate::watchdog::{LogStallObserver, StallObserver, StallWatchdog, WatchdogStats};
use crate::window::WindowFallbackExecutor;
use aggscan_registry::{CallRegistry, CallStatus, RegistryRevision, ScanEntry, ScanId};
use std::sync::Arc;
use tokio::sync::watch;

/// One failed entity in a scan summary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureDetail {
    /// Entity id
    pub entity_id: String,
    /// Sub-group id
    pub sub_group_id: String,
    /// Error text
    pub error: String,
}

/// Per-entity result in a scan summary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityOutcome {
    /// Entity id
    pub entity_id: String,
    /// Sub-group id
    pub sub_group_id: String,
    /// Terminal status
    pub status: CallStatus,
    /// Lookback requested for the scan
    pub requested_window: u32,
    /// Window that served the data; `None` for failures and duplicates
    pub applied_window: Option<u32>,
    /// Requests spent on the entity
    pub request_count: u32,
}

impl EntityOutcome {
    /// Whether the data covers less than the requested lookback
    #[inline]
    #[must_use]
    pub fn is_narrowed(&self) -> bool {
        self.applied_window.is_some_and(|w| w < self.requested_window)
    }
}

/// Result of a finished scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanSummary {
    /// Scan identifier
    pub scan_id: ScanId,
    /// Requests resolved successfully
    pub completed_calls: u64,
    /// Requests known in total
    pub total_calls: u64,
    /// Entities that completed (duplicates included)
    pub success_count: usize,
    /// Entities that failed
    pub failures: Vec<FailureDetail>,
    /// Every resolved entity, in resolution order
    pub outcomes: Vec<EntityOutcome>,
    /// Entries dropped for missing fields
    pub dropped_entries: usize,
    /// Dispatcher counters
    pub dispatch: DispatchStats,
    /// Watchdog counters
    pub watchdog: WatchdogStats,
}

impl ScanSummary {
    /// Whether every entity succeeded
    #[inline]
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Entities whose data covers less than the requested lookback
    pub fn narrowed(&self) -> impl Iterator<Item = &EntityOutcome> {
        self.outcomes.iter().filter(|o| o.is_narrowed())
    }

    /// Aggregate failure message, if any entity failed
    #[must_use]
    pub fn failure_message(&self) -> Option<String> {
        if self.failures.is_empty() {
            return None;
        }
        let mut message = format!(
            "{} requests failed; rerun to avoid incomplete exports",
            self.failures.len()
        );
        for failure in &self.failures {
            message.push_str(&format!("\n- {}", failure.entity_id));
            if !failure.sub_group_id.is_empty() {
                message.push_str(&format!(" [{}]", failure.sub_group_id));
            }
            message.push_str(&format!(": {}", failure.error));
        }
        Some(message)
    }
}

/// Runs deep-dive scans
pub struct ScanOrchestrator {
    config: ScanConfig,
    registry: Arc<CallRegistry>,
    executor: Arc<WindowFallbackExecutor>,
    sink: Arc<dyn ResponseSink>,
    stall_observer: Arc<dyn StallObserver>,
}

impl std::fmt::Debug for ScanOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanOrchestrator")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}

impl ScanOrchestrator {
    /// Create an orchestrator with its own registry
    ///
    /// # Errors
    /// `ScanError::Config` when the configuration is out of range.
    pub fn new(
        config: ScanConfig,
        transport: Arc<dyn AggregationTransport>,
        builder: Arc<dyn PayloadBuilder>,
    ) -> Result<Self, ScanError> {
        config.validate()?;
        let executor = Arc::new(WindowFallbackExecutor::new(transport, builder, &config));
        Ok(Self {
            config,
            registry: Arc::new(CallRegistry::new()),
            executor,
            sink: Arc::new(DiscardSink),
            stall_observer: Arc::new(LogStallObserver),
        })
    }

    /// With response sink
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn ResponseSink>) -> Self {
        self.sink = sink;
        self
    }

    /// With stall observer
    #[must_use]
    pub fn with_stall_observer(mut self, observer: Arc<dyn StallObserver>) -> Self {
        self.stall_observer = observer;
        self
    }

    /// Shared registry, for progress observers and export gating
    #[must_use]
    pub fn registry(&self) -> Arc<CallRegistry> {
        Arc::clone(&self.registry)
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Run one scan to completion
    ///
    /// # Errors
    /// Only contract violations: a zero-day window or a dispatcher worker
    /// that died. Entity failures are in the returned summary.
    pub async fn run_scan(
        &self,
        entries: Vec<ScanEntry>,
        total_window_days: u32,
        callbacks: Arc<dyn ProgressCallbacks>,
    ) -> Result<ScanSummary, ScanError> {
        if total_window_days == 0 {
            return Err(ScanError::InvalidWindow(total_window_days));
        }

        let (valid, dropped) = partition_entries(entries);
        if dropped > 0 {
            tracing::warn!(dropped, "dropping entries with missing entity id, domain or credential");
            callbacks.on_api_status(&format!(
                "Skipped {dropped} entries with missing entity id, domain or credential"
            ));
        }

        let scan_id = self.registry.stage(&valid, total_window_days);
        tracing::info!(
            %scan_id,
            entries = valid.len(),
            total_window_days,
            concurrency = self.config.concurrency_limit,
            "starting deep-dive scan"
        );
        callbacks.on_api_status(&format!(
            "Fetching {} entries over {total_window_days} days",
            valid.len()
        ));

        let activity = Arc::new(ActivityTracker::new());
        let changes = self.registry.subscribe();
        let dispatcher = Arc::new(ConcurrencyDispatcher::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.executor),
            Arc::clone(&activity),
            Arc::clone(&callbacks),
            Arc::clone(&self.sink),
            &self.config,
        ));
        let watchdog = StallWatchdog::new(
            Arc::clone(&self.registry),
            Arc::clone(&activity),
            Arc::clone(&self.stall_observer),
            self.config.watchdog_interval(),
            self.config.stall_threshold(),
        )
        .start();

        let mut dispatch = tokio::spawn(dispatcher.run());
        let drained = wait_until_drained(&self.registry, &activity, callbacks.as_ref(), changes);
        tokio::pin!(drained);

        let joined = tokio::select! {
            () = &mut drained => None,
            joined = &mut dispatch => Some(joined),
        };
        let joined = match joined {
            Some(joined) => joined,
            None => dispatch.await,
        };
        let watchdog_stats = watchdog.stop().await;

        let dispatch_stats = joined.map_err(|e| ScanError::Dispatcher(e.to_string()))??;
        if !is_drained(&self.registry, &activity) {
            return Err(ScanError::Dispatcher(
                "workers exited with calls still outstanding".to_string(),
            ));
        }

        let summary = self.summarize(scan_id, dropped, dispatch_stats, watchdog_stats);
        callbacks.on_api_progress(summary.completed_calls, summary.total_calls);
        if let Some(message) = summary.failure_message() {
            tracing::warn!(failed = summary.failures.len(), "scan finished with failures");
            callbacks.on_api_error(&message);
        }
        tracing::info!(
            %scan_id,
            succeeded = summary.success_count,
            failed = summary.failures.len(),
            narrowed = summary.narrowed().count(),
            completed_calls = summary.completed_calls,
            total_calls = summary.total_calls,
            "deep-dive scan finished"
        );
        callbacks.on_api_status(&format!(
            "Scan complete: {} succeeded, {} failed",
            summary.success_count,
            summary.failures.len()
        ));
        Ok(summary)
    }

    fn summarize(
        &self,
        scan_id: ScanId,
        dropped_entries: usize,
        dispatch: DispatchStats,
        watchdog: WatchdogStats,
    ) -> ScanSummary {
        let progress = self.registry.summarize_progress();
        let recorded = self.registry.recorded_for_current_scan();
        let success_count = recorded
            .iter()
            .filter(|r| r.status.is_resolved())
            .count();
        let outcomes = recorded
            .iter()
            .map(|r| EntityOutcome {
                entity_id: r.entity_id.clone(),
                sub_group_id: r.sub_group_id.clone(),
                status: r.status,
                requested_window: r.lookback_days,
                applied_window: r.applied_window,
                request_count: r.request_count,
            })
            .collect();
        let failures = recorded
            .into_iter()
            .filter(|r| r.status == CallStatus::Failed)
            .map(|r| FailureDetail {
                entity_id: r.entity_id,
                sub_group_id: r.sub_group_id,
                error: r.error.unwrap_or_default(),
            })
            .collect();

        ScanSummary {
            scan_id,
            completed_calls: progress.completed,
            total_calls: progress.total,
            success_count,
            failures,
            outcomes,
            dropped_entries,
            dispatch,
            watchdog,
        }
    }
}

/// Split entries into usable ones and a count of dropped ones
fn partition_entries(entries: Vec<ScanEntry>) -> (Vec<ScanEntry>, usize) {
    let total = entries.len();
    let valid: Vec<ScanEntry> = entries
        .into_iter()
        .filter(|entry| match entry.missing_field() {
            Some(field) => {
                tracing::debug!(entity_id = %entry.entity_id, field, "entry missing required field");
                false
            }
            None => true,
        })
        .collect();
    let dropped = total - valid.len();
    (valid, dropped)
}

/// Settled covers total, nothing queued, nothing active
fn is_drained(registry: &CallRegistry, activity: &ActivityTracker) -> bool {
    let progress = registry.summarize_progress();
    progress.settled() >= progress.total
        && !registry.has_queued()
        && activity.active_requests() == 0
}

async fn wait_until_drained(
    registry: &CallRegistry,
    activity: &ActivityTracker,
    callbacks: &dyn ProgressCallbacks,
    mut changes: watch::Receiver<RegistryRevision>,
) {
    loop {
        let progress = registry.summarize_progress();
        callbacks.on_api_progress(progress.completed, progress.total);
        if is_drained(registry, activity) {
            return;
        }
        if changes.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_drops_incomplete_entries() {
        let entries = vec![
            ScanEntry::new("a", "eu", "key"),
            ScanEntry::new("", "eu", "key"),
            ScanEntry::new("b", "", "key"),
            ScanEntry::new("c", "eu", " "),
        ];
        let (valid, dropped) = partition_entries(entries);
        assert_eq!(valid.len(), 1);
        assert_eq!(dropped, 3);
    }

    #[test]
    fn failure_message_lists_entities() {
        let summary = ScanSummary {
            scan_id: ScanId::new(),
            completed_calls: 1,
            total_calls: 2,
            success_count: 1,
            failures: vec![FailureDetail {
                entity_id: "app-3".into(),
                sub_group_id: "ios".into(),
                error: "HTTP 401".into(),
            }],
            outcomes: Vec::new(),
            dropped_entries: 0,
            dispatch: DispatchStats::default(),
            watchdog: WatchdogStats::default(),
        };

        let message = summary.failure_message().unwrap();
        assert!(message.starts_with("1 requests failed; rerun to avoid incomplete exports"));
        assert!(message.contains("app-3 [ios]: HTTP 401"));
        assert!(!summary.is_clean());
    }
}
