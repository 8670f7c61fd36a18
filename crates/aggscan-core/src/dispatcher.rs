//! Concurrency dispatcher
//!
//! Drains the registry's queue with a fixed pool of workers:
//! - At most `concurrency_limit` entries in flight (one per worker)
//! - Dispatch starts spaced at least `dispatch_spacing` apart
//! - Duplicate queue keys resolved without touching the transport
//! - Each entry runs through the window fallback executor, then resolves

use crate::activity::ActivityTracker;
use crate::callbacks::{ProgressCallbacks, ResponseSink};
use crate::config::ScanConfig;
use crate::error::ScanError;
use crate::transport::AggregationResponse;
use crate::window::{PlanObserver, WindowFallbackExecutor};
use aggscan_registry::{CallId, CallRegistry, PendingCallRecord, PlanReason, QueueKey, Resolution, ScanEntry};
use dashmap::DashSet;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;

/// Counters for one dispatcher run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Entries sent to the executor
    pub dispatched: usize,
    /// Entries skipped as duplicates
    pub duplicates: usize,
    /// Entries that completed
    pub succeeded: usize,
    /// Entries that failed
    pub failed: usize,
    /// Highest simultaneous in-flight count
    pub peak_active: usize,
}

/// Reserves dispatch start slots at least `spacing` apart
#[derive(Debug)]
struct Pacer {
    spacing: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl Pacer {
    fn new(spacing: Duration) -> Self {
        Self {
            spacing,
            next_slot: Mutex::new(None),
        }
    }

    /// Wait until this caller's slot; slots are handed out in call order
    async fn wait_turn(&self) {
        let slot = {
            let mut next = self.next_slot.lock();
            let now = Instant::now();
            let slot = next.map_or(now, |n| n.max(now));
            *next = Some(slot + self.spacing);
            slot
        };
        tokio::time::sleep_until(slot).await;
    }
}

/// Forwards executor planning events into the registry
struct RegistryPlanObserver<'a> {
    registry: &'a CallRegistry,
    activity: &'a ActivityTracker,
    callbacks: &'a dyn ProgressCallbacks,
    call_id: CallId,
    label: String,
}

impl PlanObserver for RegistryPlanObserver<'_> {
    fn on_window_split(&self, window_days: u32, chunk_count: u32) {
        self.callbacks.on_api_status(&format!(
            "{}: splitting {window_days}-day window into {chunk_count} requests",
            self.label
        ));
    }

    fn on_planned(&self, planned: u32, window_days: u32, reason: PlanReason) {
        self.registry
            .update_window_plan(self.call_id, planned, window_days, reason);
    }

    fn on_settled(&self, settled: u32, window_days: u32) {
        self.activity.touch_processing();
        self.registry
            .settle_window_plan(self.call_id, settled, window_days);
    }
}

/// Worker pool pulling queued entries from the registry
pub struct ConcurrencyDispatcher {
    registry: Arc<CallRegistry>,
    executor: Arc<WindowFallbackExecutor>,
    activity: Arc<ActivityTracker>,
    callbacks: Arc<dyn ProgressCallbacks>,
    sink: Arc<dyn ResponseSink>,
    concurrency_limit: usize,
    pacer: Pacer,
    claimed: DashSet<QueueKey>,
    dispatched: AtomicUsize,
    duplicates: AtomicUsize,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
    responses_received: AtomicU64,
    responses_processed: AtomicU64,
}

impl std::fmt::Debug for ConcurrencyDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyDispatcher")
            .field("concurrency_limit", &self.concurrency_limit)
            .field("pacer", &self.pacer)
            .field("claimed", &self.claimed.len())
            .finish_non_exhaustive()
    }
}

impl ConcurrencyDispatcher {
    /// Create a dispatcher for one scan
    #[must_use]
    pub fn new(
        registry: Arc<CallRegistry>,
        executor: Arc<WindowFallbackExecutor>,
        activity: Arc<ActivityTracker>,
        callbacks: Arc<dyn ProgressCallbacks>,
        sink: Arc<dyn ResponseSink>,
        config: &ScanConfig,
    ) -> Self {
        Self {
            registry,
            executor,
            activity,
            callbacks,
            sink,
            concurrency_limit: config.concurrency_limit.max(1),
            pacer: Pacer::new(config.dispatch_spacing()),
            claimed: DashSet::new(),
            dispatched: AtomicUsize::new(0),
            duplicates: AtomicUsize::new(0),
            succeeded: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            responses_received: AtomicU64::new(0),
            responses_processed: AtomicU64::new(0),
        }
    }

    /// Drain the queue; returns once every worker found it empty
    ///
    /// # Errors
    /// `ScanError::Dispatcher` if a worker task panicked.
    pub async fn run(self: Arc<Self>) -> Result<DispatchStats, ScanError> {
        let workers = self.concurrency_limit;
        tracing::debug!(workers, "starting dispatcher");

        let mut join_set = JoinSet::new();
        for worker_id in 0..workers {
            let this = Arc::clone(&self);
            join_set.spawn(async move { this.worker_loop(worker_id).await });
        }

        let mut first_error = None;
        while let Some(joined) = join_set.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "dispatcher worker failed");
                first_error.get_or_insert_with(|| ScanError::Dispatcher(e.to_string()));
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }
        Ok(self.stats())
    }

    /// Snapshot of the counters
    #[must_use]
    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            dispatched: self.dispatched.load(Ordering::SeqCst),
            duplicates: self.duplicates.load(Ordering::SeqCst),
            succeeded: self.succeeded.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            peak_active: self.activity.peak_active(),
        }
    }

    async fn worker_loop(&self, worker_id: usize) {
        while let Some(record) = self.registry.take_next_queued() {
            if !self.claimed.insert(record.queue_key.clone()) {
                tracing::debug!(
                    worker_id,
                    entity_id = %record.entity_id(),
                    queue_key = record.queue_key.short(),
                    "duplicate entry skipped"
                );
                self.duplicates.fetch_add(1, Ordering::SeqCst);
                self.registry.resolve(record.call_id, Resolution::duplicate());
                continue;
            }

            self.pacer.wait_turn().await;
            if self.registry.mark_started(record.call_id).is_none() {
                continue;
            }
            self.dispatch(worker_id, &record).await;
        }
        tracing::trace!(worker_id, "queue empty, worker exiting");
    }

    async fn dispatch(&self, worker_id: usize, record: &PendingCallRecord) {
        self.activity.request_started();
        self.dispatched.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(
            worker_id,
            entity_id = %record.entity_id(),
            queue_key = record.queue_key.short(),
            lookback_days = record.lookback_days,
            "dispatching entry"
        );

        let observer = RegistryPlanObserver {
            registry: &self.registry,
            activity: &self.activity,
            callbacks: self.callbacks.as_ref(),
            call_id: record.call_id,
            label: record.entry.label(),
        };
        let result = self
            .executor
            .run(&record.entry, record.lookback_days, &observer)
            .await;
        // the active count drops before the registry resolves, so a drained
        // registry always implies zero active requests
        self.activity.request_finished();

        match result {
            Ok(outcome) => {
                if outcome.narrowed(record.lookback_days) {
                    self.callbacks.on_api_status(&format!(
                        "{}: used {}-day window instead of {} days",
                        record.entry.label(),
                        outcome.applied_window,
                        record.lookback_days
                    ));
                }
                self.deliver(&record.entry, &outcome.responses);
                self.succeeded.fetch_add(1, Ordering::SeqCst);
                let resolution = Resolution::completed(outcome.responses.len())
                    .with_applied_window(outcome.applied_window);
                self.registry.resolve(record.call_id, resolution);
            }
            Err(err) => {
                tracing::error!(
                    entity_id = %record.entity_id(),
                    request_count = err.request_count(),
                    error = %err,
                    "entity failed"
                );
                self.callbacks
                    .on_api_error(&format!("{}: {err}", record.entry.label()));
                self.failed.fetch_add(1, Ordering::SeqCst);
                self.registry
                    .resolve(record.call_id, Resolution::failed(err.to_string()));
            }
        }
    }

    /// Hand responses to the sink in aggregation order
    fn deliver(&self, entry: &ScanEntry, responses: &[AggregationResponse]) {
        let count = u64::try_from(responses.len()).unwrap_or(u64::MAX);
        self.responses_received.fetch_add(count, Ordering::SeqCst);

        for response in responses {
            match self.sink.on_response(entry, response) {
                Ok(()) => {
                    self.responses_processed.fetch_add(1, Ordering::SeqCst);
                }
                Err(message) => {
                    tracing::warn!(entity_id = %entry.entity_id, %message, "response rejected by sink");
                    self.callbacks
                        .on_processing_error(&format!("{}: {message}", entry.label()));
                }
            }
            self.activity.touch_processing();
            self.callbacks.on_processing_progress(
                self.responses_processed.load(Ordering::SeqCst),
                self.responses_received.load(Ordering::SeqCst),
            );
        }
    }
}
