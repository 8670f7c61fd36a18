//! Call registry
//!
//! The single owner of mutable scan state. Every pending call record, window
//! plan and recorded outcome lives here, and all mutation goes through the
//! narrow method set below. Methods take an internal lock, so the registry is
//! shared as `Arc<CallRegistry>` between the dispatcher, executor callbacks
//! and the watchdog.

use crate::types::{
    CallId, CallStatus, PendingCallRecord, PlanReason, ProgressSummary, QueueKey,
    RecordedCallRecord, Resolution, ScanEntry, ScanId, WindowPlan,
};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::watch;

/// Operation name recorded on deep-dive calls
pub const DEEP_DIVE_OPERATION: &str = "deep-dive";

/// Monotonic counter bumped on every registry mutation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct RegistryRevision(pub u64);

#[derive(Debug, Default)]
struct RegistryState {
    scan_id: Option<ScanId>,
    records: Vec<PendingCallRecord>,
    queue: VecDeque<CallId>,
    recorded: Vec<RecordedCallRecord>,
}

impl RegistryState {
    /// Row for `id`, only while its scan is the staged one
    fn record_mut(&mut self, id: CallId) -> Option<&mut PendingCallRecord> {
        if self.scan_id != Some(id.scan_id) {
            return None;
        }
        self.records.get_mut(id.index)
    }

    fn record(&self, id: CallId) -> Option<&PendingCallRecord> {
        if self.scan_id != Some(id.scan_id) {
            return None;
        }
        self.records.get(id.index)
    }
}

/// Authoritative record of pending and completed aggregation calls
#[derive(Debug)]
pub struct CallRegistry {
    state: Mutex<RegistryState>,
    changes: watch::Sender<RegistryRevision>,
}

impl CallRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = watch::channel(RegistryRevision::default());
        Self {
            state: Mutex::new(RegistryState::default()),
            changes,
        }
    }

    /// Subscribe to `pending-calls-changed` notifications
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<RegistryRevision> {
        self.changes.subscribe()
    }

    /// Current revision
    #[must_use]
    pub fn revision(&self) -> RegistryRevision {
        *self.changes.borrow()
    }

    fn notify(&self) {
        self.changes.send_modify(|rev| rev.0 += 1);
    }

    /// Replace the pending table with one queued record per entry
    ///
    /// Clears every pending record and window plan from the previous scan.
    /// The recorded-outcome log is kept; it is filtered by scan id.
    pub fn stage(&self, entries: &[ScanEntry], lookback_days: u32) -> ScanId {
        let scan_id = ScanId::new();
        let now = Utc::now();
        {
            let mut state = self.state.lock();
            state.scan_id = Some(scan_id);
            state.records = entries
                .iter()
                .enumerate()
                .map(|(idx, entry)| PendingCallRecord {
                    call_id: CallId::new(scan_id, idx),
                    scan_id,
                    queue_key: entry.queue_key(),
                    entry: entry.clone(),
                    operation: DEEP_DIVE_OPERATION.to_string(),
                    lookback_days,
                    status: CallStatus::Queued,
                    queued_at: now,
                    started_at: None,
                    completed_at: None,
                    error: None,
                    request_count: 1,
                    applied_window: None,
                    planned_windows: Vec::new(),
                })
                .collect();
            state.queue = (0..entries.len())
                .map(|idx| CallId::new(scan_id, idx))
                .collect();
        }
        tracing::debug!(%scan_id, staged = entries.len(), lookback_days, "staged pending calls");
        self.notify();
        scan_id
    }

    /// Id of the currently staged scan
    #[must_use]
    pub fn scan_id(&self) -> Option<ScanId> {
        self.state.lock().scan_id
    }

    /// Peek at the oldest queued record without claiming it
    #[must_use]
    pub fn next_queued(&self) -> Option<PendingCallRecord> {
        let state = self.state.lock();
        state
            .queue
            .iter()
            .filter_map(|id| state.record(*id))
            .find(|r| r.status == CallStatus::Queued)
            .cloned()
    }

    /// Pop the oldest queued record off the dispatch queue
    ///
    /// The record stays `Queued` until `mark_started`; it is only removed from
    /// the queue so that concurrent workers never receive the same record.
    #[must_use]
    pub fn take_next_queued(&self) -> Option<PendingCallRecord> {
        let mut state = self.state.lock();
        while let Some(id) = state.queue.pop_front() {
            match state.record(id) {
                Some(record) if record.status == CallStatus::Queued => {
                    return Some(record.clone());
                }
                _ => continue,
            }
        }
        None
    }

    /// Whether any record is still queued
    #[must_use]
    pub fn has_queued(&self) -> bool {
        self.state
            .lock()
            .records
            .iter()
            .any(|r| r.status == CallStatus::Queued)
    }

    /// Transition `Queued -> InFlight`
    ///
    /// Returns `None` (and changes nothing) for unknown ids, ids from an
    /// earlier scan, or records that are not queued.
    pub fn mark_started(&self, id: CallId) -> Option<PendingCallRecord> {
        let updated = {
            let mut state = self.state.lock();
            state.queue.retain(|queued| *queued != id);
            let record = state.record_mut(id)?;
            if record.status != CallStatus::Queued {
                return None;
            }
            record.status = CallStatus::InFlight;
            record.started_at = Some(Utc::now());
            record.clone()
        };
        self.notify();
        Some(updated)
    }

    /// Move a record to a terminal state and append the outcome to the log
    ///
    /// Re-resolving a terminal record updates status, error and completion
    /// time but never `queued_at`. Late resolutions carrying an id from an
    /// earlier scan are dropped and return `None`.
    pub fn resolve(&self, id: CallId, resolution: Resolution) -> Option<PendingCallRecord> {
        let updated = {
            let mut state = self.state.lock();
            state.queue.retain(|queued| *queued != id);
            let now = Utc::now();
            let record = state.record_mut(id)?;
            record.status = resolution.status.into();
            record.completed_at = Some(now);
            record.error = resolution.error.clone();
            record.applied_window = resolution.applied_window;
            let updated = record.clone();
            state.recorded.push(RecordedCallRecord {
                scan_id: updated.scan_id,
                entity_id: updated.entry.entity_id.clone(),
                sub_group_id: updated.entry.sub_group_id.clone(),
                lookback_days: updated.lookback_days,
                applied_window: updated.applied_window,
                request_count: updated.request_count,
                dataset_count: resolution.dataset_count,
                status: updated.status,
                error: resolution.error,
                recorded_at: now,
            });
            updated
        };
        self.notify();
        Some(updated)
    }

    /// Merge a planned-count observation for one window size
    ///
    /// `planned` only ever rises, and so does the record's request count,
    /// which tracks the total planned across all windows.
    pub fn update_window_plan(&self, id: CallId, planned: u32, window_size: u32, reason: PlanReason) {
        {
            let mut state = self.state.lock();
            let Some(record) = state.record_mut(id) else {
                return;
            };
            match record
                .planned_windows
                .iter_mut()
                .find(|p| p.window_size == window_size)
            {
                Some(plan) => {
                    plan.planned = plan.planned.max(planned);
                    plan.reason = reason;
                }
                None => record.planned_windows.push(WindowPlan {
                    window_size,
                    planned,
                    settled: 0,
                    reason,
                }),
            }
            let known: u32 = record.planned_windows.iter().map(|p| p.planned).sum();
            record.request_count = record.request_count.max(known);
        }
        self.notify();
    }

    /// Raise the settled count for one window size
    pub fn settle_window_plan(&self, id: CallId, settled: u32, window_size: u32) {
        {
            let mut state = self.state.lock();
            let Some(record) = state.record_mut(id) else {
                return;
            };
            let Some(plan) = record
                .planned_windows
                .iter_mut()
                .find(|p| p.window_size == window_size)
            else {
                return;
            };
            plan.settled = plan.settled.max(settled);
        }
        self.notify();
    }

    /// Request-count progress over the staged table
    #[must_use]
    pub fn summarize_progress(&self) -> ProgressSummary {
        let state = self.state.lock();
        state
            .records
            .iter()
            .fold(ProgressSummary::default(), |mut acc, record| {
                let count = u64::from(record.request_count);
                acc.total += count;
                if record.status.is_resolved() {
                    acc.completed += count;
                } else if record.status == CallStatus::Failed {
                    acc.failed += count;
                }
                acc
            })
    }

    /// Records that are queued or in flight
    #[must_use]
    pub fn outstanding(&self) -> Vec<PendingCallRecord> {
        self.state
            .lock()
            .records
            .iter()
            .filter(|r| !r.status.is_terminal())
            .cloned()
            .collect()
    }

    /// Snapshot of one record
    #[must_use]
    pub fn record(&self, id: CallId) -> Option<PendingCallRecord> {
        self.state.lock().record(id).cloned()
    }

    /// Snapshot of the whole pending table
    #[must_use]
    pub fn records(&self) -> Vec<PendingCallRecord> {
        self.state.lock().records.clone()
    }

    /// Full recorded-outcome log across scans
    #[must_use]
    pub fn recorded(&self) -> Vec<RecordedCallRecord> {
        self.state.lock().recorded.clone()
    }

    /// Recorded outcomes of the current scan
    #[must_use]
    pub fn recorded_for_current_scan(&self) -> Vec<RecordedCallRecord> {
        let state = self.state.lock();
        let Some(scan_id) = state.scan_id else {
            return Vec::new();
        };
        state
            .recorded
            .iter()
            .filter(|r| r.scan_id == scan_id)
            .cloned()
            .collect()
    }

    /// Failed outcomes of the current scan
    #[must_use]
    pub fn failed_records(&self) -> Vec<RecordedCallRecord> {
        self.recorded_for_current_scan()
            .into_iter()
            .filter(|r| r.status == CallStatus::Failed)
            .collect()
    }

    /// Completed outcomes of the current scan served by a smaller window
    /// than requested
    #[must_use]
    pub fn narrowed_records(&self) -> Vec<RecordedCallRecord> {
        self.recorded_for_current_scan()
            .into_iter()
            .filter(RecordedCallRecord::is_narrowed)
            .collect()
    }

    /// Whether exports should be held back for the current scan
    #[must_use]
    pub fn export_blocked(&self) -> bool {
        !self.failed_records().is_empty()
    }

    /// Number of staged records
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    /// Whether nothing is staged
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Staged records that share a queue key with an earlier record
    #[must_use]
    pub fn duplicate_keys(&self) -> Vec<QueueKey> {
        let state = self.state.lock();
        let mut seen = std::collections::HashSet::new();
        state
            .records
            .iter()
            .filter(|r| !seen.insert(r.queue_key.clone()))
            .map(|r| r.queue_key.clone())
            .collect()
    }
}

impl Default for CallRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TerminalStatus;
    use pretty_assertions::assert_eq;

    fn entries(n: usize) -> Vec<ScanEntry> {
        (0..n)
            .map(|i| ScanEntry::new(format!("app-{i}"), "eu", "key"))
            .collect()
    }

    #[test]
    fn stage_queues_every_entry() {
        let registry = CallRegistry::new();
        registry.stage(&entries(3), 30);

        assert_eq!(registry.len(), 3);
        assert!(registry.has_queued());
        assert_eq!(registry.outstanding().len(), 3);
        assert!(registry
            .records()
            .iter()
            .all(|r| r.status == CallStatus::Queued && r.lookback_days == 30));
    }

    #[test]
    fn stage_replaces_previous_table() {
        let registry = CallRegistry::new();
        let first = registry.stage(&entries(3), 30);
        let second = registry.stage(&entries(1), 7);

        assert_ne!(first, second);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.scan_id(), Some(second));
    }

    #[test]
    fn take_next_is_fifo_and_exclusive() {
        let registry = CallRegistry::new();
        let scan = registry.stage(&entries(2), 30);

        let a = registry.take_next_queued().unwrap();
        let b = registry.take_next_queued().unwrap();
        assert_eq!(a.call_id, CallId::new(scan, 0));
        assert_eq!(b.call_id, CallId::new(scan, 1));
        assert!(registry.take_next_queued().is_none());
        // taken records still count as queued until started
        assert!(registry.has_queued());
    }

    #[test]
    fn mark_started_only_from_queued() {
        let registry = CallRegistry::new();
        let scan = registry.stage(&entries(1), 30);

        let started = registry.mark_started(CallId::new(scan, 0)).unwrap();
        assert_eq!(started.status, CallStatus::InFlight);
        assert!(started.started_at.is_some());
        assert!(registry.mark_started(CallId::new(scan, 0)).is_none());
        assert!(registry.mark_started(CallId::new(scan, 9)).is_none());
        assert!(!registry.has_queued());
    }

    #[test]
    fn resolve_is_idempotent_on_queued_at() {
        let registry = CallRegistry::new();
        let scan = registry.stage(&entries(1), 30);
        registry.mark_started(CallId::new(scan, 0));

        let first = registry.resolve(CallId::new(scan, 0), Resolution::failed("401")).unwrap();
        let second = registry.resolve(CallId::new(scan, 0), Resolution::completed(2)).unwrap();

        assert_eq!(first.queued_at, second.queued_at);
        assert_eq!(second.status, CallStatus::Completed);
        assert_eq!(second.error, None);
        assert_eq!(registry.recorded().len(), 2);
        assert!(registry.resolve(CallId::new(scan, 5), Resolution::completed(0)).is_none());
    }

    #[test]
    fn window_plan_only_raises_counts() {
        let registry = CallRegistry::new();
        let scan = registry.stage(&entries(1), 180);
        let id = CallId::new(scan, 0);

        registry.update_window_plan(id, 1, 180, PlanReason::FullWindow);
        registry.update_window_plan(id, 3, 60, PlanReason::ForcedChunk);
        registry.update_window_plan(id, 2, 60, PlanReason::ForcedChunk);
        registry.settle_window_plan(id, 3, 60);
        registry.settle_window_plan(id, 1, 60);

        let record = registry.record(id).unwrap();
        let plan = record
            .planned_windows
            .iter()
            .find(|p| p.window_size == 60)
            .unwrap();
        assert_eq!(plan.planned, 3);
        assert_eq!(plan.settled, 3);
        assert_eq!(record.request_count, 4);
    }

    #[test]
    fn request_count_never_decreases() {
        let registry = CallRegistry::new();
        let scan = registry.stage(&entries(1), 30);
        let id = CallId::new(scan, 0);

        registry.update_window_plan(id, 5, 30, PlanReason::ForcedChunk);
        let before = registry.record(id).unwrap().request_count;
        registry.update_window_plan(id, 1, 30, PlanReason::ForcedChunk);
        assert!(registry.record(id).unwrap().request_count >= before);
    }

    #[test]
    fn progress_counts_only_resolved_sentinel() {
        let registry = CallRegistry::new();
        let scan = registry.stage(&entries(3), 30);
        registry.resolve(CallId::new(scan, 0), Resolution::completed(1));
        registry.resolve(CallId::new(scan, 1), Resolution::failed("boom"));

        let progress = registry.summarize_progress();
        assert_eq!(progress.total, 3);
        assert_eq!(progress.completed, 1);
        assert_eq!(progress.failed, 1);
        assert_eq!(progress.settled(), 2);
    }

    #[test]
    fn failures_are_scoped_to_current_scan() {
        let registry = CallRegistry::new();
        let first = registry.stage(&entries(1), 30);
        registry.resolve(CallId::new(first, 0), Resolution::failed("boom"));
        assert!(registry.export_blocked());

        let second = registry.stage(&entries(1), 30);
        registry.resolve(CallId::new(second, 0), Resolution::completed(1));
        assert!(!registry.export_blocked());
        assert_eq!(registry.recorded().len(), 2);
    }

    #[test]
    fn mutations_bump_revision() {
        let registry = CallRegistry::new();
        let rx = registry.subscribe();
        let start = *rx.borrow();

        let scan = registry.stage(&entries(1), 30);
        registry.mark_started(CallId::new(scan, 0));
        registry.resolve(
            CallId::new(scan, 0),
            Resolution {
                status: TerminalStatus::Completed,
                error: None,
                dataset_count: 1,
                applied_window: Some(30),
            },
        );

        assert_eq!(registry.revision().0, start.0 + 3);
    }

    #[test]
    fn duplicate_keys_are_reported() {
        let registry = CallRegistry::new();
        let mut staged = entries(2);
        staged.push(ScanEntry::new("app-0", "eu", "other-key"));
        registry.stage(&staged, 30);

        assert_eq!(registry.duplicate_keys(), vec![QueueKey::new("app-0", "")]);
    }

    #[test]
    fn next_queued_peeks_without_claiming() {
        let registry = CallRegistry::new();
        registry.stage(&entries(2), 30);

        let peeked = registry.next_queued().unwrap();
        assert_eq!(registry.next_queued().unwrap().call_id, peeked.call_id);

        let taken = registry.take_next_queued().unwrap();
        assert_eq!(taken.call_id, peeked.call_id);
        assert_eq!(registry.next_queued().unwrap().call_id.index, 1);
    }

    #[test]
    fn late_updates_from_previous_scan_are_ignored() {
        let registry = CallRegistry::new();
        registry.stage(&[ScanEntry::new("old", "eu", "key")], 30);
        let old = registry.take_next_queued().unwrap();
        registry.mark_started(old.call_id).unwrap();

        let scan = registry.stage(&[ScanEntry::new("new", "eu", "key")], 30);
        let revision = registry.revision();

        assert!(registry
            .resolve(old.call_id, Resolution::failed("old scan 401"))
            .is_none());
        assert!(registry.mark_started(old.call_id).is_none());
        registry.update_window_plan(old.call_id, 4, 10, PlanReason::ForcedChunk);
        registry.settle_window_plan(old.call_id, 4, 10);
        assert!(registry.record(old.call_id).is_none());

        let current = registry.record(CallId::new(scan, 0)).unwrap();
        assert_eq!(current.entity_id(), "new");
        assert_eq!(current.status, CallStatus::Queued);
        assert_eq!(current.request_count, 1);
        assert!(current.planned_windows.is_empty());
        assert!(!registry.export_blocked());
        assert!(registry.recorded_for_current_scan().is_empty());
        assert_eq!(registry.revision(), revision);
    }

    #[test]
    fn applied_window_reaches_the_recorded_log() {
        let registry = CallRegistry::new();
        let scan = registry.stage(&entries(2), 180);
        let narrowed = CallId::new(scan, 0);
        registry.update_window_plan(narrowed, 1, 180, PlanReason::FullWindow);
        registry.update_window_plan(narrowed, 1, 60, PlanReason::Fallback);
        registry.resolve(narrowed, Resolution::completed(1).with_applied_window(60));
        registry.resolve(CallId::new(scan, 1), Resolution::completed(1).with_applied_window(180));

        let recorded = registry.recorded_for_current_scan();
        assert_eq!(recorded[0].applied_window, Some(60));
        assert_eq!(recorded[0].lookback_days, 180);
        assert_eq!(recorded[0].request_count, 2);
        assert!(recorded[0].is_narrowed());
        assert!(!recorded[1].is_narrowed());
        assert!(registry.record(narrowed).unwrap().is_narrowed());
        assert_eq!(registry.narrowed_records().len(), 1);
    }
}
