//! Window fallback executor
//!
//! Fetches one entity's dataset, degrading window breadth when the backing
//! API rejects a request as too large or times out:
//! - Candidate windows: the requested window, then every smaller ladder step
//! - Each candidate is one request, or a staggered fan-out of chunk requests
//! - Chunk responses are assembled in chunk order
//! - Retryable failures move to the next candidate, fatal ones stop
//!
//! The first candidate that fully succeeds wins; smaller windows are never
//! tried after a success.

use crate::config::ScanConfig;
use crate::error::{AggregationError, TransportError};
use crate::payload::PayloadBuilder;
use crate::transport::{send_with_timeout, AggregationQuery, AggregationResponse, AggregationTransport, TransportTarget};
use aggscan_registry::{PlanReason, QueueKey, ScanEntry};
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Build the candidate window sequence
///
/// `total_window_days` first, followed by every ladder step in
/// `[1, total_window_days)`, strictly descending.
#[must_use]
pub fn fallback_windows(total_window_days: u32, ladder: &[u32]) -> Vec<u32> {
    if total_window_days == 0 {
        return Vec::new();
    }
    let mut smaller: Vec<u32> = ladder
        .iter()
        .copied()
        .filter(|w| (1..total_window_days).contains(w))
        .collect();
    smaller.sort_unstable_by(|a, b| b.cmp(a));
    smaller.dedup();

    let mut windows = Vec::with_capacity(smaller.len() + 1);
    windows.push(total_window_days);
    windows.extend(smaller);
    windows
}

/// Receives planning events while a window is attempted
///
/// All methods default to no-ops.
pub trait PlanObserver: Send + Sync {
    /// A window is about to be split into several chunk requests
    fn on_window_split(&self, _window_days: u32, _chunk_count: u32) {}

    /// `planned` requests are about to be sent for `window_days`
    fn on_planned(&self, _planned: u32, _window_days: u32, _reason: PlanReason) {}

    /// `settled` requests of `window_days` have returned
    fn on_settled(&self, _settled: u32, _window_days: u32) {}
}

/// Observer that ignores everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPlanObserver;

impl PlanObserver for NoopPlanObserver {}

/// Successful run
#[derive(Debug, Clone, PartialEq)]
pub struct WindowOutcome {
    /// Responses in chunk order
    pub responses: Vec<AggregationResponse>,
    /// Window that succeeded
    pub applied_window: u32,
    /// Requests issued across all attempted windows
    pub request_count: u32,
    /// Windows attempted, largest first
    pub windows_tried: Vec<u32>,
}

impl WindowOutcome {
    /// Whether a smaller window than requested was used
    #[inline]
    #[must_use]
    pub fn narrowed(&self, requested: u32) -> bool {
        self.applied_window < requested
    }
}

/// Fan-out bookkeeping for one in-progress window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchAttempt {
    /// Entity signature
    pub queue_key: QueueKey,
    /// Window being attempted
    pub window_size: u32,
    /// Requests sent
    pub planned: u32,
    /// Requests returned
    pub settled: u32,
    /// Whether the window was split into chunks
    pub pending_split: bool,
}

impl DispatchAttempt {
    fn new(queue_key: QueueKey, window_size: u32, planned: u32) -> Self {
        Self {
            queue_key,
            window_size,
            planned,
            settled: 0,
            pending_split: planned > 1,
        }
    }

    /// Whether every request has returned
    #[inline]
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.settled >= self.planned
    }
}

enum AttemptResult {
    Success(Vec<AggregationResponse>),
    Retry(TransportError),
    Fatal(TransportError),
}

/// Runs the window fallback sequence for one entity
pub struct WindowFallbackExecutor {
    transport: Arc<dyn AggregationTransport>,
    builder: Arc<dyn PayloadBuilder>,
    ladder: Vec<u32>,
    chunk_days: Option<u32>,
    chunk_spacing: Duration,
    request_timeout: Duration,
}

impl std::fmt::Debug for WindowFallbackExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowFallbackExecutor")
            .field("ladder", &self.ladder)
            .field("chunk_days", &self.chunk_days)
            .field("chunk_spacing", &self.chunk_spacing)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl WindowFallbackExecutor {
    /// Create an executor from scan configuration
    #[must_use]
    pub fn new(
        transport: Arc<dyn AggregationTransport>,
        builder: Arc<dyn PayloadBuilder>,
        config: &ScanConfig,
    ) -> Self {
        Self {
            transport,
            builder,
            ladder: config.fallback_windows.clone(),
            chunk_days: config.chunk_days,
            chunk_spacing: config.chunk_spacing(),
            request_timeout: config.request_timeout(),
        }
    }

    /// Fetch `entry` over `total_window_days`, narrowing as needed
    ///
    /// # Errors
    /// - `AggregationError::Fatal` on the first non-retryable failure
    /// - `AggregationError::Exhausted` when every candidate failed retryably
    /// - `AggregationError::InvalidWindow` for a zero-day window
    /// - `AggregationError::EmptyPlan` when the builder returns no payloads
    pub async fn run(
        &self,
        entry: &ScanEntry,
        total_window_days: u32,
        observer: &dyn PlanObserver,
    ) -> Result<WindowOutcome, AggregationError> {
        let windows = fallback_windows(total_window_days, &self.ladder);
        if windows.is_empty() {
            return Err(AggregationError::InvalidWindow(total_window_days));
        }

        let mut request_count = 0u32;
        let mut windows_tried = Vec::with_capacity(windows.len());
        let mut last_retryable = None;

        for window_days in windows {
            windows_tried.push(window_days);
            let (payloads, reason) = self.plan(entry, total_window_days, window_days);
            if payloads.is_empty() {
                return Err(AggregationError::EmptyPlan {
                    window_days,
                    request_count,
                });
            }
            let planned = u32::try_from(payloads.len()).unwrap_or(u32::MAX);
            request_count = request_count.saturating_add(planned);

            if planned > 1 {
                observer.on_window_split(window_days, planned);
            }
            observer.on_planned(planned, window_days, reason);
            tracing::debug!(
                entity_id = %entry.entity_id,
                window_days,
                chunk_count = planned,
                %reason,
                "dispatching window"
            );

            match self.dispatch(entry, window_days, &payloads, observer).await {
                AttemptResult::Success(responses) => {
                    if window_days < total_window_days {
                        tracing::info!(
                            entity_id = %entry.entity_id,
                            requested = total_window_days,
                            applied = window_days,
                            request_count,
                            "narrowed window succeeded"
                        );
                    }
                    return Ok(WindowOutcome {
                        responses,
                        applied_window: window_days,
                        request_count,
                        windows_tried,
                    });
                }
                AttemptResult::Retry(err) => {
                    tracing::warn!(
                        entity_id = %entry.entity_id,
                        window_days,
                        error = %err,
                        "retryable failure, trying smaller window"
                    );
                    last_retryable = Some(err);
                }
                AttemptResult::Fatal(err) => {
                    return Err(AggregationError::Fatal {
                        window_days,
                        request_count,
                        source: err,
                    });
                }
            }
        }

        match last_retryable {
            Some(last) => Err(AggregationError::Exhausted {
                windows_tried,
                request_count,
                last,
            }),
            None => Err(AggregationError::InvalidWindow(total_window_days)),
        }
    }

    fn plan(
        &self,
        entry: &ScanEntry,
        total_window_days: u32,
        window_days: u32,
    ) -> (Vec<AggregationQuery>, PlanReason) {
        match self.chunk_days.filter(|chunk| *chunk < window_days) {
            Some(chunk) => (
                self.builder.chunked_payloads(entry, window_days, chunk),
                PlanReason::ForcedChunk,
            ),
            None if window_days == total_window_days => (
                vec![self.builder.base_payload(entry, window_days)],
                PlanReason::FullWindow,
            ),
            None => (
                self.builder.chunked_payloads(entry, window_days, window_days),
                PlanReason::Fallback,
            ),
        }
    }

    /// Send every payload of one window, staggered from a common start
    async fn dispatch(
        &self,
        entry: &ScanEntry,
        window_days: u32,
        payloads: &[AggregationQuery],
        observer: &dyn PlanObserver,
    ) -> AttemptResult {
        let target = TransportTarget::from(entry);
        let start = Instant::now();
        let transport = self.transport.as_ref();
        let timeout = self.request_timeout;

        let mut pending: FuturesUnordered<_> = payloads
            .iter()
            .enumerate()
            .map(|(idx, payload)| {
                let delay = self
                    .chunk_spacing
                    .saturating_mul(u32::try_from(idx).unwrap_or(u32::MAX));
                let target = &target;
                async move {
                    tokio::time::sleep_until(start + delay).await;
                    (idx, send_with_timeout(transport, target, payload, timeout).await)
                }
            })
            .collect();

        let planned = u32::try_from(payloads.len()).unwrap_or(u32::MAX);
        let mut attempt = DispatchAttempt::new(entry.queue_key(), window_days, planned);
        let mut slots: Vec<Option<AggregationResponse>> = vec![None; payloads.len()];
        let mut retryable: Option<(usize, TransportError)> = None;

        while let Some((idx, result)) = pending.next().await {
            attempt.settled += 1;
            observer.on_settled(attempt.settled, window_days);
            match result {
                Ok(response) => slots[idx] = Some(response),
                Err(err) if err.is_retryable() => {
                    // keep the lowest-index failure so reports are stable
                    if retryable.as_ref().map_or(true, |(first, _)| idx < *first) {
                        retryable = Some((idx, err));
                    }
                }
                Err(err) => {
                    tracing::error!(
                        entity_id = %entry.entity_id,
                        window_days,
                        chunk = idx,
                        error = %err,
                        "fatal chunk failure, cancelling remaining chunks"
                    );
                    // remaining chunk futures are dropped on return
                    observer.on_settled(attempt.planned, window_days);
                    return AttemptResult::Fatal(err);
                }
            }
        }

        debug_assert!(attempt.is_settled());
        if let Some((_, err)) = retryable {
            return AttemptResult::Retry(err);
        }
        AttemptResult::Success(slots.into_iter().flatten().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn ladder_for_half_year() {
        assert_eq!(
            fallback_windows(180, &[180, 60, 30, 10, 7, 1]),
            vec![180, 60, 30, 10, 7, 1]
        );
    }

    #[test]
    fn ladder_keeps_odd_total_first() {
        assert_eq!(fallback_windows(45, &[180, 60, 30, 10, 7, 1]), vec![45, 30, 10, 7, 1]);
        assert_eq!(fallback_windows(1, &[180, 60, 30, 10, 7, 1]), vec![1]);
        assert!(fallback_windows(0, &[7, 1]).is_empty());
    }

    #[test]
    fn ladder_tolerates_unsorted_input() {
        assert_eq!(fallback_windows(90, &[1, 30, 7, 30, 365]), vec![90, 30, 7, 1]);
    }

    #[test]
    fn attempt_settles_when_all_returned() {
        let mut attempt = DispatchAttempt::new(QueueKey::new("a", ""), 30, 3);
        assert!(attempt.pending_split);
        attempt.settled = 3;
        assert!(attempt.is_settled());
    }

    proptest! {
        #[test]
        fn ladder_is_strictly_descending_and_bounded(
            total in 1u32..2000,
            ladder in proptest::collection::vec(0u32..3000, 0..12),
        ) {
            let windows = fallback_windows(total, &ladder);
            prop_assert_eq!(windows[0], total);
            prop_assert!(windows.windows(2).all(|w| w[0] > w[1]));
            prop_assert!(windows.iter().all(|w| (1..=total).contains(w)));
        }
    }
}
