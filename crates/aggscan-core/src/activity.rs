//! Dispatch activity tracking
//!
//! Shared between the dispatcher (writer) and the watchdog / orchestrator
//! (readers). Timestamps use `tokio::time::Instant` so paused-clock tests see
//! deterministic values.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::time::Instant;

#[derive(Debug, Default, Clone, Copy)]
struct Timestamps {
    dispatch: Option<Instant>,
    completion: Option<Instant>,
    processing: Option<Instant>,
}

/// Last-seen activity and the live request count
#[derive(Debug, Default)]
pub struct ActivityTracker {
    times: Mutex<Timestamps>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ActivityTracker {
    /// Create an idle tracker
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A request was dispatched
    pub fn request_started(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.times.lock().dispatch = Some(Instant::now());
    }

    /// A dispatched request finished (success or failure)
    pub fn request_finished(&self) {
        // never underflow even if called unpaired
        let _ = self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        self.times.lock().completion = Some(Instant::now());
    }

    /// Something moved forward inside a request (chunk settled, response handled)
    pub fn touch_processing(&self) {
        self.times.lock().processing = Some(Instant::now());
    }

    /// Requests currently in flight
    #[must_use]
    pub fn active_requests(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Highest simultaneous request count seen
    #[must_use]
    pub fn peak_active(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Most recent of dispatch, completion, processing and `floor`
    #[must_use]
    pub fn last_activity(&self, floor: Instant) -> Instant {
        let times = *self.times.lock();
        [times.dispatch, times.completion, times.processing]
            .into_iter()
            .flatten()
            .fold(floor, Instant::max)
    }
}
