//! Stall watchdog
//!
//! Advisory only: inspects the registry and dispatch activity on a fixed
//! tick and reports queued work that nothing is moving. It never cancels,
//! retries or mutates anything.

use crate::activity::ActivityTracker;
use aggscan_registry::{CallRegistry, CallStatus, PendingCallRecord, QueueKey};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// One outstanding record in a stall report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StalledEntry {
    /// Entity label
    pub label: String,
    /// Queue key
    pub queue_key: QueueKey,
    /// Status at report time
    pub status: CallStatus,
}

/// Snapshot emitted when outstanding work stops moving
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StallReport {
    /// Queued or in-flight records
    pub outstanding: usize,
    /// Queued records
    pub queued: usize,
    /// In-flight records
    pub in_flight: usize,
    /// Time since the last recorded activity
    pub idle_for: Duration,
    /// Age of the oldest queued record
    pub oldest_queued_age: Option<Duration>,
    /// Per-record status
    pub entries: Vec<StalledEntry>,
}

/// Receives stall reports
pub trait StallObserver: Send + Sync {
    /// Called once per stall episode
    fn on_stall(&self, report: &StallReport);
}

impl<F> StallObserver for F
where
    F: Fn(&StallReport) + Send + Sync,
{
    fn on_stall(&self, report: &StallReport) {
        self(report);
    }
}

/// Observer that logs each stalled record at `warn`
#[derive(Debug, Clone, Copy, Default)]
pub struct LogStallObserver;

impl StallObserver for LogStallObserver {
    fn on_stall(&self, report: &StallReport) {
        for entry in &report.entries {
            tracing::warn!(
                label = %entry.label,
                queue_key = entry.queue_key.short(),
                status = entry.status.as_str(),
                "stalled entry"
            );
        }
    }
}

/// Counters returned when the watchdog stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchdogStats {
    /// Ticks evaluated
    pub ticks: u64,
    /// Stall reports emitted
    pub stalls_reported: u64,
}

/// Running watchdog; stop it with [`WatchdogHandle::stop`]
#[derive(Debug)]
pub struct WatchdogHandle {
    stop: oneshot::Sender<()>,
    task: JoinHandle<WatchdogStats>,
}

impl WatchdogHandle {
    /// Stop ticking and return the counters
    pub async fn stop(self) -> WatchdogStats {
        let _ = self.stop.send(());
        self.task.await.unwrap_or_default()
    }
}

/// Periodic stall detector
pub struct StallWatchdog {
    registry: Arc<CallRegistry>,
    activity: Arc<ActivityTracker>,
    observer: Arc<dyn StallObserver>,
    interval: Duration,
    idle_threshold: Duration,
    started: Instant,
    last_reported: Option<usize>,
}

impl std::fmt::Debug for StallWatchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StallWatchdog")
            .field("interval", &self.interval)
            .field("idle_threshold", &self.idle_threshold)
            .field("last_reported", &self.last_reported)
            .finish_non_exhaustive()
    }
}

impl StallWatchdog {
    /// Create a watchdog; the idle clock starts now
    #[must_use]
    pub fn new(
        registry: Arc<CallRegistry>,
        activity: Arc<ActivityTracker>,
        observer: Arc<dyn StallObserver>,
        interval: Duration,
        idle_threshold: Duration,
    ) -> Self {
        Self {
            registry,
            activity,
            observer,
            interval: interval.max(Duration::from_millis(1)),
            idle_threshold,
            started: Instant::now(),
            last_reported: None,
        }
    }

    /// Spawn the tick loop
    #[must_use]
    pub fn start(mut self) -> WatchdogHandle {
        let (stop, mut stop_rx) = oneshot::channel();
        self.started = Instant::now();
        let task = tokio::spawn(async move {
            let mut stats = WatchdogStats::default();
            let mut ticker = tokio::time::interval_at(self.started + self.interval, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        stats.ticks += 1;
                        if let Some(report) = self.tick() {
                            stats.stalls_reported += 1;
                            self.observer.on_stall(&report);
                        }
                    }
                }
            }
            stats
        });
        WatchdogHandle { stop, task }
    }

    /// Evaluate one tick; returns a report when a new stall is detected
    pub fn tick(&mut self) -> Option<StallReport> {
        let outstanding = self.registry.outstanding();
        if outstanding.is_empty() {
            if self.last_reported.take().is_some() {
                tracing::debug!("watchdog: outstanding work drained");
            }
            return None;
        }

        let now = Instant::now();
        let idle_for = now.saturating_duration_since(self.activity.last_activity(self.started));
        if idle_for < self.idle_threshold {
            return None;
        }

        let in_flight = outstanding
            .iter()
            .filter(|r| r.status == CallStatus::InFlight)
            .count();
        if in_flight > 0 || self.activity.active_requests() > 0 {
            return None;
        }
        if self.last_reported == Some(outstanding.len()) {
            return None;
        }
        self.last_reported = Some(outstanding.len());

        let report = build_report(&outstanding, idle_for, in_flight);
        tracing::warn!(
            outstanding = report.outstanding,
            queued = report.queued,
            idle_secs = report.idle_for.as_secs(),
            oldest_queued_secs = report.oldest_queued_age.map(|d| d.as_secs()),
            "scan appears stalled"
        );
        Some(report)
    }
}

fn build_report(outstanding: &[PendingCallRecord], idle_for: Duration, in_flight: usize) -> StallReport {
    let now = Utc::now();
    let queued: Vec<&PendingCallRecord> = outstanding
        .iter()
        .filter(|r| r.status == CallStatus::Queued)
        .collect();
    let oldest_queued_age = queued
        .iter()
        .map(|r| r.queued_at)
        .min()
        .and_then(|at| (now - at).to_std().ok());

    StallReport {
        outstanding: outstanding.len(),
        queued: queued.len(),
        in_flight,
        idle_for,
        oldest_queued_age,
        entries: outstanding
            .iter()
            .map(|r| StalledEntry {
                label: r.entry.label(),
                queue_key: r.queue_key.clone(),
                status: r.status,
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aggscan_registry::{CallId, Resolution, ScanEntry};
    use parking_lot::Mutex;

    fn setup(n: usize) -> (Arc<CallRegistry>, Arc<ActivityTracker>) {
        let registry = Arc::new(CallRegistry::new());
        let entries: Vec<ScanEntry> = (0..n)
            .map(|i| ScanEntry::new(format!("app-{i}"), "eu", "key"))
            .collect();
        registry.stage(&entries, 30);
        (registry, Arc::new(ActivityTracker::new()))
    }

    fn first_call(registry: &CallRegistry) -> CallId {
        registry.next_queued().expect("staged record").call_id
    }

    fn watchdog(registry: &Arc<CallRegistry>, activity: &Arc<ActivityTracker>) -> StallWatchdog {
        StallWatchdog::new(
            Arc::clone(registry),
            Arc::clone(activity),
            Arc::new(LogStallObserver),
            Duration::from_secs(1),
            Duration::from_secs(5),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_below_threshold() {
        let (registry, activity) = setup(2);
        let mut dog = watchdog(&registry, &activity);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(dog.tick().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn reports_once_per_episode() {
        let (registry, activity) = setup(2);
        let mut dog = watchdog(&registry, &activity);

        tokio::time::sleep(Duration::from_secs(6)).await;
        let report = dog.tick().expect("stall expected");
        assert_eq!(report.outstanding, 2);
        assert_eq!(report.queued, 2);
        assert!(report.idle_for >= Duration::from_secs(5));
        assert!(dog.tick().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_work_is_not_a_stall() {
        let (registry, activity) = setup(1);
        registry.mark_started(first_call(&registry));
        activity.request_started();
        let mut dog = watchdog(&registry, &activity);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(dog.tick().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn drained_queue_resets_episode() {
        let (registry, activity) = setup(1);
        let mut dog = watchdog(&registry, &activity);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(dog.tick().is_some());

        registry.resolve(first_call(&registry), Resolution::completed(1));
        assert!(dog.tick().is_none());

        registry.stage(&[ScanEntry::new("late", "eu", "key")], 30);
        assert!(dog.tick().is_some(), "renewed stall is reported fresh");
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_watchdog_notifies_observer() {
        let (registry, activity) = setup(1);
        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reports);
        let observer = move |report: &StallReport| sink.lock().push(report.clone());

        let handle = StallWatchdog::new(
            Arc::clone(&registry),
            Arc::clone(&activity),
            Arc::new(observer),
            Duration::from_secs(1),
            Duration::from_secs(5),
        )
        .start();

        tokio::time::sleep(Duration::from_millis(10_500)).await;
        let stats = handle.stop().await;

        assert_eq!(reports.lock().len(), 1);
        assert_eq!(stats.stalls_reported, 1);
        assert!(stats.ticks >= 10);
    }

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn log_observer_warns_per_stalled_entry() {
        let (registry, activity) = setup(2);
        let mut dog = watchdog(&registry, &activity);
        tokio::time::sleep(Duration::from_secs(6)).await;
        let report = dog.tick().expect("stall expected");

        let buf = SharedBuf::default();
        let writer = buf.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        tracing::subscriber::with_default(subscriber, || LogStallObserver.on_stall(&report));

        let logged = String::from_utf8(buf.0.lock().clone()).unwrap();
        assert_eq!(logged.matches("stalled entry").count(), 2);
        assert!(logged.contains("WARN"));
        assert!(logged.contains("app-0"));
        assert!(logged.contains("app-1"));
    }
}
