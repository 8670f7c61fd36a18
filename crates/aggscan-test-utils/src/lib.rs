//! Testing utilities for the aggscan workspace
//!
//! Shared mock transport, payload builder, recording callbacks and fixtures.

#![allow(missing_docs)]

use aggscan_core::{
    AggregationQuery, AggregationResponse, AggregationTransport, PayloadBuilder,
    ProgressCallbacks, ResponseSink, ScanConfig, StallObserver, StallReport, TransportError,
    TransportTarget,
};
use aggscan_registry::ScanEntry;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn entry(id: &str) -> ScanEntry {
    ScanEntry::new(id, "example.test", format!("key-{id}"))
}

pub fn entries(n: usize) -> Vec<ScanEntry> {
    (0..n).map(|i| entry(&format!("app-{i}"))).collect()
}

/// Config with short timings, suitable for paused-clock tests
pub fn fast_config() -> ScanConfig {
    ScanConfig::new()
        .with_concurrency(2)
        .with_dispatch_spacing(Duration::from_millis(50))
        .with_chunk_spacing(Duration::from_millis(10))
        .with_watchdog(Duration::from_secs(1), Duration::from_secs(30))
}

pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ---------------------------------------------------------------------------
// Payload builder
// ---------------------------------------------------------------------------

/// Payloads that expose window and chunk geometry as plain JSON fields
///
/// `{ "entity_id", "window_days", "span_days", "chunk" }`
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowPayloadBuilder;

impl PayloadBuilder for WindowPayloadBuilder {
    fn base_payload(&self, entry: &ScanEntry, window_days: u32) -> AggregationQuery {
        json!({
            "entity_id": entry.entity_id,
            "window_days": window_days,
            "span_days": window_days,
            "chunk": 0,
        })
    }

    fn chunked_payloads(
        &self,
        entry: &ScanEntry,
        window_days: u32,
        chunk_days: u32,
    ) -> Vec<AggregationQuery> {
        let mut payloads = Vec::new();
        let mut remaining = window_days;
        let mut chunk = 0u32;
        while remaining > 0 && chunk_days > 0 {
            let span = remaining.min(chunk_days);
            payloads.push(json!({
                "entity_id": entry.entity_id,
                "window_days": window_days,
                "span_days": span,
                "chunk": chunk,
            }));
            remaining -= span;
            chunk += 1;
        }
        payloads
    }
}

pub fn payload_window(payload: &AggregationQuery) -> u32 {
    payload["window_days"]
        .as_u64()
        .and_then(|w| u32::try_from(w).ok())
        .unwrap_or_default()
}

pub fn payload_chunk(payload: &AggregationQuery) -> u32 {
    payload["chunk"]
        .as_u64()
        .and_then(|c| u32::try_from(c).ok())
        .unwrap_or_default()
}

pub fn payload_entity(payload: &AggregationQuery) -> String {
    payload["entity_id"].as_str().unwrap_or_default().to_string()
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// One request seen by the scripted transport
#[derive(Debug, Clone)]
pub struct SentRequest {
    pub entity_id: String,
    pub window_days: u32,
    pub chunk: u32,
    pub at: Instant,
}

type Responder = Box<
    dyn Fn(&TransportTarget, &AggregationQuery) -> Result<AggregationResponse, TransportError>
        + Send
        + Sync,
>;
type DelayFn = Box<dyn Fn(&AggregationQuery) -> Duration + Send + Sync>;

/// Transport answering from a closure, with optional simulated latency
pub struct ScriptedTransport {
    responder: Responder,
    delay: DelayFn,
    sent: Mutex<Vec<SentRequest>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl std::fmt::Debug for ScriptedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedTransport")
            .field("sent", &self.sent.lock().len())
            .finish_non_exhaustive()
    }
}

impl ScriptedTransport {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&TransportTarget, &AggregationQuery) -> Result<AggregationResponse, TransportError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            responder: Box::new(responder),
            delay: Box::new(|_| Duration::ZERO),
            sent: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Echo the payload geometry back as the response
    pub fn ok() -> Self {
        Self::new(|_, payload| Ok(echo(payload)))
    }

    /// Fail windows strictly larger than `max_days` with `status`
    pub fn reject_windows_above(max_days: u32, status: u16) -> Self {
        Self::new(move |_, payload| {
            if payload_window(payload) > max_days {
                Err(TransportError::http(status, "too many data files"))
            } else {
                Ok(echo(payload))
            }
        })
    }

    /// Fail every request for `entity_id` with `status`, succeed otherwise
    pub fn fail_entity(entity_id: &str, status: u16) -> Self {
        let failing = entity_id.to_string();
        Self::new(move |_, payload| {
            if payload_entity(payload) == failing {
                Err(TransportError::http(status, "unauthorized"))
            } else {
                Ok(echo(payload))
            }
        })
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        self.with_delay_fn(move |_| delay)
    }

    pub fn with_delay_fn<F>(mut self, delay: F) -> Self
    where
        F: Fn(&AggregationQuery) -> Duration + Send + Sync + 'static,
    {
        self.delay = Box::new(delay);
        self
    }

    pub fn sent(&self) -> Vec<SentRequest> {
        self.sent.lock().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn sent_for(&self, entity_id: &str) -> Vec<SentRequest> {
        self.sent
            .lock()
            .iter()
            .filter(|r| r.entity_id == entity_id)
            .cloned()
            .collect()
    }

    /// Distinct windows in the order first requested
    pub fn windows_for(&self, entity_id: &str) -> Vec<u32> {
        let mut windows = Vec::new();
        for request in self.sent_for(entity_id) {
            if windows.last() != Some(&request.window_days) {
                windows.push(request.window_days);
            }
        }
        windows
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl AggregationTransport for ScriptedTransport {
    async fn send(
        &self,
        target: &TransportTarget,
        payload: &AggregationQuery,
    ) -> Result<AggregationResponse, TransportError> {
        self.sent.lock().push(SentRequest {
            entity_id: payload_entity(payload),
            window_days: payload_window(payload),
            chunk: payload_chunk(payload),
            at: Instant::now(),
        });
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        // timed-out requests are dropped mid-sleep
        let _guard = InFlightGuard(&self.in_flight);

        let delay = (self.delay)(payload);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        (self.responder)(target, payload)
    }
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub fn echo(payload: &AggregationQuery) -> AggregationResponse {
    json!({
        "entity_id": payload["entity_id"],
        "window_days": payload["window_days"],
        "chunk": payload["chunk"],
        "rows": [],
    })
}

// ---------------------------------------------------------------------------
// Callbacks, sink, stall observer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackEvent {
    ApiProgress { completed: u64, total: u64 },
    ProcessingProgress { completed: u64, total: u64 },
    ApiStatus(String),
    ApiError(String),
    ProcessingError(String),
}

#[derive(Debug, Default)]
pub struct RecordingCallbacks {
    events: Mutex<Vec<CallbackEvent>>,
}

impl RecordingCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CallbackEvent> {
        self.events.lock().clone()
    }

    pub fn api_progress(&self) -> Vec<(u64, u64)> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                CallbackEvent::ApiProgress { completed, total } => Some((*completed, *total)),
                _ => None,
            })
            .collect()
    }

    pub fn api_errors(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                CallbackEvent::ApiError(m) => Some(m.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn statuses(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                CallbackEvent::ApiStatus(m) => Some(m.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn processing_errors(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                CallbackEvent::ProcessingError(m) => Some(m.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn last_processing_progress(&self) -> Option<(u64, u64)> {
        self.events.lock().iter().rev().find_map(|e| match e {
            CallbackEvent::ProcessingProgress { completed, total } => Some((*completed, *total)),
            _ => None,
        })
    }
}

impl ProgressCallbacks for RecordingCallbacks {
    fn on_api_progress(&self, completed: u64, total: u64) {
        self.events
            .lock()
            .push(CallbackEvent::ApiProgress { completed, total });
    }

    fn on_processing_progress(&self, completed: u64, total: u64) {
        self.events
            .lock()
            .push(CallbackEvent::ProcessingProgress { completed, total });
    }

    fn on_api_status(&self, message: &str) {
        self.events
            .lock()
            .push(CallbackEvent::ApiStatus(message.to_string()));
    }

    fn on_api_error(&self, message: &str) {
        self.events
            .lock()
            .push(CallbackEvent::ApiError(message.to_string()));
    }

    fn on_processing_error(&self, message: &str) {
        self.events
            .lock()
            .push(CallbackEvent::ProcessingError(message.to_string()));
    }
}

/// Sink recording `(entity_id, response)` pairs; can reject chosen entities
#[derive(Debug, Default)]
pub struct RecordingSink {
    received: Mutex<Vec<(String, AggregationResponse)>>,
    reject_entity: Option<String>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rejecting(entity_id: &str) -> Self {
        Self {
            received: Mutex::new(Vec::new()),
            reject_entity: Some(entity_id.to_string()),
        }
    }

    pub fn received(&self) -> Vec<(String, AggregationResponse)> {
        self.received.lock().clone()
    }

    pub fn received_for(&self, entity_id: &str) -> Vec<AggregationResponse> {
        self.received
            .lock()
            .iter()
            .filter(|(id, _)| id == entity_id)
            .map(|(_, r)| r.clone())
            .collect()
    }
}

impl ResponseSink for RecordingSink {
    fn on_response(&self, entry: &ScanEntry, response: &AggregationResponse) -> Result<(), String> {
        if self.reject_entity.as_deref() == Some(entry.entity_id.as_str()) {
            return Err("sink rejected response".to_string());
        }
        self.received
            .lock()
            .push((entry.entity_id.clone(), response.clone()));
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RecordingStallObserver {
    reports: Mutex<Vec<StallReport>>,
}

impl RecordingStallObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<StallReport> {
        self.reports.lock().clone()
    }
}

impl StallObserver for RecordingStallObserver {
    fn on_stall(&self, report: &StallReport) {
        self.reports.lock().push(report.clone());
    }
}
