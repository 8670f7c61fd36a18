//! Error types for the scan runner
//!
//! Three layers:
//! - `TransportError`: one failed aggregation request, classifiable
//! - `AggregationError`: one entity's window-fallback run gave up
//! - `ScanError`: contract violations at the orchestrator level

use std::time::Duration;

/// HTTP statuses that trigger window fallback
pub const RETRYABLE_STATUSES: [u16; 4] = [408, 413, 504, 524];

/// Body fragments (lowercase) that trigger window fallback
pub const RETRYABLE_BODY_MARKERS: [&str; 4] = [
    "too many data files",
    "aggregation request timed out",
    "timed out",
    "timeout",
];

/// How a failure affects the window-fallback sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Try the next smaller window
    Retryable,
    /// Stop and fail the entity
    Fatal,
}

/// Coarse cause of a transport failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorKind {
    /// Server answered with a non-success status
    Http,
    /// Request exceeded its timeout
    Timeout,
    /// Connection aborted
    Aborted,
    /// Response could not be decoded
    Decode,
    /// Connection could not be established
    Connection,
    /// Anything else (e.g. missing credential)
    Other,
}

/// A single failed aggregation request
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind:?} error{}: {body}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
pub struct TransportError {
    /// Cause
    pub kind: TransportErrorKind,
    /// HTTP status, when the server answered
    pub status: Option<u16>,
    /// Response body or error text
    pub body: String,
}

impl TransportError {
    /// Non-success HTTP response
    #[inline]
    #[must_use]
    pub fn http(status: u16, body: impl Into<String>) -> Self {
        Self {
            kind: TransportErrorKind::Http,
            status: Some(status),
            body: body.into(),
        }
    }

    /// Request timed out locally
    #[inline]
    #[must_use]
    pub fn timeout(after: Duration) -> Self {
        Self {
            kind: TransportErrorKind::Timeout,
            status: None,
            body: format!("request timed out after {}s", after.as_secs()),
        }
    }

    /// Connection aborted
    #[inline]
    #[must_use]
    pub fn aborted(body: impl Into<String>) -> Self {
        Self {
            kind: TransportErrorKind::Aborted,
            status: None,
            body: body.into(),
        }
    }

    /// Undecodable response
    #[inline]
    #[must_use]
    pub fn decode(body: impl Into<String>) -> Self {
        Self {
            kind: TransportErrorKind::Decode,
            status: None,
            body: body.into(),
        }
    }

    /// Other failure
    #[inline]
    #[must_use]
    pub fn other(kind: TransportErrorKind, body: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            body: body.into(),
        }
    }

    /// Classify for window fallback
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        if matches!(
            self.kind,
            TransportErrorKind::Timeout | TransportErrorKind::Aborted
        ) {
            return ErrorClass::Retryable;
        }
        if self.status.is_some_and(|s| RETRYABLE_STATUSES.contains(&s)) {
            return ErrorClass::Retryable;
        }
        // malformed responses are fatal even if the text mentions a timeout
        if self.kind == TransportErrorKind::Decode {
            return ErrorClass::Fatal;
        }
        let body = self.body.to_lowercase();
        if RETRYABLE_BODY_MARKERS.iter().any(|m| body.contains(m)) {
            ErrorClass::Retryable
        } else {
            ErrorClass::Fatal
        }
    }

    /// Shortcut for `class() == Retryable`
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }
}

/// Window-fallback failure for one entity
#[derive(Debug, Clone, thiserror::Error)]
pub enum AggregationError {
    /// Non-retryable failure; smaller windows were not attempted
    #[error("request failed at {window_days}-day window after {request_count} requests: {source}")]
    Fatal {
        /// Window being attempted
        window_days: u32,
        /// Requests issued so far
        request_count: u32,
        /// Underlying failure
        #[source]
        source: TransportError,
    },

    /// Every candidate window failed retryably
    #[error("all fallback windows {windows_tried:?} exhausted after {request_count} requests: {last}")]
    Exhausted {
        /// Windows attempted, largest first
        windows_tried: Vec<u32>,
        /// Requests issued in total
        request_count: u32,
        /// Last retryable failure
        #[source]
        last: TransportError,
    },

    /// Requested window is unusable
    #[error("invalid window: {0} days")]
    InvalidWindow(u32),

    /// Payload builder produced nothing to send
    #[error("payload builder produced no payloads for {window_days}-day window after {request_count} requests")]
    EmptyPlan {
        /// Window being attempted
        window_days: u32,
        /// Requests already spent on larger windows
        request_count: u32,
    },
}

impl AggregationError {
    /// Requests spent before giving up
    #[inline]
    #[must_use]
    pub fn request_count(&self) -> u32 {
        match self {
            Self::Fatal { request_count, .. }
            | Self::Exhausted { request_count, .. }
            | Self::EmptyPlan { request_count, .. } => *request_count,
            Self::InvalidWindow(_) => 0,
        }
    }

    /// Underlying transport failure, if any
    #[must_use]
    pub fn transport_error(&self) -> Option<&TransportError> {
        match self {
            Self::Fatal { source, .. } => Some(source),
            Self::Exhausted { last, .. } => Some(last),
            Self::InvalidWindow(_) | Self::EmptyPlan { .. } => None,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML could not be parsed
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config file could not be read
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// Values are out of range
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Orchestrator-level errors (contract violations only)
///
/// Per-entity failures are never surfaced through this type; they end up in
/// the scan summary.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Requested lookback is unusable
    #[error("invalid lookback window: {0} days")]
    InvalidWindow(u32),

    /// A dispatcher worker died
    #[error("dispatcher failed: {0}")]
    Dispatcher(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_statuses() {
        for status in [408, 413, 504, 524] {
            assert!(TransportError::http(status, "").is_retryable(), "{status}");
        }
        for status in [400, 401, 403, 500] {
            assert!(!TransportError::http(status, "nope").is_retryable(), "{status}");
        }
    }

    #[test]
    fn retryable_bodies() {
        assert!(TransportError::http(400, "Too many data files selected").is_retryable());
        assert!(TransportError::http(500, "Aggregation request timed out").is_retryable());
        assert!(TransportError::other(TransportErrorKind::Other, "upstream timeout").is_retryable());
    }

    #[test]
    fn timeouts_and_aborts_are_retryable() {
        assert!(TransportError::timeout(Duration::from_secs(60)).is_retryable());
        assert!(TransportError::aborted("connection reset").is_retryable());
    }

    #[test]
    fn decode_errors_are_fatal() {
        assert_eq!(
            TransportError::decode("expected value, request timed out?").class(),
            ErrorClass::Fatal
        );
    }

    #[test]
    fn transport_error_display() {
        let err = TransportError::http(413, "too large");
        assert_eq!(err.to_string(), "Http error (HTTP 413): too large");
    }

    #[test]
    fn aggregation_error_carries_request_count() {
        let err = AggregationError::Exhausted {
            windows_tried: vec![30, 10],
            request_count: 4,
            last: TransportError::http(413, "too large"),
        };
        assert_eq!(err.request_count(), 4);
        assert!(err.to_string().contains("4 requests"));
        assert_eq!(AggregationError::InvalidWindow(0).request_count(), 0);
    }
}
