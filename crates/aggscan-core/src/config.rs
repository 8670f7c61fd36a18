//! Scan configuration
//!
//! Loaded from TOML (every field optional) or built in code with the
//! `with_*` helpers.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default descending window ladder, in days
pub const DEFAULT_FALLBACK_WINDOWS: [u32; 6] = [180, 60, 30, 10, 7, 1];

/// Scan runner configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Maximum entries in flight at once
    pub concurrency_limit: usize,
    /// Minimum gap between dispatch starts
    pub dispatch_spacing_ms: u64,
    /// Stagger between chunk requests of one window
    pub chunk_spacing_ms: u64,
    /// Per-request timeout
    pub request_timeout_secs: u64,
    /// Candidate windows, tried largest first
    pub fallback_windows: Vec<u32>,
    /// Force chunks of at most this many days
    pub chunk_days: Option<u32>,
    /// Watchdog tick
    pub watchdog_interval_ms: u64,
    /// Idle time before the watchdog reports a stall
    pub stall_threshold_ms: u64,
}

impl ScanConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML document
    ///
    /// # Errors
    /// `ConfigError::Parse` on malformed TOML, `ConfigError::Invalid` when a
    /// value is out of range.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file
    ///
    /// # Errors
    /// See [`ScanConfig::from_toml_str`]; also `ConfigError::Io`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Check value ranges
    ///
    /// # Errors
    /// `ConfigError::Invalid` describing the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency_limit == 0 {
            return Err(ConfigError::Invalid("concurrency_limit must be at least 1".into()));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid("request_timeout_secs must be at least 1".into()));
        }
        if self.watchdog_interval_ms == 0 {
            return Err(ConfigError::Invalid("watchdog_interval_ms must be at least 1".into()));
        }
        if self.fallback_windows.contains(&0) {
            return Err(ConfigError::Invalid("fallback_windows entries must be at least 1 day".into()));
        }
        if self.chunk_days == Some(0) {
            return Err(ConfigError::Invalid("chunk_days must be at least 1".into()));
        }
        Ok(())
    }

    /// With concurrency limit
    #[inline]
    #[must_use]
    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit;
        self
    }

    /// With dispatch spacing
    #[inline]
    #[must_use]
    pub fn with_dispatch_spacing(mut self, spacing: Duration) -> Self {
        self.dispatch_spacing_ms = duration_ms(spacing);
        self
    }

    /// With chunk stagger
    #[inline]
    #[must_use]
    pub fn with_chunk_spacing(mut self, spacing: Duration) -> Self {
        self.chunk_spacing_ms = duration_ms(spacing);
        self
    }

    /// With request timeout
    #[inline]
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_secs = timeout.as_secs().max(1);
        self
    }

    /// With fallback ladder
    #[inline]
    #[must_use]
    pub fn with_fallback_windows(mut self, windows: impl Into<Vec<u32>>) -> Self {
        self.fallback_windows = windows.into();
        self
    }

    /// With forced chunk size
    #[inline]
    #[must_use]
    pub fn with_chunk_days(mut self, days: Option<u32>) -> Self {
        self.chunk_days = days;
        self
    }

    /// With watchdog timing
    #[inline]
    #[must_use]
    pub fn with_watchdog(mut self, interval: Duration, stall_threshold: Duration) -> Self {
        self.watchdog_interval_ms = duration_ms(interval);
        self.stall_threshold_ms = duration_ms(stall_threshold);
        self
    }

    /// Dispatch spacing as a duration
    #[inline]
    #[must_use]
    pub fn dispatch_spacing(&self) -> Duration {
        Duration::from_millis(self.dispatch_spacing_ms)
    }

    /// Chunk stagger as a duration
    #[inline]
    #[must_use]
    pub fn chunk_spacing(&self) -> Duration {
        Duration::from_millis(self.chunk_spacing_ms)
    }

    /// Request timeout as a duration
    #[inline]
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Watchdog tick as a duration
    #[inline]
    #[must_use]
    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }

    /// Stall threshold as a duration
    #[inline]
    #[must_use]
    pub fn stall_threshold(&self) -> Duration {
        Duration::from_millis(self.stall_threshold_ms)
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 4,
            dispatch_spacing_ms: 250,
            chunk_spacing_ms: 150,
            request_timeout_secs: 60,
            fallback_windows: DEFAULT_FALLBACK_WINDOWS.to_vec(),
            chunk_days: None,
            watchdog_interval_ms: 5_000,
            stall_threshold_ms: 30_000,
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_are_valid() {
        let config = ScanConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.fallback_windows, vec![180, 60, 30, 10, 7, 1]);
        assert_eq!(config.request_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = ScanConfig::from_toml_str(
            r#"
            concurrency_limit = 2
            chunk_days = 15
            fallback_windows = [90, 30, 7]
            "#,
        )
        .unwrap();

        assert_eq!(config.concurrency_limit, 2);
        assert_eq!(config.chunk_days, Some(15));
        assert_eq!(config.fallback_windows, vec![90, 30, 7]);
        assert_eq!(config.dispatch_spacing_ms, 250);
    }

    #[test]
    fn zero_concurrency_rejected() {
        let err = ScanConfig::from_toml_str("concurrency_limit = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn malformed_toml_rejected() {
        let err = ScanConfig::from_toml_str("concurrency_limit = \"many\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn builder_helpers() {
        let config = ScanConfig::new()
            .with_concurrency(8)
            .with_dispatch_spacing(Duration::from_millis(40))
            .with_watchdog(Duration::from_secs(1), Duration::from_secs(10));
        assert_eq!(config.concurrency_limit, 8);
        assert_eq!(config.dispatch_spacing(), Duration::from_millis(40));
        assert_eq!(config.stall_threshold_ms, 10_000);
    }
}
