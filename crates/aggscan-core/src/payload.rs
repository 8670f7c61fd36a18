//! Payload builders
//!
//! The runner does not know the query language. It asks a [`PayloadBuilder`]
//! for either one payload covering a window or a list of payloads covering
//! consecutive sub-ranges of it.

use crate::transport::AggregationQuery;
use aggscan_registry::ScanEntry;
use chrono::{Days, NaiveDate, Utc};
use serde_json::json;

/// Builds aggregation payloads for an entity
pub trait PayloadBuilder: Send + Sync {
    /// One payload covering the last `window_days` days
    fn base_payload(&self, entry: &ScanEntry, window_days: u32) -> AggregationQuery;

    /// Payloads covering the last `window_days` days in `chunk_days` pieces
    fn chunked_payloads(
        &self,
        entry: &ScanEntry,
        window_days: u32,
        chunk_days: u32,
    ) -> Vec<AggregationQuery>;
}

/// Half-open `[from, to)` day range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    /// First day included
    pub from: NaiveDate,
    /// First day excluded
    pub to: NaiveDate,
}

impl DateRange {
    /// Length in days
    #[must_use]
    pub fn days(&self) -> i64 {
        (self.to - self.from).num_days()
    }
}

/// Split the `window_days` days ending at `end` into ranges of `chunk_days`
///
/// Ranges are returned oldest first; the oldest may be shorter when the
/// window is not a multiple of the chunk size.
#[must_use]
pub fn split_window(end: NaiveDate, window_days: u32, chunk_days: u32) -> Vec<DateRange> {
    if window_days == 0 || chunk_days == 0 {
        return Vec::new();
    }
    let mut ranges = Vec::new();
    let mut to = end;
    let mut remaining = window_days;
    while remaining > 0 {
        let step = remaining.min(chunk_days);
        let Some(from) = to.checked_sub_days(Days::new(u64::from(step))) else {
            break;
        };
        ranges.push(DateRange { from, to });
        to = from;
        remaining -= step;
    }
    ranges.reverse();
    ranges
}

/// JSON payloads scoped by date range, ending at a fixed anchor day
#[derive(Debug, Clone)]
pub struct DateRangePayloadBuilder {
    anchor: NaiveDate,
}

impl DateRangePayloadBuilder {
    /// Ranges end at (and exclude) `anchor`
    #[inline]
    #[must_use]
    pub fn new(anchor: NaiveDate) -> Self {
        Self { anchor }
    }

    /// Ranges end today (UTC)
    #[must_use]
    pub fn ending_today() -> Self {
        Self::new(Utc::now().date_naive())
    }

    fn payload(&self, entry: &ScanEntry, window_days: u32, range: DateRange) -> AggregationQuery {
        json!({
            "entity_id": entry.entity_id,
            "sub_group_id": entry.sub_group_id,
            "window_days": window_days,
            "from": range.from.to_string(),
            "to": range.to.to_string(),
        })
    }
}

impl PayloadBuilder for DateRangePayloadBuilder {
    /// A window reaching past the earliest representable date is clamped to
    /// start at `NaiveDate::MIN`
    fn base_payload(&self, entry: &ScanEntry, window_days: u32) -> AggregationQuery {
        let range = match split_window(self.anchor, window_days, window_days).into_iter().next() {
            Some(range) => range,
            None => {
                tracing::warn!(
                    entity_id = %entry.entity_id,
                    window_days,
                    anchor = %self.anchor,
                    "window start out of calendar range, clamping"
                );
                DateRange {
                    from: NaiveDate::MIN,
                    to: self.anchor,
                }
            }
        };
        self.payload(entry, window_days, range)
    }

    fn chunked_payloads(
        &self,
        entry: &ScanEntry,
        window_days: u32,
        chunk_days: u32,
    ) -> Vec<AggregationQuery> {
        split_window(self.anchor, window_days, chunk_days)
            .into_iter()
            .map(|range| self.payload(entry, window_days, range))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn base_payload_clamps_unrepresentable_start() {
        let anchor = NaiveDate::MIN.checked_add_days(Days::new(5)).unwrap();
        let builder = DateRangePayloadBuilder::new(anchor);
        let payload = builder.base_payload(&ScanEntry::new("app", "eu", "key"), 30);

        assert_eq!(payload["from"], NaiveDate::MIN.to_string());
        assert_eq!(payload["to"], anchor.to_string());
        assert_eq!(payload["window_days"], 30);
    }

    #[test]
    fn split_even_window() {
        let ranges = split_window(day(2024, 3, 31), 30, 10);
        assert_eq!(ranges.len(), 3);
        assert_eq!(ranges[0].from, day(2024, 3, 1));
        assert_eq!(ranges[2].to, day(2024, 3, 31));
        assert!(ranges.iter().all(|r| r.days() == 10));
        assert!(ranges.windows(2).all(|w| w[0].to == w[1].from));
    }

    #[test]
    fn split_uneven_window_shortens_oldest() {
        let ranges = split_window(day(2024, 1, 10), 7, 3);
        let lengths: Vec<i64> = ranges.iter().map(DateRange::days).collect();
        assert_eq!(lengths, vec![1, 3, 3]);
    }

    #[test]
    fn split_degenerate_inputs() {
        assert!(split_window(day(2024, 1, 1), 0, 3).is_empty());
        assert!(split_window(day(2024, 1, 1), 3, 0).is_empty());
    }

    #[test]
    fn builder_emits_one_payload_per_chunk() {
        let builder = DateRangePayloadBuilder::new(day(2024, 6, 1));
        let entry = ScanEntry::new("app-1", "eu", "key");

        let base = builder.base_payload(&entry, 30);
        assert_eq!(base["from"], "2024-05-02");
        assert_eq!(base["to"], "2024-06-01");

        let chunks = builder.chunked_payloads(&entry, 30, 7);
        assert_eq!(chunks.len(), 5);
        assert_eq!(chunks[4]["to"], "2024-06-01");
        assert!(chunks.iter().all(|c| c["entity_id"] == "app-1"));
    }
}
