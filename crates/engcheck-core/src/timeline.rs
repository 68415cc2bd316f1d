// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Per-interval status counts for charting.
//!
//! Events land in fixed-width base buckets keyed by their start second. Each
//! base bucket remembers, per item, the status of the highest-sequence event
//! it received, so a coarser interval can count every item exactly once by
//! its latest status inside that interval.

use chrono::{DateTime, Duration, Utc};
use engcheck_proto::{ComplianceStatus, ItemId, Sequence};
use serde::Serialize;
use std::collections::BTreeMap;
use std::ops::Range;
use tracing::warn;

use crate::error::{LateDroppedEvent, TimelineError};
use crate::event::ComplianceEvent;
use crate::item::HistoryEntry;
use crate::store::StoreSnapshot;

/// Default base bucket width.
pub const DEFAULT_BUCKET_SECS: i64 = 60;
/// Default lateness window.
pub const DEFAULT_LATENESS_SECS: i64 = 15 * 60;

/// Count of items holding `status` in the interval starting at `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AggregateBucket {
    /// Interval start (inclusive).
    pub start: DateTime<Utc>,
    /// Status counted.
    pub status: ComplianceStatus,
    /// Distinct items whose latest status in the interval is `status`.
    pub count: u64,
}

type Latest = BTreeMap<ItemId, (Sequence, ComplianceStatus)>;

/// Incremental, lateness-bounded timeline.
#[derive(Debug, Clone)]
pub struct TimelineAggregator {
    bucket_secs: i64,
    lateness: Duration,
    buckets: BTreeMap<i64, Latest>,
    watermark: Option<DateTime<Utc>>,
    late_dropped: u64,
}

impl Default for TimelineAggregator {
    fn default() -> Self {
        Self::new(
            Duration::seconds(DEFAULT_BUCKET_SECS),
            Duration::seconds(DEFAULT_LATENESS_SECS),
        )
    }
}

impl TimelineAggregator {
    /// Aggregator with the given base width (at least one second) and lateness.
    pub fn new(bucket_width: Duration, lateness: Duration) -> Self {
        Self {
            bucket_secs: bucket_width.num_seconds().max(1),
            lateness: lateness.max(Duration::zero()),
            buckets: BTreeMap::new(),
            watermark: None,
            late_dropped: 0,
        }
    }

    /// Base bucket width.
    pub fn bucket_width(&self) -> Duration {
        Duration::seconds(self.bucket_secs)
    }

    /// Event-time frontier used for lateness.
    ///
    /// A live event can push it at most one lateness window past its current
    /// value, so a single skewed timestamp cannot strand real-time events.
    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        self.watermark
    }

    /// Events dropped for arriving beyond the lateness window.
    pub fn late_dropped(&self) -> u64 {
        self.late_dropped
    }

    /// Number of non-empty base buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Fold one applied event into its base bucket.
    ///
    /// Events for buckets that are already behind the watermark still update
    /// them, up to the lateness window; older ones are counted and rejected.
    pub fn record(&mut self, event: &ComplianceEvent) -> Result<(), LateDroppedEvent> {
        self.admit(&event.id, event.timestamp, event.sequence, event.status)
    }

    /// Like [`record`](Self::record), for an entry already in an item's history.
    pub fn record_entry(&mut self, id: &str, entry: &HistoryEntry) -> Result<(), LateDroppedEvent> {
        self.admit(id, entry.timestamp, entry.sequence, entry.status)
    }

    /// Recompute every bucket from item histories. The late counter survives.
    pub fn rebuild(&mut self, snapshot: &StoreSnapshot) {
        self.buckets.clear();
        self.watermark = None;
        for item in snapshot.iter() {
            for entry in item.history.iter() {
                self.insert(&item.id, entry.timestamp, entry.sequence, entry.status);
                self.watermark = self.watermark.max(Some(entry.timestamp));
            }
        }
    }

    /// Drop base buckets that end at or before `horizon`. Returns how many.
    pub fn prune_before(&mut self, horizon: DateTime<Utc>) -> usize {
        let cutoff = self.bucket_start(horizon);
        let kept = self.buckets.split_off(&cutoff);
        let dropped = self.buckets.len();
        self.buckets = kept;
        dropped
    }

    /// Gap-filled series over `range` in steps of `interval`.
    ///
    /// Intervals are aligned to multiples of `interval` since the epoch; every
    /// interval overlapping `range` yields one bucket per status, in
    /// [`ComplianceStatus::ALL`] order, zero counts included.
    pub fn series(
        &self,
        range: Range<DateTime<Utc>>,
        interval: Duration,
    ) -> Result<Vec<AggregateBucket>, TimelineError> {
        let step = interval.num_seconds();
        if step <= 0 || step % self.bucket_secs != 0 || interval != Duration::seconds(step) {
            return Err(TimelineError::BadInterval {
                interval_secs: step,
                bucket_secs: self.bucket_secs,
            });
        }
        if range.end <= range.start {
            return Err(TimelineError::BadRange);
        }

        let end = range.end.timestamp();
        let mut start = range.start.timestamp().div_euclid(step) * step;
        let mut out = Vec::new();
        while start < end {
            let mut latest: BTreeMap<&str, (Sequence, ComplianceStatus)> = BTreeMap::new();
            for items in self.buckets.range(start..start + step).map(|(_, v)| v) {
                for (id, &(seq, status)) in items {
                    let slot = latest.entry(id.as_str()).or_insert((seq, status));
                    if seq > slot.0 {
                        *slot = (seq, status);
                    }
                }
            }
            let at = DateTime::from_timestamp(start, 0).ok_or(TimelineError::BadRange)?;
            out.extend(ComplianceStatus::ALL.iter().map(|&status| AggregateBucket {
                start: at,
                status,
                count: latest.values().filter(|(_, s)| *s == status).count() as u64,
            }));
            start += step;
        }
        Ok(out)
    }

    fn admit(
        &mut self,
        id: &str,
        ts: DateTime<Utc>,
        sequence: Sequence,
        status: ComplianceStatus,
    ) -> Result<(), LateDroppedEvent> {
        if let Some(watermark) = self.watermark {
            if ts < watermark - self.lateness {
                self.late_dropped += 1;
                return Err(LateDroppedEvent {
                    id: id.to_string(),
                    timestamp: ts,
                    watermark,
                });
            }
        }
        self.insert(id, ts, sequence, status);
        self.advance(id, ts);
        Ok(())
    }

    fn advance(&mut self, id: &str, ts: DateTime<Utc>) {
        let Some(watermark) = self.watermark else {
            self.watermark = Some(ts);
            return;
        };
        let ceiling = watermark + self.lateness;
        if ts > ceiling {
            warn!(%id, timestamp = %ts, %watermark, "event time jumps past the lateness window; watermark held back");
            self.watermark = Some(ceiling);
        } else if ts > watermark {
            self.watermark = Some(ts);
        }
    }

    fn bucket_start(&self, ts: DateTime<Utc>) -> i64 {
        ts.timestamp().div_euclid(self.bucket_secs) * self.bucket_secs
    }

    fn insert(&mut self, id: &str, ts: DateTime<Utc>, sequence: Sequence, status: ComplianceStatus) {
        let key = self.bucket_start(ts);
        let slot = self
            .buckets
            .entry(key)
            .or_default()
            .entry(id.to_string())
            .or_insert((sequence, status));
        if sequence > slot.0 {
            *slot = (sequence, status);
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    fn ev(id: &str, secs: i64, seq: u64, status: ComplianceStatus) -> ComplianceEvent {
        ComplianceEvent::new(id, status, at(secs), seq, "r")
    }

    fn counts(series: &[AggregateBucket]) -> Vec<u64> {
        series.iter().map(|b| b.count).collect()
    }

    #[test]
    fn series_is_gap_filled_in_status_order() {
        let mut t = TimelineAggregator::default();
        t.record(&ev("A", 0, 1, ComplianceStatus::Warning)).unwrap();
        t.record(&ev("B", 130, 2, ComplianceStatus::Critical)).unwrap();

        let s = t.series(at(0)..at(180), Duration::seconds(60)).unwrap();
        assert_eq!(s.len(), 3 * ComplianceStatus::ALL.len());
        assert_eq!(s[0].start, at(0));
        assert_eq!(s[4].start, at(60));
        assert_eq!(counts(&s), vec![0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 1, 0]);
    }

    #[test]
    fn interval_counts_each_item_once_by_latest_sequence() {
        let mut t = TimelineAggregator::default();
        t.record(&ev("A", 10, 1, ComplianceStatus::Warning)).unwrap();
        t.record(&ev("A", 70, 3, ComplianceStatus::Critical)).unwrap();
        t.record(&ev("A", 65, 2, ComplianceStatus::Compliant)).unwrap();

        let s = t.series(at(0)..at(120), Duration::seconds(120)).unwrap();
        assert_eq!(counts(&s), vec![0, 0, 1, 0]);
        assert_eq!(s.iter().map(|b| b.count).sum::<u64>(), 1);
    }

    #[test]
    fn late_events_update_until_window_closes() {
        let mut t = TimelineAggregator::new(Duration::seconds(60), Duration::seconds(300));
        t.record(&ev("A", 1_000, 1, ComplianceStatus::Warning)).unwrap();
        assert!(t.record(&ev("B", 800, 2, ComplianceStatus::Critical)).is_ok());
        let late = t.record(&ev("C", 600, 3, ComplianceStatus::Critical)).unwrap_err();
        assert_eq!(late.watermark, at(1_000));
        assert_eq!(t.late_dropped(), 1);
    }

    #[test]
    fn skewed_timestamp_advances_watermark_one_window_at_most() {
        let mut t = TimelineAggregator::new(Duration::seconds(60), Duration::seconds(300));
        t.record(&ev("A", 1_000, 1, ComplianceStatus::Warning)).unwrap();
        t.record(&ev("B", 1_000_000, 2, ComplianceStatus::Critical)).unwrap();
        assert_eq!(t.watermark(), Some(at(1_300)));

        assert!(t.record(&ev("C", 1_010, 3, ComplianceStatus::Compliant)).is_ok());
        assert_eq!(t.late_dropped(), 0);
        assert!(t.record(&ev("D", 900, 4, ComplianceStatus::Compliant)).is_err());
    }

    #[test]
    fn bad_requests_are_rejected() {
        let t = TimelineAggregator::default();
        assert!(matches!(
            t.series(at(0)..at(60), Duration::seconds(90)),
            Err(TimelineError::BadInterval { .. })
        ));
        assert!(matches!(
            t.series(at(0)..at(60), Duration::zero()),
            Err(TimelineError::BadInterval { .. })
        ));
        assert_eq!(t.series(at(60)..at(60), Duration::seconds(60)), Err(TimelineError::BadRange));
    }

    #[test]
    fn prune_drops_old_buckets() {
        let mut t = TimelineAggregator::default();
        t.record(&ev("A", 0, 1, ComplianceStatus::Warning)).unwrap();
        t.record(&ev("A", 120, 2, ComplianceStatus::Warning)).unwrap();
        assert_eq!(t.prune_before(at(60)), 1);
        assert_eq!(t.bucket_count(), 1);
    }
}
