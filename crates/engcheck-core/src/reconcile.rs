// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Single-writer pipeline: normalizer → store → projections → published view.
//!
//! The [`Reconciler`] is the only owner of mutable state. Every step mutates
//! the store, the search index and the timeline together and then publishes
//! a fresh [`View`] on a `watch` channel. Readers hold an `Arc<View>`; they
//! never lock and never see a store update without its projections.

use chrono::{DateTime, Duration, Utc};
use engcheck_proto::{ItemId, Sequence, SnapshotPayload, Value};
use serde::Serialize;
use std::ops::Range;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::error::{IngestError, MalformedEventError, StaleEventError, TimelineError};
use crate::event::{normalize, ComplianceEvent};
use crate::item::{ComplianceItem, DEFAULT_HISTORY_LEN};
use crate::search::{SearchHit, SearchIndex, DEFAULT_MAX_TYPOS};
use crate::store::{Applied, StateStore, StoreSnapshot};
use crate::timeline::{AggregateBucket, TimelineAggregator, DEFAULT_BUCKET_SECS, DEFAULT_LATENESS_SECS};

/// Tuning for the store and its projections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilerConfig {
    /// History entries kept per item.
    pub history_len: usize,
    /// Edit budget cap for search tokens.
    pub max_typos: u8,
    /// Base timeline bucket width.
    pub bucket_width: Duration,
    /// Timeline lateness window.
    pub lateness: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            history_len: DEFAULT_HISTORY_LEN,
            max_typos: DEFAULT_MAX_TYPOS,
            bucket_width: Duration::seconds(DEFAULT_BUCKET_SECS),
            lateness: Duration::seconds(DEFAULT_LATENESS_SECS),
        }
    }
}

/// Pipeline counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    /// Events that changed the store.
    pub applied: u64,
    /// Events discarded as stale.
    pub stale: u64,
    /// Frames dropped by the normalizer.
    pub malformed: u64,
    /// Events the timeline refused as too late.
    pub late_dropped: u64,
    /// Snapshots loaded.
    pub snapshots: u64,
    /// Highest stream sequence reflected by the view.
    pub last_sequence: Option<Sequence>,
}

/// Immutable, consistent read side. Cheap to clone.
#[derive(Debug, Clone)]
pub struct View {
    version: u64,
    snapshot: StoreSnapshot,
    index: Arc<SearchIndex>,
    timeline: Arc<TimelineAggregator>,
    stats: Stats,
}

impl View {
    /// Monotonic publish counter.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Store contents at publish time.
    pub fn snapshot(&self) -> &StoreSnapshot {
        &self.snapshot
    }

    /// One item.
    pub fn item(&self, id: &str) -> Option<&ComplianceItem> {
        self.snapshot.get(id)
    }

    /// Ranked ids matching `text`.
    pub fn query(&self, text: &str) -> Vec<ItemId> {
        self.index.query(text)
    }

    /// Ranked hits with scores.
    pub fn query_scored(&self, text: &str) -> Vec<SearchHit> {
        self.index.query_scored(text)
    }

    /// Gap-filled status counts.
    pub fn series(
        &self,
        range: Range<DateTime<Utc>>,
        interval: Duration,
    ) -> Result<Vec<AggregateBucket>, TimelineError> {
        self.timeline.series(range, interval)
    }

    /// Counters at publish time.
    pub fn stats(&self) -> Stats {
        self.stats
    }
}

/// Outcome of [`Reconciler::load_snapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotLoad {
    /// Items now in the store.
    pub items: usize,
    /// Snapshot entries the normalizer rejected.
    pub malformed: usize,
}

/// Owner of the store and its projections.
#[derive(Debug)]
pub struct Reconciler {
    store: StateStore,
    index: Arc<SearchIndex>,
    timeline: Arc<TimelineAggregator>,
    stats: Stats,
    version: u64,
    tx: watch::Sender<Arc<View>>,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new(ReconcilerConfig::default())
    }
}

impl Reconciler {
    /// Empty pipeline; publishes an initial empty view.
    pub fn new(config: ReconcilerConfig) -> Self {
        let store = StateStore::new(config.history_len);
        let index = Arc::new(SearchIndex::new(config.max_typos));
        let timeline = Arc::new(TimelineAggregator::new(config.bucket_width, config.lateness));
        let view = View {
            version: 0,
            snapshot: store.snapshot(),
            index: Arc::clone(&index),
            timeline: Arc::clone(&timeline),
            stats: Stats::default(),
        };
        let (tx, _) = watch::channel(Arc::new(view));
        Self {
            store,
            index,
            timeline,
            stats: Stats::default(),
            version: 0,
            tx,
        }
    }

    /// Receiver of every published view.
    pub fn subscribe(&self) -> watch::Receiver<Arc<View>> {
        self.tx.subscribe()
    }

    /// Latest published view.
    pub fn view(&self) -> Arc<View> {
        Arc::clone(&self.tx.borrow())
    }

    /// Current counters.
    pub fn stats(&self) -> Stats {
        self.stats
    }

    /// Normalize and apply one raw frame.
    ///
    /// Malformed frames are counted and logged at `warn`; stale ones at
    /// `debug`. Neither stops the pipeline.
    pub fn ingest_raw(&mut self, raw: &Value) -> Result<Applied, IngestError> {
        let event = match normalize(raw) {
            Ok(event) => event,
            Err(err) => {
                self.record_malformed(&err);
                return Err(err.into());
            }
        };
        Ok(self.apply(&event)?)
    }

    /// Count a frame the caller normalized and had to drop.
    pub fn record_malformed(&mut self, err: &MalformedEventError) {
        warn!(%err, "dropping malformed frame");
        self.stats.malformed += 1;
        self.publish();
    }

    /// Apply one event and patch both projections.
    pub fn apply(&mut self, event: &ComplianceEvent) -> Result<Applied, StaleEventError> {
        let outcome = self.apply_quiet(event);
        self.publish();
        outcome
    }

    /// Apply many events and publish once.
    pub fn apply_batch<'a, I>(&mut self, events: I) -> usize
    where
        I: IntoIterator<Item = &'a ComplianceEvent>,
    {
        let applied = events
            .into_iter()
            .filter(|event| self.apply_quiet(event).is_ok())
            .count();
        self.publish();
        applied
    }

    /// Replace all state with an authoritative snapshot.
    ///
    /// The store is reset, every snapshot entry goes through the normalizer,
    /// then both projections are rebuilt from the store.
    pub fn load_snapshot(&mut self, snapshot: &SnapshotPayload) -> SnapshotLoad {
        let mut malformed = 0;
        let events: Vec<ComplianceEvent> = snapshot
            .items
            .iter()
            .filter_map(|raw| match normalize(raw) {
                Ok(event) => Some(event),
                Err(err) => {
                    warn!(%err, sequence = snapshot.sequence, "dropping malformed snapshot entry");
                    malformed += 1;
                    None
                }
            })
            .collect();
        self.stats.malformed += malformed as u64;
        let items = self.load_events(snapshot.sequence, &events);
        SnapshotLoad { items, malformed }
    }

    /// Reset to exactly `events` as of stream sequence `sequence`.
    pub fn load_events(&mut self, sequence: Sequence, events: &[ComplianceEvent]) -> usize {
        self.store.reset();
        for event in events {
            if let Err(err) = self.store.apply(event) {
                debug!(%err, "duplicate snapshot entry");
            }
        }
        let snapshot = self.store.snapshot();
        Arc::make_mut(&mut self.index).rebuild(&snapshot);
        Arc::make_mut(&mut self.timeline).rebuild(&snapshot);
        self.stats.snapshots += 1;
        self.stats.last_sequence = Some(sequence).max(snapshot.max_sequence());
        debug!(sequence, items = snapshot.len(), "snapshot loaded");
        self.publish();
        snapshot.len()
    }

    /// Retire an item from the store and both projections.
    pub fn remove_item(&mut self, id: &str) -> Option<ComplianceItem> {
        let removed = self.store.remove(id)?;
        Arc::make_mut(&mut self.index).remove(id);
        Arc::make_mut(&mut self.timeline).rebuild(&self.store.snapshot());
        self.publish();
        Some(removed)
    }

    /// Drop timeline buckets older than `horizon`.
    pub fn prune_timeline(&mut self, horizon: DateTime<Utc>) -> usize {
        let dropped = Arc::make_mut(&mut self.timeline).prune_before(horizon);
        if dropped > 0 {
            self.publish();
        }
        dropped
    }

    fn apply_quiet(&mut self, event: &ComplianceEvent) -> Result<Applied, StaleEventError> {
        let applied = match self.store.apply(event) {
            Ok(applied) => applied,
            Err(err) => {
                debug!(%err, "discarding stale event");
                self.stats.stale += 1;
                return Err(err);
            }
        };
        self.stats.applied += 1;
        self.stats.last_sequence = self.stats.last_sequence.max(Some(event.sequence));

        if let Some(item) = self.store.get(&event.id) {
            Arc::make_mut(&mut self.index).update(item);
            if let Some(entry) = item.history.last() {
                let timeline = Arc::make_mut(&mut self.timeline);
                if let Err(late) = timeline.record_entry(&item.id, entry) {
                    debug!(%late, "timeline refused late event");
                }
            }
        }
        trace!(id = %event.id, sequence = event.sequence, ?applied, "applied");
        Ok(applied)
    }

    fn publish(&mut self) {
        self.version += 1;
        self.stats.late_dropped = self.timeline.late_dropped();
        let view = View {
            version: self.version,
            snapshot: self.store.snapshot(),
            index: Arc::clone(&self.index),
            timeline: Arc::clone(&self.timeline),
            stats: self.stats,
        };
        self.tx.send_replace(Arc::new(view));
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use engcheck_proto::ComplianceStatus;

    fn ev(id: &str, seq: u64, status: ComplianceStatus) -> ComplianceEvent {
        let ts = Utc.timestamp_opt(1_700_000_000 + i64::try_from(seq).unwrap() * 30, 0).single().unwrap();
        ComplianceEvent::new(id, status, ts, seq, "r1").with_description("panel grounding")
    }

    #[test]
    fn every_step_publishes_a_consistent_view() {
        let mut rec = Reconciler::default();
        let rx = rec.subscribe();
        let before = rec.view();

        rec.apply(&ev("A", 1, ComplianceStatus::Warning)).unwrap();
        let view = rx.borrow().clone();
        assert!(view.version() > before.version());
        assert_eq!(view.snapshot().len(), 1);
        assert_eq!(view.query("grounding"), vec!["A".to_string()]);
        assert_eq!(view.stats().applied, 1);

        assert!(before.snapshot().is_empty());
        assert!(before.query("grounding").is_empty());
    }

    #[test]
    fn stale_and_malformed_are_counted() {
        let mut rec = Reconciler::default();
        rec.apply(&ev("A", 3, ComplianceStatus::Critical)).unwrap();
        assert!(rec.apply(&ev("A", 2, ComplianceStatus::Compliant)).is_err());
        assert!(matches!(rec.ingest_raw(&Value::Null), Err(IngestError::Malformed(_))));

        let stats = rec.view().stats();
        assert_eq!((stats.applied, stats.stale, stats.malformed), (1, 1, 1));
        assert_eq!(stats.last_sequence, Some(3));
    }

    #[test]
    fn removal_leaves_no_trace_in_projections() {
        let mut rec = Reconciler::default();
        rec.apply(&ev("A", 1, ComplianceStatus::Warning)).unwrap();
        rec.apply(&ev("B", 2, ComplianceStatus::Warning)).unwrap();
        assert!(rec.remove_item("A").is_some());

        let view = rec.view();
        assert_eq!(view.query("grounding"), vec!["B".to_string()]);
        let start = Utc.timestamp_opt(1_700_000_000, 0).single().unwrap();
        let total: u64 = view
            .series(start..start + Duration::hours(1), Duration::hours(1))
            .unwrap()
            .iter()
            .map(|b| b.count)
            .sum();
        assert_eq!(total, 1);
    }

    #[test]
    fn snapshot_load_replaces_state() {
        let mut rec = Reconciler::default();
        rec.apply(&ev("OLD", 1, ComplianceStatus::Warning)).unwrap();
        let events = vec![ev("A", 4, ComplianceStatus::Compliant), ev("B", 7, ComplianceStatus::Critical)];
        assert_eq!(rec.load_events(9, &events), 2);

        let view = rec.view();
        assert!(view.item("OLD").is_none());
        assert_eq!(view.stats().last_sequence, Some(9));
        assert_eq!(view.stats().snapshots, 1);
        assert_eq!(view.query("grounding").len(), 2);
    }
}
