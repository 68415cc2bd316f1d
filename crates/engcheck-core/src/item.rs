// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Compliance items and their bounded status history.

use chrono::{DateTime, Utc};
use engcheck_proto::{ComplianceStatus, ItemId, Revision, Sequence};
use serde::Serialize;
use std::collections::VecDeque;

use crate::event::ComplianceEvent;
use crate::render::Description;

/// Default number of history entries kept per item.
pub const DEFAULT_HISTORY_LEN: usize = 64;

/// One recorded status transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    /// When the status was observed (never earlier than the previous entry).
    pub timestamp: DateTime<Utc>,
    /// Observed status.
    pub status: ComplianceStatus,
    /// Sequence of the event that produced the entry.
    pub sequence: Sequence,
}

/// Append-only, bounded, timestamp-monotonic history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusHistory {
    entries: VecDeque<HistoryEntry>,
    capacity: usize,
}

impl StatusHistory {
    /// Empty history retaining at most `capacity` entries (minimum 1).
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity.min(DEFAULT_HISTORY_LEN)),
            capacity,
        }
    }

    /// Append an entry, evicting the oldest beyond capacity.
    ///
    /// A timestamp earlier than the last entry is clamped to it, so the
    /// sequence stays non-decreasing. Returns the timestamp actually recorded.
    pub fn push(
        &mut self,
        timestamp: DateTime<Utc>,
        status: ComplianceStatus,
        sequence: Sequence,
    ) -> DateTime<Utc> {
        let timestamp = match self.entries.back() {
            Some(last) if last.timestamp > timestamp => last.timestamp,
            _ => timestamp,
        };
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(HistoryEntry {
            timestamp,
            status,
            sequence,
        });
        timestamp
    }

    /// Entries oldest-first.
    pub fn iter(&self) -> impl Iterator<Item = &HistoryEntry> + '_ {
        self.entries.iter()
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Most recent entry.
    pub fn last(&self) -> Option<&HistoryEntry> {
        self.entries.back()
    }
}

/// Current state of one monitored entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComplianceItem {
    /// Stable identity.
    pub id: ItemId,
    /// Category (empty until an event or snapshot supplies one).
    pub category: String,
    /// Status of the highest-sequence event applied.
    pub status: ComplianceStatus,
    /// Timestamp carried by that event.
    pub updated_at: DateTime<Utc>,
    /// Highest sequence applied.
    pub sequence: Sequence,
    /// Revision of that event.
    pub revision: Revision,
    /// Sanitized description.
    pub description: Description,
    /// Recent transitions.
    pub history: StatusHistory,
}

impl ComplianceItem {
    pub(crate) fn from_event(event: &ComplianceEvent, history_len: usize) -> Self {
        let mut history = StatusHistory::with_capacity(history_len);
        history.push(event.timestamp, event.status, event.sequence);
        Self {
            id: event.id.clone(),
            category: event.category.clone().unwrap_or_default(),
            status: event.status,
            updated_at: event.timestamp,
            sequence: event.sequence,
            revision: event.revision.clone(),
            description: event.description.clone().unwrap_or_default(),
            history,
        }
    }

    /// Fold a newer event into the item. Caller has checked the sequence.
    pub(crate) fn absorb(&mut self, event: &ComplianceEvent) {
        self.history.push(event.timestamp, event.status, event.sequence);
        self.updated_at = event.timestamp;
        self.status = event.status;
        self.sequence = event.sequence;
        self.revision.clone_from(&event.revision);
        if let Some(category) = &event.category {
            self.category.clone_from(category);
        }
        if let Some(description) = &event.description {
            self.description = description.clone();
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

    #[test]
    fn history_evicts_oldest_beyond_capacity() {
        let mut h = StatusHistory::with_capacity(3);
        for i in 0..5 {
            h.push(at(i), ComplianceStatus::Compliant, i as u64);
        }
        assert_eq!(h.len(), 3);
        let seqs: Vec<_> = h.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![2, 3, 4]);
    }

    #[test]
    fn history_timestamps_never_decrease() {
        let mut h = StatusHistory::with_capacity(8);
        h.push(at(100), ComplianceStatus::Warning, 1);
        let recorded = h.push(at(50), ComplianceStatus::Critical, 2);
        assert_eq!(recorded, at(100));
        let ts: Vec<_> = h.iter().map(|e| e.timestamp).collect();
        assert!(ts.windows(2).all(|w| w[0] <= w[1]));
    }
}
