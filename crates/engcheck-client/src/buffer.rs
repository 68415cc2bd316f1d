// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Bounded holding area for events received while a snapshot is pending.

use engcheck_core::ComplianceEvent;
use engcheck_proto::Sequence;
use std::collections::VecDeque;

/// FIFO of pending events; the oldest is evicted when full.
#[derive(Debug, Clone)]
pub struct ResyncBuffer {
    events: VecDeque<ComplianceEvent>,
    capacity: usize,
    evicted: u64,
}

impl ResyncBuffer {
    /// Buffer holding at most `capacity` events (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            evicted: 0,
        }
    }

    /// Hold `event`; returns the evicted oldest event when over capacity.
    pub fn push(&mut self, event: ComplianceEvent) -> Option<ComplianceEvent> {
        let evicted = if self.events.len() == self.capacity {
            self.evicted += 1;
            self.events.pop_front()
        } else {
            None
        };
        self.events.push_back(event);
        evicted
    }

    /// Take every event newer than `after`, in sequence order, duplicates removed.
    pub fn drain_after(&mut self, after: Sequence) -> Vec<ComplianceEvent> {
        let mut out: Vec<ComplianceEvent> = self
            .events
            .drain(..)
            .filter(|e| e.sequence > after)
            .collect();
        out.sort_by_key(|e| e.sequence);
        out.dedup_by_key(|e| e.sequence);
        out
    }

    /// Put back events that could not be replayed yet.
    pub fn restore(&mut self, events: impl IntoIterator<Item = ComplianceEvent>) {
        for event in events {
            self.push(event);
        }
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// Buffered events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// True when nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Events lost to overflow since creation.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use engcheck_proto::ComplianceStatus;

    fn ev(seq: u64) -> ComplianceEvent {
        let ts = Utc.timestamp_opt(1_700_000_000, 0).single().unwrap();
        ComplianceEvent::new("A", ComplianceStatus::Warning, ts, seq, "r")
    }

    #[test]
    fn overflow_evicts_oldest() {
        let mut b = ResyncBuffer::new(2);
        assert!(b.push(ev(1)).is_none());
        assert!(b.push(ev(2)).is_none());
        assert_eq!(b.push(ev(3)).unwrap().sequence, 1);
        assert_eq!(b.evicted(), 1);
        assert_eq!(b.len(), 2);
    }

    #[test]
    fn drain_sorts_dedups_and_skips_covered() {
        let mut b = ResyncBuffer::new(8);
        for seq in [9, 6, 8, 9, 7] {
            b.push(ev(seq));
        }
        let seqs: Vec<_> = b.drain_after(7).iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![8, 9]);
        assert!(b.is_empty());
    }
}
