// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Authoritative item state, keyed by id and ordered by sequence.
//!
//! `apply` is idempotent and commutative with respect to sequence: an event
//! only lands when its sequence is strictly greater than what the item (or
//! its tombstone) already carries. The map is copy-on-write, so
//! [`StateStore::snapshot`] is O(1) and never observes a half-applied event.

use engcheck_proto::{ComplianceStatus, ItemId, Sequence};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::error::StaleEventError;
use crate::event::ComplianceEvent;
use crate::item::{ComplianceItem, DEFAULT_HISTORY_LEN};

type ItemMap = BTreeMap<ItemId, Arc<ComplianceItem>>;

/// Outcome of a successful [`StateStore::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// First event for the item.
    Inserted,
    /// Status differs from the previous one.
    StatusChanged {
        /// Status before the event.
        previous: ComplianceStatus,
    },
    /// Newer event with the same status (timestamp/revision/metadata moved).
    Refreshed,
}

impl Applied {
    /// True when downstream status projections need to change.
    pub fn status_changed(self) -> bool {
        !matches!(self, Applied::Refreshed)
    }
}

/// Immutable point-in-time view of the store.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    items: Arc<ItemMap>,
    max_sequence: Option<Sequence>,
}

impl StoreSnapshot {
    /// Items in id order.
    pub fn iter(&self) -> impl Iterator<Item = &ComplianceItem> + '_ {
        self.items.values().map(AsRef::as_ref)
    }

    /// Lookup by id.
    pub fn get(&self, id: &str) -> Option<&ComplianceItem> {
        self.items.get(id).map(AsRef::as_ref)
    }

    /// True when `id` is present.
    pub fn contains(&self, id: &str) -> bool {
        self.items.contains_key(id)
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when the store was empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Highest sequence applied since the last reset.
    pub fn max_sequence(&self) -> Option<Sequence> {
        self.max_sequence
    }

    /// Owned copy of every item.
    pub fn to_vec(&self) -> Vec<ComplianceItem> {
        self.iter().cloned().collect()
    }
}

/// Single-writer item store.
#[derive(Debug, Clone)]
pub struct StateStore {
    items: Arc<ItemMap>,
    tombstones: HashMap<ItemId, Sequence>,
    history_len: usize,
    max_sequence: Option<Sequence>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LEN)
    }
}

impl StateStore {
    /// Empty store keeping `history_len` history entries per item.
    pub fn new(history_len: usize) -> Self {
        Self {
            items: Arc::new(ItemMap::new()),
            tombstones: HashMap::new(),
            history_len,
            max_sequence: None,
        }
    }

    /// Apply an event if it is newer than what the item already holds.
    pub fn apply(&mut self, event: &ComplianceEvent) -> Result<Applied, StaleEventError> {
        let applied = match self.items.get(&event.id) {
            Some(item) => Some(item.sequence),
            None => self.tombstones.get(&event.id).copied(),
        };
        if let Some(applied) = applied {
            if event.sequence <= applied {
                return Err(StaleEventError {
                    id: event.id.clone(),
                    sequence: event.sequence,
                    applied,
                });
            }
        }
        self.tombstones.remove(&event.id);

        let items = Arc::make_mut(&mut self.items);
        let outcome = if let Some(slot) = items.get_mut(&event.id) {
            let item = Arc::make_mut(slot);
            let previous = item.status;
            item.absorb(event);
            if previous == event.status {
                Applied::Refreshed
            } else {
                Applied::StatusChanged { previous }
            }
        } else {
            items.insert(
                event.id.clone(),
                Arc::new(ComplianceItem::from_event(event, self.history_len)),
            );
            Applied::Inserted
        };
        self.max_sequence = self.max_sequence.max(Some(event.sequence));
        Ok(outcome)
    }

    /// Point-in-time view; O(1).
    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            items: Arc::clone(&self.items),
            max_sequence: self.max_sequence,
        }
    }

    /// Current item, if present.
    pub fn get(&self, id: &str) -> Option<&ComplianceItem> {
        self.items.get(id).map(AsRef::as_ref)
    }

    /// Retire an item; later events must beat its last sequence to revive it.
    pub fn remove(&mut self, id: &str) -> Option<ComplianceItem> {
        let removed = Arc::make_mut(&mut self.items).remove(id)?;
        self.tombstones.insert(removed.id.clone(), removed.sequence);
        Some(Arc::unwrap_or_clone(removed))
    }

    /// Drop all state (items, tombstones, sequence watermark).
    pub fn reset(&mut self) {
        self.items = Arc::new(ItemMap::new());
        self.tombstones.clear();
        self.max_sequence = None;
    }

    /// Number of live items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when no items are live.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Highest sequence applied since the last reset.
    pub fn max_sequence(&self) -> Option<Sequence> {
        self.max_sequence
    }
}
