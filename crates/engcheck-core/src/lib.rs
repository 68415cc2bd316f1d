// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! engcheck-core: reconciliation of a live compliance-event stream.
//!
//! Raw frames are shaped by [`normalize`], applied to the [`StateStore`]
//! under a sequence-ordered merge policy, and projected into a fuzzy
//! [`SearchIndex`] and a [`TimelineAggregator`]. The [`Reconciler`] ties the
//! pieces together as a single writer and publishes immutable [`View`]s.
#![forbid(unsafe_code)]

pub mod error;
pub mod event;
pub mod item;
pub mod reconcile;
pub mod render;
pub mod search;
pub mod standards;
pub mod store;
pub mod timeline;

pub use error::{IngestError, LateDroppedEvent, MalformedEventError, StaleEventError, TimelineError};
pub use event::{normalize, ComplianceEvent};
pub use item::{ComplianceItem, HistoryEntry, StatusHistory};
pub use reconcile::{Reconciler, ReconcilerConfig, SnapshotLoad, Stats, View};
pub use render::{render_markdown, Description, SanitizedHtml};
pub use search::{SearchDocument, SearchHit, SearchIndex};
pub use store::{Applied, StateStore, StoreSnapshot};
pub use timeline::{AggregateBucket, TimelineAggregator};

pub use engcheck_proto::{ComplianceStatus, ItemId, Revision, Sequence};
