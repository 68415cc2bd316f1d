// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Non-fatal error taxonomy of the event pipeline.
//!
//! None of these stop processing: malformed frames are dropped, stale events
//! are expected under redelivery, and late events are only counted.

use chrono::{DateTime, Utc};
use engcheck_proto::{ItemId, Sequence};
use thiserror::Error;

/// Inbound frame that could not be shaped into a `ComplianceEvent`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedEventError {
    /// The frame is not a key/value map.
    #[error("frame is not a map")]
    NotAMap,
    /// A required field is absent (or null).
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    /// A field is present but has the wrong shape or value.
    #[error("invalid field `{field}`: {reason}")]
    InvalidField {
        /// Offending field name.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}

/// Event whose sequence is not newer than what the store already holds.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("stale event for {id}: sequence {sequence} <= applied {applied}")]
pub struct StaleEventError {
    /// Item the event targets.
    pub id: ItemId,
    /// Sequence carried by the discarded event.
    pub sequence: Sequence,
    /// Sequence already applied (or tombstoned) for the item.
    pub applied: Sequence,
}

/// Event older than the timeline's lateness window.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("late event for {id} at {timestamp} dropped (watermark {watermark})")]
pub struct LateDroppedEvent {
    /// Item the event targets.
    pub id: ItemId,
    /// Event timestamp.
    pub timestamp: DateTime<Utc>,
    /// Newest timestamp the aggregator had seen.
    pub watermark: DateTime<Utc>,
}

/// Invalid `series` request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimelineError {
    /// Interval is zero or not a multiple of the base bucket width.
    #[error("interval of {interval_secs}s is not a positive multiple of the {bucket_secs}s bucket width")]
    BadInterval {
        /// Requested interval (seconds).
        interval_secs: i64,
        /// Base bucket width (seconds).
        bucket_secs: i64,
    },
    /// Range end precedes its start.
    #[error("empty or inverted range")]
    BadRange,
}

/// Failure feeding one raw frame through the reconciler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IngestError {
    /// Frame was dropped by the normalizer.
    #[error(transparent)]
    Malformed(#[from] MalformedEventError),
    /// Event was discarded by the store.
    #[error(transparent)]
    Stale(#[from] StaleEventError),
}
