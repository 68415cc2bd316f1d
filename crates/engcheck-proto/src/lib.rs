// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Wire schema for the EngCheck compliance stream.
//!
//! Inbound event frames stay untyped (`ciborium::Value`) on the wire; the
//! core's normalizer owns validation. Control frames (handshake, subscribe,
//! snapshot request/response) are typed and versioned by the same
//! `sequence`/`revision` scheme as events. Everything travels inside a
//! checksummed packet, see [`wire`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

pub use ciborium::Value;

pub mod wire;

/// Stable identity of a compliance item.
pub type ItemId = String;
/// Stream-wide monotonic sequence number (also monotonic per item).
pub type Sequence = u64;
/// Source revision tag attached by the producer.
pub type Revision = String;
/// Blake3 state hash (32 bytes).
pub type Hash32 = [u8; 32];

/// `engcheck-stream.sock` under `$XDG_RUNTIME_DIR`, or `/tmp` if unset.
pub fn default_socket_path() -> PathBuf {
    let base = std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"));
    base.join("engcheck-stream.sock")
}

/// Closed set of compliance states.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ComplianceStatus {
    /// Item satisfies its rule set.
    Compliant,
    /// Item drifted but is not yet in breach.
    Warning,
    /// Item is in breach.
    Critical,
    /// No reliable verdict.
    Unknown,
}

impl ComplianceStatus {
    /// Every status, in display/bucket order.
    pub const ALL: [ComplianceStatus; 4] = [
        ComplianceStatus::Compliant,
        ComplianceStatus::Warning,
        ComplianceStatus::Critical,
        ComplianceStatus::Unknown,
    ];

    /// Canonical lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            ComplianceStatus::Compliant => "compliant",
            ComplianceStatus::Warning => "warning",
            ComplianceStatus::Critical => "critical",
            ComplianceStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ComplianceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a status string is outside the closed set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown compliance status: {0:?}")]
pub struct UnknownStatus(pub String);

impl FromStr for ComplianceStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "compliant" => Ok(ComplianceStatus::Compliant),
            "warning" => Ok(ComplianceStatus::Warning),
            "critical" => Ok(ComplianceStatus::Critical),
            "unknown" => Ok(ComplianceStatus::Unknown),
            _ => Err(UnknownStatus(s.to_string())),
        }
    }
}

/// CBOR body of every packet: an `op` tag, the sender's send counter, and the body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OpEnvelope<P> {
    /// Frame kind; see [`Message::op_name`].
    pub op: String,
    /// Sender-local counter, strictly increasing.
    pub ts: u64,
    /// Body for `op`.
    pub payload: P,
}

/// Notification severity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NotifyKind {
    /// Informational.
    Info,
    /// Needs attention.
    Warn,
    /// Something failed upstream.
    Error,
}

/// Free-form notice pushed by the producer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notification {
    /// Severity.
    pub kind: NotifyKind,
    /// One-line summary.
    pub title: String,
    /// Structured context, if any.
    pub body: Option<String>,
}

/// Producer-side failure, sent alone or inside a rejected handshake ack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorPayload {
    /// Numeric error code.
    pub code: u32,
    /// Stable identifier (e.g., "E_UNSUPPORTED").
    pub name: String,
    /// Structured context, if any.
    pub details: Option<Value>,
    /// Message for logs.
    pub message: String,
}

/// Handshake request payload (client → producer).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakePayload {
    /// Monitor instance name, for producer logs.
    pub agent_id: Option<String>,
    /// Capability identifiers.
    pub capabilities: Vec<String>,
    /// Client build version; the packet header carries the wire version.
    pub client_version: u32,
}

/// Handshake verdict.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum AckStatus {
    /// Session opened.
    #[serde(rename = "OK")]
    Ok,
    /// Session refused; see `error`.
    #[serde(rename = "ERROR")]
    Error,
}

/// Handshake acknowledgement payload (producer → client).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HandshakeAckPayload {
    /// Verdict.
    pub status: AckStatus,
    /// Server implementation version.
    pub server_version: u32,
    /// Producer-assigned session id.
    pub session_id: String,
    /// Refusal reason when `status` is `Error`.
    pub error: Option<ErrorPayload>,
}

/// Subscription filter (client → producer). Empty means every category.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SubscribePayload {
    /// Categories of interest.
    pub categories: Vec<String>,
}

/// Snapshot request (client → producer).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SnapshotRequestPayload {
    /// Last sequence the client applied, if any.
    pub last_known_sequence: Option<Sequence>,
}

/// Full authoritative state at `sequence`.
///
/// Items use the same untyped shape as event frames (plus the optional
/// `category`/`description` fields) so both flow through one normalizer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotPayload {
    /// Stream sequence this snapshot is consistent with.
    pub sequence: Sequence,
    /// Producer revision.
    pub revision: Revision,
    /// One raw item frame per compliance item.
    pub items: Vec<Value>,
    /// Optional blake3 hash over the canonical CBOR of `items`.
    pub state_hash: Option<Hash32>,
}

impl SnapshotPayload {
    /// Build a snapshot and stamp its state hash.
    pub fn new(sequence: Sequence, revision: impl Into<Revision>, items: Vec<Value>) -> Result<Self, wire::WireError> {
        let state_hash = Some(compute_items_hash(&items)?);
        Ok(Self {
            sequence,
            revision: revision.into(),
            items,
            state_hash,
        })
    }

    /// True when no hash is attached or the attached hash matches the items.
    pub fn verify(&self) -> Result<bool, wire::WireError> {
        match self.state_hash {
            None => Ok(true),
            Some(expected) => Ok(compute_items_hash(&self.items)? == expected),
        }
    }
}

/// Blake3 over the CBOR encoding of the item list.
pub fn compute_items_hash(items: &[Value]) -> Result<Hash32, wire::WireError> {
    let bytes = wire::to_cbor(&items)?;
    Ok(blake3::hash(&bytes).into())
}

/// Every frame the compliance stream carries, keyed by `op`.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Handshake request (op = "handshake").
    Handshake(HandshakePayload),
    /// Handshake acknowledgement (op = "handshake_ack").
    HandshakeAck(HandshakeAckPayload),
    /// Protocol or processing error (op = "error").
    Error(ErrorPayload),
    /// Category subscription (op = "subscribe").
    Subscribe(SubscribePayload),
    /// Ask the producer for a full snapshot (op = "request_snapshot").
    RequestSnapshot(SnapshotRequestPayload),
    /// Full snapshot (op = "snapshot").
    Snapshot(SnapshotPayload),
    /// Incremental compliance event, untyped until normalized (op = "event").
    Event(Value),
    /// Notification broadcast (op = "notification").
    Notification(Notification),
}

impl Message {
    /// The `op` string this variant travels under.
    pub fn op_name(&self) -> &'static str {
        match self {
            Message::Handshake(_) => "handshake",
            Message::HandshakeAck(_) => "handshake_ack",
            Message::Error(_) => "error",
            Message::Subscribe(_) => "subscribe",
            Message::RequestSnapshot(_) => "request_snapshot",
            Message::Snapshot(_) => "snapshot",
            Message::Event(_) => "event",
            Message::Notification(_) => "notification",
        }
    }
}
