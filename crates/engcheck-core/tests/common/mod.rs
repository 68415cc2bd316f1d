// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use engcheck_core::{ComplianceEvent, ComplianceStatus, StoreSnapshot};
use engcheck_proto::Value;

/// Fixed origin so timestamps stay readable in failures.
pub const EPOCH: i64 = 1_700_000_000;

/// `EPOCH + secs` as a UTC timestamp.
pub fn at(secs: i64) -> DateTime<Utc> {
    match Utc.timestamp_opt(EPOCH + secs, 0).single() {
        Some(ts) => ts,
        None => panic!("timestamp out of range: {secs}"),
    }
}

/// Event for `id` with timestamp derived from `seq`.
pub fn event(id: &str, seq: u64, status: ComplianceStatus) -> ComplianceEvent {
    let offset = i64::try_from(seq).unwrap_or(i64::MAX / 2);
    ComplianceEvent::new(id, status, at(offset), seq, format!("r{seq}")).with_category("electrical")
}

/// Raw map frame as it arrives on the stream.
pub fn frame(id: &str, seq: u64, status: &str) -> Value {
    let ts = at(i64::try_from(seq).unwrap_or(0)).to_rfc3339();
    Value::Map(vec![
        (Value::Text("id".into()), Value::Text(id.into())),
        (Value::Text("status".into()), Value::Text(status.into())),
        (Value::Text("timestamp".into()), Value::Text(ts)),
        (Value::Text("sequence".into()), Value::Integer(seq.into())),
        (Value::Text("revision".into()), Value::Text(format!("r{seq}"))),
    ])
}

/// Order-insensitive fingerprint of store content (history excluded).
pub fn fingerprint(snapshot: &StoreSnapshot) -> Vec<(String, ComplianceStatus, u64, String, DateTime<Utc>)> {
    snapshot
        .iter()
        .map(|item| {
            (
                item.id.clone(),
                item.status,
                item.sequence,
                item.revision.clone(),
                item.updated_at,
            )
        })
        .collect()
}

/// Status for a small index.
pub fn status_at(i: usize) -> ComplianceStatus {
    ComplianceStatus::ALL[i % ComplianceStatus::ALL.len()]
}
