// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Canonical compliance events and the normalizer that shapes raw frames.

use chrono::{DateTime, NaiveDateTime, Utc};
use engcheck_proto::{ComplianceStatus, ItemId, Revision, Sequence, Value};
use serde::Serialize;

use crate::error::MalformedEventError;
use crate::render::{render_markdown, Description};

/// Immutable, validated status change for one compliance item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComplianceEvent {
    /// Target item.
    pub id: ItemId,
    /// New status.
    pub status: ComplianceStatus,
    /// When the check produced the status.
    pub timestamp: DateTime<Utc>,
    /// Stream sequence.
    pub sequence: Sequence,
    /// Producer revision.
    pub revision: Revision,
    /// Category, when the frame carries one.
    pub category: Option<String>,
    /// Rendered description, when the frame carries one.
    pub description: Option<Description>,
}

impl ComplianceEvent {
    /// Event with only the required fields set.
    pub fn new(
        id: impl Into<ItemId>,
        status: ComplianceStatus,
        timestamp: DateTime<Utc>,
        sequence: Sequence,
        revision: impl Into<Revision>,
    ) -> Self {
        Self {
            id: id.into(),
            status,
            timestamp,
            sequence,
            revision: revision.into(),
            category: None,
            description: None,
        }
    }

    /// Attach a category.
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Attach a markdown description (rendered immediately).
    pub fn with_description(mut self, markdown: &str) -> Self {
        self.description = Some(render_markdown(markdown));
        self
    }
}

/// Shape an untyped frame into a [`ComplianceEvent`].
///
/// Required: `id`, `status`, `timestamp`, `sequence`, `revision`.
/// Optional: `category`, `description` (markdown).
pub fn normalize(raw: &Value) -> Result<ComplianceEvent, MalformedEventError> {
    let Value::Map(entries) = raw else {
        return Err(MalformedEventError::NotAMap);
    };
    let field = |name: &'static str| -> Option<&Value> {
        entries
            .iter()
            .find(|(k, _)| matches!(k, Value::Text(key) if key == name))
            .map(|(_, v)| v)
            .filter(|v| !v.is_null())
    };
    let required = |name: &'static str| field(name).ok_or(MalformedEventError::MissingField(name));

    let id = text(required("id")?, "id")?;
    if id.trim().is_empty() {
        return Err(invalid("id", "empty identifier"));
    }

    let status = text(required("status")?, "status")?
        .parse::<ComplianceStatus>()
        .map_err(|e| invalid("status", e.to_string()))?;

    let timestamp = parse_timestamp(text(required("timestamp")?, "timestamp")?)?;

    let sequence = match required("sequence")? {
        Value::Integer(i) => u64::try_from(*i).map_err(|_| invalid("sequence", "must be a non-negative integer"))?,
        _ => return Err(invalid("sequence", "expected integer")),
    };

    let revision = match required("revision")? {
        Value::Text(s) => s.clone(),
        Value::Integer(i) => i128::from(*i).to_string(),
        _ => return Err(invalid("revision", "expected text")),
    };

    let category = field("category")
        .map(|v| text(v, "category"))
        .transpose()?
        .map(str::to_string);
    let description = field("description")
        .map(|v| text(v, "description"))
        .transpose()?
        .map(render_markdown);

    Ok(ComplianceEvent {
        id: id.to_string(),
        status,
        timestamp,
        sequence,
        revision,
        category,
        description,
    })
}

fn invalid(field: &'static str, reason: impl Into<String>) -> MalformedEventError {
    MalformedEventError::InvalidField {
        field,
        reason: reason.into(),
    }
}

fn text<'a>(v: &'a Value, field: &'static str) -> Result<&'a str, MalformedEventError> {
    v.as_text().ok_or_else(|| invalid(field, "expected text"))
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, MalformedEventError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    // ISO 8601 without an offset is taken as UTC.
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| invalid("timestamp", e.to_string()))
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    fn frame(fields: &[(&str, Value)]) -> Value {
        Value::Map(
            fields
                .iter()
                .map(|(k, v)| (Value::Text((*k).to_string()), v.clone()))
                .collect(),
        )
    }

    fn base() -> Vec<(&'static str, Value)> {
        vec![
            ("id", Value::Text("NEC-100".into())),
            ("status", Value::Text("warning".into())),
            ("timestamp", Value::Text("2024-03-01T12:00:00+01:00".into())),
            ("sequence", Value::Integer(42.into())),
            ("revision", Value::Text("r7".into())),
        ]
    }

    #[test]
    fn well_formed_frame_normalizes() {
        let mut fields = base();
        fields.push(("category", Value::Text("electrical".into())));
        fields.push(("description", Value::Text("Bond *all* panels".into())));
        let ev = normalize(&frame(&fields)).unwrap();
        assert_eq!(ev.id, "NEC-100");
        assert_eq!(ev.status, ComplianceStatus::Warning);
        assert_eq!(ev.sequence, 42);
        assert_eq!(ev.timestamp.to_rfc3339(), "2024-03-01T11:00:00+00:00");
        assert_eq!(ev.category.as_deref(), Some("electrical"));
        assert_eq!(ev.description.unwrap().text, "Bond all panels");
    }

    #[test]
    fn offsetless_timestamp_is_utc() {
        let mut fields = base();
        fields[2].1 = Value::Text("2024-03-01T12:00:00".into());
        let ev = normalize(&frame(&fields)).unwrap();
        assert_eq!(ev.timestamp.to_rfc3339(), "2024-03-01T12:00:00+00:00");
    }

    #[test]
    fn each_required_field_is_enforced() {
        for skip in ["id", "status", "timestamp", "sequence", "revision"] {
            let fields: Vec<_> = base().into_iter().filter(|(k, _)| *k != skip).collect();
            assert_eq!(
                normalize(&frame(&fields)),
                Err(MalformedEventError::MissingField(skip)),
                "field {skip}"
            );
        }
    }

    #[test]
    fn bad_values_are_rejected_with_field_name() {
        let cases = [
            (1usize, Value::Text("green".into()), "status"),
            (2, Value::Text("yesterday".into()), "timestamp"),
            (3, Value::Integer((-1).into()), "sequence"),
            (3, Value::Text("4".into()), "sequence"),
            (0, Value::Text("  ".into()), "id"),
        ];
        for (idx, value, name) in cases {
            let mut fields = base();
            fields[idx].1 = value;
            match normalize(&frame(&fields)) {
                Err(MalformedEventError::InvalidField { field, .. }) => assert_eq!(field, name),
                other => panic!("expected invalid {name}, got {other:?}"),
            }
        }
        assert_eq!(normalize(&Value::Array(vec![])), Err(MalformedEventError::NotAMap));
    }

    #[test]
    fn null_counts_as_missing() {
        let mut fields = base();
        fields[4].1 = Value::Null;
        assert_eq!(
            normalize(&frame(&fields)),
            Err(MalformedEventError::MissingField("revision"))
        );
    }
}
