// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Standards catalogue, project checklists and keyword document checks.
//!
//! A document check yields one [`Finding`] per checklist entry none of whose
//! keywords occur in the text. [`findings_to_events`] turns the outcome into
//! ordinary compliance events so it can flow through the reconciler.

use chrono::{DateTime, Utc};
use engcheck_proto::{ComplianceStatus, Sequence};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::event::ComplianceEvent;

/// One catalogue entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Standard {
    /// Standard identifier (e.g. `NEC-100`).
    pub id: String,
    /// Requirement text (markdown).
    pub description: String,
    /// Project types the standard applies to.
    pub projects: Vec<String>,
    /// Evidence keywords; any one present in a document satisfies the entry.
    pub keywords: Vec<String>,
}

impl Standard {
    /// True when the standard lists `project` (ASCII case-insensitive).
    pub fn applies_to(&self, project: &str) -> bool {
        let project = project.trim();
        self.projects.iter().any(|p| p.eq_ignore_ascii_case(project))
    }

    /// True when any keyword occurs in `lowered` (already lowercased text).
    fn satisfied_by(&self, lowered: &str) -> bool {
        self.keywords
            .iter()
            .any(|kw| lowered.contains(&kw.to_lowercase()))
    }
}

/// Errors loading a catalogue.
#[derive(Debug, Error)]
pub enum StandardsError {
    /// Catalogue file could not be read.
    #[error("failed to read standards from {}: {source}", .path.display())]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// Catalogue is not a JSON array of standards.
    #[error("invalid standards catalogue: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Parse a JSON array of standards.
pub fn parse_standards(json: &str) -> Result<Vec<Standard>, StandardsError> {
    Ok(serde_json::from_str(json)?)
}

/// Read and parse a catalogue file.
pub fn load_standards(path: &Path) -> Result<Vec<Standard>, StandardsError> {
    let json = std::fs::read_to_string(path).map_err(|source| StandardsError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_standards(&json)
}

/// Standards applicable to `project`, in catalogue order.
pub fn filter_by_project<'a>(standards: &'a [Standard], project: &str) -> Vec<&'a Standard> {
    standards.iter().filter(|s| s.applies_to(project)).collect()
}

/// Owned checklist for `project`.
pub fn generate_checklist(standards: &[Standard], project: &str) -> Vec<Standard> {
    filter_by_project(standards, project)
        .into_iter()
        .cloned()
        .collect()
}

/// Checklist entry missing from a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    /// Standard id.
    pub item: String,
    /// Standard description.
    pub message: String,
}

/// Flag every checklist entry whose keywords are all absent from `text`.
pub fn check_document(text: &str, checklist: &[Standard]) -> Vec<Finding> {
    let lowered = text.to_lowercase();
    checklist
        .iter()
        .filter(|s| !s.satisfied_by(&lowered))
        .map(|s| Finding {
            item: s.id.clone(),
            message: s.description.clone(),
        })
        .collect()
}

/// Stamp applied to events produced from a document check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventStamp {
    /// Category given to every event (usually the project type).
    pub category: String,
    /// Check time.
    pub timestamp: DateTime<Utc>,
    /// Sequence of the first event; the rest follow contiguously.
    pub first_sequence: Sequence,
    /// Revision tag (e.g. document digest).
    pub revision: String,
}

/// One event per checklist entry: `critical` when flagged, else `compliant`.
pub fn findings_to_events(
    checklist: &[Standard],
    findings: &[Finding],
    stamp: &EventStamp,
) -> Vec<ComplianceEvent> {
    checklist
        .iter()
        .zip(stamp.first_sequence..)
        .map(|(standard, sequence)| {
            let flagged = findings.iter().any(|f| f.item == standard.id);
            let status = if flagged {
                ComplianceStatus::Critical
            } else {
                ComplianceStatus::Compliant
            };
            ComplianceEvent::new(
                standard.id.clone(),
                status,
                stamp.timestamp,
                sequence,
                stamp.revision.clone(),
            )
            .with_category(stamp.category.clone())
            .with_description(&standard.description)
        })
        .collect()
}
