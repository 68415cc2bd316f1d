// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Table and JSON rendering for command results.

use anyhow::{Context, Result};
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};
use engcheck_core::standards::{Finding, Standard};
use engcheck_core::{AggregateBucket, ComplianceStatus, View};
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Table,
    Json,
}

impl Format {
    pub fn from_flag(json: bool) -> Self {
        if json {
            Self::Json
        } else {
            Self::Table
        }
    }
}

fn table(header: &[&str]) -> Table {
    let mut t = Table::new();
    t.load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header.iter().map(Cell::new));
    t
}

fn emit_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("serialize output")?);
    Ok(())
}

fn items_table(view: &View) -> Table {
    let mut t = table(&["id", "status", "category", "sequence", "updated", "description"]);
    for item in view.snapshot().iter() {
        t.add_row(vec![
            item.id.clone(),
            item.status.as_str().to_string(),
            item.category.clone(),
            item.sequence.to_string(),
            item.updated_at.to_rfc3339(),
            item.description.text.clone(),
        ]);
    }
    t
}

/// Final store contents.
pub fn store(view: &View, format: Format) -> Result<()> {
    match format {
        Format::Json => emit_json(&json!({
            "items": view.snapshot().to_vec(),
            "stats": view.stats(),
        })),
        Format::Table => {
            println!("{}", items_table(view));
            let s = view.stats();
            println!(
                "{} items; applied {}, stale {}, malformed {}, late {}",
                view.snapshot().len(),
                s.applied,
                s.stale,
                s.malformed,
                s.late_dropped
            );
            Ok(())
        }
    }
}

/// Series over every recorded transition; empty when the store is.
fn series_for(view: &View, interval: i64) -> Result<Vec<AggregateBucket>> {
    let stamps = view
        .snapshot()
        .iter()
        .flat_map(|item| item.history.iter().map(|e| e.timestamp))
        .collect::<Vec<_>>();
    let (Some(first), Some(last)) = (stamps.iter().min(), stamps.iter().max()) else {
        return Ok(Vec::new());
    };
    let end = *last + chrono::Duration::seconds(1);
    view.series(*first..end, chrono::Duration::seconds(interval))
        .context("build status series")
}

fn series_table(series: &[AggregateBucket]) -> Table {
    let mut header = vec!["interval"];
    header.extend(ComplianceStatus::ALL.iter().map(|s| s.as_str()));
    let mut t = table(&header);
    for chunk in series.chunks(ComplianceStatus::ALL.len()) {
        let Some(first) = chunk.first() else { continue };
        let mut row = vec![first.start.to_rfc3339()];
        row.extend(chunk.iter().map(|b| b.count.to_string()));
        t.add_row(row);
    }
    t
}

/// Replay result: store, optional search hits, optional series.
pub fn replay(view: &View, query: Option<&str>, interval: Option<i64>, format: Format) -> Result<()> {
    let hits = query.map(|q| view.query_scored(q));
    let series = interval.map(|secs| series_for(view, secs)).transpose()?;
    if format == Format::Json {
        return emit_json(&json!({
            "items": view.snapshot().to_vec(),
            "stats": view.stats(),
            "hits": hits,
            "series": series,
        }));
    }

    store(view, Format::Table)?;
    if let (Some(q), Some(hits)) = (query, &hits) {
        let mut t = table(&["id", "score", "updated"]);
        for hit in hits {
            t.add_row(vec![hit.id.clone(), format!("{:.2}", hit.score), hit.updated_at.to_rfc3339()]);
        }
        println!("query {q:?}: {} hit(s)", hits.len());
        println!("{t}");
    }
    if let Some(series) = &series {
        println!("{}", series_table(series));
    }
    Ok(())
}

/// Standards applicable to `project`.
pub fn checklist(project: &str, checklist: &[Standard], format: Format) -> Result<()> {
    if format == Format::Json {
        return emit_json(&json!({ "project": project, "checklist": checklist }));
    }
    if checklist.is_empty() {
        println!("No standards apply to project type {project:?}.");
        return Ok(());
    }
    let mut t = table(&["id", "description", "keywords"]);
    for s in checklist {
        t.add_row(vec![s.id.clone(), s.description.clone(), s.keywords.join(", ")]);
    }
    println!("{t}");
    Ok(())
}

/// Document check outcome, as reconciled items.
pub fn findings(view: &View, findings: &[Finding], checked: usize, format: Format) -> Result<()> {
    if format == Format::Json {
        return emit_json(&json!({
            "checked": checked,
            "findings": findings,
            "items": view.snapshot().to_vec(),
        }));
    }
    if findings.is_empty() {
        println!("No issues found ({checked} standard(s) checked).");
    } else {
        println!("{} of {checked} standard(s) not addressed:", findings.len());
    }
    println!("{}", items_table(view));
    Ok(())
}
