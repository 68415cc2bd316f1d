// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Fuzzy-searchable projection of the store.
//!
//! Terms live in a sorted inverted index (exact and prefix lookups) plus a
//! deletion-neighbourhood index: every term is registered under each string
//! obtained by deleting up to its typo budget of characters (none past
//! [`MAX_FUZZY_TERM_LEN`]), so typo candidates are
//! found by looking up the query's own deletions instead of scanning the
//! vocabulary. Candidates are confirmed with a bounded Levenshtein distance.
//! Identifiers additionally get a skim-style subsequence match.

use chrono::{DateTime, Utc};
use engcheck_proto::{ComplianceStatus, ItemId};
use fuzzy_matcher::skim::SkimMatcherV2;
use fuzzy_matcher::FuzzyMatcher;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::item::ComplianceItem;
use crate::store::StoreSnapshot;

/// Default upper bound on edits tolerated per query token.
pub const DEFAULT_MAX_TYPOS: u8 = 2;

const EXACT_SCORE: f64 = 1.0;
const PREFIX_SCORE: f64 = 0.75;
const TYPO_PENALTY: f64 = 0.3;
const ID_FUZZY_BONUS: f64 = 0.5;
/// Longer terms are matched exactly or by prefix only.
pub const MAX_FUZZY_TERM_LEN: usize = 32;

/// Disposable, derived view of one item used for indexing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchDocument {
    /// Item id.
    pub id: ItemId,
    /// Item category.
    pub category: String,
    /// Item status.
    pub status: ComplianceStatus,
    /// Searchable plain text (id, category, status, description).
    pub text: String,
    /// Item update time, used to break score ties.
    pub updated_at: DateTime<Utc>,
}

impl SearchDocument {
    /// Project an item.
    pub fn from_item(item: &ComplianceItem) -> Self {
        let text = [
            item.id.as_str(),
            item.category.as_str(),
            item.status.as_str(),
            item.description.text.as_str(),
        ]
        .join(" ");
        Self {
            id: item.id.clone(),
            category: item.category.clone(),
            status: item.status,
            text,
            updated_at: item.updated_at,
        }
    }
}

/// One ranked result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    /// Matching item.
    pub id: ItemId,
    /// Relevance (higher is better).
    pub score: f64,
    /// Tie-breaker.
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Indexed {
    doc: SearchDocument,
    terms: BTreeSet<String>,
}

/// Incrementally maintained fuzzy index.
#[derive(Debug, Clone)]
pub struct SearchIndex {
    docs: HashMap<ItemId, Indexed>,
    postings: BTreeMap<String, BTreeSet<ItemId>>,
    deletes: HashMap<String, BTreeSet<String>>,
    max_typos: u8,
}

impl Default for SearchIndex {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TYPOS)
    }
}

impl SearchIndex {
    /// Empty index tolerating at most `max_typos` edits per token.
    pub fn new(max_typos: u8) -> Self {
        Self {
            docs: HashMap::new(),
            postings: BTreeMap::new(),
            deletes: HashMap::new(),
            max_typos,
        }
    }

    /// Number of indexed documents.
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    /// True when nothing is indexed.
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// True when `id` is indexed.
    pub fn contains(&self, id: &str) -> bool {
        self.docs.contains_key(id)
    }

    /// Indexed projection of `id`.
    pub fn document(&self, id: &str) -> Option<&SearchDocument> {
        self.docs.get(id).map(|d| &d.doc)
    }

    /// (Re)index one item, touching only the terms that changed.
    pub fn update(&mut self, item: &ComplianceItem) {
        let doc = SearchDocument::from_item(item);
        let terms: BTreeSet<String> = tokenize(&doc.text).collect();
        let old_terms = self
            .docs
            .remove(&doc.id)
            .map(|old| old.terms)
            .unwrap_or_default();

        for gone in old_terms.difference(&terms) {
            self.unlink(gone, &doc.id);
        }
        for added in terms.difference(&old_terms) {
            self.link(added, &doc.id);
        }
        self.docs.insert(doc.id.clone(), Indexed { doc, terms });
    }

    /// Drop `id` from the index.
    pub fn remove(&mut self, id: &str) -> bool {
        let Some(old) = self.docs.remove(id) else {
            return false;
        };
        for term in &old.terms {
            self.unlink(term, id);
        }
        true
    }

    /// Replace the whole index with the contents of `snapshot`.
    pub fn rebuild(&mut self, snapshot: &StoreSnapshot) {
        self.docs.clear();
        self.postings.clear();
        self.deletes.clear();
        for item in snapshot.iter() {
            self.update(item);
        }
    }

    /// Ranked ids for `text`.
    pub fn query(&self, text: &str) -> Vec<ItemId> {
        self.query_scored(text).into_iter().map(|h| h.id).collect()
    }

    /// Ranked hits for `text`: score desc, then most recent update, then id.
    pub fn query_scored(&self, text: &str) -> Vec<SearchHit> {
        let mut seen = HashSet::new();
        let tokens: Vec<String> = tokenize(text).filter(|t| seen.insert(t.clone())).collect();
        if tokens.is_empty() {
            return Vec::new();
        }

        let mut totals: HashMap<&str, f64> = HashMap::new();
        for token in &tokens {
            for (id, score) in self.score_token(token) {
                *totals.entry(id).or_insert(0.0) += score;
            }
        }

        let compact: String = tokens.concat();
        let matcher = SkimMatcherV2::default();
        for id in self.docs.keys() {
            if matcher.fuzzy_match(id, &compact).is_some() {
                *totals.entry(id.as_str()).or_insert(0.0) += ID_FUZZY_BONUS;
            }
        }

        let mut hits: Vec<SearchHit> = totals
            .into_iter()
            .filter_map(|(id, score)| {
                self.docs.get(id).map(|d| SearchHit {
                    id: d.doc.id.clone(),
                    score,
                    updated_at: d.doc.updated_at,
                })
            })
            .collect();
        hits.sort_by(rank);
        hits
    }

    /// Best per-document score for one query token.
    fn score_token<'a>(&'a self, token: &str) -> HashMap<&'a str, f64> {
        let mut best: HashMap<&'a str, f64> = HashMap::new();
        let mut credit = |ids: &'a BTreeSet<ItemId>, score: f64| {
            for id in ids {
                let slot = best.entry(id.as_str()).or_insert(0.0);
                if score > *slot {
                    *slot = score;
                }
            }
        };

        if let Some(ids) = self.postings.get(token) {
            credit(ids, EXACT_SCORE);
        }

        let chars: Vec<char> = token.chars().collect();
        if chars.len() >= 2 {
            for (_, ids) in self
                .postings
                .range::<str, _>((std::ops::Bound::Excluded(token), std::ops::Bound::Unbounded))
                .take_while(|(term, _)| term.starts_with(token))
            {
                credit(ids, PREFIX_SCORE);
            }
        }

        let budget = self.delete_budget(chars.len());
        if budget == 0 {
            return best;
        }
        let mut candidates: BTreeSet<&'a str> = BTreeSet::new();
        for variant in deletions(&chars, budget) {
            if let Some(terms) = self.deletes.get(&variant) {
                candidates.extend(terms.iter().map(String::as_str));
            }
        }
        for term in candidates {
            if term == token {
                continue;
            }
            let term_chars: Vec<char> = term.chars().collect();
            if let Some(distance) = bounded_levenshtein(&chars, &term_chars, budget) {
                if let Some(ids) = self.postings.get(term) {
                    credit(ids, EXACT_SCORE - TYPO_PENALTY * distance as f64);
                }
            }
        }
        best
    }

    /// Deletions indexed for, and tolerated in, a term of `len` characters.
    fn delete_budget(&self, len: usize) -> usize {
        if len > MAX_FUZZY_TERM_LEN {
            return 0;
        }
        typo_budget(len).min(usize::from(self.max_typos))
    }

    fn link(&mut self, term: &str, id: &str) {
        let ids = self.postings.entry(term.to_string()).or_default();
        let fresh_term = ids.is_empty();
        ids.insert(id.to_string());
        if fresh_term {
            let chars: Vec<char> = term.chars().collect();
            let budget = self.delete_budget(chars.len());
            if budget == 0 {
                return;
            }
            for variant in deletions(&chars, budget) {
                self.deletes
                    .entry(variant)
                    .or_default()
                    .insert(term.to_string());
            }
        }
    }

    fn unlink(&mut self, term: &str, id: &str) {
        let Some(ids) = self.postings.get_mut(term) else {
            return;
        };
        ids.remove(id);
        if !ids.is_empty() {
            return;
        }
        self.postings.remove(term);
        let chars: Vec<char> = term.chars().collect();
        let budget = self.delete_budget(chars.len());
        if budget == 0 {
            return;
        }
        for variant in deletions(&chars, budget) {
            if let Some(terms) = self.deletes.get_mut(&variant) {
                terms.remove(term);
                if terms.is_empty() {
                    self.deletes.remove(&variant);
                }
            }
        }
    }
}

fn rank(a: &SearchHit, b: &SearchHit) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| b.updated_at.cmp(&a.updated_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// Edits tolerated for a query token of `len` characters.
fn typo_budget(len: usize) -> usize {
    match len {
        0..=3 => 0,
        4..=7 => 1,
        _ => 2,
    }
}

/// Lowercased alphanumeric runs.
pub(crate) fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
}

/// `word` plus every non-empty string reachable by deleting up to `max` chars.
fn deletions(word: &[char], max: usize) -> HashSet<String> {
    let mut out = HashSet::new();
    out.insert(word.iter().collect::<String>());
    let mut frontier: Vec<Vec<char>> = vec![word.to_vec()];
    for _ in 0..max {
        let mut next = Vec::new();
        for w in &frontier {
            if w.len() <= 1 {
                continue;
            }
            for i in 0..w.len() {
                let mut shorter = w.clone();
                shorter.remove(i);
                if out.insert(shorter.iter().collect()) {
                    next.push(shorter);
                }
            }
        }
        frontier = next;
    }
    out
}

/// Levenshtein distance if it is at most `max`.
fn bounded_levenshtein(a: &[char], b: &[char], max: usize) -> Option<usize> {
    if a.len().abs_diff(b.len()) > max {
        return None;
    }
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut cur = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        cur[0] = i + 1;
        let mut row_min = cur[0];
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            cur[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(cur[j] + 1);
            row_min = row_min.min(cur[j + 1]);
        }
        if row_min > max {
            return None;
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    let d = prev[b.len()];
    (d <= max).then_some(d)
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::event::ComplianceEvent;
    use crate::store::StateStore;
    use chrono::TimeZone;

    fn store_with(entries: &[(&str, &str, &str, i64)]) -> StateStore {
        let mut store = StateStore::default();
        for (seq, (id, category, desc, ts)) in entries.iter().enumerate() {
            let ev = ComplianceEvent::new(
                *id,
                ComplianceStatus::Warning,
                Utc.timestamp_opt(*ts, 0).single().unwrap(),
                seq as u64 + 1,
                "r1",
            )
            .with_category(*category)
            .with_description(desc);
            store.apply(&ev).unwrap();
        }
        store
    }

    fn indexed(store: &StateStore) -> SearchIndex {
        let mut index = SearchIndex::default();
        index.rebuild(&store.snapshot());
        index
    }

    #[test]
    fn levenshtein_is_bounded() {
        let a: Vec<char> = "grounding".chars().collect();
        let b: Vec<char> = "grondung".chars().collect();
        assert_eq!(bounded_levenshtein(&a, &b, 2), Some(2));
        assert_eq!(bounded_levenshtein(&a, &b, 1), None);
        assert_eq!(bounded_levenshtein(&a, &a, 0), Some(0));
    }

    #[test]
    fn typo_tolerant_match_ranks_below_exact() {
        let store = store_with(&[
            ("NEC-250", "electrical", "Grounding of panels", 100),
            ("OSHA-1910", "safety", "Grouting of floors", 100),
        ]);
        let index = indexed(&store);

        let hits = index.query_scored("grounding");
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "NEC-250");
        assert_eq!(hits[1].id, "OSHA-1910");
        assert!(hits[0].score > hits[1].score);

        let typo = index.query("grondung");
        assert_eq!(typo, vec!["NEC-250".to_string()]);
    }

    #[test]
    fn short_tokens_need_exact_or_prefix() {
        let store = store_with(&[("IEC-1", "electrical", "arc flash", 100)]);
        let index = indexed(&store);
        assert_eq!(index.query("arc"), vec!["IEC-1".to_string()]);
        assert_eq!(index.query("fla"), vec!["IEC-1".to_string()]);
        assert!(index.query("arx").is_empty());
    }

    #[test]
    fn ties_break_by_most_recent_update() {
        let store = store_with(&[
            ("A-1", "fire", "sprinkler check", 100),
            ("B-1", "fire", "sprinkler check", 300),
            ("C-1", "fire", "sprinkler check", 200),
        ]);
        let index = indexed(&store);
        assert_eq!(index.query("sprinkler"), vec!["B-1", "C-1", "A-1"]);
    }

    #[test]
    fn identifier_subsequence_matches() {
        let store = store_with(&[("NEC-100", "electrical", "", 100), ("ISO-9001", "quality", "", 100)]);
        let index = indexed(&store);
        assert_eq!(index.query("nec100").first().map(String::as_str), Some("NEC-100"));
    }

    #[test]
    fn incremental_update_drops_stale_terms() {
        let mut store = store_with(&[("A-1", "fire", "sprinkler check", 100)]);
        let mut index = indexed(&store);
        let ev = ComplianceEvent::new("A-1", ComplianceStatus::Critical, Utc.timestamp_opt(200, 0).single().unwrap(), 9, "r2")
            .with_description("extinguisher audit");
        store.apply(&ev).unwrap();
        index.update(store.get("A-1").unwrap());

        assert!(index.query("sprinkler").is_empty());
        assert_eq!(index.query("extinguisher"), vec!["A-1".to_string()]);
        assert_eq!(index.query("critical"), vec!["A-1".to_string()]);
        assert_eq!(index.document("A-1").unwrap().status, ComplianceStatus::Critical);
    }

    #[test]
    fn removal_clears_postings_and_typo_keys() {
        let store = store_with(&[("A-1", "fire", "sprinkler", 100)]);
        let mut index = indexed(&store);
        assert!(index.remove("A-1"));
        assert!(index.query("sprinkler").is_empty());
        assert!(index.query("sprinkle").is_empty());
        assert!(index.postings.is_empty());
        assert!(index.deletes.is_empty());
        assert!(!index.remove("A-1"));
    }

    #[test]
    fn long_tokens_skip_the_typo_index() {
        let blob = "abcdefghij".repeat(40);
        let store = store_with(&[("L-1", "x", blob.as_str(), 100)]);
        let index = indexed(&store);

        assert!(index.deletes.len() < 64, "{} deletion keys", index.deletes.len());
        assert!(index.deletes.values().flatten().all(|t| t.chars().count() <= MAX_FUZZY_TERM_LEN));
        assert_eq!(index.query(&blob), vec!["L-1".to_string()]);
        assert_eq!(index.query(&blob[..20]), vec!["L-1".to_string()]);
    }

    #[test]
    fn short_terms_index_one_deletion() {
        let store = store_with(&[("A", "x", "bond", 100)]);
        let index = indexed(&store);
        assert!(index.deletes.contains_key("bnd"));
        assert!(!index.deletes.contains_key("bn"));
        assert_eq!(index.query("bund"), vec!["A".to_string()]);
    }
}
