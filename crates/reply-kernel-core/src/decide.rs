use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    score_entry, EngineConfig, EntryId, IntentMatch, KnowledgeEntry, KnowledgePattern, OutcomeId,
};

/// Terminal state of one inbound message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    AutoReplied,
    Escalated,
    Suppressed,
}

impl Disposition {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AutoReplied => "auto_replied",
            Self::Escalated => "escalated",
            Self::Suppressed => "suppressed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "auto_replied" => Some(Self::AutoReplied),
            "escalated" => Some(Self::Escalated),
            "suppressed" => Some(Self::Suppressed),
            _ => None,
        }
    }
}

/// One row in the outcome log. Every message reaches exactly one terminal
/// state and leaves one of these behind for audit and feedback.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutcomeRecord {
    pub id: OutcomeId,
    pub conversation_id: String,
    pub disposition: Disposition,
    pub category: Option<String>,
    pub entry_id: Option<EntryId>,
    pub confidence: Option<f64>,
    pub reason: String,
    #[serde(default)]
    pub trace: Vec<String>,
    pub helpful: Option<bool>,
    #[serde(with = "time::serde::rfc3339")]
    pub decided_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoredCandidate {
    pub category: String,
    pub entry_id: EntryId,
    pub confidence: f64,
    pub source_count: u32,
}

impl ScoredCandidate {
    /// Total order: confidence desc, then source count desc, then entry id
    /// asc, so exact ties never resolve ambiguously.
    fn cmp(lhs: &Self, rhs: &Self) -> Ordering {
        rhs.confidence
            .partial_cmp(&lhs.confidence)
            .unwrap_or(Ordering::Equal)
            .then_with(|| rhs.source_count.cmp(&lhs.source_count))
            .then_with(|| lhs.entry_id.cmp(&rhs.entry_id))
    }
}

/// Follow supersession links from `start` to the live tip of the chain.
///
/// Reads tolerate a half-applied consolidation pass: a pattern may still point
/// at an entry that has just been superseded, in which case the replacement is
/// used. The walk is bounded by the number of known entries, so a damaged
/// cycle terminates instead of spinning.
#[must_use]
pub fn resolve_active_entry(
    entries: &[KnowledgeEntry],
    start: EntryId,
    as_of: OffsetDateTime,
) -> Option<&KnowledgeEntry> {
    let mut current = start;
    for _ in 0..=entries.len() {
        let entry = entries.iter().find(|entry| entry.id == current)?;
        match entry.superseded_by {
            None => return entry.is_active(as_of).then_some(entry),
            Some(next) => current = next,
        }
    }
    None
}

/// Current best active entry for one category: the pattern index's best when
/// it resolves, otherwise the strongest active entry filed under that key.
#[must_use]
pub fn best_entry_for_category<'a>(
    category: &str,
    patterns: &[KnowledgePattern],
    entries: &'a [KnowledgeEntry],
    as_of: OffsetDateTime,
) -> Option<&'a KnowledgeEntry> {
    if let Some(pattern) = patterns.iter().find(|pattern| pattern.pattern == category) {
        if let Some(best_id) = pattern.best_entry {
            if let Some(entry) = resolve_active_entry(entries, best_id, as_of) {
                return Some(entry);
            }
        }
    }

    entries
        .iter()
        .filter(|entry| entry.key == category && entry.is_active(as_of))
        .min_by(|lhs, rhs| {
            rhs.confidence
                .partial_cmp(&lhs.confidence)
                .unwrap_or(Ordering::Equal)
                .then_with(|| rhs.source_count.cmp(&lhs.source_count))
                .then_with(|| lhs.id.cmp(&rhs.id))
        })
}

/// Score every candidate category and return the survivors, strongest first.
///
/// Categories without a usable entry are skipped; entries whose metadata
/// fails to score are excluded rather than failing the message.
#[must_use]
pub fn select_candidates(
    matches: &[IntentMatch],
    patterns: &[KnowledgePattern],
    entries: &[KnowledgeEntry],
    config: &EngineConfig,
    as_of: OffsetDateTime,
) -> Vec<ScoredCandidate> {
    let mut candidates = Vec::new();

    for intent in matches {
        let Some(entry) = best_entry_for_category(&intent.category, patterns, entries, as_of)
        else {
            continue;
        };

        match score_entry(entry, intent.strength, as_of, &config.scoring) {
            Ok(confidence) => candidates.push(ScoredCandidate {
                category: intent.category.clone(),
                entry_id: entry.id,
                confidence,
                source_count: entry.source_count,
            }),
            Err(_) => continue,
        }
    }

    candidates.sort_by(ScoredCandidate::cmp);
    candidates
}
