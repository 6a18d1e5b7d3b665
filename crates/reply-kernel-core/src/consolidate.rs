use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    score_entry, EngineConfig, EntryContent, EntryId, KnowledgeEntry, KnowledgePattern,
    RawConversationRecord, RawRecordId, RuleSet, SourceType, TrustTier,
};

/// What consolidation does to the knowledge store for one pattern group.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case", tag = "kind", content = "entry_id")]
pub enum MergeAction {
    /// Mint a new learned entry from the winning raw solution.
    CreateEntry,
    /// Rewrite the pattern's existing consolidated entry with better content.
    UpdateEntry(EntryId),
    /// An existing entry already wins; the group's raw records fold into it.
    AdoptExisting(EntryId),
}

impl MergeAction {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CreateEntry => "create_entry",
            Self::UpdateEntry(_) => "update_entry",
            Self::AdoptExisting(_) => "adopt_existing",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlannedMerge {
    pub pattern: String,
    pub group_size: u32,
    pub action: MergeAction,
    pub content: EntryContent,
    pub confidence: f64,
    /// Inferior duplicates displaced by this merge. Marked superseded, never
    /// deleted.
    pub supersedes: Vec<EntryId>,
    pub consumed_raw: Vec<RawRecordId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsolidationPlan {
    pub merges: Vec<PlannedMerge>,
    pub scanned_records: u32,
    pub skipped_small_groups: u32,
    /// Groups whose records all lack an extracted solution; they wait for
    /// extraction instead of consolidating into empty entries.
    pub skipped_unextracted_groups: u32,
    pub unmatched_records: u32,
}

enum Candidate<'a> {
    Raw(&'a RawConversationRecord),
    Entry(&'a KnowledgeEntry, f64),
}

impl Candidate<'_> {
    fn confidence(&self) -> f64 {
        match self {
            Candidate::Raw(record) => record.extraction_confidence,
            Candidate::Entry(_, scored) => *scored,
        }
    }

    fn source_count(&self) -> u32 {
        match self {
            Candidate::Raw(_) => 1,
            Candidate::Entry(entry, _) => entry.source_count,
        }
    }

    fn tie_break_id(&self) -> String {
        match self {
            Candidate::Raw(record) => record.id.to_string(),
            Candidate::Entry(entry, _) => entry.id.to_string(),
        }
    }

    /// Highest confidence wins; exact ties resolve by source count, then id,
    /// so two candidate entries never tie ambiguously.
    fn cmp(lhs: &Self, rhs: &Self) -> Ordering {
        rhs.confidence()
            .partial_cmp(&lhs.confidence())
            .unwrap_or(Ordering::Equal)
            .then_with(|| rhs.source_count().cmp(&lhs.source_count()))
            .then_with(|| lhs.tie_break_id().cmp(&rhs.tie_break_id()))
    }
}

fn title_for_pattern(pattern: &str) -> String {
    let spaced = pattern.replace('_', " ");
    let mut chars = spaced.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => spaced,
    }
}

/// Plan one consolidation pass over the unprocessed raw records.
///
/// Pure function of the snapshots it is given: grouping reuses the pattern
/// matcher against each record's problem text, groups below the configured
/// minimum are skipped, and the best solution per group is chosen by
/// confidence with deterministic tie-breaking. Running the planner again
/// after its plan has been applied yields no merges, because every consumed
/// record is marked processed.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn plan_consolidation(
    raw_records: &[RawConversationRecord],
    patterns: &[KnowledgePattern],
    entries: &[KnowledgeEntry],
    rules: &RuleSet,
    config: &EngineConfig,
    as_of: OffsetDateTime,
) -> ConsolidationPlan {
    let mut groups: BTreeMap<String, Vec<&RawConversationRecord>> = BTreeMap::new();
    let mut scanned_records = 0_u32;
    let mut unmatched_records = 0_u32;

    for record in raw_records.iter().filter(|record| !record.processed) {
        scanned_records += 1;
        match rules.classify(&record.problem).into_iter().next() {
            Some(intent) => groups.entry(intent.category).or_default().push(record),
            None => unmatched_records += 1,
        }
    }

    let mut merges = Vec::new();
    let mut skipped_small_groups = 0_u32;
    let mut skipped_unextracted_groups = 0_u32;

    for (pattern_label, mut group) in groups {
        if group.len() < config.min_group_size {
            skipped_small_groups += 1;
            continue;
        }
        group.sort_by(|lhs, rhs| lhs.id.cmp(&rhs.id));

        let existing: Vec<&KnowledgeEntry> = entries
            .iter()
            .filter(|entry| {
                entry.key == pattern_label
                    && entry.is_active(as_of)
                    && matches!(entry.trust_tier, TrustTier::Learned | TrustTier::Raw)
            })
            .collect();

        let mut candidates: Vec<Candidate<'_>> = group
            .iter()
            .filter(|record| !record.solution.trim().is_empty())
            .map(|record| Candidate::Raw(record))
            .collect();
        for entry in &existing {
            // Corrupt metadata excludes the entry, same as on the decision path.
            if let Ok(scored) = score_entry(entry, 1.0, as_of, &config.scoring) {
                candidates.push(Candidate::Entry(entry, scored));
            }
        }
        candidates.sort_by(Candidate::cmp);

        let Some(mut winner) = candidates.first() else {
            skipped_unextracted_groups += 1;
            continue;
        };

        // The incumbent best holds unless the challenger clears the switch
        // margin, which keeps noisy extraction confidences from churning the
        // pattern index.
        let incumbent = patterns
            .iter()
            .find(|pattern| pattern.pattern == pattern_label)
            .and_then(|pattern| pattern.best_entry)
            .and_then(|best_id| {
                candidates.iter().find(|candidate| {
                    matches!(candidate, Candidate::Entry(entry, _) if entry.id == best_id)
                })
            });
        if let Some(incumbent) = incumbent {
            let winner_is_incumbent = matches!(
                (winner, incumbent),
                (Candidate::Entry(lhs, _), Candidate::Entry(rhs, _)) if lhs.id == rhs.id
            );
            if !winner_is_incumbent
                && winner.confidence() <= incumbent.confidence() + config.best_switch_margin
            {
                winner = incumbent;
            }
        }

        let consumed_raw: Vec<RawRecordId> = group.iter().map(|record| record.id).collect();
        let group_size = group.len() as u32;

        let merge = match winner {
            Candidate::Entry(entry, scored) => PlannedMerge {
                pattern: pattern_label.clone(),
                group_size,
                action: MergeAction::AdoptExisting(entry.id),
                content: entry.content.clone(),
                confidence: *scored,
                supersedes: existing
                    .iter()
                    .filter(|loser| loser.id != entry.id)
                    .map(|loser| loser.id)
                    .collect(),
                consumed_raw,
            },
            Candidate::Raw(record) => {
                let update_target = existing
                    .iter()
                    .filter(|entry| entry.source_type == SourceType::PatternConsolidation)
                    .min_by(|lhs, rhs| lhs.id.cmp(&rhs.id))
                    .map(|entry| entry.id);

                let action = match update_target {
                    Some(entry_id) => MergeAction::UpdateEntry(entry_id),
                    None => MergeAction::CreateEntry,
                };

                PlannedMerge {
                    pattern: pattern_label.clone(),
                    group_size,
                    action,
                    content: EntryContent {
                        title: title_for_pattern(&pattern_label),
                        body: record.solution.clone(),
                        problem: Some(record.problem.clone()),
                        solution: Some(record.solution.clone()),
                    },
                    confidence: record.extraction_confidence,
                    supersedes: existing
                        .iter()
                        .filter(|loser| Some(loser.id) != update_target)
                        .map(|loser| loser.id)
                        .collect(),
                    consumed_raw,
                }
            }
        };

        merges.push(merge);
    }

    ConsolidationPlan {
        merges,
        scanned_records,
        skipped_small_groups,
        skipped_unextracted_groups,
        unmatched_records,
    }
}
