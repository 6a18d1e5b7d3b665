use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{anyhow, Result};
use reply_kernel_core::{
    normalize_key, plan_consolidation, select_candidates, Disposition, EngineConfig, EntryContent,
    EntryId, KnowledgeEntry, MergeAction, OutcomeId, OutcomeRecord, RawConversationRecord,
    RawRecordId, RuleSet, ScoredCandidate, SourceType, TrustTier,
};
use reply_kernel_store_sqlite::{FeedbackApplication, SchemaStatus, SqliteStore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use ulid::Ulid;

pub const API_CONTRACT_VERSION: &str = "api.v1";

/// Extraction confidence assigned to raw captures made by the decision path
/// itself, before the external extraction capability has looked at them.
const UNEXTRACTED_CONFIDENCE: f64 = 0.3;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InboundMessage {
    pub conversation_id: String,
    #[serde(default)]
    pub contact: Option<String>,
    pub text: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub received_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecisionReport {
    pub outcome_id: OutcomeId,
    pub conversation_id: String,
    pub disposition: Disposition,
    /// Automated reply text, present only when `disposition` is
    /// `auto_replied`. Escalated messages are answered by the generative
    /// fallback outside this subsystem.
    pub reply: Option<String>,
    pub category: Option<String>,
    pub entry_id: Option<EntryId>,
    pub confidence: Option<f64>,
    pub reason: String,
    pub decision_trace_id: String,
    pub trace: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeedbackSignal {
    pub outcome_id: OutcomeId,
    pub helpful: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AddEntryRequest {
    pub key: String,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub problem: Option<String>,
    #[serde(default)]
    pub solution: Option<String>,
    pub trust_tier: TrustTier,
    pub source_type: SourceType,
    pub confidence: f64,
    #[serde(default)]
    pub entry_id: Option<EntryId>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub supersedes: Vec<EntryId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateEntryRequest {
    pub entry_id: EntryId,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub problem: Option<String>,
    #[serde(default)]
    pub solution: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetireEntryRequest {
    pub entry_id: EntryId,
    #[serde(default)]
    pub replaced_by: Option<EntryId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AddRawRecordRequest {
    pub conversation_id: String,
    pub problem: String,
    pub solution: String,
    pub extraction_confidence: f64,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub captured_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MergeReport {
    pub pattern: String,
    pub entry_id: EntryId,
    pub action: String,
    pub group_size: u32,
    pub superseded: Vec<EntryId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsolidationSummary {
    pub run_id: String,
    pub merges_performed: usize,
    pub groups_absorbed: usize,
    pub groups_skipped: usize,
    pub records_scanned: u32,
    pub records_consumed: usize,
    pub unmatched_records: u32,
    pub cancelled: bool,
    pub merges: Vec<MergeReport>,
}

/// Embedded decision-engine API. Construction is eager: the config and the
/// rule table are validated up front so a bad deployment fails at startup,
/// not on the first customer message.
#[derive(Debug, Clone)]
pub struct ReplyKernelApi {
    db_path: PathBuf,
    config: EngineConfig,
    rules: RuleSet,
}

impl ReplyKernelApi {
    /// Build an engine over the given database with the built-in rule table.
    ///
    /// # Errors
    /// Returns an error when the config is invalid or a built-in rule fails
    /// to compile.
    pub fn new(db_path: PathBuf, config: EngineConfig) -> Result<Self> {
        let rules =
            RuleSet::builtin().map_err(|err| anyhow!("builtin rule table rejected: {err}"))?;
        Self::with_rules(db_path, config, rules)
    }

    /// Build an engine with a caller-supplied rule table.
    ///
    /// # Errors
    /// Returns an error when the config is invalid.
    pub fn with_rules(db_path: PathBuf, config: EngineConfig, rules: RuleSet) -> Result<Self> {
        config.validate().map_err(|err| anyhow!("engine config rejected: {err}"))?;
        Ok(Self { db_path, config, rules })
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                inferred_from_legacy: before.inferred_from_legacy,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            inferred_from_legacy: before.inferred_from_legacy,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Decide what to do with one inbound customer message.
    ///
    /// Classify, score, throttle-check, then either emit the winning entry's
    /// solution, escalate to the generative fallback, or suppress. Every path
    /// leaves an outcome row; internal failures degrade to escalation instead
    /// of surfacing to the customer.
    ///
    /// # Errors
    /// Returns an error only when the message itself is unusable or the
    /// outcome log cannot be written.
    pub fn decide(&self, input: InboundMessage) -> Result<DecisionReport> {
        if input.conversation_id.trim().is_empty() {
            return Err(anyhow!("conversation_id MUST be non-empty"));
        }

        let mut store = self.open_store()?;
        store.migrate()?;

        let as_of = input.received_at.unwrap_or_else(OffsetDateTime::now_utc);
        let mut trace = vec!["received".to_string()];

        let matches = self.rules.classify(&input.text);
        if matches.is_empty() {
            trace.push("classified: no candidate categories".to_string());
            if !input.text.trim().is_empty() {
                self.capture_raw(&mut store, &input, as_of)?;
                trace.push("queued raw record for consolidation".to_string());
            }
            return self.finish(
                &mut store,
                &input,
                as_of,
                trace,
                Disposition::Escalated,
                None,
                None,
                None,
                None,
                "no configured pattern matched the message".to_string(),
            );
        }
        trace.push(format!("classified: {} candidate categories", matches.len()));

        let evaluated = (|| -> Result<Vec<ScoredCandidate>> {
            store.bump_pattern_occurrence(&matches[0].category, 1, as_of)?;
            let patterns = store.list_patterns()?;
            let entries = store.list_entries()?;
            Ok(select_candidates(&matches, &patterns, &entries, &self.config, as_of))
        })();

        let candidates = match evaluated {
            Ok(candidates) => candidates,
            Err(err) => {
                tracing::warn!(error = %err, "knowledge lookup failed; escalating");
                trace.push("scoring failed; escalating".to_string());
                return self.finish(
                    &mut store,
                    &input,
                    as_of,
                    trace,
                    Disposition::Escalated,
                    Some(matches[0].category.clone()),
                    None,
                    None,
                    None,
                    format!("knowledge lookup failed: {err}"),
                );
            }
        };
        trace.push(format!("scored: {} usable candidates", candidates.len()));

        let Some(best) = candidates.into_iter().next() else {
            self.capture_raw(&mut store, &input, as_of)?;
            trace.push("queued raw record for consolidation".to_string());
            return self.finish(
                &mut store,
                &input,
                as_of,
                trace,
                Disposition::Escalated,
                Some(matches[0].category.clone()),
                None,
                None,
                None,
                "no knowledge entry available for the matched categories".to_string(),
            );
        };

        if best.confidence < self.config.min_confidence {
            self.capture_raw(&mut store, &input, as_of)?;
            trace.push(format!(
                "best confidence {:.3} below threshold {:.2}; queued raw record",
                best.confidence, self.config.min_confidence
            ));
            return self.finish(
                &mut store,
                &input,
                as_of,
                trace,
                Disposition::Escalated,
                Some(best.category),
                Some(best.entry_id),
                Some(best.confidence),
                None,
                "best candidate fell below the confidence threshold".to_string(),
            );
        }
        trace.push(format!("threshold passed at confidence {:.3}", best.confidence));

        // Resolve the reply text before touching the counter so a missing
        // entry cannot burn a throttle slot.
        let entry = match store.get_entry(best.entry_id) {
            Ok(Some(entry)) => entry,
            Ok(None) | Err(_) => {
                trace.push("winning entry unreadable; escalating".to_string());
                return self.finish(
                    &mut store,
                    &input,
                    as_of,
                    trace,
                    Disposition::Escalated,
                    Some(best.category),
                    Some(best.entry_id),
                    Some(best.confidence),
                    None,
                    "winning entry could not be loaded".to_string(),
                );
            }
        };

        match store.try_increment_response(
            &input.conversation_id,
            self.config.max_auto_replies,
            as_of,
        ) {
            Ok(true) => {
                trace.push("throttle passed; counter incremented".to_string());
                if let Err(err) = store.record_usage(best.entry_id, as_of) {
                    tracing::warn!(error = %err, entry_id = %best.entry_id,
                        "failed to record entry usage");
                }
                let reply = entry.content.reply_text().to_string();
                self.finish(
                    &mut store,
                    &input,
                    as_of,
                    trace,
                    Disposition::AutoReplied,
                    Some(best.category),
                    Some(best.entry_id),
                    Some(best.confidence),
                    Some(reply),
                    "confident match answered automatically".to_string(),
                )
            }
            Ok(false) => {
                trace.push("conversation at automated reply cap".to_string());
                self.finish(
                    &mut store,
                    &input,
                    as_of,
                    trace,
                    Disposition::Suppressed,
                    Some(best.category),
                    Some(best.entry_id),
                    Some(best.confidence),
                    None,
                    "automated reply cap reached; leaving to a human".to_string(),
                )
            }
            Err(err) => {
                // Counter store unreachable: never risk unbounded auto-replies.
                tracing::warn!(error = %err, "throttle store failure; escalating");
                trace.push("throttle store unreachable; escalating".to_string());
                self.finish(
                    &mut store,
                    &input,
                    as_of,
                    trace,
                    Disposition::Escalated,
                    Some(best.category),
                    Some(best.entry_id),
                    Some(best.confidence),
                    None,
                    format!("throttle store failure: {err}"),
                )
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        store: &mut SqliteStore,
        input: &InboundMessage,
        as_of: OffsetDateTime,
        mut trace: Vec<String>,
        disposition: Disposition,
        category: Option<String>,
        entry_id: Option<EntryId>,
        confidence: Option<f64>,
        reply: Option<String>,
        reason: String,
    ) -> Result<DecisionReport> {
        trace.push(format!("terminal: {}", disposition.as_str()));

        let outcome = OutcomeRecord {
            id: OutcomeId::new(),
            conversation_id: input.conversation_id.clone(),
            disposition,
            category: category.clone(),
            entry_id,
            confidence,
            reason: reason.clone(),
            trace: trace.clone(),
            helpful: None,
            decided_at: as_of,
        };
        store.insert_outcome(&outcome)?;

        Ok(DecisionReport {
            outcome_id: outcome.id,
            conversation_id: input.conversation_id.clone(),
            disposition,
            reply,
            category,
            entry_id,
            confidence,
            reason,
            decision_trace_id: compute_decision_trace_id(
                &input.conversation_id,
                &input.text,
                as_of,
                disposition,
            ),
            trace,
        })
    }

    fn capture_raw(
        &self,
        store: &mut SqliteStore,
        input: &InboundMessage,
        as_of: OffsetDateTime,
    ) -> Result<RawRecordId> {
        let record = RawConversationRecord {
            id: RawRecordId::new(),
            conversation_id: input.conversation_id.clone(),
            problem: input.text.clone(),
            solution: String::new(),
            extraction_confidence: UNEXTRACTED_CONFIDENCE,
            processed: false,
            consolidated_into: None,
            similar_records: Vec::new(),
            captured_at: as_of,
        };
        store.insert_raw_record(&record)?;
        Ok(record.id)
    }

    /// Apply one helpful/unhelpful signal from the human review surface.
    ///
    /// # Errors
    /// Returns an error when the outcome does not exist or the write fails.
    pub fn feedback(&self, input: FeedbackSignal) -> Result<FeedbackApplication> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.apply_feedback(
            input.outcome_id,
            input.helpful,
            &self.config,
            OffsetDateTime::now_utc(),
        )
    }

    /// Run one consolidation pass.
    ///
    /// # Errors
    /// Returns an error when another pass holds the lock or a merge fails.
    pub fn consolidate(&self) -> Result<ConsolidationSummary> {
        self.consolidate_with_cancel(&AtomicBool::new(false))
    }

    /// Run one consolidation pass with a cooperative cancellation flag,
    /// checked between pattern groups; a merge is never abandoned mid-way.
    ///
    /// # Errors
    /// Returns an error when another pass holds the lock or a merge fails.
    pub fn consolidate_with_cancel(&self, cancel: &AtomicBool) -> Result<ConsolidationSummary> {
        let mut store = self.open_store()?;
        store.migrate()?;

        let holder = Ulid::new().to_string();
        if !store.try_acquire_consolidation_lock(&holder)? {
            return Err(anyhow!("another consolidation pass is already running"));
        }

        let result = self.run_consolidation(&mut store, cancel);
        if let Err(err) = store.release_consolidation_lock(&holder) {
            tracing::warn!(error = %err, "failed to release consolidation lock");
        }
        result
    }

    fn run_consolidation(
        &self,
        store: &mut SqliteStore,
        cancel: &AtomicBool,
    ) -> Result<ConsolidationSummary> {
        let as_of = OffsetDateTime::now_utc();
        let raw = store.list_unprocessed_raw()?;
        let patterns = store.list_patterns()?;
        let entries = store.list_entries()?;
        let plan =
            plan_consolidation(&raw, &patterns, &entries, &self.rules, &self.config, as_of);

        let mut merges = Vec::new();
        let mut merges_performed = 0_usize;
        let mut groups_absorbed = 0_usize;
        let mut records_consumed = 0_usize;
        let mut cancelled = false;

        for merge in &plan.merges {
            if cancel.load(Ordering::Relaxed) {
                cancelled = true;
                break;
            }

            let entry_id = store.apply_merge(merge, &self.config, as_of)?;
            records_consumed += merge.consumed_raw.len();
            match merge.action {
                MergeAction::CreateEntry | MergeAction::UpdateEntry(_) => merges_performed += 1,
                MergeAction::AdoptExisting(_) => groups_absorbed += 1,
            }
            tracing::info!(
                pattern = %merge.pattern,
                entry_id = %entry_id,
                group_size = merge.group_size,
                action = merge.action.kind(),
                "consolidated pattern group"
            );
            merges.push(MergeReport {
                pattern: merge.pattern.clone(),
                entry_id,
                action: merge.action.kind().to_string(),
                group_size: merge.group_size,
                superseded: merge.supersedes.clone(),
            });
        }

        Ok(ConsolidationSummary {
            run_id: format!("crun_{}", Ulid::new()),
            merges_performed,
            groups_absorbed,
            groups_skipped: plan.skipped_small_groups as usize
                + plan.skipped_unextracted_groups as usize,
            records_scanned: plan.scanned_records,
            records_consumed,
            unmatched_records: plan.unmatched_records,
            cancelled,
            merges,
        })
    }

    /// Create one knowledge entry and register it with the pattern index.
    ///
    /// # Errors
    /// Returns an error when validation or persistence fails.
    pub fn add_entry(&self, input: AddEntryRequest) -> Result<KnowledgeEntry> {
        let mut store = self.open_store()?;
        store.migrate()?;

        let created_at = input.created_at.unwrap_or_else(OffsetDateTime::now_utc);
        let entry = KnowledgeEntry {
            id: input.entry_id.unwrap_or_default(),
            key: normalize_key(&input.key),
            content: EntryContent {
                title: input.title,
                body: input.body,
                problem: input.problem,
                solution: input.solution,
            },
            trust_tier: input.trust_tier,
            confidence: input.confidence,
            source_type: input.source_type,
            source_count: 1,
            usage_count: 0,
            success_count: 0,
            failure_count: 0,
            supersedes: input.supersedes,
            superseded_by: None,
            created_at,
            updated_at: created_at,
            last_accessed_at: None,
            expires_at: input.expires_at,
        };

        store.insert_entry(&entry, &self.config)?;
        store.record_pattern_candidate(
            &entry.key,
            entry.id,
            entry.confidence,
            &self.config,
            created_at,
        )?;
        Ok(entry)
    }

    /// Update an entry's content fields and re-register it with the index.
    ///
    /// # Errors
    /// Returns an error when the entry does not exist or persistence fails.
    pub fn update_entry(&self, input: UpdateEntryRequest) -> Result<KnowledgeEntry> {
        let mut store = self.open_store()?;
        store.migrate()?;

        let current = store
            .get_entry(input.entry_id)?
            .ok_or_else(|| anyhow!("entry not found: {}", input.entry_id))?;

        let content = EntryContent {
            title: input.title.unwrap_or(current.content.title),
            body: input.body.unwrap_or(current.content.body),
            problem: input.problem.or(current.content.problem),
            solution: input.solution.or(current.content.solution),
        };
        let confidence = input.confidence.unwrap_or(current.confidence);
        let as_of = OffsetDateTime::now_utc();

        store.update_entry_content(
            input.entry_id,
            &content,
            confidence,
            current.source_count,
            as_of,
        )?;
        store.record_pattern_candidate(
            &current.key,
            input.entry_id,
            confidence,
            &self.config,
            as_of,
        )?;

        store
            .get_entry(input.entry_id)?
            .ok_or_else(|| anyhow!("entry disappeared during update: {}", input.entry_id))
    }

    /// Retire an entry, optionally naming its successor.
    ///
    /// # Errors
    /// Returns an error when the entry or successor does not exist.
    pub fn retire_entry(&self, input: RetireEntryRequest) -> Result<()> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.retire_entry(input.entry_id, input.replaced_by, OffsetDateTime::now_utc())
    }

    /// Text search across active entries.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn search(&self, query: &str) -> Result<Vec<KnowledgeEntry>> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.search_entries(query, OffsetDateTime::now_utc())
    }

    /// List entries in one trust tier.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn list_by_tier(&self, tier: TrustTier) -> Result<Vec<KnowledgeEntry>> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.list_entries_by_tier(tier)
    }

    /// Full supersession chain containing the given entry.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn supersession_chain(&self, entry_id: EntryId) -> Result<Vec<KnowledgeEntry>> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.supersession_chain(entry_id)
    }

    /// Enqueue one externally extracted raw conversation record.
    ///
    /// # Errors
    /// Returns an error when validation or persistence fails.
    pub fn add_raw_record(&self, input: AddRawRecordRequest) -> Result<RawConversationRecord> {
        let mut store = self.open_store()?;
        store.migrate()?;

        let record = RawConversationRecord {
            id: RawRecordId::new(),
            conversation_id: input.conversation_id,
            problem: input.problem,
            solution: input.solution,
            extraction_confidence: input.extraction_confidence,
            processed: false,
            consolidated_into: None,
            similar_records: Vec::new(),
            captured_at: input.captured_at.unwrap_or_else(OffsetDateTime::now_utc),
        };
        store.insert_raw_record(&record)?;
        Ok(record)
    }

    /// Raw records still waiting for consolidation.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn list_unprocessed_raw(&self) -> Result<Vec<RawConversationRecord>> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.list_unprocessed_raw()
    }

    /// Fetch one outcome row.
    ///
    /// # Errors
    /// Returns an error when the outcome does not exist or the query fails.
    pub fn outcome_show(&self, outcome_id: OutcomeId) -> Result<OutcomeRecord> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store
            .get_outcome(outcome_id)?
            .ok_or_else(|| anyhow!("outcome not found: {outcome_id}"))
    }

    /// Recent outcome rows, newest first.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn outcome_list(&self, limit: usize) -> Result<Vec<OutcomeRecord>> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.list_outcomes(limit)
    }
}

fn compute_decision_trace_id(
    conversation_id: &str,
    text: &str,
    as_of: OffsetDateTime,
    disposition: Disposition,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(conversation_id.as_bytes());
    hasher.update(text.as_bytes());
    hasher.update(as_of.unix_timestamp().to_string().as_bytes());
    hasher.update(disposition.as_str().as_bytes());

    let digest = hasher.finalize();
    let digest_hex = format!("{digest:x}");
    format!("dec_{}", &digest_hex[..16])
}
