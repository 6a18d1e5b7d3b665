use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{EngineConfig, EngineError, EntryId, RawRecordId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TrustTier {
    Verified,
    Learned,
    Raw,
}

impl TrustTier {
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::Verified => 3,
            Self::Learned => 2,
            Self::Raw => 1,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Verified => "verified",
            Self::Learned => "learned",
            Self::Raw => "raw",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "verified" => Some(Self::Verified),
            "learned" => Some(Self::Learned),
            "raw" => Some(Self::Raw),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Manual,
    ConversationExtract,
    PatternConsolidation,
}

impl SourceType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::ConversationExtract => "conversation_extract",
            Self::PatternConsolidation => "pattern_consolidation",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "manual" => Some(Self::Manual),
            "conversation_extract" => Some(Self::ConversationExtract),
            "pattern_consolidation" => Some(Self::PatternConsolidation),
            _ => None,
        }
    }
}

/// Closed knowledge payload. Optional problem/solution fields cover the
/// conversational entries; the body always carries the canonical answer text.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EntryContent {
    pub title: String,
    pub body: String,
    pub problem: Option<String>,
    pub solution: Option<String>,
}

impl EntryContent {
    /// Text emitted when this entry answers a customer automatically.
    #[must_use]
    pub fn reply_text(&self) -> &str {
        self.solution.as_deref().unwrap_or(&self.body)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KnowledgeEntry {
    pub id: EntryId,
    pub key: String,
    pub content: EntryContent,
    pub trust_tier: TrustTier,
    pub confidence: f64,
    pub source_type: SourceType,
    pub source_count: u32,
    pub usage_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    #[serde(default)]
    pub supersedes: Vec<EntryId>,
    pub superseded_by: Option<EntryId>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_accessed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
}

impl KnowledgeEntry {
    /// An entry answers queries only while it is neither superseded nor expired.
    #[must_use]
    pub fn is_active(&self, as_of: OffsetDateTime) -> bool {
        if self.superseded_by.is_some() {
            return false;
        }
        match self.expires_at {
            Some(expiry) => expiry > as_of,
            None => true,
        }
    }

    /// Observed success rate, or `None` before any feedback has landed.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> Option<f64> {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            None
        } else {
            Some(self.success_count as f64 / total as f64)
        }
    }

    /// Validate one knowledge entry against the engine invariants.
    ///
    /// # Errors
    /// Returns [`EngineError::Validation`] when identity, confidence, trust,
    /// or supersession constraints are violated.
    pub fn validate(&self, config: &EngineConfig) -> Result<(), EngineError> {
        if self.key.trim().is_empty() {
            return Err(EngineError::Validation("entry key MUST be non-empty".to_string()));
        }

        if self.key != normalize_key(&self.key) {
            return Err(EngineError::Validation(format!(
                "entry key MUST be a normalized topic label, got `{}`",
                self.key
            )));
        }

        if self.content.title.trim().is_empty() {
            return Err(EngineError::Validation("entry title MUST be non-empty".to_string()));
        }

        if self.content.body.trim().is_empty() {
            return Err(EngineError::Validation("entry body MUST be non-empty".to_string()));
        }

        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(EngineError::Validation(
                "entry confidence MUST be in [0.0, 1.0]".to_string(),
            ));
        }

        if self.source_count == 0 {
            return Err(EngineError::Validation("source_count MUST be >= 1".to_string()));
        }

        if self.supersedes.contains(&self.id) || self.superseded_by == Some(self.id) {
            return Err(EngineError::Validation(
                "entry MUST NOT supersede itself".to_string(),
            ));
        }

        if self.trust_tier == TrustTier::Verified && self.source_type != SourceType::Manual {
            let earned = self.usage_count >= config.promotion_min_usage
                && self
                    .success_rate()
                    .is_some_and(|rate| rate >= config.promotion_min_success_rate);
            if !earned {
                return Err(EngineError::Validation(format!(
                    "verified tier requires manual source or usage >= {} with success rate >= {}",
                    config.promotion_min_usage, config.promotion_min_success_rate
                )));
            }
        }

        Ok(())
    }
}

/// Tier an entry has earned through usage, if any.
///
/// Learned entries graduate to verified once enough automated replies have
/// been confirmed helpful; manual entries are already trusted and raw entries
/// must pass through consolidation first.
#[must_use]
pub fn auto_promotion_tier(entry: &KnowledgeEntry, config: &EngineConfig) -> Option<TrustTier> {
    if entry.trust_tier != TrustTier::Learned {
        return None;
    }
    if entry.usage_count < config.promotion_min_usage {
        return None;
    }
    entry
        .success_rate()
        .is_some_and(|rate| rate >= config.promotion_min_success_rate)
        .then_some(TrustTier::Verified)
}

/// Lowercase a topic label and keep only `[a-z0-9_]`, so keys compare stably.
#[must_use]
pub fn normalize_key(value: &str) -> String {
    let mut normalized = String::with_capacity(value.len());
    let mut last_was_separator = true;
    for ch in value.chars() {
        if ch.is_ascii_alphanumeric() {
            normalized.push(ch.to_ascii_lowercase());
            last_was_separator = false;
        } else if !last_was_separator {
            normalized.push('_');
            last_was_separator = true;
        }
    }
    while normalized.ends_with('_') {
        normalized.pop();
    }
    normalized
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawConversationRecord {
    pub id: RawRecordId,
    pub conversation_id: String,
    pub problem: String,
    pub solution: String,
    pub extraction_confidence: f64,
    pub processed: bool,
    pub consolidated_into: Option<EntryId>,
    #[serde(default)]
    pub similar_records: Vec<RawRecordId>,
    #[serde(with = "time::serde::rfc3339")]
    pub captured_at: OffsetDateTime,
}

impl RawConversationRecord {
    /// Validate one raw conversation capture.
    ///
    /// # Errors
    /// Returns [`EngineError::Validation`] when identity or lifecycle fields
    /// are inconsistent.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.conversation_id.trim().is_empty() {
            return Err(EngineError::Validation(
                "raw record conversation_id MUST be non-empty".to_string(),
            ));
        }

        if self.problem.trim().is_empty() {
            return Err(EngineError::Validation(
                "raw record problem MUST be non-empty".to_string(),
            ));
        }

        if !self.extraction_confidence.is_finite()
            || !(0.0..=1.0).contains(&self.extraction_confidence)
        {
            return Err(EngineError::Validation(
                "extraction_confidence MUST be in [0.0, 1.0]".to_string(),
            ));
        }

        if self.consolidated_into.is_some() && !self.processed {
            return Err(EngineError::Validation(
                "consolidated raw records MUST be marked processed".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PatternAlternative {
    pub entry_id: EntryId,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KnowledgePattern {
    pub pattern: String,
    pub occurrence_count: u64,
    pub best_entry: Option<EntryId>,
    pub best_confidence: f64,
    #[serde(default)]
    pub alternatives: Vec<PatternAlternative>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl KnowledgePattern {
    #[must_use]
    pub fn new(pattern: String, as_of: OffsetDateTime) -> Self {
        Self {
            pattern,
            occurrence_count: 0,
            best_entry: None,
            best_confidence: 0.0,
            alternatives: Vec::new(),
            updated_at: as_of,
        }
    }

    /// Register one candidate entry for this pattern. The incumbent best only
    /// yields when the challenger's confidence strictly exceeds it by
    /// `margin`; everything else lands in the ordered alternatives list.
    /// Returns true when the best entry changed.
    pub fn record_candidate(
        &mut self,
        entry_id: EntryId,
        confidence: f64,
        margin: f64,
        as_of: OffsetDateTime,
    ) -> bool {
        self.updated_at = as_of;

        if self.best_entry == Some(entry_id) {
            self.best_confidence = confidence;
            return false;
        }

        let Some(incumbent) = self.best_entry else {
            self.best_entry = Some(entry_id);
            self.best_confidence = confidence;
            self.alternatives.retain(|alternative| alternative.entry_id != entry_id);
            return true;
        };

        if confidence > self.best_confidence + margin {
            self.push_alternative(incumbent, self.best_confidence);
            self.alternatives.retain(|alternative| alternative.entry_id != entry_id);
            self.best_entry = Some(entry_id);
            self.best_confidence = confidence;
            return true;
        }

        self.push_alternative(entry_id, confidence);
        false
    }

    /// Force the best entry, moving any different incumbent into the
    /// alternatives. Used when consolidation has already superseded the
    /// incumbent and the margin guard must not apply.
    pub fn set_best(&mut self, entry_id: EntryId, confidence: f64, as_of: OffsetDateTime) {
        self.updated_at = as_of;
        if let Some(incumbent) = self.best_entry {
            if incumbent != entry_id {
                self.push_alternative(incumbent, self.best_confidence);
            }
        }
        self.alternatives.retain(|alternative| alternative.entry_id != entry_id);
        self.best_entry = Some(entry_id);
        self.best_confidence = confidence;
    }

    fn push_alternative(&mut self, entry_id: EntryId, confidence: f64) {
        self.alternatives.retain(|alternative| alternative.entry_id != entry_id);
        self.alternatives.push(PatternAlternative { entry_id, confidence });
        self.alternatives.sort_by(|lhs, rhs| {
            rhs.confidence
                .partial_cmp(&lhs.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| lhs.entry_id.cmp(&rhs.entry_id))
        });
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResponseCounter {
    pub conversation_id: String,
    pub response_count: u32,
    pub max_allowed: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub window_start: OffsetDateTime,
}

impl ResponseCounter {
    #[must_use]
    pub fn remaining(&self) -> u32 {
        self.max_allowed.saturating_sub(self.response_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;
    use ulid::Ulid;

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
    }

    fn fixture_entry_id(input: &str) -> EntryId {
        match Ulid::from_string(input) {
            Ok(id) => EntryId(id),
            Err(err) => panic!("invalid fixture ULID {input}: {err}"),
        }
    }

    fn mk_entry(key: &str, trust_tier: TrustTier, source_type: SourceType) -> KnowledgeEntry {
        KnowledgeEntry {
            id: EntryId::new(),
            key: key.to_string(),
            content: EntryContent {
                title: "Gift cards".to_string(),
                body: "Gift cards are sold at the front desk and online.".to_string(),
                problem: None,
                solution: Some("Yes - gift cards are available at the front desk.".to_string()),
            },
            trust_tier,
            confidence: 0.9,
            source_type,
            source_count: 1,
            usage_count: 0,
            success_count: 0,
            failure_count: 0,
            supersedes: Vec::new(),
            superseded_by: None,
            created_at: fixture_time(),
            updated_at: fixture_time(),
            last_accessed_at: None,
            expires_at: None,
        }
    }

    #[test]
    fn validate_rejects_denormalized_key() {
        let entry = mk_entry("Gift Cards", TrustTier::Verified, SourceType::Manual);
        let err = match entry.validate(&EngineConfig::default()) {
            Ok(()) => panic!("expected validation error for denormalized key"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("normalized topic label"));
    }

    #[test]
    fn validate_rejects_unearned_verified_tier() {
        let mut entry = mk_entry("gift_cards", TrustTier::Verified, SourceType::PatternConsolidation);
        entry.usage_count = 10;
        entry.success_count = 9;
        entry.failure_count = 1;

        let err = match entry.validate(&EngineConfig::default()) {
            Ok(()) => panic!("expected validation error for unearned verified tier"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("verified tier requires"));
    }

    #[test]
    fn validate_accepts_earned_verified_tier() {
        let mut entry = mk_entry("gift_cards", TrustTier::Verified, SourceType::PatternConsolidation);
        entry.usage_count = 60;
        entry.success_count = 50;
        entry.failure_count = 5;

        if let Err(err) = entry.validate(&EngineConfig::default()) {
            panic!("earned verified tier should validate: {err}");
        }
    }

    #[test]
    fn superseded_entry_is_not_active() {
        let mut entry = mk_entry("gift_cards", TrustTier::Learned, SourceType::PatternConsolidation);
        assert!(entry.is_active(fixture_time()));

        entry.superseded_by = Some(EntryId::new());
        assert!(!entry.is_active(fixture_time()));
    }

    #[test]
    fn expired_entry_is_not_active() {
        let mut entry = mk_entry("gift_cards", TrustTier::Learned, SourceType::PatternConsolidation);
        entry.expires_at = Some(fixture_time() - Duration::days(1));
        assert!(!entry.is_active(fixture_time()));
    }

    #[test]
    fn promotion_requires_usage_and_success_rate() {
        let config = EngineConfig::default();
        let mut entry = mk_entry("gift_cards", TrustTier::Learned, SourceType::PatternConsolidation);

        assert_eq!(auto_promotion_tier(&entry, &config), None);

        entry.usage_count = 50;
        entry.success_count = 40;
        entry.failure_count = 10;
        assert_eq!(auto_promotion_tier(&entry, &config), Some(TrustTier::Verified));

        entry.success_count = 30;
        entry.failure_count = 20;
        assert_eq!(auto_promotion_tier(&entry, &config), None);
    }

    #[test]
    fn promotion_never_applies_to_raw_entries() {
        let config = EngineConfig::default();
        let mut entry = mk_entry("gift_cards", TrustTier::Raw, SourceType::ConversationExtract);
        entry.usage_count = 100;
        entry.success_count = 100;

        assert_eq!(auto_promotion_tier(&entry, &config), None);
    }

    #[test]
    fn normalize_key_flattens_labels() {
        assert_eq!(normalize_key("Gift Cards"), "gift_cards");
        assert_eq!(normalize_key("  TrackMan -- frozen!  "), "trackman_frozen");
        assert_eq!(normalize_key("hours"), "hours");
    }

    #[test]
    fn pattern_best_switch_respects_margin() {
        let incumbent = fixture_entry_id("01HZY9D4Q3SG7PV9A6EXJ8N2E1");
        let challenger = fixture_entry_id("01HZY9D4Q3SG7PV9A6EXJ8N2E2");
        let mut pattern = KnowledgePattern::new("gift_cards".to_string(), fixture_time());

        assert!(pattern.record_candidate(incumbent, 0.60, 0.05, fixture_time()));

        // Inside the margin: incumbent holds.
        assert!(!pattern.record_candidate(challenger, 0.64, 0.05, fixture_time()));
        assert_eq!(pattern.best_entry, Some(incumbent));
        assert_eq!(pattern.alternatives.len(), 1);

        // Beyond the margin: challenger takes over.
        assert!(pattern.record_candidate(challenger, 0.70, 0.05, fixture_time()));
        assert_eq!(pattern.best_entry, Some(challenger));
        assert!(pattern
            .alternatives
            .iter()
            .any(|alternative| alternative.entry_id == incumbent));
    }

    #[test]
    fn entry_json_round_trips_losslessly() {
        let mut entry = mk_entry("gift_cards", TrustTier::Learned, SourceType::PatternConsolidation);
        entry.supersedes = vec![fixture_entry_id("01HZY9D4Q3SG7PV9A6EXJ8N2E3")];
        entry.expires_at = Some(fixture_time() + Duration::days(30));

        let json = match serde_json::to_string(&entry) {
            Ok(json) => json,
            Err(err) => panic!("entry should serialize: {err}"),
        };
        let decoded: KnowledgeEntry = match serde_json::from_str(&json) {
            Ok(decoded) => decoded,
            Err(err) => panic!("entry should deserialize: {err}"),
        };
        assert_eq!(decoded, entry);

        let again = match serde_json::to_string(&decoded) {
            Ok(json) => json,
            Err(err) => panic!("entry should serialize: {err}"),
        };
        assert_eq!(json, again);
    }

    #[test]
    fn counter_remaining_never_underflows() {
        let counter = ResponseCounter {
            conversation_id: "conv-1".to_string(),
            response_count: 3,
            max_allowed: 2,
            window_start: fixture_time(),
        };
        assert_eq!(counter.remaining(), 0);
    }
}
