use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use ulid::Ulid;

mod consolidate;
mod decide;
mod entry;
mod matcher;
mod scoring;

pub use consolidate::{
    plan_consolidation, ConsolidationPlan, MergeAction, PlannedMerge,
};
pub use decide::{
    best_entry_for_category, resolve_active_entry, select_candidates, Disposition, OutcomeRecord,
    ScoredCandidate,
};
pub use entry::{
    auto_promotion_tier, normalize_key, EntryContent, KnowledgeEntry, KnowledgePattern,
    PatternAlternative, RawConversationRecord, ResponseCounter, SourceType, TrustTier,
};
pub use matcher::{normalize_message, CategoryRules, IntentMatch, MatchRule, RuleSet};
pub use scoring::{score_entry, ScoringConfig};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("classification error: {0}")]
    Classification(String),
    #[error("scoring error: {0}")]
    Scoring(String),
    #[error("throttle store error: {0}")]
    ThrottleStore(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct EntryId(pub Ulid);

impl EntryId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for EntryId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RawRecordId(pub Ulid);

impl RawRecordId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RawRecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RawRecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct OutcomeId(pub Ulid);

impl OutcomeId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for OutcomeId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for OutcomeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tunable thresholds for the whole decision engine. Injected at
/// construction time; nothing reads these from ambient state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    pub scoring: ScoringConfig,
    /// Minimum confidence required before an automated reply is emitted.
    pub min_confidence: f64,
    /// Cap on automated replies per conversation.
    pub max_auto_replies: u32,
    /// Minimum raw-record group size before consolidation considers a pattern.
    pub min_group_size: usize,
    /// A challenger must beat the incumbent best by this much before a
    /// pattern's best entry switches.
    pub best_switch_margin: f64,
    pub promotion_min_usage: u64,
    pub promotion_min_success_rate: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scoring: ScoringConfig::default(),
            min_confidence: 0.70,
            max_auto_replies: 2,
            min_group_size: 5,
            best_switch_margin: 0.05,
            promotion_min_usage: 50,
            promotion_min_success_rate: 0.8,
        }
    }
}

impl EngineConfig {
    /// Validate every threshold before the engine is constructed.
    ///
    /// # Errors
    /// Returns [`EngineError::Validation`] when any threshold is out of range.
    pub fn validate(&self) -> Result<(), EngineError> {
        self.scoring.validate()?;

        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(EngineError::Validation(
                "min_confidence MUST be in [0.0, 1.0]".to_string(),
            ));
        }

        if self.max_auto_replies == 0 {
            return Err(EngineError::Validation(
                "max_auto_replies MUST be >= 1".to_string(),
            ));
        }

        if self.min_group_size == 0 {
            return Err(EngineError::Validation(
                "min_group_size MUST be >= 1".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.best_switch_margin) {
            return Err(EngineError::Validation(
                "best_switch_margin MUST be in [0.0, 1.0]".to_string(),
            ));
        }

        if self.promotion_min_usage == 0 {
            return Err(EngineError::Validation(
                "promotion_min_usage MUST be >= 1".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.promotion_min_success_rate) {
            return Err(EngineError::Validation(
                "promotion_min_success_rate MUST be in [0.0, 1.0]".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_passes_validation() {
        let config = EngineConfig::default();
        if let Err(err) = config.validate() {
            panic!("default config should validate: {err}");
        }
    }

    #[test]
    fn config_rejects_zero_reply_cap() {
        let config = EngineConfig { max_auto_replies: 0, ..EngineConfig::default() };
        let err = match config.validate() {
            Ok(()) => panic!("expected validation error for zero reply cap"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("max_auto_replies"));
    }

    #[test]
    fn config_rejects_out_of_range_threshold() {
        let config = EngineConfig { min_confidence: 1.2, ..EngineConfig::default() };
        let err = match config.validate() {
            Ok(()) => panic!("expected validation error for out-of-range threshold"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("min_confidence"));
    }
}
