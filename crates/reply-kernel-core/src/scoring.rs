use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{EngineError, KnowledgeEntry, SourceType};

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Weights and normalization constants for the confidence scorer. Injected at
/// construction time alongside [`crate::EngineConfig`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoringConfig {
    pub source_weight: f64,
    pub usage_weight: f64,
    pub success_weight: f64,
    pub age_weight: f64,
    /// Source factor for manually authored entries.
    pub manual_source_factor: f64,
    /// Source factor for extracted or consolidated entries.
    pub extracted_source_factor: f64,
    /// Usage count at which the usage factor saturates at 1.0.
    pub usage_saturation: f64,
    /// Success factor assumed before any feedback exists.
    pub neutral_success_prior: f64,
    /// Days after which the age factor reaches zero.
    pub age_horizon_days: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            source_weight: 0.4,
            usage_weight: 0.2,
            success_weight: 0.3,
            age_weight: 0.1,
            manual_source_factor: 0.9,
            extracted_source_factor: 0.5,
            usage_saturation: 100.0,
            neutral_success_prior: 0.5,
            age_horizon_days: 365.0,
        }
    }
}

impl ScoringConfig {
    /// Validate weights and normalization constants.
    ///
    /// # Errors
    /// Returns [`EngineError::Validation`] when any weight is out of range or
    /// the weights could push a score above 1.0.
    pub fn validate(&self) -> Result<(), EngineError> {
        let weights =
            [self.source_weight, self.usage_weight, self.success_weight, self.age_weight];
        for weight in weights {
            if !weight.is_finite() || !(0.0..=1.0).contains(&weight) {
                return Err(EngineError::Validation(
                    "scoring weights MUST be in [0.0, 1.0]".to_string(),
                ));
            }
        }

        let total: f64 = weights.iter().sum();
        if total <= 0.0 || total > 1.0 + f64::EPSILON {
            return Err(EngineError::Validation(
                "scoring weights MUST sum to at most 1.0".to_string(),
            ));
        }

        for factor in [
            self.manual_source_factor,
            self.extracted_source_factor,
            self.neutral_success_prior,
        ] {
            if !factor.is_finite() || !(0.0..=1.0).contains(&factor) {
                return Err(EngineError::Validation(
                    "scoring factors MUST be in [0.0, 1.0]".to_string(),
                ));
            }
        }

        if !self.usage_saturation.is_finite() || self.usage_saturation <= 0.0 {
            return Err(EngineError::Validation(
                "usage_saturation MUST be finite and > 0".to_string(),
            ));
        }

        if !self.age_horizon_days.is_finite() || self.age_horizon_days <= 0.0 {
            return Err(EngineError::Validation(
                "age_horizon_days MUST be finite and > 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Score one candidate entry for one matched message.
///
/// Weighted combination of source, usage, success, and age factors, scaled by
/// the matcher's normalized strength. Exactly reproducible for identical
/// inputs: the only time dependence is the explicit `as_of` argument.
///
/// # Errors
/// Returns [`EngineError::Scoring`] when the match strength or entry metadata
/// is not finite; callers exclude the entry and continue.
#[allow(clippy::cast_precision_loss)]
pub fn score_entry(
    entry: &KnowledgeEntry,
    match_strength: f64,
    as_of: OffsetDateTime,
    config: &ScoringConfig,
) -> Result<f64, EngineError> {
    if !match_strength.is_finite() || match_strength < 0.0 {
        return Err(EngineError::Scoring(format!(
            "match strength MUST be finite and >= 0, got {match_strength}"
        )));
    }

    if !entry.confidence.is_finite() {
        return Err(EngineError::Scoring(format!(
            "entry {} carries corrupt confidence metadata",
            entry.id
        )));
    }

    let source_factor = match entry.source_type {
        SourceType::Manual => config.manual_source_factor,
        SourceType::ConversationExtract | SourceType::PatternConsolidation => {
            config.extracted_source_factor
        }
    };

    let usage_factor = (entry.usage_count as f64 / config.usage_saturation).min(1.0);
    let success_factor = entry.success_rate().unwrap_or(config.neutral_success_prior);

    let days_since_update =
        ((as_of - entry.updated_at).as_seconds_f64() / SECONDS_PER_DAY).max(0.0);
    let age_factor = (1.0 - days_since_update / config.age_horizon_days).max(0.0);

    let base = config.source_weight * source_factor
        + config.usage_weight * usage_factor
        + config.success_weight * success_factor
        + config.age_weight * age_factor;

    Ok((base * match_strength.min(1.0)).clamp(0.0, 1.0))
}
