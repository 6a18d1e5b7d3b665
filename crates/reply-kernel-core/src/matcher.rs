use std::cmp::Ordering;
use std::collections::BTreeSet;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};

use crate::EngineError;

#[derive(Debug, Clone)]
enum RulePattern {
    Phrase(String),
    Regex(Regex),
}

/// One weighted positive or negative classification rule.
#[derive(Debug, Clone)]
pub struct MatchRule {
    pattern: RulePattern,
    weight: f64,
}

impl MatchRule {
    /// Substring rule over the normalized message text.
    #[must_use]
    pub fn phrase(phrase: &str, weight: f64) -> Self {
        Self { pattern: RulePattern::Phrase(normalize_message(phrase)), weight }
    }

    /// Regex rule evaluated against the normalized message text.
    ///
    /// # Errors
    /// Returns [`EngineError::Classification`] when the pattern fails to compile.
    pub fn regex(pattern: &str, weight: f64) -> Result<Self, EngineError> {
        let compiled = Regex::new(pattern).map_err(|err| {
            EngineError::Classification(format!("invalid rule pattern `{pattern}`: {err}"))
        })?;
        Ok(Self { pattern: RulePattern::Regex(compiled), weight })
    }

    #[must_use]
    pub fn weight(&self) -> f64 {
        self.weight
    }

    fn matches(&self, normalized: &str) -> bool {
        match &self.pattern {
            RulePattern::Phrase(phrase) => normalized.contains(phrase.as_str()),
            RulePattern::Regex(regex) => regex.is_match(normalized),
        }
    }
}

/// Ordered rule lists for one intent category.
#[derive(Debug, Clone)]
pub struct CategoryRules {
    pub category: String,
    pub min_score: f64,
    pub positive: Vec<MatchRule>,
    pub negative: Vec<MatchRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IntentMatch {
    pub category: String,
    pub net_weight: f64,
    /// Net weight normalized against the category's strongest positive rule,
    /// capped at 1.0.
    pub strength: f64,
}

/// Immutable classification table, built once at startup.
#[derive(Debug, Clone)]
pub struct RuleSet {
    categories: Vec<CategoryRules>,
}

impl RuleSet {
    /// Build a rule set, rejecting tables that could misclassify silently.
    ///
    /// # Errors
    /// Returns [`EngineError::Classification`] for duplicate categories,
    /// categories without positive rules, or non-finite weights/thresholds.
    pub fn new(categories: Vec<CategoryRules>) -> Result<Self, EngineError> {
        let mut seen = BTreeSet::new();
        for rules in &categories {
            if rules.category.trim().is_empty() {
                return Err(EngineError::Classification(
                    "category label MUST be non-empty".to_string(),
                ));
            }
            if !seen.insert(rules.category.clone()) {
                return Err(EngineError::Classification(format!(
                    "duplicate category: {}",
                    rules.category
                )));
            }
            if rules.positive.is_empty() {
                return Err(EngineError::Classification(format!(
                    "category {} MUST have at least one positive rule",
                    rules.category
                )));
            }
            if !rules.min_score.is_finite() || rules.min_score <= 0.0 {
                return Err(EngineError::Classification(format!(
                    "category {} min_score MUST be finite and > 0",
                    rules.category
                )));
            }
            for rule in rules.positive.iter().chain(rules.negative.iter()) {
                if !rule.weight.is_finite() || rule.weight <= 0.0 {
                    return Err(EngineError::Classification(format!(
                        "category {} rule weights MUST be finite and > 0",
                        rules.category
                    )));
                }
            }
        }

        Ok(Self { categories })
    }

    /// Built-in facility-support categories.
    ///
    /// # Errors
    /// Returns [`EngineError::Classification`] if a built-in regex fails to
    /// compile; surfaced at startup rather than on first message.
    pub fn builtin() -> Result<Self, EngineError> {
        Self::new(vec![
            CategoryRules {
                category: "gift_cards".to_string(),
                min_score: 1.5,
                positive: vec![
                    MatchRule::phrase("gift card", 2.0),
                    MatchRule::regex(r"gift\s*cert(ificate)?s?", 2.0)?,
                    MatchRule::phrase("buy a gift", 1.0),
                ],
                negative: vec![MatchRule::phrase("refund", 1.0)],
            },
            CategoryRules {
                category: "booking".to_string(),
                min_score: 1.5,
                positive: vec![
                    MatchRule::regex(r"\bbook(ing|ed)?\b", 2.0)?,
                    MatchRule::phrase("tee time", 2.0),
                    MatchRule::phrase("reserve", 1.5),
                    MatchRule::phrase("reschedule", 1.5),
                ],
                negative: vec![MatchRule::phrase("cancel my membership", 2.0)],
            },
            CategoryRules {
                category: "trackman_frozen".to_string(),
                min_score: 1.5,
                positive: vec![
                    MatchRule::phrase("trackman", 1.5),
                    MatchRule::regex(r"\b(frozen|freeze|froze|stuck|not responding)\b", 1.0)?,
                    MatchRule::phrase("simulator", 1.0),
                ],
                negative: Vec::new(),
            },
            CategoryRules {
                category: "hours".to_string(),
                min_score: 1.5,
                positive: vec![
                    MatchRule::regex(r"\b(hours|open until|close[sd]?|closing)\b", 1.5)?,
                    MatchRule::phrase("what time", 1.0),
                ],
                negative: vec![MatchRule::phrase("door", 1.5), MatchRule::phrase("unlock", 1.5)],
            },
            CategoryRules {
                category: "membership".to_string(),
                min_score: 1.5,
                positive: vec![
                    MatchRule::phrase("membership", 2.0),
                    MatchRule::phrase("member", 1.0),
                    MatchRule::phrase("monthly plan", 1.5),
                ],
                negative: Vec::new(),
            },
            CategoryRules {
                category: "access".to_string(),
                min_score: 1.5,
                positive: vec![
                    MatchRule::phrase("door", 1.5),
                    MatchRule::phrase("unlock", 1.5),
                    MatchRule::phrase("get in", 1.5),
                    MatchRule::regex(r"\b(door|entry)\s*(code|pin)\b", 1.5)?,
                ],
                negative: Vec::new(),
            },
            CategoryRules {
                category: "refund".to_string(),
                min_score: 1.5,
                positive: vec![
                    MatchRule::phrase("refund", 2.0),
                    MatchRule::phrase("charged twice", 2.0),
                    MatchRule::phrase("money back", 1.5),
                ],
                negative: Vec::new(),
            },
        ])
    }

    #[must_use]
    pub fn categories(&self) -> &[CategoryRules] {
        &self.categories
    }

    /// Classify one message into zero or more candidate intents, strongest
    /// first. Exact net-weight ties keep table insertion order. Pure function
    /// of the text and this table.
    #[must_use]
    pub fn classify(&self, text: &str) -> Vec<IntentMatch> {
        let normalized = normalize_message(text);
        if normalized.is_empty() {
            return Vec::new();
        }

        let mut matches = Vec::new();
        for rules in &self.categories {
            let mut net_weight = 0.0;
            let mut strongest_positive = 0.0_f64;
            for rule in &rules.positive {
                strongest_positive = strongest_positive.max(rule.weight);
                if rule.matches(&normalized) {
                    net_weight += rule.weight;
                }
            }
            for rule in &rules.negative {
                if rule.matches(&normalized) {
                    net_weight -= rule.weight;
                }
            }

            if net_weight >= rules.min_score && strongest_positive > 0.0 {
                matches.push(IntentMatch {
                    category: rules.category.clone(),
                    net_weight,
                    strength: (net_weight / strongest_positive).clamp(0.0, 1.0),
                });
            }
        }

        matches.sort_by(|lhs, rhs| {
            rhs.net_weight.partial_cmp(&lhs.net_weight).unwrap_or(Ordering::Equal)
        });
        matches
    }
}

/// Lowercase the text and replace every non-alphanumeric run with one space.
#[must_use]
pub fn normalize_message(text: &str) -> String {
    let mut flattened = String::with_capacity(text.len());
    for ch in text.chars() {
        if ch.is_alphanumeric() {
            for lower in ch.to_lowercase() {
                flattened.push(lower);
            }
        } else {
            flattened.push(' ');
        }
    }
    flattened.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builtin() -> RuleSet {
        match RuleSet::builtin() {
            Ok(rules) => rules,
            Err(err) => panic!("builtin rules should compile: {err}"),
        }
    }

    #[test]
    fn normalization_strips_punctuation_and_case() {
        assert_eq!(normalize_message("Do you sell GIFT-CARDS?!"), "do you sell gift cards");
        assert_eq!(normalize_message("  "), "");
    }

    #[test]
    fn gift_card_message_classifies_at_full_strength() {
        let matches = builtin().classify("Do you sell gift cards?");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].category, "gift_cards");
        assert!((matches[0].strength - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn unmatched_message_yields_no_candidates() {
        let matches = builtin().classify("The projector bulb in bay three looks dim");
        assert!(matches.is_empty());
    }

    #[test]
    fn negative_rules_subtract_weight() {
        // "refund" pulls the gift-card category below its minimum.
        let matches = builtin().classify("I want a refund for the gift card I bought");
        assert!(matches.iter().all(|intent| intent.category != "gift_cards"));
        assert!(matches.iter().any(|intent| intent.category == "refund"));
    }

    #[test]
    fn message_may_match_multiple_categories() {
        let matches = builtin().classify("Can I book a bay? Also the trackman is frozen.");
        let categories: Vec<&str> =
            matches.iter().map(|intent| intent.category.as_str()).collect();
        assert!(categories.contains(&"booking"));
        assert!(categories.contains(&"trackman_frozen"));
    }

    #[test]
    fn candidates_are_ordered_by_net_weight_descending() {
        let matches = builtin().classify("Can I book a bay? Also the trackman is frozen.");
        for pair in matches.windows(2) {
            assert!(pair[0].net_weight >= pair[1].net_weight);
        }
    }

    #[test]
    fn exact_ties_keep_insertion_order() {
        let rules = match RuleSet::new(vec![
            CategoryRules {
                category: "first".to_string(),
                min_score: 1.0,
                positive: vec![MatchRule::phrase("widget", 1.0)],
                negative: Vec::new(),
            },
            CategoryRules {
                category: "second".to_string(),
                min_score: 1.0,
                positive: vec![MatchRule::phrase("widget", 1.0)],
                negative: Vec::new(),
            },
        ]) {
            Ok(rules) => rules,
            Err(err) => panic!("tie fixture rules should build: {err}"),
        };

        let matches = rules.classify("where is my widget");
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].category, "first");
        assert_eq!(matches[1].category, "second");
    }

    #[test]
    fn ruleset_rejects_duplicate_categories() {
        let err = match RuleSet::new(vec![
            CategoryRules {
                category: "hours".to_string(),
                min_score: 1.0,
                positive: vec![MatchRule::phrase("hours", 1.0)],
                negative: Vec::new(),
            },
            CategoryRules {
                category: "hours".to_string(),
                min_score: 1.0,
                positive: vec![MatchRule::phrase("open", 1.0)],
                negative: Vec::new(),
            },
        ]) {
            Ok(_) => panic!("expected duplicate category rejection"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("duplicate category"));
    }

    #[test]
    fn ruleset_rejects_invalid_regex() {
        let err = match MatchRule::regex("(unclosed", 1.0) {
            Ok(_) => panic!("expected regex compile failure"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("invalid rule pattern"));
    }

    #[test]
    fn classification_is_deterministic() {
        let rules = builtin();
        let text = "Can I book a bay? Also the trackman is frozen.";
        assert_eq!(rules.classify(text), rules.classify(text));
    }
}
