use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::FlakeError;

/// Upper limit accepted for `max_retries` in any strategy document.
pub(crate) const RETRY_CEILING: u32 = 10;

/// One `[min_score, max_score)` band. The highest band also admits
/// `max_score` itself.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RetryStrategyRule {
    pub min_score: f64,
    pub max_score: f64,
    pub retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryStrategy {
    pub rules: Vec<RetryStrategyRule>,
    pub default_retries: u32,
    pub max_retries: u32,
}

impl RetryStrategy {
    #[must_use]
    pub fn v1() -> Self {
        Self {
            rules: vec![
                RetryStrategyRule {
                    min_score: 0.0,
                    max_score: 0.4,
                    retries: 0,
                },
                RetryStrategyRule {
                    min_score: 0.4,
                    max_score: 0.7,
                    retries: 2,
                },
                RetryStrategyRule {
                    min_score: 0.7,
                    max_score: 1.0,
                    retries: 3,
                },
            ],
            default_retries: 0,
            max_retries: 5,
        }
    }

    /// Builds a validated strategy with rules stored in ascending order.
    ///
    /// # Errors
    /// Returns [`FlakeError::Configuration`] when the rules do not partition
    /// `[0.0, 1.0]`.
    pub fn new(
        mut rules: Vec<RetryStrategyRule>,
        default_retries: u32,
        max_retries: u32,
    ) -> Result<Self, FlakeError> {
        rules.sort_by(|lhs, rhs| lhs.min_score.total_cmp(&rhs.min_score));
        let strategy = Self {
            rules,
            default_retries,
            max_retries,
        };
        strategy.validate()?;
        Ok(strategy)
    }

    /// Checks that the bands cover `[0.0, 1.0]` exactly once.
    ///
    /// Gaps and overlaps are reported, never repaired.
    ///
    /// # Errors
    /// Returns [`FlakeError::Configuration`] describing the first violation.
    pub fn validate(&self) -> Result<(), FlakeError> {
        if self.max_retries > RETRY_CEILING {
            return Err(FlakeError::Configuration(format!(
                "max_retries MUST be <= {RETRY_CEILING}"
            )));
        }

        if self.rules.is_empty() {
            return Err(FlakeError::Configuration(
                "retry strategy MUST define at least one rule".to_string(),
            ));
        }

        for rule in &self.rules {
            if !rule.min_score.is_finite() || !rule.max_score.is_finite() {
                return Err(FlakeError::Configuration(
                    "rule bounds MUST be finite".to_string(),
                ));
            }
            if !(0.0..=1.0).contains(&rule.min_score) || !(0.0..=1.0).contains(&rule.max_score) {
                return Err(FlakeError::Configuration(format!(
                    "rule [{}, {}) MUST lie within [0.0, 1.0]",
                    rule.min_score, rule.max_score
                )));
            }
            if rule.min_score >= rule.max_score {
                return Err(FlakeError::Configuration(format!(
                    "rule [{}, {}) MUST have min_score < max_score",
                    rule.min_score, rule.max_score
                )));
            }
        }

        let sorted = self.sorted_rules();

        if let Some(first) = sorted.first() {
            if first.min_score != 0.0 {
                return Err(FlakeError::Configuration(format!(
                    "gap: no rule covers [0, {})",
                    first.min_score
                )));
            }
        }

        for pair in sorted.windows(2) {
            let (lower, upper) = (pair[0], pair[1]);
            if upper.min_score < lower.max_score {
                return Err(FlakeError::Configuration(format!(
                    "overlap: [{}, {}) and [{}, {}) intersect",
                    lower.min_score, lower.max_score, upper.min_score, upper.max_score
                )));
            }
            if upper.min_score > lower.max_score {
                return Err(FlakeError::Configuration(format!(
                    "gap: no rule covers [{}, {})",
                    lower.max_score, upper.min_score
                )));
            }
        }

        if let Some(last) = sorted.last() {
            if last.max_score != 1.0 {
                return Err(FlakeError::Configuration(format!(
                    "gap: no rule covers [{}, 1]",
                    last.max_score
                )));
            }
        }

        Ok(())
    }

    /// Decodes and validates a strategy from JSON.
    ///
    /// # Errors
    /// Returns [`FlakeError::Configuration`] when JSON decoding fails
    /// or the decoded bands are malformed.
    pub fn from_json(value: &Value) -> Result<Self, FlakeError> {
        let decoded: Self = serde_json::from_value(value.clone()).map_err(|err| {
            FlakeError::Configuration(format!("invalid retry strategy JSON payload: {err}"))
        })?;
        Self::new(decoded.rules, decoded.default_retries, decoded.max_retries)
    }

    /// The band containing `score`, independent of the stored rule order.
    #[must_use]
    pub fn rule_for(&self, score: f64) -> Option<RetryStrategyRule> {
        let sorted = self.sorted_rules();
        let top = sorted.len().checked_sub(1)?;

        sorted.into_iter().enumerate().find_map(|(index, rule)| {
            let below_upper = if index == top {
                score <= rule.max_score
            } else {
                score < rule.max_score
            };
            (score >= rule.min_score && below_upper).then_some(rule)
        })
    }

    /// Recommended retry count, clamped to `[0, max_retries]`.
    ///
    /// `None` (insufficient data) and unmatched scores fall back to
    /// `default_retries`.
    #[must_use]
    pub fn recommend(&self, score: Option<f64>) -> u32 {
        let retries = score
            .and_then(|value| self.rule_for(value))
            .map_or(self.default_retries, |rule| rule.retries);
        retries.min(self.max_retries)
    }

    fn sorted_rules(&self) -> Vec<RetryStrategyRule> {
        let mut sorted = self.rules.clone();
        sorted.sort_by(|lhs, rhs| lhs.min_score.total_cmp(&rhs.min_score));
        sorted
    }
}
