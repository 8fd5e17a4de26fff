use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{FailureBucket, FlakeError, TestRunStatistics};

/// A test is retry-flaky when more than this share of its retries pass.
pub const RETRY_SENSITIVITY: f64 = 0.3;
/// Bucket failure rates must differ by more than this to count as a pattern.
pub const PATTERN_MARGIN: f64 = 0.20;
/// Buckets with fewer runs than this are ignored.
pub const MIN_BUCKET_SAMPLES: u64 = 3;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PatternThresholds {
    pub retry_sensitivity: f64,
    pub pattern_margin: f64,
    pub min_bucket_samples: u64,
}

impl Default for PatternThresholds {
    fn default() -> Self {
        Self::v1()
    }
}

impl PatternThresholds {
    #[must_use]
    pub fn v1() -> Self {
        Self {
            retry_sensitivity: RETRY_SENSITIVITY,
            pattern_margin: PATTERN_MARGIN,
            min_bucket_samples: MIN_BUCKET_SAMPLES,
        }
    }

    /// Validates threshold bounds.
    ///
    /// # Errors
    /// Returns [`FlakeError::Configuration`] when a rate is outside
    /// `[0.0, 1.0]` or the sample floor is zero.
    pub fn validate(&self) -> Result<(), FlakeError> {
        for (name, value) in [
            ("retry_sensitivity", self.retry_sensitivity),
            ("pattern_margin", self.pattern_margin),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(FlakeError::Configuration(format!(
                    "{name} MUST be in [0.0, 1.0]"
                )));
            }
        }

        if self.min_bucket_samples == 0 {
            return Err(FlakeError::Configuration(
                "min_bucket_samples MUST be >= 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Decodes and validates pattern thresholds from JSON.
    ///
    /// # Errors
    /// Returns [`FlakeError::Configuration`] when JSON decoding fails
    /// or decoded values violate threshold constraints.
    pub fn from_json(value: &Value) -> Result<Self, FlakeError> {
        let thresholds: Self = serde_json::from_value(value.clone()).map_err(|err| {
            FlakeError::Configuration(format!("invalid pattern thresholds JSON payload: {err}"))
        })?;
        thresholds.validate()?;
        Ok(thresholds)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct PatternFlags {
    pub is_retry_flaky: bool,
    pub has_time_pattern: bool,
    pub has_environment_pattern: bool,
}

#[must_use]
pub fn detect_patterns(stats: &TestRunStatistics, thresholds: &PatternThresholds) -> PatternFlags {
    PatternFlags {
        is_retry_flaky: is_retry_flaky(stats, thresholds),
        has_time_pattern: has_time_pattern(stats, thresholds),
        has_environment_pattern: has_environment_pattern(stats, thresholds),
    }
}

#[must_use]
pub fn is_retry_flaky(stats: &TestRunStatistics, thresholds: &PatternThresholds) -> bool {
    if stats.passed_on_retry_count == 0 {
        return false;
    }

    crate::ratio(stats.passed_on_retry_count, stats.retry_count)
        .is_some_and(|rate| rate > thresholds.retry_sensitivity)
}

/// True when some hour-of-day or day-of-week bucket fails noticeably more
/// often than the test overall.
#[must_use]
pub fn has_time_pattern(stats: &TestRunStatistics, thresholds: &PatternThresholds) -> bool {
    let Some(buckets) = &stats.time_buckets else {
        return false;
    };
    let Some(overall) = stats.failure_rate() else {
        return false;
    };

    buckets
        .iter()
        .filter_map(|bucket| sampled_rate(bucket, thresholds))
        .any(|rate| rate - overall > thresholds.pattern_margin)
}

/// True when, within one dimension (environment, browser or OS), two
/// buckets' failure rates are further apart than the margin.
#[must_use]
pub fn has_environment_pattern(stats: &TestRunStatistics, thresholds: &PatternThresholds) -> bool {
    let Some(buckets) = &stats.environment_buckets else {
        return false;
    };

    buckets.dimensions().into_iter().any(|(_, items)| {
        let mut rates = items
            .iter()
            .filter_map(|bucket| sampled_rate(bucket, thresholds));
        let Some(first) = rates.next() else {
            return false;
        };
        let (min, max) = rates.fold((first, first), |(min, max), rate| {
            (min.min(rate), max.max(rate))
        });
        max - min > thresholds.pattern_margin
    })
}

fn sampled_rate(bucket: &FailureBucket, thresholds: &PatternThresholds) -> Option<f64> {
    if bucket.runs < thresholds.min_bucket_samples {
        return None;
    }
    bucket.failure_rate()
}
