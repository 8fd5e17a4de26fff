//! Decision core for flaky-test lifecycle management.
//!
//! Run statistics flow one way through this crate:
//! [`assess`] scores a [`TestRunStatistics`] snapshot and detects patterns,
//! [`RetryStrategy::recommend`] and [`should_auto_quarantine`] turn the
//! resulting [`Assessment`] into decisions, and [`QuarantineLifecycle`]
//! applies quarantine transitions through a [`QuarantineStore`].
//! [`SuggestionCache`] fronts the remote analysis boundary.
//!
//! Nothing here performs network or disk I/O; the store, notifier and
//! analysis seams are traits implemented by sibling crates.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};

mod lifecycle;
mod patterns;
mod quarantine;
mod retry;
mod scoring;
mod stats;
mod suggestions;

pub use lifecycle::{
    EvaluationOutcome, QuarantineLifecycle, QuarantineNotice, QuarantineNotifier,
    QuarantineStore, SweepFailure, SweepReport, TransitionOutcome,
};
pub use patterns::{
    detect_patterns, has_environment_pattern, has_time_pattern, is_retry_flaky, PatternFlags,
    PatternThresholds, MIN_BUCKET_SAMPLES, PATTERN_MARGIN, RETRY_SENSITIVITY,
};
pub use quarantine::{
    should_auto_quarantine, AutoQuarantineConfig, QuarantineReason, QuarantineState,
    QuarantineStatus, Transition, AUTO_QUARANTINE_MAX_THRESHOLD, AUTO_QUARANTINE_MIN_RUNS,
    AUTO_QUARANTINE_MIN_THRESHOLD,
};
pub use retry::{RetryStrategy, RetryStrategyRule};
pub use scoring::{
    assess, flakiness_score, Assessment, FlakinessAssessment, Severity,
    SEVERITY_HIGH_THRESHOLD, SEVERITY_MEDIUM_THRESHOLD,
};
pub use stats::{EnvironmentBuckets, FailureBucket, RunOutcome, TestRunStatistics, TimeBuckets};
pub use suggestions::{
    AnalysisProvider, AnalysisRequest, AnalysisResult, SuggestionCache, SuggestionCacheEntry,
    ANALYSIS_HISTORY_LIMIT, SUGGESTION_TTL,
};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum FlakeError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("write conflict for {test_id}: expected state_version {expected}")]
    Conflict { test_id: String, expected: u64 },
    #[error("notification error: {0}")]
    Notification(String),
    #[error("analysis error: {0}")]
    Analysis(String),
}

/// Stable identifier of a test case as reported by the statistics boundary.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct TestId(String);

impl TestId {
    /// Builds a test id from a non-blank string.
    ///
    /// # Errors
    /// Returns [`FlakeError::Validation`] when `value` is empty or whitespace.
    pub fn new(value: impl Into<String>) -> Result<Self, FlakeError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(FlakeError::Validation(
                "test_id MUST be a non-empty string".to_string(),
            ));
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for TestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`FlakeError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, FlakeError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| FlakeError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(FlakeError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`FlakeError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, FlakeError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| FlakeError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

pub(crate) fn ratio(numerator: u64, denominator: u64) -> Option<f64> {
    if denominator == 0 {
        return None;
    }

    #[allow(clippy::cast_precision_loss)]
    let value = numerator as f64 / denominator as f64;
    Some(value)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    pub fn must_some<T>(value: Option<T>) -> T {
        match value {
            Some(inner) => inner,
            None => panic!("expected Some(..), got None"),
        }
    }

    pub fn must_utc(value: &str) -> OffsetDateTime {
        must_ok(parse_rfc3339_utc(value))
    }

    pub fn fixture_test_id() -> TestId {
        must_ok(TestId::new("checkout/pays-with-saved-card"))
    }

    pub fn fixture_stats(total_runs: u64, fail_count: u64) -> TestRunStatistics {
        TestRunStatistics {
            test_id: fixture_test_id(),
            total_runs,
            pass_count: total_runs - fail_count,
            fail_count,
            retry_count: 0,
            passed_on_retry_count: 0,
            recent_outcomes: Vec::new(),
            time_buckets: None,
            environment_buckets: None,
        }
    }
}
