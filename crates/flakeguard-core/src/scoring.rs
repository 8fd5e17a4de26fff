use serde::{Deserialize, Serialize};

use crate::patterns::{detect_patterns, PatternThresholds};
use crate::{FlakeError, TestId, TestRunStatistics};

/// Scores at or above this value are at least [`Severity::Medium`].
pub const SEVERITY_MEDIUM_THRESHOLD: f64 = 0.4;
/// Scores at or above this value are [`Severity::High`].
pub const SEVERITY_HIGH_THRESHOLD: f64 = 0.7;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    /// Maps a score onto its band. No hysteresis: the band depends on the
    /// score alone.
    #[must_use]
    pub fn from_score(score: f64) -> Self {
        if score >= SEVERITY_HIGH_THRESHOLD {
            Self::High
        } else if score >= SEVERITY_MEDIUM_THRESHOLD {
            Self::Medium
        } else {
            Self::Low
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// Normalized failure rate, or `None` when the test has never run.
///
/// `None` is distinct from `Some(0.0)`: a test with no runs has not been
/// shown to pass. Counters are taken as given; see
/// [`TestRunStatistics::validate`].
#[must_use]
pub fn flakiness_score(stats: &TestRunStatistics) -> Option<f64> {
    stats.failure_rate()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlakinessAssessment {
    pub test_id: TestId,
    pub score: f64,
    pub severity: Severity,
    pub is_retry_flaky: bool,
    pub has_time_pattern: bool,
    pub has_environment_pattern: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Assessment {
    InsufficientData { test_id: TestId },
    Assessed(FlakinessAssessment),
}

impl Assessment {
    #[must_use]
    pub fn test_id(&self) -> &TestId {
        match self {
            Self::InsufficientData { test_id } => test_id,
            Self::Assessed(assessment) => &assessment.test_id,
        }
    }

    #[must_use]
    pub fn score(&self) -> Option<f64> {
        self.assessed().map(|assessment| assessment.score)
    }

    #[must_use]
    pub fn severity(&self) -> Option<Severity> {
        self.assessed().map(|assessment| assessment.severity)
    }

    #[must_use]
    pub fn assessed(&self) -> Option<&FlakinessAssessment> {
        match self {
            Self::InsufficientData { .. } => None,
            Self::Assessed(assessment) => Some(assessment),
        }
    }
}

/// Validates one statistics snapshot and recomputes its full assessment.
///
/// # Errors
/// Returns [`FlakeError::Validation`] when the snapshot's counters
/// contradict each other.
pub fn assess(
    stats: &TestRunStatistics,
    thresholds: &PatternThresholds,
) -> Result<Assessment, FlakeError> {
    stats.validate()?;
    let Some(score) = flakiness_score(stats) else {
        return Ok(Assessment::InsufficientData {
            test_id: stats.test_id.clone(),
        });
    };

    let patterns = detect_patterns(stats, thresholds);
    Ok(Assessment::Assessed(FlakinessAssessment {
        test_id: stats.test_id.clone(),
        score,
        severity: Severity::from_score(score),
        is_retry_flaky: patterns.is_retry_flaky,
        has_time_pattern: patterns.has_time_pattern,
        has_environment_pattern: patterns.has_environment_pattern,
    }))
}
