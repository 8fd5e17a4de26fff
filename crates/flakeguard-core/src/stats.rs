use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ratio, FlakeError, TestId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Passed,
    Failed,
    Skipped,
}

/// Failure counters for one slice of a test's history (an hour, a browser, ...).
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct FailureBucket {
    pub key: String,
    pub runs: u64,
    pub failures: u64,
}

impl FailureBucket {
    #[must_use]
    pub fn failure_rate(&self) -> Option<f64> {
        ratio(self.failures, self.runs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct TimeBuckets {
    pub hour_of_day: Vec<FailureBucket>,
    pub day_of_week: Vec<FailureBucket>,
}

impl TimeBuckets {
    pub fn iter(&self) -> impl Iterator<Item = &FailureBucket> {
        self.hour_of_day.iter().chain(self.day_of_week.iter())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct EnvironmentBuckets {
    pub environment: Vec<FailureBucket>,
    pub browser: Vec<FailureBucket>,
    pub os: Vec<FailureBucket>,
}

impl EnvironmentBuckets {
    /// Each dimension is compared only against itself.
    #[must_use]
    pub fn dimensions(&self) -> [(&'static str, &[FailureBucket]); 3] {
        [
            ("environment", self.environment.as_slice()),
            ("browser", self.browser.as_slice()),
            ("os", self.os.as_slice()),
        ]
    }
}

/// Immutable snapshot of a test's run history, computed by the remote API.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TestRunStatistics {
    pub test_id: TestId,
    pub total_runs: u64,
    pub pass_count: u64,
    pub fail_count: u64,
    #[serde(default)]
    pub retry_count: u64,
    #[serde(default)]
    pub passed_on_retry_count: u64,
    /// Oldest first.
    #[serde(default)]
    pub recent_outcomes: Vec<RunOutcome>,
    #[serde(default)]
    pub time_buckets: Option<TimeBuckets>,
    #[serde(default)]
    pub environment_buckets: Option<EnvironmentBuckets>,
}

impl TestRunStatistics {
    /// Validates counter consistency of a fetched snapshot.
    ///
    /// # Errors
    /// Returns [`FlakeError::Validation`] when counters contradict each other.
    pub fn validate(&self) -> Result<(), FlakeError> {
        if self.test_id.as_str().trim().is_empty() {
            return Err(FlakeError::Validation(
                "test_id MUST be a non-empty string".to_string(),
            ));
        }

        if self.pass_count.saturating_add(self.fail_count) > self.total_runs {
            return Err(FlakeError::Validation(format!(
                "{}: pass_count + fail_count MUST be <= total_runs",
                self.test_id
            )));
        }

        if self.passed_on_retry_count > self.retry_count {
            return Err(FlakeError::Validation(format!(
                "{}: passed_on_retry_count MUST be <= retry_count",
                self.test_id
            )));
        }

        let time_buckets = self
            .time_buckets
            .iter()
            .flat_map(|buckets| buckets.iter());
        let environment_buckets = self
            .environment_buckets
            .iter()
            .flat_map(|buckets| {
                buckets
                    .dimensions()
                    .into_iter()
                    .flat_map(|(_, items)| items.iter())
            });

        for bucket in time_buckets.chain(environment_buckets) {
            if bucket.failures > bucket.runs {
                return Err(FlakeError::Validation(format!(
                    "{}: bucket {} has more failures than runs",
                    self.test_id, bucket.key
                )));
            }
        }

        Ok(())
    }

    #[must_use]
    pub fn failure_rate(&self) -> Option<f64> {
        ratio(self.fail_count, self.total_runs)
    }

    /// Decodes and validates a statistics snapshot from JSON.
    ///
    /// Missing optional fields (retry counters, buckets, history) default to
    /// empty.
    ///
    /// # Errors
    /// Returns [`FlakeError::Validation`] when decoding or validation fails.
    pub fn from_json(value: &Value) -> Result<Self, FlakeError> {
        let stats: Self = serde_json::from_value(value.clone()).map_err(|err| {
            FlakeError::Validation(format!("invalid statistics JSON payload: {err}"))
        })?;
        stats.validate()?;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use serde_json::json;

    #[test]
    fn optional_fields_default_when_missing() {
        let stats = must_ok(TestRunStatistics::from_json(&json!({
            "test_id": "login/renders",
            "total_runs": 10,
            "pass_count": 8,
            "fail_count": 2
        })));

        assert_eq!(stats.retry_count, 0);
        assert!(stats.recent_outcomes.is_empty());
        assert!(stats.time_buckets.is_none());
        assert!(stats.environment_buckets.is_none());
    }

    #[test]
    fn partial_bucket_objects_are_tolerated() {
        let stats = must_ok(TestRunStatistics::from_json(&json!({
            "test_id": "login/renders",
            "total_runs": 10,
            "pass_count": 8,
            "fail_count": 2,
            "environment_buckets": {
                "browser": [{ "key": "firefox", "runs": 4, "failures": 2 }]
            }
        })));

        let buckets = must_some(stats.environment_buckets);
        assert_eq!(buckets.browser.len(), 1);
        assert!(buckets.os.is_empty());
    }

    #[test]
    fn inconsistent_counters_are_rejected() {
        let mut stats = fixture_stats(10, 4);
        stats.pass_count = 7;
        assert!(stats.validate().is_err());

        let mut stats = fixture_stats(10, 4);
        stats.retry_count = 1;
        stats.passed_on_retry_count = 2;
        assert!(stats.validate().is_err());

        let mut stats = fixture_stats(10, 4);
        stats.time_buckets = Some(TimeBuckets {
            hour_of_day: vec![FailureBucket {
                key: "03".to_string(),
                runs: 1,
                failures: 2,
            }],
            day_of_week: Vec::new(),
        });
        assert!(stats.validate().is_err());
    }
}
