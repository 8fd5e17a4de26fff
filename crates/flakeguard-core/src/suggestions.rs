use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use tracing::{debug, warn};

use crate::{Assessment, FlakeError, RunOutcome, Severity, TestId, TestRunStatistics};

/// Cached analysis goes stale this long after it was generated.
pub const SUGGESTION_TTL: Duration = Duration::hours(24);
/// Most recent outcomes forwarded to the analysis provider.
pub const ANALYSIS_HISTORY_LIMIT: usize = 20;

/// Summary handed to the analysis provider on a cache miss.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisRequest {
    pub test_id: TestId,
    pub score: Option<f64>,
    pub severity: Option<Severity>,
    pub is_retry_flaky: bool,
    pub has_time_pattern: bool,
    pub has_environment_pattern: bool,
    pub total_runs: u64,
    pub fail_count: u64,
    /// Oldest first, at most [`ANALYSIS_HISTORY_LIMIT`] entries.
    pub recent_outcomes: Vec<RunOutcome>,
}

impl AnalysisRequest {
    #[must_use]
    pub fn new(stats: &TestRunStatistics, assessment: &Assessment) -> Self {
        let skip = stats
            .recent_outcomes
            .len()
            .saturating_sub(ANALYSIS_HISTORY_LIMIT);
        let assessed = assessment.assessed();

        Self {
            test_id: stats.test_id.clone(),
            score: assessment.score(),
            severity: assessment.severity(),
            is_retry_flaky: assessed.is_some_and(|a| a.is_retry_flaky),
            has_time_pattern: assessed.is_some_and(|a| a.has_time_pattern),
            has_environment_pattern: assessed.is_some_and(|a| a.has_environment_pattern),
            total_runs: stats.total_runs,
            fail_count: stats.fail_count,
            recent_outcomes: stats.recent_outcomes[skip..].to_vec(),
        }
    }
}

/// Remote generator of free-text remediation analysis.
pub trait AnalysisProvider {
    #[allow(clippy::missing_errors_doc)]
    fn analyze(&self, request: &AnalysisRequest) -> Result<String, FlakeError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SuggestionCacheEntry {
    pub test_id: TestId,
    pub analysis_text: String,
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
}

impl SuggestionCacheEntry {
    #[must_use]
    pub fn is_fresh(&self, now: OffsetDateTime, ttl: Duration) -> bool {
        now - self.generated_at < ttl
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AnalysisResult {
    Available {
        entry: SuggestionCacheEntry,
        from_cache: bool,
    },
    Unavailable {
        test_id: TestId,
        reason: String,
    },
}

/// Per-test analysis cache, safe to share across threads.
///
/// Stale entries are kept until overwritten or purged; reads simply stop
/// returning them.
#[derive(Debug)]
pub struct SuggestionCache {
    ttl: Duration,
    entries: RwLock<HashMap<TestId, SuggestionCacheEntry>>,
}

impl Default for SuggestionCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SuggestionCache {
    #[must_use]
    pub fn new() -> Self {
        Self::with_ttl(SUGGESTION_TTL)
    }

    #[must_use]
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn get(&self, test_id: &TestId, now: OffsetDateTime) -> Option<SuggestionCacheEntry> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(test_id)
            .filter(|entry| entry.is_fresh(now, self.ttl))
            .cloned()
    }

    /// Overwrites any existing entry for the same test.
    pub fn put(&self, entry: SuggestionCacheEntry) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(entry.test_id.clone(), entry);
    }

    /// Cached analysis when fresh, otherwise a provider call whose text is
    /// cached. Provider failures never escape as errors.
    pub fn analyze<P>(
        &self,
        provider: &P,
        stats: &TestRunStatistics,
        assessment: &Assessment,
        now: OffsetDateTime,
    ) -> AnalysisResult
    where
        P: AnalysisProvider + ?Sized,
    {
        if let Some(entry) = self.get(&stats.test_id, now) {
            debug!(test_id = %stats.test_id, "suggestion cache hit");
            return AnalysisResult::Available {
                entry,
                from_cache: true,
            };
        }

        debug!(test_id = %stats.test_id, "suggestion cache miss");
        self.request(provider, stats, assessment, now)
    }

    /// Forces a provider call and overwrites the cached entry on success.
    /// A failed refresh leaves the previous entry in place.
    pub fn refresh<P>(
        &self,
        provider: &P,
        stats: &TestRunStatistics,
        assessment: &Assessment,
        now: OffsetDateTime,
    ) -> AnalysisResult
    where
        P: AnalysisProvider + ?Sized,
    {
        self.request(provider, stats, assessment, now)
    }

    /// Drops entries that are no longer fresh and returns how many went.
    pub fn purge_stale(&self, now: OffsetDateTime) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, entry| entry.is_fresh(now, self.ttl));
        before - entries.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn request<P>(
        &self,
        provider: &P,
        stats: &TestRunStatistics,
        assessment: &Assessment,
        now: OffsetDateTime,
    ) -> AnalysisResult
    where
        P: AnalysisProvider + ?Sized,
    {
        let request = AnalysisRequest::new(stats, assessment);
        match provider.analyze(&request) {
            Ok(analysis_text) => {
                let entry = SuggestionCacheEntry {
                    test_id: stats.test_id.clone(),
                    analysis_text,
                    generated_at: now,
                };
                self.put(entry.clone());
                AnalysisResult::Available {
                    entry,
                    from_cache: false,
                }
            }
            Err(err) => {
                warn!(test_id = %stats.test_id, error = %err, "analysis unavailable");
                AnalysisResult::Unavailable {
                    test_id: stats.test_id.clone(),
                    reason: err.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use crate::{assess, PatternThresholds};
    use std::cell::Cell;

    struct CountingProvider {
        calls: Cell<usize>,
        fail: bool,
    }

    impl CountingProvider {
        fn new(fail: bool) -> Self {
            Self {
                calls: Cell::new(0),
                fail,
            }
        }
    }

    impl AnalysisProvider for CountingProvider {
        fn analyze(&self, request: &AnalysisRequest) -> Result<String, FlakeError> {
            self.calls.set(self.calls.get() + 1);
            if self.fail {
                return Err(FlakeError::Analysis("upstream returned 503".to_string()));
            }
            Ok(format!("call {} for {}", self.calls.get(), request.test_id))
        }
    }

    fn entry_at(generated_at: &str) -> SuggestionCacheEntry {
        SuggestionCacheEntry {
            test_id: fixture_test_id(),
            analysis_text: "wait for the payment iframe before clicking".to_string(),
            generated_at: must_utc(generated_at),
        }
    }

    #[test]
    fn entry_is_served_at_23_hours_and_stale_at_25() {
        let cache = SuggestionCache::new();
        cache.put(entry_at("2026-03-01T00:00:00Z"));

        assert!(cache
            .get(&fixture_test_id(), must_utc("2026-03-01T23:00:00Z"))
            .is_some());
        assert!(cache
            .get(&fixture_test_id(), must_utc("2026-03-02T01:00:00Z"))
            .is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn exactly_24_hours_is_stale() {
        let cache = SuggestionCache::new();
        cache.put(entry_at("2026-03-01T00:00:00Z"));
        assert!(cache
            .get(&fixture_test_id(), must_utc("2026-03-02T00:00:00Z"))
            .is_none());
    }

    #[test]
    fn analyze_calls_provider_once_while_fresh() {
        let cache = SuggestionCache::new();
        let provider = CountingProvider::new(false);
        let stats = fixture_stats(20, 9);
        let assessment = must_ok(assess(&stats, &PatternThresholds::v1()));

        let first = cache.analyze(&provider, &stats, &assessment, must_utc("2026-03-01T00:00:00Z"));
        let second = cache.analyze(&provider, &stats, &assessment, must_utc("2026-03-01T05:00:00Z"));

        assert!(matches!(first, AnalysisResult::Available { from_cache: false, .. }));
        assert!(matches!(second, AnalysisResult::Available { from_cache: true, .. }));
        assert_eq!(provider.calls.get(), 1);

        let later = cache.analyze(&provider, &stats, &assessment, must_utc("2026-03-02T06:00:00Z"));
        assert!(matches!(later, AnalysisResult::Available { from_cache: false, .. }));
        assert_eq!(provider.calls.get(), 2);
    }

    #[test]
    fn refresh_overwrites_a_fresh_entry() {
        let cache = SuggestionCache::new();
        let provider = CountingProvider::new(false);
        let stats = fixture_stats(20, 9);
        let assessment = must_ok(assess(&stats, &PatternThresholds::v1()));
        let now = must_utc("2026-03-01T00:00:00Z");

        cache.analyze(&provider, &stats, &assessment, now);
        let refreshed = cache.refresh(&provider, &stats, &assessment, now);

        let AnalysisResult::Available { entry, from_cache } = refreshed else {
            panic!("expected refreshed analysis");
        };
        assert!(!from_cache);
        assert!(entry.analysis_text.starts_with("call 2"));
        assert_eq!(must_some(cache.get(&stats.test_id, now)), entry);
    }

    #[test]
    fn provider_failure_is_reported_not_raised() {
        let cache = SuggestionCache::new();
        let provider = CountingProvider::new(true);
        let stats = fixture_stats(20, 9);
        let assessment = must_ok(assess(&stats, &PatternThresholds::v1()));

        let result = cache.analyze(&provider, &stats, &assessment, must_utc("2026-03-01T00:00:00Z"));
        match result {
            AnalysisResult::Unavailable { test_id, reason } => {
                assert_eq!(test_id, stats.test_id);
                assert!(reason.contains("503"));
            }
            AnalysisResult::Available { .. } => panic!("expected unavailable analysis"),
        }
        assert!(cache.is_empty());
    }

    #[test]
    fn failed_refresh_keeps_previous_entry() {
        let cache = SuggestionCache::new();
        cache.put(entry_at("2026-03-01T00:00:00Z"));
        let stats = fixture_stats(20, 9);
        let assessment = must_ok(assess(&stats, &PatternThresholds::v1()));
        let now = must_utc("2026-03-01T01:00:00Z");

        let result = cache.refresh(&CountingProvider::new(true), &stats, &assessment, now);
        assert!(matches!(result, AnalysisResult::Unavailable { .. }));
        assert_eq!(must_some(cache.get(&stats.test_id, now)), entry_at("2026-03-01T00:00:00Z"));
    }

    #[test]
    fn purge_removes_only_stale_entries() {
        let cache = SuggestionCache::new();
        cache.put(entry_at("2026-03-01T00:00:00Z"));
        cache.put(SuggestionCacheEntry {
            test_id: must_ok(TestId::new("search/filters-by-price")),
            analysis_text: "mock the clock".to_string(),
            generated_at: must_utc("2026-03-02T00:00:00Z"),
        });

        assert_eq!(cache.purge_stale(must_utc("2026-03-02T06:00:00Z")), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn request_truncates_history_to_most_recent() {
        let mut stats = fixture_stats(30, 10);
        stats.recent_outcomes = (0..30)
            .map(|index| {
                if index < 10 {
                    RunOutcome::Skipped
                } else if index % 2 == 0 {
                    RunOutcome::Failed
                } else {
                    RunOutcome::Passed
                }
            })
            .collect();

        let request = AnalysisRequest::new(&stats, &must_ok(assess(&stats, &PatternThresholds::v1())));
        assert_eq!(request.recent_outcomes.len(), ANALYSIS_HISTORY_LIMIT);
        assert!(!request.recent_outcomes.contains(&RunOutcome::Skipped));
        assert_eq!(request.severity, Some(Severity::Low));
    }

    #[test]
    fn request_for_insufficient_data_carries_no_score() {
        let stats = fixture_stats(0, 0);
        let request = AnalysisRequest::new(&stats, &must_ok(assess(&stats, &PatternThresholds::v1())));
        assert_eq!(request.score, None);
        assert!(!request.is_retry_flaky);
    }

    #[test]
    fn cache_is_shared_across_threads() {
        let cache = SuggestionCache::new();
        let now = must_utc("2026-03-01T12:00:00Z");

        std::thread::scope(|scope| {
            for worker in 0..8 {
                let cache = &cache;
                scope.spawn(move || {
                    let test_id = must_ok(TestId::new(format!("suite/worker-{worker}")));
                    for round in 0..50 {
                        cache.put(SuggestionCacheEntry {
                            test_id: test_id.clone(),
                            analysis_text: format!("worker {worker} round {round}"),
                            generated_at: now,
                        });
                        let seen = must_some(cache.get(&test_id, now));
                        assert_eq!(seen.test_id, test_id);
                        assert!(seen.analysis_text.starts_with(&format!("worker {worker} ")));
                    }
                });
            }
        });

        assert_eq!(cache.len(), 8);
        for worker in 0..8 {
            let test_id = must_ok(TestId::new(format!("suite/worker-{worker}")));
            let entry = must_some(cache.get(&test_id, now));
            assert_eq!(entry.analysis_text, format!("worker {worker} round 49"));
        }
    }
}
