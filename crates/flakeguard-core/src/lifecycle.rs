use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::{
    assess, should_auto_quarantine, Assessment, AutoQuarantineConfig, FlakeError,
    PatternThresholds, QuarantineReason, QuarantineState, TestId, TestRunStatistics, Transition,
};

/// Persistence boundary for quarantine state and organization config.
///
/// `save_quarantine_state` is a compare-and-swap: it must fail with
/// [`FlakeError::Conflict`] unless the stored `state_version` equals
/// `expected_version` (0 when no row exists), and on success return the
/// state as persisted with its advanced version.
pub trait QuarantineStore {
    #[allow(clippy::missing_errors_doc)]
    fn load_quarantine_state(&self, test_id: &TestId)
        -> Result<Option<QuarantineState>, FlakeError>;

    #[allow(clippy::missing_errors_doc)]
    fn save_quarantine_state(
        &mut self,
        state: &QuarantineState,
        expected_version: u64,
    ) -> Result<QuarantineState, FlakeError>;

    #[allow(clippy::missing_errors_doc)]
    fn load_auto_quarantine_config(
        &self,
        org_id: &str,
    ) -> Result<Option<AutoQuarantineConfig>, FlakeError>;

    #[allow(clippy::missing_errors_doc)]
    fn save_auto_quarantine_config(
        &mut self,
        org_id: &str,
        config: &AutoQuarantineConfig,
    ) -> Result<(), FlakeError>;
}

pub trait QuarantineNotifier {
    #[allow(clippy::missing_errors_doc)]
    fn notify_quarantined(&self, notice: &QuarantineNotice) -> Result<(), FlakeError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuarantineNotice {
    pub org_id: String,
    pub test_id: TestId,
    pub reason: QuarantineReason,
    #[serde(with = "time::serde::rfc3339")]
    pub quarantined_at: OffsetDateTime,
    pub score: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransitionOutcome {
    pub state: QuarantineState,
    pub changed: bool,
    pub notified: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvaluationOutcome {
    pub assessment: Assessment,
    pub quarantine_recommended: bool,
    pub transition: TransitionOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SweepFailure {
    pub test_id: TestId,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SweepReport {
    pub evaluated: usize,
    pub insufficient_data: usize,
    pub recommended: usize,
    pub newly_quarantined: usize,
    pub already_quarantined: usize,
    pub notified: usize,
    pub failures: Vec<SweepFailure>,
}

/// Drives quarantine transitions for one organization.
///
/// In-memory state is only ever what the store confirmed: a failed write
/// leaves the caller with the error and nothing else.
pub struct QuarantineLifecycle<'a, S, N> {
    org_id: String,
    store: &'a mut S,
    notifier: &'a N,
}

impl<'a, S, N> QuarantineLifecycle<'a, S, N>
where
    S: QuarantineStore,
    N: QuarantineNotifier,
{
    pub fn new(org_id: impl Into<String>, store: &'a mut S, notifier: &'a N) -> Self {
        Self {
            org_id: org_id.into(),
            store,
            notifier,
        }
    }

    #[must_use]
    pub fn org_id(&self) -> &str {
        &self.org_id
    }

    /// The organization's stored config, or organization defaults.
    ///
    /// # Errors
    /// Returns the store's error when loading fails.
    pub fn config(&self) -> Result<AutoQuarantineConfig, FlakeError> {
        Ok(self
            .store
            .load_auto_quarantine_config(&self.org_id)?
            .unwrap_or_else(AutoQuarantineConfig::organization_defaults))
    }

    /// Replaces the organization's config after validating it.
    ///
    /// # Errors
    /// Returns [`FlakeError::Configuration`] for invalid values or the
    /// store's error when saving fails.
    pub fn update_config(&mut self, config: &AutoQuarantineConfig) -> Result<(), FlakeError> {
        config.validate()?;
        self.store
            .save_auto_quarantine_config(&self.org_id, config)?;
        info!(
            org_id = %self.org_id,
            enabled = config.enabled,
            threshold = config.threshold,
            min_runs = config.min_runs,
            "auto-quarantine config updated"
        );
        Ok(())
    }

    /// Current state; tests never seen before are reported as active.
    ///
    /// # Errors
    /// Returns the store's error when loading fails.
    pub fn state(&self, test_id: &TestId) -> Result<QuarantineState, FlakeError> {
        Ok(self
            .store
            .load_quarantine_state(test_id)?
            .unwrap_or_else(|| QuarantineState::new(test_id.clone())))
    }

    /// # Errors
    /// Returns [`FlakeError::Conflict`] when a concurrent writer advanced the
    /// state first, or the store's error when persistence fails.
    pub fn quarantine(
        &mut self,
        test_id: &TestId,
        reason: QuarantineReason,
        now: OffsetDateTime,
    ) -> Result<TransitionOutcome, FlakeError> {
        let config = self.config()?;
        self.apply_quarantine(test_id, reason, now, None, &config)
    }

    /// # Errors
    /// Returns [`FlakeError::Conflict`] when a concurrent writer advanced the
    /// state first, or the store's error when persistence fails.
    pub fn release(
        &mut self,
        test_id: &TestId,
        now: OffsetDateTime,
    ) -> Result<TransitionOutcome, FlakeError> {
        let current = self.state(test_id)?;
        match current.release(now) {
            Transition::Unchanged => {
                debug!(test_id = %test_id, "release ignored: test is not quarantined");
                Ok(TransitionOutcome {
                    state: current,
                    changed: false,
                    notified: false,
                })
            }
            Transition::Changed(next) => {
                let persisted = self
                    .store
                    .save_quarantine_state(&next, current.state_version)?;
                info!(
                    org_id = %self.org_id,
                    test_id = %test_id,
                    state_version = persisted.state_version,
                    "test released from quarantine"
                );
                Ok(TransitionOutcome {
                    state: persisted,
                    changed: true,
                    notified: false,
                })
            }
        }
    }

    /// Scores one test without deciding on quarantine. The test's default
    /// active row is persisted if it has none yet.
    ///
    /// # Errors
    /// Returns [`FlakeError::Validation`] for inconsistent statistics, or
    /// store errors from loading or persisting state.
    pub fn assess(
        &mut self,
        stats: &TestRunStatistics,
        thresholds: &PatternThresholds,
    ) -> Result<(Assessment, QuarantineState), FlakeError> {
        let assessment = assess(stats, thresholds)?;
        let state = self.ensure_state(&stats.test_id)?;
        Ok((assessment, state))
    }

    /// On-demand check for one test: assess, decide, and apply the
    /// auto-quarantine transition when recommended.
    ///
    /// # Errors
    /// Returns [`FlakeError::Validation`] for inconsistent statistics, or
    /// store errors from loading config or persisting state.
    pub fn evaluate(
        &mut self,
        stats: &TestRunStatistics,
        thresholds: &PatternThresholds,
        now: OffsetDateTime,
    ) -> Result<EvaluationOutcome, FlakeError> {
        let config = self.config()?;
        self.evaluate_with(stats, thresholds, now, &config)
    }

    /// Evaluates every snapshot against one config load. Per-test failures
    /// are collected and do not stop the sweep.
    ///
    /// # Errors
    /// Returns the store's error only when the config itself cannot be
    /// loaded.
    pub fn sweep(
        &mut self,
        snapshots: &[TestRunStatistics],
        thresholds: &PatternThresholds,
        now: OffsetDateTime,
    ) -> Result<SweepReport, FlakeError> {
        let config = self.config()?;
        let mut report = SweepReport::default();

        for stats in snapshots {
            report.evaluated += 1;
            match self.evaluate_with(stats, thresholds, now, &config) {
                Ok(outcome) => {
                    if matches!(outcome.assessment, Assessment::InsufficientData { .. }) {
                        report.insufficient_data += 1;
                    }
                    if outcome.quarantine_recommended {
                        report.recommended += 1;
                        if outcome.transition.changed {
                            report.newly_quarantined += 1;
                        } else {
                            report.already_quarantined += 1;
                        }
                    }
                    if outcome.transition.notified {
                        report.notified += 1;
                    }
                }
                Err(err) => {
                    warn!(test_id = %stats.test_id, error = %err, "sweep evaluation failed");
                    report.failures.push(SweepFailure {
                        test_id: stats.test_id.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }

        info!(
            org_id = %self.org_id,
            evaluated = report.evaluated,
            newly_quarantined = report.newly_quarantined,
            failures = report.failures.len(),
            "auto-quarantine sweep finished"
        );
        Ok(report)
    }

    fn evaluate_with(
        &mut self,
        stats: &TestRunStatistics,
        thresholds: &PatternThresholds,
        now: OffsetDateTime,
        config: &AutoQuarantineConfig,
    ) -> Result<EvaluationOutcome, FlakeError> {
        let assessment = assess(stats, thresholds)?;
        let quarantine_recommended = should_auto_quarantine(&assessment, stats.total_runs, config);

        let transition = if quarantine_recommended {
            self.apply_quarantine(
                &stats.test_id,
                QuarantineReason::AutoThreshold,
                now,
                assessment.score(),
                config,
            )?
        } else {
            TransitionOutcome {
                state: self.ensure_state(&stats.test_id)?,
                changed: false,
                notified: false,
            }
        };

        Ok(EvaluationOutcome {
            assessment,
            quarantine_recommended,
            transition,
        })
    }

    fn apply_quarantine(
        &mut self,
        test_id: &TestId,
        reason: QuarantineReason,
        now: OffsetDateTime,
        score: Option<f64>,
        config: &AutoQuarantineConfig,
    ) -> Result<TransitionOutcome, FlakeError> {
        let current = self.state(test_id)?;
        let next = match current.quarantine(reason, now) {
            Transition::Unchanged => {
                debug!(test_id = %test_id, "quarantine ignored: test already quarantined");
                return Ok(TransitionOutcome {
                    state: current,
                    changed: false,
                    notified: false,
                });
            }
            Transition::Changed(next) => next,
        };

        let persisted = self
            .store
            .save_quarantine_state(&next, current.state_version)?;
        info!(
            org_id = %self.org_id,
            test_id = %test_id,
            reason = reason.as_str(),
            state_version = persisted.state_version,
            "test quarantined"
        );

        let notified = config.notify_on_quarantine && self.notify(&persisted, reason, now, score);
        Ok(TransitionOutcome {
            state: persisted,
            changed: true,
            notified,
        })
    }

    /// Persists the default active row the first time a test is assessed.
    fn ensure_state(&mut self, test_id: &TestId) -> Result<QuarantineState, FlakeError> {
        if let Some(existing) = self.store.load_quarantine_state(test_id)? {
            return Ok(existing);
        }

        match self
            .store
            .save_quarantine_state(&QuarantineState::new(test_id.clone()), 0)
        {
            Ok(created) => Ok(created),
            Err(FlakeError::Conflict { .. }) => self.state(test_id),
            Err(err) => Err(err),
        }
    }

    fn notify(
        &self,
        state: &QuarantineState,
        reason: QuarantineReason,
        now: OffsetDateTime,
        score: Option<f64>,
    ) -> bool {
        let notice = QuarantineNotice {
            org_id: self.org_id.clone(),
            test_id: state.test_id.clone(),
            reason,
            quarantined_at: state.quarantined_at.unwrap_or(now),
            score,
        };

        match self.notifier.notify_quarantined(&notice) {
            Ok(()) => true,
            Err(err) => {
                warn!(test_id = %state.test_id, error = %err, "quarantine notification failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use crate::QuarantineStatus;
    use std::cell::RefCell;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct MemoryStore {
        states: BTreeMap<TestId, QuarantineState>,
        configs: BTreeMap<String, AutoQuarantineConfig>,
        fail_writes: bool,
    }

    impl QuarantineStore for MemoryStore {
        fn load_quarantine_state(
            &self,
            test_id: &TestId,
        ) -> Result<Option<QuarantineState>, FlakeError> {
            Ok(self.states.get(test_id).cloned())
        }

        fn save_quarantine_state(
            &mut self,
            state: &QuarantineState,
            expected_version: u64,
        ) -> Result<QuarantineState, FlakeError> {
            if self.fail_writes {
                return Err(FlakeError::Persistence("disk unavailable".to_string()));
            }
            let stored_version = self
                .states
                .get(&state.test_id)
                .map_or(0, |existing| existing.state_version);
            if stored_version != expected_version {
                return Err(FlakeError::Conflict {
                    test_id: state.test_id.to_string(),
                    expected: expected_version,
                });
            }
            let mut persisted = state.clone();
            persisted.state_version = expected_version + 1;
            self.states
                .insert(persisted.test_id.clone(), persisted.clone());
            Ok(persisted)
        }

        fn load_auto_quarantine_config(
            &self,
            org_id: &str,
        ) -> Result<Option<AutoQuarantineConfig>, FlakeError> {
            Ok(self.configs.get(org_id).cloned())
        }

        fn save_auto_quarantine_config(
            &mut self,
            org_id: &str,
            config: &AutoQuarantineConfig,
        ) -> Result<(), FlakeError> {
            self.configs.insert(org_id.to_string(), config.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        notices: RefCell<Vec<QuarantineNotice>>,
        fail: bool,
    }

    impl QuarantineNotifier for RecordingNotifier {
        fn notify_quarantined(&self, notice: &QuarantineNotice) -> Result<(), FlakeError> {
            if self.fail {
                return Err(FlakeError::Notification("webhook timed out".to_string()));
            }
            self.notices.borrow_mut().push(notice.clone());
            Ok(())
        }
    }

    fn enabled_store() -> MemoryStore {
        let mut store = MemoryStore::default();
        store.configs.insert(
            "org-1".to_string(),
            AutoQuarantineConfig {
                enabled: true,
                threshold: 0.7,
                min_runs: 5,
                notify_on_quarantine: true,
            },
        );
        store
    }

    #[test]
    fn manual_quarantine_persists_and_notifies() {
        let mut store = enabled_store();
        let notifier = RecordingNotifier::default();
        let mut lifecycle = QuarantineLifecycle::new("org-1", &mut store, &notifier);

        let at = must_utc("2026-03-01T09:00:00Z");
        let outcome = must_ok(lifecycle.quarantine(&fixture_test_id(), QuarantineReason::Manual, at));

        assert!(outcome.changed);
        assert!(outcome.notified);
        assert_eq!(outcome.state.status, QuarantineStatus::Quarantined);
        assert_eq!(outcome.state.state_version, 1);
        assert_eq!(notifier.notices.borrow().len(), 1);
        assert_eq!(notifier.notices.borrow()[0].quarantined_at, at);
    }

    #[test]
    fn second_quarantine_keeps_original_timestamp() {
        let mut store = enabled_store();
        let notifier = RecordingNotifier::default();
        let mut lifecycle = QuarantineLifecycle::new("org-1", &mut store, &notifier);
        let test_id = fixture_test_id();

        let first = must_ok(lifecycle.quarantine(
            &test_id,
            QuarantineReason::Manual,
            must_utc("2026-03-01T09:00:00Z"),
        ));
        let second = must_ok(lifecycle.quarantine(
            &test_id,
            QuarantineReason::Manual,
            must_utc("2026-03-04T09:00:00Z"),
        ));

        assert!(!second.changed);
        assert_eq!(second.state.quarantined_at, first.state.quarantined_at);
        assert_eq!(second.state.state_version, first.state.state_version);
        assert_eq!(notifier.notices.borrow().len(), 1);
    }

    #[test]
    fn release_of_active_test_does_not_write() {
        let mut store = enabled_store();
        let notifier = RecordingNotifier::default();
        let mut lifecycle = QuarantineLifecycle::new("org-1", &mut store, &notifier);

        let outcome = must_ok(lifecycle.release(&fixture_test_id(), must_utc("2026-03-01T09:00:00Z")));
        assert!(!outcome.changed);
        assert_eq!(outcome.state.released_at, None);
        drop(lifecycle);
        assert!(store.states.is_empty());
    }

    #[test]
    fn failed_write_leaves_state_unchanged() {
        let mut store = enabled_store();
        store.fail_writes = true;
        let notifier = RecordingNotifier::default();
        let mut lifecycle = QuarantineLifecycle::new("org-1", &mut store, &notifier);

        let result = lifecycle.quarantine(
            &fixture_test_id(),
            QuarantineReason::Manual,
            must_utc("2026-03-01T09:00:00Z"),
        );
        assert!(matches!(result, Err(FlakeError::Persistence(_))));
        assert!(!must_ok(lifecycle.state(&fixture_test_id())).is_quarantined());
        assert!(notifier.notices.borrow().is_empty());
    }

    #[test]
    fn lost_race_surfaces_conflict() {
        let mut store = enabled_store();
        let test_id = fixture_test_id();
        let mut winner = QuarantineState::new(test_id.clone());
        winner.state_version = 3;
        store.states.insert(test_id.clone(), winner);

        // The caller acts on a stale snapshot taken at version 2.
        let mut stale = QuarantineState::new(test_id.clone());
        stale.state_version = 2;
        let next = match stale.quarantine(QuarantineReason::Manual, must_utc("2026-03-01T09:00:00Z")) {
            Transition::Changed(next) => next,
            Transition::Unchanged => panic!("expected change"),
        };

        let result = store.save_quarantine_state(&next, stale.state_version);
        assert!(matches!(result, Err(FlakeError::Conflict { expected: 2, .. })));
        assert!(!store.states[&test_id].is_quarantined());
    }

    #[test]
    fn notification_failure_does_not_undo_transition() {
        let mut store = enabled_store();
        let notifier = RecordingNotifier {
            fail: true,
            ..RecordingNotifier::default()
        };
        let mut lifecycle = QuarantineLifecycle::new("org-1", &mut store, &notifier);

        let outcome = must_ok(lifecycle.quarantine(
            &fixture_test_id(),
            QuarantineReason::Manual,
            must_utc("2026-03-01T09:00:00Z"),
        ));
        assert!(outcome.changed);
        assert!(!outcome.notified);
        assert!(must_ok(lifecycle.state(&fixture_test_id())).is_quarantined());
    }

    #[test]
    fn notify_flag_off_skips_notifier() {
        let mut store = enabled_store();
        if let Some(config) = store.configs.get_mut("org-1") {
            config.notify_on_quarantine = false;
        }
        let notifier = RecordingNotifier::default();
        let mut lifecycle = QuarantineLifecycle::new("org-1", &mut store, &notifier);

        let outcome = must_ok(lifecycle.evaluate(
            &fixture_stats(10, 9),
            &PatternThresholds::v1(),
            must_utc("2026-03-01T09:00:00Z"),
        ));
        assert!(outcome.transition.changed);
        assert!(!outcome.transition.notified);
        assert!(notifier.notices.borrow().is_empty());
    }

    #[test]
    fn evaluate_creates_active_row_for_first_assessment() {
        let mut store = enabled_store();
        let notifier = RecordingNotifier::default();
        let mut lifecycle = QuarantineLifecycle::new("org-1", &mut store, &notifier);

        let outcome = must_ok(lifecycle.evaluate(
            &fixture_stats(10, 1),
            &PatternThresholds::v1(),
            must_utc("2026-03-01T09:00:00Z"),
        ));
        assert!(!outcome.quarantine_recommended);
        assert_eq!(outcome.transition.state.state_version, 1);
        drop(lifecycle);
        assert_eq!(store.states.len(), 1);
    }

    #[test]
    fn assess_tracks_test_without_quarantining() {
        let mut store = enabled_store();
        let notifier = RecordingNotifier::default();
        let mut lifecycle = QuarantineLifecycle::new("org-1", &mut store, &notifier);

        let (assessment, state) =
            must_ok(lifecycle.assess(&fixture_stats(10, 9), &PatternThresholds::v1()));
        assert_eq!(assessment.severity(), Some(crate::Severity::High));
        assert_eq!(state.status, QuarantineStatus::Active);
        assert_eq!(state.state_version, 1);

        let (_, again) = must_ok(lifecycle.assess(&fixture_stats(10, 9), &PatternThresholds::v1()));
        assert_eq!(again.state_version, 1);
        assert!(notifier.notices.borrow().is_empty());
    }

    #[test]
    fn released_test_is_requarantined_by_next_sweep() {
        let mut store = enabled_store();
        let notifier = RecordingNotifier::default();
        let mut lifecycle = QuarantineLifecycle::new("org-1", &mut store, &notifier);
        let stats = fixture_stats(20, 16);
        let thresholds = PatternThresholds::v1();

        let first = must_ok(lifecycle.sweep(
            std::slice::from_ref(&stats),
            &thresholds,
            must_utc("2026-03-01T09:00:00Z"),
        ));
        assert_eq!(first.newly_quarantined, 1);

        must_ok(lifecycle.release(&stats.test_id, must_utc("2026-03-02T09:00:00Z")));

        let second = must_ok(lifecycle.sweep(
            std::slice::from_ref(&stats),
            &thresholds,
            must_utc("2026-03-03T09:00:00Z"),
        ));
        assert_eq!(second.newly_quarantined, 1);

        let state = must_ok(lifecycle.state(&stats.test_id));
        assert_eq!(state.quarantined_at, Some(must_utc("2026-03-03T09:00:00Z")));
        assert_eq!(state.released_at, Some(must_utc("2026-03-02T09:00:00Z")));
        assert_eq!(state.quarantine_reason, Some(QuarantineReason::AutoThreshold));
    }

    #[test]
    fn sweep_counts_and_collects_failures() {
        let mut store = enabled_store();
        let notifier = RecordingNotifier::default();
        let mut lifecycle = QuarantineLifecycle::new("org-1", &mut store, &notifier);

        let mut broken = fixture_stats(10, 2);
        broken.test_id = must_ok(TestId::new("cart/broken-counters"));
        broken.pass_count = 20;
        let mut never_ran = fixture_stats(0, 0);
        never_ran.test_id = must_ok(TestId::new("cart/never-ran"));
        let mut flaky = fixture_stats(10, 8);
        flaky.test_id = must_ok(TestId::new("cart/flaky"));

        let now = must_utc("2026-03-01T09:00:00Z");
        let report = must_ok(lifecycle.sweep(
            &[broken, never_ran, flaky.clone()],
            &PatternThresholds::v1(),
            now,
        ));

        assert_eq!(report.evaluated, 3);
        assert_eq!(report.insufficient_data, 1);
        assert_eq!(report.recommended, 1);
        assert_eq!(report.newly_quarantined, 1);
        assert_eq!(report.notified, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].test_id.as_str(), "cart/broken-counters");

        let again = must_ok(lifecycle.sweep(&[flaky], &PatternThresholds::v1(), now));
        assert_eq!(again.already_quarantined, 1);
        assert_eq!(again.newly_quarantined, 0);
    }

    #[test]
    fn unknown_org_uses_defaults_and_rejects_bad_updates() {
        let mut store = MemoryStore::default();
        let notifier = RecordingNotifier::default();
        let mut lifecycle = QuarantineLifecycle::new("org-new", &mut store, &notifier);

        assert_eq!(
            must_ok(lifecycle.config()),
            AutoQuarantineConfig::organization_defaults()
        );

        let mut bad = AutoQuarantineConfig::organization_defaults();
        bad.min_runs = 0;
        assert!(lifecycle.update_config(&bad).is_err());
        assert_eq!(lifecycle.org_id(), "org-new");
    }
}
