use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::{Assessment, FlakeError, TestId};

pub const AUTO_QUARANTINE_MIN_THRESHOLD: f64 = 0.3;
pub const AUTO_QUARANTINE_MAX_THRESHOLD: f64 = 1.0;
pub const AUTO_QUARANTINE_MIN_RUNS: u64 = 2;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AutoQuarantineConfig {
    pub enabled: bool,
    pub threshold: f64,
    pub min_runs: u64,
    pub notify_on_quarantine: bool,
}

impl Default for AutoQuarantineConfig {
    fn default() -> Self {
        Self::organization_defaults()
    }
}

impl AutoQuarantineConfig {
    /// Settings a new organization starts with; auto-quarantine is opt-in.
    #[must_use]
    pub fn organization_defaults() -> Self {
        Self {
            enabled: false,
            threshold: 0.7,
            min_runs: 5,
            notify_on_quarantine: true,
        }
    }

    /// # Errors
    /// Returns [`FlakeError::Configuration`] when `threshold` is outside
    /// `[0.3, 1.0]` or `min_runs` is below 2.
    pub fn validate(&self) -> Result<(), FlakeError> {
        if !(AUTO_QUARANTINE_MIN_THRESHOLD..=AUTO_QUARANTINE_MAX_THRESHOLD).contains(&self.threshold)
        {
            return Err(FlakeError::Configuration(format!(
                "threshold MUST be in [{AUTO_QUARANTINE_MIN_THRESHOLD}, {AUTO_QUARANTINE_MAX_THRESHOLD}]"
            )));
        }

        if self.min_runs < AUTO_QUARANTINE_MIN_RUNS {
            return Err(FlakeError::Configuration(format!(
                "min_runs MUST be >= {AUTO_QUARANTINE_MIN_RUNS}"
            )));
        }

        Ok(())
    }

    /// Decodes and validates an auto-quarantine config from JSON.
    ///
    /// # Errors
    /// Returns [`FlakeError::Configuration`] when JSON decoding fails
    /// or decoded values violate config constraints.
    pub fn from_json(value: &Value) -> Result<Self, FlakeError> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|err| {
            FlakeError::Configuration(format!("invalid auto-quarantine JSON payload: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }
}

/// Pure quarantine recommendation. Never mutates state; callers apply the
/// transition, which is a no-op for tests already quarantined.
#[must_use]
pub fn should_auto_quarantine(
    assessment: &Assessment,
    total_runs: u64,
    config: &AutoQuarantineConfig,
) -> bool {
    if !config.enabled || total_runs < config.min_runs {
        return false;
    }

    assessment
        .score()
        .is_some_and(|score| score >= config.threshold)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QuarantineStatus {
    Active,
    Quarantined,
}

impl QuarantineStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Quarantined => "quarantined",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "quarantined" => Some(Self::Quarantined),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QuarantineReason {
    Manual,
    AutoThreshold,
}

impl QuarantineReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::AutoThreshold => "auto_threshold",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "manual" => Some(Self::Manual),
            "auto_threshold" => Some(Self::AutoThreshold),
            _ => None,
        }
    }
}

/// Per-test quarantine membership.
///
/// `state_version` is 0 for a state that has never been persisted and is
/// advanced by the store on every durable write.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuarantineState {
    pub test_id: TestId,
    pub status: QuarantineStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub quarantined_at: Option<OffsetDateTime>,
    pub quarantine_reason: Option<QuarantineReason>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub released_at: Option<OffsetDateTime>,
    pub state_version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    Changed(QuarantineState),
}

impl QuarantineState {
    #[must_use]
    pub fn new(test_id: TestId) -> Self {
        Self {
            test_id,
            status: QuarantineStatus::Active,
            quarantined_at: None,
            quarantine_reason: None,
            released_at: None,
            state_version: 0,
        }
    }

    #[must_use]
    pub fn is_quarantined(&self) -> bool {
        self.status == QuarantineStatus::Quarantined
    }

    /// `Active -> Quarantined`. Already quarantined tests keep their
    /// original `quarantined_at` and reason.
    #[must_use]
    pub fn quarantine(&self, reason: QuarantineReason, at: OffsetDateTime) -> Transition {
        if self.is_quarantined() {
            return Transition::Unchanged;
        }

        Transition::Changed(Self {
            test_id: self.test_id.clone(),
            status: QuarantineStatus::Quarantined,
            quarantined_at: Some(at),
            quarantine_reason: Some(reason),
            released_at: self.released_at,
            state_version: self.state_version,
        })
    }

    /// `Quarantined -> Active`. Releasing an active test changes nothing.
    #[must_use]
    pub fn release(&self, at: OffsetDateTime) -> Transition {
        if !self.is_quarantined() {
            return Transition::Unchanged;
        }

        Transition::Changed(Self {
            test_id: self.test_id.clone(),
            status: QuarantineStatus::Active,
            quarantined_at: self.quarantined_at,
            quarantine_reason: None,
            released_at: Some(at),
            state_version: self.state_version,
        })
    }

    /// Checks the field combinations a persisted row may hold.
    ///
    /// # Errors
    /// Returns [`FlakeError::Validation`] for a quarantined state without
    /// timestamp or reason, or an active state that still carries a reason.
    pub fn validate(&self) -> Result<(), FlakeError> {
        match self.status {
            QuarantineStatus::Quarantined => {
                if self.quarantined_at.is_none() || self.quarantine_reason.is_none() {
                    return Err(FlakeError::Validation(format!(
                        "{}: quarantined state requires quarantined_at and quarantine_reason",
                        self.test_id
                    )));
                }
            }
            QuarantineStatus::Active => {
                if self.quarantine_reason.is_some() {
                    return Err(FlakeError::Validation(format!(
                        "{}: active state MUST NOT carry a quarantine_reason",
                        self.test_id
                    )));
                }
            }
        }
        Ok(())
    }
}
