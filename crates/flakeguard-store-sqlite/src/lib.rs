#![allow(clippy::missing_errors_doc)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use flakeguard_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, AutoQuarantineConfig, FlakeError,
    QuarantineReason, QuarantineState, QuarantineStatus, QuarantineStore, RetryStrategy,
    SuggestionCacheEntry, TestId,
};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::debug;
use ulid::Ulid;

const FLAKE_MIGRATION_VERSION: i64 = 1;

const SCHEMA_FLAKE_V1: &str = r"
CREATE TABLE IF NOT EXISTS quarantine_state (
  test_id TEXT PRIMARY KEY,
  status TEXT NOT NULL CHECK (status IN ('active', 'quarantined')),
  quarantined_at TEXT,
  quarantine_reason TEXT CHECK (
    quarantine_reason IN ('manual', 'auto_threshold') OR quarantine_reason IS NULL
  ),
  released_at TEXT,
  state_version INTEGER NOT NULL CHECK (state_version >= 1),
  updated_at TEXT NOT NULL,
  CHECK (
    status = 'active'
    OR (quarantined_at IS NOT NULL AND quarantine_reason IS NOT NULL)
  ),
  CHECK (status = 'quarantined' OR quarantine_reason IS NULL)
);

CREATE TABLE IF NOT EXISTS quarantine_transitions (
  transition_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  transition_id TEXT NOT NULL UNIQUE,
  test_id TEXT NOT NULL,
  from_status TEXT CHECK (from_status IN ('active', 'quarantined') OR from_status IS NULL),
  to_status TEXT NOT NULL CHECK (to_status IN ('active', 'quarantined')),
  reason TEXT CHECK (reason IN ('manual', 'auto_threshold') OR reason IS NULL),
  state_version INTEGER NOT NULL CHECK (state_version >= 1),
  occurred_at TEXT NOT NULL,
  recorded_at TEXT NOT NULL,
  FOREIGN KEY (test_id) REFERENCES quarantine_state(test_id)
);

CREATE TRIGGER IF NOT EXISTS trg_quarantine_transitions_no_update
BEFORE UPDATE ON quarantine_transitions
BEGIN
  SELECT RAISE(FAIL, 'quarantine_transitions is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_quarantine_transitions_no_delete
BEFORE DELETE ON quarantine_transitions
BEGIN
  SELECT RAISE(FAIL, 'quarantine_transitions is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_quarantine_transitions_test_seq
  ON quarantine_transitions(test_id, transition_seq);

CREATE INDEX IF NOT EXISTS idx_quarantine_state_status
  ON quarantine_state(status, test_id);

CREATE TABLE IF NOT EXISTS auto_quarantine_configs (
  org_id TEXT PRIMARY KEY,
  config_json TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS retry_strategies (
  org_id TEXT PRIMARY KEY,
  strategy_json TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS suggestion_cache (
  test_id TEXT PRIMARY KEY,
  analysis_text TEXT NOT NULL,
  generated_at TEXT NOT NULL
);
";

const QUARANTINE_STATE_COLUMNS: &str =
    "test_id, status, quarantined_at, quarantine_reason, released_at, state_version";

pub struct SqliteFlakeStore {
    conn: Connection,
}

/// Result of a compare-and-swap write on `quarantine_state`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateWrite {
    Written(QuarantineState),
    Conflict { stored_version: u64 },
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct QuarantineTransitionRecord {
    pub transition_seq: i64,
    pub transition_id: Ulid,
    pub test_id: TestId,
    pub from_status: Option<QuarantineStatus>,
    pub to_status: QuarantineStatus,
    pub reason: Option<QuarantineReason>,
    pub state_version: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

impl SqliteFlakeStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_FLAKE_V1)
            .context("failed to apply flakeguard schema")?;

        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![FLAKE_MIGRATION_VERSION, timestamp(now_utc())?],
            )
            .context("failed to register flakeguard schema migration")?;

        Ok(())
    }

    pub fn get_quarantine_state(&self, test_id: &TestId) -> Result<Option<QuarantineState>> {
        self.conn
            .query_row(
                &format!("SELECT {QUARANTINE_STATE_COLUMNS} FROM quarantine_state WHERE test_id = ?1"),
                params![test_id.as_str()],
                parse_quarantine_state_row,
            )
            .optional()
            .with_context(|| format!("failed to load quarantine state for {test_id}"))
    }

    pub fn list_quarantined(&self) -> Result<Vec<QuarantineState>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {QUARANTINE_STATE_COLUMNS} FROM quarantine_state
             WHERE status = 'quarantined'
             ORDER BY test_id ASC"
        ))?;
        let rows = stmt.query_map([], parse_quarantine_state_row)?;
        collect_rows(rows)
    }

    /// Writes `state` only when the stored version still equals
    /// `expected_version` (0 when no row exists). A status change appends a
    /// transition row in the same transaction.
    pub fn compare_and_set_quarantine_state(
        &mut self,
        state: &QuarantineState,
        expected_version: u64,
    ) -> Result<StateWrite> {
        state
            .validate()
            .map_err(|err| anyhow!("quarantine state validation failed: {err}"))?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start quarantine state transaction")?;

        let stored: Option<(i64, String)> = tx
            .query_row(
                "SELECT state_version, status FROM quarantine_state WHERE test_id = ?1",
                params![state.test_id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("failed to read stored state_version")?;

        let stored_version = match &stored {
            Some((version, _)) => u64::try_from(*version)
                .with_context(|| format!("invalid stored state_version: {version}"))?,
            None => 0,
        };
        if stored_version != expected_version {
            return Ok(StateWrite::Conflict { stored_version });
        }

        let previous_status = stored
            .as_ref()
            .map(|(_, status)| {
                QuarantineStatus::parse(status)
                    .ok_or_else(|| anyhow!("invalid stored status: {status}"))
            })
            .transpose()?;

        let next_version = expected_version + 1;
        let next_version_sql = i64::try_from(next_version)
            .with_context(|| format!("state_version overflow: {next_version}"))?;
        let recorded_at = now_utc();

        tx.execute(
            "INSERT INTO quarantine_state(
                test_id, status, quarantined_at, quarantine_reason,
                released_at, state_version, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(test_id) DO UPDATE SET
               status = excluded.status,
               quarantined_at = excluded.quarantined_at,
               quarantine_reason = excluded.quarantine_reason,
               released_at = excluded.released_at,
               state_version = excluded.state_version,
               updated_at = excluded.updated_at",
            params![
                state.test_id.as_str(),
                state.status.as_str(),
                optional_timestamp(state.quarantined_at)?,
                state.quarantine_reason.map(QuarantineReason::as_str),
                optional_timestamp(state.released_at)?,
                next_version_sql,
                timestamp(recorded_at)?,
            ],
        )
        .context("failed to write quarantine state")?;

        if previous_status.unwrap_or(QuarantineStatus::Active) != state.status {
            let occurred_at = match state.status {
                QuarantineStatus::Quarantined => state.quarantined_at,
                QuarantineStatus::Active => state.released_at,
            }
            .unwrap_or(recorded_at);

            tx.execute(
                "INSERT INTO quarantine_transitions(
                    transition_id, test_id, from_status, to_status, reason,
                    state_version, occurred_at, recorded_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    Ulid::new().to_string(),
                    state.test_id.as_str(),
                    previous_status.map(QuarantineStatus::as_str),
                    state.status.as_str(),
                    state.quarantine_reason.map(QuarantineReason::as_str),
                    next_version_sql,
                    timestamp(occurred_at)?,
                    timestamp(recorded_at)?,
                ],
            )
            .context("failed to append quarantine transition")?;
        }

        tx.commit()
            .context("failed to commit quarantine state transaction")?;

        debug!(
            test_id = %state.test_id,
            state_version = next_version,
            status = state.status.as_str(),
            "quarantine state written"
        );

        let mut written = state.clone();
        written.state_version = next_version;
        Ok(StateWrite::Written(written))
    }

    pub fn list_transitions(
        &self,
        test_id: &TestId,
        limit: Option<usize>,
    ) -> Result<Vec<QuarantineTransitionRecord>> {
        let mut query = "SELECT
                transition_seq, transition_id, test_id, from_status, to_status,
                reason, state_version, occurred_at, recorded_at
             FROM quarantine_transitions
             WHERE test_id = ?1
             ORDER BY transition_seq ASC"
            .to_string();

        if let Some(raw_limit) = limit {
            query.push_str(" LIMIT ");
            query.push_str(&raw_limit.to_string());
        }

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(params![test_id.as_str()], parse_transition_row)?;
        collect_rows(rows)
    }

    pub fn upsert_auto_quarantine_config(
        &self,
        org_id: &str,
        config: &AutoQuarantineConfig,
    ) -> Result<()> {
        config
            .validate()
            .map_err(|err| anyhow!("invalid auto-quarantine configuration: {err}"))?;
        let payload =
            serde_json::to_string(config).context("failed to serialize auto-quarantine config")?;

        self.conn
            .execute(
                "INSERT INTO auto_quarantine_configs(org_id, config_json, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(org_id) DO UPDATE SET
                   config_json = excluded.config_json,
                   updated_at = excluded.updated_at",
                params![org_id, payload, timestamp(now_utc())?],
            )
            .context("failed to upsert auto-quarantine config")?;

        Ok(())
    }

    pub fn get_auto_quarantine_config(&self, org_id: &str) -> Result<Option<AutoQuarantineConfig>> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT config_json FROM auto_quarantine_configs WHERE org_id = ?1",
                params![org_id],
                |row| row.get(0),
            )
            .optional()
            .context("failed to load auto-quarantine config")?;

        json.map(|raw| {
            let value: Value =
                serde_json::from_str(&raw).context("invalid stored auto-quarantine JSON")?;
            AutoQuarantineConfig::from_json(&value)
                .map_err(|err| anyhow!("failed to parse auto-quarantine config for {org_id}: {err}"))
        })
        .transpose()
    }

    pub fn upsert_retry_strategy(&self, org_id: &str, strategy: &RetryStrategy) -> Result<()> {
        strategy
            .validate()
            .map_err(|err| anyhow!("invalid retry strategy: {err}"))?;
        let payload =
            serde_json::to_string(strategy).context("failed to serialize retry strategy")?;

        self.conn
            .execute(
                "INSERT INTO retry_strategies(org_id, strategy_json, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(org_id) DO UPDATE SET
                   strategy_json = excluded.strategy_json,
                   updated_at = excluded.updated_at",
                params![org_id, payload, timestamp(now_utc())?],
            )
            .context("failed to upsert retry strategy")?;

        Ok(())
    }

    pub fn get_retry_strategy(&self, org_id: &str) -> Result<Option<RetryStrategy>> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT strategy_json FROM retry_strategies WHERE org_id = ?1",
                params![org_id],
                |row| row.get(0),
            )
            .optional()
            .context("failed to load retry strategy")?;

        json.map(|raw| {
            let value: Value =
                serde_json::from_str(&raw).context("invalid stored retry strategy JSON")?;
            RetryStrategy::from_json(&value)
                .map_err(|err| anyhow!("failed to parse retry strategy for {org_id}: {err}"))
        })
        .transpose()
    }

    pub fn put_suggestion(&self, entry: &SuggestionCacheEntry) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO suggestion_cache(test_id, analysis_text, generated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(test_id) DO UPDATE SET
                   analysis_text = excluded.analysis_text,
                   generated_at = excluded.generated_at",
                params![
                    entry.test_id.as_str(),
                    entry.analysis_text,
                    timestamp(entry.generated_at)?,
                ],
            )
            .context("failed to store suggestion")?;
        Ok(())
    }

    /// Stored suggestion regardless of age; freshness is the cache's call.
    pub fn get_suggestion(&self, test_id: &TestId) -> Result<Option<SuggestionCacheEntry>> {
        self.conn
            .query_row(
                "SELECT test_id, analysis_text, generated_at FROM suggestion_cache WHERE test_id = ?1",
                params![test_id.as_str()],
                parse_suggestion_row,
            )
            .optional()
            .with_context(|| format!("failed to load suggestion for {test_id}"))
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl QuarantineStore for SqliteFlakeStore {
    fn load_quarantine_state(
        &self,
        test_id: &TestId,
    ) -> Result<Option<QuarantineState>, FlakeError> {
        self.get_quarantine_state(test_id).map_err(to_flake_error)
    }

    fn save_quarantine_state(
        &mut self,
        state: &QuarantineState,
        expected_version: u64,
    ) -> Result<QuarantineState, FlakeError> {
        match self
            .compare_and_set_quarantine_state(state, expected_version)
            .map_err(to_flake_error)?
        {
            StateWrite::Written(written) => Ok(written),
            StateWrite::Conflict { .. } => Err(FlakeError::Conflict {
                test_id: state.test_id.to_string(),
                expected: expected_version,
            }),
        }
    }

    fn load_auto_quarantine_config(
        &self,
        org_id: &str,
    ) -> Result<Option<AutoQuarantineConfig>, FlakeError> {
        self.get_auto_quarantine_config(org_id)
            .map_err(to_flake_error)
    }

    fn save_auto_quarantine_config(
        &mut self,
        org_id: &str,
        config: &AutoQuarantineConfig,
    ) -> Result<(), FlakeError> {
        self.upsert_auto_quarantine_config(org_id, config)
            .map_err(to_flake_error)
    }
}

fn parse_quarantine_state_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<QuarantineState> {
    let test_id = parse_test_id(0, &row.get::<_, String>(0)?)?;
    let status_raw: String = row.get(1)?;
    let reason_raw: Option<String> = row.get(3)?;
    let version_i64: i64 = row.get(5)?;

    let status = QuarantineStatus::parse(&status_raw).ok_or_else(|| {
        invalid_column(1, rusqlite::types::Type::Text, format!("invalid status: {status_raw}"))
    })?;

    let quarantine_reason = reason_raw
        .as_deref()
        .map(|raw| {
            QuarantineReason::parse(raw).ok_or_else(|| {
                invalid_column(
                    3,
                    rusqlite::types::Type::Text,
                    format!("invalid quarantine_reason: {raw}"),
                )
            })
        })
        .transpose()?;

    let state_version = u64::try_from(version_i64).map_err(|_| {
        invalid_column(
            5,
            rusqlite::types::Type::Integer,
            format!("invalid state_version: {version_i64}"),
        )
    })?;

    Ok(QuarantineState {
        test_id,
        status,
        quarantined_at: parse_optional_timestamp(2, row.get(2)?)?,
        quarantine_reason,
        released_at: parse_optional_timestamp(4, row.get(4)?)?,
        state_version,
    })
}

fn parse_transition_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<QuarantineTransitionRecord> {
    let transition_id_raw: String = row.get(1)?;
    let from_raw: Option<String> = row.get(3)?;
    let to_raw: String = row.get(4)?;
    let reason_raw: Option<String> = row.get(5)?;
    let version_i64: i64 = row.get(6)?;

    let transition_id = Ulid::from_string(&transition_id_raw).map_err(|_| {
        invalid_column(
            1,
            rusqlite::types::Type::Text,
            format!("invalid transition_id ULID: {transition_id_raw}"),
        )
    })?;

    let parse_status = |index: usize, raw: &str| {
        QuarantineStatus::parse(raw).ok_or_else(|| {
            invalid_column(index, rusqlite::types::Type::Text, format!("invalid status: {raw}"))
        })
    };

    let from_status = from_raw.as_deref().map(|raw| parse_status(3, raw)).transpose()?;
    let to_status = parse_status(4, &to_raw)?;
    let reason = reason_raw
        .as_deref()
        .map(|raw| {
            QuarantineReason::parse(raw).ok_or_else(|| {
                invalid_column(5, rusqlite::types::Type::Text, format!("invalid reason: {raw}"))
            })
        })
        .transpose()?;
    let state_version = u64::try_from(version_i64).map_err(|_| {
        invalid_column(
            6,
            rusqlite::types::Type::Integer,
            format!("invalid state_version: {version_i64}"),
        )
    })?;

    Ok(QuarantineTransitionRecord {
        transition_seq: row.get(0)?,
        transition_id,
        test_id: parse_test_id(2, &row.get::<_, String>(2)?)?,
        from_status,
        to_status,
        reason,
        state_version,
        occurred_at: parse_timestamp(7, &row.get::<_, String>(7)?)?,
        recorded_at: parse_timestamp(8, &row.get::<_, String>(8)?)?,
    })
}

fn parse_suggestion_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SuggestionCacheEntry> {
    Ok(SuggestionCacheEntry {
        test_id: parse_test_id(0, &row.get::<_, String>(0)?)?,
        analysis_text: row.get(1)?,
        generated_at: parse_timestamp(2, &row.get::<_, String>(2)?)?,
    })
}

fn parse_test_id(index: usize, raw: &str) -> rusqlite::Result<TestId> {
    TestId::new(raw).map_err(|err| invalid_column(index, rusqlite::types::Type::Text, err.to_string()))
}

fn parse_timestamp(index: usize, raw: &str) -> rusqlite::Result<OffsetDateTime> {
    parse_rfc3339_utc(raw)
        .map_err(|err| invalid_column(index, rusqlite::types::Type::Text, err.to_string()))
}

fn parse_optional_timestamp(
    index: usize,
    raw: Option<String>,
) -> rusqlite::Result<Option<OffsetDateTime>> {
    raw.as_deref()
        .map(|value| parse_timestamp(index, value))
        .transpose()
}

fn invalid_column(index: usize, kind: rusqlite::types::Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        kind,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn timestamp(value: OffsetDateTime) -> Result<String> {
    format_rfc3339(value).map_err(|err| anyhow!(err.to_string()))
}

fn optional_timestamp(value: Option<OffsetDateTime>) -> Result<Option<String>> {
    value.map(timestamp).transpose()
}

fn to_flake_error(err: anyhow::Error) -> FlakeError {
    FlakeError::Persistence(format!("{err:#}"))
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
