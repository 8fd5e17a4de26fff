//! Command surface for flaky-test assessment and quarantine management.
//!
//! Hosts can embed the same behavior the `flakeguard` binary exposes:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_flake_with_db`] for direct [`FlakeCommand`] execution against a DB path.
//! - [`run_flake`] for execution against an existing [`SqliteFlakeStore`].
//!
//! Every command prints one pretty JSON document on stdout. Logs go to stderr.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use flakeguard_analysis::{HttpAnalysisConfig, HttpJsonAnalysisProvider, MockAnalysisProvider};
use flakeguard_core::{
    assess, now_utc, parse_rfc3339_utc, should_auto_quarantine, AnalysisProvider, AnalysisResult,
    Assessment, FlakeError, PatternThresholds, QuarantineLifecycle, QuarantineNotice,
    QuarantineNotifier, QuarantineReason, RetryStrategy, SuggestionCache, TestId,
    TestRunStatistics,
};
use flakeguard_store_sqlite::SqliteFlakeStore;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::info;

const DEFAULT_ORG_ID: &str = "default";

#[derive(Debug, Parser)]
#[command(name = "flakeguard")]
#[command(about = "Flaky test assessment and quarantine CLI")]
pub struct Cli {
    #[arg(long, default_value = "./flakeguard.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Flake {
        #[command(subcommand)]
        command: Box<FlakeCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum FlakeCommand {
    /// Score one test. Records it as tracked but never quarantines it.
    Assess(AssessArgs),
    Quarantine {
        #[command(subcommand)]
        command: Box<QuarantineCommand>,
    },
    Sweep(SweepArgs),
    Config {
        #[command(subcommand)]
        command: Box<ConfigCommand>,
    },
    RetryStrategy {
        #[command(subcommand)]
        command: Box<RetryStrategyCommand>,
    },
    Analyze(AnalyzeArgs),
}

#[derive(Debug, Args)]
pub struct AssessArgs {
    #[arg(long)]
    stats: PathBuf,
    #[arg(long)]
    patterns: Option<PathBuf>,
    #[arg(long, default_value = DEFAULT_ORG_ID)]
    org_id: String,
}

#[derive(Debug, Subcommand)]
pub enum QuarantineCommand {
    Add(QuarantineArgs),
    Release(QuarantineArgs),
    Show(TestArgs),
    History(HistoryArgs),
    List,
}

#[derive(Debug, Args)]
pub struct QuarantineArgs {
    #[arg(long)]
    test_id: String,
    #[arg(long, default_value = DEFAULT_ORG_ID)]
    org_id: String,
    #[arg(long)]
    at: Option<String>,
}

#[derive(Debug, Args)]
pub struct TestArgs {
    #[arg(long)]
    test_id: String,
}

#[derive(Debug, Args)]
pub struct HistoryArgs {
    #[arg(long)]
    test_id: String,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
pub struct SweepArgs {
    /// JSON array of statistics snapshots.
    #[arg(long)]
    stats: PathBuf,
    #[arg(long)]
    patterns: Option<PathBuf>,
    #[arg(long, default_value = DEFAULT_ORG_ID)]
    org_id: String,
    #[arg(long)]
    at: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    Show(OrgArgs),
    Set(ConfigSetArgs),
}

#[derive(Debug, Args)]
pub struct OrgArgs {
    #[arg(long, default_value = DEFAULT_ORG_ID)]
    org_id: String,
}

#[derive(Debug, Args)]
pub struct ConfigSetArgs {
    #[arg(long, default_value = DEFAULT_ORG_ID)]
    org_id: String,
    #[arg(long)]
    enabled: Option<bool>,
    #[arg(long)]
    threshold: Option<f64>,
    #[arg(long)]
    min_runs: Option<u64>,
    #[arg(long)]
    notify_on_quarantine: Option<bool>,
}

#[derive(Debug, Subcommand)]
pub enum RetryStrategyCommand {
    Show(OrgArgs),
    Set(RetryStrategySetArgs),
    Recommend(RetryRecommendArgs),
}

#[derive(Debug, Args)]
pub struct RetryStrategySetArgs {
    #[arg(long, default_value = DEFAULT_ORG_ID)]
    org_id: String,
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Args)]
pub struct RetryRecommendArgs {
    #[arg(long, default_value = DEFAULT_ORG_ID)]
    org_id: String,
    #[arg(long, conflicts_with = "stats")]
    score: Option<f64>,
    #[arg(long)]
    stats: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct AnalyzeArgs {
    #[arg(long)]
    stats: PathBuf,
    #[arg(long)]
    patterns: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = ProviderArg::Mock)]
    provider: ProviderArg,
    #[arg(long, conflicts_with = "provider_params")]
    url: Option<String>,
    /// JSON object with `url`, `timeout_ms`, `headers` and `auth_bearer_env`.
    #[arg(long)]
    provider_params: Option<PathBuf>,
    #[arg(long)]
    timeout_ms: Option<u64>,
    #[arg(long)]
    refresh: bool,
    #[arg(long)]
    at: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProviderArg {
    Mock,
    Http,
}

#[derive(Debug, Serialize)]
struct AssessReport {
    assessment: Assessment,
    recommended_retries: u32,
    quarantine_recommended: bool,
    quarantined: bool,
}

/// Emits quarantine notices as structured `info` events on stderr.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl QuarantineNotifier for LogNotifier {
    fn notify_quarantined(&self, notice: &QuarantineNotice) -> Result<(), FlakeError> {
        info!(
            org_id = %notice.org_id,
            test_id = %notice.test_id,
            reason = notice.reason.as_str(),
            score = notice.score,
            "quarantine notification"
        );
        Ok(())
    }
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when opening or migrating the database fails, or when
/// command execution fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Flake { command } => run_flake_with_db(&cli.db, *command),
    }
}

/// # Errors
/// Returns an error when opening or migrating the database fails, or when
/// command execution fails.
pub fn run_flake_with_db(db_path: &Path, command: FlakeCommand) -> Result<()> {
    let mut store = SqliteFlakeStore::open(db_path)?;
    store.migrate()?;
    run_flake(command, &mut store)
}

/// # Errors
/// Returns an error when inputs are invalid or a store operation fails.
pub fn run_flake(command: FlakeCommand, store: &mut SqliteFlakeStore) -> Result<()> {
    match command {
        FlakeCommand::Assess(args) => {
            let stats = read_stats(&args.stats)?;
            let thresholds = read_thresholds(args.patterns.as_deref())?;
            let strategy = store
                .get_retry_strategy(&args.org_id)?
                .unwrap_or_else(RetryStrategy::v1);

            let notifier = LogNotifier;
            let mut lifecycle = QuarantineLifecycle::new(args.org_id, store, &notifier);
            let config = lifecycle.config()?;
            let (assessment, state) = lifecycle.assess(&stats, &thresholds)?;
            let quarantined = state.is_quarantined();

            let report = AssessReport {
                recommended_retries: strategy.recommend(assessment.score()),
                quarantine_recommended: should_auto_quarantine(
                    &assessment,
                    stats.total_runs,
                    &config,
                ),
                quarantined,
                assessment,
            };
            print_json(&report)
        }
        FlakeCommand::Quarantine { command } => run_quarantine(*command, store),
        FlakeCommand::Sweep(args) => {
            let snapshots = read_stats_list(&args.stats)?;
            let thresholds = read_thresholds(args.patterns.as_deref())?;
            let at = parse_optional_utc(args.at.as_deref())?;

            let notifier = LogNotifier;
            let mut lifecycle = QuarantineLifecycle::new(args.org_id, store, &notifier);
            let report = lifecycle.sweep(&snapshots, &thresholds, at)?;
            print_json(&report)
        }
        FlakeCommand::Config { command } => run_config(*command, store),
        FlakeCommand::RetryStrategy { command } => run_retry_strategy(*command, store),
        FlakeCommand::Analyze(args) => run_analyze(args, store),
    }
}

fn run_quarantine(command: QuarantineCommand, store: &mut SqliteFlakeStore) -> Result<()> {
    let notifier = LogNotifier;
    match command {
        QuarantineCommand::Add(args) => {
            let test_id = parse_test_id(&args.test_id)?;
            let at = parse_optional_utc(args.at.as_deref())?;
            let mut lifecycle = QuarantineLifecycle::new(args.org_id, store, &notifier);
            let outcome = lifecycle.quarantine(&test_id, QuarantineReason::Manual, at)?;
            print_json(&outcome)
        }
        QuarantineCommand::Release(args) => {
            let test_id = parse_test_id(&args.test_id)?;
            let at = parse_optional_utc(args.at.as_deref())?;
            let mut lifecycle = QuarantineLifecycle::new(args.org_id, store, &notifier);
            let outcome = lifecycle.release(&test_id, at)?;
            print_json(&outcome)
        }
        QuarantineCommand::Show(args) => {
            let test_id = parse_test_id(&args.test_id)?;
            let lifecycle = QuarantineLifecycle::new(DEFAULT_ORG_ID, store, &notifier);
            print_json(&lifecycle.state(&test_id)?)
        }
        QuarantineCommand::History(args) => {
            let test_id = parse_test_id(&args.test_id)?;
            print_json(&store.list_transitions(&test_id, args.limit)?)
        }
        QuarantineCommand::List => print_json(&store.list_quarantined()?),
    }
}

fn run_config(command: ConfigCommand, store: &mut SqliteFlakeStore) -> Result<()> {
    let notifier = LogNotifier;
    match command {
        ConfigCommand::Show(args) => {
            let lifecycle = QuarantineLifecycle::new(args.org_id, store, &notifier);
            print_json(&lifecycle.config()?)
        }
        ConfigCommand::Set(args) => {
            let mut lifecycle = QuarantineLifecycle::new(args.org_id, store, &notifier);
            let mut config = lifecycle.config()?;
            if let Some(enabled) = args.enabled {
                config.enabled = enabled;
            }
            if let Some(threshold) = args.threshold {
                config.threshold = threshold;
            }
            if let Some(min_runs) = args.min_runs {
                config.min_runs = min_runs;
            }
            if let Some(notify) = args.notify_on_quarantine {
                config.notify_on_quarantine = notify;
            }
            lifecycle.update_config(&config)?;
            print_json(&config)
        }
    }
}

fn run_retry_strategy(command: RetryStrategyCommand, store: &SqliteFlakeStore) -> Result<()> {
    match command {
        RetryStrategyCommand::Show(args) => {
            let strategy = store
                .get_retry_strategy(&args.org_id)?
                .unwrap_or_else(RetryStrategy::v1);
            print_json(&strategy)
        }
        RetryStrategyCommand::Set(args) => {
            let value = read_json_file(&args.file)?;
            let strategy = RetryStrategy::from_json(&value)?;
            store.upsert_retry_strategy(&args.org_id, &strategy)?;
            print_json(&strategy)
        }
        RetryStrategyCommand::Recommend(args) => {
            let strategy = store
                .get_retry_strategy(&args.org_id)?
                .unwrap_or_else(RetryStrategy::v1);
            let score = match (args.score, args.stats) {
                (Some(score), _) => Some(score),
                (None, Some(path)) => flakeguard_core::flakiness_score(&read_stats(&path)?),
                (None, None) => return Err(anyhow!("either --score or --stats is required")),
            };
            print_json(&json!({
                "score": score,
                "recommended_retries": strategy.recommend(score),
                "max_retries": strategy.max_retries,
            }))
        }
    }
}

fn run_analyze(args: AnalyzeArgs, store: &SqliteFlakeStore) -> Result<()> {
    let stats = read_stats(&args.stats)?;
    let thresholds = read_thresholds(args.patterns.as_deref())?;
    let at = parse_optional_utc(args.at.as_deref())?;
    let assessment = assess(&stats, &thresholds)?;

    let provider: Box<dyn AnalysisProvider> = match args.provider {
        ProviderArg::Mock => Box::new(MockAnalysisProvider::new()),
        ProviderArg::Http => {
            let mut config = match (args.provider_params, args.url) {
                (Some(path), _) => HttpAnalysisConfig::from_params(&read_json_file(&path)?)?,
                (None, Some(url)) => HttpAnalysisConfig::new(url),
                (None, None) => {
                    return Err(anyhow!(
                        "--url or --provider-params is required with --provider http"
                    ))
                }
            };
            if let Some(timeout_ms) = args.timeout_ms {
                config.timeout_ms = timeout_ms;
            }
            Box::new(HttpJsonAnalysisProvider::new(config))
        }
    };

    let cache = SuggestionCache::new();
    if let Some(entry) = store.get_suggestion(&stats.test_id)? {
        cache.put(entry);
    }

    let result = if args.refresh {
        cache.refresh(provider.as_ref(), &stats, &assessment, at)
    } else {
        cache.analyze(provider.as_ref(), &stats, &assessment, at)
    };

    if let AnalysisResult::Available {
        entry,
        from_cache: false,
    } = &result
    {
        store.put_suggestion(entry)?;
    }

    print_json(&json!({
        "assessment": assessment,
        "analysis": result,
    }))
}

fn read_json_file(path: &Path) -> Result<Value> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("{} must be valid JSON", path.display()))
}

fn read_stats(path: &Path) -> Result<TestRunStatistics> {
    let value = read_json_file(path)?;
    Ok(TestRunStatistics::from_json(&value)?)
}

/// Decodes without validating; the sweep reports inconsistent snapshots
/// per test instead of rejecting the whole batch.
fn read_stats_list(path: &Path) -> Result<Vec<TestRunStatistics>> {
    match read_json_file(path)? {
        Value::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(index, item)| {
                serde_json::from_value(item)
                    .with_context(|| format!("invalid statistics entry at index {index}"))
            })
            .collect(),
        _ => Err(anyhow!("{} must contain a JSON array", path.display())),
    }
}

fn read_thresholds(path: Option<&Path>) -> Result<PatternThresholds> {
    match path {
        Some(path) => Ok(PatternThresholds::from_json(&read_json_file(path)?)?),
        None => Ok(PatternThresholds::v1()),
    }
}

fn parse_optional_utc(raw: Option<&str>) -> Result<time::OffsetDateTime> {
    match raw {
        Some(value) => parse_rfc3339_utc(value).map_err(|err| anyhow!("invalid timestamp: {err}")),
        None => Ok(now_utc()),
    }
}

fn parse_test_id(raw: &str) -> Result<TestId> {
    TestId::new(raw).with_context(|| format!("invalid test id: {raw:?}"))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
