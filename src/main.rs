//! CLI surface (spec §6): `execute-plan`, `show-run`, `cancel-run`,
//! `list-runs`, plus the additive `resume-review` (SPEC_FULL.md §15,
//! Open Question 2).
//!
//! Grounded on the teacher's `clap`-derive `Cli`/`Commands` shape and
//! its `#[tokio::main]` dispatch, with exit codes carrying the Run's
//! final state instead of the teacher's always-zero-or-anyhow-bail
//! pattern (spec §6).

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use minipipe::antipattern::AntiPatternParams;
use minipipe::config::{CliOverrides, RuntimeConfig, RuntimeConfigFile};
use minipipe::errors::EngineError;
use minipipe::events::EventBus;
use minipipe::ledger::Ledger;
use minipipe::model::{LedgerState, RunState};
use minipipe::orchestrator::{Orchestrator, OrchestratorConfig};
use minipipe::patterns::PatternRegistry;
use minipipe::plan::load_plan;
use minipipe::resilience::{BreakerParams, CircuitBreaker};
use minipipe::router::{Router, RoutingRule, RoutingStrategyKind};
use minipipe::store::StateStore;
use minipipe::tools::ToolProfile;
use minipipe::workspace::WorkspaceManager;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "minipipe", version, about = "Autonomous code-modification pipeline execution engine")]
struct Cli {
    /// Path to `minipipe.toml`. Defaults to `./minipipe.toml` if present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Raise log verbosity to debug.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate and execute a Plan to completion (or cancellation/quarantine).
    ExecutePlan {
        /// Path to the Plan file (JSON or YAML).
        plan: PathBuf,
        /// Path to the repository the workspace worktrees are cloned from.
        #[arg(long, default_value = ".")]
        repo: PathBuf,
        /// Git ref each task's workspace is checked out from.
        #[arg(long, default_value = "HEAD")]
        base_ref: String,
        /// Tool profiles + routing rules (JSON or YAML).
        #[arg(long)]
        tool_config: PathBuf,
        #[arg(long)]
        max_concurrency: Option<usize>,
        #[arg(long)]
        deterministic: bool,
        /// Router strategy (spec §4.6): `fixed`, `round-robin`, or
        /// `metrics-based` (fed from real attempt outcomes as the run
        /// progresses, not just the first candidate).
        #[arg(long, value_enum, default_value = "fixed")]
        routing_strategy: RoutingStrategyKind,
    },
    /// Print a Run's current state and stats.
    ShowRun { run_id: String },
    /// Request cooperative cancellation of a running Run.
    CancelRun { run_id: String },
    /// List known Runs, optionally filtered by state.
    ListRuns {
        #[arg(long)]
        state: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Approve or reject a patch parked in `awaiting_review`.
    ResumeReview {
        #[arg(long)]
        run_id: String,
        #[arg(long)]
        patch_id: String,
        #[command(subcommand)]
        decision: ReviewDecision,
    },
}

#[derive(Subcommand)]
enum ReviewDecision {
    Approve,
    Reject {
        #[arg(long, default_value = "reviewer rejected patch")]
        reason: String,
    },
}

/// Tool config file shape: routing rules plus the profiles they route
/// to, loaded together so `execute-plan` needs only one `--tool-config`
/// flag (spec §4.6/§4.7 split as two types sharing one file for CLI
/// convenience).
#[derive(Debug, Deserialize)]
struct ToolConfigFile {
    #[serde(default)]
    rules: Vec<RoutingRule>,
    #[serde(default)]
    profiles: Vec<ToolProfile>,
}

fn load_tool_config(path: &Path) -> Result<ToolConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read tool config: {}", path.display()))?;
    let parsed = if path.extension().and_then(|e| e.to_str()) == Some("json") {
        serde_json::from_str(&content).context("failed to parse tool config as JSON")?
    } else {
        serde_yaml::from_str(&content).context("failed to parse tool config as YAML")?
    };
    Ok(parsed)
}

fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("minipipe")
        .join("logs")
}

/// Installs a stderr layer (human-facing, level-filtered by `--verbose`
/// / `RUST_LOG`) plus a daily-rotating file layer under the local data
/// directory, mirroring the teacher's declared-but-never-wired
/// `tracing-appender` dependency (SPEC_FULL.md §11). Returns the
/// non-blocking writer's guard, which must outlive `main`.
fn init_tracing(verbose: bool) -> tracing_appender::non_blocking::WorkerGuard {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let log_dir = default_log_dir();
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(log_dir, "minipipe.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false),
        )
        .init();

    guard
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.verbose);

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(error = %err, "minipipe exited with an error");
            eprintln!("error: {err:#}");
            ExitCode::from(70)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let cwd = std::env::current_dir().context("failed to read current directory")?;
    let file = match &cli.config {
        Some(path) => RuntimeConfigFile::load(path)?,
        None => RuntimeConfigFile::load_or_default(&cwd)?,
    };

    match cli.command {
        Commands::ExecutePlan { plan, repo, base_ref, tool_config, max_concurrency, deterministic, routing_strategy } => {
            cmd_execute_plan(
                &file, plan, repo, base_ref, tool_config, max_concurrency, deterministic, routing_strategy,
            )
            .await
        }
        Commands::ShowRun { run_id } => cmd_show_run(&file, &run_id),
        Commands::CancelRun { run_id } => cmd_cancel_run(&file, &run_id),
        Commands::ListRuns { state, limit, offset } => cmd_list_runs(&file, state, limit, offset),
        Commands::ResumeReview { run_id, patch_id, decision } => {
            cmd_resume_review(&file, &run_id, &patch_id, decision)
        }
    }
}

async fn cmd_execute_plan(
    file: &RuntimeConfigFile,
    plan_path: PathBuf,
    repo: PathBuf,
    base_ref: String,
    tool_config_path: PathBuf,
    cli_max_concurrency: Option<usize>,
    cli_deterministic: bool,
    routing_strategy: RoutingStrategyKind,
) -> Result<ExitCode> {
    let overrides = CliOverrides {
        max_concurrency: cli_max_concurrency,
        deterministic: if cli_deterministic { Some(true) } else { None },
    };
    let config = RuntimeConfig::resolve(file, overrides);
    config.ensure_directories()?;

    let mut plan = load_plan(&plan_path)
        .with_context(|| format!("failed to load plan {}", plan_path.display()))?;
    plan.globals.max_concurrency = config.max_concurrency;
    plan.globals.deterministic_id_mode = config.deterministic;

    let tool_config = load_tool_config(&tool_config_path)?;
    let mut profiles: HashMap<String, ToolProfile> = HashMap::new();
    for profile in tool_config.profiles {
        profiles.insert(profile.tool_id.clone(), profile);
    }

    let store = Arc::new(StateStore::open(&config.store_path)?);
    let events = Arc::new(EventBus::new(256));
    let router = Arc::new(Router::new(
        tool_config.rules,
        profiles.clone(),
        routing_strategy.build(),
    ));
    let breaker = Arc::new(CircuitBreaker::new(BreakerParams::default()));
    let workspace = Arc::new(WorkspaceManager::new(
        repo,
        config.workspace_root.clone(),
        config.workspace_retention_cap,
    ));
    let patterns = Arc::new(PatternRegistry::load(&config.pattern_root)?);

    let orchestrator_config = OrchestratorConfig {
        base_ref,
        mock_mode: config.mock_mode,
        anti_pattern_params: AntiPatternParams::default(),
        oscillation_window: 5,
        oscillation_threshold: 3,
    };
    let orchestrator = Orchestrator::new(
        store, events, router, breaker, workspace, patterns, profiles, orchestrator_config,
    );

    let now_millis: u64 = chrono::Utc::now().timestamp_millis().try_into().unwrap_or(0);

    match orchestrator.execute_plan(&plan, now_millis).await {
        Ok(run) => {
            println!("{}", serde_json::to_string_pretty(&run)?);
            Ok(exit_code_for_run_state(run.state))
        }
        Err(EngineError::Plan(err)) => {
            eprintln!("invalid plan: {err}");
            Ok(ExitCode::from(64))
        }
        Err(err) => Err(err.into()),
    }
}

fn exit_code_for_run_state(state: RunState) -> ExitCode {
    match state {
        RunState::Succeeded => ExitCode::from(0),
        RunState::Failed => ExitCode::from(2),
        RunState::Quarantined => ExitCode::from(3),
        RunState::Canceled => ExitCode::from(4),
        // execute_plan never returns with these states, but every
        // RunState must map to something.
        RunState::Pending | RunState::Running => ExitCode::from(70),
    }
}

fn cmd_show_run(file: &RuntimeConfigFile, run_id: &str) -> Result<ExitCode> {
    let config = RuntimeConfig::resolve(file, CliOverrides::default());
    let store = StateStore::open(&config.store_path)?;
    match store.get_run(run_id)? {
        Some(run) => {
            println!("{}", serde_json::to_string_pretty(&run)?);
            Ok(ExitCode::from(0))
        }
        None => {
            eprintln!("run '{run_id}' not found");
            Ok(ExitCode::from(65))
        }
    }
}

fn cmd_cancel_run(file: &RuntimeConfigFile, run_id: &str) -> Result<ExitCode> {
    let config = RuntimeConfig::resolve(file, CliOverrides::default());
    let store = StateStore::open(&config.store_path)?;
    if store.get_run(run_id)?.is_none() {
        eprintln!("run '{run_id}' not found");
        return Ok(ExitCode::from(65));
    }
    store.request_cancel(run_id)?;
    println!("cancellation requested for run '{run_id}'");
    Ok(ExitCode::from(0))
}

fn cmd_list_runs(
    file: &RuntimeConfigFile,
    state: Option<String>,
    limit: usize,
    offset: usize,
) -> Result<ExitCode> {
    let config = RuntimeConfig::resolve(file, CliOverrides::default());
    let store = StateStore::open(&config.store_path)?;
    let filter = state
        .map(|s| s.parse::<RunState>())
        .transpose()
        .context("invalid --state value")?;
    let runs = store.list_runs(filter)?;
    let page: Vec<_> = runs.into_iter().skip(offset).take(limit).collect();
    println!("{}", serde_json::to_string_pretty(&page)?);
    Ok(ExitCode::from(0))
}

fn cmd_resume_review(
    file: &RuntimeConfigFile,
    run_id: &str,
    patch_id: &str,
    decision: ReviewDecision,
) -> Result<ExitCode> {
    let config = RuntimeConfig::resolve(file, CliOverrides::default());
    let store = StateStore::open(&config.store_path)?;

    if store.get_run(run_id)?.is_none() {
        eprintln!("run '{run_id}' not found");
        return Ok(ExitCode::from(65));
    }
    let Some(mut entry) = store.get_ledger_entry(patch_id)? else {
        eprintln!("patch '{patch_id}' not found");
        return Ok(ExitCode::from(65));
    };
    if entry.state != LedgerState::AwaitingReview {
        eprintln!(
            "patch '{patch_id}' is not awaiting review (current state: {})",
            entry.state.as_str()
        );
        return Ok(ExitCode::from(66));
    }

    let (to, reason): (LedgerState, String) = match decision {
        ReviewDecision::Approve => (LedgerState::Queued, "reviewer approved patch".to_string()),
        ReviewDecision::Reject { reason } => (LedgerState::Dropped, reason),
    };

    Ledger::transition(&mut entry, to, reason, "operator")?;
    let transition = entry
        .transitions
        .last()
        .expect("Ledger::transition always pushes a transition on success");
    store.append_ledger_transition(patch_id, transition, entry.review_metadata.as_deref())?;

    println!("patch '{patch_id}' moved to {}", to.as_str());
    Ok(ExitCode::from(0))
}
