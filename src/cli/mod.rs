//! Command-line interface for stepwise.
//!
//! Provides commands for executing actions and sequences, inspecting runs
//! and their attempt logs, and cancelling runs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;

use crate::actions::ActionRegistry;
use crate::config;
use crate::core::{
    ActionExecutionResult, Engine, ExecutionOptions, RetryPreset, SequenceDefinition,
    TransitionOutcome,
};
use crate::domain::ResultKind;
use crate::store::{RunStore, SqliteRunStore};

/// stepwise - Idempotent action execution with retry and durable runs
#[derive(Parser, Debug)]
#[command(name = "stepwise")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Run database (overrides config)
    #[arg(long, global = true, env = "STEPWISE_DB")]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Execute a single action
    Run {
        /// Action type (see `stepwise actions`)
        action_type: String,

        /// Scenario the run belongs to
        #[arg(short, long, default_value = "cli")]
        scenario: String,

        /// Action config as JSON
        #[arg(short, long, default_value = "{}")]
        config: String,

        /// Action input as JSON
        #[arg(short, long, conflicts_with = "input_file")]
        input: Option<String>,

        /// Read action input JSON from a file
        #[arg(long)]
        input_file: Option<PathBuf>,

        /// Trigger key
        #[arg(short, long, default_value = "manual")]
        trigger: String,

        /// Correlation id (generated if omitted; reuse it to replay)
        #[arg(long)]
        correlation_id: Option<String>,

        /// Node id within the scenario
        #[arg(long)]
        node: Option<String>,

        /// Retry preset
        #[arg(short, long, value_enum)]
        retry: Option<PresetArg>,
    },

    /// Execute a sequence defined in YAML
    Sequence {
        /// Sequence file
        file: PathBuf,

        /// Shared correlation id (generated if omitted)
        #[arg(long)]
        correlation_id: Option<String>,
    },

    /// Show a run
    Status {
        run_id: String,
    },

    /// List recent runs
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Show the attempt log of a run
    Attempts {
        run_id: String,
    },

    /// Cancel a pending or running run
    Cancel {
        run_id: String,

        /// Reason recorded on the run
        #[arg(short, long)]
        reason: Option<String>,
    },

    /// List registered actions
    Actions,

    /// Show resolved configuration (debug)
    Config,
}

/// Retry preset for CLI (maps to RetryPreset)
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum PresetArg {
    Fast,
    Standard,
    Slow,
    External,
}

impl From<PresetArg> for RetryPreset {
    fn from(p: PresetArg) -> Self {
        match p {
            PresetArg::Fast => RetryPreset::Fast,
            PresetArg::Standard => RetryPreset::Standard,
            PresetArg::Slow => RetryPreset::Slow,
            PresetArg::External => RetryPreset::External,
        }
    }
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let db = self.db;
        match self.command {
            Commands::Run {
                action_type,
                scenario,
                config,
                input,
                input_file,
                trigger,
                correlation_id,
                node,
                retry,
            } => {
                let mut options = ExecutionOptions::new(scenario, action_type)
                    .with_config(parse_json("config", &config)?)
                    .with_input(read_input(input, input_file.as_deref())?)
                    .with_trigger_key(trigger);
                options.correlation_id = correlation_id;
                options.node_id = node;
                options.retry_config = retry.map(|p| RetryPreset::from(p).config());

                run_action(db, options).await
            }
            Commands::Sequence {
                file,
                correlation_id,
            } => run_sequence(db, &file, correlation_id).await,
            Commands::Status { run_id } => show_status(db, &run_id).await,
            Commands::Runs { limit } => list_runs(db, limit).await,
            Commands::Attempts { run_id } => show_attempts(db, &run_id).await,
            Commands::Cancel { run_id, reason } => cancel_run(db, &run_id, reason).await,
            Commands::Actions => list_actions(),
            Commands::Config => show_config(),
        }
    }
}

/// Open the run store at the given or configured path
fn open_store(db: Option<PathBuf>) -> Result<Arc<SqliteRunStore>> {
    let path = match db {
        Some(path) => path,
        None => config::database_path()?,
    };
    let store = SqliteRunStore::open(&path)
        .with_context(|| format!("Failed to open run database: {}", path.display()))?;
    Ok(Arc::new(store))
}

fn build_engine(db: Option<PathBuf>) -> Result<Engine> {
    let store = open_store(db)?;
    let default_retry = config::config()?.default_retry_config();
    Ok(Engine::new(ActionRegistry::with_builtins(), store).with_default_retry(default_retry))
}

fn parse_json(what: &str, text: &str) -> Result<Value> {
    serde_json::from_str(text).with_context(|| format!("Invalid {} JSON: {}", what, text))
}

fn read_input(input: Option<String>, input_file: Option<&Path>) -> Result<Value> {
    match (input, input_file) {
        (Some(text), _) => parse_json("input", &text),
        (None, Some(path)) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read input file: {}", path.display()))?;
            parse_json("input", &text)
        }
        (None, None) => Ok(serde_json::json!({})),
    }
}

/// Execute one action and print its result
async fn run_action(db: Option<PathBuf>, options: ExecutionOptions) -> Result<()> {
    let engine = build_engine(db)?;
    let result = engine.execute_action(options).await;

    println!("{}", serde_json::to_string_pretty(&result.result)?);
    print_summary(&result);

    if !result.result.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

/// Execute a YAML sequence and print each step
async fn run_sequence(
    db: Option<PathBuf>,
    file: &Path,
    correlation_id: Option<String>,
) -> Result<()> {
    let definition = SequenceDefinition::from_file(file)?;
    definition.validate()?;
    let name = definition.name.clone();
    let total = definition.steps.len();

    let engine = build_engine(db)?;
    let (actions, options) = definition.into_options(correlation_id);
    let results = engine.execute_action_sequence(actions, options).await;

    for (i, result) in results.iter().enumerate() {
        eprintln!("Step {}/{}:", i + 1, total);
        println!("{}", serde_json::to_string_pretty(&result.result)?);
        print_summary(result);
    }

    let succeeded = results.iter().filter(|r| r.result.is_success()).count();
    eprintln!(
        "\n[Sequence '{}': {}/{} steps attempted, {} succeeded]",
        name,
        results.len(),
        total,
        succeeded
    );

    if succeeded != total {
        std::process::exit(1);
    }
    Ok(())
}

fn print_summary(result: &ActionExecutionResult) {
    let outcome = match result.result.kind() {
        ResultKind::Success => "success".to_string(),
        ResultKind::RetryableError | ResultKind::FatalError => result
            .result
            .error()
            .map(|e| e.to_string())
            .unwrap_or_default(),
    };
    let run_id = if result.run_id.is_empty() {
        "-"
    } else {
        result.run_id.as_str()
    };
    eprintln!(
        "[Run {} | {} | new: {} | attempts: {} | {}ms]",
        run_id, outcome, result.is_new_run, result.attempts, result.duration_ms
    );
}

/// Show the status of a run
async fn show_status(db: Option<PathBuf>, run_id: &str) -> Result<()> {
    let store = open_store(db)?;
    let run = store
        .get_run(run_id)
        .await?
        .with_context(|| format!("Run not found: {}", run_id))?;

    println!("Run ID: {}", run.run_id);
    println!("Scenario: {}", run.scenario_id);
    if let Some(node) = &run.node_id {
        println!("Node: {}", node);
    }
    println!("Trigger: {}", run.trigger_key);
    println!("Correlation ID: {}", run.correlation_id);
    println!("Status: {}", run.status);
    println!("Attempts: {} (retries: {})", run.attempts, run.retry_count);
    println!("Created: {}", run.created_at);
    if let Some(completed) = run.completed_at {
        println!("Completed: {}", completed);
    }
    if let Some(duration) = run.duration_ms {
        println!("Duration: {}ms", duration);
    }
    if let Some(error) = &run.error {
        println!("Error: {} (fatal: {}, alerted: {})", error, run.is_fatal, run.alert_triggered);
    }
    if let Some(reason) = &run.cancel_reason {
        println!("Cancel reason: {}", reason);
    }
    if let Some(output) = &run.output {
        println!("\nOutput:\n{}", serde_json::to_string_pretty(output)?);
    }

    Ok(())
}

/// List recent runs
async fn list_runs(db: Option<PathBuf>, limit: usize) -> Result<()> {
    let store = open_store(db)?;
    let runs = store.list_runs(limit).await?;

    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    println!("{:<38} {:<20} {:<10} {:<8}", "RUN ID", "SCENARIO", "STATUS", "ATTEMPTS");
    println!("{}", "-".repeat(80));

    for run in runs {
        println!(
            "{:<38} {:<20} {:<10} {:<8}",
            run.run_id, run.scenario_id, run.status, run.attempts
        );
    }

    Ok(())
}

/// Show the attempt log of a run
async fn show_attempts(db: Option<PathBuf>, run_id: &str) -> Result<()> {
    let store = open_store(db)?;
    let entries = store.attempts(run_id).await?;

    if entries.is_empty() {
        println!("No attempts recorded for {}", run_id);
        return Ok(());
    }

    println!("{:<8} {:<16} {:<10} {:<18} {}", "ATTEMPT", "STATUS", "DURATION", "INPUT", "ERROR");
    println!("{}", "-".repeat(80));

    for entry in entries {
        let status = serde_json::to_value(entry.status)?;
        println!(
            "{:<8} {:<16} {:<10} {:<18} {}",
            entry.attempt,
            status.as_str().unwrap_or_default(),
            format!("{}ms", entry.duration_ms),
            entry.input_digest.as_deref().unwrap_or("-"),
            entry.error.map(|e| e.to_string()).unwrap_or_default()
        );
    }

    Ok(())
}

/// Cancel a run
async fn cancel_run(db: Option<PathBuf>, run_id: &str, reason: Option<String>) -> Result<()> {
    let engine = build_engine(db)?;

    match engine.cancel_execution(run_id, reason).await? {
        TransitionOutcome::Applied(_) => println!("Run {} cancelled", run_id),
        TransitionOutcome::Rejected(run) => {
            println!("Run {} is already {}, nothing to cancel", run_id, run.status)
        }
        TransitionOutcome::NotFound => anyhow::bail!("Run not found: {}", run_id),
    }

    Ok(())
}

/// List built-in actions
fn list_actions() -> Result<()> {
    let registry = ActionRegistry::with_builtins();

    println!("{:<20} {}", "ACTION", "DESCRIPTION");
    println!("{}", "-".repeat(60));
    for descriptor in registry.descriptors() {
        println!("{:<20} {}", descriptor.action_type, descriptor.description);
    }

    Ok(())
}

/// Show resolved configuration
fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("Resolved configuration:");
    println!("  Home: {}", cfg.home.display());
    println!("  Database: {}", cfg.database.display());
    match &cfg.config_file {
        Some(path) => println!("  Config file: {}", path.display()),
        None => println!("  Config file: (none, using defaults)"),
    }

    let retry = cfg.default_retry_config();
    println!("\nDefault retry ({}):", cfg.retry_preset);
    println!("  Max attempts: {}", retry.max_attempts);
    println!("  Initial delay: {}ms", retry.initial_delay_ms);
    println!("  Max delay: {}ms", retry.max_delay_ms);
    println!("  Backoff factor: {}", retry.backoff_factor);
    println!("  Jitter: {}ms", retry.jitter_ms.unwrap_or(0));

    Ok(())
}
