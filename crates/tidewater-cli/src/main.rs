//! Tidewater - build-verification pipeline CLI
//!
//! ## Commands
//!
//! - `run`: evaluate an event and, if accepted, build and test every target
//! - `trigger`: show whether an event would start Runs
//! - `config`: print the resolved configuration

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tidewater_ci::obs;
use tidewater_ci::telemetry::init_tracing;
use tidewater_ci::{
    CiGate, DispatchResult, EventKind, Pipeline, PipelineConfig, RepoEvent, RunReport,
    TriggerDecision, TriggerEvaluator, DEFAULT_CONFIG_FILE,
};
use tidewater_state::{MemoryRunLedger, RunId, RunLedger};
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "tidewater")]
#[command(author = "Tidewater Maintainers")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Fetch, provision, build and test a commit for each target", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Repository event given on the command line.
#[derive(clap::Args, Debug, Clone)]
struct EventArgs {
    /// Event kind: push or pull_request
    #[arg(short, long, default_value = "push")]
    kind: EventKind,

    /// Pushed branch, or the pull request's head branch
    #[arg(short, long)]
    branch: String,

    /// Pull request base branch (defaults to --branch for pushes)
    #[arg(short, long)]
    destination: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline for an event
    Run {
        #[command(flatten)]
        event: EventArgs,

        /// Commit reference to build
        #[arg(short, long)]
        commit: String,

        /// Configuration file
        #[arg(long, env = "TIDEWATER_CONFIG")]
        config: Option<PathBuf>,

        /// Override the repository to fetch from
        #[arg(long)]
        remote: Option<String>,

        /// Write the Run reports as JSON to this file
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Evaluate an event without running anything
    Trigger {
        #[command(flatten)]
        event: EventArgs,

        /// Configuration file
        #[arg(long, env = "TIDEWATER_CONFIG")]
        config: Option<PathBuf>,
    },

    /// Print the resolved configuration as TOML
    Config {
        /// Configuration file
        #[arg(long, env = "TIDEWATER_CONFIG")]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    match cli.command {
        Commands::Run {
            event,
            commit,
            config,
            remote,
            report,
        } => {
            let event = build_event(&event, &commit)?;
            let mut config = load_config(config.as_deref())?;
            if let Some(remote) = remote {
                config.fetch.remote = remote;
            }
            cmd_run(config, event, report.as_deref()).await
        }
        Commands::Trigger { event, config } => {
            let config = load_config(config.as_deref())?;
            cmd_trigger(&config, &build_event(&event, "HEAD")?)
        }
        Commands::Config { config } => cmd_config(&load_config(config.as_deref())?),
    }
}

fn build_event(args: &EventArgs, commit: &str) -> Result<RepoEvent> {
    let destination = match (args.kind, &args.destination) {
        (_, Some(destination)) => destination.clone(),
        (EventKind::Push, None) => args.branch.clone(),
        (EventKind::PullRequest, None) => {
            anyhow::bail!("--destination is required for pull_request events")
        }
    };
    Ok(RepoEvent {
        kind: args.kind,
        source_branch: args.branch.clone(),
        destination_branch: destination,
        commit_ref: commit.to_string(),
    })
}

/// Explicit path, else `tidewater.toml` in the current directory, else defaults.
fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    match path {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => PipelineConfig::load(DEFAULT_CONFIG_FILE)
            .with_context(|| format!("Failed to load {DEFAULT_CONFIG_FILE}")),
        None => Ok(PipelineConfig::default()),
    }
}

async fn cmd_run(config: PipelineConfig, event: RepoEvent, report: Option<&Path>) -> Result<()> {
    let ledger: Arc<dyn RunLedger> = Arc::new(MemoryRunLedger::new());
    let pipeline = Arc::new(
        Pipeline::from_config(config, ledger.clone()).context("Invalid pipeline configuration")?,
    );

    let interrupt = {
        let pipeline = Arc::clone(&pipeline);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let cancelled = pipeline.registry().cancel_all();
                warn!(cancelled, "Interrupted, aborting in-flight runs");
            }
        })
    };

    println!(
        "Event: {} {} -> {} @ {}",
        event.kind, event.source_branch, event.destination_branch, event.commit_ref
    );
    let result = pipeline
        .dispatch(event)
        .await
        .context("Pipeline failed to run")?;
    interrupt.abort();

    if let TriggerDecision::Rejected { reason } = &result.decision {
        println!("Trigger: rejected ({reason})");
        println!("No runs started.");
        return Ok(());
    }
    println!("Trigger: accepted, {} run(s)", result.runs.len());

    let mut gates_passed = true;
    for run in &result.runs {
        println!();
        print_run(run);

        let events = ledger.get_events(&RunId(run.run_id.clone())).await?;
        let verdict = CiGate::evaluate(&events);
        obs::emit_gate_evaluated(&run.run_id, verdict.passed, verdict.violations.len());
        println!("  Gate: {}", if verdict.passed { "✓ PASSED" } else { "✗ FAILED" });
        for violation in &verdict.violations {
            println!("    - {}", violation);
        }
        gates_passed &= verdict.passed;
    }

    if let Some(path) = report {
        write_report(path, &result)?;
        info!(path = %path.display(), "Wrote run report");
    }

    println!();
    if result.all_succeeded() && gates_passed {
        println!("✓ All runs passed!");
        Ok(())
    } else {
        anyhow::bail!("CI checks failed")
    }
}

fn print_run(run: &RunReport) {
    println!("Run ID: {}", run.run_id);
    println!("Target: {} ({})", run.target, run.toolchain.channel);
    println!(
        "Status: {}",
        if run.succeeded() {
            "✓ PASSED".to_string()
        } else {
            format!("✗ {:?}", run.outcome).to_uppercase()
        }
    );
    println!("Duration: {}ms", run.duration_ms);

    for stage in &run.stages {
        let status = if stage.passed() { "✓" } else { "✗" };
        match stage.exit_code {
            Some(code) => println!(
                "  {} {} ({}ms, exit code: {})",
                status, stage.kind, stage.duration_ms, code
            ),
            None => println!("  {} {} ({}ms)", status, stage.kind, stage.duration_ms),
        }
    }

    if let Some(failure) = &run.failure {
        println!("  Failed at {}: {}", failure.stage, failure.message);
        for line in &failure.output_tail {
            println!("    | {}", line);
        }
    }
}

fn write_report(path: &Path, result: &DispatchResult) -> Result<()> {
    let json = serde_json::to_string_pretty(&result.runs)?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write report {}", path.display()))
}

fn cmd_trigger(config: &PipelineConfig, event: &RepoEvent) -> Result<()> {
    let evaluator = TriggerEvaluator::new(config.trigger.branch.clone());
    match evaluator.evaluate(event) {
        TriggerDecision::Accepted => {
            let matrix = config.matrix()?;
            println!("✓ accepted: {} run(s) would start", matrix.len());
            for entry in matrix.entries() {
                println!("  - {} ({})", entry, config.toolchain_for(entry));
            }
        }
        TriggerDecision::Rejected { reason } => println!("✗ rejected: {reason}"),
    }
    Ok(())
}

fn cmd_config(config: &PipelineConfig) -> Result<()> {
    print!("{}", config.to_toml_string()?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn event_args(kind: EventKind, branch: &str, destination: Option<&str>) -> EventArgs {
        EventArgs {
            kind,
            branch: branch.to_string(),
            destination: destination.map(str::to_string),
        }
    }

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_command() {
        let cli = Cli::try_parse_from([
            "tidewater",
            "run",
            "--kind",
            "pull_request",
            "--branch",
            "feature-x",
            "--destination",
            "main",
            "--commit",
            "def456",
        ])
        .unwrap();
        match cli.command {
            Commands::Run { event, commit, .. } => {
                assert_eq!(event.kind, EventKind::PullRequest);
                assert_eq!(commit, "def456");
            }
            _ => panic!("expected run command"),
        }
    }

    #[test]
    fn test_push_destination_defaults_to_branch() {
        let event = build_event(&event_args(EventKind::Push, "main", None), "abc123").unwrap();
        assert_eq!(event.destination_branch, "main");
        assert_eq!(event.commit_ref, "abc123");
    }

    #[test]
    fn test_pull_request_requires_destination() {
        let args = event_args(EventKind::PullRequest, "feature-x", None);
        assert!(build_event(&args, "def456").is_err());
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tidewater.toml");
        std::fs::write(&path, "[trigger]\nbranch = \"release\"\n").unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.trigger.branch, "release");
        assert!(load_config(Some(&dir.path().join("missing.toml"))).is_err());
    }

    #[tokio::test]
    async fn test_rejected_run_exits_cleanly() {
        let event = build_event(&event_args(EventKind::Push, "develop", None), "abc123").unwrap();
        cmd_run(PipelineConfig::default(), event, None).await.unwrap();
    }
}
