//! convoy CLI — a thin surface over the orchestrator library.
//!
//! All logic lives in the library; this binary exists so a plan can be
//! driven end-to-end from a terminal:
//!
//! ```text
//! convoy run plan.toml --repo /path/to/repo
//! convoy list
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use convoy::model::PlanSpec;
use convoy::{ConvoyConfig, PlanOrchestrator};

#[derive(Parser, Debug)]
#[command(name = "convoy", about = "Plan orchestrator for DAGs of git-mutating jobs")]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, default_value = "convoy.toml", env = "CONVOY_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a plan file to completion.
    Run {
        /// TOML file holding the plan spec (jobs, base branch, target).
        plan: PathBuf,

        /// Repository to operate on (default: the configured repo, then
        /// the current directory).
        #[arg(long)]
        repo: Option<PathBuf>,

        /// Give up after this many seconds.
        #[arg(long, default_value_t = 3600)]
        timeout_secs: u64,
    },

    /// List plans known to the store.
    List,
}

fn main() -> Result<()> {
    convoy::telemetry::init();
    let cli = Cli::parse();
    let config = ConvoyConfig::load(&cli.config)?;

    match cli.command {
        Command::Run {
            plan,
            repo,
            timeout_secs,
        } => run_plan(config, &plan, repo, timeout_secs),
        Command::List => list_plans(config),
    }
}

fn run_plan(
    config: ConvoyConfig,
    plan_file: &PathBuf,
    repo: Option<PathBuf>,
    timeout_secs: u64,
) -> Result<()> {
    let content = std::fs::read_to_string(plan_file)
        .with_context(|| format!("failed to read plan file '{}'", plan_file.display()))?;
    let spec: PlanSpec = toml::from_str(&content)
        .with_context(|| format!("failed to parse plan file '{}'", plan_file.display()))?;

    let orchestrator = PlanOrchestrator::new(config)?;
    orchestrator.initialize()?;

    let plan_id = orchestrator.create_plan(spec, repo)?;
    println!("plan {plan_id} created, running...");
    orchestrator.resume_plan(plan_id)?;

    let status = orchestrator.wait_for_completion(plan_id, Duration::from_secs(timeout_secs))?;
    let snapshot = orchestrator.plan_snapshot(plan_id)?;
    for (node_id, state) in &snapshot.execution {
        println!(
            "  {node_id}: {} ({} attempt(s))",
            state.status, state.attempts
        );
    }
    orchestrator.shutdown();

    if !status.is_terminal() {
        bail!("plan {plan_id} did not finish within {timeout_secs}s (status: {status})");
    }
    println!("plan {plan_id}: {status}");
    if status != convoy::state_machine::PlanStatus::Succeeded {
        std::process::exit(1);
    }
    Ok(())
}

fn list_plans(config: ConvoyConfig) -> Result<()> {
    let orchestrator = PlanOrchestrator::new(config)?;
    orchestrator.initialize()?;
    let mut ids = orchestrator.plan_ids();
    ids.sort();
    if ids.is_empty() {
        println!("no plans");
        return Ok(());
    }
    for plan_id in ids {
        let status = orchestrator.plan_status(plan_id)?;
        let snapshot = orchestrator.plan_snapshot(plan_id)?;
        let name = if snapshot.spec.name.is_empty() {
            "(unnamed)"
        } else {
            &snapshot.spec.name
        };
        println!("{plan_id}  {status:<9}  {name}");
    }
    orchestrator.shutdown();
    Ok(())
}
