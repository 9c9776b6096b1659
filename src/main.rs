use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use autopack::lock::{EXIT_LOCK_FAILURE, WorkspaceLock};

#[derive(Parser)]
#[command(name = "autopack")]
#[command(version, about = "Autonomous code-modification loop")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub workspace: Option<PathBuf>,

    /// Path to the run plan. Defaults to .autopack/plan.json
    #[arg(long, global = true)]
    pub plan: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Advance the run: drive queued phases until drained or blocked
    Run,
    /// Show run status and phase counters
    Status,
    /// List the phases of the current plan
    Phases,
    /// Respond to pending approval requests
    Approve {
        /// Approval id; prompts interactively when omitted
        #[arg(long)]
        id: Option<String>,
        /// Deny instead of approve
        #[arg(long)]
        deny: bool,
        /// Approver identity recorded on the response
        #[arg(long, default_value = "operator")]
        approver: String,
    },
    /// Inspect the external-action ledger
    Ledger,
    /// Reset executor state for the current run
    Reset {
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("autopack=info")),
        )
        .init();

    let cli = Cli::parse();
    let workspace = match cli.workspace.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Run => cmd_run(&cli, workspace).await?,
        Commands::Status => cmd_status(&cli, workspace)?,
        Commands::Phases => cmd_phases(&cli, workspace)?,
        Commands::Approve { id, deny, approver } => {
            cmd_approve(&cli, workspace, id.as_deref(), *deny, approver)?
        }
        Commands::Ledger => cmd_ledger(&cli, workspace)?,
        Commands::Reset { force } => cmd_reset(&cli, workspace, *force)?,
    }

    Ok(())
}

fn load_config(cli: &Cli, workspace: PathBuf) -> Result<autopack::config::Config> {
    autopack::config::Config::new(workspace, cli.verbose, cli.plan.clone())
}

fn run_paths_for(
    config: &autopack::config::Config,
    run: &autopack::run::Run,
) -> autopack::artifacts::RunPaths {
    autopack::artifacts::RunPaths::new(
        &config.workspace_dir,
        &run.project,
        &run.family,
        &run.run_id,
    )
}

async fn cmd_run(cli: &Cli, workspace: PathBuf) -> Result<()> {
    use autopack::executor::PhaseExecutor;
    use autopack::executor::events::JsonlEventSink;
    use autopack::llm::{ClientRegistry, CommandClient};
    use autopack::router::{ModelCatalog, ModelRouter, RoutingSnapshot};
    use autopack::run::{Run, RunDisposition};

    let config = load_config(cli, workspace)?;
    config.ensure_directories()?;

    // Exclusive workspace ownership for the apply+CI window.
    let _lock = match WorkspaceLock::acquire(&config.lock_file) {
        Ok(lock) => lock,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(EXIT_LOCK_FAILURE);
        }
    };

    let run = Run::load(&config.plan_file)?;
    let paths = run_paths_for(&config, &run);
    paths.ensure_directories()?;

    // The snapshot is created once per run and read-only afterwards.
    let catalog = match &config.toml.models.catalog {
        Some(path) => Some(ModelCatalog::load(&config.workspace_dir.join(path))?),
        None => None,
    };
    let snapshot = RoutingSnapshot::load_or_build(
        &paths.routing_snapshot(),
        catalog.as_ref(),
        run.safety_profile,
    )?;
    let router = ModelRouter::new(snapshot).with_overrides(config.toml.models.overrides.clone());

    let mut builders = ClientRegistry::new();
    if let Some(cmd) = &config.toml.models.builder_cmd {
        builders.register_fallback(Arc::new(CommandClient::new(cmd, &config.workspace_dir)));
    } else {
        anyhow::bail!(
            "No builder command configured. Set [models].builder_cmd in .autopack/autopack.toml"
        );
    }
    let mut auditors = ClientRegistry::new();
    if let Some(cmd) = &config.toml.models.auditor_cmd {
        auditors.register_fallback(Arc::new(CommandClient::new(cmd, &config.workspace_dir)));
    }

    let events = Box::new(JsonlEventSink::new(paths.events_log()));
    let mut executor = PhaseExecutor::new(
        &config.workspace_dir,
        run,
        router,
        builders,
        auditors,
        events,
        config.toml.executor_config(),
    )?;

    let result = executor.advance_run().await?;

    println!();
    println!(
        "Run {}: {} complete, {} failed, {} skipped",
        result.run_id,
        result.completed.len(),
        result.failed.len(),
        result.skipped.len()
    );
    match result.disposition {
        RunDisposition::Drained => println!("All phases terminal."),
        RunDisposition::Blocked => println!(
            "{} Blocked on approval (phase {}). Run `autopack approve`.",
            console::style("!").yellow(),
            result.blocked.as_deref().unwrap_or("?")
        ),
        RunDisposition::BudgetExhausted => {
            println!("{} Run budget exhausted.", console::style("!").yellow())
        }
    }
    println!("Artifacts: {}", executor.run_paths().base().display());

    if result.ci_failures {
        std::process::exit(2);
    }
    Ok(())
}

fn cmd_status(cli: &Cli, workspace: PathBuf) -> Result<()> {
    use autopack::executor::state::StateStore;
    use autopack::run::Run;

    let config = load_config(cli, workspace)?;
    let run = Run::load(&config.plan_file)?;
    let paths = run_paths_for(&config, &run);

    println!();
    println!("Autopack Run Status");
    println!("===================");
    println!();
    println!("Run:     {} ({} / {})", run.run_id, run.project, run.family);
    println!("Type:    {}", run.run_type);
    println!("Profile: {}", run.safety_profile);

    let store = StateStore::new(paths.executor_state());
    match store.load() {
        Ok(Some(state)) => {
            println!(
                "Budget:  {:.0}% remaining",
                state.run.budget.remaining_fraction() * 100.0
            );
            println!();
            println!(
                "{:<14} {:<12} {:<6} {:<6} {:<4} Goal",
                "Phase", "State", "Retry", "Epoch", "Esc"
            );
            for phase in &state.run.phases {
                println!(
                    "{:<14} {:<12} {:<6} {:<6} {:<4} {}",
                    phase.phase_id,
                    phase.state.to_string(),
                    phase.retry_attempt,
                    phase.revision_epoch,
                    phase.escalation_level,
                    phase.goal
                );
            }
            if let Some(pending) = &state.pending_approval {
                println!();
                println!(
                    "{} Phase {} is blocked on approval {}",
                    console::style("!").yellow(),
                    pending.phase_id,
                    pending.approval_id
                );
            }
        }
        Ok(None) => println!("Execution: not started (run `autopack run`)"),
        Err(e) => println!(
            "{} Executor state unusable ({}); run needs a human.",
            console::style("!").red(),
            e
        ),
    }
    println!();
    Ok(())
}

fn cmd_phases(cli: &Cli, workspace: PathBuf) -> Result<()> {
    use autopack::run::Run;

    let config = load_config(cli, workspace)?;
    let run = Run::load(&config.plan_file)?;

    println!();
    println!("Plan loaded from: {}", config.plan_file.display());
    println!();
    println!(
        "{:<14} {:<8} {:<10} {:<8} Goal",
        "Phase", "Tier", "Category", "Cx"
    );
    for phase in &run.phases {
        println!(
            "{:<14} {:<8} {:<10} {:<8} {}",
            phase.phase_id,
            phase.tier_id,
            phase.task_category.to_string(),
            phase.complexity.to_string(),
            phase.goal
        );
    }
    println!();
    Ok(())
}

fn cmd_approve(
    cli: &Cli,
    workspace: PathBuf,
    id: Option<&str>,
    deny: bool,
    approver: &str,
) -> Result<()> {
    use autopack::approval::ApprovalChannel;
    use autopack::run::Run;
    use dialoguer::{Confirm, Select, theme::ColorfulTheme};

    let config = load_config(cli, workspace)?;
    let run = Run::load(&config.plan_file)?;
    let paths = run_paths_for(&config, &run);
    let channel = ApprovalChannel::new(&paths.approvals_dir());

    let approval_id = match id {
        Some(id) => id.to_string(),
        None => {
            let pending = channel.pending()?;
            if pending.is_empty() {
                println!("No pending approval requests.");
                return Ok(());
            }
            let items: Vec<String> = pending
                .iter()
                .map(|r| format!("{} — phase {}: {}", r.approval_id, r.phase_id, r.reason))
                .collect();
            let selection = Select::with_theme(&ColorfulTheme::default())
                .with_prompt("Which request?")
                .items(&items)
                .default(0)
                .interact()?;
            pending[selection].approval_id.clone()
        }
    };

    let verb = if deny { "Deny" } else { "Approve" };
    let confirmed = Confirm::new()
        .with_prompt(format!("{} request {}?", verb, approval_id))
        .default(false)
        .interact()
        .unwrap_or(false);
    if !confirmed {
        println!("Cancelled");
        return Ok(());
    }

    channel.respond(&approval_id, !deny, approver)?;
    println!("{} recorded for {}", verb, approval_id);
    Ok(())
}

fn cmd_ledger(cli: &Cli, workspace: PathBuf) -> Result<()> {
    use autopack::ledger::{ExternalActionLedger, GatingPolicy};
    use autopack::run::Run;

    let config = load_config(cli, workspace)?;
    let run = Run::load(&config.plan_file)?;
    let paths = run_paths_for(&config, &run);

    let ledger_path = paths.external_actions_ledger();
    if !ledger_path.exists() {
        println!("No external actions recorded for run {}.", run.run_id);
        return Ok(());
    }

    let ledger = ExternalActionLedger::open(&ledger_path, GatingPolicy::from_env())?;
    println!();
    println!(
        "{:<18} {:<18} {:<22} {:<10} Retries",
        "Key", "Provider", "Action", "Status"
    );
    for entry in ledger.entries() {
        println!(
            "{:<18} {:<18} {:<22} {:<10} {}",
            &entry.idempotency_key[..16.min(entry.idempotency_key.len())],
            entry.provider,
            entry.action,
            entry.status.to_string(),
            entry.retry_count
        );
    }
    println!();
    Ok(())
}

fn cmd_reset(cli: &Cli, workspace: PathBuf, force: bool) -> Result<()> {
    use autopack::run::Run;
    use dialoguer::Confirm;

    let config = load_config(cli, workspace)?;
    let run = Run::load(&config.plan_file)?;
    let paths = run_paths_for(&config, &run);

    if !force {
        let confirm = Confirm::new()
            .with_prompt("This will discard executor state for the run. Are you sure?")
            .default(false)
            .interact()
            .unwrap_or(false);
        if !confirm {
            println!("Reset cancelled");
            return Ok(());
        }
    }

    for path in [
        paths.executor_state(),
        paths.executor_state().with_extension("json.bak"),
    ] {
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("Failed to remove {}", path.display()))?;
        }
    }
    println!("Reset complete");
    Ok(())
}
