//! batch-analysis - experiment task scheduler
//!
//! Main entry point. Scheduling passes and the daemon drive experiments and
//! submit tasks; `run-task` is what job systems invoke on worker nodes.

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use serde_json::Value;
use tracing::{error, info, warn};

use batch_analysis::cli::{self, Cli, Commands, ExperimentSubcommand, TasksSubcommand};
use batch_analysis::collaborators::CollaboratorRegistry;
use batch_analysis::config::{self, BatchConfig};
use batch_analysis::error::{Error, Result};
use batch_analysis::experiment::{Experiment, ExperimentDefinition};
use batch_analysis::job_system::create_job_system;
use batch_analysis::logging::{self, LogGuards, LogRole};
use batch_analysis::pass::Scheduler;
use batch_analysis::runner::{KindRegistry, RunReport, TaskRunner};
use batch_analysis::store::open_store;
use batch_analysis::task::{Task, TaskState};
use batch_analysis::task_manager::TaskManager;
use batch_analysis::types::TaskId;
use batch_analysis::version;

const DEFAULT_REAP_MARGIN: f64 = 2.0;

fn main() -> Result<()> {
    // Parse CLI arguments first (before logging, so we know verbosity)
    let cli = Cli::parse();

    match &cli.command {
        Commands::Version => {
            version::print_version();
            return Ok(());
        }
        Commands::Config { subcommand } => {
            logging::init_simple(tracing::Level::WARN)?;
            return handle_config_command(&cli, subcommand.clone());
        }
        _ => {}
    }

    let config = match load_config(&cli) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprint!("{}", e.format_for_terminal());
            std::process::exit(e.exit_code());
        }
    };

    // The guards must be kept alive for the lifetime of the program
    let _log_guards = init_logging_from_config(&config, &cli.command, cli.verbose, cli.quiet)?;

    let build = version::build_info();
    info!(
        version = %build.full_version(),
        command = command_name(&cli.command),
        "Starting batch-analysis"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("batch-analysis")
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create async runtime: {}", e)))?;

    let result = runtime.block_on(dispatch(cli.command, config));
    if let Err(ref e) = result {
        error!(error = %e.format_for_log(), "Command failed");
        eprint!("{}", e.format_for_terminal());
        std::process::exit(e.exit_code());
    }
    result
}

/// Configuration with CLI overrides applied on top of env and file
fn load_config(cli: &Cli) -> Result<BatchConfig> {
    BatchConfig::load(cli.config.as_deref())?
        .with_overrides(cli.store_path.as_deref(), cli.job_system.as_deref())
}

fn init_logging_from_config(config: &BatchConfig, command: &Commands, verbose: u8, quiet: bool) -> Result<LogGuards> {
    let role = match command {
        Commands::RunTask { .. } => LogRole::Worker,
        _ => LogRole::Scheduler,
    };
    logging::init_logging(&config.logging, role, verbose, quiet)
}

fn command_name(command: &Commands) -> &'static str {
    match command {
        Commands::Schedule { .. } => "schedule",
        Commands::Daemon { .. } => "daemon",
        Commands::RunTask { .. } => "run-task",
        Commands::Tasks { .. } => "tasks",
        Commands::Experiment { .. } => "experiment",
        Commands::Config { .. } => "config",
        Commands::Version => "version",
    }
}

async fn dispatch(command: Commands, config: BatchConfig) -> Result<()> {
    let store = open_store(&config.store)?;
    let tasks = TaskManager::new(store).with_ceiling(config.scheduler.ceiling());
    let collaborators = Arc::new(CollaboratorRegistry::with_builtins());

    match command {
        Commands::Schedule { dry_run } => {
            let scheduler = Scheduler::new(tasks, collaborators).with_watchdog(config.scheduler.watchdog_margin);
            if dry_run {
                let report = scheduler.dry_run()?;
                for task_id in &report.would_submit {
                    println!("would submit {}", task_id);
                }
                for skipped in &report.skipped {
                    let reasons: Vec<String> = skipped.violations.iter().map(|v| v.to_string()).collect();
                    println!("would skip {} ({})", skipped.task_id, reasons.join("; "));
                }
                return Ok(());
            }

            let mut job_system = create_job_system(&config)?;
            let report = scheduler.run_pass(job_system.as_mut()).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Daemon { interval_secs } => {
            let interval = interval_secs
                .map(std::time::Duration::from_secs)
                .unwrap_or_else(|| config.scheduler.pass_interval());
            let scheduler = Scheduler::new(tasks, collaborators).with_watchdog(config.scheduler.watchdog_margin);
            let mut job_system = create_job_system(&config)?;
            scheduler.run_daemon(job_system.as_mut(), interval).await?;
        }
        Commands::RunTask { task_id, claim } => {
            let runner = TaskRunner::new(tasks, collaborators, Arc::new(KindRegistry::with_builtins()))
                .with_claim_wait(config.worker.claim_wait());
            return run_task(&runner, &TaskId::new(task_id), &claim).await;
        }
        Commands::Tasks { subcommand } => {
            handle_tasks_command(&tasks, subcommand, config.scheduler.watchdog_margin)?;
        }
        Commands::Experiment { subcommand } => {
            handle_experiment_command(&tasks, &collaborators, subcommand)?;
        }
        Commands::Version | Commands::Config { .. } => {
            // Already handled in main
            unreachable!();
        }
    }

    Ok(())
}

/// Worker entry. A task that ran and failed exits with the execution
/// failure code so the job system sees it too; a refused claim exits zero.
async fn run_task(runner: &TaskRunner, task_id: &TaskId, claim: &str) -> Result<()> {
    match runner.run(task_id, claim).await? {
        RunReport::Completed(result) => {
            println!("{} DONE {}", task_id, result);
        }
        RunReport::Failed { category, message } => {
            println!("{} FAILED {}: {}", task_id, category, message);
            return Err(Error::ExecutionFailed {
                task_id: task_id.to_string(),
                category,
                message,
            });
        }
        RunReport::NotClaimed { reason } => {
            warn!(task_id = %task_id, reason = %reason, "Task not run");
            println!("{} NOT RUN: {}", task_id, reason);
        }
        RunReport::Superseded => {
            warn!(task_id = %task_id, "Task finished elsewhere; result discarded");
            println!("{} SUPERSEDED", task_id);
        }
    }
    Ok(())
}

fn handle_tasks_command(tasks: &TaskManager, subcommand: TasksSubcommand, configured_margin: Option<f64>) -> Result<()> {
    match subcommand {
        TasksSubcommand::List { state } => {
            let state = match state {
                Some(s) => Some(TaskState::parse(&s).ok_or_else(|| {
                    Error::Config(format!(
                        "Unknown task state '{}'. Must be one of: unstarted, running, done, failed",
                        s
                    ))
                })?),
                None => None,
            };
            for task in tasks.list_tasks(state)? {
                println!(
                    "{}  {:<16} {:<10} {}",
                    task.display_id(),
                    task.kind(),
                    task.state(),
                    task.job_id().unwrap_or("-")
                );
            }
            let counts = tasks.counts()?;
            println!(
                "\n{} tasks: {} unstarted, {} running, {} done, {} failed",
                counts.total(),
                counts.unstarted,
                counts.running,
                counts.done,
                counts.failed
            );
        }
        TasksSubcommand::Show { id } => {
            let task = tasks.load_task(&TaskId::new(id))?;
            println!("{}", serde_json::to_string_pretty(&task_view(&task)?)?);
        }
        TasksSubcommand::Fail { id, reason } => {
            let task = tasks.fail_task(&TaskId::new(id), &reason)?;
            println!("{} FAILED", task.display_id());
        }
        TasksSubcommand::Reap { margin } => {
            let margin = margin.or(configured_margin).unwrap_or(DEFAULT_REAP_MARGIN);
            if margin.is_nan() || margin < 1.0 {
                return Err(Error::config_field_invalid(
                    "margin",
                    format!("margin must be at least 1.0, got {}", margin),
                ));
            }
            let reaped = tasks.reap_stale_tasks(margin, chrono::Utc::now())?;
            for task in &reaped {
                println!("{} FAILED (stale)", task.display_id());
            }
            println!("{} tasks reaped", reaped.len());
        }
    }
    Ok(())
}

/// Stored task body with its id, as printed by `tasks show`
fn task_view(task: &Task) -> Result<Value> {
    let mut body = task.to_document_body()?;
    if let Value::Object(ref mut map) = body {
        map.insert("id".to_string(), Value::String(task.display_id()));
    }
    Ok(body)
}

fn handle_experiment_command(
    tasks: &TaskManager,
    collaborators: &CollaboratorRegistry,
    subcommand: ExperimentSubcommand,
) -> Result<()> {
    let store = tasks.store().as_ref();
    match subcommand {
        ExperimentSubcommand::Add { file } => {
            let definition = ExperimentDefinition::load(Path::new(&file))?;
            let experiment = Experiment::register(store, collaborators, &definition)?;
            println!("Experiment '{}' registered.", experiment.name);
        }
        ExperimentSubcommand::List => {
            for experiment in Experiment::list(store)? {
                println!(
                    "{:<24} {:<8} systems={} sources={} trials={} benchmarked={}",
                    experiment.name,
                    if experiment.enabled { "enabled" } else { "disabled" },
                    experiment.all_systems().len(),
                    experiment.all_image_sources().len(),
                    experiment.trials.results.len(),
                    experiment.benchmarked.results.len()
                );
            }
        }
    }
    Ok(())
}

/// Handle configuration subcommands
fn handle_config_command(cli: &Cli, subcommand: cli::ConfigSubcommand) -> Result<()> {
    use cli::ConfigSubcommand;

    match subcommand {
        ConfigSubcommand::Show => {
            let cfg = load_config(cli)?;
            println!("{}", cfg.to_toml()?);
        }
        ConfigSubcommand::Init { path, force } => {
            let written = config::init_config(path.as_deref(), force)?;
            println!("Configuration written to {}", written.display());
        }
        ConfigSubcommand::Validate => match load_config(cli) {
            Ok(_) => {
                println!("Configuration is valid.");
            }
            Err(e) => {
                eprint!("{}", e.format_for_terminal());
                std::process::exit(e.exit_code());
            }
        },
    }

    Ok(())
}
