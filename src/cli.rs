//! CLI argument parsing using clap v4
//!
//! Defines the command-line interface for batch-analysis.

use clap::{Parser, Subcommand};

/// batch-analysis - task scheduling for vision experiments
///
/// Turns experiments into deduplicated tasks, submits them to a job system
/// and records their results. Job systems start workers through the
/// `run-task` subcommand.
#[derive(Parser, Debug)]
#[command(name = "batch-analysis")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to configuration file
    #[arg(short, long, env = "BATCH_CONFIG", global = true)]
    pub config: Option<String>,

    /// Store directory (overrides configuration and environment)
    #[arg(long, global = true)]
    pub store_path: Option<String>,

    /// Job system: local, cluster or mock (overrides configuration and environment)
    #[arg(long, global = true)]
    pub job_system: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one scheduling pass
    Schedule {
        /// Show what would be submitted without driving experiments or submitting
        #[arg(long)]
        dry_run: bool,
    },

    /// Run scheduling passes periodically until interrupted
    Daemon {
        /// Seconds between passes (default from configuration)
        #[arg(long)]
        interval_secs: Option<u64>,
    },

    /// Execute one submitted task (invoked by job systems)
    RunTask {
        /// Task to execute
        #[arg(long)]
        task_id: String,

        /// Claim token of the submission
        #[arg(long)]
        claim: String,
    },

    /// Inspect and manage tasks
    Tasks {
        #[command(subcommand)]
        subcommand: TasksSubcommand,
    },

    /// Register and list experiments
    Experiment {
        #[command(subcommand)]
        subcommand: ExperimentSubcommand,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// Display version and build information
    Version,
}

/// Task subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum TasksSubcommand {
    /// List tasks
    List {
        /// Only tasks in this state (unstarted, running, done, failed)
        #[arg(short, long)]
        state: Option<String>,
    },

    /// Show one task as JSON
    Show {
        /// Task id
        id: String,
    },

    /// Mark a running task failed
    Fail {
        /// Task id
        id: String,

        /// Reason recorded on the task
        #[arg(short, long)]
        reason: String,
    },

    /// Fail running tasks that exceeded their expected duration
    Reap {
        /// Multiple of the expected duration (default from configuration, else 2.0)
        #[arg(short, long)]
        margin: Option<f64>,
    },
}

/// Experiment subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum ExperimentSubcommand {
    /// Register or update an experiment from a TOML file
    Add {
        /// Experiment definition file
        file: String,
    },

    /// List stored experiments
    List,
}

/// Configuration subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigSubcommand {
    /// Display the effective configuration
    Show,

    /// Initialize a new configuration file
    Init {
        /// Path where to create the config file
        #[arg(short, long)]
        path: Option<String>,

        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Validate the configuration
    Validate,
}
