//! Configuration system for batch-analysis
//!
//! Supports multiple configuration sources with the following precedence (highest to lowest):
//! 1. CLI arguments
//! 2. Environment variables (BATCH_* prefix)
//! 3. Configuration file (TOML)
//! 4. Default values

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::task::ResourceCeiling;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Where tasks, artifacts and experiments are persisted
    pub store: StoreSettings,

    /// Scheduling pass settings
    pub scheduler: SchedulerSettings,

    /// Execution backend settings
    pub job_system: JobSystemSettings,

    /// Worker-side (`run-task`) settings
    pub worker: WorkerSettings,

    /// Logging configuration
    pub logging: LoggingSettings,
}

/// Store backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local; only useful for a single-process pass
    Memory,
    /// JSON files in a directory, shared between processes
    File,
}

impl StoreBackend {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "memory" => Some(StoreBackend::Memory),
            "file" => Some(StoreBackend::File),
            _ => None,
        }
    }
}

/// Store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub backend: StoreBackend,

    /// Store directory for the file backend
    pub path: String,

    /// How long to wait for the store lock before giving up
    pub lock_timeout_ms: u64,
}

/// Scheduling pass settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Largest CPU request a task may make (unset = unlimited)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_cpus: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_gpus: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_memory_mb: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_duration_secs: Option<u64>,

    /// Seconds between passes in daemon mode
    pub pass_interval_secs: u64,

    /// RUNNING tasks older than expected duration times this factor are
    /// reaped as stale (unset = no watchdog)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watchdog_margin: Option<f64>,
}

/// Execution backend kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobSystemKind {
    /// Spawn worker processes on this machine
    Local,
    /// Render batch scripts and hand them to a cluster submit command
    Cluster,
    /// Record submissions without executing anything
    Mock,
}

impl JobSystemKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "local" => Some(JobSystemKind::Local),
            "cluster" => Some(JobSystemKind::Cluster),
            "mock" => Some(JobSystemKind::Mock),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobSystemKind::Local => "local",
            JobSystemKind::Cluster => "cluster",
            JobSystemKind::Mock => "mock",
        }
    }
}

/// Execution backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSystemSettings {
    pub kind: JobSystemKind,

    /// Worker executable (default: the running binary)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executable: Option<String>,

    /// Directory for rendered job scripts and worker logs
    pub job_dir: String,

    /// Cluster submit command; the script path is appended
    pub submit_command: String,

    /// Node identifier reported for submissions (default: hostname)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,

    /// Local CPU capacity (0 = all cores)
    pub local_cpus: u32,

    /// Local GPU capacity
    pub local_gpus: u32,
}

/// Worker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// How long `run-task` waits for its submission to be recorded
    pub claim_wait_ms: u64,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level: trace, debug, info, warn, error
    pub level: String,

    /// Log file path (empty = no file logging)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// Maximum log file size in MB before rotation
    pub max_file_size_mb: u64,

    /// Number of rotated log files to keep
    pub max_files: u32,

    /// Enable JSON formatted logging
    pub json_format: bool,
}

// Default implementations

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::File,
            path: "~/.batch-analysis/store".to_string(),
            lock_timeout_ms: 10_000,
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_cpus: None,
            max_gpus: None,
            max_memory_mb: None,
            max_duration_secs: None,
            pass_interval_secs: 300,
            watchdog_margin: None,
        }
    }
}

impl Default for JobSystemSettings {
    fn default() -> Self {
        Self {
            kind: JobSystemKind::Local,
            executable: None,
            job_dir: "~/.batch-analysis/jobs".to_string(),
            submit_command: "qsub".to_string(),
            node_id: None,
            local_cpus: 0, // Auto-detect
            local_gpus: 0,
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self { claim_wait_ms: 30_000 }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            max_file_size_mb: 100,
            max_files: 5,
            json_format: false,
        }
    }
}

impl SchedulerSettings {
    /// Resource ceiling tasks must fit under to be scheduled
    pub fn ceiling(&self) -> ResourceCeiling {
        ResourceCeiling {
            max_cpus: self.max_cpus,
            max_gpus: self.max_gpus,
            max_memory_mb: self.max_memory_mb,
            max_duration_secs: self.max_duration_secs,
        }
    }

    pub fn pass_interval(&self) -> Duration {
        Duration::from_secs(self.pass_interval_secs)
    }
}

impl WorkerSettings {
    pub fn claim_wait(&self) -> Duration {
        Duration::from_millis(self.claim_wait_ms)
    }
}

impl BatchConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::default();

        // 1. Load from config file if it exists
        let config_file = Self::find_config_file(config_path)?;
        if let Some(path) = config_file {
            debug!(path = %path.display(), "Loading configuration file");
            let content = fs::read_to_string(&path).map_err(|e| Error::ConfigNotFound {
                path: path.clone(),
                source: Some(e),
            })?;
            config = Self::from_toml(&content)?;
            info!(path = %path.display(), "Configuration loaded from file");
        }

        // 2. Apply environment variable overrides
        config.apply_env_overrides();

        // 3. Expand paths
        config.expand_paths();

        // 4. Validate
        config.validate()?;

        Ok(config)
    }

    /// Apply command-line overrides on top of a loaded configuration.
    /// Runs validation again since the overrides can change what is required.
    pub fn with_overrides(mut self, store_path: Option<&str>, job_system: Option<&str>) -> Result<Self> {
        if let Some(path) = store_path {
            self.store.path = expand_path(path);
        }
        if let Some(name) = job_system {
            self.job_system.kind = JobSystemKind::parse(name).ok_or_else(|| {
                Error::config_field_invalid(
                    "job_system.kind",
                    format!("unknown job system '{}', expected local, cluster or mock", name),
                )
            })?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Parse configuration text without env overrides or validation
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::ConfigParse {
            message: e.to_string(),
            source: Some(e),
        })
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Find the configuration file to use
    fn find_config_file(explicit_path: Option<&str>) -> Result<Option<PathBuf>> {
        // If explicit path provided, use it (error if not found)
        if let Some(path) = explicit_path {
            let path = PathBuf::from(expand_path(path));
            if path.exists() {
                return Ok(Some(path));
            }
            return Err(Error::config_not_found(path));
        }

        // Search in standard locations
        let search_paths = [
            // Current directory
            PathBuf::from("batch-analysis.toml"),
            // User config directory
            dirs::config_dir()
                .map(|p| p.join("batch-analysis").join("config.toml"))
                .unwrap_or_default(),
            // Home directory
            dirs::home_dir()
                .map(|p| p.join(".batch-analysis").join("config.toml"))
                .unwrap_or_default(),
            // System config (Linux)
            PathBuf::from("/etc/batch-analysis/config.toml"),
        ];

        for path in &search_paths {
            if !path.as_os_str().is_empty() && path.exists() {
                debug!(path = %path.display(), "Found configuration file");
                return Ok(Some(path.clone()));
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(None)
    }

    /// Apply environment variable overrides
    pub(crate) fn apply_env_overrides(&mut self) {
        // Store settings
        if let Ok(val) = std::env::var("BATCH_STORE_BACKEND") {
            if let Some(backend) = StoreBackend::parse(&val) {
                self.store.backend = backend;
            }
        }
        if let Ok(val) = std::env::var("BATCH_STORE_PATH") {
            self.store.path = val;
        }
        if let Ok(val) = std::env::var("BATCH_LOCK_TIMEOUT_MS") {
            if let Ok(n) = val.parse() {
                self.store.lock_timeout_ms = n;
            }
        }

        // Scheduler settings
        if let Ok(val) = std::env::var("BATCH_MAX_CPUS") {
            if let Ok(n) = val.parse() {
                self.scheduler.max_cpus = Some(n);
            }
        }
        if let Ok(val) = std::env::var("BATCH_MAX_GPUS") {
            if let Ok(n) = val.parse() {
                self.scheduler.max_gpus = Some(n);
            }
        }
        if let Ok(val) = std::env::var("BATCH_MAX_MEMORY_MB") {
            if let Ok(n) = val.parse() {
                self.scheduler.max_memory_mb = Some(n);
            }
        }
        if let Ok(val) = std::env::var("BATCH_PASS_INTERVAL_SECS") {
            if let Ok(n) = val.parse() {
                self.scheduler.pass_interval_secs = n;
            }
        }
        if let Ok(val) = std::env::var("BATCH_WATCHDOG_MARGIN") {
            if let Ok(n) = val.parse() {
                self.scheduler.watchdog_margin = Some(n);
            }
        }

        // Job system settings
        if let Ok(val) = std::env::var("BATCH_JOB_SYSTEM") {
            if let Some(kind) = JobSystemKind::parse(&val) {
                self.job_system.kind = kind;
            }
        }
        if let Ok(val) = std::env::var("BATCH_EXECUTABLE") {
            self.job_system.executable = Some(val);
        }
        if let Ok(val) = std::env::var("BATCH_JOB_DIR") {
            self.job_system.job_dir = val;
        }
        if let Ok(val) = std::env::var("BATCH_SUBMIT_COMMAND") {
            self.job_system.submit_command = val;
        }
        if let Ok(val) = std::env::var("BATCH_NODE_ID") {
            self.job_system.node_id = Some(val);
        }

        // Worker settings
        if let Ok(val) = std::env::var("BATCH_CLAIM_WAIT_MS") {
            if let Ok(n) = val.parse() {
                self.worker.claim_wait_ms = n;
            }
        }

        // Logging settings
        if let Ok(val) = std::env::var("BATCH_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("BATCH_LOG_FILE") {
            self.logging.file = Some(val);
        }
        if let Ok(val) = std::env::var("BATCH_LOG_JSON") {
            self.logging.json_format = val.to_lowercase() == "true" || val == "1";
        }
    }

    /// Expand ~ and other path variables
    pub(crate) fn expand_paths(&mut self) {
        self.store.path = expand_path(&self.store.path);
        self.job_system.job_dir = expand_path(&self.job_system.job_dir);

        if let Some(ref exe) = self.job_system.executable {
            self.job_system.executable = Some(expand_path(exe));
        }
        if let Some(ref file) = self.logging.file {
            self.logging.file = Some(expand_path(file));
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.store.backend == StoreBackend::File && self.store.path.trim().is_empty() {
            return Err(Error::config_field_invalid(
                "store.path",
                "store path cannot be empty for the file backend",
            ));
        }
        if self.store.lock_timeout_ms == 0 {
            return Err(Error::config_field_invalid(
                "store.lock_timeout_ms",
                "lock timeout must be greater than zero",
            ));
        }

        if self.scheduler.pass_interval_secs == 0 {
            return Err(Error::config_field_invalid(
                "scheduler.pass_interval_secs",
                "pass interval must be greater than zero",
            ));
        }
        if let Some(margin) = self.scheduler.watchdog_margin {
            if margin.is_nan() || margin < 1.0 {
                return Err(Error::config_field_invalid(
                    "scheduler.watchdog_margin",
                    format!("watchdog margin must be at least 1.0, got {}", margin),
                ));
            }
        }

        if self.job_system.kind == JobSystemKind::Cluster
            && self.job_system.submit_command.trim().is_empty()
        {
            return Err(Error::config_field_invalid(
                "job_system.submit_command",
                "the cluster job system needs a submit command",
            ));
        }

        // Validate log level
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(Error::config_field_invalid(
                "logging.level",
                format!(
                    "Invalid log level '{}'. Must be one of: {}",
                    self.logging.level,
                    valid_levels.join(", ")
                ),
            ));
        }

        Ok(())
    }

    /// Get the store directory as a PathBuf
    pub fn store_path(&self) -> PathBuf {
        PathBuf::from(&self.store.path)
    }

    /// Get the job directory as a PathBuf
    pub fn job_dir(&self) -> PathBuf {
        PathBuf::from(&self.job_system.job_dir)
    }
}

/// Expand ~ and environment variables in paths
fn expand_path(path: &str) -> String {
    shellexpand::full(path)
        .unwrap_or_else(|_| std::borrow::Cow::Borrowed(path))
        .into_owned()
}

/// Default location for `config init`
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".batch-analysis")
        .join("config.toml")
}

/// Initialize a new configuration file
pub fn init_config(path: Option<&str>, force: bool) -> Result<PathBuf> {
    let config_path = path
        .map(|p| PathBuf::from(expand_path(p)))
        .unwrap_or_else(default_config_path);

    // Check if file exists
    if config_path.exists() && !force {
        return Err(Error::Config(format!(
            "Configuration file already exists: {}. Use --force to overwrite.",
            config_path.display()
        )));
    }

    // Create parent directories
    if let Some(parent) = config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| Error::IoWrite {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }

    write_config(&config_path, &generate_default_config())?;
    Ok(config_path)
}

fn write_config(path: &Path, content: &str) -> Result<()> {
    fs::write(path, content).map_err(|e| Error::IoWrite {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Generate default configuration content with comments
pub fn generate_default_config() -> String {
    r#"# batch-analysis configuration

[store]
# Store backend: "file" (shared between processes) or "memory"
backend = "file"

# Store directory for the file backend
path = "~/.batch-analysis/store"

# How long to wait for the store lock (milliseconds)
lock_timeout_ms = 10000

[scheduler]
# Resource ceiling; tasks asking for more are skipped and reported
# max_cpus = 16
# max_gpus = 2
# max_memory_mb = 65536
# max_duration_secs = 86400

# Seconds between passes in daemon mode
pass_interval_secs = 300

# Reap RUNNING tasks older than expected duration times this factor
# watchdog_margin = 3.0

[job_system]
# Execution backend: local, cluster, mock
kind = "local"

# Worker executable (defaults to this binary)
# executable = "/usr/local/bin/batch-analysis"

# Directory for job scripts and worker logs
job_dir = "~/.batch-analysis/jobs"

# Cluster submit command (the script path is appended)
submit_command = "qsub"

# Node identifier for submissions (defaults to hostname)
# node_id = "node-01"

# Local capacity (0 = all cores)
local_cpus = 0
local_gpus = 0

[worker]
# How long run-task waits for its submission to be recorded (milliseconds)
claim_wait_ms = 30000

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log file path (comment out to disable file logging)
# file = "~/.batch-analysis/logs/batch.log"

# Maximum log file size in MB before rotation
max_file_size_mb = 100

# Number of rotated log files to keep
max_files = 5

# Enable JSON formatted logging
json_format = false
"#
    .to_string()
}
