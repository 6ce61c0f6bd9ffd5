//! Error types for batch-analysis
//!
//! Provides structured error handling with:
//! - Numeric error codes for machine parsing
//! - User-friendly messages with suggestions
//! - Retryable/fatal classification used by the scheduler
//! - Exit codes for CLI

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::task::{FailureCategory, TaskState};

/// Result type alias for batch-analysis operations
pub type Result<T> = std::result::Result<T, Error>;

/// Numeric error codes for machine parsing and documentation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    // Configuration errors (1xx)
    ConfigNotFound = 100,
    ConfigParseError = 101,
    ConfigValidation = 102,

    // IO errors (2xx)
    IoRead = 200,
    IoWrite = 201,
    IoPermission = 202,
    IoNotFound = 203,
    Serialization = 204,

    // Store errors (3xx)
    StoreLocked = 300,
    StoreCorrupt = 301,
    EntityNotFound = 302,
    UpdateConflict = 303,

    // Task errors (4xx)
    InvalidTransition = 400,
    InvalidResult = 401,
    UnknownKind = 402,
    InvalidParameters = 403,

    // Execution errors (5xx)
    SubmissionFailed = 500,
    ExecutionFailed = 501,

    // Internal errors (9xx)
    InternalError = 900,
}

impl ErrorCode {
    /// Get the string code (e.g., "E100")
    pub fn as_str(&self) -> String {
        format!("E{}", *self as u16)
    }

    /// Get the exit code for CLI (maps to 1-125 range)
    pub fn exit_code(&self) -> i32 {
        match *self as u16 {
            100..=199 => 10,
            200..=299 => 20,
            300..=399 => 30,
            400..=499 => 40,
            500..=599 => 50,
            900..=999 => 90,
            _ => 1,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Main error type
#[derive(Error, Debug)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound {
        path: PathBuf,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Configuration parse error
    #[error("Failed to parse configuration: {message}")]
    ConfigParse {
        message: String,
        #[source]
        source: Option<toml::de::Error>,
    },

    /// Configuration validation error
    #[error("Configuration validation failed: {message}")]
    ConfigValidation { message: String, field: Option<String> },

    /// Generic configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    // ─────────────────────────────────────────────────────────────
    // IO Errors
    // ─────────────────────────────────────────────────────────────

    /// File read error
    #[error("Failed to read file: {path}")]
    IoRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// File write error
    #[error("Failed to write file: {path}")]
    IoWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    Toml(#[from] toml::ser::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // ─────────────────────────────────────────────────────────────
    // Store Errors
    // ─────────────────────────────────────────────────────────────

    /// Could not acquire the store lock in time
    #[error("Store at {path} is locked (waited {waited_ms}ms)")]
    StoreLocked { path: PathBuf, waited_ms: u64 },

    /// Store contents could not be decoded
    #[error("Store at {path} is corrupt: {message}")]
    StoreCorrupt { path: PathBuf, message: String },

    /// Entity lookup by id failed
    #[error("{collection} entity not found: {id}")]
    EntityNotFound { collection: String, id: String },

    /// A revision-checked update kept losing to concurrent writers
    #[error("{collection} entity {id} kept changing during update ({attempts} attempts)")]
    UpdateConflict {
        collection: String,
        id: String,
        attempts: usize,
    },

    // ─────────────────────────────────────────────────────────────
    // Task Errors
    // ─────────────────────────────────────────────────────────────

    /// Attempted a state transition the current state forbids
    #[error("Invalid transition for task {task_id}: cannot {operation} from {from}")]
    InvalidTransition {
        task_id: String,
        from: TaskState,
        operation: &'static str,
    },

    /// Completion without a usable result reference
    #[error("Invalid result for task {task_id}: result reference is empty")]
    InvalidResult { task_id: String },

    /// No registration exists for a kind or type tag
    #[error("Unknown kind: {0}")]
    UnknownKind(String),

    /// Task parameters do not match the kind's schema
    #[error("Invalid parameters for {kind}: {message}")]
    InvalidParameters { kind: String, message: String },

    // ─────────────────────────────────────────────────────────────
    // Execution Errors
    // ─────────────────────────────────────────────────────────────

    /// Backend rejected or could not accept a descriptor
    #[error("Submission of task {task_id} failed: {reason}")]
    SubmissionFailed { task_id: String, reason: String },

    /// Task run ended in failure
    #[error("Task {task_id} failed ({category}): {message}")]
    ExecutionFailed {
        task_id: String,
        category: FailureCategory,
        message: String,
    },

    /// A run or transition could not be carried out
    #[error("Execution error: {0}")]
    Execution(String),

    // ─────────────────────────────────────────────────────────────
    // Internal Errors
    // ─────────────────────────────────────────────────────────────

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    // ─────────────────────────────────────────────────────────────
    // Error Classification
    // ─────────────────────────────────────────────────────────────

    /// Get the numeric error code
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ConfigNotFound { .. } => ErrorCode::ConfigNotFound,
            Error::ConfigParse { .. } => ErrorCode::ConfigParseError,
            Error::ConfigValidation { .. } => ErrorCode::ConfigValidation,
            Error::Config(_) => ErrorCode::ConfigValidation,

            Error::IoRead { .. } => ErrorCode::IoRead,
            Error::IoWrite { .. } => ErrorCode::IoWrite,
            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => ErrorCode::IoNotFound,
                std::io::ErrorKind::PermissionDenied => ErrorCode::IoPermission,
                _ => ErrorCode::IoRead,
            },
            Error::Toml(_) => ErrorCode::ConfigParseError,
            Error::Json(_) => ErrorCode::Serialization,

            Error::StoreLocked { .. } => ErrorCode::StoreLocked,
            Error::StoreCorrupt { .. } => ErrorCode::StoreCorrupt,
            Error::EntityNotFound { .. } => ErrorCode::EntityNotFound,
            Error::UpdateConflict { .. } => ErrorCode::UpdateConflict,

            Error::InvalidTransition { .. } => ErrorCode::InvalidTransition,
            Error::InvalidResult { .. } => ErrorCode::InvalidResult,
            Error::UnknownKind(_) => ErrorCode::UnknownKind,
            Error::InvalidParameters { .. } => ErrorCode::InvalidParameters,

            Error::SubmissionFailed { .. } => ErrorCode::SubmissionFailed,
            Error::ExecutionFailed { .. } => ErrorCode::ExecutionFailed,
            Error::Execution(_) => ErrorCode::ExecutionFailed,

            Error::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Check if the error is retryable
    ///
    /// Retryable errors leave persisted state untouched, so re-running the
    /// same scheduling pass later is safe.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::StoreLocked { .. }
                | Error::UpdateConflict { .. }
                | Error::SubmissionFailed { .. }
                | Error::Io(_)
                | Error::IoRead { .. }
                | Error::IoWrite { .. }
        )
    }

    /// Check if the error is fatal (indicates a bug or broken setup)
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConfigNotFound { .. }
                | Error::ConfigParse { .. }
                | Error::ConfigValidation { .. }
                | Error::Config(_)
                | Error::InvalidTransition { .. }
                | Error::StoreCorrupt { .. }
                | Error::Internal(_)
        )
    }

    /// Get the exit code for CLI
    pub fn exit_code(&self) -> i32 {
        self.code().exit_code()
    }

    // ─────────────────────────────────────────────────────────────
    // User-Friendly Messages
    // ─────────────────────────────────────────────────────────────

    /// Get a user-friendly suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Error::ConfigNotFound { .. } => Some(
                "Run 'batch-analysis config init' to create a default configuration file."
            ),
            Error::ConfigParse { .. } => Some(
                "Check your configuration file syntax. Run 'batch-analysis config validate' to see details."
            ),
            Error::ConfigValidation { .. } => Some(
                "Review the configuration file and fix the invalid values."
            ),
            Error::StoreLocked { .. } => Some(
                "Another scheduling pass or worker holds the store lock. If none is running, remove the stale '.lock' file."
            ),
            Error::StoreCorrupt { .. } => Some(
                "Restore the store directory from a backup; the JSON collections could not be decoded."
            ),
            Error::InvalidTransition { .. } => Some(
                "This indicates a scheduling bug. Inspect the task with 'batch-analysis tasks show <id>'."
            ),
            Error::UnknownKind(_) => Some(
                "Register the kind or type name with the registry before scheduling or running tasks."
            ),
            Error::SubmissionFailed { .. } => Some(
                "The task remains unstarted and will be resubmitted by the next scheduling pass."
            ),
            Error::ExecutionFailed { .. } => Some(
                "The failure is recorded on the task. The experiment driver retries transient failures."
            ),
            _ => None,
        }
    }

    /// Format the error for terminal display with colors
    pub fn format_for_terminal(&self) -> String {
        let code = self.code();
        let suggestion = self.suggestion();

        let mut output = format!(
            "\x1b[31mError [{}]\x1b[0m: {}\n",
            code.as_str(),
            self
        );

        if let Some(hint) = suggestion {
            output.push_str(&format!("\n\x1b[33mHint\x1b[0m: {}\n", hint));
        }

        output
    }

    /// Format the error for logging (no colors)
    pub fn format_for_log(&self) -> String {
        format!("[{}] {}", self.code().as_str(), self)
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Constructors
// ─────────────────────────────────────────────────────────────────

impl Error {
    /// Create a config not found error
    pub fn config_not_found(path: impl Into<PathBuf>) -> Self {
        Error::ConfigNotFound {
            path: path.into(),
            source: None,
        }
    }

    /// Create a config validation error with field name
    pub fn config_field_invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create an invalid transition error
    pub fn invalid_transition(
        task_id: impl Into<String>,
        from: TaskState,
        operation: &'static str,
    ) -> Self {
        Error::InvalidTransition {
            task_id: task_id.into(),
            from,
            operation,
        }
    }

    /// Create a submission failure
    pub fn submission_failed(task_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::SubmissionFailed {
            task_id: task_id.into(),
            reason: reason.into(),
        }
    }

    /// Create an entity-not-found error
    pub fn not_found(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Error::EntityNotFound {
            collection: collection.into(),
            id: id.into(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
