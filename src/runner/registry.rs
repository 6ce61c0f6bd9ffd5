//! Kind Registry
//!
//! Maps task kind tags to the handler that executes them.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::collaborators::CollaboratorRegistry;
use crate::error::{Error, Result};
use crate::store::DocumentStore;
use crate::task::{FailureCategory, Task, BENCHMARK_TRIAL, IMPORT_DATASET, RUN_SYSTEM, TRAIN_SYSTEM};
use crate::types::ArtifactId;

use super::handlers::{BenchmarkTrialHandler, ImportDatasetHandler, RunSystemHandler, TrainSystemHandler};

// ─────────────────────────────────────────────────────────────────
// Handler Trait
// ─────────────────────────────────────────────────────────────────

/// What a handler needs from the worker process
pub struct RunContext<'a> {
    pub store: &'a dyn DocumentStore,
    pub collaborators: &'a CollaboratorRegistry,
}

/// How a task run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Produced a stored artifact
    Complete(ArtifactId),
    /// Ended without a result
    Failed {
        category: FailureCategory,
        message: String,
    },
}

impl RunOutcome {
    pub fn failed(category: FailureCategory, message: impl Into<String>) -> Self {
        RunOutcome::Failed {
            category,
            message: message.into(),
        }
    }
}

/// Executes one kind of task. Handlers report failure through
/// [`RunOutcome::Failed`] and never touch the task's state.
pub trait KindHandler: Send + Sync {
    /// Kind tag handled
    fn kind(&self) -> &'static str;

    fn run(&self, task: &Task, ctx: &RunContext<'_>) -> RunOutcome;
}

// ─────────────────────────────────────────────────────────────────
// Kind Registry
// ─────────────────────────────────────────────────────────────────

/// Handlers by kind tag
#[derive(Clone, Default)]
pub struct KindRegistry {
    handlers: HashMap<&'static str, Arc<dyn KindHandler>>,
}

impl KindRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the four built-in kinds
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(ImportDatasetHandler);
        registry.register(RunSystemHandler);
        registry.register(TrainSystemHandler);
        registry.register(BenchmarkTrialHandler);
        registry
    }

    /// Register a handler, replacing any handler for the same kind
    pub fn register(&mut self, handler: impl KindHandler + 'static) {
        let kind = handler.kind();
        debug!(kind = %kind, "Kind handler registered");
        self.handlers.insert(kind, Arc::new(handler));
    }

    pub fn get(&self, kind: &str) -> Result<Arc<dyn KindHandler>> {
        self.handlers
            .get(kind)
            .cloned()
            .ok_or_else(|| Error::UnknownKind(kind.to_string()))
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    /// Registered tags, sorted
    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<_> = self.handlers.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }
}

impl fmt::Debug for KindRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KindRegistry").field("kinds", &self.kinds()).finish()
    }
}

/// Built-in kind tags
pub fn builtin_kinds() -> [&'static str; 4] {
    [IMPORT_DATASET, RUN_SYSTEM, TRAIN_SYSTEM, BENCHMARK_TRIAL]
}
