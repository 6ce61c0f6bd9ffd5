//! Task entity and state machine
//!
//! A task is a persisted unit of work: a kind tag, an immutable parameter
//! payload, resource requirements, and a lifecycle that only moves forward:
//!
//! ```text
//! UNSTARTED ──mark_running──▶ RUNNING ──mark_complete──▶ DONE
//!                                  └────mark_failed────▶ FAILED
//! ```
//!
//! DONE and FAILED are terminal. Retrying failed work means creating a new
//! task with the same fingerprint; the failed one stays as an audit record.

pub mod kind;
mod resources;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::store::Document;
use crate::types::{ArtifactId, TaskId};

pub use kind::{
    BenchmarkTrialParams, ImportDatasetParams, RunSystemParams, TaskParameters,
    TrainSystemParams, BENCHMARK_TRIAL, IMPORT_DATASET, RUN_SYSTEM, TRAIN_SYSTEM,
};
pub use resources::{
    format_duration_hms, parse_duration_secs, parse_memory_mb, ResourceCeiling,
    ResourceRequirements, ResourceViolation,
};

// ─────────────────────────────────────────────────────────────────
// Task State
// ─────────────────────────────────────────────────────────────────

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Created, waiting to be submitted
    Unstarted,
    /// Handed to a job system
    Running,
    /// Finished with a result
    Done,
    /// Finished without a result
    Failed,
}

impl TaskState {
    pub fn all() -> &'static [TaskState] {
        &[TaskState::Unstarted, TaskState::Running, TaskState::Done, TaskState::Failed]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Unstarted => "UNSTARTED",
            TaskState::Running => "RUNNING",
            TaskState::Done => "DONE",
            TaskState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Done | TaskState::Failed)
    }

    /// Parse from string (case-insensitive)
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "UNSTARTED" => Some(TaskState::Unstarted),
            "RUNNING" => Some(TaskState::Running),
            "DONE" => Some(TaskState::Done),
            "FAILED" => Some(TaskState::Failed),
            _ => None,
        }
    }

    /// JSON form used in store filters
    pub fn to_value(self) -> Value {
        Value::String(self.as_str().to_string())
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────
// Failure Record
// ─────────────────────────────────────────────────────────────────

/// Why a task ended FAILED. The driver reads this to choose between retrying
/// and marking a pairing unsupported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// A collaborator could not be loaded or rehydrated
    LoadFailure,
    /// A collaborator declared the inputs unsupported
    Incompatible,
    /// A collaborator returned an error
    CollaboratorError,
    /// A collaborator finished without producing a result
    NoResult,
    /// A collaborator panicked
    Panicked,
    /// Ran far longer than expected and was reaped
    Stale,
    /// Marked failed by an operator
    Manual,
}

impl FailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::LoadFailure => "load_failure",
            FailureCategory::Incompatible => "incompatible",
            FailureCategory::CollaboratorError => "collaborator_error",
            FailureCategory::NoResult => "no_result",
            FailureCategory::Panicked => "panicked",
            FailureCategory::Stale => "stale",
            FailureCategory::Manual => "manual",
        }
    }

    /// Whether trying the same work again could succeed
    pub fn is_transient(&self) -> bool {
        !matches!(self, FailureCategory::Incompatible)
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recorded on a task when it fails
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub category: FailureCategory,
    pub message: String,
}

// ─────────────────────────────────────────────────────────────────
// Task
// ─────────────────────────────────────────────────────────────────

/// A persisted unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Assigned by the store on first persistence
    #[serde(skip)]
    id: Option<TaskId>,

    kind: String,
    parameters: Value,

    /// Dedup key derived from kind and parameters
    fingerprint: String,

    state: TaskState,

    #[serde(default)]
    resources: ResourceRequirements,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    node_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    job_id: Option<String>,

    /// Token of the submission that owns this task while RUNNING
    #[serde(default, skip_serializing_if = "Option::is_none")]
    claim: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<ArtifactId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    failure: Option<FailureRecord>,

    created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    finished_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a new, not yet persisted, UNSTARTED task
    pub fn new(kind: impl Into<String>, parameters: Value, resources: ResourceRequirements) -> Self {
        let kind = kind.into();
        let fingerprint = fingerprint(&kind, &parameters);
        Self {
            id: None,
            kind,
            parameters,
            fingerprint,
            state: TaskState::Unstarted,
            resources,
            node_id: None,
            job_id: None,
            claim: None,
            result: None,
            failure: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Create a task from typed parameters
    pub fn from_params<P: TaskParameters>(params: &P, resources: ResourceRequirements) -> Result<Self> {
        Ok(Self::new(P::KIND, params.to_value()?, resources))
    }

    // ─────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────

    pub fn id(&self) -> Option<&TaskId> {
        self.id.as_ref()
    }

    /// Id for logs and errors; unsaved tasks show as `<unsaved>`
    pub fn display_id(&self) -> String {
        self.id
            .as_ref()
            .map(|id| id.to_string())
            .unwrap_or_else(|| "<unsaved>".to_string())
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn parameters(&self) -> &Value {
        &self.parameters
    }

    /// Decode the parameters as a typed struct
    pub fn params<P: TaskParameters>(&self) -> Result<P> {
        if self.kind != P::KIND {
            return Err(Error::InvalidParameters {
                kind: P::KIND.to_string(),
                message: format!("task {} has kind {}", self.display_id(), self.kind),
            });
        }
        P::from_value(&self.parameters)
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn resources(&self) -> &ResourceRequirements {
        &self.resources
    }

    pub fn node_id(&self) -> Option<&str> {
        self.node_id.as_deref()
    }

    pub fn job_id(&self) -> Option<&str> {
        self.job_id.as_deref()
    }

    pub fn claim(&self) -> Option<&str> {
        self.claim.as_deref()
    }

    pub fn result(&self) -> Option<&ArtifactId> {
        self.result.as_ref()
    }

    pub fn failure(&self) -> Option<&FailureRecord> {
        self.failure.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn is_unstarted(&self) -> bool {
        self.state == TaskState::Unstarted
    }

    pub fn is_running(&self) -> bool {
        self.state == TaskState::Running
    }

    pub fn is_finished(&self) -> bool {
        self.state == TaskState::Done
    }

    pub fn is_failed(&self) -> bool {
        self.state == TaskState::Failed
    }

    // ─────────────────────────────────────────────────────────────
    // Transitions
    // ─────────────────────────────────────────────────────────────

    /// UNSTARTED → RUNNING
    pub fn mark_running(&mut self, node_id: impl Into<String>, job_id: impl Into<String>) -> Result<()> {
        self.mark_running_claimed(node_id, job_id, None)
    }

    /// UNSTARTED → RUNNING, recording the submission token that owns the run
    pub fn mark_running_claimed(
        &mut self,
        node_id: impl Into<String>,
        job_id: impl Into<String>,
        claim: Option<String>,
    ) -> Result<()> {
        if self.state != TaskState::Unstarted {
            return Err(Error::invalid_transition(self.display_id(), self.state, "mark_running"));
        }
        self.state = TaskState::Running;
        self.node_id = Some(node_id.into());
        self.job_id = Some(job_id.into());
        self.claim = claim;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// RUNNING → DONE
    pub fn mark_complete(&mut self, result: ArtifactId) -> Result<()> {
        if self.state != TaskState::Running {
            return Err(Error::invalid_transition(self.display_id(), self.state, "mark_complete"));
        }
        if result.is_empty() {
            return Err(Error::InvalidResult { task_id: self.display_id() });
        }
        self.state = TaskState::Done;
        self.result = Some(result);
        self.failure = None;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// RUNNING → FAILED
    pub fn mark_failed(&mut self, category: FailureCategory, message: impl Into<String>) -> Result<()> {
        if self.state != TaskState::Running {
            return Err(Error::invalid_transition(self.display_id(), self.state, "mark_failed"));
        }
        self.state = TaskState::Failed;
        self.result = None;
        self.failure = Some(FailureRecord {
            category,
            message: message.into(),
        });
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────
    // Persistence
    // ─────────────────────────────────────────────────────────────

    /// Body stored in the tasks collection (the id lives beside it)
    pub fn to_document_body(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Rebuild a task from a stored document
    pub fn from_document(doc: Document) -> Result<Self> {
        let mut task: Task = serde_json::from_value(doc.body)?;
        task.id = Some(TaskId::new(doc.id));
        Ok(task)
    }
}

// ─────────────────────────────────────────────────────────────────
// Fingerprint
// ─────────────────────────────────────────────────────────────────

/// Dedup key for `(kind, parameters)`: SHA-256 of a canonical encoding with
/// object keys sorted at every level.
pub fn fingerprint(kind: &str, parameters: &Value) -> String {
    let mut canonical = String::new();
    canonical.push_str(&serde_json::to_string(kind).unwrap_or_default());
    canonical.push(':');
    write_canonical(parameters, &mut canonical);

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// Compact JSON with object keys sorted at every level
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).unwrap_or_default());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_pcg::Pcg64;
    use serde_json::json;

    fn make_task() -> Task {
        Task::new(
            RUN_SYSTEM,
            json!({"system_id": "sys-1", "image_source_id": "src-1"}),
            ResourceRequirements::default(),
        )
    }

    #[test]
    fn test_task_lifecycle_success() {
        let mut task = make_task();
        assert_eq!(task.state(), TaskState::Unstarted);
        assert!(task.started_at().is_none());

        task.mark_running("node-1", "job-7").unwrap();
        assert!(task.is_running());
        assert_eq!(task.node_id(), Some("node-1"));
        assert_eq!(task.job_id(), Some("job-7"));
        assert!(task.started_at().is_some());

        task.mark_complete(ArtifactId::new("trial-9")).unwrap();
        assert!(task.is_finished());
        assert_eq!(task.result().map(|r| r.as_str()), Some("trial-9"));
        assert!(task.finished_at().is_some());
    }

    #[test]
    fn test_task_lifecycle_failure() {
        let mut task = make_task();
        task.mark_running("node-1", "job-7").unwrap();
        task.mark_failed(FailureCategory::CollaboratorError, "boom").unwrap();

        assert!(task.is_failed());
        assert!(task.result().is_none());
        let failure = task.failure().unwrap();
        assert_eq!(failure.category, FailureCategory::CollaboratorError);
        assert_eq!(failure.message, "boom");
    }

    #[test]
    fn test_complete_requires_result() {
        let mut task = make_task();
        task.mark_running("n", "j").unwrap();

        let err = task.mark_complete(ArtifactId::new("")).unwrap_err();
        assert!(matches!(err, Error::InvalidResult { .. }));
        assert!(task.is_running());
        assert!(task.result().is_none());
    }

    #[test]
    fn test_illegal_transitions_leave_state_unchanged() {
        // UNSTARTED -> DONE
        let mut task = make_task();
        let err = task.mark_complete(ArtifactId::new("r")).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { from: TaskState::Unstarted, .. }));
        assert_eq!(task.state(), TaskState::Unstarted);

        // UNSTARTED -> FAILED
        assert!(task.mark_failed(FailureCategory::Manual, "x").is_err());
        assert_eq!(task.state(), TaskState::Unstarted);

        // RUNNING -> RUNNING
        task.mark_running("n", "j").unwrap();
        assert!(task.mark_running("n2", "j2").is_err());
        assert_eq!(task.job_id(), Some("j"));

        // DONE -> anything
        task.mark_complete(ArtifactId::new("r")).unwrap();
        let before = task.clone();
        assert!(task.mark_running("n", "j").is_err());
        assert!(task.mark_failed(FailureCategory::Manual, "x").is_err());
        assert!(task.mark_complete(ArtifactId::new("other")).is_err());
        assert_eq!(task, before);

        // FAILED -> anything
        let mut failed = make_task();
        failed.mark_running("n", "j").unwrap();
        failed.mark_failed(FailureCategory::NoResult, "none").unwrap();
        let before = failed.clone();
        assert!(failed.mark_running("n", "j").is_err());
        assert!(failed.mark_complete(ArtifactId::new("r")).is_err());
        assert!(failed.mark_failed(FailureCategory::Manual, "again").is_err());
        assert_eq!(failed, before);
    }

    #[test]
    fn test_random_transition_sequences_keep_invariants() {
        let mut rng = Pcg64::seed_from_u64(0x5eed);

        for _ in 0..500 {
            let mut task = make_task();
            for _ in 0..6 {
                let before = task.state();
                let outcome = match rng.gen_range(0..4) {
                    0 => task.mark_running("node", "job"),
                    1 => task.mark_complete(ArtifactId::new("result")),
                    2 => task.mark_complete(ArtifactId::new("")),
                    _ => task.mark_failed(FailureCategory::CollaboratorError, "err"),
                };

                if outcome.is_err() {
                    assert_eq!(task.state(), before);
                }
                // Monotone: never returns to an earlier state
                if before.is_terminal() {
                    assert_eq!(task.state(), before);
                }
                assert_eq!(task.result().is_some(), task.state() == TaskState::Done);
                assert_eq!(task.failure().is_some(), task.state() == TaskState::Failed);
                if task.state() != TaskState::Unstarted {
                    assert!(task.node_id().is_some() && task.job_id().is_some());
                } else {
                    assert!(task.node_id().is_none() && task.job_id().is_none());
                }
            }
        }
    }

    #[test]
    fn test_fingerprint_ignores_key_order() {
        let a = fingerprint(RUN_SYSTEM, &json!({"system_id": "s", "image_source_id": "i"}));
        let b = fingerprint(RUN_SYSTEM, &json!({"image_source_id": "i", "system_id": "s"}));
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_fingerprint_distinguishes_kind_and_values() {
        let params = json!({"a": 1});
        assert_ne!(fingerprint(RUN_SYSTEM, &params), fingerprint(TRAIN_SYSTEM, &params));
        assert_ne!(
            fingerprint(RUN_SYSTEM, &json!({"a": 1})),
            fingerprint(RUN_SYSTEM, &json!({"a": "1"}))
        );
        assert_ne!(
            fingerprint(IMPORT_DATASET, &json!({"options": {"x": [1, 2]}})),
            fingerprint(IMPORT_DATASET, &json!({"options": {"x": [2, 1]}}))
        );
    }

    #[test]
    fn test_document_round_trip_keeps_id() {
        let mut task = make_task();
        task.mark_running("n", "j").unwrap();
        let body = task.to_document_body().unwrap();
        assert_eq!(body["state"], json!("RUNNING"));
        assert!(body.get("result").is_none());

        let loaded = Task::from_document(Document { id: "t-1".into(), body }).unwrap();
        assert_eq!(loaded.id().map(|id| id.as_str()), Some("t-1"));
        assert_eq!(loaded.state(), TaskState::Running);
        assert_eq!(loaded.fingerprint(), task.fingerprint());
    }

    #[test]
    fn test_typed_params() {
        let params = TrainSystemParams {
            trainer_id: "trainer".into(),
            trainee_id: "trainee".into(),
        };
        let task = Task::from_params(&params, ResourceRequirements::default()).unwrap();
        assert_eq!(task.kind(), TRAIN_SYSTEM);
        assert_eq!(task.params::<TrainSystemParams>().unwrap(), params);
        assert!(task.params::<RunSystemParams>().is_err());
    }

    #[test]
    fn test_state_parse() {
        assert_eq!(TaskState::parse("running"), Some(TaskState::Running));
        assert_eq!(TaskState::parse("DONE"), Some(TaskState::Done));
        assert_eq!(TaskState::parse("paused"), None);
    }
}
