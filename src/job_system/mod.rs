//! Execution backends
//!
//! A [`JobSystem`] accepts job descriptors during a scheduling pass and hands
//! them to something that will eventually run `batch-analysis run-task` for
//! each one. Enqueueing never blocks; [`JobSystem::run_queued_jobs`] flushes
//! the queue and reports, per descriptor, whether the hand-off was accepted.
//! Only an accepted hand-off may move a task to RUNNING.

mod cluster;
mod local;
mod mock;

use std::collections::HashSet;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::config::{BatchConfig, JobSystemKind, StoreBackend};
use crate::error::{Error, Result};
use crate::task::{ResourceRequirements, Task};
use crate::types::{new_id, TaskId};

pub use cluster::ClusterJobSystem;
pub use local::LocalJobSystem;
pub use mock::MockJobSystem;

// ─────────────────────────────────────────────────────────────────
// Descriptors & Reports
// ─────────────────────────────────────────────────────────────────

/// What a job system needs to launch one task run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDescriptor {
    pub task_id: TaskId,
    pub kind: String,
    pub resources: ResourceRequirements,
    /// Fresh per enqueue; the worker only runs if this claim wins
    pub claim: String,
}

impl JobDescriptor {
    /// Describe a persisted task with a fresh claim token
    pub fn for_task(task: &Task) -> Result<Self> {
        let task_id = task
            .id()
            .cloned()
            .ok_or_else(|| Error::Internal("cannot enqueue a task that was never saved".to_string()))?;
        Ok(Self {
            task_id,
            kind: task.kind().to_string(),
            resources: *task.resources(),
            claim: new_id(),
        })
    }

    /// Arguments for the worker command line
    pub fn worker_args(&self) -> Vec<String> {
        vec![
            "run-task".to_string(),
            "--task-id".to_string(),
            self.task_id.to_string(),
            "--claim".to_string(),
            self.claim.clone(),
        ]
    }
}

/// Result of handing one descriptor to the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionOutcome {
    /// The backend accepted the job
    Submitted {
        task_id: TaskId,
        claim: String,
        node_id: String,
        job_id: String,
    },
    /// The backend could not accept the job; the task stays UNSTARTED
    Failed { task_id: TaskId, reason: String },
}

impl SubmissionOutcome {
    pub fn task_id(&self) -> &TaskId {
        match self {
            SubmissionOutcome::Submitted { task_id, .. } | SubmissionOutcome::Failed { task_id, .. } => task_id,
        }
    }

    pub fn is_submitted(&self) -> bool {
        matches!(self, SubmissionOutcome::Submitted { .. })
    }
}

/// One outcome per flushed descriptor
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmissionReport {
    pub outcomes: Vec<SubmissionOutcome>,
}

impl SubmissionReport {
    pub fn push(&mut self, outcome: SubmissionOutcome) {
        self.outcomes.push(outcome);
    }

    pub fn submitted(&self) -> impl Iterator<Item = &SubmissionOutcome> {
        self.outcomes.iter().filter(|o| o.is_submitted())
    }

    pub fn failed(&self) -> impl Iterator<Item = &SubmissionOutcome> {
        self.outcomes.iter().filter(|o| !o.is_submitted())
    }

    pub fn submitted_count(&self) -> usize {
        self.submitted().count()
    }

    pub fn failed_count(&self) -> usize {
        self.failed().count()
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────
// JobSystem Trait
// ─────────────────────────────────────────────────────────────────

/// Contract every execution backend implements
#[async_trait]
pub trait JobSystem: Send + Sync {
    /// Backend name (e.g., "local", "cluster")
    fn name(&self) -> &'static str;

    /// Queue a descriptor. Returns false when the task id is already queued,
    /// in which case the earlier descriptor is kept.
    fn enqueue(&mut self, descriptor: JobDescriptor) -> bool;

    /// Number of queued descriptors
    fn pending(&self) -> usize;

    /// Hand every queued descriptor to the backend and empty the queue.
    /// Returns once submissions are accepted, not when jobs finish.
    async fn run_queued_jobs(&mut self) -> SubmissionReport;
}

/// Queue shared by the backends: keeps enqueue order and coalesces repeated
/// task ids.
#[derive(Debug, Default)]
pub(crate) struct JobQueue {
    queued: Vec<JobDescriptor>,
    task_ids: HashSet<TaskId>,
}

impl JobQueue {
    pub(crate) fn push(&mut self, descriptor: JobDescriptor) -> bool {
        if !self.task_ids.insert(descriptor.task_id.clone()) {
            debug!(task_id = %descriptor.task_id, "Task already queued, coalescing");
            return false;
        }
        self.queued.push(descriptor);
        true
    }

    pub(crate) fn len(&self) -> usize {
        self.queued.len()
    }

    pub(crate) fn drain(&mut self) -> Vec<JobDescriptor> {
        self.task_ids.clear();
        std::mem::take(&mut self.queued)
    }
}

// ─────────────────────────────────────────────────────────────────
// Factory
// ─────────────────────────────────────────────────────────────────

/// Create the job system selected by configuration
pub fn create_job_system(config: &BatchConfig) -> Result<Box<dyn JobSystem>> {
    let kind = config.job_system.kind;
    if kind != JobSystemKind::Mock && config.store.backend == StoreBackend::Memory {
        return Err(Error::config_field_invalid(
            "store.backend",
            format!(
                "the {} job system runs workers in other processes and needs the file store",
                kind.as_str()
            ),
        ));
    }

    let system: Box<dyn JobSystem> = match kind {
        JobSystemKind::Local => Box::new(LocalJobSystem::from_config(config)?),
        JobSystemKind::Cluster => Box::new(ClusterJobSystem::from_config(config)?),
        JobSystemKind::Mock => Box::new(MockJobSystem::new()),
    };
    info!(job_system = system.name(), "Job system created");
    Ok(system)
}

/// Node identifier from configuration, falling back to the hostname
pub(crate) fn resolve_node_id(configured: Option<&str>) -> String {
    configured
        .map(str::to_string)
        .or_else(|| hostname::get().ok().and_then(|h| h.into_string().ok()))
        .unwrap_or_else(|| "localhost".to_string())
}

/// Worker executable from configuration, falling back to the running binary
pub(crate) fn resolve_executable(configured: Option<&str>) -> Result<String> {
    match configured {
        Some(exe) => Ok(exe.to_string()),
        None => std::env::current_exe()
            .map(|p| p.to_string_lossy().into_owned())
            .map_err(|e| Error::Config(format!("Cannot determine worker executable: {}", e))),
    }
}

/// Environment a worker needs to reach the same store
pub(crate) fn worker_env(config: &BatchConfig) -> Vec<(String, String)> {
    vec![
        ("BATCH_STORE_BACKEND".to_string(), "file".to_string()),
        ("BATCH_STORE_PATH".to_string(), config.store.path.clone()),
        (
            "BATCH_LOCK_TIMEOUT_MS".to_string(),
            config.store.lock_timeout_ms.to_string(),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(id: &str) -> JobDescriptor {
        JobDescriptor {
            task_id: TaskId::new(id),
            kind: "run_system".to_string(),
            resources: ResourceRequirements::default(),
            claim: new_id(),
        }
    }

    #[test]
    fn test_queue_coalesces_task_ids() {
        let mut queue = JobQueue::default();
        let first = descriptor("t-1");
        let claim = first.claim.clone();

        assert!(queue.push(first));
        assert!(!queue.push(descriptor("t-1")));
        assert!(queue.push(descriptor("t-2")));
        assert_eq!(queue.len(), 2);

        let drained = queue.drain();
        assert_eq!(drained[0].claim, claim);
        assert_eq!(queue.len(), 0);
        // Ids may be queued again after a flush
        assert!(queue.push(descriptor("t-1")));
    }

    #[test]
    fn test_descriptor_requires_saved_task() {
        let task = Task::new("run_system", serde_json::json!({}), ResourceRequirements::default());
        assert!(JobDescriptor::for_task(&task).is_err());
    }

    #[test]
    fn test_worker_args() {
        let d = descriptor("t-9");
        let args = d.worker_args();
        assert_eq!(args[0], "run-task");
        assert_eq!(args[2], "t-9");
        assert_eq!(args[4], d.claim);
    }

    #[test]
    fn test_report_counts() {
        let mut report = SubmissionReport::default();
        report.push(SubmissionOutcome::Submitted {
            task_id: TaskId::new("a"),
            claim: "c".into(),
            node_id: "n".into(),
            job_id: "1".into(),
        });
        report.push(SubmissionOutcome::Failed {
            task_id: TaskId::new("b"),
            reason: "full".into(),
        });
        assert_eq!(report.submitted_count(), 1);
        assert_eq!(report.failed_count(), 1);
        assert_eq!(report.len(), 2);
    }

    #[test]
    fn test_factory_rejects_memory_store_for_local() {
        let mut config = BatchConfig::default();
        config.store.backend = StoreBackend::Memory;
        assert!(create_job_system(&config).is_err());

        config.job_system.kind = JobSystemKind::Mock;
        assert_eq!(create_job_system(&config).unwrap().name(), "mock");
    }
}
