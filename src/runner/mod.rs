//! Task runner
//!
//! Worker-side entry point. A job system starts one worker per submission
//! with the task id and the submission's claim token. The runner waits for
//! the scheduling pass to record that claim, executes the kind handler only
//! if the claim is still the task's owner, and performs exactly one terminal
//! transition. Collaborator errors and panics end up on the task; they never
//! escape as errors.

mod handlers;
mod registry;

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use backoff::{backoff::Backoff, ExponentialBackoff};
use tracing::{debug, error, info, warn};

use crate::collaborators::CollaboratorRegistry;
use crate::error::{Error, Result};
use crate::store::{blocking, Collection};
use crate::task::{FailureCategory, Task, TaskState};
use crate::task_manager::TaskManager;
use crate::types::{ArtifactId, TaskId};

pub use handlers::{BenchmarkTrialHandler, ImportDatasetHandler, RunSystemHandler, TrainSystemHandler};
pub use registry::{builtin_kinds, KindHandler, KindRegistry, RunContext, RunOutcome};

/// Default time a worker waits for its submission to be recorded
pub const DEFAULT_CLAIM_WAIT: Duration = Duration::from_secs(30);

/// What happened to one worker invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunReport {
    /// Ran and recorded DONE
    Completed(ArtifactId),
    /// Ran and recorded FAILED
    Failed {
        category: FailureCategory,
        message: String,
    },
    /// Did not run: the claim is not (or no longer) the task's owner
    NotClaimed { reason: String },
    /// Ran, but the task was finished elsewhere before the result landed
    Superseded,
}

/// Owns the terminal transition of claimed tasks
pub struct TaskRunner {
    tasks: TaskManager,
    collaborators: Arc<CollaboratorRegistry>,
    kinds: Arc<KindRegistry>,
    claim_wait: Duration,
}

impl TaskRunner {
    pub fn new(tasks: TaskManager, collaborators: Arc<CollaboratorRegistry>, kinds: Arc<KindRegistry>) -> Self {
        Self {
            tasks,
            collaborators,
            kinds,
            claim_wait: DEFAULT_CLAIM_WAIT,
        }
    }

    /// How long to wait for the submission to be marked RUNNING
    pub fn with_claim_wait(mut self, claim_wait: Duration) -> Self {
        self.claim_wait = claim_wait;
        self
    }

    /// Execute `task_id` on behalf of the submission holding `claim`.
    ///
    /// Errors are store or lookup problems only; every outcome of the work
    /// itself is recorded on the task and returned as a [`RunReport`].
    pub async fn run(&self, task_id: &TaskId, claim: &str) -> Result<RunReport> {
        let mut task = match self.wait_for_claim(task_id, claim).await? {
            Ok(task) => task,
            Err(reason) => {
                warn!(task_id = %task_id, reason = %reason, "Not running task");
                return Ok(RunReport::NotClaimed { reason });
            }
        };

        info!(task_id = %task_id, kind = %task.kind(), "Running task");
        let outcome = self.execute(&task).await;

        let tasks = self.tasks.clone();
        let claim = claim.to_string();
        blocking(move || finish(&tasks, &mut task, &claim, outcome)).await
    }

    /// The task once it is RUNNING under `claim`, or why it never will be
    async fn wait_for_claim(&self, task_id: &TaskId, claim: &str) -> Result<std::result::Result<Task, String>> {
        let mut backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(50),
            max_interval: Duration::from_secs(2),
            max_elapsed_time: Some(self.claim_wait),
            ..Default::default()
        };

        loop {
            let tasks = self.tasks.clone();
            let id = task_id.clone();
            let task = blocking(move || tasks.load_task(&id)).await?;
            match task.state() {
                TaskState::Running if task.claim() == Some(claim) => return Ok(Ok(task)),
                TaskState::Running => return Ok(Err("task is claimed by another submission".to_string())),
                TaskState::Done | TaskState::Failed => {
                    return Ok(Err(format!("task is already {}", task.state())));
                }
                TaskState::Unstarted => match backoff.next_backoff() {
                    Some(delay) => {
                        debug!(task_id = %task_id, delay_ms = delay.as_millis() as u64, "Waiting for submission to be recorded");
                        tokio::time::sleep(delay).await;
                    }
                    None => return Ok(Err("submission was never recorded".to_string())),
                },
            }
        }
    }

    /// Run the kind handler on the blocking pool, capturing panics
    async fn execute(&self, task: &Task) -> RunOutcome {
        let handler = match self.kinds.get(task.kind()) {
            Ok(handler) => handler,
            Err(e) => {
                error!(task_id = %task.display_id(), kind = %task.kind(), "No handler for task kind");
                return RunOutcome::failed(FailureCategory::LoadFailure, e.to_string());
            }
        };

        let store = self.tasks.store().clone();
        let collaborators = self.collaborators.clone();
        let work = task.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let ctx = RunContext {
                store: store.as_ref(),
                collaborators: collaborators.as_ref(),
            };
            handler.run(&work, &ctx)
        })
        .await;

        match joined {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => {
                let message = panic_message(e.into_panic());
                error!(task_id = %task.display_id(), kind = %task.kind(), panic = %message, "Collaborator panicked");
                RunOutcome::failed(FailureCategory::Panicked, message)
            }
            Err(e) => RunOutcome::failed(FailureCategory::CollaboratorError, format!("execution aborted: {}", e)),
        }
    }
}

/// Record the outcome with the single terminal transition. A result that
/// loses the race is removed from the artifacts collection.
fn finish(tasks: &TaskManager, task: &mut Task, claim: &str, outcome: RunOutcome) -> Result<RunReport> {
    let (recorded, report) = match outcome {
        RunOutcome::Complete(result) => match tasks.complete_claimed(task, claim, result.clone()) {
            Ok(recorded) => (recorded, RunReport::Completed(result)),
            Err(Error::InvalidResult { .. }) => {
                let message = "handler returned an empty result reference".to_string();
                let recorded = tasks.fail_claimed(task, claim, FailureCategory::NoResult, message.clone())?;
                (
                    recorded,
                    RunReport::Failed {
                        category: FailureCategory::NoResult,
                        message,
                    },
                )
            }
            Err(e) => return Err(e),
        },
        RunOutcome::Failed { category, message } => {
            let recorded = tasks.fail_claimed(task, claim, category, message.clone())?;
            (recorded, RunReport::Failed { category, message })
        }
    };

    if !recorded {
        warn!(task_id = %task.display_id(), "Task was finished elsewhere, discarding outcome");
        if let RunReport::Completed(result) = &report {
            discard_result(tasks, task, result);
        }
        return Ok(RunReport::Superseded);
    }

    match &report {
        RunReport::Completed(result) => {
            info!(task_id = %task.display_id(), result = %result, "Task done");
        }
        RunReport::Failed { category, message } => {
            warn!(task_id = %task.display_id(), category = %category, message = %message, "Task failed");
        }
        _ => {}
    }
    Ok(report)
}

fn discard_result(tasks: &TaskManager, task: &Task, result: &ArtifactId) {
    match tasks.store().remove(Collection::Artifacts, result.as_str()) {
        Ok(_) => debug!(task_id = %task.display_id(), result = %result, "Removed superseded result"),
        Err(e) => warn!(
            task_id = %task.display_id(),
            result = %result,
            error = %e,
            "Could not remove superseded result; artifact is orphaned"
        ),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{Artifact, ArtifactKind, CollaboratorSpec, Role};
    use crate::job_system::{JobSystem, MockJobSystem};
    use crate::store::MemoryStore;
    use crate::task::ResourceRequirements;
    use serde_json::json;

    struct Fixture {
        tasks: TaskManager,
        runner: TaskRunner,
        jobs: MockJobSystem,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        for (id, role, type_name, config) in [
            ("sys", Role::System, "mock_system", json!({})),
            ("crashy", Role::System, "mock_system", json!({"panic": true})),
            ("src", Role::ImageSource, "mock_image_source", json!({"frames": 4})),
        ] {
            CollaboratorSpec::new(role, type_name, config).save(store.as_ref(), id).unwrap();
        }

        let tasks = TaskManager::new(store);
        let runner = TaskRunner::new(
            tasks.clone(),
            Arc::new(CollaboratorRegistry::with_builtins()),
            Arc::new(KindRegistry::with_builtins()),
        )
        .with_claim_wait(Duration::from_millis(200));
        Fixture {
            tasks,
            runner,
            jobs: MockJobSystem::new(),
        }
    }

    /// Submit everything UNSTARTED and return the recorded claims
    async fn submit(f: &mut Fixture) -> Vec<(TaskId, String)> {
        f.tasks.schedule_tasks(&mut f.jobs).unwrap();
        let report = f.jobs.run_queued_jobs().await;
        f.tasks.record_submissions(&report).unwrap();
        f.jobs
            .take_submitted()
            .into_iter()
            .map(|d| (d.task_id, d.claim))
            .collect()
    }

    #[tokio::test]
    async fn test_claimed_task_runs_to_done() {
        let mut f = fixture();
        let task = f.tasks.get_run_system_task("sys", "src", ResourceRequirements::default()).unwrap();
        let (task_id, claim) = submit(&mut f).await.remove(0);

        let report = f.runner.run(&task_id, &claim).await.unwrap();
        let RunReport::Completed(result) = report else {
            panic!("unexpected report {:?}", report);
        };

        let stored = f.tasks.load_task(task.id().unwrap()).unwrap();
        assert_eq!(stored.state(), TaskState::Done);
        assert_eq!(stored.result(), Some(&result));
        assert!(stored.failure().is_none());
    }

    #[tokio::test]
    async fn test_stale_claim_does_not_execute() {
        let mut f = fixture();
        let task = f.tasks.get_run_system_task("sys", "src", ResourceRequirements::default()).unwrap();
        submit(&mut f).await;

        let report = f.runner.run(task.id().unwrap(), "someone-else").await.unwrap();
        assert!(matches!(report, RunReport::NotClaimed { .. }));

        let stored = f.tasks.load_task(task.id().unwrap()).unwrap();
        assert!(stored.is_running());
        assert!(stored.result().is_none());
    }

    #[tokio::test]
    async fn test_unrecorded_submission_times_out() {
        let f = fixture();
        let task = f.tasks.get_run_system_task("sys", "src", ResourceRequirements::default()).unwrap();

        let report = f.runner.run(task.id().unwrap(), "claim").await.unwrap();
        assert_eq!(
            report,
            RunReport::NotClaimed {
                reason: "submission was never recorded".to_string()
            }
        );
        assert!(f.tasks.load_task(task.id().unwrap()).unwrap().is_unstarted());
    }

    #[tokio::test]
    async fn test_waits_for_submission_to_be_recorded() {
        let mut f = fixture();
        let task = f.tasks.get_run_system_task("sys", "src", ResourceRequirements::default()).unwrap();
        f.tasks.schedule_tasks(&mut f.jobs).unwrap();
        let submissions = f.jobs.run_queued_jobs().await;
        let claim = f.jobs.submitted()[0].claim.clone();

        let tasks = f.tasks.clone();
        let (report, _) = tokio::join!(f.runner.run(task.id().unwrap(), &claim), async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            tasks.record_submissions(&submissions).unwrap();
        });

        assert!(matches!(report.unwrap(), RunReport::Completed(_)));
    }

    #[tokio::test]
    async fn test_second_run_with_same_claim_is_refused() {
        let mut f = fixture();
        f.tasks.get_run_system_task("sys", "src", ResourceRequirements::default()).unwrap();
        let (task_id, claim) = submit(&mut f).await.remove(0);

        assert!(matches!(f.runner.run(&task_id, &claim).await.unwrap(), RunReport::Completed(_)));
        let again = f.runner.run(&task_id, &claim).await.unwrap();
        assert_eq!(
            again,
            RunReport::NotClaimed {
                reason: "task is already DONE".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_panic_is_recorded_as_failure() {
        let mut f = fixture();
        f.tasks.get_run_system_task("crashy", "src", ResourceRequirements::default()).unwrap();
        let (task_id, claim) = submit(&mut f).await.remove(0);

        let report = f.runner.run(&task_id, &claim).await.unwrap();
        assert!(matches!(report, RunReport::Failed { category: FailureCategory::Panicked, .. }));

        let stored = f.tasks.load_task(&task_id).unwrap();
        assert!(stored.is_failed());
        assert!(stored.result().is_none());
        assert!(stored.failure().unwrap().message.contains("mock system crashed"));
    }

    #[tokio::test]
    async fn test_unknown_kind_fails_task() {
        let mut f = fixture();
        f.tasks
            .get_task("calibrate_camera", json!({"camera": 1}), ResourceRequirements::default())
            .unwrap();
        let (task_id, claim) = submit(&mut f).await.remove(0);

        let report = f.runner.run(&task_id, &claim).await.unwrap();
        assert!(matches!(report, RunReport::Failed { category: FailureCategory::LoadFailure, .. }));
        assert!(f.tasks.load_task(&task_id).unwrap().is_failed());
    }

    #[tokio::test]
    async fn test_manually_failed_task_is_superseded() {
        let mut f = fixture();
        f.tasks.get_run_system_task("sys", "src", ResourceRequirements::default()).unwrap();
        let (task_id, claim) = submit(&mut f).await.remove(0);

        let mut task = f.tasks.load_task(&task_id).unwrap();
        f.tasks.fail_task(&task_id, "operator cancelled").unwrap();

        let store = f.tasks.store().clone();
        let late = Artifact::new(ArtifactKind::TrialResult, "mock_system", json!({"frames": 4}))
            .save(store.as_ref())
            .unwrap();

        let report = finish(&f.tasks, &mut task, &claim, RunOutcome::Complete(late.clone())).unwrap();
        assert_eq!(report, RunReport::Superseded);
        let stored = f.tasks.load_task(&task_id).unwrap();
        assert_eq!(stored.failure().unwrap().category, FailureCategory::Manual);

        // The late result has no task pointing at it and is gone
        assert!(Artifact::load(store.as_ref(), late.as_str()).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_task_is_an_error() {
        let f = fixture();
        let err = f.runner.run(&TaskId::new("ghost"), "c").await.unwrap_err();
        assert!(matches!(err, Error::EntityNotFound { .. }));
    }
}
