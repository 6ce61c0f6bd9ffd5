//! Task manager
//!
//! The single authority for creating tasks and moving them through their
//! lifecycle in the store. Deduplication rests on the store's atomic
//! insert-if-absent keyed on the task fingerprint; every state change is a
//! compare-and-swap against the state (and claim) the change started from,
//! so concurrent passes and workers cannot both win a transition.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::job_system::{JobDescriptor, JobSystem, SubmissionOutcome, SubmissionReport};
use crate::store::{Collection, Filter, SharedStore};
use crate::task::{
    BenchmarkTrialParams, FailureCategory, ImportDatasetParams, ResourceCeiling, ResourceRequirements,
    ResourceViolation, RunSystemParams, Task, TaskParameters, TaskState, TrainSystemParams,
};
use crate::types::{ArtifactId, TaskId};

// ─────────────────────────────────────────────────────────────────
// Reports
// ─────────────────────────────────────────────────────────────────

/// A task left out of scheduling because it asks for too much
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedTask {
    pub task_id: TaskId,
    pub violations: Vec<ResourceViolation>,
}

/// What one call to [`TaskManager::schedule_tasks`] did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleReport {
    /// Tasks handed to the job system queue
    pub queued: Vec<TaskId>,
    /// Tasks over the resource ceiling
    pub skipped: Vec<SkippedTask>,
}

/// UNSTARTED tasks split by the resource ceiling, read from the store but
/// not yet queued
#[derive(Debug, Clone, Default)]
pub struct SchedulePlan {
    pub descriptors: Vec<JobDescriptor>,
    pub skipped: Vec<SkippedTask>,
}

impl SchedulePlan {
    /// Hand the plan's descriptors to a job system queue
    pub fn enqueue(self, job_system: &mut dyn JobSystem) -> ScheduleReport {
        let mut report = ScheduleReport {
            queued: Vec::new(),
            skipped: self.skipped,
        };
        for descriptor in self.descriptors {
            let task_id = descriptor.task_id.clone();
            if job_system.enqueue(descriptor) {
                report.queued.push(task_id);
            }
        }

        info!(
            queued = report.queued.len(),
            skipped = report.skipped.len(),
            job_system = job_system.name(),
            "Scheduled tasks"
        );
        report
    }
}

/// What [`TaskManager::record_submissions`] did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordReport {
    /// Moved to RUNNING
    pub started: Vec<TaskId>,
    /// Accepted by the backend but another submission won the task
    pub lost: Vec<TaskId>,
    /// Not accepted by the backend; still UNSTARTED
    pub rejected: Vec<TaskId>,
}

/// Task totals per state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskCounts {
    pub unstarted: usize,
    pub running: usize,
    pub done: usize,
    pub failed: usize,
}

impl TaskCounts {
    pub fn total(&self) -> usize {
        self.unstarted + self.running + self.done + self.failed
    }
}

// ─────────────────────────────────────────────────────────────────
// Task Manager
// ─────────────────────────────────────────────────────────────────

/// Creates, deduplicates, schedules and transitions tasks
#[derive(Clone)]
pub struct TaskManager {
    store: SharedStore,
    ceiling: ResourceCeiling,
}

impl TaskManager {
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            ceiling: ResourceCeiling::unlimited(),
        }
    }

    /// Skip tasks whose requirements exceed `ceiling` when scheduling
    pub fn with_ceiling(mut self, ceiling: ResourceCeiling) -> Self {
        self.ceiling = ceiling;
        self
    }

    pub fn ceiling(&self) -> &ResourceCeiling {
        &self.ceiling
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    // ─────────────────────────────────────────────────────────────
    // Get-or-create
    // ─────────────────────────────────────────────────────────────

    /// Return the live task for `(kind, parameters)`, creating an UNSTARTED
    /// one if none exists. FAILED tasks never match, so after a failure this
    /// creates the retry.
    pub fn get_task(&self, kind: &str, parameters: Value, resources: ResourceRequirements) -> Result<Task> {
        let candidate = Task::new(kind, parameters, resources);
        let live = live_filter(candidate.fingerprint());

        let inserted = self
            .store
            .insert_unique(Collection::Tasks, candidate.to_document_body()?, &live)?;
        let is_new = inserted.is_new();
        let task = Task::from_document(inserted.into_document())?;

        if is_new {
            info!(task_id = %task.display_id(), kind = %kind, "Created task");
        } else {
            debug!(task_id = %task.display_id(), kind = %kind, state = %task.state(), "Found existing task");
        }
        Ok(task)
    }

    /// Typed form of [`get_task`](Self::get_task)
    pub fn get_typed_task<P: TaskParameters>(&self, params: &P, resources: ResourceRequirements) -> Result<Task> {
        self.get_task(P::KIND, params.to_value()?, resources)
    }

    pub fn get_import_dataset_task(
        &self,
        loader: &str,
        path: &str,
        options: BTreeMap<String, Value>,
        resources: ResourceRequirements,
    ) -> Result<Task> {
        let params = ImportDatasetParams {
            loader: loader.to_string(),
            path: path.to_string(),
            options,
        };
        self.get_typed_task(&params, resources)
    }

    pub fn get_run_system_task(
        &self,
        system_id: &str,
        image_source_id: &str,
        resources: ResourceRequirements,
    ) -> Result<Task> {
        let params = RunSystemParams {
            system_id: system_id.to_string(),
            image_source_id: image_source_id.to_string(),
        };
        self.get_typed_task(&params, resources)
    }

    pub fn get_train_system_task(
        &self,
        trainer_id: &str,
        trainee_id: &str,
        resources: ResourceRequirements,
    ) -> Result<Task> {
        let params = TrainSystemParams {
            trainer_id: trainer_id.to_string(),
            trainee_id: trainee_id.to_string(),
        };
        self.get_typed_task(&params, resources)
    }

    pub fn get_benchmark_task(
        &self,
        trial_result_id: &str,
        benchmark_id: &str,
        resources: ResourceRequirements,
    ) -> Result<Task> {
        let params = BenchmarkTrialParams {
            trial_result_id: trial_result_id.to_string(),
            benchmark_id: benchmark_id.to_string(),
        };
        self.get_typed_task(&params, resources)
    }

    /// The live task for `(kind, parameters)` without creating one
    pub fn find_live_task(&self, kind: &str, parameters: &Value) -> Result<Option<Task>> {
        let fingerprint = crate::task::fingerprint(kind, parameters);
        self.store
            .find_one(Collection::Tasks, &live_filter(&fingerprint))?
            .map(Task::from_document)
            .transpose()
    }

    /// Every FAILED attempt at `(kind, parameters)`, oldest first
    pub fn failed_attempts(&self, kind: &str, parameters: &Value) -> Result<Vec<Task>> {
        let filter = Filter::all()
            .eq("fingerprint", crate::task::fingerprint(kind, parameters))
            .eq("state", TaskState::Failed.to_value());
        self.find_tasks(&filter)
    }

    // ─────────────────────────────────────────────────────────────
    // Scheduling
    // ─────────────────────────────────────────────────────────────

    /// Enqueue every UNSTARTED task that fits under the ceiling. Does not
    /// flush the job system.
    pub fn schedule_tasks(&self, job_system: &mut dyn JobSystem) -> Result<ScheduleReport> {
        Ok(self.plan_schedule()?.enqueue(job_system))
    }

    /// Descriptors for every UNSTARTED task within the ceiling
    pub fn plan_schedule(&self) -> Result<SchedulePlan> {
        let mut plan = SchedulePlan::default();

        for task in self.list_tasks(Some(TaskState::Unstarted))? {
            let task_id = task
                .id()
                .cloned()
                .ok_or_else(|| Error::Internal("stored task without id".to_string()))?;

            let violations = task.resources().violations(&self.ceiling);
            if !violations.is_empty() {
                let details: Vec<String> = violations.iter().map(ToString::to_string).collect();
                warn!(
                    task_id = %task_id,
                    kind = %task.kind(),
                    violations = %details.join(", "),
                    "Task exceeds resource ceiling, not scheduling"
                );
                plan.skipped.push(SkippedTask { task_id, violations });
                continue;
            }

            plan.descriptors.push(JobDescriptor::for_task(&task)?);
        }
        Ok(plan)
    }

    /// Mark accepted submissions RUNNING. A submission whose task is no
    /// longer UNSTARTED lost a race to another pass; its worker will see the
    /// claim mismatch and exit.
    pub fn record_submissions(&self, submissions: &SubmissionReport) -> Result<RecordReport> {
        let mut report = RecordReport::default();

        for outcome in &submissions.outcomes {
            match outcome {
                SubmissionOutcome::Submitted {
                    task_id,
                    claim,
                    node_id,
                    job_id,
                } => {
                    let mut task = self.load_task(task_id)?;
                    let before = expected_filter(&task);
                    if !task.is_unstarted() {
                        warn!(task_id = %task_id, state = %task.state(), "Submitted task was already started elsewhere");
                        report.lost.push(task_id.clone());
                        continue;
                    }

                    task.mark_running_claimed(node_id.as_str(), job_id.as_str(), Some(claim.clone()))?;
                    if self.swap(&task, &before)? {
                        info!(task_id = %task_id, node_id = %node_id, job_id = %job_id, "Task running");
                        report.started.push(task_id.clone());
                    } else {
                        warn!(task_id = %task_id, "Lost race marking task running");
                        report.lost.push(task_id.clone());
                    }
                }
                SubmissionOutcome::Failed { task_id, reason } => {
                    let err = Error::submission_failed(task_id.as_str(), reason.as_str());
                    warn!(task_id = %task_id, error = %err.format_for_log(), "Task stays unstarted");
                    report.rejected.push(task_id.clone());
                }
            }
        }
        Ok(report)
    }

    // ─────────────────────────────────────────────────────────────
    // Terminal transitions
    // ─────────────────────────────────────────────────────────────

    /// RUNNING → DONE for the submission holding `claim`. Returns false if
    /// the task was failed or reclaimed in the meantime.
    pub fn complete_claimed(&self, task: &mut Task, claim: &str, result: ArtifactId) -> Result<bool> {
        let before = claimed_filter(task, claim);
        task.mark_complete(result)?;
        self.swap(task, &before)
    }

    /// RUNNING → FAILED for the submission holding `claim`
    pub fn fail_claimed(
        &self,
        task: &mut Task,
        claim: &str,
        category: FailureCategory,
        message: impl Into<String>,
    ) -> Result<bool> {
        let before = claimed_filter(task, claim);
        task.mark_failed(category, message)?;
        self.swap(task, &before)
    }

    /// Mark a RUNNING task FAILED from outside its worker
    pub fn fail_task(&self, task_id: &TaskId, reason: &str) -> Result<Task> {
        let mut task = self.load_task(task_id)?;
        let before = expected_filter(&task);
        task.mark_failed(FailureCategory::Manual, reason)?;
        if !self.swap(&task, &before)? {
            return Err(Error::Execution(format!(
                "task {} changed while failing it; inspect it and retry",
                task_id
            )));
        }
        info!(task_id = %task_id, reason = %reason, "Task failed manually");
        Ok(task)
    }

    /// Fail RUNNING tasks that have run longer than their expected duration
    /// times `margin`
    pub fn reap_stale_tasks(&self, margin: f64, now: DateTime<Utc>) -> Result<Vec<Task>> {
        let mut reaped = Vec::new();

        for mut task in self.list_tasks(Some(TaskState::Running))? {
            let Some(started_at) = task.started_at() else {
                continue;
            };
            let allowed_secs = (task.resources().expected_duration_secs as f64 * margin).ceil() as i64;
            let deadline = started_at + ChronoDuration::seconds(allowed_secs);
            if now <= deadline {
                continue;
            }

            let before = expected_filter(&task);
            let message = format!(
                "no result after {}s (expected {}s, margin {})",
                (now - started_at).num_seconds(),
                task.resources().expected_duration_secs,
                margin
            );
            task.mark_failed(FailureCategory::Stale, message)?;
            if self.swap(&task, &before)? {
                warn!(task_id = %task.display_id(), job_id = ?task.job_id(), "Reaped stale task");
                reaped.push(task);
            }
        }
        Ok(reaped)
    }

    // ─────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────

    pub fn load_task(&self, task_id: &TaskId) -> Result<Task> {
        let doc = self
            .store
            .get(Collection::Tasks, task_id.as_str())?
            .ok_or_else(|| Error::not_found(Collection::Tasks.as_str(), task_id.as_str()))?;
        Task::from_document(doc)
    }

    /// Tasks in creation order, optionally restricted to one state
    pub fn list_tasks(&self, state: Option<TaskState>) -> Result<Vec<Task>> {
        let filter = match state {
            Some(state) => Filter::all().eq("state", state.to_value()),
            None => Filter::all(),
        };
        self.find_tasks(&filter)
    }

    pub fn counts(&self) -> Result<TaskCounts> {
        let mut counts = TaskCounts::default();
        for task in self.list_tasks(None)? {
            match task.state() {
                TaskState::Unstarted => counts.unstarted += 1,
                TaskState::Running => counts.running += 1,
                TaskState::Done => counts.done += 1,
                TaskState::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    fn find_tasks(&self, filter: &Filter) -> Result<Vec<Task>> {
        self.store
            .find(Collection::Tasks, filter)?
            .into_iter()
            .map(Task::from_document)
            .collect()
    }

    fn swap(&self, task: &Task, expected: &Filter) -> Result<bool> {
        let task_id = task
            .id()
            .ok_or_else(|| Error::Internal("cannot persist a task that was never saved".to_string()))?;
        self.store
            .compare_and_swap(Collection::Tasks, task_id.as_str(), expected, task.to_document_body()?)
    }
}

/// Matches tasks with this fingerprint that are not FAILED
fn live_filter(fingerprint: &str) -> Filter {
    Filter::all().eq("fingerprint", fingerprint).is_in(
        "state",
        [TaskState::Unstarted, TaskState::Running, TaskState::Done].map(TaskState::to_value),
    )
}

/// Matches the stored task only if it is still as `task` was loaded
fn expected_filter(task: &Task) -> Filter {
    let filter = Filter::all().eq("state", task.state().to_value());
    match task.claim() {
        Some(claim) => filter.eq("claim", claim),
        None => filter.exists("claim", false),
    }
}

fn claimed_filter(task: &Task, claim: &str) -> Filter {
    Filter::all()
        .eq("state", task.state().to_value())
        .eq("claim", claim)
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
