//! Local process job system
//!
//! Each accepted descriptor becomes a detached `run-task` child process on
//! this machine. Capacity is counted in CPU cores and GPUs; descriptors that
//! do not fit alongside the jobs still running are reported as submission
//! failures and picked up again by a later pass.
//!
//! Children spawned by this process are tracked directly. Workers started by
//! earlier `schedule` invocations are counted from the RUNNING tasks the
//! store records for this node, so a task whose worker died keeps holding
//! its cores until it is reaped or failed by hand.

use std::collections::HashSet;
use std::fs::{self, File};
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::config::BatchConfig;
use crate::error::Result;
use crate::store::{blocking, open_store};
use crate::task::TaskState;
use crate::task_manager::TaskManager;
use crate::types::TaskId;

use super::{
    resolve_executable, resolve_node_id, worker_env, JobDescriptor, JobQueue, JobSystem,
    SubmissionOutcome, SubmissionReport,
};

struct RunningJob {
    task_id: TaskId,
    cpus: u32,
    gpus: u32,
    child: Child,
}

/// Spawns workers as local child processes
pub struct LocalJobSystem {
    queue: JobQueue,
    node_id: String,
    executable: String,
    env: Vec<(String, String)>,
    log_dir: PathBuf,
    cpu_capacity: u32,
    gpu_capacity: u32,
    running: Vec<RunningJob>,
    tasks: Option<TaskManager>,
}

impl LocalJobSystem {
    pub fn new(
        node_id: impl Into<String>,
        executable: impl Into<String>,
        log_dir: impl Into<PathBuf>,
        cpu_capacity: u32,
        gpu_capacity: u32,
    ) -> Self {
        Self {
            queue: JobQueue::default(),
            node_id: node_id.into(),
            executable: executable.into(),
            env: Vec::new(),
            log_dir: log_dir.into(),
            cpu_capacity: cpu_capacity.max(1),
            gpu_capacity,
            running: Vec::new(),
            tasks: None,
        }
    }

    /// Count RUNNING tasks on this node from the store against capacity
    pub fn with_task_store(mut self, tasks: TaskManager) -> Self {
        self.tasks = Some(tasks);
        self
    }

    pub fn from_config(config: &BatchConfig) -> Result<Self> {
        let settings = &config.job_system;
        let cpus = match settings.local_cpus {
            0 => num_cpus::get() as u32,
            n => n,
        };
        let mut system = Self::new(
            resolve_node_id(settings.node_id.as_deref()),
            resolve_executable(settings.executable.as_deref())?,
            config.job_dir().join("logs"),
            cpus,
            settings.local_gpus,
        )
        .with_task_store(TaskManager::new(open_store(&config.store)?));
        system.env = worker_env(config);
        Ok(system)
    }

    /// Number of children not yet observed to exit
    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    fn reap_finished(&mut self) {
        self.running.retain_mut(|job| match job.child.try_wait() {
            Ok(Some(status)) => {
                debug!(task_id = %job.task_id, status = %status, "Local worker exited");
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!(task_id = %job.task_id, error = %e, "Cannot poll local worker, forgetting it");
                false
            }
        });
    }

    /// Cores and GPUs held by RUNNING tasks on this node that have no child
    /// handle in this process
    async fn usage_from_earlier_runs(&self) -> (u32, u32) {
        let Some(tasks) = self.tasks.clone() else {
            return (0, 0);
        };
        let node_id = self.node_id.clone();
        let own: HashSet<TaskId> = self.running.iter().map(|job| job.task_id.clone()).collect();

        match blocking(move || tasks.list_tasks(Some(TaskState::Running))).await {
            Ok(running) => running
                .iter()
                .filter(|task| task.node_id() == Some(node_id.as_str()))
                .filter(|task| task.id().map_or(false, |id| !own.contains(id)))
                .fold((0, 0), |(cpus, gpus), task| {
                    let resources = task.resources();
                    (cpus + resources.num_cpus.max(1), gpus + resources.num_gpus)
                }),
            Err(e) => {
                warn!(error = %e.format_for_log(), "Cannot read running tasks, counting only this process's workers");
                (0, 0)
            }
        }
    }

    fn spawn(&self, descriptor: &JobDescriptor) -> std::result::Result<Child, String> {
        fs::create_dir_all(&self.log_dir)
            .map_err(|e| format!("cannot create log directory {}: {}", self.log_dir.display(), e))?;

        let short_claim: String = descriptor.claim.chars().take(8).collect();
        let log_path = self
            .log_dir
            .join(format!("{}-{}.log", descriptor.task_id, short_claim));
        let stdout = File::create(&log_path)
            .map_err(|e| format!("cannot create log file {}: {}", log_path.display(), e))?;
        let stderr = stdout
            .try_clone()
            .map_err(|e| format!("cannot duplicate log handle: {}", e))?;

        Command::new(&self.executable)
            .args(descriptor.worker_args())
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|e| format!("failed to spawn {}: {}", self.executable, e))
    }
}

#[async_trait]
impl JobSystem for LocalJobSystem {
    fn name(&self) -> &'static str {
        "local"
    }

    fn enqueue(&mut self, descriptor: JobDescriptor) -> bool {
        self.queue.push(descriptor)
    }

    fn pending(&self) -> usize {
        self.queue.len()
    }

    async fn run_queued_jobs(&mut self) -> SubmissionReport {
        self.reap_finished();
        let (earlier_cpus, earlier_gpus) = self.usage_from_earlier_runs().await;
        let mut used_cpus: u32 = earlier_cpus + self.running.iter().map(|j| j.cpus).sum::<u32>();
        let mut used_gpus: u32 = earlier_gpus + self.running.iter().map(|j| j.gpus).sum::<u32>();

        let mut report = SubmissionReport::default();
        for descriptor in self.queue.drain() {
            let cpus = descriptor.resources.num_cpus.max(1);
            let gpus = descriptor.resources.num_gpus;

            if used_cpus + cpus > self.cpu_capacity || used_gpus + gpus > self.gpu_capacity {
                debug!(
                    task_id = %descriptor.task_id,
                    cpus,
                    gpus,
                    free_cpus = self.cpu_capacity.saturating_sub(used_cpus),
                    free_gpus = self.gpu_capacity.saturating_sub(used_gpus),
                    "Insufficient local capacity"
                );
                report.push(SubmissionOutcome::Failed {
                    task_id: descriptor.task_id,
                    reason: "insufficient local capacity".to_string(),
                });
                continue;
            }

            match self.spawn(&descriptor) {
                Ok(child) => {
                    let job_id = child
                        .id()
                        .map(|pid| pid.to_string())
                        .unwrap_or_else(|| descriptor.claim.clone());
                    info!(task_id = %descriptor.task_id, job_id = %job_id, "Spawned local worker");

                    used_cpus += cpus;
                    used_gpus += gpus;
                    report.push(SubmissionOutcome::Submitted {
                        task_id: descriptor.task_id.clone(),
                        claim: descriptor.claim.clone(),
                        node_id: self.node_id.clone(),
                        job_id,
                    });
                    self.running.push(RunningJob {
                        task_id: descriptor.task_id,
                        cpus,
                        gpus,
                        child,
                    });
                }
                Err(reason) => {
                    warn!(task_id = %descriptor.task_id, reason = %reason, "Local submission failed");
                    report.push(SubmissionOutcome::Failed {
                        task_id: descriptor.task_id,
                        reason,
                    });
                }
            }
        }
        report
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::task::ResourceRequirements;
    use crate::types::new_id;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn descriptor(id: &str, cpus: u32, gpus: u32) -> JobDescriptor {
        JobDescriptor {
            task_id: TaskId::new(id),
            kind: "run_system".to_string(),
            resources: ResourceRequirements {
                num_cpus: cpus,
                num_gpus: gpus,
                ..Default::default()
            },
            claim: new_id(),
        }
    }

    #[tokio::test]
    async fn test_capacity_bounds_submissions() {
        let dir = TempDir::new().unwrap();
        let mut jobs = LocalJobSystem::new("node-a", "true", dir.path(), 2, 0);
        jobs.enqueue(descriptor("a", 1, 0));
        jobs.enqueue(descriptor("b", 1, 0));
        jobs.enqueue(descriptor("c", 1, 0));
        jobs.enqueue(descriptor("gpu", 1, 1));

        let report = jobs.run_queued_jobs().await;
        assert_eq!(report.submitted_count(), 2);
        assert_eq!(report.failed_count(), 2);
        for outcome in report.submitted() {
            if let SubmissionOutcome::Submitted { node_id, .. } = outcome {
                assert_eq!(node_id, "node-a");
            }
        }
        assert!(dir.path().read_dir().unwrap().count() >= 2);
    }

    #[tokio::test]
    async fn test_capacity_counts_workers_from_earlier_runs() {
        let dir = TempDir::new().unwrap();
        let tasks = TaskManager::new(Arc::new(MemoryStore::new()));
        let two_cores = ResourceRequirements {
            num_cpus: 2,
            ..Default::default()
        };
        let task = tasks.get_run_system_task("sys", "src", two_cores).unwrap();

        // A previous invocation started this worker on node-a
        let mut earlier = SubmissionReport::default();
        earlier.push(SubmissionOutcome::Submitted {
            task_id: task.id().cloned().unwrap(),
            claim: new_id(),
            node_id: "node-a".to_string(),
            job_id: "4242".to_string(),
        });
        assert_eq!(tasks.record_submissions(&earlier).unwrap().started.len(), 1);

        let mut jobs = LocalJobSystem::new("node-a", "true", dir.path(), 3, 0).with_task_store(tasks.clone());
        jobs.enqueue(descriptor("a", 1, 0));
        jobs.enqueue(descriptor("b", 1, 0));
        let report = jobs.run_queued_jobs().await;
        assert_eq!(report.submitted_count(), 1);
        assert_eq!(report.failed_count(), 1);

        // Workers on other nodes do not count here
        let mut other = LocalJobSystem::new("node-b", "true", dir.path(), 3, 0).with_task_store(tasks);
        other.enqueue(descriptor("c", 1, 0));
        other.enqueue(descriptor("d", 1, 0));
        assert_eq!(other.run_queued_jobs().await.submitted_count(), 2);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let dir = TempDir::new().unwrap();
        let mut jobs = LocalJobSystem::new("node-a", "/nonexistent/batch-analysis", dir.path(), 4, 0);
        jobs.enqueue(descriptor("a", 1, 0));

        let report = jobs.run_queued_jobs().await;
        assert_eq!(report.failed_count(), 1);
        assert_eq!(jobs.running_count(), 0);
    }
}
