//! Recording job system for testing and dry runs

use std::collections::HashSet;

use async_trait::async_trait;
use tracing::info;

use crate::types::TaskId;

use super::{JobDescriptor, JobQueue, JobSystem, SubmissionOutcome, SubmissionReport};

const MOCK_NODE: &str = "mock-node";

/// Accepts (or rejects) descriptors without running anything
#[derive(Debug, Default)]
pub struct MockJobSystem {
    queue: JobQueue,
    submitted: Vec<JobDescriptor>,
    reject_all: bool,
    rejected_tasks: HashSet<TaskId>,
    next_job: u64,
}

impl MockJobSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following flush report submission failures
    pub fn set_reject_all(&mut self, reject: bool) {
        self.reject_all = reject;
    }

    /// Reject one task until cleared
    pub fn reject_task(&mut self, task_id: TaskId) {
        self.rejected_tasks.insert(task_id);
    }

    pub fn clear_rejections(&mut self) {
        self.reject_all = false;
        self.rejected_tasks.clear();
    }

    /// Every accepted descriptor, in submission order
    pub fn submitted(&self) -> &[JobDescriptor] {
        &self.submitted
    }

    /// Take the accepted descriptors, e.g. to run them in-process
    pub fn take_submitted(&mut self) -> Vec<JobDescriptor> {
        std::mem::take(&mut self.submitted)
    }
}

#[async_trait]
impl JobSystem for MockJobSystem {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn enqueue(&mut self, descriptor: JobDescriptor) -> bool {
        self.queue.push(descriptor)
    }

    fn pending(&self) -> usize {
        self.queue.len()
    }

    async fn run_queued_jobs(&mut self) -> SubmissionReport {
        let mut report = SubmissionReport::default();
        for descriptor in self.queue.drain() {
            if self.reject_all || self.rejected_tasks.contains(&descriptor.task_id) {
                report.push(SubmissionOutcome::Failed {
                    task_id: descriptor.task_id,
                    reason: "rejected by mock job system".to_string(),
                });
                continue;
            }

            self.next_job += 1;
            info!(task_id = %descriptor.task_id, kind = %descriptor.kind, "Mock submission");
            report.push(SubmissionOutcome::Submitted {
                task_id: descriptor.task_id.clone(),
                claim: descriptor.claim.clone(),
                node_id: MOCK_NODE.to_string(),
                job_id: format!("mock-{}", self.next_job),
            });
            self.submitted.push(descriptor);
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::ResourceRequirements;
    use crate::types::new_id;

    fn descriptor(id: &str) -> JobDescriptor {
        JobDescriptor {
            task_id: TaskId::new(id),
            kind: "import_dataset".to_string(),
            resources: ResourceRequirements::default(),
            claim: new_id(),
        }
    }

    #[tokio::test]
    async fn test_mock_records_submissions() {
        let mut jobs = MockJobSystem::new();
        jobs.enqueue(descriptor("a"));
        jobs.enqueue(descriptor("b"));
        assert_eq!(jobs.pending(), 2);

        let report = jobs.run_queued_jobs().await;
        assert_eq!(report.submitted_count(), 2);
        assert_eq!(jobs.pending(), 0);
        assert_eq!(jobs.submitted().len(), 2);

        // Job ids are unique
        let ids: HashSet<String> = report
            .outcomes
            .iter()
            .filter_map(|o| match o {
                SubmissionOutcome::Submitted { job_id, .. } => Some(job_id.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(ids.len(), 2);
    }

    #[tokio::test]
    async fn test_mock_rejections() {
        let mut jobs = MockJobSystem::new();
        jobs.reject_task(TaskId::new("b"));
        jobs.enqueue(descriptor("a"));
        jobs.enqueue(descriptor("b"));

        let report = jobs.run_queued_jobs().await;
        assert_eq!(report.submitted_count(), 1);
        assert_eq!(report.failed().next().unwrap().task_id().as_str(), "b");

        jobs.set_reject_all(true);
        jobs.enqueue(descriptor("c"));
        assert_eq!(jobs.run_queued_jobs().await.failed_count(), 1);

        jobs.clear_rejections();
        jobs.enqueue(descriptor("c"));
        assert_eq!(jobs.run_queued_jobs().await.submitted_count(), 1);
    }
}
