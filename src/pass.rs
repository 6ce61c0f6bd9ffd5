//! Scheduling pass
//!
//! One pass reaps stale tasks (when a watchdog margin is configured),
//! drives every enabled experiment, schedules UNSTARTED tasks onto the job
//! system, flushes it and records which submissions were accepted. Passes
//! keep no state between runs; the daemon simply repeats them.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::collaborators::CollaboratorRegistry;
use crate::error::Result;
use crate::experiment::{DriveReport, ExperimentDriver};
use crate::job_system::JobSystem;
use crate::store::blocking;
use crate::task_manager::{SkippedTask, TaskManager};
use crate::types::TaskId;

/// Summary of one pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub reaped: usize,
    pub drive: DriveReport,
    pub queued: usize,
    pub skipped: usize,
    pub submitted: usize,
    pub submission_failures: usize,
    pub started: usize,
    pub lost: usize,
}

/// What a pass would submit, without submitting it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DryRunReport {
    pub would_submit: Vec<TaskId>,
    pub skipped: Vec<SkippedTask>,
}

/// Runs scheduling passes against one store
pub struct Scheduler {
    tasks: TaskManager,
    driver: ExperimentDriver,
    watchdog_margin: Option<f64>,
}

impl Scheduler {
    pub fn new(tasks: TaskManager, collaborators: Arc<CollaboratorRegistry>) -> Self {
        Self {
            driver: ExperimentDriver::new(tasks.clone(), collaborators),
            tasks,
            watchdog_margin: None,
        }
    }

    /// Fail RUNNING tasks older than `margin` × their expected duration at
    /// the start of each pass
    pub fn with_watchdog(mut self, margin: Option<f64>) -> Self {
        self.watchdog_margin = margin;
        self
    }

    pub fn tasks(&self) -> &TaskManager {
        &self.tasks
    }

    /// Run one full pass. Store work runs on the blocking pool.
    pub async fn run_pass(&self, job_system: &mut dyn JobSystem) -> Result<PassReport> {
        let mut report = PassReport::default();

        if let Some(margin) = self.watchdog_margin {
            let tasks = self.tasks.clone();
            report.reaped = blocking(move || tasks.reap_stale_tasks(margin, Utc::now())).await?.len();
        }

        let driver = self.driver.clone();
        report.drive = blocking(move || driver.run_pass()).await?;

        let tasks = self.tasks.clone();
        let plan = blocking(move || tasks.plan_schedule()).await?;
        let scheduled = plan.enqueue(job_system);
        report.queued = scheduled.queued.len();
        report.skipped = scheduled.skipped.len();

        let submissions = job_system.run_queued_jobs().await;
        report.submitted = submissions.submitted_count();
        report.submission_failures = submissions.failed_count();

        let tasks = self.tasks.clone();
        let recorded = blocking(move || tasks.record_submissions(&submissions)).await?;
        report.started = recorded.started.len();
        report.lost = recorded.lost.len();

        info!(
            reaped = report.reaped,
            created = report.drive.created,
            linked = report.drive.linked,
            queued = report.queued,
            skipped = report.skipped,
            submitted = report.submitted,
            submission_failures = report.submission_failures,
            started = report.started,
            "Scheduling pass complete"
        );
        Ok(report)
    }

    /// List what the next pass would submit from the tasks already stored.
    /// Neither drives experiments nor touches any task.
    pub fn dry_run(&self) -> Result<DryRunReport> {
        let plan = self.tasks.plan_schedule()?;
        Ok(DryRunReport {
            would_submit: plan.descriptors.into_iter().map(|d| d.task_id).collect(),
            skipped: plan.skipped,
        })
    }

    /// Run passes every `interval` until Ctrl+C. Fatal errors end the loop;
    /// others are logged and the next pass retries.
    pub async fn run_daemon(&self, job_system: &mut dyn JobSystem, interval: Duration) -> Result<()> {
        let shutdown_signal = tokio::signal::ctrl_c();
        tokio::pin!(shutdown_signal);

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(interval_secs = interval.as_secs(), job_system = job_system.name(), "Scheduler daemon started");

        let mut passes: u64 = 0;
        loop {
            tokio::select! {
                _ = &mut shutdown_signal => {
                    info!(passes, "Shutdown signal received");
                    break;
                }
                _ = ticker.tick() => {
                    passes += 1;
                    match self.run_pass(job_system).await {
                        Ok(_) => {}
                        Err(e) if e.is_fatal() => {
                            error!(error = %e.format_for_log(), "Fatal error in scheduling pass");
                            return Err(e);
                        }
                        Err(e) => {
                            warn!(error = %e.format_for_log(), retryable = e.is_retryable(), "Scheduling pass failed");
                        }
                    }
                }
            }
        }

        Ok(())
    }
}
