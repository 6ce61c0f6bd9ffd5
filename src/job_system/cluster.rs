//! Cluster job system
//!
//! Renders one batch script per descriptor with the task's resource
//! requests as scheduler directives and hands it to a submit command
//! (`qsub` by default). The job id is read from the submit command's
//! stdout; a non-zero exit is a submission failure.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::BatchConfig;
use crate::error::{Error, Result};
use crate::task::format_duration_hms;

use super::{
    resolve_executable, resolve_node_id, worker_env, JobDescriptor, JobQueue, JobSystem,
    SubmissionOutcome, SubmissionReport,
};

/// Submits workers to a batch cluster
pub struct ClusterJobSystem {
    queue: JobQueue,
    node_id: String,
    executable: String,
    submit_command: Vec<String>,
    env: Vec<(String, String)>,
    job_dir: PathBuf,
}

impl ClusterJobSystem {
    pub fn new(
        node_id: impl Into<String>,
        executable: impl Into<String>,
        submit_command: &str,
        job_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        let submit_command: Vec<String> = submit_command.split_whitespace().map(str::to_string).collect();
        if submit_command.is_empty() {
            return Err(Error::config_field_invalid(
                "job_system.submit_command",
                "the cluster job system needs a submit command",
            ));
        }
        Ok(Self {
            queue: JobQueue::default(),
            node_id: node_id.into(),
            executable: executable.into(),
            submit_command,
            env: Vec::new(),
            job_dir: job_dir.into(),
        })
    }

    pub fn from_config(config: &BatchConfig) -> Result<Self> {
        let settings = &config.job_system;
        let mut system = Self::new(
            resolve_node_id(settings.node_id.as_deref()),
            resolve_executable(settings.executable.as_deref())?,
            &settings.submit_command,
            config.job_dir(),
        )?;
        system.env = worker_env(config);
        Ok(system)
    }

    /// Batch script for one descriptor
    pub fn render_script(&self, descriptor: &JobDescriptor, log_path: &Path) -> String {
        let resources = &descriptor.resources;
        let mut script = String::from("#!/bin/bash\n");
        script.push_str(&format!("#PBS -N ba-{}\n", descriptor.task_id));
        script.push_str(&format!("#PBS -l nodes=1:ppn={}\n", resources.num_cpus.max(1)));
        if resources.num_gpus > 0 {
            script.push_str(&format!("#PBS -l ngpus={}\n", resources.num_gpus));
        }
        script.push_str(&format!("#PBS -l mem={}MB\n", resources.memory_mb));
        script.push_str(&format!(
            "#PBS -l walltime={}\n",
            format_duration_hms(resources.expected_duration_secs)
        ));
        script.push_str("#PBS -j oe\n");
        script.push_str(&format!("#PBS -o {}\n\n", log_path.display()));

        for (key, value) in &self.env {
            script.push_str(&format!("export {}={}\n", key, shell_quote(value)));
        }

        let args: Vec<String> = descriptor.worker_args().iter().map(|a| shell_quote(a)).collect();
        script.push_str(&format!("exec {} {}\n", shell_quote(&self.executable), args.join(" ")));
        script
    }

    fn write_script(&self, descriptor: &JobDescriptor) -> std::result::Result<PathBuf, String> {
        let scripts = self.job_dir.join("scripts");
        let logs = self.job_dir.join("logs");
        for dir in [&scripts, &logs] {
            fs::create_dir_all(dir).map_err(|e| format!("cannot create {}: {}", dir.display(), e))?;
        }

        let short_claim: String = descriptor.claim.chars().take(8).collect();
        let stem = format!("{}-{}", descriptor.task_id, short_claim);
        let script_path = scripts.join(format!("{}.sh", stem));
        let log_path = logs.join(format!("{}.log", stem));

        fs::write(&script_path, self.render_script(descriptor, &log_path))
            .map_err(|e| format!("cannot write {}: {}", script_path.display(), e))?;
        Ok(script_path)
    }

    async fn submit(&self, script_path: &Path) -> std::result::Result<String, String> {
        let output = Command::new(&self.submit_command[0])
            .args(&self.submit_command[1..])
            .arg(script_path)
            .output()
            .await
            .map_err(|e| format!("failed to run {}: {}", self.submit_command[0], e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!(
                "{} exited with {}: {}",
                self.submit_command[0],
                output.status,
                stderr.trim()
            ));
        }

        parse_job_id(&String::from_utf8_lossy(&output.stdout))
            .ok_or_else(|| format!("{} printed no job id", self.submit_command[0]))
    }
}

#[async_trait]
impl JobSystem for ClusterJobSystem {
    fn name(&self) -> &'static str {
        "cluster"
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
            let submitted = match self.write_script(&descriptor) {
                Ok(script_path) => self.submit(&script_path).await,
                Err(reason) => Err(reason),
            };

            match submitted {
                Ok(job_id) => {
                    info!(task_id = %descriptor.task_id, job_id = %job_id, "Submitted cluster job");
                    report.push(SubmissionOutcome::Submitted {
                        task_id: descriptor.task_id,
                        claim: descriptor.claim,
                        node_id: self.node_id.clone(),
                        job_id,
                    });
                }
                Err(reason) => {
                    warn!(task_id = %descriptor.task_id, reason = %reason, "Cluster submission failed");
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

/// Job id from submit output: the last word of the first non-empty line.
/// Covers `12345.server` (PBS) and `Submitted batch job 12345` (Slurm).
fn parse_job_id(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| line.split_whitespace().last())
        .map(str::to_string)
}

fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::ResourceRequirements;
    use crate::types::TaskId;
    use tempfile::TempDir;

    fn descriptor() -> JobDescriptor {
        JobDescriptor {
            task_id: TaskId::new("task-1"),
            kind: "train_system".to_string(),
            resources: ResourceRequirements {
                num_cpus: 8,
                num_gpus: 1,
                memory_mb: 16384,
                expected_duration_secs: 7200,
            },
            claim: "claim-abcdef".to_string(),
        }
    }

    #[test]
    fn test_parse_job_id() {
        assert_eq!(parse_job_id("12345.pbs-server\n").as_deref(), Some("12345.pbs-server"));
        assert_eq!(parse_job_id("\nSubmitted batch job 777\n").as_deref(), Some("777"));
        assert_eq!(parse_job_id("  \n"), None);
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/usr/bin/x"), "/usr/bin/x");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_render_script_directives() {
        let jobs = ClusterJobSystem::new("head", "/opt/batch-analysis", "qsub", "/tmp/jobs").unwrap();
        let script = jobs.render_script(&descriptor(), Path::new("/tmp/jobs/logs/x.log"));

        assert!(script.starts_with("#!/bin/bash\n"));
        assert!(script.contains("#PBS -l nodes=1:ppn=8"));
        assert!(script.contains("#PBS -l ngpus=1"));
        assert!(script.contains("#PBS -l mem=16384MB"));
        assert!(script.contains("#PBS -l walltime=02:00:00"));
        assert!(script.contains("exec /opt/batch-analysis run-task --task-id task-1 --claim claim-abcdef"));
    }

    #[test]
    fn test_empty_submit_command_rejected() {
        assert!(ClusterJobSystem::new("head", "x", "  ", "/tmp").is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_submit_parses_job_id() {
        let dir = TempDir::new().unwrap();
        let fake_qsub = dir.path().join("fake-qsub");
        fs::write(&fake_qsub, "echo \"Submitted batch job 4242\"\n").unwrap();

        let mut jobs = ClusterJobSystem::new(
            "head",
            "/opt/batch-analysis",
            &format!("sh {}", fake_qsub.display()),
            dir.path().join("jobs"),
        )
        .unwrap();
        jobs.enqueue(descriptor());

        let report = jobs.run_queued_jobs().await;
        match &report.outcomes[0] {
            SubmissionOutcome::Submitted { job_id, node_id, .. } => {
                assert_eq!(job_id, "4242");
                assert_eq!(node_id, "head");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(dir.path().join("jobs").join("scripts").join("task-1-claim-ab.sh").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_submit_command() {
        let dir = TempDir::new().unwrap();
        let mut jobs = ClusterJobSystem::new("head", "x", "false", dir.path()).unwrap();
        jobs.enqueue(descriptor());

        let report = jobs.run_queued_jobs().await;
        assert_eq!(report.failed_count(), 1);
    }
}
