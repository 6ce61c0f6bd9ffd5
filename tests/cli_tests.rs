//! CLI integration tests
//!
//! Tests the command-line interface using assert_cmd

mod common;

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;

use common::TestEnvironment;

/// Get a command for the batch-analysis binary
fn batch_cmd() -> Command {
    Command::cargo_bin("batch-analysis").unwrap()
}

/// A command bound to the environment's config file
fn env_cmd(env: &TestEnvironment) -> Command {
    let mut cmd = batch_cmd();
    cmd.arg("--config").arg(env.config());
    cmd
}

fn stdout_of(cmd: &mut Command) -> String {
    let output = cmd.assert().success().get_output().stdout.clone();
    String::from_utf8(output).unwrap()
}

/// Task ids printed by `tasks list`
fn listed_ids(env: &TestEnvironment, state: &str) -> Vec<String> {
    let out = stdout_of(env_cmd(env).args(["tasks", "list", "--state", state]));
    out.lines()
        .take_while(|line| !line.trim().is_empty())
        .filter_map(|line| line.split_whitespace().next().map(str::to_string))
        .collect()
}

fn show_task(env: &TestEnvironment, id: &str) -> Value {
    let out = stdout_of(env_cmd(env).args(["tasks", "show", id]));
    serde_json::from_str(&out).unwrap()
}

// ─────────────────────────────────────────────────────────────────
// Help and Version Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_help_flag() {
    batch_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("schedule"))
        .stdout(predicate::str::contains("daemon"))
        .stdout(predicate::str::contains("run-task"))
        .stdout(predicate::str::contains("tasks"))
        .stdout(predicate::str::contains("experiment"));
}

#[test]
fn test_version_command() {
    batch_cmd()
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains("batch-analysis"))
        .stdout(predicate::str::contains("Build Information"))
        .stdout(predicate::str::contains("Git Hash"));
}

#[test]
fn test_short_version_flag() {
    batch_cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("batch-analysis"));
}

// ─────────────────────────────────────────────────────────────────
// Config Command Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_config_show() {
    let env = TestEnvironment::new();
    env_cmd(&env)
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[store]"))
        .stdout(predicate::str::contains("[scheduler]"))
        .stdout(predicate::str::contains("[job_system]"))
        .stdout(predicate::str::contains("kind = \"mock\""));
}

#[test]
fn test_config_validate_fixture() {
    batch_cmd()
        .arg("--config")
        .arg(common::valid_config_fixture())
        .args(["config", "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid"));
}

#[test]
fn test_config_validate_invalid_fixture() {
    batch_cmd()
        .arg("--config")
        .arg(common::invalid_config_fixture())
        .args(["config", "validate"])
        .assert()
        .failure();
}

#[test]
fn test_config_missing_file() {
    batch_cmd()
        .args(["--config", "/nonexistent/batch-analysis.toml", "tasks", "list"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_config_init_and_force() {
    let env = TestEnvironment::new();
    let path = env.path().join("fresh.toml");
    let path = path.to_str().unwrap();

    batch_cmd()
        .args(["config", "init", "--path", path])
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration written"));

    // A second init without --force refuses to overwrite
    batch_cmd().args(["config", "init", "--path", path]).assert().failure();

    batch_cmd()
        .args(["config", "init", "--path", path, "--force"])
        .assert()
        .success();
}

#[test]
fn test_unknown_job_system_override() {
    let env = TestEnvironment::new();
    env_cmd(&env)
        .args(["--job-system", "slurm", "tasks", "list"])
        .assert()
        .failure();
}

// ─────────────────────────────────────────────────────────────────
// Experiment and Task Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_experiment_add_and_list() {
    let env = TestEnvironment::new();
    env_cmd(&env)
        .arg("experiment")
        .arg("add")
        .arg(common::experiment_fixture())
        .assert()
        .success()
        .stdout(predicate::str::contains("fixture-experiment"));

    env_cmd(&env)
        .args(["experiment", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("fixture-experiment"))
        .stdout(predicate::str::contains("systems=2"));
}

#[test]
fn test_experiment_add_missing_file() {
    let env = TestEnvironment::new();
    env_cmd(&env)
        .args(["experiment", "add", "/nonexistent/experiment.toml"])
        .assert()
        .failure();
}

#[test]
fn test_tasks_show_unknown_id() {
    let env = TestEnvironment::new();
    env_cmd(&env).args(["tasks", "show", "no-such-task"]).assert().failure();
}

#[test]
fn test_tasks_list_rejects_unknown_state() {
    let env = TestEnvironment::new();
    env_cmd(&env)
        .args(["tasks", "list", "--state", "paused"])
        .assert()
        .failure();
}

#[test]
fn test_dry_run_submits_nothing() {
    let env = TestEnvironment::new();
    env_cmd(&env)
        .arg("experiment")
        .arg("add")
        .arg(common::experiment_fixture())
        .assert()
        .success();

    // Dry runs do not drive experiments, so there is nothing to submit yet
    env_cmd(&env)
        .args(["schedule", "--dry-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("would submit").not());

    assert!(listed_ids(&env, "unstarted").is_empty());
}

#[test]
fn test_schedule_run_and_link() {
    let env = TestEnvironment::new();
    env_cmd(&env)
        .arg("experiment")
        .arg("add")
        .arg(common::experiment_fixture())
        .assert()
        .success();

    // tracker × stills is inappropriate; the other three pairings run
    let report: Value = serde_json::from_str(&stdout_of(env_cmd(&env).arg("schedule"))).unwrap();
    assert_eq!(report["drive"]["created"], 3);
    assert_eq!(report["drive"]["unsupported"], 1);
    assert_eq!(report["submitted"], 3);
    assert_eq!(report["started"], 3);

    let running = listed_ids(&env, "running");
    assert_eq!(running.len(), 3);

    for id in &running {
        let task = show_task(&env, id);
        assert_eq!(task["kind"], "run_system");
        let claim = task["claim"].as_str().unwrap().to_string();

        env_cmd(&env)
            .args(["run-task", "--task-id", id, "--claim", &claim])
            .assert()
            .success()
            .stdout(predicate::str::contains("DONE"));
    }
    assert_eq!(listed_ids(&env, "done").len(), 3);

    // The next pass links the trials and creates their benchmark tasks
    let report: Value = serde_json::from_str(&stdout_of(env_cmd(&env).arg("schedule"))).unwrap();
    assert_eq!(report["drive"]["linked"], 3);
    assert_eq!(report["drive"]["created"], 3);

    env_cmd(&env)
        .args(["experiment", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("trials=3"));
}

#[test]
fn test_run_task_with_stale_claim_does_nothing() {
    let env = TestEnvironment::new();
    env_cmd(&env)
        .arg("experiment")
        .arg("add")
        .arg(common::experiment_fixture())
        .assert()
        .success();
    env_cmd(&env).arg("schedule").assert().success();

    let id = listed_ids(&env, "running").remove(0);
    env_cmd(&env)
        .args(["run-task", "--task-id", &id, "--claim", "not-the-claim"])
        .assert()
        .success()
        .stdout(predicate::str::contains("NOT RUN"));

    assert_eq!(show_task(&env, &id)["state"], "RUNNING");
}

#[test]
fn test_manual_fail_then_retry() {
    let env = TestEnvironment::new();
    env_cmd(&env)
        .arg("experiment")
        .arg("add")
        .arg(common::experiment_fixture())
        .assert()
        .success();
    env_cmd(&env).arg("schedule").assert().success();

    let id = listed_ids(&env, "running").remove(0);
    env_cmd(&env)
        .args(["tasks", "fail", &id, "--reason", "node rebooted"])
        .assert()
        .success();

    let task = show_task(&env, &id);
    assert_eq!(task["state"], "FAILED");
    assert_eq!(task["failure"]["message"], "node rebooted");

    // Failing a task twice is an invalid transition
    env_cmd(&env)
        .args(["tasks", "fail", &id, "--reason", "again"])
        .assert()
        .failure();

    // max_attempts is 2, so the next pass creates a fresh attempt
    let report: Value = serde_json::from_str(&stdout_of(env_cmd(&env).arg("schedule"))).unwrap();
    assert_eq!(report["drive"]["created"], 1);
    assert_eq!(listed_ids(&env, "failed"), vec![id]);
}

// ─────────────────────────────────────────────────────────────────
// Logging Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_logs_go_to_stderr() {
    let env = TestEnvironment::new();
    env_cmd(&env)
        .env_remove("BATCH_LOG")
        .env_remove("RUST_LOG")
        .args(["tasks", "list", "--state", "running"])
        .assert()
        .success()
        .stderr(predicate::str::contains("Starting batch-analysis"))
        .stdout(predicate::str::contains("Starting batch-analysis").not());
}

#[test]
fn test_log_filter_env_overrides_level() {
    let env = TestEnvironment::new();
    env_cmd(&env)
        .env("BATCH_LOG", "error")
        .args(["tasks", "list", "--state", "running"])
        .assert()
        .success()
        .stderr(predicate::str::contains("Starting batch-analysis").not());
}

#[test]
fn test_log_file_named_for_scheduler_and_worker() {
    let env = TestEnvironment::new();
    let log_path = env.path().join("logs").join("batch.log");
    let log_files = |prefix: &str| {
        std::fs::read_dir(env.path().join("logs"))
            .map(|entries| {
                entries
                    .filter_map(|entry| entry.ok())
                    .filter(|entry| entry.file_name().to_string_lossy().starts_with(prefix))
                    .count()
            })
            .unwrap_or(0)
    };

    env_cmd(&env)
        .env("BATCH_LOG_FILE", &log_path)
        .args(["tasks", "list", "--state", "running"])
        .assert()
        .success();
    assert_eq!(log_files("batch-scheduler"), 1);
    assert_eq!(log_files("batch-worker"), 0);

    // Worker output lands in its own file even when the task is unknown
    env_cmd(&env)
        .env("BATCH_LOG_FILE", &log_path)
        .args(["run-task", "--task-id", "no-such-task", "--claim", "c"])
        .assert();
    assert_eq!(log_files("batch-worker"), 1);
}
