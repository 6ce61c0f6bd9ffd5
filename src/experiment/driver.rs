//! Experiment driver
//!
//! Turns an experiment's collaborator lists into tasks. For every pairing:
//!
//! 1. settled pairings (result, unsupported, exhausted) are skipped;
//! 2. a live task is followed: DONE is linked, anything else waits;
//! 3. a previous `incompatible` failure marks the pairing unsupported;
//! 4. `max_attempts` failures mark it exhausted;
//! 5. otherwise appropriateness is checked before asking for a task.
//!    Collaborators that cannot be loaded defer the pairing.

use std::ops::AddAssign;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::collaborators::{Artifact, CollaboratorRegistry};
use crate::error::{Error, Result};
use crate::task::{
    BenchmarkTrialParams, FailureCategory, ImportDatasetParams, RunSystemParams, Task, TaskParameters,
    TaskState, TrainSystemParams,
};
use crate::task_manager::TaskManager;

use super::{Experiment, PairLinks};

/// Result of an appropriateness check
enum Appropriate {
    Yes,
    No(String),
    /// A collaborator could not be loaded; try again next pass
    Deferred(String),
}

/// Counts of what a drive did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DriveReport {
    /// Tasks created this drive
    pub created: usize,
    /// Live tasks still UNSTARTED or RUNNING
    pub waiting: usize,
    /// Results newly linked
    pub linked: usize,
    /// Pairings newly marked unsupported
    pub unsupported: usize,
    /// Pairings newly marked exhausted
    pub exhausted: usize,
    /// Pairings skipped because a collaborator failed to load
    pub deferred: usize,
    /// Experiments that could not be driven
    pub errors: usize,
}

impl AddAssign for DriveReport {
    fn add_assign(&mut self, other: Self) {
        self.created += other.created;
        self.waiting += other.waiting;
        self.linked += other.linked;
        self.unsupported += other.unsupported;
        self.exhausted += other.exhausted;
        self.deferred += other.deferred;
        self.errors += other.errors;
    }
}

/// Applies the retry and incompatibility policy to experiments
#[derive(Clone)]
pub struct ExperimentDriver {
    tasks: TaskManager,
    collaborators: Arc<CollaboratorRegistry>,
}

impl ExperimentDriver {
    pub fn new(tasks: TaskManager, collaborators: Arc<CollaboratorRegistry>) -> Self {
        Self { tasks, collaborators }
    }

    /// Drive every enabled experiment and merge its new links into the
    /// stored record. One experiment failing does not stop the others.
    pub fn run_pass(&self) -> Result<DriveReport> {
        let mut total = DriveReport::default();

        for mut experiment in Experiment::list(self.tasks.store().as_ref())? {
            if !experiment.enabled {
                debug!(experiment = %experiment.name, "Skipping disabled experiment");
                continue;
            }

            let drive = self
                .drive(&mut experiment)
                .and_then(|report| experiment.save_links(self.tasks.store().as_ref()).map(|_| report));
            match drive {
                Ok(report) => {
                    info!(
                        experiment = %experiment.name,
                        created = report.created,
                        waiting = report.waiting,
                        linked = report.linked,
                        unsupported = report.unsupported,
                        exhausted = report.exhausted,
                        deferred = report.deferred,
                        "Drove experiment"
                    );
                    total += report;
                }
                Err(e) => {
                    error!(experiment = %experiment.name, error = %e, "Failed to drive experiment");
                    total.errors += 1;
                }
            }
        }
        Ok(total)
    }

    /// One round over every pairing of `experiment`. Does not save.
    pub fn drive(&self, experiment: &mut Experiment) -> Result<DriveReport> {
        let mut report = DriveReport::default();
        self.drive_imports(experiment, &mut report)?;
        self.drive_training(experiment, &mut report)?;
        self.drive_trials(experiment, &mut report)?;
        self.drive_benchmarks(experiment, &mut report)?;
        Ok(report)
    }

    fn drive_imports(&self, experiment: &mut Experiment, report: &mut DriveReport) -> Result<()> {
        for import in experiment.imports.clone() {
            let params = ImportDatasetParams {
                loader: import.loader.clone(),
                path: import.path.clone(),
                options: import.options.clone(),
            };
            let key = import.link_key();
            let step = Pairing {
                first: &import.loader,
                second: &key,
                kind: ImportDatasetParams::KIND,
                params: params.to_value()?,
            };
            self.step(experiment, Link::Imported, step, report, || {
                match self.collaborators.loader(&import.loader) {
                    Ok(_) => Appropriate::Yes,
                    Err(e) => Appropriate::Deferred(e.to_string()),
                }
            })?;
        }
        Ok(())
    }

    fn drive_training(&self, experiment: &mut Experiment, report: &mut DriveReport) -> Result<()> {
        let store = self.tasks.store().clone();
        for trainer_id in experiment.trainers.clone() {
            for trainee_id in experiment.trainees.clone() {
                let params = TrainSystemParams {
                    trainer_id: trainer_id.clone(),
                    trainee_id: trainee_id.clone(),
                };
                let step = Pairing {
                    first: &trainer_id,
                    second: &trainee_id,
                    kind: TrainSystemParams::KIND,
                    params: params.to_value()?,
                };
                self.step(experiment, Link::Trained, step, report, || {
                    let trainer = match self.collaborators.load_trainer(store.as_ref(), &trainer_id) {
                        Ok(trainer) => trainer,
                        Err(e) => return Appropriate::Deferred(e.to_string()),
                    };
                    let trainee = match self.collaborators.load_trainee(store.as_ref(), &trainee_id) {
                        Ok(trainee) => trainee,
                        Err(e) => return Appropriate::Deferred(e.to_string()),
                    };
                    if trainer.can_train_trainee(trainee.as_ref()) {
                        Appropriate::Yes
                    } else {
                        Appropriate::No(format!("{} cannot train {}", trainer_id, trainee_id))
                    }
                })?;
            }
        }
        Ok(())
    }

    fn drive_trials(&self, experiment: &mut Experiment, report: &mut DriveReport) -> Result<()> {
        let store = self.tasks.store().clone();
        for system_id in experiment.all_systems() {
            for source_id in experiment.all_image_sources() {
                let params = RunSystemParams {
                    system_id: system_id.clone(),
                    image_source_id: source_id.clone(),
                };
                let step = Pairing {
                    first: &system_id,
                    second: &source_id,
                    kind: RunSystemParams::KIND,
                    params: params.to_value()?,
                };
                self.step(experiment, Link::Trials, step, report, || {
                    let system = match self.collaborators.load_system(store.as_ref(), &system_id) {
                        Ok(system) => system,
                        Err(e) => return Appropriate::Deferred(e.to_string()),
                    };
                    let source = match self.collaborators.load_image_source(store.as_ref(), &source_id) {
                        Ok(source) => source,
                        Err(e) => return Appropriate::Deferred(e.to_string()),
                    };
                    if system.is_image_source_appropriate(source.as_ref()) {
                        Appropriate::Yes
                    } else {
                        Appropriate::No(format!("{} cannot run on {}", system_id, source_id))
                    }
                })?;
            }
        }
        Ok(())
    }

    fn drive_benchmarks(&self, experiment: &mut Experiment, report: &mut DriveReport) -> Result<()> {
        let store = self.tasks.store().clone();
        for trial_id in experiment.trial_results() {
            for benchmark_id in experiment.benchmarks.clone() {
                let params = BenchmarkTrialParams {
                    trial_result_id: trial_id.clone(),
                    benchmark_id: benchmark_id.clone(),
                };
                let step = Pairing {
                    first: &trial_id,
                    second: &benchmark_id,
                    kind: BenchmarkTrialParams::KIND,
                    params: params.to_value()?,
                };
                self.step(experiment, Link::Benchmarked, step, report, || {
                    let trial = match Artifact::load(store.as_ref(), &trial_id) {
                        Ok(Some(trial)) => trial,
                        Ok(None) => return Appropriate::Deferred(format!("trial result {} not found", trial_id)),
                        Err(e) => return Appropriate::Deferred(e.to_string()),
                    };
                    let benchmark = match self.collaborators.load_benchmark(store.as_ref(), &benchmark_id) {
                        Ok(benchmark) => benchmark,
                        Err(e) => return Appropriate::Deferred(e.to_string()),
                    };
                    if benchmark.is_trial_appropriate(&trial) {
                        Appropriate::Yes
                    } else {
                        Appropriate::No(format!("{} does not apply to {}", benchmark_id, trial_id))
                    }
                })?;
            }
        }
        Ok(())
    }

    /// Apply the policy to one pairing
    fn step(
        &self,
        experiment: &mut Experiment,
        link: Link,
        pairing: Pairing<'_>,
        report: &mut DriveReport,
        check: impl FnOnce() -> Appropriate,
    ) -> Result<()> {
        let Pairing {
            first,
            second,
            kind,
            params,
        } = pairing;
        let name = experiment.name.clone();
        let max_attempts = experiment.max_attempts;
        let resources = experiment.resources.for_kind(kind);
        let links = link.of(experiment);

        if links.is_settled(first, second) {
            return Ok(());
        }

        if let Some(task) = self.tasks.find_live_task(kind, &params)? {
            return follow_task(&name, links, first, second, &task, report);
        }

        let failed = self.tasks.failed_attempts(kind, &params)?;
        if let Some(incompatible) = failed.iter().find_map(|t| {
            t.failure()
                .filter(|f| f.category == FailureCategory::Incompatible)
                .map(|f| f.message.clone())
        }) {
            info!(experiment = %name, kind = %kind, first = %first, second = %second, reason = %incompatible, "Pairing is unsupported");
            if links.unsupported.insert(first, second, incompatible) {
                report.unsupported += 1;
            }
            return Ok(());
        }

        if failed.len() >= max_attempts as usize {
            let reason = format!("failed {} of {} attempts", failed.len(), max_attempts);
            warn!(experiment = %name, kind = %kind, first = %first, second = %second, reason = %reason, "Giving up on pairing");
            if links.exhausted.insert(first, second, reason) {
                report.exhausted += 1;
            }
            return Ok(());
        }

        match check() {
            Appropriate::Yes => {}
            Appropriate::No(reason) => {
                info!(experiment = %name, kind = %kind, first = %first, second = %second, reason = %reason, "Pairing is unsupported");
                if links.unsupported.insert(first, second, reason) {
                    report.unsupported += 1;
                }
                return Ok(());
            }
            Appropriate::Deferred(reason) => {
                warn!(experiment = %name, kind = %kind, first = %first, second = %second, reason = %reason, "Could not load collaborators, deferring pairing");
                report.deferred += 1;
                return Ok(());
            }
        }

        if !failed.is_empty() {
            info!(experiment = %name, kind = %kind, first = %first, second = %second, attempt = failed.len() + 1, "Retrying pairing");
        }
        let task = self.tasks.get_task(kind, params, resources)?;
        if task.is_unstarted() {
            report.created += 1;
            return Ok(());
        }
        follow_task(&name, links, first, second, &task, report)
    }
}

/// One pairing to drive
struct Pairing<'a> {
    first: &'a str,
    second: &'a str,
    kind: &'static str,
    params: Value,
}

/// Which link table a pairing belongs to
#[derive(Clone, Copy)]
enum Link {
    Imported,
    Trained,
    Trials,
    Benchmarked,
}

impl Link {
    fn of(self, experiment: &mut Experiment) -> &mut PairLinks {
        match self {
            Link::Imported => &mut experiment.imported,
            Link::Trained => &mut experiment.trained,
            Link::Trials => &mut experiment.trials,
            Link::Benchmarked => &mut experiment.benchmarked,
        }
    }
}

/// Link a DONE task or count it as waiting
fn follow_task(
    experiment: &str,
    links: &mut PairLinks,
    first: &str,
    second: &str,
    task: &Task,
    report: &mut DriveReport,
) -> Result<()> {
    match task.state() {
        TaskState::Done => {
            let result = task
                .result()
                .cloned()
                .ok_or_else(|| Error::InvalidResult { task_id: task.display_id() })?;
            if links.results.insert(first, second, result.clone()) {
                info!(experiment = %experiment, first = %first, second = %second, result = %result, "Linked result");
                report.linked += 1;
            }
        }
        TaskState::Unstarted | TaskState::Running => report.waiting += 1,
        TaskState::Failed => {}
    }
    Ok(())
}
