//! Built-in kind handlers
//!
//! Each handler loads its collaborators, re-checks appropriateness, calls
//! the collaborator and stores the artifact it returns. Load errors,
//! incompatibility, collaborator errors and missing results map to distinct
//! failure categories.

use tracing::{error, info, warn};

use crate::collaborators::{run_system_with_source, Artifact, CollaboratorError, CollaboratorResult};
use crate::error::Error;
use crate::task::{
    BenchmarkTrialParams, FailureCategory, ImportDatasetParams, RunSystemParams, Task, TaskParameters,
    TrainSystemParams, BENCHMARK_TRIAL, IMPORT_DATASET, RUN_SYSTEM, TRAIN_SYSTEM,
};

use super::registry::{KindHandler, RunContext, RunOutcome};

/// Decode parameters or bail out with a load failure
macro_rules! params_or_fail {
    ($task:expr, $ty:ty) => {
        match $task.params::<$ty>() {
            Ok(params) => params,
            Err(e) => return load_failure($task, "parameters", e),
        }
    };
}

/// Load a collaborator or bail out with a load failure
macro_rules! load_or_fail {
    ($task:expr, $what:expr, $load:expr) => {
        match $load {
            Ok(value) => value,
            Err(e) => return load_failure($task, $what, e),
        }
    };
}

fn load_failure(task: &Task, what: &str, e: Error) -> RunOutcome {
    error!(task_id = %task.display_id(), kind = %task.kind(), what = %what, error = %e, "Failed to load collaborator");
    RunOutcome::failed(FailureCategory::LoadFailure, format!("could not load {}: {}", what, e))
}

fn incompatible(task: &Task, message: String) -> RunOutcome {
    warn!(task_id = %task.display_id(), kind = %task.kind(), reason = %message, "Collaborators are incompatible");
    RunOutcome::failed(FailureCategory::Incompatible, message)
}

/// Store the artifact a collaborator produced, or classify why there is none
fn finish(task: &Task, ctx: &RunContext<'_>, result: CollaboratorResult<Option<Artifact>>) -> RunOutcome {
    match result {
        Ok(Some(artifact)) => match artifact.save(ctx.store) {
            Ok(id) => {
                info!(task_id = %task.display_id(), artifact_id = %id, artifact_kind = %artifact.kind, "Stored result");
                RunOutcome::Complete(id)
            }
            Err(e) => {
                error!(task_id = %task.display_id(), error = %e, "Failed to store result");
                RunOutcome::failed(FailureCategory::CollaboratorError, format!("could not store result: {}", e))
            }
        },
        Ok(None) => {
            warn!(task_id = %task.display_id(), kind = %task.kind(), "Collaborator produced no result");
            RunOutcome::failed(FailureCategory::NoResult, "finished without a result")
        }
        Err(CollaboratorError::Incompatible(message)) => incompatible(task, message),
        Err(CollaboratorError::Failed(message)) => {
            error!(task_id = %task.display_id(), kind = %task.kind(), error = %message, "Collaborator failed");
            RunOutcome::failed(FailureCategory::CollaboratorError, message)
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Import Dataset
// ─────────────────────────────────────────────────────────────────

pub struct ImportDatasetHandler;

impl KindHandler for ImportDatasetHandler {
    fn kind(&self) -> &'static str {
        IMPORT_DATASET
    }

    fn run(&self, task: &Task, ctx: &RunContext<'_>) -> RunOutcome {
        let params = params_or_fail!(task, ImportDatasetParams);
        let loader = load_or_fail!(task, "dataset loader", ctx.collaborators.loader(&params.loader));

        finish(task, ctx, loader.import_dataset(&params.path, &params.options))
    }
}

// ─────────────────────────────────────────────────────────────────
// Run System
// ─────────────────────────────────────────────────────────────────

pub struct RunSystemHandler;

impl KindHandler for RunSystemHandler {
    fn kind(&self) -> &'static str {
        RUN_SYSTEM
    }

    fn run(&self, task: &Task, ctx: &RunContext<'_>) -> RunOutcome {
        let params = params_or_fail!(task, RunSystemParams);
        let mut system = load_or_fail!(
            task,
            "system",
            ctx.collaborators.load_system(ctx.store, &params.system_id)
        );
        let source = load_or_fail!(
            task,
            "image source",
            ctx.collaborators.load_image_source(ctx.store, &params.image_source_id)
        );

        if !system.is_image_source_appropriate(source.as_ref()) {
            return incompatible(
                task,
                format!("{} cannot run on {}", params.system_id, params.image_source_id),
            );
        }

        finish(task, ctx, run_system_with_source(system.as_mut(), source.as_ref()))
    }
}

// ─────────────────────────────────────────────────────────────────
// Train System
// ─────────────────────────────────────────────────────────────────

pub struct TrainSystemHandler;

impl KindHandler for TrainSystemHandler {
    fn kind(&self) -> &'static str {
        TRAIN_SYSTEM
    }

    fn run(&self, task: &Task, ctx: &RunContext<'_>) -> RunOutcome {
        let params = params_or_fail!(task, TrainSystemParams);
        let mut trainer = load_or_fail!(
            task,
            "trainer",
            ctx.collaborators.load_trainer(ctx.store, &params.trainer_id)
        );
        let trainee = load_or_fail!(
            task,
            "trainee",
            ctx.collaborators.load_trainee(ctx.store, &params.trainee_id)
        );

        if !trainer.can_train_trainee(trainee.as_ref()) {
            return incompatible(
                task,
                format!("{} cannot train {}", params.trainer_id, params.trainee_id),
            );
        }

        finish(task, ctx, trainer.train_vision_system(trainee.as_ref()))
    }
}

// ─────────────────────────────────────────────────────────────────
// Benchmark Trial
// ─────────────────────────────────────────────────────────────────

pub struct BenchmarkTrialHandler;

impl KindHandler for BenchmarkTrialHandler {
    fn kind(&self) -> &'static str {
        BENCHMARK_TRIAL
    }

    fn run(&self, task: &Task, ctx: &RunContext<'_>) -> RunOutcome {
        let params = params_or_fail!(task, BenchmarkTrialParams);
        let trial = match Artifact::load(ctx.store, &params.trial_result_id) {
            Ok(Some(trial)) => trial,
            Ok(None) => {
                return load_failure(
                    task,
                    "trial result",
                    Error::not_found("artifacts", params.trial_result_id.as_str()),
                )
            }
            Err(e) => return load_failure(task, "trial result", e),
        };
        let benchmark = load_or_fail!(
            task,
            "benchmark",
            ctx.collaborators.load_benchmark(ctx.store, &params.benchmark_id)
        );

        if !benchmark.is_trial_appropriate(&trial) {
            return incompatible(
                task,
                format!("{} does not apply to {}", params.benchmark_id, params.trial_result_id),
            );
        }

        finish(task, ctx, benchmark.benchmark_results(&trial))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{ArtifactKind, CollaboratorRegistry, CollaboratorSpec, Role};
    use crate::store::MemoryStore;
    use crate::task::ResourceRequirements;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn task_for<P: TaskParameters>(params: &P) -> Task {
        Task::from_params(params, ResourceRequirements::default()).unwrap()
    }

    fn define(store: &MemoryStore, id: &str, role: Role, type_name: &str, config: serde_json::Value) {
        CollaboratorSpec::new(role, type_name, config).save(store, id).unwrap();
    }

    fn category(outcome: RunOutcome) -> FailureCategory {
        match outcome {
            RunOutcome::Failed { category, .. } => category,
            RunOutcome::Complete(id) => panic!("expected failure, got result {}", id),
        }
    }

    fn run_params(system: &str, source: &str) -> RunSystemParams {
        RunSystemParams {
            system_id: system.to_string(),
            image_source_id: source.to_string(),
        }
    }

    #[test]
    fn test_run_system_stores_trial_result() {
        let store = MemoryStore::new();
        let collaborators = CollaboratorRegistry::with_builtins();
        define(&store, "sys", Role::System, "mock_system", json!({}));
        define(&store, "src", Role::ImageSource, "mock_image_source", json!({"frames": 3}));
        let ctx = RunContext {
            store: &store,
            collaborators: &collaborators,
        };

        let outcome = RunSystemHandler.run(&task_for(&run_params("sys", "src")), &ctx);
        let RunOutcome::Complete(id) = outcome else {
            panic!("expected a result, got {:?}", outcome);
        };
        let trial = Artifact::load(&store, id.as_str()).unwrap().unwrap();
        assert_eq!(trial.kind, ArtifactKind::TrialResult);
        assert_eq!(trial.payload["frames_processed"], json!(3));
    }

    #[test]
    fn test_run_system_failure_categories() {
        let store = MemoryStore::new();
        let collaborators = CollaboratorRegistry::with_builtins();
        define(&store, "src", Role::ImageSource, "mock_image_source", json!({"sequential": false}));
        define(&store, "picky", Role::System, "mock_system", json!({"requires_sequential": true}));
        define(&store, "refuses", Role::System, "mock_system", json!({"incompatible": true}));
        define(&store, "broken", Role::System, "mock_system", json!({"fail": true}));
        define(&store, "empty", Role::System, "mock_system", json!({"no_result": true}));
        define(&store, "alien", Role::System, "alien_system", json!({}));
        let ctx = RunContext {
            store: &store,
            collaborators: &collaborators,
        };
        let run = |system: &str| category(RunSystemHandler.run(&task_for(&run_params(system, "src")), &ctx));

        assert_eq!(run("picky"), FailureCategory::Incompatible);
        assert_eq!(run("refuses"), FailureCategory::Incompatible);
        assert_eq!(run("broken"), FailureCategory::CollaboratorError);
        assert_eq!(run("empty"), FailureCategory::NoResult);
        assert_eq!(run("alien"), FailureCategory::LoadFailure);
        assert_eq!(run("missing"), FailureCategory::LoadFailure);
    }

    #[test]
    fn test_import_then_run_on_dataset() {
        let store = MemoryStore::new();
        let collaborators = CollaboratorRegistry::with_builtins();
        define(&store, "sys", Role::System, "mock_system", json!({}));
        let ctx = RunContext {
            store: &store,
            collaborators: &collaborators,
        };

        let import = ImportDatasetParams {
            loader: "mock_loader".to_string(),
            path: "/data/kitti".to_string(),
            options: BTreeMap::from([("frames".to_string(), json!(5))]),
        };
        let RunOutcome::Complete(dataset) = ImportDatasetHandler.run(&task_for(&import), &ctx) else {
            panic!("import failed");
        };

        let outcome = RunSystemHandler.run(&task_for(&run_params("sys", dataset.as_str())), &ctx);
        let RunOutcome::Complete(trial) = outcome else {
            panic!("run failed: {:?}", outcome);
        };
        let trial = Artifact::load(&store, trial.as_str()).unwrap().unwrap();
        assert_eq!(trial.payload["frames_processed"], json!(5));
    }

    #[test]
    fn test_import_with_unknown_loader() {
        let store = MemoryStore::new();
        let collaborators = CollaboratorRegistry::with_builtins();
        let ctx = RunContext {
            store: &store,
            collaborators: &collaborators,
        };
        let import = ImportDatasetParams {
            loader: "nope".to_string(),
            path: "/data".to_string(),
            options: BTreeMap::new(),
        };

        assert_eq!(category(ImportDatasetHandler.run(&task_for(&import), &ctx)), FailureCategory::LoadFailure);
    }

    #[test]
    fn test_train_system_checks_trainee() {
        let store = MemoryStore::new();
        let collaborators = CollaboratorRegistry::with_builtins();
        define(&store, "trainer", Role::Trainer, "mock_trainer", json!({"accepts": ["net-a"]}));
        define(&store, "net-a", Role::Trainee, "mock_trainee", json!({"name": "net-a"}));
        define(&store, "net-b", Role::Trainee, "mock_trainee", json!({"name": "net-b"}));
        let ctx = RunContext {
            store: &store,
            collaborators: &collaborators,
        };
        let params = |trainee: &str| TrainSystemParams {
            trainer_id: "trainer".to_string(),
            trainee_id: trainee.to_string(),
        };

        let RunOutcome::Complete(trained) = TrainSystemHandler.run(&task_for(&params("net-a")), &ctx) else {
            panic!("training failed");
        };
        assert!(collaborators.load_system(&store, trained.as_str()).is_ok());
        assert_eq!(
            category(TrainSystemHandler.run(&task_for(&params("net-b")), &ctx)),
            FailureCategory::Incompatible
        );
    }

    #[test]
    fn test_benchmark_trial() {
        let store = MemoryStore::new();
        let collaborators = CollaboratorRegistry::with_builtins();
        define(&store, "lenient", Role::Benchmark, "mock_benchmark", json!({"min_frames": 1}));
        define(&store, "strict", Role::Benchmark, "mock_benchmark", json!({"min_frames": 100}));
        let trial = Artifact::new(ArtifactKind::TrialResult, "mock_trial_result", json!({"frames_processed": 10}))
            .save(&store)
            .unwrap();
        let ctx = RunContext {
            store: &store,
            collaborators: &collaborators,
        };
        let params = |benchmark: &str, trial: &str| BenchmarkTrialParams {
            trial_result_id: trial.to_string(),
            benchmark_id: benchmark.to_string(),
        };

        let outcome = BenchmarkTrialHandler.run(&task_for(&params("lenient", trial.as_str())), &ctx);
        assert!(matches!(outcome, RunOutcome::Complete(_)));
        assert_eq!(
            category(BenchmarkTrialHandler.run(&task_for(&params("strict", trial.as_str())), &ctx)),
            FailureCategory::Incompatible
        );
        assert_eq!(
            category(BenchmarkTrialHandler.run(&task_for(&params("lenient", "gone")), &ctx)),
            FailureCategory::LoadFailure
        );
    }
}
