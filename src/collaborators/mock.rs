//! Configurable collaborators for testing and demonstration
//!
//! Every mock is built from a small serde config so the same behaviour can
//! be declared in an experiment file, stored as a collaborator definition
//! and rebuilt by a worker in another process.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{
    Artifact, ArtifactKind, Benchmark, CollaboratorError, CollaboratorRegistry, CollaboratorResult,
    DatasetLoader, Frame, ImageSource, SequenceType, Trainee, Trainer, VisionSystem,
};

/// Type name of the mock vision system
pub const MOCK_SYSTEM: &str = "mock_system";
/// Type name of the mock image source
pub const MOCK_IMAGE_SOURCE: &str = "mock_image_source";
pub const MOCK_TRAINER: &str = "mock_trainer";
pub const MOCK_TRAINEE: &str = "mock_trainee";
pub const MOCK_BENCHMARK: &str = "mock_benchmark";
pub const MOCK_LOADER: &str = "mock_loader";
const MOCK_TRIAL_RESULT: &str = "mock_trial_result";
const MOCK_BENCHMARK_RESULT: &str = "mock_benchmark_result";

fn decode<T: serde::de::DeserializeOwned + Default>(config: &Value) -> CollaboratorResult<T> {
    if config.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(config.clone()).map_err(|e| CollaboratorError::failed(format!("invalid config: {}", e)))
}

/// Register every mock type and the mock dataset loader
pub fn register_mock_types(registry: &mut CollaboratorRegistry) {
    registry.register_system_type(MOCK_SYSTEM, |config| {
        Ok(Box::new(MockSystem::new(decode(config)?)) as Box<dyn VisionSystem>)
    });
    registry.register_image_source_type(MOCK_IMAGE_SOURCE, |config| {
        Ok(Box::new(MockImageSource::new(decode(config)?)) as Box<dyn ImageSource>)
    });
    registry.register_trainer_type(MOCK_TRAINER, |config| {
        Ok(Box::new(MockTrainer::new(decode(config)?)) as Box<dyn Trainer>)
    });
    registry.register_trainee_type(MOCK_TRAINEE, |config| {
        let name = config
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or(MOCK_TRAINEE)
            .to_string();
        Ok(Box::new(MockTrainee::new(name)) as Box<dyn Trainee>)
    });
    registry.register_benchmark_type(MOCK_BENCHMARK, |config| {
        Ok(Box::new(MockBenchmark::new(decode(config)?)) as Box<dyn Benchmark>)
    });
    registry.register_loader(MOCK_LOADER, MockDatasetLoader);
}

// ─────────────────────────────────────────────────────────────────
// Vision System
// ─────────────────────────────────────────────────────────────────

/// Behaviour switches for [`MockSystem`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MockSystemConfig {
    /// Only accept sequential image sources
    pub requires_sequential: bool,
    /// Return an error from `finish_trial`
    pub fail: bool,
    /// Report incompatibility from `start_trial`
    pub incompatible: bool,
    /// Panic while processing images
    pub panic: bool,
    /// Finish without a trial result
    pub no_result: bool,
    /// Label copied into produced trial results
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

pub struct MockSystem {
    config: MockSystemConfig,
    in_trial: bool,
    frames_processed: u64,
}

impl MockSystem {
    pub fn new(config: MockSystemConfig) -> Self {
        Self {
            config,
            in_trial: false,
            frames_processed: 0,
        }
    }
}

impl VisionSystem for MockSystem {
    fn is_image_source_appropriate(&self, source: &dyn ImageSource) -> bool {
        !self.config.requires_sequential || source.sequence_type() == SequenceType::Sequential
    }

    fn start_trial(&mut self, sequence_type: SequenceType) -> CollaboratorResult<()> {
        if self.config.incompatible {
            return Err(CollaboratorError::Incompatible(format!(
                "cannot process {:?} sources",
                sequence_type
            )));
        }
        self.in_trial = true;
        self.frames_processed = 0;
        Ok(())
    }

    fn process_image(&mut self, _frame: &Frame) -> CollaboratorResult<()> {
        if !self.in_trial {
            return Err(CollaboratorError::failed("process_image called outside a trial"));
        }
        if self.config.panic {
            panic!("mock system crashed while processing an image");
        }
        self.frames_processed += 1;
        Ok(())
    }

    fn finish_trial(&mut self) -> CollaboratorResult<Option<Artifact>> {
        self.in_trial = false;
        if self.config.fail {
            return Err(CollaboratorError::failed("mock system failed to finish trial"));
        }
        if self.config.no_result {
            return Ok(None);
        }
        Ok(Some(Artifact::new(
            ArtifactKind::TrialResult,
            MOCK_TRIAL_RESULT,
            json!({
                "frames_processed": self.frames_processed,
                "label": self.config.label,
            }),
        )))
    }
}

// ─────────────────────────────────────────────────────────────────
// Image Source
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MockImageSourceConfig {
    pub frames: u32,
    pub sequential: bool,
}

impl Default for MockImageSourceConfig {
    fn default() -> Self {
        Self {
            frames: 10,
            sequential: true,
        }
    }
}

pub struct MockImageSource {
    config: MockImageSourceConfig,
}

impl MockImageSource {
    pub fn new(config: MockImageSourceConfig) -> Self {
        Self { config }
    }
}

impl ImageSource for MockImageSource {
    fn sequence_type(&self) -> SequenceType {
        if self.config.sequential {
            SequenceType::Sequential
        } else {
            SequenceType::NonSequential
        }
    }

    fn frames(&self) -> Box<dyn Iterator<Item = Frame> + '_> {
        Box::new((0..self.config.frames).map(|i| Frame {
            timestamp: f64::from(i) / 30.0,
            image: json!({"index": i}),
        }))
    }
}

// ─────────────────────────────────────────────────────────────────
// Trainer & Trainee
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MockTrainerConfig {
    /// Trainee names this trainer accepts (empty = all)
    pub accepts: Vec<String>,
    pub fail: bool,
}

pub struct MockTrainer {
    config: MockTrainerConfig,
}

impl MockTrainer {
    pub fn new(config: MockTrainerConfig) -> Self {
        Self { config }
    }
}

impl Trainer for MockTrainer {
    fn can_train_trainee(&self, trainee: &dyn Trainee) -> bool {
        self.config.accepts.is_empty() || self.config.accepts.iter().any(|n| n == trainee.name())
    }

    fn train_vision_system(&mut self, trainee: &dyn Trainee) -> CollaboratorResult<Option<Artifact>> {
        if self.config.fail {
            return Err(CollaboratorError::failed(format!("training {} diverged", trainee.name())));
        }
        // Trained systems rehydrate as mock systems
        let trained = MockSystemConfig {
            label: Some(format!("trained-{}", trainee.name())),
            ..Default::default()
        };
        let payload = serde_json::to_value(trained).map_err(|e| CollaboratorError::failed(e.to_string()))?;
        Ok(Some(Artifact::new(ArtifactKind::TrainedSystem, MOCK_SYSTEM, payload)))
    }
}

pub struct MockTrainee {
    name: String,
}

impl MockTrainee {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Trainee for MockTrainee {
    fn name(&self) -> &str {
        &self.name
    }
}

// ─────────────────────────────────────────────────────────────────
// Benchmark
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MockBenchmarkConfig {
    /// Trials with fewer processed frames are inappropriate
    pub min_frames: u64,
    pub fail: bool,
}

pub struct MockBenchmark {
    config: MockBenchmarkConfig,
}

impl MockBenchmark {
    pub fn new(config: MockBenchmarkConfig) -> Self {
        Self { config }
    }
}

impl Benchmark for MockBenchmark {
    fn get_trial_requirements(&self) -> BTreeMap<String, Value> {
        BTreeMap::from([("min_frames".to_string(), json!(self.config.min_frames))])
    }

    fn is_trial_appropriate(&self, trial: &Artifact) -> bool {
        trial.kind == ArtifactKind::TrialResult
            && trial
                .payload
                .get("frames_processed")
                .and_then(Value::as_u64)
                .map_or(false, |n| n >= self.config.min_frames)
    }

    fn benchmark_results(&self, trial: &Artifact) -> CollaboratorResult<Option<Artifact>> {
        if self.config.fail {
            return Err(CollaboratorError::failed("mock benchmark failed"));
        }
        let frames = trial.payload.get("frames_processed").and_then(Value::as_u64).unwrap_or(0);
        Ok(Some(Artifact::new(
            ArtifactKind::BenchmarkResult,
            MOCK_BENCHMARK_RESULT,
            json!({"score": frames as f64 / 10.0}),
        )))
    }
}

// ─────────────────────────────────────────────────────────────────
// Dataset Loader
// ─────────────────────────────────────────────────────────────────

/// Imports any path as a synthetic image source. Options `frames` and
/// `sequential` shape the dataset; option `fail` makes the import error.
#[derive(Debug, Clone, Copy, Default)]
pub struct MockDatasetLoader;

impl DatasetLoader for MockDatasetLoader {
    fn import_dataset(&self, path: &str, options: &BTreeMap<String, Value>) -> CollaboratorResult<Option<Artifact>> {
        if path.trim().is_empty() {
            return Err(CollaboratorError::failed("dataset path is empty"));
        }
        if options.get("fail").and_then(Value::as_bool).unwrap_or(false) {
            return Err(CollaboratorError::failed(format!("cannot read dataset at {}", path)));
        }

        let defaults = MockImageSourceConfig::default();
        let source = MockImageSourceConfig {
            frames: options
                .get("frames")
                .and_then(Value::as_u64)
                .map_or(defaults.frames, |n| n as u32),
            sequential: options
                .get("sequential")
                .and_then(Value::as_bool)
                .unwrap_or(defaults.sequential),
        };
        let mut payload = serde_json::to_value(source).map_err(|e| CollaboratorError::failed(e.to_string()))?;
        payload["path"] = json!(path);
        Ok(Some(Artifact::new(ArtifactKind::Dataset, MOCK_IMAGE_SOURCE, payload)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_appropriateness() {
        let picky = MockSystem::new(MockSystemConfig {
            requires_sequential: true,
            ..Default::default()
        });
        let still_images = MockImageSource::new(MockImageSourceConfig {
            frames: 3,
            sequential: false,
        });
        let video = MockImageSource::new(MockImageSourceConfig::default());

        assert!(!picky.is_image_source_appropriate(&still_images));
        assert!(picky.is_image_source_appropriate(&video));
    }

    #[test]
    fn test_trainer_produces_rehydratable_system() {
        let mut trainer = MockTrainer::new(MockTrainerConfig {
            accepts: vec!["resnet".into()],
            fail: false,
        });
        assert!(!trainer.can_train_trainee(&MockTrainee::new("vgg")));

        let trainee = MockTrainee::new("resnet");
        let artifact = trainer.train_vision_system(&trainee).unwrap().unwrap();
        assert_eq!(artifact.kind, ArtifactKind::TrainedSystem);
        assert_eq!(artifact.type_name, MOCK_SYSTEM);

        let config: MockSystemConfig = serde_json::from_value(artifact.payload).unwrap();
        assert_eq!(config.label.as_deref(), Some("trained-resnet"));
    }

    #[test]
    fn test_benchmark_checks_trial() {
        let bench = MockBenchmark::new(MockBenchmarkConfig {
            min_frames: 5,
            fail: false,
        });
        let short = Artifact::new(ArtifactKind::TrialResult, MOCK_TRIAL_RESULT, json!({"frames_processed": 2}));
        let long = Artifact::new(ArtifactKind::TrialResult, MOCK_TRIAL_RESULT, json!({"frames_processed": 20}));

        assert!(!bench.is_trial_appropriate(&short));
        assert!(bench.is_trial_appropriate(&long));
        let result = bench.benchmark_results(&long).unwrap().unwrap();
        assert_eq!(result.payload["score"], json!(2.0));
        assert_eq!(bench.get_trial_requirements()["min_frames"], json!(5));
    }

    #[test]
    fn test_loader_options() {
        let mut options = BTreeMap::new();
        options.insert("frames".to_string(), json!(3));
        options.insert("sequential".to_string(), json!(false));

        let artifact = MockDatasetLoader.import_dataset("/data/kitti", &options).unwrap().unwrap();
        assert_eq!(artifact.kind, ArtifactKind::Dataset);
        assert_eq!(artifact.payload["frames"], json!(3));
        assert_eq!(artifact.payload["path"], json!("/data/kitti"));

        assert!(MockDatasetLoader.import_dataset("", &BTreeMap::new()).is_err());
    }
}
