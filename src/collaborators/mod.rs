//! Collaborator capabilities
//!
//! Vision systems, image sources, trainers, trainees, benchmarks and dataset
//! loaders are external to the scheduling layer. Tasks only see them through
//! the traits below and load them through a [`CollaboratorRegistry`].
//!
//! Collaborator calls return `Ok(None)` when they finish without a result
//! and `Err` when they fail; neither is allowed to escape a task run.

mod mock;
mod registry;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::store::{Collection, DocumentStore};
use crate::types::ArtifactId;

pub use mock::{
    register_mock_types, MockBenchmark, MockBenchmarkConfig, MockDatasetLoader, MockImageSource,
    MockImageSourceConfig, MockSystem, MockSystemConfig, MockTrainee, MockTrainer, MockTrainerConfig,
    MOCK_BENCHMARK, MOCK_IMAGE_SOURCE, MOCK_LOADER, MOCK_SYSTEM, MOCK_TRAINEE, MOCK_TRAINER,
};
pub use registry::CollaboratorRegistry;

// ─────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────

/// Failure reported by a collaborator
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollaboratorError {
    /// The collaborator cannot work with the inputs it was given
    #[error("incompatible inputs: {0}")]
    Incompatible(String),

    /// The collaborator tried and failed
    #[error("{0}")]
    Failed(String),
}

impl CollaboratorError {
    pub fn failed(message: impl Into<String>) -> Self {
        CollaboratorError::Failed(message.into())
    }
}

/// Result of a collaborator call
pub type CollaboratorResult<T> = std::result::Result<T, CollaboratorError>;

// ─────────────────────────────────────────────────────────────────
// Artifacts
// ─────────────────────────────────────────────────────────────────

/// What an artifact holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Imported dataset, loadable as an image source
    Dataset,
    /// Output of running a system over an image source
    TrialResult,
    /// Output of training, loadable as a vision system
    TrainedSystem,
    /// Output of benchmarking a trial result
    BenchmarkResult,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Dataset => "dataset",
            ArtifactKind::TrialResult => "trial_result",
            ArtifactKind::TrainedSystem => "trained_system",
            ArtifactKind::BenchmarkResult => "benchmark_result",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A result document produced by a collaborator. `type_name` selects the
/// factory that can rehydrate it; `payload` is opaque to this layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub kind: ArtifactKind,
    pub type_name: String,
    #[serde(default)]
    pub payload: Value,
}

impl Artifact {
    pub fn new(kind: ArtifactKind, type_name: impl Into<String>, payload: Value) -> Self {
        Self {
            kind,
            type_name: type_name.into(),
            payload,
        }
    }

    /// Persist and return the new reference
    pub fn save(&self, store: &dyn DocumentStore) -> Result<ArtifactId> {
        let id = store.insert(Collection::Artifacts, serde_json::to_value(self)?)?;
        Ok(ArtifactId::new(id))
    }

    pub fn load(store: &dyn DocumentStore, id: &str) -> Result<Option<Artifact>> {
        store
            .get(Collection::Artifacts, id)?
            .map(|doc| serde_json::from_value(doc.body).map_err(Error::from))
            .transpose()
    }
}

// ─────────────────────────────────────────────────────────────────
// Collaborator Definitions
// ─────────────────────────────────────────────────────────────────

/// Which capability a definition provides
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    ImageSource,
    Trainer,
    Trainee,
    Benchmark,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::ImageSource => "image_source",
            Role::Trainer => "trainer",
            Role::Trainee => "trainee",
            Role::Benchmark => "benchmark",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted recipe for building a collaborator: a registered type name
/// plus its configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollaboratorSpec {
    pub role: Role,
    pub type_name: String,
    #[serde(default)]
    pub config: Value,
}

impl CollaboratorSpec {
    pub fn new(role: Role, type_name: impl Into<String>, config: Value) -> Self {
        Self {
            role,
            type_name: type_name.into(),
            config,
        }
    }

    /// Store under a caller-chosen id
    pub fn save(&self, store: &dyn DocumentStore, id: &str) -> Result<()> {
        store.put(Collection::Collaborators, id, serde_json::to_value(self)?)
    }

    pub fn load(store: &dyn DocumentStore, id: &str) -> Result<Option<CollaboratorSpec>> {
        store
            .get(Collection::Collaborators, id)?
            .map(|doc| serde_json::from_value(doc.body).map_err(Error::from))
            .transpose()
    }
}

// ─────────────────────────────────────────────────────────────────
// Capability Traits
// ─────────────────────────────────────────────────────────────────

/// Whether frames form a continuous sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceType {
    Sequential,
    NonSequential,
}

/// One image from a source. The image itself is opaque here.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub timestamp: f64,
    pub image: Value,
}

pub trait ImageSource: Send {
    fn sequence_type(&self) -> SequenceType;

    fn frames(&self) -> Box<dyn Iterator<Item = Frame> + '_>;
}

pub trait VisionSystem: Send {
    fn is_image_source_appropriate(&self, source: &dyn ImageSource) -> bool;

    fn start_trial(&mut self, sequence_type: SequenceType) -> CollaboratorResult<()>;

    fn process_image(&mut self, frame: &Frame) -> CollaboratorResult<()>;

    /// Close the trial, producing a trial result artifact
    fn finish_trial(&mut self) -> CollaboratorResult<Option<Artifact>>;
}

pub trait Trainee: Send {
    fn name(&self) -> &str;
}

pub trait Trainer: Send {
    fn can_train_trainee(&self, trainee: &dyn Trainee) -> bool;

    /// Produce a trained system artifact
    fn train_vision_system(&mut self, trainee: &dyn Trainee) -> CollaboratorResult<Option<Artifact>>;
}

pub trait Benchmark: Send {
    /// Constraints a trial must satisfy, for display
    fn get_trial_requirements(&self) -> BTreeMap<String, Value>;

    fn is_trial_appropriate(&self, trial: &Artifact) -> bool;

    /// Produce a benchmark result artifact
    fn benchmark_results(&self, trial: &Artifact) -> CollaboratorResult<Option<Artifact>>;
}

pub trait DatasetLoader: Send + Sync {
    /// Produce a dataset artifact that rehydrates as an image source
    fn import_dataset(&self, path: &str, options: &BTreeMap<String, Value>) -> CollaboratorResult<Option<Artifact>>;
}

/// Drive a system through one trial over every frame of a source
pub fn run_system_with_source(
    system: &mut dyn VisionSystem,
    source: &dyn ImageSource,
) -> CollaboratorResult<Option<Artifact>> {
    system.start_trial(source.sequence_type())?;
    for frame in source.frames() {
        system.process_image(&frame)?;
    }
    system.finish_trial()
}
