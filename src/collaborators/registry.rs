//! Collaborator Registry
//!
//! Maps type names to factories, populated once at process start. A
//! collaborator id resolves to a stored definition (type name + config) or,
//! for systems and image sources, to an artifact produced by training or
//! importing; either way the registered factory for its type name builds
//! the live object.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::store::DocumentStore;

use super::{
    register_mock_types, Artifact, ArtifactKind, Benchmark, CollaboratorResult, CollaboratorSpec,
    DatasetLoader, ImageSource, Role, Trainee, Trainer, VisionSystem,
};

type Factory<T> = Arc<dyn Fn(&Value) -> CollaboratorResult<Box<T>> + Send + Sync>;

/// Factories for every collaborator type this process can build
#[derive(Default, Clone)]
pub struct CollaboratorRegistry {
    systems: HashMap<String, Factory<dyn VisionSystem>>,
    image_sources: HashMap<String, Factory<dyn ImageSource>>,
    trainers: HashMap<String, Factory<dyn Trainer>>,
    trainees: HashMap<String, Factory<dyn Trainee>>,
    benchmarks: HashMap<String, Factory<dyn Benchmark>>,
    loaders: HashMap<String, Arc<dyn DatasetLoader>>,
}

impl CollaboratorRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in types
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        register_mock_types(&mut registry);
        registry
    }

    // ─────────────────────────────────────────────────────────────
    // Registration
    // ─────────────────────────────────────────────────────────────

    pub fn register_system_type<F>(&mut self, type_name: &str, factory: F)
    where
        F: Fn(&Value) -> CollaboratorResult<Box<dyn VisionSystem>> + Send + Sync + 'static,
    {
        self.systems.insert(type_name.to_string(), Arc::new(factory));
    }

    pub fn register_image_source_type<F>(&mut self, type_name: &str, factory: F)
    where
        F: Fn(&Value) -> CollaboratorResult<Box<dyn ImageSource>> + Send + Sync + 'static,
    {
        self.image_sources.insert(type_name.to_string(), Arc::new(factory));
    }

    pub fn register_trainer_type<F>(&mut self, type_name: &str, factory: F)
    where
        F: Fn(&Value) -> CollaboratorResult<Box<dyn Trainer>> + Send + Sync + 'static,
    {
        self.trainers.insert(type_name.to_string(), Arc::new(factory));
    }

    pub fn register_trainee_type<F>(&mut self, type_name: &str, factory: F)
    where
        F: Fn(&Value) -> CollaboratorResult<Box<dyn Trainee>> + Send + Sync + 'static,
    {
        self.trainees.insert(type_name.to_string(), Arc::new(factory));
    }

    pub fn register_benchmark_type<F>(&mut self, type_name: &str, factory: F)
    where
        F: Fn(&Value) -> CollaboratorResult<Box<dyn Benchmark>> + Send + Sync + 'static,
    {
        self.benchmarks.insert(type_name.to_string(), Arc::new(factory));
    }

    pub fn register_loader(&mut self, name: &str, loader: impl DatasetLoader + 'static) {
        self.loaders.insert(name.to_string(), Arc::new(loader));
    }

    /// Whether a type name is known for a role
    pub fn has_type(&self, role: Role, type_name: &str) -> bool {
        match role {
            Role::System => self.systems.contains_key(type_name),
            Role::ImageSource => self.image_sources.contains_key(type_name),
            Role::Trainer => self.trainers.contains_key(type_name),
            Role::Trainee => self.trainees.contains_key(type_name),
            Role::Benchmark => self.benchmarks.contains_key(type_name),
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Loading
    // ─────────────────────────────────────────────────────────────

    /// Load a vision system by definition id or trained-system artifact id
    pub fn load_system(&self, store: &dyn DocumentStore, id: &str) -> Result<Box<dyn VisionSystem>> {
        let (type_name, config) = resolve(store, id, Role::System, Some(ArtifactKind::TrainedSystem))?;
        build(&self.systems, &type_name, &config, id)
    }

    /// Load an image source by definition id or dataset artifact id
    pub fn load_image_source(&self, store: &dyn DocumentStore, id: &str) -> Result<Box<dyn ImageSource>> {
        let (type_name, config) = resolve(store, id, Role::ImageSource, Some(ArtifactKind::Dataset))?;
        build(&self.image_sources, &type_name, &config, id)
    }

    pub fn load_trainer(&self, store: &dyn DocumentStore, id: &str) -> Result<Box<dyn Trainer>> {
        let (type_name, config) = resolve(store, id, Role::Trainer, None)?;
        build(&self.trainers, &type_name, &config, id)
    }

    pub fn load_trainee(&self, store: &dyn DocumentStore, id: &str) -> Result<Box<dyn Trainee>> {
        let (type_name, config) = resolve(store, id, Role::Trainee, None)?;
        build(&self.trainees, &type_name, &config, id)
    }

    pub fn load_benchmark(&self, store: &dyn DocumentStore, id: &str) -> Result<Box<dyn Benchmark>> {
        let (type_name, config) = resolve(store, id, Role::Benchmark, None)?;
        build(&self.benchmarks, &type_name, &config, id)
    }

    /// Dataset loader registered under `name`
    pub fn loader(&self, name: &str) -> Result<Arc<dyn DatasetLoader>> {
        self.loaders
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownKind(name.to_string()))
    }
}

impl std::fmt::Debug for CollaboratorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollaboratorRegistry")
            .field("systems", &self.systems.keys().collect::<Vec<_>>())
            .field("image_sources", &self.image_sources.keys().collect::<Vec<_>>())
            .field("trainers", &self.trainers.keys().collect::<Vec<_>>())
            .field("trainees", &self.trainees.keys().collect::<Vec<_>>())
            .field("benchmarks", &self.benchmarks.keys().collect::<Vec<_>>())
            .field("loaders", &self.loaders.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Find the type name and config behind an id
fn resolve(
    store: &dyn DocumentStore,
    id: &str,
    role: Role,
    artifact_kind: Option<ArtifactKind>,
) -> Result<(String, Value)> {
    if let Some(spec) = CollaboratorSpec::load(store, id)? {
        if spec.role != role {
            return Err(Error::InvalidParameters {
                kind: role.to_string(),
                message: format!("{} is defined as a {}", id, spec.role),
            });
        }
        return Ok((spec.type_name, spec.config));
    }

    if let Some(kind) = artifact_kind {
        if let Some(artifact) = Artifact::load(store, id)? {
            if artifact.kind != kind {
                return Err(Error::InvalidParameters {
                    kind: role.to_string(),
                    message: format!("artifact {} is a {}, expected {}", id, artifact.kind, kind),
                });
            }
            debug!(id = %id, type_name = %artifact.type_name, "Rehydrating artifact");
            return Ok((artifact.type_name, artifact.payload));
        }
    }

    Err(Error::not_found(role.as_str(), id))
}

fn build<T: ?Sized>(factories: &HashMap<String, Factory<T>>, type_name: &str, config: &Value, id: &str) -> Result<Box<T>> {
    let factory = factories
        .get(type_name)
        .ok_or_else(|| Error::UnknownKind(type_name.to_string()))?;
    factory(config).map_err(|e| Error::Execution(format!("cannot build {} ({}): {}", id, type_name, e)))
}
