//! Experiments
//!
//! An experiment names the collaborators to combine and remembers what came
//! of each combination: results, pairings found unsupported, and pairings
//! that used up their attempts. Experiments are declared in TOML files and
//! persisted in the experiments collection under their name.

mod driver;

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::path::Path;

use serde::de::{Deserializer, SeqAccess, Visitor};
use serde::ser::{SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::collaborators::{CollaboratorRegistry, CollaboratorSpec, Role};
use crate::error::{Error, Result};
use crate::store::{Collection, DocumentStore, Filter};
use crate::task::{canonical_json, ResourceRequirements, BENCHMARK_TRIAL, IMPORT_DATASET, RUN_SYSTEM, TRAIN_SYSTEM};
use crate::types::ArtifactId;

pub use driver::{DriveReport, ExperimentDriver};

/// Attempts per pairing when a definition does not say
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Revision-checked updates give up after this many lost races
const UPDATE_ATTEMPTS: usize = 8;

// ─────────────────────────────────────────────────────────────────
// Pair Maps
// ─────────────────────────────────────────────────────────────────

/// Values keyed by an ordered pair of ids. Stored as a list of
/// `{first, second, value}` entries since JSON keys must be strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairMap<V> {
    entries: BTreeMap<(String, String), V>,
}

impl<V> Default for PairMap<V> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<V> PairMap<V> {
    pub fn get(&self, first: &str, second: &str) -> Option<&V> {
        self.entries.get(&(first.to_string(), second.to_string()))
    }

    pub fn contains(&self, first: &str, second: &str) -> bool {
        self.get(first, second).is_some()
    }

    /// Insert unless the pair is already present. Returns whether it was added.
    pub fn insert(&mut self, first: &str, second: &str, value: V) -> bool {
        let key = (first.to_string(), second.to_string());
        if self.entries.contains_key(&key) {
            return false;
        }
        self.entries.insert(key, value);
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &V)> {
        self.entries.iter().map(|((a, b), v)| (a.as_str(), b.as_str(), v))
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.values()
    }

    /// Add the pairs of `other` this map lacks. Existing entries win.
    pub fn merge(&mut self, other: &PairMap<V>)
    where
        V: Clone,
    {
        for (key, value) in &other.entries {
            self.entries.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
}

#[derive(Serialize)]
struct PairEntryRef<'a, V> {
    first: &'a str,
    second: &'a str,
    value: &'a V,
}

#[derive(Deserialize)]
struct PairEntry<V> {
    first: String,
    second: String,
    value: V,
}

impl<V: Serialize> Serialize for PairMap<V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.entries.len()))?;
        for ((first, second), value) in &self.entries {
            seq.serialize_element(&PairEntryRef { first, second, value })?;
        }
        seq.end()
    }
}

impl<'de, V: Deserialize<'de>> Deserialize<'de> for PairMap<V> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct EntriesVisitor<V>(PhantomData<V>);

        impl<'de, V: Deserialize<'de>> Visitor<'de> for EntriesVisitor<V> {
            type Value = PairMap<V>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a list of {first, second, value} entries")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error> {
                let mut map = PairMap::default();
                while let Some(entry) = seq.next_element::<PairEntry<V>>()? {
                    map.entries.insert((entry.first, entry.second), entry.value);
                }
                Ok(map)
            }
        }

        deserializer.deserialize_seq(EntriesVisitor(PhantomData))
    }
}

/// Everything an experiment knows about one kind of pairing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PairLinks {
    /// Pairing → result artifact
    pub results: PairMap<ArtifactId>,
    /// Pairing → why it can never work
    pub unsupported: PairMap<String>,
    /// Pairing → why it stopped being retried
    pub exhausted: PairMap<String>,
}

impl PairLinks {
    /// Whether nothing more is to be done for the pairing
    pub fn is_settled(&self, first: &str, second: &str) -> bool {
        self.results.contains(first, second)
            || self.unsupported.contains(first, second)
            || self.exhausted.contains(first, second)
    }

    pub fn merge(&mut self, other: &PairLinks) {
        self.results.merge(&other.results);
        self.unsupported.merge(&other.unsupported);
        self.exhausted.merge(&other.exhausted);
    }
}

// ─────────────────────────────────────────────────────────────────
// Definitions
// ─────────────────────────────────────────────────────────────────

/// A dataset to import with a named loader
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportDefinition {
    pub loader: String,
    pub path: String,
    #[serde(default)]
    pub options: BTreeMap<String, Value>,
}

impl ImportDefinition {
    /// Second half of the import's link key. Options are part of the task
    /// fingerprint, so they are part of the key too.
    pub fn link_key(&self) -> String {
        if self.options.is_empty() {
            return self.path.clone();
        }
        let options: serde_json::Map<String, Value> =
            self.options.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        format!("{} {}", self.path, canonical_json(&Value::Object(options)))
    }
}

/// A collaborator declared inline in an experiment file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollaboratorDeclaration {
    pub id: String,
    pub role: Role,
    pub type_name: String,
    #[serde(default)]
    pub config: Value,
}

/// Resources in the textual form used in experiment files
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceDeclaration {
    pub num_cpus: u32,
    pub num_gpus: u32,
    /// e.g. `"4GB"`, `"512MB"`
    pub memory: String,
    /// `"HH:MM:SS"` or seconds
    pub duration: String,
}

impl Default for ResourceDeclaration {
    fn default() -> Self {
        Self {
            num_cpus: 1,
            num_gpus: 0,
            memory: "4GB".to_string(),
            duration: "01:00:00".to_string(),
        }
    }
}

impl ResourceDeclaration {
    pub fn to_requirements(&self) -> Result<ResourceRequirements> {
        ResourceRequirements::parse(self.num_cpus, self.num_gpus, &self.memory, &self.duration)
    }
}

/// Resource declarations per task kind
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KindResources {
    pub import_dataset: ResourceDeclaration,
    pub run_system: ResourceDeclaration,
    pub train_system: ResourceDeclaration,
    pub benchmark_trial: ResourceDeclaration,
}

/// Parsed per-kind requirements
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentResources {
    pub import_dataset: ResourceRequirements,
    pub run_system: ResourceRequirements,
    pub train_system: ResourceRequirements,
    pub benchmark_trial: ResourceRequirements,
}

impl ExperimentResources {
    pub fn for_kind(&self, kind: &str) -> ResourceRequirements {
        match kind {
            IMPORT_DATASET => self.import_dataset,
            RUN_SYSTEM => self.run_system,
            TRAIN_SYSTEM => self.train_system,
            BENCHMARK_TRIAL => self.benchmark_trial,
            _ => ResourceRequirements::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

/// Contents of an experiment file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentDefinition {
    pub name: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Attempts per pairing before it is recorded as exhausted
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default)]
    pub systems: Vec<String>,
    #[serde(default)]
    pub image_sources: Vec<String>,
    #[serde(default)]
    pub trainers: Vec<String>,
    #[serde(default)]
    pub trainees: Vec<String>,
    #[serde(default)]
    pub benchmarks: Vec<String>,

    #[serde(default)]
    pub imports: Vec<ImportDefinition>,

    /// Collaborators to store alongside the experiment. Their ids join the
    /// list for their role.
    #[serde(default)]
    pub collaborators: Vec<CollaboratorDeclaration>,

    #[serde(default)]
    pub resources: KindResources,
}

impl ExperimentDefinition {
    /// Read and parse an experiment file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::IoRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::ConfigParse {
            message: e.message().to_string(),
            source: Some(e),
        })
    }

    /// Reject definitions that could never be driven
    pub fn validate(&self, registry: &CollaboratorRegistry) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::config_field_invalid("name", "experiment name cannot be empty"));
        }
        if self.max_attempts == 0 {
            return Err(Error::config_field_invalid("max_attempts", "must be at least 1"));
        }
        for declaration in &self.collaborators {
            if declaration.id.trim().is_empty() {
                return Err(Error::config_field_invalid("collaborators.id", "collaborator id cannot be empty"));
            }
            if !registry.has_type(declaration.role, &declaration.type_name) {
                return Err(Error::UnknownKind(format!(
                    "{} type {}",
                    declaration.role, declaration.type_name
                )));
            }
        }
        for import in &self.imports {
            registry.loader(&import.loader)?;
        }
        self.parsed_resources()?;
        Ok(())
    }

    fn parsed_resources(&self) -> Result<ExperimentResources> {
        Ok(ExperimentResources {
            import_dataset: self.resources.import_dataset.to_requirements()?,
            run_system: self.resources.run_system.to_requirements()?,
            train_system: self.resources.train_system.to_requirements()?,
            benchmark_trial: self.resources.benchmark_trial.to_requirements()?,
        })
    }

    /// Ids listed for `role` plus ids declared with that role, in order
    fn ids_for(&self, role: Role, listed: &[String]) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        let declared = self
            .collaborators
            .iter()
            .filter(|d| d.role == role)
            .map(|d| &d.id);
        for id in listed.iter().chain(declared) {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        ids
    }
}

// ─────────────────────────────────────────────────────────────────
// Experiment Record
// ─────────────────────────────────────────────────────────────────

/// A persisted experiment with its link tables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub name: String,
    /// Bumped by every revision-checked update
    #[serde(default)]
    pub revision: u64,
    pub enabled: bool,
    pub max_attempts: u32,

    #[serde(default)]
    pub systems: Vec<String>,
    #[serde(default)]
    pub image_sources: Vec<String>,
    #[serde(default)]
    pub trainers: Vec<String>,
    #[serde(default)]
    pub trainees: Vec<String>,
    #[serde(default)]
    pub benchmarks: Vec<String>,
    #[serde(default)]
    pub imports: Vec<ImportDefinition>,
    #[serde(default)]
    pub resources: ExperimentResources,

    /// (loader, path and options) → dataset
    #[serde(default)]
    pub imported: PairLinks,
    /// (trainer, trainee) → trained system
    #[serde(default)]
    pub trained: PairLinks,
    /// (system, image source) → trial result
    #[serde(default)]
    pub trials: PairLinks,
    /// (trial result, benchmark) → benchmark result
    #[serde(default)]
    pub benchmarked: PairLinks,
}

impl Experiment {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            revision: 0,
            enabled: true,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            systems: Vec::new(),
            image_sources: Vec::new(),
            trainers: Vec::new(),
            trainees: Vec::new(),
            benchmarks: Vec::new(),
            imports: Vec::new(),
            resources: ExperimentResources::default(),
            imported: PairLinks::default(),
            trained: PairLinks::default(),
            trials: PairLinks::default(),
            benchmarked: PairLinks::default(),
        }
    }

    /// Declared systems plus systems produced by training
    pub fn all_systems(&self) -> Vec<String> {
        let mut ids = self.systems.clone();
        ids.extend(self.trained.results.values().map(|id| id.to_string()));
        ids
    }

    /// Declared image sources plus imported datasets
    pub fn all_image_sources(&self) -> Vec<String> {
        let mut ids = self.image_sources.clone();
        ids.extend(self.imported.results.values().map(|id| id.to_string()));
        ids
    }

    /// Trial results awaiting benchmarking
    pub fn trial_results(&self) -> Vec<String> {
        self.trials.results.values().map(|id| id.to_string()).collect()
    }

    pub fn load(store: &dyn DocumentStore, name: &str) -> Result<Option<Experiment>> {
        store
            .get(Collection::Experiments, name)?
            .map(|doc| serde_json::from_value(doc.body).map_err(Error::from))
            .transpose()
    }

    /// Every stored experiment in registration order
    pub fn list(store: &dyn DocumentStore) -> Result<Vec<Experiment>> {
        store
            .find(Collection::Experiments, &Filter::all())?
            .into_iter()
            .map(|doc| serde_json::from_value(doc.body).map_err(Error::from))
            .collect()
    }

    /// Write the record as is, replacing whatever is stored
    pub fn save(&self, store: &dyn DocumentStore) -> Result<()> {
        store.put(Collection::Experiments, &self.name, serde_json::to_value(self)?)
    }

    /// Merge this copy's link tables into the stored record. Everything else
    /// comes from the stored record, so definition changes registered while
    /// this copy was being driven survive.
    pub fn save_links(&self, store: &dyn DocumentStore) -> Result<Experiment> {
        Self::update(store, &self.name, |stored| {
            stored.imported.merge(&self.imported);
            stored.trained.merge(&self.trained);
            stored.trials.merge(&self.trials);
            stored.benchmarked.merge(&self.benchmarked);
            Ok(())
        })
    }

    /// Load, change and compare-and-swap on the revision, retrying when
    /// another writer got there first. A missing record is created.
    fn update(
        store: &dyn DocumentStore,
        name: &str,
        mut change: impl FnMut(&mut Experiment) -> Result<()>,
    ) -> Result<Experiment> {
        for _ in 0..UPDATE_ATTEMPTS {
            let Some(mut experiment) = Self::load(store, name)? else {
                let mut experiment = Experiment::new(name);
                change(&mut experiment)?;
                experiment.save(store)?;
                return Ok(experiment);
            };

            let expected = Filter::all().eq("revision", experiment.revision);
            change(&mut experiment)?;
            experiment.revision += 1;
            if store.compare_and_swap(
                Collection::Experiments,
                name,
                &expected,
                serde_json::to_value(&experiment)?,
            )? {
                return Ok(experiment);
            }
            debug!(experiment = %name, "Experiment changed during update, retrying");
        }
        Err(Error::UpdateConflict {
            collection: Collection::Experiments.to_string(),
            id: name.to_string(),
            attempts: UPDATE_ATTEMPTS,
        })
    }

    /// Store a definition's collaborators and create or update its
    /// experiment. Link tables of an existing experiment are kept.
    pub fn register(
        store: &dyn DocumentStore,
        registry: &CollaboratorRegistry,
        definition: &ExperimentDefinition,
    ) -> Result<Experiment> {
        definition.validate(registry)?;

        for declaration in &definition.collaborators {
            CollaboratorSpec::new(declaration.role, declaration.type_name.clone(), declaration.config.clone())
                .save(store, &declaration.id)?;
        }

        let resources = definition.parsed_resources()?;
        let experiment = Self::update(store, &definition.name, |experiment| {
            experiment.enabled = definition.enabled;
            experiment.max_attempts = definition.max_attempts;
            experiment.systems = definition.ids_for(Role::System, &definition.systems);
            experiment.image_sources = definition.ids_for(Role::ImageSource, &definition.image_sources);
            experiment.trainers = definition.ids_for(Role::Trainer, &definition.trainers);
            experiment.trainees = definition.ids_for(Role::Trainee, &definition.trainees);
            experiment.benchmarks = definition.ids_for(Role::Benchmark, &definition.benchmarks);
            experiment.imports = definition.imports.clone();
            experiment.resources = resources;
            Ok(())
        })?;

        info!(
            experiment = %experiment.name,
            collaborators = definition.collaborators.len(),
            imports = experiment.imports.len(),
            "Registered experiment"
        );
        Ok(experiment)
    }
}
