//! Task kinds and their typed parameters
//!
//! A task's `kind` is a string tag; its `parameters` are an opaque JSON
//! payload. The structs here give the built-in kinds a typed view of that
//! payload.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Kind tag for dataset imports
pub const IMPORT_DATASET: &str = "import_dataset";
/// Kind tag for running a system against an image source
pub const RUN_SYSTEM: &str = "run_system";
/// Kind tag for training a trainee with a trainer
pub const TRAIN_SYSTEM: &str = "train_system";
/// Kind tag for benchmarking a trial result
pub const BENCHMARK_TRIAL: &str = "benchmark_trial";

/// Typed parameters for one task kind
pub trait TaskParameters: Serialize + DeserializeOwned {
    /// Kind tag these parameters belong to
    const KIND: &'static str;

    /// Encode as the JSON payload stored on the task
    fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Decode from a task's payload
    fn from_value(value: &Value) -> Result<Self> {
        serde_json::from_value(value.clone()).map_err(|e| Error::InvalidParameters {
            kind: Self::KIND.to_string(),
            message: e.to_string(),
        })
    }
}

/// Import a dataset with a named loader
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportDatasetParams {
    /// Name of the registered dataset loader
    pub loader: String,
    /// Location of the raw dataset
    pub path: String,
    /// Extra loader options
    #[serde(default)]
    pub options: BTreeMap<String, Value>,
}

impl TaskParameters for ImportDatasetParams {
    const KIND: &'static str = IMPORT_DATASET;
}

/// Run a vision system over an image source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSystemParams {
    pub system_id: String,
    pub image_source_id: String,
}

impl TaskParameters for RunSystemParams {
    const KIND: &'static str = RUN_SYSTEM;
}

/// Train a trainee with a trainer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainSystemParams {
    pub trainer_id: String,
    pub trainee_id: String,
}

impl TaskParameters for TrainSystemParams {
    const KIND: &'static str = TRAIN_SYSTEM;
}

/// Benchmark a trial result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BenchmarkTrialParams {
    pub trial_result_id: String,
    pub benchmark_id: String,
}

impl TaskParameters for BenchmarkTrialParams {
    const KIND: &'static str = BENCHMARK_TRIAL;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_params_encode_as_plain_objects() {
        let params = RunSystemParams {
            system_id: "sys".into(),
            image_source_id: "src".into(),
        };
        assert_eq!(
            params.to_value().unwrap(),
            json!({"system_id": "sys", "image_source_id": "src"})
        );
    }

    #[test]
    fn test_import_options_default_to_empty() {
        let params =
            ImportDatasetParams::from_value(&json!({"loader": "kitti", "path": "/data"})).unwrap();
        assert!(params.options.is_empty());
    }

    #[test]
    fn test_wrong_payload_reports_kind() {
        let err = TrainSystemParams::from_value(&json!({"trainer_id": 3})).unwrap_err();
        match err {
            Error::InvalidParameters { kind, .. } => assert_eq!(kind, TRAIN_SYSTEM),
            other => panic!("unexpected error: {other}"),
        }
    }
}
