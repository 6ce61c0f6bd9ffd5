//! batch-analysis
//!
//! Schedules long-running analysis tasks for vision experiments. Experiments
//! pair systems with image sources, trainers with trainees and trial results
//! with benchmarks; every pairing becomes a deduplicated task in a shared
//! store, is submitted to a job system at most once per attempt and is
//! executed by a worker that records its result artifact.

pub mod cli;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod experiment;
pub mod job_system;
pub mod logging;
pub mod pass;
pub mod runner;
pub mod store;
pub mod task;
pub mod task_manager;
pub mod types;
pub mod version;

pub use error::{Error, Result};
