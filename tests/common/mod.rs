//! Common test utilities and fixtures

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

/// Get the path to the test fixtures directory
pub fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests").join("fixtures")
}

/// Get a path to a specific fixture file
pub fn fixture_path(name: &str) -> PathBuf {
    fixtures_dir().join(name)
}

pub fn experiment_fixture() -> PathBuf {
    fixture_path("experiment.toml")
}

pub fn valid_config_fixture() -> PathBuf {
    fixture_path("valid_config.toml")
}

pub fn invalid_config_fixture() -> PathBuf {
    fixture_path("invalid_config.toml")
}

/// A temporary store directory with a config file pointing at it
pub struct TestEnvironment {
    pub root: TempDir,
    pub config_path: PathBuf,
    pub store_dir: PathBuf,
}

impl TestEnvironment {
    /// File store plus the mock job system, with a short claim wait
    pub fn new() -> Self {
        let root = TempDir::new().expect("Failed to create temp directory");
        let store_dir = root.path().join("store");
        let config_path = root.path().join("config.toml");

        let config = format!(
            r#"
[store]
backend = "file"
path = "{}"
lock_timeout_ms = 5000

[job_system]
kind = "mock"

[worker]
claim_wait_ms = 300

[logging]
level = "debug"
"#,
            store_dir.display()
        );
        fs::write(&config_path, config).expect("Failed to write config");

        Self {
            root,
            config_path,
            store_dir,
        }
    }

    pub fn config(&self) -> &str {
        self.config_path.to_str().expect("temp path is not UTF-8")
    }

    pub fn path(&self) -> &Path {
        self.root.path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixtures_exist() {
        assert!(experiment_fixture().exists());
        assert!(valid_config_fixture().exists());
        assert!(invalid_config_fixture().exists());
    }
}
