//! Resource requirements and the scheduler's resource ceiling

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Resources a task asks for. Consulted by the scheduler, never enforced by
/// the task itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceRequirements {
    /// CPU cores
    pub num_cpus: u32,

    /// GPU devices
    pub num_gpus: u32,

    /// Memory in megabytes
    pub memory_mb: u64,

    /// Expected wall-clock duration in seconds
    pub expected_duration_secs: u64,
}

impl Default for ResourceRequirements {
    fn default() -> Self {
        Self {
            num_cpus: 1,
            num_gpus: 0,
            memory_mb: 4096,
            expected_duration_secs: 3600,
        }
    }
}

impl ResourceRequirements {
    pub fn new(num_cpus: u32, num_gpus: u32, memory_mb: u64, expected_duration: Duration) -> Self {
        Self {
            num_cpus,
            num_gpus,
            memory_mb,
            expected_duration_secs: expected_duration.as_secs(),
        }
    }

    /// Build from the textual forms used in experiment files
    /// (`"4GB"`, `"12:00:00"`).
    pub fn parse(num_cpus: u32, num_gpus: u32, memory: &str, duration: &str) -> Result<Self> {
        Ok(Self {
            num_cpus,
            num_gpus,
            memory_mb: parse_memory_mb(memory)?,
            expected_duration_secs: parse_duration_secs(duration)?,
        })
    }

    pub fn expected_duration(&self) -> Duration {
        Duration::from_secs(self.expected_duration_secs)
    }

    /// List every requirement that does not fit under `ceiling`
    pub fn violations(&self, ceiling: &ResourceCeiling) -> Vec<ResourceViolation> {
        let checks = [
            ("num_cpus", self.num_cpus as u64, ceiling.max_cpus.map(u64::from)),
            ("num_gpus", self.num_gpus as u64, ceiling.max_gpus.map(u64::from)),
            ("memory_mb", self.memory_mb, ceiling.max_memory_mb),
            ("expected_duration_secs", self.expected_duration_secs, ceiling.max_duration_secs),
        ];

        checks
            .into_iter()
            .filter_map(|(resource, requested, limit)| match limit {
                Some(limit) if requested > limit => Some(ResourceViolation {
                    resource,
                    requested,
                    limit,
                }),
                _ => None,
            })
            .collect()
    }

    pub fn fits(&self, ceiling: &ResourceCeiling) -> bool {
        self.violations(ceiling).is_empty()
    }
}

/// Upper bounds for a schedulable task. `None` means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceCeiling {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_cpus: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_gpus: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_memory_mb: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_duration_secs: Option<u64>,
}

impl ResourceCeiling {
    pub fn unlimited() -> Self {
        Self::default()
    }
}

/// A single requirement that exceeds the ceiling
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceViolation {
    pub resource: &'static str,
    pub requested: u64,
    pub limit: u64,
}

impl fmt::Display for ResourceViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} requested {} > limit {}", self.resource, self.requested, self.limit)
    }
}

// ─────────────────────────────────────────────────────────────────
// Parsing
// ─────────────────────────────────────────────────────────────────

/// Parse a memory size such as `"512MB"`, `"4GB"`, `"2048"` (MB) into megabytes
pub fn parse_memory_mb(text: &str) -> Result<u64> {
    let trimmed = text.trim();
    let upper = trimmed.to_ascii_uppercase();
    let (digits, multiplier) = if let Some(n) = upper.strip_suffix("TB") {
        (n, 1024 * 1024)
    } else if let Some(n) = upper.strip_suffix("GB") {
        (n, 1024)
    } else if let Some(n) = upper.strip_suffix("MB") {
        (n, 1)
    } else if let Some(n) = upper.strip_suffix("KB") {
        let kb: u64 = n.trim().parse().map_err(|_| invalid_memory(trimmed))?;
        return Ok(kb.div_ceil(1024));
    } else {
        (upper.as_str(), 1)
    };

    let n: u64 = digits.trim().parse().map_err(|_| invalid_memory(trimmed))?;
    n.checked_mul(multiplier).ok_or_else(|| too_large("memory", trimmed))
}

/// Parse a duration as `"HH:MM:SS"`, `"MM:SS"` or plain seconds
pub fn parse_duration_secs(text: &str) -> Result<u64> {
    let trimmed = text.trim();
    let parts: Vec<&str> = trimmed.split(':').collect();
    if parts.len() > 3 || parts.iter().any(|p| p.is_empty()) {
        return Err(invalid_duration(trimmed));
    }

    let mut secs = 0u64;
    for part in &parts {
        let value: u64 = part.parse().map_err(|_| invalid_duration(trimmed))?;
        secs = secs
            .checked_mul(60)
            .and_then(|s| s.checked_add(value))
            .ok_or_else(|| too_large("duration", trimmed))?;
    }
    Ok(secs)
}

/// Format seconds as `HH:MM:SS`, the form cluster schedulers expect for walltime
pub fn format_duration_hms(secs: u64) -> String {
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

fn invalid_memory(text: &str) -> Error {
    Error::InvalidParameters {
        kind: "resources".to_string(),
        message: format!("invalid memory size '{}'", text),
    }
}

fn too_large(field: &str, text: &str) -> Error {
    Error::config_field_invalid(format!("resources.{}", field), format!("'{}' is too large", text))
}

fn invalid_duration(text: &str) -> Error {
    Error::InvalidParameters {
        kind: "resources".to_string(),
        message: format!("invalid duration '{}'", text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_memory() {
        assert_eq!(parse_memory_mb("512MB").unwrap(), 512);
        assert_eq!(parse_memory_mb("4GB").unwrap(), 4096);
        assert_eq!(parse_memory_mb("4gb").unwrap(), 4096);
        assert_eq!(parse_memory_mb("2048").unwrap(), 2048);
        assert_eq!(parse_memory_mb("1536KB").unwrap(), 2);
        assert!(parse_memory_mb("lots").is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration_secs("1:00:00").unwrap(), 3600);
        assert_eq!(parse_duration_secs("100:30:15").unwrap(), 361_815);
        assert_eq!(parse_duration_secs("05:00").unwrap(), 300);
        assert_eq!(parse_duration_secs("42").unwrap(), 42);
        assert!(parse_duration_secs("1::2").is_err());
        assert!(parse_duration_secs("a:b").is_err());
    }

    #[test]
    fn test_oversized_values_are_rejected() {
        let err = parse_memory_mb("18446744073709551615GB").unwrap_err();
        assert!(matches!(err, Error::ConfigValidation { ref field, .. } if field.as_deref() == Some("resources.memory")));
        assert!(parse_memory_mb("17592186044416TB").is_err());
        assert_eq!(parse_memory_mb("17592186044415TB").unwrap(), 17592186044415 * 1024 * 1024);

        let err = parse_duration_secs("18446744073709551615:00").unwrap_err();
        assert!(matches!(err, Error::ConfigValidation { ref field, .. } if field.as_deref() == Some("resources.duration")));
        assert!(parse_duration_secs("5124095576030432:00:00").is_err());
    }

    #[test]
    fn test_format_duration_hms() {
        assert_eq!(format_duration_hms(3661), "01:01:01");
        assert_eq!(format_duration_hms(0), "00:00:00");
    }

    #[test]
    fn test_violations() {
        let ceiling = ResourceCeiling {
            max_cpus: Some(2),
            max_gpus: Some(0),
            ..Default::default()
        };

        let fits = ResourceRequirements { num_cpus: 2, ..Default::default() };
        assert!(fits.fits(&ceiling));

        let too_big = ResourceRequirements { num_cpus: 4, num_gpus: 1, ..Default::default() };
        let violations = too_big.violations(&ceiling);
        assert_eq!(violations.len(), 2);
        assert_eq!(violations[0].resource, "num_cpus");
        assert_eq!(violations[0].requested, 4);
        assert_eq!(violations[0].limit, 2);
        assert_eq!(violations[1].resource, "num_gpus");
    }

    #[test]
    fn test_unlimited_ceiling() {
        let huge = ResourceRequirements {
            num_cpus: 1024,
            num_gpus: 64,
            memory_mb: u64::MAX,
            expected_duration_secs: u64::MAX,
        };
        assert!(huge.fits(&ResourceCeiling::unlimited()));
    }

    #[test]
    fn test_parse_requirements() {
        let req = ResourceRequirements::parse(4, 1, "8GB", "02:00:00").unwrap();
        assert_eq!(req.memory_mb, 8192);
        assert_eq!(req.expected_duration(), Duration::from_secs(7200));
    }
}
