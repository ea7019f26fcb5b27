//! Engine configuration
//!
//! Values come from defaults, an optional JSON file, and CLI overrides, in
//! that order. [`EngineConfig::validate`] runs once before the engine starts.

use std::path::Path;

use perfscope_common::{DEFAULT_HISTORY_CAPACITY, DEFAULT_SAMPLING_INTERVAL_MS, OUTLIER_SIGMA};
use serde::{Deserialize, Serialize};

use crate::domain::ConfigError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Samples kept per profiler
    pub history_capacity: usize,
    /// Period of the log refresh, in milliseconds
    pub sampling_interval_ms: u64,
    /// Standard deviations above the mean that mark a spike
    pub outlier_sigma: f64,
    /// Background worker threads for teardown and statistics
    pub worker_threads: usize,
    /// Owner id stamped on every interceptor the engine installs
    pub owner: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            sampling_interval_ms: DEFAULT_SAMPLING_INTERVAL_MS,
            outlier_sigma: OUTLIER_SIGMA,
            worker_threads: 2,
            owner: "perfscope".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load a config file; missing fields keep their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.history_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "history_capacity",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.sampling_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "sampling_interval_ms",
                reason: "must be at least 1".to_string(),
            });
        }
        if !self.outlier_sigma.is_finite() || self.outlier_sigma < 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "outlier_sigma",
                reason: format!("{} is not a non-negative number", self.outlier_sigma),
            });
        }
        if self.worker_threads == 0 {
            return Err(ConfigError::InvalidValue {
                field: "worker_threads",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.owner.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "owner",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.history_capacity, 2000);
        assert_eq!(config.sampling_interval_ms, 500);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let config = EngineConfig { history_capacity: 0, ..EngineConfig::default() };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("history_capacity"));
    }

    #[test]
    fn test_negative_sigma_rejected() {
        let config = EngineConfig { outlier_sigma: -1.0, ..EngineConfig::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"history_capacity": 50}}"#).unwrap();

        let config = EngineConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.history_capacity, 50);
        assert_eq!(config.worker_threads, 2);
        assert_eq!(config.owner, "perfscope");
    }
}
