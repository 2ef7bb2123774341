//! YAML Configuration File Support for Duet
//!
//! Loads the whole engine configuration (fairness weights, search tiers,
//! vote window, liveness thresholds, guardian grace) from a single YAML file.
//! Every section is optional; missing fields take their defaults.
//!
//! ## Example YAML Configuration
//!
//! ```yaml
//! # Duet engine configuration
//! version: "1.0"
//! name: "production"
//!
//! pool:
//!   fairness:
//!     wait_weight: 1.0
//!     boost_increment: 25.0
//!     boost_cap: 100.0
//!   search:
//!     candidate_limit: 16
//!     tier2_first_threshold: 30000    # milliseconds
//!     tier2_second_threshold: 60000
//!     tier3_max_attempts: 30
//!   vote:
//!     vote_window: 20000
//!   liveness:
//!     soft_offline_after: 15000
//!     offline_after: 45000
//!     cooldown: 60000
//!   guardian:
//!     pending_grace: 5000
//! ```

use std::fs;
use std::path::Path;

use matcher::PoolConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur when loading YAML configuration files
#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("unsupported config version: {0}")]
    UnsupportedVersion(String),
}

/// Top-level YAML configuration for a Duet deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DuetConfig {
    /// Configuration format version
    #[serde(default = "default_version")]
    pub version: String,

    /// Optional configuration name/description
    #[serde(default)]
    pub name: Option<String>,

    /// Engine configuration
    #[serde(default)]
    pub pool: PoolConfig,
}

impl DuetConfig {
    /// Load a YAML configuration file from the given path
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigLoadError> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse YAML configuration from a string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigLoadError> {
        let config: DuetConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigLoadError> {
        match self.version.as_str() {
            "1.0" | "1" => Ok(()),
            v => Err(ConfigLoadError::UnsupportedVersion(v.to_string())),
        }?;

        self.pool
            .validate()
            .map_err(|err| ConfigLoadError::Validation(err.to_string()))
    }
}

impl Default for DuetConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            name: None,
            pool: PoolConfig::default(),
        }
    }
}

fn default_version() -> String {
    "1.0".to_string()
}
