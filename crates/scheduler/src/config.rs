use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use duet::DuetConfig;

use crate::error::{SchedulerError, SchedulerResult};

const ENV_PREFIX: &str = "DUET_SCHEDULER";

/// Scheduler configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerConfig {
    /// Milliseconds between matching cycles
    #[serde(default = "default_matching_interval_ms")]
    pub matching_interval_ms: u64,

    /// Milliseconds between liveness scans
    #[serde(default = "default_liveness_interval_ms")]
    pub liveness_interval_ms: u64,

    /// Milliseconds between guardian sweeps
    #[serde(default = "default_guardian_interval_ms")]
    pub guardian_interval_ms: u64,

    /// Log level / `EnvFilter` directive
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional path to a Duet YAML configuration file
    #[serde(default)]
    pub pool_config: Option<PathBuf>,

    /// Report engine activity through the `metrics` facade
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            matching_interval_ms: default_matching_interval_ms(),
            liveness_interval_ms: default_liveness_interval_ms(),
            guardian_interval_ms: default_guardian_interval_ms(),
            log_level: default_log_level(),
            pool_config: None,
            metrics_enabled: default_true(),
        }
    }
}

impl SchedulerConfig {
    /// Load configuration from an optional `scheduler.*` file in the working
    /// directory, overridden by `DUET_SCHEDULER__*` environment variables.
    pub fn load() -> SchedulerResult<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("scheduler").required(false))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"));
        Self::finish(builder)
    }

    /// Load configuration from an explicit file, still honouring environment
    /// overrides.
    pub fn load_from(path: &Path) -> SchedulerResult<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"));
        Self::finish(builder)
    }

    fn finish(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> SchedulerResult<Self> {
        let config: SchedulerConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SchedulerResult<()> {
        let intervals = [
            ("matching_interval_ms", self.matching_interval_ms),
            ("liveness_interval_ms", self.liveness_interval_ms),
            ("guardian_interval_ms", self.guardian_interval_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(SchedulerError::Config(format!(
                    "{name} must be greater than zero"
                )));
            }
        }
        Ok(())
    }

    pub fn matching_interval(&self) -> Duration {
        Duration::from_millis(self.matching_interval_ms)
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms)
    }

    pub fn guardian_interval(&self) -> Duration {
        Duration::from_millis(self.guardian_interval_ms)
    }

    /// The engine configuration: the YAML file when one is configured,
    /// defaults otherwise.
    pub fn duet_config(&self) -> SchedulerResult<DuetConfig> {
        match &self.pool_config {
            Some(path) => Ok(DuetConfig::from_file(path)?),
            None => Ok(DuetConfig::default()),
        }
    }
}

fn default_matching_interval_ms() -> u64 {
    1_000
}

fn default_liveness_interval_ms() -> u64 {
    5_000
}

fn default_guardian_interval_ms() -> u64 {
    10_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}
