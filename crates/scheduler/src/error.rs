pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Scheduler error types
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration source error: {0}")]
    Source(#[from] config::ConfigError),

    #[error("Engine configuration error: {0}")]
    DuetConfig(#[from] duet::ConfigLoadError),

    #[error("Engine error: {0}")]
    Engine(#[from] matcher::PoolError),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl SchedulerError {
    /// Error code string for structured logs
    pub fn error_code(&self) -> &'static str {
        match self {
            SchedulerError::Config(_) | SchedulerError::Source(_) => "CONFIG_ERROR",
            SchedulerError::DuetConfig(_) => "POOL_CONFIG_ERROR",
            SchedulerError::Engine(_) => "ENGINE_ERROR",
            SchedulerError::Task(_) => "TASK_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_errors_convert() {
        let err: SchedulerError = matcher::PoolError::InvalidConfig("bad".into()).into();
        assert_eq!(err.error_code(), "ENGINE_ERROR");
        assert!(err.to_string().contains("bad"));
    }
}
