//! Duet Scheduler - periodic passes for the Duet matching engine
//!
//! This crate runs the background work an [`Arbiter`](matcher::Arbiter)
//! needs to make progress without client traffic:
//!
//! - **Matching cycle**: pairs waiting participants, tier by tier
//!   (default every second)
//! - **Liveness scan**: moves silent participants to soft-offline and then
//!   offline (default every 5 seconds)
//! - **Guardian sweep**: reconciles drifted pairing, queue and lifecycle rows
//!   (default every 10 seconds)
//!
//! Every pass is idempotent, so intervals may overlap with each other and
//! with live `join`/`vote`/`heartbeat` traffic.
//!
//! # Features
//!
//! - **Configuration**: optional `scheduler.*` file plus `DUET_SCHEDULER__*`
//!   environment variables, with the engine itself configured from YAML
//! - **Logging**: structured JSON logs through `tracing-subscriber`
//! - **Metrics**: engine activity reported through the `metrics` facade
//! - **Graceful Shutdown**: in-flight passes finish on SIGTERM or Ctrl+C
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use scheduler::{Scheduler, SchedulerConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = SchedulerConfig::load()?;
//!     let arbiter = duet::build_arbiter(&config.duet_config()?)?;
//!     Scheduler::new(arbiter, config)
//!         .run_until(scheduler::shutdown_signal())
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod metrics;
pub mod runner;
pub mod signal;

pub use crate::config::SchedulerConfig;
pub use crate::error::{SchedulerError, SchedulerResult};
pub use crate::metrics::MetricsRecorder;
pub use crate::runner::{Pass, PassSummary, RunSummary, Scheduler};
pub use crate::signal::shutdown_signal;

/// Install the JSON `tracing` subscriber filtered by `config.log_level`.
pub fn init_tracing(config: &SchedulerConfig) {
    tracing_subscriber::fmt()
        .with_env_filter(config.log_level.as_str())
        .with_target(false)
        .with_thread_ids(true)
        .json()
        .init();
}
