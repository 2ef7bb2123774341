//! Duet Scheduler - runs matching cycles, liveness scans and guardian sweeps
//! against an in-process pool until SIGTERM or Ctrl+C.

use std::sync::Arc;

use scheduler::{MetricsRecorder, RunSummary, Scheduler, SchedulerConfig, SchedulerResult};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = SchedulerConfig::load()?;
    scheduler::init_tracing(&config);

    let summary = match run(config).await {
        Ok(summary) => summary,
        Err(err) => {
            tracing::error!(code = err.error_code(), error = %err, "scheduler_failed");
            return Err(err.into());
        }
    };

    tracing::info!(
        pairings = summary.matching.effects,
        repairs = summary.guardian.effects,
        "scheduler shutdown complete"
    );
    Ok(())
}

async fn run(config: SchedulerConfig) -> SchedulerResult<RunSummary> {
    let duet_config = config.duet_config()?;
    let arbiter = duet::build_arbiter(&duet_config)?;
    if config.metrics_enabled {
        matcher::set_pool_metrics(Some(Arc::new(MetricsRecorder)));
    }

    Scheduler::new(arbiter, config)
        .run_until(scheduler::shutdown_signal())
        .await
}
