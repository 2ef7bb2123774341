//! Periodic passes over one [`Arbiter`].
//!
//! Each pass runs on its own interval task. Passes are idempotent and safe to
//! interleave with live traffic and with each other, so a slow sweep never
//! holds up the matching cycle. Failures are logged and counted; the next
//! tick simply tries again.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use matcher::{Arbiter, PoolError};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn, Instrument};

use crate::config::SchedulerConfig;
use crate::error::SchedulerResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Pass {
    Matching,
    Liveness,
    Guardian,
}

impl Pass {
    pub const ALL: [Pass; 3] = [Pass::Matching, Pass::Liveness, Pass::Guardian];

    pub const fn name(self) -> &'static str {
        match self {
            Pass::Matching => "matching_cycle",
            Pass::Liveness => "liveness_scan",
            Pass::Guardian => "guardian_sweep",
        }
    }

    pub fn interval(self, config: &SchedulerConfig) -> Duration {
        match self {
            Pass::Matching => config.matching_interval(),
            Pass::Liveness => config.liveness_interval(),
            Pass::Guardian => config.guardian_interval(),
        }
    }

    /// Run the pass once. Returns how many things it changed: pairings
    /// created, participants moved offline, or repairs made.
    pub async fn execute(self, arbiter: &Arbiter) -> Result<usize, PoolError> {
        match self {
            Pass::Matching => arbiter.run_matching_cycle().await,
            Pass::Liveness => arbiter
                .scan_liveness()
                .await
                .map(|report| report.soft_offline + report.finalized),
            Pass::Guardian => arbiter.guardian_sweep().await,
        }
    }
}

#[derive(Debug, Default)]
struct PassStats {
    runs: AtomicU64,
    effects: AtomicU64,
    failures: AtomicU64,
}

impl PassStats {
    fn summary(&self) -> PassSummary {
        PassSummary {
            runs: self.runs.load(Ordering::Relaxed),
            effects: self.effects.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PassSummary {
    pub runs: u64,
    pub effects: u64,
    pub failures: u64,
}

/// What the scheduler did between start and shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub matching: PassSummary,
    pub liveness: PassSummary,
    pub guardian: PassSummary,
}

pub struct Scheduler {
    arbiter: Arbiter,
    config: SchedulerConfig,
    shutdown_tx: watch::Sender<bool>,
}

impl Scheduler {
    pub fn new(arbiter: Arbiter, config: SchedulerConfig) -> Self {
        let (shutdown_tx, _shutdown_rx) = watch::channel(false);
        Self {
            arbiter,
            config,
            shutdown_tx,
        }
    }

    pub fn arbiter(&self) -> &Arbiter {
        &self.arbiter
    }

    /// Run every pass on its interval until `signal` completes, then stop the
    /// interval tasks. A pass already in flight finishes before its task
    /// exits.
    pub async fn run_until<F>(self, signal: F) -> SchedulerResult<RunSummary>
    where
        F: Future<Output = ()>,
    {
        info!(
            matching_ms = self.config.matching_interval_ms,
            liveness_ms = self.config.liveness_interval_ms,
            guardian_ms = self.config.guardian_interval_ms,
            "scheduler_started"
        );

        let tasks: Vec<(Pass, Arc<PassStats>, JoinHandle<()>)> = Pass::ALL
            .into_iter()
            .map(|pass| {
                let stats = Arc::new(PassStats::default());
                let handle = self.spawn_pass(pass, Arc::clone(&stats));
                (pass, stats, handle)
            })
            .collect();

        signal.await;
        info!("scheduler_shutdown_requested");
        let _ = self.shutdown_tx.send(true);

        let mut summary = RunSummary::default();
        for (pass, stats, handle) in tasks {
            handle.await?;
            let pass_summary = stats.summary();
            match pass {
                Pass::Matching => summary.matching = pass_summary,
                Pass::Liveness => summary.liveness = pass_summary,
                Pass::Guardian => summary.guardian = pass_summary,
            }
        }

        info!(
            matching_runs = summary.matching.runs,
            pairings = summary.matching.effects,
            liveness_runs = summary.liveness.runs,
            guardian_runs = summary.guardian.runs,
            repairs = summary.guardian.effects,
            "scheduler_stopped"
        );
        Ok(summary)
    }

    fn spawn_pass(&self, pass: Pass, stats: Arc<PassStats>) -> JoinHandle<()> {
        let arbiter = self.arbiter.clone();
        let interval = pass.interval(&self.config);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        let span = tracing::info_span!("scheduled_pass", pass = pass.name());
                        stats.runs.fetch_add(1, Ordering::Relaxed);
                        match pass.execute(&arbiter).instrument(span).await {
                            Ok(effects) => {
                                let effects_u64 = u64::try_from(effects).unwrap_or(u64::MAX);
                                stats.effects.fetch_add(effects_u64, Ordering::Relaxed);
                                debug!(pass = pass.name(), effects, "scheduled_pass_done");
                            }
                            Err(err) => {
                                stats.failures.fetch_add(1, Ordering::Relaxed);
                                warn!(
                                    pass = pass.name(),
                                    error = %err,
                                    retryable = err.is_retryable(),
                                    "scheduled_pass_failed"
                                );
                            }
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matcher::PoolConfig;
    use pool::{Gender, LifecycleState, Profile};

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig {
            matching_interval_ms: 10,
            liveness_interval_ms: 20,
            guardian_interval_ms: 20,
            ..SchedulerConfig::default()
        }
    }

    #[tokio::test]
    async fn scheduled_cycles_pair_waiting_participants() {
        let mut pool_config = PoolConfig::default();
        pool_config.search.match_on_join = false;
        let arbiter = Arbiter::in_memory(pool_config).unwrap();
        let a = arbiter
            .register(Profile::new(Gender::Female, [Gender::Male], 30))
            .await
            .unwrap();
        let b = arbiter
            .register(Profile::new(Gender::Male, [Gender::Female], 30))
            .await
            .unwrap();
        assert!(arbiter.join(a).await.unwrap());
        assert!(arbiter.join(b).await.unwrap());

        let scheduler = Scheduler::new(arbiter.clone(), fast_config());
        let summary = scheduler
            .run_until(tokio::time::sleep(Duration::from_millis(150)))
            .await
            .unwrap();

        assert!(summary.matching.runs >= 2);
        assert_eq!(summary.matching.effects, 1);
        assert!(summary.guardian.runs >= 1);
        assert_eq!(summary.guardian.failures, 0);
        assert_eq!(
            arbiter.participant(a).await.unwrap().unwrap().state,
            LifecycleState::Voting
        );
    }

    #[tokio::test]
    async fn shutdown_before_any_work_is_clean() {
        let arbiter = Arbiter::in_memory(PoolConfig::default()).unwrap();
        let summary = Scheduler::new(arbiter, SchedulerConfig::default())
            .run_until(async {})
            .await
            .unwrap();
        assert_eq!(summary.matching.failures, 0);
        assert_eq!(summary.guardian.effects, 0);
    }

    #[tokio::test]
    async fn passes_can_run_directly() {
        let arbiter = Arbiter::in_memory(PoolConfig::default()).unwrap();
        for pass in Pass::ALL {
            assert_eq!(pass.execute(&arbiter).await.unwrap(), 0);
        }
    }
}
