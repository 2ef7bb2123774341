// Metrics hooks for the `matcher` crate.
//
// Callers install a global `PoolMetrics` implementation via [`set_pool_metrics`];
// every `Arbiter` then reports matching cycles, committed pairings, vote
// outcomes, liveness scans and guardian repairs to it. This keeps the engine
// decoupled from any specific metrics backend.
use std::sync::{Arc, RwLock};
use std::time::Duration;

use once_cell::sync::OnceCell;
use pool::{Tier, VoteOutcome};

use crate::guardian::GuardianReport;
use crate::liveness::LivenessReport;

/// Metrics observer for engine activity.
pub trait PoolMetrics: Send + Sync {
    /// One `run_matching_cycle` call: wall-clock latency, queue size when the
    /// cycle started and pairings created.
    fn record_cycle(&self, latency: Duration, queued: usize, matches: usize);

    /// A committed pairing and the tier it was found at.
    fn record_pairing(&self, tier: Tier);

    /// A final vote outcome.
    fn record_vote(&self, outcome: VoteOutcome);

    fn record_liveness(&self, report: &LivenessReport);

    fn record_repairs(&self, report: &GuardianReport);
}

fn metrics_lock() -> &'static RwLock<Option<Arc<dyn PoolMetrics>>> {
    static METRICS: OnceCell<RwLock<Option<Arc<dyn PoolMetrics>>>> = OnceCell::new();
    METRICS.get_or_init(|| RwLock::new(None))
}

pub(crate) fn metrics_recorder() -> Option<Arc<dyn PoolMetrics>> {
    let guard = metrics_lock()
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    guard.clone()
}

/// Install or clear the global pool metrics recorder.
///
/// Typically called once during service startup so every `Arbiter` shares the
/// same metrics backend.
pub fn set_pool_metrics(recorder: Option<Arc<dyn PoolMetrics>>) {
    let mut guard = metrics_lock()
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    *guard = recorder;
}
