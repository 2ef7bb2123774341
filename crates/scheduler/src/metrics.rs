//! `metrics` facade implementation of the engine's [`PoolMetrics`] hook.
//!
//! Installing a concrete exporter (Prometheus, StatsD, ...) is left to the
//! process embedding the scheduler; without one every call is a no-op.

use std::time::Duration;

use matcher::{GuardianReport, LivenessReport, PoolMetrics};
use pool::{Tier, VoteOutcome};

pub const CYCLE_SECONDS: &str = "duet_matching_cycle_seconds";
pub const CYCLE_MATCHES_TOTAL: &str = "duet_matching_cycle_matches_total";
pub const QUEUE_LENGTH: &str = "duet_queue_length";
pub const PAIRINGS_TOTAL: &str = "duet_pairings_total";
pub const VOTE_OUTCOMES_TOTAL: &str = "duet_vote_outcomes_total";
pub const SOFT_OFFLINE_TOTAL: &str = "duet_soft_offline_total";
pub const OFFLINE_TOTAL: &str = "duet_offline_total";
pub const REPAIRS_TOTAL: &str = "duet_guardian_repairs_total";
pub const SKIPPED_TOTAL: &str = "duet_skipped_locked_total";
pub const OLDEST_LOCK_HOLD: &str = "duet_oldest_lock_hold_seconds";

#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsRecorder;

impl PoolMetrics for MetricsRecorder {
    fn record_cycle(&self, latency: Duration, queued: usize, matches: usize) {
        metrics::histogram!(CYCLE_SECONDS).record(latency.as_secs_f64());
        metrics::gauge!(QUEUE_LENGTH).set(queued as f64);
        metrics::counter!(CYCLE_MATCHES_TOTAL).increment(matches as u64);
    }

    fn record_pairing(&self, tier: Tier) {
        metrics::counter!(PAIRINGS_TOTAL, "tier" => tier.as_str()).increment(1);
    }

    fn record_vote(&self, outcome: VoteOutcome) {
        metrics::counter!(VOTE_OUTCOMES_TOTAL, "outcome" => outcome.as_str()).increment(1);
    }

    fn record_liveness(&self, report: &LivenessReport) {
        metrics::counter!(SOFT_OFFLINE_TOTAL).increment(report.soft_offline as u64);
        metrics::counter!(OFFLINE_TOTAL).increment(report.finalized as u64);
        metrics::counter!(SKIPPED_TOTAL, "pass" => "liveness").increment(report.skipped as u64);
    }

    fn record_repairs(&self, report: &GuardianReport) {
        let kinds = [
            ("stale_pending", report.stale_pending),
            ("expired_vote", report.expired_votes),
            ("broken_pairing", report.broken_pairings),
            ("asymmetric_partner", report.asymmetric_partners),
            ("illegal_state", report.illegal_states),
            ("orphan_queue_entry", report.orphan_entries),
        ];
        for (kind, count) in kinds {
            if count > 0 {
                metrics::counter!(REPAIRS_TOTAL, "kind" => kind).increment(count as u64);
            }
        }
        metrics::counter!(SKIPPED_TOTAL, "pass" => "guardian").increment(report.skipped as u64);
        let oldest = report.oldest_lock_hold.map_or(0.0, |hold| hold.as_secs_f64());
        metrics::gauge!(OLDEST_LOCK_HOLD).set(oldest);
    }
}
