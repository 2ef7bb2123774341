//! Fairness scoring.
//!
//! `score = wait + boost - skip_penalty + narrowness + low_density`, every
//! term capped. While a participant stays queued its stored score only moves
//! up: recomputation writes `max(current, computed)` and [`Engine::boost`] is
//! the only other mutator. Every write is reported as a `ScoreChanged` event.

use std::time::Duration;

use pool::{
    clock, BoostReason, FairnessLedger, PoolEvent, Profile, QueueEntry, ScoreReason, WriteBatch,
};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::FairnessConfig;
use crate::engine::{Attempt, Engine};
use crate::error::PoolError;
use crate::search::{is_pairable, PoolSnapshot};

/// Scores closer than this are treated as unchanged.
const SCORE_EPSILON: f64 = 1e-9;

/// Everything the score depends on.
#[derive(Debug, Clone, Copy)]
pub struct FairnessInputs<'a> {
    pub wait: Duration,
    pub ledger: &'a FairnessLedger,
    pub profile: &'a Profile,
    /// Gender-compatible counterparts currently waiting.
    pub compatible_waiting: usize,
}

/// Per-term breakdown, kept for audit logs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub wait: f64,
    pub boost: f64,
    pub skip_penalty: f64,
    pub narrowness: f64,
    pub low_density: f64,
    pub total: f64,
}

pub fn compute_score(cfg: &FairnessConfig, inputs: &FairnessInputs<'_>) -> ScoreBreakdown {
    let wait = (inputs.wait.as_secs_f64() * cfg.wait_weight).min(cfg.wait_cap);
    let boost = inputs.ledger.boost_points.clamp(0.0, cfg.boost_cap);
    let skip_penalty = (f64::from(inputs.ledger.skips) * cfg.skip_weight).min(cfg.skip_cap);

    let width = f64::from(inputs.profile.age_range.width()).min(100.0);
    let mut narrowness = cfg.narrowness_weight * (1.0 - width / 100.0);
    if !inputs.profile.accepted_locales.is_empty() {
        narrowness += cfg.locale_bonus;
    }
    let narrowness = narrowness.clamp(0.0, cfg.narrowness_cap);

    let low_density = if inputs.compatible_waiting < cfg.low_density_threshold {
        cfg.low_density_bonus
    } else {
        0.0
    };

    let total = (wait + boost - skip_penalty + narrowness + low_density).max(0.0);
    ScoreBreakdown {
        wait,
        boost,
        skip_penalty,
        narrowness,
        low_density,
        total,
    }
}

/// Add a boost to `ledger`, respecting the cap. Returns the points granted.
pub(crate) fn grant_boost(cfg: &FairnessConfig, ledger: &mut FairnessLedger, amount: f64) -> f64 {
    let headroom = (cfg.boost_cap - ledger.boost_points).max(0.0);
    let granted = amount.max(0.0).min(headroom);
    ledger.boost_points += granted;
    ledger.boost_events += 1;
    granted
}

impl Engine {
    pub(crate) fn score_for(
        &self,
        entry: &QueueEntry,
        ledger: &FairnessLedger,
        profile: &Profile,
        compatible_waiting: usize,
    ) -> ScoreBreakdown {
        let wait = clock::elapsed(entry.enqueued_at, self.now());
        compute_score(
            &self.config.fairness,
            &FairnessInputs {
                wait,
                ledger,
                profile,
                compatible_waiting,
            },
        )
    }

    /// Score for a brand-new queue entry: no wait yet, carried boost included.
    pub(crate) fn baseline_score(
        &self,
        participant: pool::ParticipantId,
        ledger: &FairnessLedger,
        profile: &Profile,
    ) -> Result<f64, PoolError> {
        let snapshot = PoolSnapshot::load(self.store.as_ref())?;
        let nearby = snapshot.compatible_waiting(participant, profile, self.now());
        let breakdown = compute_score(
            &self.config.fairness,
            &FairnessInputs {
                wait: Duration::ZERO,
                ledger,
                profile,
                compatible_waiting: nearby,
            },
        );
        Ok(breakdown.total)
    }

    /// Recompute every queued score. Participants locked by someone else are
    /// skipped until the next call. Returns the number of scores raised.
    pub(crate) fn recompute_scores(&self) -> Result<usize, PoolError> {
        let snapshot = PoolSnapshot::load(self.store.as_ref())?;
        let ids: Vec<_> = snapshot.iter().map(|(entry, _)| entry.participant).collect();
        let mut raised = 0;
        for id in ids {
            if let Attempt::Done(true) = self.try_recompute(id, &snapshot)? {
                raised += 1;
            }
        }
        debug!(queued = snapshot.len(), raised, "scores_recomputed");
        Ok(raised)
    }

    pub(crate) fn recompute_one(&self, id: pool::ParticipantId) -> Result<bool, PoolError> {
        let snapshot = PoolSnapshot::load(self.store.as_ref())?;
        Ok(matches!(self.try_recompute(id, &snapshot)?, Attempt::Done(true)))
    }

    fn try_recompute(
        &self,
        id: pool::ParticipantId,
        snapshot: &PoolSnapshot,
    ) -> Result<Attempt<bool>, PoolError> {
        let Some(_guard) = self.locks.try_lock(id) else {
            return Ok(Attempt::Busy(id));
        };
        let Some(mut entry) = self.store.queue_entry(id)? else {
            return Ok(Attempt::Done(false));
        };
        let Some(participant) = self.store.participant(id)? else {
            return Ok(Attempt::Done(false));
        };
        if !is_pairable(&participant, self.now()) {
            return Ok(Attempt::Done(false));
        }

        let nearby = snapshot.compatible_waiting(id, &participant.profile, self.now());
        let computed = self.score_for(&entry, &participant.fairness, &participant.profile, nearby);
        if computed.total <= entry.score + SCORE_EPSILON {
            return Ok(Attempt::Done(false));
        }

        let before = entry.score;
        entry.score = computed.total;
        let after = entry.score;
        let mut batch = WriteBatch::new();
        batch.put_queue_entry(entry);
        self.store.apply(batch)?;

        self.emit(PoolEvent::ScoreChanged {
            participant: id,
            before,
            after,
            reason: ScoreReason::Recompute,
        });
        Ok(Attempt::Done(true))
    }

    /// Grant `amount` boost points. A queued participant's stored score rises
    /// by the granted amount immediately; otherwise the boost is carried into
    /// the next queue entry. Returns the points actually granted.
    pub(crate) fn try_boost(
        &self,
        id: pool::ParticipantId,
        amount: f64,
        reason: &BoostReason,
    ) -> Result<Attempt<f64>, PoolError> {
        let Some(_guard) = self.locks.try_lock(id) else {
            return Ok(Attempt::Busy(id));
        };
        let mut participant = self.require_participant(id)?;
        let granted = grant_boost(&self.config.fairness, &mut participant.fairness, amount);
        participant.updated_at = self.now();

        let mut batch = WriteBatch::new();
        let mut change = None;
        if let Some(mut entry) = self.store.queue_entry(id)? {
            let before = entry.score;
            entry.score += granted;
            change = Some((before, entry.score));
            batch.put_queue_entry(entry);
        }
        batch.put_participant(participant);
        self.store.apply(batch)?;

        info!(participant = %id, granted, reason = ?reason, "boost_granted");
        if let Some((before, after)) = change {
            self.emit(PoolEvent::ScoreChanged {
                participant: id,
                before,
                after,
                reason: ScoreReason::Boost(reason.clone()),
            });
        }
        Ok(Attempt::Done(granted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pool::{AgeRange, Gender};

    fn profile() -> Profile {
        Profile::new(Gender::Female, [Gender::Male], 30)
    }

    fn inputs<'a>(
        wait_secs: u64,
        ledger: &'a FairnessLedger,
        profile: &'a Profile,
    ) -> FairnessInputs<'a> {
        FairnessInputs {
            wait: Duration::from_secs(wait_secs),
            ledger,
            profile,
            compatible_waiting: 10,
        }
    }

    #[test]
    fn wait_term_is_capped() {
        let cfg = FairnessConfig::default();
        let ledger = FairnessLedger::default();
        let p = profile();
        assert_eq!(compute_score(&cfg, &inputs(45, &ledger, &p)).wait, 45.0);
        assert_eq!(compute_score(&cfg, &inputs(4_000, &ledger, &p)).wait, 120.0);
    }

    #[test]
    fn score_grows_with_wait() {
        let cfg = FairnessConfig::default();
        let ledger = FairnessLedger::default();
        let p = profile();
        let mut last = 0.0;
        for secs in [0, 1, 10, 60, 119, 120, 500] {
            let total = compute_score(&cfg, &inputs(secs, &ledger, &p)).total;
            assert!(total >= last, "score dropped at {secs}s");
            last = total;
        }
    }

    #[test]
    fn skip_penalty_and_boost_are_capped() {
        let cfg = FairnessConfig::default();
        let ledger = FairnessLedger {
            boost_points: 1_000.0,
            boost_events: 40,
            skips: 100,
        };
        let p = profile();
        let score = compute_score(&cfg, &inputs(0, &ledger, &p));
        assert_eq!(score.boost, 100.0);
        assert_eq!(score.skip_penalty, 30.0);
    }

    #[test]
    fn narrow_preferences_earn_a_bounded_bonus() {
        let cfg = FairnessConfig::default();
        let ledger = FairnessLedger::default();
        let broad = profile();
        let narrow = profile()
            .with_age_range(29, 31)
            .with_accepted_locales(["pt"]);
        let broad_score = compute_score(&cfg, &inputs(0, &ledger, &broad));
        let narrow_score = compute_score(&cfg, &inputs(0, &ledger, &narrow));
        assert!(narrow_score.narrowness > broad_score.narrowness);
        assert!(narrow_score.narrowness <= cfg.narrowness_cap);
    }

    #[test]
    fn inverted_age_range_scores_like_its_width() {
        let cfg = FairnessConfig::default();
        let ledger = FairnessLedger::default();
        let mut inverted = profile();
        inverted.age_range = AgeRange { min: 40, max: 20 };
        let ordered = profile().with_age_range(20, 40);
        assert_eq!(
            compute_score(&cfg, &inputs(0, &ledger, &inverted)).narrowness,
            compute_score(&cfg, &inputs(0, &ledger, &ordered)).narrowness
        );
    }

    #[test]
    fn low_density_bonus_applies_below_threshold() {
        let cfg = FairnessConfig::default();
        let ledger = FairnessLedger::default();
        let p = profile();
        let mut sparse = inputs(0, &ledger, &p);
        sparse.compatible_waiting = 1;
        assert_eq!(compute_score(&cfg, &sparse).low_density, 15.0);
        assert_eq!(compute_score(&cfg, &inputs(0, &ledger, &p)).low_density, 0.0);
    }

    #[test]
    fn grant_boost_respects_cap() {
        let cfg = FairnessConfig::default();
        let mut ledger = FairnessLedger::default();
        for _ in 0..4 {
            assert_eq!(grant_boost(&cfg, &mut ledger, 25.0), 25.0);
        }
        assert_eq!(grant_boost(&cfg, &mut ledger, 25.0), 0.0);
        assert_eq!(ledger.boost_points, 100.0);
        assert_eq!(ledger.boost_events, 5);
    }
}
