//! Atomic pairing of two queued participants.
//!
//! Both identity locks are taken (lower id first) without waiting; every
//! precondition is then re-checked against the store, because the candidate
//! list the caller worked from may already be stale. Only then are the two
//! commit batches written. The store's one-open-pairing constraint is the
//! last line of defence and surfaces as [`PairAttempt::RaceLost`].

use chrono::{DateTime, Utc};
use pool::{
    clock, LeaveReason, LifecycleEvent, LifecycleState, PairKey, Pairing, PairingStatus,
    Participant, ParticipantId, PoolEvent, StoreError, WriteBatch,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::error::PoolError;
use crate::metrics::metrics_recorder;
use crate::search::{compatible, TierPolicy};

/// Why a pairing was refused after re-validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "participant", rename_all = "snake_case")]
pub enum PairRejection {
    SelfPair,
    Unknown(ParticipantId),
    Offline(ParticipantId),
    CoolingDown(ParticipantId),
    NotWaiting(ParticipantId),
    Blocklisted,
    Incompatible,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PairAttempt {
    Paired(Pairing),
    /// One of the identities was locked; try the next candidate.
    LockConflict,
    /// Someone else paired (or dequeued) one of the two first.
    RaceLost,
    Ineligible(PairRejection),
}

impl PairAttempt {
    pub fn pairing(&self) -> Option<&Pairing> {
        match self {
            PairAttempt::Paired(pairing) => Some(pairing),
            _ => None,
        }
    }
}

impl Engine {
    pub(crate) fn try_pair(
        &self,
        a: ParticipantId,
        b: ParticipantId,
        policy: &TierPolicy,
    ) -> Result<PairAttempt, PoolError> {
        let Some(pair) = PairKey::new(a, b) else {
            return Ok(PairAttempt::Ineligible(PairRejection::SelfPair));
        };
        let Some(_guard) = self.locks.try_lock_pair(pair) else {
            debug!(low = %pair.low(), high = %pair.high(), "pair_lock_conflict");
            return Ok(PairAttempt::LockConflict);
        };
        let now = self.now();

        let mut members = Vec::with_capacity(2);
        for id in pair.members() {
            match self.revalidate(id, now)? {
                Ok(participant) => members.push(participant),
                Err(verdict) => return Ok(verdict),
            }
        }
        if self.store.is_blocked(pair)? {
            return Ok(PairAttempt::Ineligible(PairRejection::Blocklisted));
        }
        if !compatible(&members[0].profile, &members[1].profile, policy) {
            return Ok(PairAttempt::Ineligible(PairRejection::Incompatible));
        }

        let mut pairing = Pairing::pending(pair, policy.tier, now);
        match self.commit_pending(&pairing, &mut members, now) {
            Ok(()) => {}
            Err(PoolError::Storage(StoreError::Constraint(msg))) => {
                debug!(pairing = %pairing.id, detail = %msg, "pair_race_lost");
                return Ok(PairAttempt::RaceLost);
            }
            Err(err) => return Err(err),
        }
        self.open_vote_window(&mut pairing, &mut members, now)?;

        info!(
            pairing = %pairing.id,
            low = %pair.low(),
            high = %pair.high(),
            tier = ?policy.tier,
            "pair_committed"
        );
        for id in pair.members() {
            self.emit(PoolEvent::Left {
                participant: id,
                reason: LeaveReason::Paired,
            });
            self.signal_cancel(id);
        }
        self.emit(PoolEvent::Paired {
            pairing: pairing.id,
            low: pair.low(),
            high: pair.high(),
            tier: policy.tier,
        });
        if let Some(expires_at) = pairing.vote_expires_at {
            self.emit(PoolEvent::VoteWindowOpened {
                pairing: pairing.id,
                expires_at,
            });
        }
        if let Some(metrics) = metrics_recorder() {
            metrics.record_pairing(policy.tier);
        }
        Ok(PairAttempt::Paired(pairing))
    }

    /// Re-read a locked member and decide whether it can still be paired.
    fn revalidate(
        &self,
        id: ParticipantId,
        now: DateTime<Utc>,
    ) -> Result<Result<Participant, PairAttempt>, PoolError> {
        let Some(participant) = self.store.participant(id)? else {
            return Ok(Err(PairAttempt::Ineligible(PairRejection::Unknown(id))));
        };
        if participant.pairing.is_some()
            || participant.effective_state().requires_pairing()
            || self.store.open_pairing_for(id)?.is_some()
        {
            return Ok(Err(PairAttempt::RaceLost));
        }
        if !participant.online {
            return Ok(Err(PairAttempt::Ineligible(PairRejection::Offline(id))));
        }
        if participant.is_cooling_down(now) {
            return Ok(Err(PairAttempt::Ineligible(PairRejection::CoolingDown(id))));
        }
        if participant.state != LifecycleState::Waiting {
            return Ok(Err(PairAttempt::Ineligible(PairRejection::NotWaiting(id))));
        }
        if self.store.queue_entry(id)?.is_none() {
            return Ok(Err(PairAttempt::RaceLost));
        }
        Ok(Ok(participant))
    }

    /// Batch 1: pending pairing, both members `paired`, queue slots consumed,
    /// fairness ledgers reset.
    fn commit_pending(
        &self,
        pairing: &Pairing,
        members: &mut [Participant],
        now: DateTime<Utc>,
    ) -> Result<(), PoolError> {
        let mut batch = WriteBatch::new();
        batch.insert_pairing(pairing.clone());
        for member in members.iter_mut() {
            self.apply_event(member, LifecycleEvent::Matched)?;
            member.partner = pairing.pair.other(member.id);
            member.pairing = Some(pairing.id);
            member.fairness.reset();
            member.updated_at = now;
            batch.remove_queue_entry(member.id);
            batch.put_participant(member.clone());
        }
        self.store.apply(batch)?;
        Ok(())
    }

    /// Batch 2: vote window open, both members `voting`.
    fn open_vote_window(
        &self,
        pairing: &mut Pairing,
        members: &mut [Participant],
        now: DateTime<Utc>,
    ) -> Result<(), PoolError> {
        pairing.status = PairingStatus::VoteActive;
        pairing.vote_opened_at = Some(now);
        pairing.vote_expires_at = Some(clock::offset(now, self.config.vote.vote_window));

        let mut batch = WriteBatch::new();
        batch.update_pairing(pairing.clone());
        for member in members.iter_mut() {
            self.apply_event(member, LifecycleEvent::VoteWindowOpened)?;
            member.updated_at = now;
            batch.put_participant(member.clone());
        }
        if let Err(err) = self.store.apply(batch) {
            warn!(pairing = %pairing.id, error = %err, "vote_window_open_failed");
            return Err(err.into());
        }
        Ok(())
    }
}
