//! Vote resolution.
//!
//! A vote is persisted under the voter's lock, then both votes are re-read
//! with a short bounded retry so a partner vote committed a moment earlier is
//! not missed. Resolution takes both locks and compare-and-sets the pairing
//! from `vote-active` to `ended`; whoever loses that race just reports the
//! stored outcome.

use chrono::{DateTime, Utc};
use pool::{
    BlockEntry, BlockReason, BoostReason, LifecycleEvent, LifecycleState, Pairing, PairingId,
    PairingStatus, Participant, ParticipantId, PoolEvent, ScoreReason, StoreError, Vote,
    VoteChoice, VoteOutcome, WriteBatch,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::engine::{Attempt, Engine};
use crate::error::PoolError;
use crate::fairness::grant_boost;
use crate::metrics::metrics_recorder;
use crate::retry::{execute_with_retry_async, RetryConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteReport {
    pub outcome: VoteOutcome,
    /// `true` once the pairing has ended.
    pub completed: bool,
}

impl VoteReport {
    fn from_outcome(outcome: VoteOutcome) -> Self {
        Self {
            outcome,
            completed: outcome.is_final(),
        }
    }

    fn pending() -> Self {
        Self::from_outcome(VoteOutcome::Pending)
    }
}

/// Outcome implied by the recorded votes, if both are in.
pub fn decide(votes: &[Vote], pairing: &Pairing) -> Option<VoteOutcome> {
    let choice_of = |id: ParticipantId| votes.iter().find(|v| v.voter == id).map(|v| v.choice);
    let low = choice_of(pairing.pair.low())?;
    let high = choice_of(pairing.pair.high())?;
    Some(match (low, high) {
        (VoteChoice::Accept, VoteChoice::Accept) => VoteOutcome::MutualAccept,
        (VoteChoice::Decline, VoteChoice::Decline) => VoteOutcome::MutualDecline,
        _ => VoteOutcome::Split,
    })
}

/// What the read-after-write loop observed.
enum Observed {
    Decided,
    Ended(VoteOutcome),
}

enum ReadMiss {
    Incomplete,
    Failed(StoreError),
}

impl Engine {
    pub(crate) async fn submit_vote(
        &self,
        voter: ParticipantId,
        pairing_id: PairingId,
        choice: VoteChoice,
    ) -> Result<VoteReport, PoolError> {
        let pairing = self
            .store
            .pairing(pairing_id)?
            .ok_or(PoolError::UnknownPairing(pairing_id))?;
        if !pairing.pair.contains(voter) {
            return Err(PoolError::NotAMember {
                participant: voter,
                pairing: pairing_id,
            });
        }
        match pairing.status {
            PairingStatus::Ended => return Ok(ended_report(&pairing)),
            PairingStatus::Pending => return Err(PoolError::VoteWindowNotOpen(pairing_id)),
            PairingStatus::VoteActive => {}
        }
        if pairing.vote_expired(self.now()) {
            debug!(pairing = %pairing_id, "vote_after_expiry");
            return self.resolve_with_retry(pairing_id).await;
        }

        let recorded = self
            .with_lock_retry(|| self.try_record_vote(voter, pairing_id, choice))
            .await?;
        if let Some(report) = recorded {
            return Ok(report);
        }

        let read_policy = RetryConfig::fixed(self.config.vote.read_retries, self.config.vote.read_delay);
        let observed = execute_with_retry_async(&read_policy, |_| {
            let step = self.observe_votes(pairing_id);
            std::future::ready(step)
        })
        .await;

        match observed.into_result() {
            Ok(Observed::Ended(outcome)) => Ok(VoteReport::from_outcome(outcome)),
            Ok(Observed::Decided) => self.resolve_with_retry(pairing_id).await,
            Err(ReadMiss::Failed(err)) => Err(err.into()),
            Err(ReadMiss::Incomplete) => {
                debug!(pairing = %pairing_id, voter = %voter, "vote_waiting_for_partner");
                Ok(VoteReport::pending())
            }
        }
    }

    /// Persist a vote. `Some(report)` short-circuits when the pairing ended
    /// while the lock was being acquired.
    fn try_record_vote(
        &self,
        voter: ParticipantId,
        pairing_id: PairingId,
        choice: VoteChoice,
    ) -> Result<Attempt<Option<VoteReport>>, PoolError> {
        let Some(_guard) = self.locks.try_lock(voter) else {
            return Ok(Attempt::Busy(voter));
        };
        let pairing = self
            .store
            .pairing(pairing_id)?
            .ok_or(PoolError::UnknownPairing(pairing_id))?;
        if pairing.status == PairingStatus::Ended {
            return Ok(Attempt::Done(Some(ended_report(&pairing))));
        }

        let mut batch = WriteBatch::new();
        batch.put_vote(Vote {
            pairing: pairing_id,
            voter,
            choice,
            cast_at: self.now(),
        });
        self.store.apply(batch)?;

        info!(pairing = %pairing_id, voter = %voter, choice = ?choice, "vote_recorded");
        self.emit(PoolEvent::VoteRecorded {
            pairing: pairing_id,
            voter,
            choice,
        });
        Ok(Attempt::Done(None))
    }

    fn observe_votes(&self, pairing_id: PairingId) -> Result<Observed, ReadMiss> {
        let pairing = self
            .store
            .pairing(pairing_id)
            .map_err(ReadMiss::Failed)?
            .ok_or(ReadMiss::Incomplete)?;
        if pairing.status == PairingStatus::Ended {
            return Ok(Observed::Ended(pairing.outcome.unwrap_or(VoteOutcome::Pending)));
        }
        let votes = self.store.votes(pairing_id).map_err(ReadMiss::Failed)?;
        match decide(&votes, &pairing) {
            Some(_) => Ok(Observed::Decided),
            None => Err(ReadMiss::Incomplete),
        }
    }

    /// Resolve with bounded lock retries. Still contended afterwards means
    /// another resolver (or the guardian) holds the pair; report pending.
    async fn resolve_with_retry(&self, pairing_id: PairingId) -> Result<VoteReport, PoolError> {
        match self.with_lock_retry(|| self.try_resolve(pairing_id)).await {
            Ok(outcome) => Ok(VoteReport::from_outcome(outcome)),
            Err(PoolError::LockConflict(id)) => {
                debug!(pairing = %pairing_id, participant = %id, "vote_resolution_deferred");
                Ok(VoteReport::pending())
            }
            Err(err) => Err(err),
        }
    }

    /// Resolve a vote-active pairing if its votes are in or its window has
    /// expired. Returns `Pending` when neither holds.
    pub(crate) fn try_resolve(&self, pairing_id: PairingId) -> Result<Attempt<VoteOutcome>, PoolError> {
        let pairing = self
            .store
            .pairing(pairing_id)?
            .ok_or(PoolError::UnknownPairing(pairing_id))?;
        let Some(_guard) = self.locks.try_lock_pair(pairing.pair) else {
            return Ok(Attempt::Busy(pairing.pair.low()));
        };

        let pairing = self
            .store
            .pairing(pairing_id)?
            .ok_or(PoolError::UnknownPairing(pairing_id))?;
        match pairing.status {
            PairingStatus::Ended => {
                return Ok(Attempt::Done(pairing.outcome.unwrap_or(VoteOutcome::Pending)))
            }
            PairingStatus::Pending => return Ok(Attempt::Done(VoteOutcome::Pending)),
            PairingStatus::VoteActive => {}
        }

        let now = self.now();
        let votes = self.store.votes(pairing_id)?;
        let outcome = match decide(&votes, &pairing) {
            Some(outcome) => outcome,
            None if pairing.vote_expired(now) => VoteOutcome::IdleTimeout,
            None => return Ok(Attempt::Done(VoteOutcome::Pending)),
        };

        self.end_pairing_locked(&pairing, outcome, &votes, None, now)
            .map(Attempt::Done)
    }

    /// End `pairing` with `outcome` and apply its effects to both members
    /// (except `skip`, whose own teardown the caller handles). Both locks
    /// must be held. Returns the outcome actually stored, which differs from
    /// `outcome` when another resolver won the compare-and-set.
    pub(crate) fn end_pairing_locked(
        &self,
        pairing: &Pairing,
        outcome: VoteOutcome,
        votes: &[Vote],
        skip: Option<ParticipantId>,
        now: DateTime<Utc>,
    ) -> Result<VoteOutcome, PoolError> {
        let mut batch = WriteBatch::new();
        batch.end_pairing(pairing.id, pairing.status, outcome, now);
        let events = self.settle(pairing, outcome, votes, skip, now, &mut batch)?;
        self.commit_resolution(pairing, outcome, batch, events)
    }

    /// Stage both members' effects of `outcome` into `batch`.
    pub(crate) fn settle(
        &self,
        pairing: &Pairing,
        outcome: VoteOutcome,
        votes: &[Vote],
        skip: Option<ParticipantId>,
        now: DateTime<Utc>,
        batch: &mut WriteBatch,
    ) -> Result<Vec<PoolEvent>, PoolError> {
        let mut events = vec![PoolEvent::VoteResolved {
            pairing: pairing.id,
            outcome,
        }];

        for id in pairing.pair.members() {
            if Some(id) == skip {
                continue;
            }
            let Some(mut member) = self.store.participant(id)? else {
                continue;
            };
            if member.pairing != Some(pairing.id) || !member.effective_state().requires_pairing() {
                warn!(pairing = %pairing.id, participant = %id, "member_does_not_reference_pairing");
                continue;
            }
            let own = votes.iter().find(|v| v.voter == id).map(|v| v.choice);
            self.settle_member(&mut member, outcome, own, now, batch, &mut events)?;
            member.updated_at = now;
            batch.put_participant(member);
        }

        if let Some(reason) = BlockReason::for_outcome(outcome) {
            batch.insert_block(BlockEntry {
                pair: pairing.pair,
                reason,
                created_at: now,
            });
            events.push(PoolEvent::Blocklisted {
                low: pairing.pair.low(),
                high: pairing.pair.high(),
                reason,
            });
        }
        if outcome == VoteOutcome::MutualAccept {
            events.push(PoolEvent::SessionStarted {
                pairing: pairing.id,
                participants: pairing.pair.members(),
            });
        }
        Ok(events)
    }

    fn settle_member(
        &self,
        member: &mut Participant,
        outcome: VoteOutcome,
        own: Option<VoteChoice>,
        now: DateTime<Utc>,
        batch: &mut WriteBatch,
        events: &mut Vec<PoolEvent>,
    ) -> Result<(), PoolError> {
        let accepted = own == Some(VoteChoice::Accept);
        match outcome {
            VoteOutcome::MutualAccept => {
                self.apply_event(member, LifecycleEvent::MutualAccept)?;
            }
            VoteOutcome::Split if accepted => {
                self.requeue_locked(member, Some(BoostReason::AcceptedInSplit), now, batch, events)?;
            }
            VoteOutcome::Split => {
                member.fairness.skips = member.fairness.skips.saturating_add(1);
                self.release_locked(member)?;
            }
            VoteOutcome::IdleTimeout if accepted => {
                self.requeue_locked(member, Some(BoostReason::AcceptedBeforeTimeout), now, batch, events)?;
            }
            VoteOutcome::PartnerDisconnected => {
                let boost = accepted.then_some(BoostReason::PartnerDisconnected);
                self.requeue_locked(member, boost, now, batch, events)?;
            }
            VoteOutcome::MutualDecline
            | VoteOutcome::IdleTimeout
            | VoteOutcome::Abandoned
            | VoteOutcome::Pending => {
                self.release_locked(member)?;
            }
        }
        Ok(())
    }

    /// Leave the pairing for `idle`.
    fn release_locked(&self, member: &mut Participant) -> Result<(), PoolError> {
        self.apply_event(member, LifecycleEvent::Release)?;
        member.clear_partner();
        Ok(())
    }

    /// Put a locked member back in the pool, optionally boosted. Members that
    /// are offline or soft-offline go idle instead.
    pub(crate) fn requeue_locked(
        &self,
        member: &mut Participant,
        boost: Option<BoostReason>,
        now: DateTime<Utc>,
        batch: &mut WriteBatch,
        events: &mut Vec<PoolEvent>,
    ) -> Result<(), PoolError> {
        if let Some(reason) = &boost {
            let granted = grant_boost(
                &self.config.fairness,
                &mut member.fairness,
                self.config.fairness.boost_increment,
            );
            debug!(participant = %member.id, granted, reason = ?reason, "boost_granted");
        }

        if !member.online || member.state == LifecycleState::SoftOffline {
            return self.release_locked(member);
        }

        member.clear_partner();
        match member.state {
            LifecycleState::Voting => {
                self.apply_event(member, LifecycleEvent::Requeue)?;
            }
            _ => {
                self.apply_event(member, LifecycleEvent::Release)?;
                self.apply_event(member, LifecycleEvent::Join)?;
            }
        }
        let score = self.baseline_score(member.id, &member.fairness, &member.profile)?;
        batch.put_queue_entry(pool::QueueEntry::new(member.id, score, now));

        events.push(PoolEvent::Requeued {
            participant: member.id,
            boosted: boost.is_some(),
        });
        events.push(PoolEvent::ScoreChanged {
            participant: member.id,
            before: 0.0,
            after: score,
            reason: boost.map_or(ScoreReason::Enqueued, ScoreReason::Boost),
        });
        Ok(())
    }

    fn commit_resolution(
        &self,
        pairing: &Pairing,
        outcome: VoteOutcome,
        batch: WriteBatch,
        events: Vec<PoolEvent>,
    ) -> Result<VoteOutcome, PoolError> {
        match self.store.apply(batch) {
            Ok(()) => {}
            Err(StoreError::Constraint(detail)) => {
                debug!(pairing = %pairing.id, detail = %detail, "resolution_lost_race");
                let stored = self
                    .store
                    .pairing(pairing.id)?
                    .and_then(|p| p.outcome)
                    .unwrap_or(VoteOutcome::Pending);
                return Ok(stored);
            }
            Err(err) => return Err(err.into()),
        }

        info!(pairing = %pairing.id, outcome = ?outcome, "pairing_resolved");
        for event in events {
            self.emit(event);
        }
        if let Some(metrics) = metrics_recorder() {
            metrics.record_vote(outcome);
        }
        Ok(outcome)
    }

    pub(crate) fn try_end_session(&self, pairing_id: PairingId) -> Result<Attempt<bool>, PoolError> {
        let pairing = self
            .store
            .pairing(pairing_id)?
            .ok_or(PoolError::UnknownPairing(pairing_id))?;
        if pairing.outcome != Some(VoteOutcome::MutualAccept) {
            return Ok(Attempt::Done(false));
        }
        let Some(_guard) = self.locks.try_lock_pair(pairing.pair) else {
            return Ok(Attempt::Busy(pairing.pair.low()));
        };

        let now = self.now();
        let mut batch = WriteBatch::new();
        for id in pairing.pair.members() {
            let Some(mut member) = self.store.participant(id)? else {
                continue;
            };
            if member.pairing != Some(pairing_id)
                || member.effective_state() != LifecycleState::InSession
            {
                continue;
            }
            self.apply_event(&mut member, LifecycleEvent::SessionEnded)?;
            member.clear_partner();
            member.updated_at = now;
            batch.put_participant(member);
        }
        if batch.is_empty() {
            return Ok(Attempt::Done(false));
        }
        self.store.apply(batch)?;

        info!(pairing = %pairing_id, "session_ended");
        self.emit(PoolEvent::SessionEnded {
            pairing: pairing_id,
        });
        Ok(Attempt::Done(true))
    }
}

fn ended_report(pairing: &Pairing) -> VoteReport {
    VoteReport {
        outcome: pairing.outcome.unwrap_or(VoteOutcome::Pending),
        completed: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pool::{PairKey, Tier};

    fn pairing() -> Pairing {
        let pair = PairKey::new(ParticipantId::new(), ParticipantId::new()).unwrap();
        Pairing::pending(pair, Tier::Exact, Utc::now())
    }

    fn vote(pairing: &Pairing, voter: ParticipantId, choice: VoteChoice) -> Vote {
        Vote {
            pairing: pairing.id,
            voter,
            choice,
            cast_at: Utc::now(),
        }
    }

    #[test]
    fn decide_covers_the_outcome_table() {
        let p = pairing();
        let (low, high) = (p.pair.low(), p.pair.high());
        use VoteChoice::{Accept, Decline};

        let cases = [
            (Accept, Accept, VoteOutcome::MutualAccept),
            (Accept, Decline, VoteOutcome::Split),
            (Decline, Accept, VoteOutcome::Split),
            (Decline, Decline, VoteOutcome::MutualDecline),
        ];
        for (a, b, expected) in cases {
            let votes = [vote(&p, low, a), vote(&p, high, b)];
            assert_eq!(decide(&votes, &p), Some(expected));
        }
    }

    #[test]
    fn one_vote_is_undecided() {
        let p = pairing();
        let votes = [vote(&p, p.pair.low(), VoteChoice::Accept)];
        assert_eq!(decide(&votes, &p), None);
    }
}
