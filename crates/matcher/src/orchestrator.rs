//! Matching orchestrator.
//!
//! A pass tries Tier 1, then Tier 2 once the searcher has waited long enough,
//! then checks whether any gender-compatible counterpart is waiting at all
//! before falling back to Tier 3. `find_partner` keeps retrying Tier 3 with a
//! cancellation-aware sleep; `run_matching_cycle` does one pass per queued
//! participant and never sleeps.

use std::sync::Arc;
use std::time::Instant;

use pool::{clock, LifecycleState, Pairing, PairingId, Participant, ParticipantId, PoolEvent, QueueEntry, Tier, WriteBatch};
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, info, warn, Instrument};

use crate::engine::Engine;
use crate::error::PoolError;
use crate::metrics::metrics_recorder;
use crate::pairing::PairAttempt;
use crate::search::{is_pairable, Candidate, PoolSnapshot, TierPolicy};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum MatchOutcome {
    Paired(Pairing),
    /// Someone else's attempt paired this participant first.
    AlreadyPaired(PairingId),
    /// No gender-compatible counterpart is waiting; not an error.
    WaitingForPartner,
    NotQueued,
    /// The participant left or disconnected while the loop was running.
    Cancelled,
    /// Counterparts existed but every Tier 3 attempt lost a race.
    Exhausted { attempts: u32 },
}

/// Result of one orchestrator pass.
enum Pass {
    Finished(MatchOutcome),
    NoCounterpart,
    /// Counterparts exist but no attempt committed.
    Contended,
}

/// Result of walking one candidate list.
enum Walk {
    Paired(Pairing),
    SearcherGone,
    Unmatched,
}

enum Searcher {
    Ready(Box<(QueueEntry, Participant)>),
    Done(MatchOutcome),
}

impl Engine {
    pub(crate) async fn find_partner(&self, id: ParticipantId) -> Result<MatchOutcome, PoolError> {
        let span = tracing::info_span!("find_partner", participant = %id);
        let token = self.cancel_token(id);
        let outcome = self.find_partner_inner(id, &token).instrument(span).await;
        self.release_cancel_token(id, token);
        outcome
    }

    async fn find_partner_inner(
        &self,
        id: ParticipantId,
        token: &Arc<Notify>,
    ) -> Result<MatchOutcome, PoolError> {
        let mut snapshot = PoolSnapshot::load(self.store.as_ref())?;
        let (entry, participant) = match self.load_searcher(id)? {
            Searcher::Ready(ready) => *ready,
            Searcher::Done(outcome) => return Ok(outcome),
        };
        match self.single_pass(&participant, &entry, &mut snapshot)? {
            Pass::Finished(outcome) => return Ok(outcome),
            Pass::NoCounterpart => return Ok(MatchOutcome::WaitingForPartner),
            Pass::Contended => {}
        }

        let search = &self.config.search;
        let mut attempts = 1;
        while attempts < search.tier3_max_attempts {
            let woken = token.notified();
            tokio::select! {
                _ = tokio::time::sleep(search.tier3_retry_delay) => {}
                _ = woken => debug!(participant = %id, "find_partner_woken"),
            }
            attempts += 1;

            let participant = match self.load_searcher(id)? {
                Searcher::Ready(ready) => ready.1,
                Searcher::Done(MatchOutcome::NotQueued) => return Ok(MatchOutcome::Cancelled),
                Searcher::Done(outcome) => return Ok(outcome),
            };
            if attempts % search.recompute_every == 0 {
                self.recompute_one(id)?;
            }

            let snapshot = PoolSnapshot::load(self.store.as_ref())?;
            let counterparts = self.candidates(&participant, &TierPolicy::guaranteed(), &snapshot)?;
            if counterparts.is_empty() {
                return Ok(MatchOutcome::WaitingForPartner);
            }
            self.note_tier(id, Tier::Guaranteed)?;
            match self.walk(&participant, &counterparts, &TierPolicy::guaranteed())? {
                Walk::Paired(pairing) => return Ok(MatchOutcome::Paired(pairing)),
                Walk::SearcherGone => return self.searcher_outcome(id, true),
                Walk::Unmatched => {}
            }
        }

        warn!(participant = %id, attempts, "match_attempts_exhausted");
        self.emit(PoolEvent::MatchAnomaly {
            participant: id,
            attempts,
            detail: "tier 3 attempts exhausted while counterparts were waiting".into(),
        });
        Ok(MatchOutcome::Exhausted { attempts })
    }

    /// One pass for a participant that has just joined. Never sleeps;
    /// anything left unmatched is picked up by the cycle or `find_partner`.
    pub(crate) fn match_joined(&self, id: ParticipantId) -> Result<Option<Pairing>, PoolError> {
        let (entry, participant) = match self.load_searcher(id)? {
            Searcher::Ready(ready) => *ready,
            Searcher::Done(_) => return Ok(None),
        };
        let mut snapshot = PoolSnapshot::load(self.store.as_ref())?;
        match self.single_pass(&participant, &entry, &mut snapshot)? {
            Pass::Finished(MatchOutcome::Paired(pairing)) => {
                debug!(participant = %id, pairing = %pairing.id, tier = ?pairing.tier, "paired_on_join");
                Ok(Some(pairing))
            }
            _ => Ok(None),
        }
    }

    pub(crate) async fn run_matching_cycle(&self) -> Result<usize, PoolError> {
        let start = Instant::now();
        self.recompute_scores()?;

        let mut snapshot = PoolSnapshot::load(self.store.as_ref())?;
        let queued = snapshot.len();
        let mut created = 0;

        for id in snapshot.ordered_ids(&self.order) {
            let Some((entry, participant)) = snapshot.get(id).cloned() else {
                continue;
            };
            if !is_pairable(&participant, self.now()) {
                continue;
            }
            if let Pass::Finished(MatchOutcome::Paired(_)) =
                self.single_pass(&participant, &entry, &mut snapshot)?
            {
                created += 1;
            }
            tokio::task::yield_now().await;
        }

        let elapsed = start.elapsed();
        info!(
            queued,
            matches = created,
            elapsed_micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX),
            "matching_cycle"
        );
        if let Some(metrics) = metrics_recorder() {
            metrics.record_cycle(elapsed, queued, created);
        }
        Ok(created)
    }

    /// Tier 1, Tier 2 (when due), counterpart check, one Tier 3 attempt.
    /// Paired members are removed from `snapshot`.
    fn single_pass(
        &self,
        participant: &Participant,
        entry: &QueueEntry,
        snapshot: &mut PoolSnapshot,
    ) -> Result<Pass, PoolError> {
        let id = participant.id;
        let wait = clock::elapsed(entry.enqueued_at, self.now());

        let mut policies = vec![TierPolicy::exact()];
        if let Some(level) = self.config.search.widening_level(wait) {
            policies.push(TierPolicy::expanded(level, &self.config.search));
        }

        for policy in &policies {
            self.note_tier(id, policy.tier)?;
            let candidates = self.candidates(participant, policy, snapshot)?;
            if let Some(pass) = self.settle_walk(participant, &candidates, policy, snapshot)? {
                return Ok(pass);
            }
        }

        let guaranteed = TierPolicy::guaranteed();
        let counterparts = self.candidates(participant, &guaranteed, snapshot)?;
        if counterparts.is_empty() {
            debug!(participant = %id, "no_counterpart_waiting");
            return Ok(Pass::NoCounterpart);
        }
        self.note_tier(id, Tier::Guaranteed)?;
        if let Some(pass) = self.settle_walk(participant, &counterparts, &guaranteed, snapshot)? {
            return Ok(pass);
        }
        Ok(Pass::Contended)
    }

    fn settle_walk(
        &self,
        participant: &Participant,
        candidates: &[Candidate],
        policy: &TierPolicy,
        snapshot: &mut PoolSnapshot,
    ) -> Result<Option<Pass>, PoolError> {
        match self.walk(participant, candidates, policy)? {
            Walk::Paired(pairing) => {
                for member in pairing.pair.members() {
                    snapshot.remove(member);
                }
                Ok(Some(Pass::Finished(MatchOutcome::Paired(pairing))))
            }
            Walk::SearcherGone => {
                snapshot.remove(participant.id);
                Ok(Some(Pass::Finished(
                    self.searcher_outcome(participant.id, false)?,
                )))
            }
            Walk::Unmatched => Ok(None),
        }
    }

    /// Try candidates in order until one commits.
    fn walk(
        &self,
        participant: &Participant,
        candidates: &[Candidate],
        policy: &TierPolicy,
    ) -> Result<Walk, PoolError> {
        for candidate in candidates {
            match self.try_pair(participant.id, candidate.participant, policy)? {
                PairAttempt::Paired(pairing) => return Ok(Walk::Paired(pairing)),
                PairAttempt::RaceLost => {
                    if self.store.queue_entry(participant.id)?.is_none() {
                        return Ok(Walk::SearcherGone);
                    }
                }
                PairAttempt::Ineligible(rejection) => {
                    debug!(participant = %participant.id, rejection = ?rejection, "candidate_rejected");
                    if self.store.queue_entry(participant.id)?.is_none() {
                        return Ok(Walk::SearcherGone);
                    }
                }
                PairAttempt::LockConflict => {}
            }
        }
        Ok(Walk::Unmatched)
    }

    fn load_searcher(&self, id: ParticipantId) -> Result<Searcher, PoolError> {
        let participant = self.require_participant(id)?;
        let Some(entry) = self.store.queue_entry(id)? else {
            return Ok(Searcher::Done(self.searcher_outcome(id, false)?));
        };
        if participant.state == LifecycleState::SoftOffline {
            return Ok(Searcher::Done(MatchOutcome::WaitingForPartner));
        }
        if !is_pairable(&participant, self.now()) {
            return Ok(Searcher::Done(MatchOutcome::NotQueued));
        }
        Ok(Searcher::Ready(Box::new((entry, participant))))
    }

    /// Outcome for a searcher whose queue entry is gone.
    fn searcher_outcome(&self, id: ParticipantId, cancelled: bool) -> Result<MatchOutcome, PoolError> {
        Ok(match self.store.open_pairing_for(id)? {
            Some(pairing) => MatchOutcome::AlreadyPaired(pairing.id),
            None if cancelled => MatchOutcome::Cancelled,
            None => MatchOutcome::NotQueued,
        })
    }

    /// Record the highest tier attempted on the searcher's queue entry.
    fn note_tier(&self, id: ParticipantId, tier: Tier) -> Result<(), PoolError> {
        let Some(_guard) = self.locks.try_lock(id) else {
            return Ok(());
        };
        if let Some(mut entry) = self.store.queue_entry(id)? {
            if entry.tier < tier.as_u8() {
                entry.tier = tier.as_u8();
                let mut batch = WriteBatch::new();
                batch.put_queue_entry(entry);
                self.store.apply(batch)?;
            }
        }
        Ok(())
    }
}
