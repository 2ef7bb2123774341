//! Guardian sweep: idempotent reconciliation passes that run beside live
//! traffic.
//!
//! Every repair takes the affected identity locks with skip-on-conflict and
//! re-diagnoses after locking, so a pass never fights an in-flight operation
//! and running it twice is harmless. Each repair emits a
//! [`PoolEvent::Repair`] with before/after snapshots.

use std::time::Duration;

use chrono::{DateTime, Utc};
use pool::{
    clock, LifecycleEvent, LifecycleState, Pairing, PairingId, PairingStatus, Participant,
    ParticipantId, PoolEvent, RepairKind, VoteOutcome, WriteBatch,
};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::engine::{Attempt, Engine};
use crate::error::PoolError;
use crate::metrics::metrics_recorder;

/// Repairs made by one sweep, per pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GuardianReport {
    pub stale_pending: usize,
    pub expired_votes: usize,
    pub broken_pairings: usize,
    pub asymmetric_partners: usize,
    pub illegal_states: usize,
    pub orphan_entries: usize,
    /// Targets locked by someone else; retried next sweep.
    pub skipped: usize,
    /// Age of the oldest identity lock held when the sweep started.
    pub oldest_lock_hold: Option<Duration>,
}

impl GuardianReport {
    pub fn total(&self) -> usize {
        self.stale_pending
            + self.expired_votes
            + self.broken_pairings
            + self.asymmetric_partners
            + self.illegal_states
            + self.orphan_entries
    }
}

/// What is wrong with a single participant row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finding {
    /// `paired`/`voting` with refs that disagree with its open pairing.
    StaleRefs { pairing: PairingId, partner: ParticipantId },
    /// Partner refs on a participant that should have none.
    StrayRefs,
    /// `in-session` whose partner does not point back.
    OneSidedSession,
    /// State contradicts the stored facts; force to idle.
    Contradiction,
    CooldownElapsed,
}

impl Finding {
    fn kind(self) -> RepairKind {
        match self {
            Finding::StaleRefs { .. } | Finding::StrayRefs | Finding::OneSidedSession => {
                RepairKind::AsymmetricPartner
            }
            Finding::Contradiction | Finding::CooldownElapsed => RepairKind::IllegalState,
        }
    }
}

fn snapshot<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

impl Engine {
    pub(crate) fn guardian_sweep(&self) -> Result<GuardianReport, PoolError> {
        let span = tracing::info_span!("guardian_sweep");
        let _entered = span.enter();

        let mut report = GuardianReport {
            oldest_lock_hold: self.locks.oldest_hold(),
            ..GuardianReport::default()
        };
        let now = self.now();

        for pairing in self.store.open_pairings()? {
            if pairing.status == PairingStatus::Pending
                && clock::elapsed(pairing.created_at, now) >= self.config.guardian.pending_grace
            {
                tally(&mut report.stale_pending, &mut report.skipped, self.try_abandon_stale(pairing.id)?);
            } else if pairing.vote_expired(now) {
                tally(&mut report.expired_votes, &mut report.skipped, self.try_expire_vote(pairing.id)?);
            }
        }

        for pairing in self.store.open_pairings()? {
            tally(
                &mut report.broken_pairings,
                &mut report.skipped,
                self.try_repair_broken_pairing(pairing.id)?,
            );
        }

        for participant in self.store.participants()? {
            if self.diagnose(&participant, now)?.is_none() {
                continue;
            }
            match self.try_repair_participant(participant.id)? {
                Attempt::Done(Some(kind)) => match kind {
                    RepairKind::AsymmetricPartner => report.asymmetric_partners += 1,
                    _ => report.illegal_states += 1,
                },
                Attempt::Done(None) => {}
                Attempt::Busy(_) => report.skipped += 1,
            }
        }

        for entry in self.store.queue()? {
            tally(
                &mut report.orphan_entries,
                &mut report.skipped,
                self.try_remove_orphan(entry.participant)?,
            );
        }

        if report.total() > 0 {
            warn!(
                repairs = report.total(),
                stale_pending = report.stale_pending,
                expired_votes = report.expired_votes,
                broken_pairings = report.broken_pairings,
                asymmetric_partners = report.asymmetric_partners,
                illegal_states = report.illegal_states,
                orphan_entries = report.orphan_entries,
                "guardian_repairs"
            );
        }
        if let Some(metrics) = metrics_recorder() {
            metrics.record_repairs(&report);
        }
        Ok(report)
    }

    /// (a) A pairing whose vote window never opened within the grace period.
    fn try_abandon_stale(&self, pairing_id: PairingId) -> Result<Attempt<bool>, PoolError> {
        let Some(before) = self.store.pairing(pairing_id)? else {
            return Ok(Attempt::Done(false));
        };
        let Some(_guard) = self.locks.try_lock_pair(before.pair) else {
            return Ok(Attempt::Busy(before.pair.low()));
        };
        let Some(before) = self.store.pairing(pairing_id)? else {
            return Ok(Attempt::Done(false));
        };
        let now = self.now();
        if before.status != PairingStatus::Pending
            || clock::elapsed(before.created_at, now) < self.config.guardian.pending_grace
        {
            return Ok(Attempt::Done(false));
        }

        let outcome = self.end_pairing_locked(&before, VoteOutcome::Abandoned, &[], None, now)?;
        if outcome != VoteOutcome::Abandoned {
            return Ok(Attempt::Done(false));
        }
        self.report_pairing_repair(RepairKind::StalePending, &before)?;
        Ok(Attempt::Done(true))
    }

    /// (b) An expired vote window nobody resolved. Votes already cast still
    /// count; otherwise the idle-timeout outcome applies.
    fn try_expire_vote(&self, pairing_id: PairingId) -> Result<Attempt<bool>, PoolError> {
        let Some(before) = self.store.pairing(pairing_id)? else {
            return Ok(Attempt::Done(false));
        };
        if !before.vote_expired(self.now()) {
            return Ok(Attempt::Done(false));
        }
        match self.try_resolve(pairing_id)? {
            Attempt::Busy(id) => Ok(Attempt::Busy(id)),
            Attempt::Done(VoteOutcome::Pending) => Ok(Attempt::Done(false)),
            Attempt::Done(_) => {
                self.report_pairing_repair(RepairKind::ExpiredVote, &before)?;
                Ok(Attempt::Done(true))
            }
        }
    }

    /// (c) An open pairing one of whose members is no longer paired or voting.
    fn try_repair_broken_pairing(&self, pairing_id: PairingId) -> Result<Attempt<bool>, PoolError> {
        let Some(before) = self.store.pairing(pairing_id)? else {
            return Ok(Attempt::Done(false));
        };
        if !before.is_open() || !self.pairing_is_broken(&before)? {
            return Ok(Attempt::Done(false));
        }
        let Some(_guard) = self.locks.try_lock_pair(before.pair) else {
            return Ok(Attempt::Busy(before.pair.low()));
        };
        let Some(before) = self.store.pairing(pairing_id)? else {
            return Ok(Attempt::Done(false));
        };
        if !before.is_open() || !self.pairing_is_broken(&before)? {
            return Ok(Attempt::Done(false));
        }

        let outcome = self.end_pairing_locked(&before, VoteOutcome::Abandoned, &[], None, self.now())?;
        if outcome != VoteOutcome::Abandoned {
            return Ok(Attempt::Done(false));
        }
        self.report_pairing_repair(RepairKind::AsymmetricPartner, &before)?;
        Ok(Attempt::Done(true))
    }

    fn pairing_is_broken(&self, pairing: &Pairing) -> Result<bool, PoolError> {
        for id in pairing.pair.members() {
            let engaged = self
                .store
                .participant(id)?
                .is_some_and(|member| member.effective_state().requires_pairing());
            if !engaged {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn report_pairing_repair(&self, kind: RepairKind, before: &Pairing) -> Result<(), PoolError> {
        let after = self.store.pairing(before.id)?;
        info!(pairing = %before.id, kind = kind.as_str(), "pairing_repaired");
        self.emit(PoolEvent::Repair {
            kind,
            participant: None,
            pairing: Some(before.id),
            before: snapshot(before),
            after: snapshot(&after),
        });
        Ok(())
    }

    /// (c)/(d) for one participant row.
    fn diagnose(
        &self,
        participant: &Participant,
        now: DateTime<Utc>,
    ) -> Result<Option<Finding>, PoolError> {
        let id = participant.id;
        let has_refs = participant.partner.is_some() || participant.pairing.is_some();

        let finding = match participant.effective_state() {
            LifecycleState::Paired | LifecycleState::Voting => {
                match self.store.open_pairing_for(id)? {
                    None => Some(Finding::Contradiction),
                    Some(pairing) => {
                        let partner = pairing.pair.other(id);
                        match partner {
                            Some(partner)
                                if participant.pairing != Some(pairing.id)
                                    || participant.partner != Some(partner) =>
                            {
                                Some(Finding::StaleRefs {
                                    pairing: pairing.id,
                                    partner,
                                })
                            }
                            _ => None,
                        }
                    }
                }
            }
            LifecycleState::InSession => match participant.partner {
                None => Some(Finding::Contradiction),
                Some(partner) => {
                    let reciprocal = self.store.participant(partner)?.is_some_and(|other| {
                        other.partner == Some(id)
                            && other.effective_state() == LifecycleState::InSession
                    });
                    (!reciprocal).then_some(Finding::OneSidedSession)
                }
            },
            LifecycleState::Waiting => {
                if self.store.queue_entry(id)?.is_none() {
                    Some(Finding::Contradiction)
                } else if has_refs {
                    Some(Finding::StrayRefs)
                } else {
                    None
                }
            }
            LifecycleState::CoolingDown if !participant.is_cooling_down(now) => {
                Some(Finding::CooldownElapsed)
            }
            LifecycleState::Idle
            | LifecycleState::Ended
            | LifecycleState::Offline
            | LifecycleState::CoolingDown
            | LifecycleState::SoftOffline => has_refs.then_some(Finding::StrayRefs),
        };
        Ok(finding)
    }

    fn try_repair_participant(&self, id: ParticipantId) -> Result<Attempt<Option<RepairKind>>, PoolError> {
        let Some(_guard) = self.locks.try_lock(id) else {
            return Ok(Attempt::Busy(id));
        };
        let Some(before) = self.store.participant(id)? else {
            return Ok(Attempt::Done(None));
        };
        let now = self.now();
        let Some(finding) = self.diagnose(&before, now)? else {
            return Ok(Attempt::Done(None));
        };

        let mut after = before.clone();
        let mut batch = WriteBatch::new();
        match finding {
            Finding::StaleRefs { pairing, partner } => {
                after.pairing = Some(pairing);
                after.partner = Some(partner);
            }
            Finding::StrayRefs => after.clear_partner(),
            Finding::OneSidedSession | Finding::Contradiction => {
                self.apply_event(&mut after, LifecycleEvent::ForceIdle)?;
                after.clear_partner();
                batch.remove_queue_entry(id);
            }
            Finding::CooldownElapsed => {
                self.apply_event(&mut after, LifecycleEvent::CooldownExpired)?;
                after.cooldown_until = None;
            }
        }
        after.updated_at = now;
        batch.put_participant(after.clone());
        self.store.apply(batch)?;

        let kind = finding.kind();
        info!(participant = %id, kind = kind.as_str(), finding = ?finding, "participant_repaired");
        self.emit(PoolEvent::Repair {
            kind,
            participant: Some(id),
            pairing: before.pairing,
            before: snapshot(&before),
            after: snapshot(&after),
        });
        Ok(Attempt::Done(Some(kind)))
    }

    /// Queue entries whose owner is missing or not waiting.
    fn try_remove_orphan(&self, id: ParticipantId) -> Result<Attempt<bool>, PoolError> {
        let is_orphan = |owner: Option<&Participant>| {
            owner.map_or(true, |p| p.effective_state() != LifecycleState::Waiting)
        };
        if !is_orphan(self.store.participant(id)?.as_ref()) {
            return Ok(Attempt::Done(false));
        }
        let Some(_guard) = self.locks.try_lock(id) else {
            return Ok(Attempt::Busy(id));
        };
        let Some(entry) = self.store.queue_entry(id)? else {
            return Ok(Attempt::Done(false));
        };
        let owner = self.store.participant(id)?;
        if !is_orphan(owner.as_ref()) {
            return Ok(Attempt::Done(false));
        }

        let mut batch = WriteBatch::new();
        batch.remove_queue_entry(id);
        self.store.apply(batch)?;

        info!(participant = %id, "orphan_queue_entry_removed");
        self.emit(PoolEvent::Repair {
            kind: RepairKind::OrphanQueueEntry,
            participant: Some(id),
            pairing: None,
            before: snapshot(&entry),
            after: Value::Null,
        });
        Ok(Attempt::Done(true))
    }
}

fn tally(count: &mut usize, skipped: &mut usize, attempt: Attempt<bool>) {
    match attempt {
        Attempt::Done(true) => *count += 1,
        Attempt::Done(false) => {}
        Attempt::Busy(_) => *skipped += 1,
    }
}
