//! Eligibility gate: `join` and `leave`.

use std::fmt;

use chrono::{DateTime, Utc};
use pool::{
    LeaveReason, LifecycleEvent, LifecycleState, Participant, ParticipantId, PoolEvent,
    QueueEntry, ScoreReason, WriteBatch,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::engine::{Attempt, Engine};
use crate::error::PoolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum IneligibleReason {
    Unknown,
    Offline,
    SoftOffline,
    CoolingDown { until: DateTime<Utc> },
    AlreadyPaired,
    InSession,
}

impl fmt::Display for IneligibleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => f.write_str("unknown"),
            Self::Offline => f.write_str("offline"),
            Self::SoftOffline => f.write_str("soft_offline"),
            Self::CoolingDown { until } => write!(f, "cooling_down_until_{}", until.to_rfc3339()),
            Self::AlreadyPaired => f.write_str("already_paired"),
            Self::InSession => f.write_str("in_session"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Eligibility {
    Eligible,
    Ineligible(IneligibleReason),
}

impl Eligibility {
    pub fn is_eligible(&self) -> bool {
        matches!(self, Eligibility::Eligible)
    }
}

/// Whether `participant` may enter the pool at `now`.
///
/// An expired cooldown counts as eligible; the caller moves the participant
/// out of `cooling-down` before joining.
pub fn check(participant: &Participant, now: DateTime<Utc>) -> Eligibility {
    use IneligibleReason as R;

    if !participant.online || participant.state == LifecycleState::Offline {
        return Eligibility::Ineligible(R::Offline);
    }
    if participant.state == LifecycleState::SoftOffline {
        return Eligibility::Ineligible(R::SoftOffline);
    }
    if let Some(until) = participant.cooldown_until.filter(|until| *until > now) {
        return Eligibility::Ineligible(R::CoolingDown { until });
    }
    match participant.state {
        LifecycleState::Paired | LifecycleState::Voting => Eligibility::Ineligible(R::AlreadyPaired),
        LifecycleState::InSession => Eligibility::Ineligible(R::InSession),
        _ => Eligibility::Eligible,
    }
}

impl Engine {
    pub(crate) fn eligibility(&self, id: ParticipantId) -> Result<Eligibility, PoolError> {
        Ok(match self.store.participant(id)? {
            Some(participant) => check(&participant, self.now()),
            None => Eligibility::Ineligible(IneligibleReason::Unknown),
        })
    }

    pub(crate) fn try_join(&self, id: ParticipantId) -> Result<Attempt<bool>, PoolError> {
        let Some(_guard) = self.locks.try_lock(id) else {
            return Ok(Attempt::Busy(id));
        };
        let now = self.now();

        let Some(mut participant) = self.store.participant(id)? else {
            self.reject_join(id, IneligibleReason::Unknown);
            return Ok(Attempt::Done(false));
        };

        if participant.state == LifecycleState::Waiting {
            if let Some(mut entry) = self.store.queue_entry(id)? {
                entry.enqueued_at = now;
                let mut batch = WriteBatch::new();
                batch.put_queue_entry(entry);
                self.store.apply(batch)?;
                debug!(participant = %id, "join_refreshed");
                self.emit(PoolEvent::Joined {
                    participant: id,
                    refreshed: true,
                });
                return Ok(Attempt::Done(true));
            }
        }

        let mut batch = WriteBatch::new();
        if participant.state == LifecycleState::CoolingDown && !participant.is_cooling_down(now) {
            self.apply_event(&mut participant, LifecycleEvent::CooldownExpired)?;
            participant.cooldown_until = None;
            participant.updated_at = now;
            batch.put_participant(participant.clone());
        }

        if let Eligibility::Ineligible(reason) = check(&participant, now) {
            if !batch.is_empty() {
                self.store.apply(batch)?;
            }
            self.reject_join(id, reason);
            return Ok(Attempt::Done(false));
        }

        let score = self.enqueue_locked(&mut participant, now, &mut batch)?;
        self.store.apply(batch)?;

        info!(participant = %id, score, "joined");
        self.emit(PoolEvent::Joined {
            participant: id,
            refreshed: false,
        });
        self.emit(PoolEvent::ScoreChanged {
            participant: id,
            before: 0.0,
            after: score,
            reason: ScoreReason::Enqueued,
        });
        Ok(Attempt::Done(true))
    }

    /// Move a locked, eligible participant into `waiting` and stage its queue
    /// entry. Returns the entry's starting score.
    pub(crate) fn enqueue_locked(
        &self,
        participant: &mut Participant,
        now: DateTime<Utc>,
        batch: &mut WriteBatch,
    ) -> Result<f64, PoolError> {
        self.apply_event(participant, LifecycleEvent::Join)?;
        participant.clear_partner();
        participant.updated_at = now;

        let score = self.baseline_score(participant.id, &participant.fairness, &participant.profile)?;
        batch.put_queue_entry(QueueEntry::new(participant.id, score, now));
        batch.put_participant(participant.clone());
        Ok(score)
    }

    fn reject_join(&self, id: ParticipantId, reason: IneligibleReason) {
        debug!(participant = %id, reason = %reason, "join_rejected");
        self.emit(PoolEvent::JoinRejected {
            participant: id,
            reason: reason.to_string(),
        });
    }

    pub(crate) fn try_leave(
        &self,
        id: ParticipantId,
        reason: LeaveReason,
    ) -> Result<Attempt<bool>, PoolError> {
        let Some(_guard) = self.locks.try_lock(id) else {
            return Ok(Attempt::Busy(id));
        };
        let now = self.now();

        let had_entry = self.store.queue_entry(id)?.is_some();
        let mut batch = WriteBatch::new();
        if had_entry {
            batch.remove_queue_entry(id);
        }
        if let Some(mut participant) = self.store.participant(id)? {
            if participant.effective_state() == LifecycleState::Waiting {
                self.apply_event(&mut participant, LifecycleEvent::Leave)?;
                participant.updated_at = now;
                batch.put_participant(participant);
            }
        }
        if !batch.is_empty() {
            self.store.apply(batch)?;
        }
        self.signal_cancel(id);

        if had_entry {
            info!(participant = %id, reason = ?reason, "left_pool");
            self.emit(PoolEvent::Left {
                participant: id,
                reason,
            });
        }
        Ok(Attempt::Done(had_entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use pool::{Gender, Profile};

    fn participant() -> Participant {
        Participant::new(
            ParticipantId::new(),
            Profile::new(Gender::Male, [Gender::Female], 31),
            Utc::now(),
        )
    }

    #[test]
    fn fresh_participant_is_eligible() {
        assert!(check(&participant(), Utc::now()).is_eligible());
    }

    #[test]
    fn offline_and_cooldown_are_reported() {
        let now = Utc::now();
        let mut p = participant();
        p.online = false;
        assert_eq!(
            check(&p, now),
            Eligibility::Ineligible(IneligibleReason::Offline)
        );

        let mut p = participant();
        let until = now + TimeDelta::seconds(30);
        p.state = LifecycleState::CoolingDown;
        p.cooldown_until = Some(until);
        assert_eq!(
            check(&p, now),
            Eligibility::Ineligible(IneligibleReason::CoolingDown { until })
        );
        assert!(check(&p, until + TimeDelta::seconds(1)).is_eligible());
    }

    #[test]
    fn paired_states_are_rejected() {
        let mut p = participant();
        p.state = LifecycleState::Voting;
        assert_eq!(
            check(&p, Utc::now()),
            Eligibility::Ineligible(IneligibleReason::AlreadyPaired)
        );
        p.state = LifecycleState::InSession;
        assert_eq!(
            check(&p, Utc::now()),
            Eligibility::Ineligible(IneligibleReason::InSession)
        );
    }
}
