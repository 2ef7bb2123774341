//! Heartbeat and disconnect monitor.

use std::time::Duration;

use chrono::{DateTime, Utc};
use pool::{
    clock, LeaveReason, LifecycleEvent, LifecycleState, Participant, ParticipantId, PoolEvent,
    VoteOutcome, WriteBatch,
};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::LivenessConfig;
use crate::engine::{Attempt, Engine};
use crate::error::PoolError;
use crate::metrics::metrics_recorder;

/// Heartbeat freshness. A stale heartbeat is a classification, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    Fresh,
    /// Past the soft-offline threshold.
    Stale,
    /// Past the offline threshold.
    Expired,
}

pub fn classify(last_seen: DateTime<Utc>, now: DateTime<Utc>, cfg: &LivenessConfig) -> Liveness {
    let silent: Duration = clock::elapsed(last_seen, now);
    if silent >= cfg.offline_after {
        Liveness::Expired
    } else if silent >= cfg.soft_offline_after {
        Liveness::Stale
    } else {
        Liveness::Fresh
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LivenessReport {
    pub soft_offline: usize,
    pub finalized: usize,
    /// Locked by another operation; retried on the next scan.
    pub skipped: usize,
}

impl Engine {
    pub(crate) fn try_heartbeat(&self, id: ParticipantId) -> Result<Attempt<LifecycleState>, PoolError> {
        let Some(_guard) = self.locks.try_lock(id) else {
            return Ok(Attempt::Busy(id));
        };
        let now = self.now();
        let mut participant = self.require_participant(id)?;
        participant.last_seen = now;
        participant.updated_at = now;

        match participant.state {
            LifecycleState::SoftOffline => {
                let target = participant.resume_state.unwrap_or(LifecycleState::Idle);
                let state = self.apply_event(&mut participant, LifecycleEvent::Resume(target))?;
                info!(participant = %id, state = %state, "resumed");
                self.emit(PoolEvent::Resumed {
                    participant: id,
                    state,
                });
            }
            LifecycleState::Offline => {
                participant.online = true;
                self.apply_event(&mut participant, LifecycleEvent::Reconnect)?;
                self.expire_cooldown(&mut participant, now)?;
                info!(participant = %id, state = %participant.state, "reconnected");
                self.emit(PoolEvent::Reconnected {
                    participant: id,
                    state: participant.state,
                });
            }
            LifecycleState::CoolingDown => self.expire_cooldown(&mut participant, now)?,
            _ => {}
        }

        let state = participant.state;
        let mut batch = WriteBatch::new();
        batch.put_participant(participant);
        self.store.apply(batch)?;
        Ok(Attempt::Done(state))
    }

    fn expire_cooldown(&self, participant: &mut Participant, now: DateTime<Utc>) -> Result<(), PoolError> {
        if participant.state == LifecycleState::CoolingDown && !participant.is_cooling_down(now) {
            self.apply_event(participant, LifecycleEvent::CooldownExpired)?;
            participant.cooldown_until = None;
        }
        Ok(())
    }

    pub(crate) fn scan_liveness(&self) -> Result<LivenessReport, PoolError> {
        let now = self.now();
        let mut report = LivenessReport::default();

        for participant in self.store.participants()? {
            if !participant.online {
                continue;
            }
            let attempt = match classify(participant.last_seen, now, &self.config.liveness) {
                Liveness::Fresh => continue,
                Liveness::Stale => {
                    if participant.state == LifecycleState::SoftOffline
                        || !participant.state.is_resumable()
                    {
                        continue;
                    }
                    self.try_mark_soft_offline(participant.id)?
                        .map(|marked| (marked, false))
                }
                Liveness::Expired => self.try_finalize(participant.id)?.map(|done| (done, true)),
            };
            match attempt {
                Attempt::Done((true, false)) => report.soft_offline += 1,
                Attempt::Done((true, true)) => report.finalized += 1,
                Attempt::Done((false, _)) => {}
                Attempt::Busy(_) => report.skipped += 1,
            }
        }

        if report != LivenessReport::default() {
            info!(
                soft_offline = report.soft_offline,
                finalized = report.finalized,
                skipped = report.skipped,
                "liveness_scan"
            );
        }
        if let Some(metrics) = metrics_recorder() {
            metrics.record_liveness(&report);
        }
        Ok(report)
    }

    fn try_mark_soft_offline(&self, id: ParticipantId) -> Result<Attempt<bool>, PoolError> {
        let Some(_guard) = self.locks.try_lock(id) else {
            return Ok(Attempt::Busy(id));
        };
        let now = self.now();
        let Some(mut participant) = self.store.participant(id)? else {
            return Ok(Attempt::Done(false));
        };
        let stale = classify(participant.last_seen, now, &self.config.liveness) != Liveness::Fresh;
        if !stale
            || !participant.online
            || participant.state == LifecycleState::SoftOffline
            || !participant.state.is_resumable()
        {
            return Ok(Attempt::Done(false));
        }

        self.apply_event(&mut participant, LifecycleEvent::HeartbeatMissed)?;
        participant.updated_at = now;
        let mut batch = WriteBatch::new();
        batch.put_participant(participant);
        self.store.apply(batch)?;

        debug!(participant = %id, "soft_offline");
        self.emit(PoolEvent::SoftOffline { participant: id });
        Ok(Attempt::Done(true))
    }

    /// The participant whose lock must be held alongside `participant`'s to
    /// tear down its pairing or session.
    fn linked_partner(&self, participant: &Participant) -> Result<Option<ParticipantId>, PoolError> {
        if let Some(pairing) = self.store.open_pairing_for(participant.id)? {
            return Ok(pairing.pair.other(participant.id));
        }
        if participant.effective_state() == LifecycleState::InSession {
            return Ok(participant.partner);
        }
        Ok(None)
    }

    /// Finalize a participant to `offline`: tear down its pairing or session,
    /// drop its queue entry and start the cooldown. Returns `false` when it
    /// was already offline.
    pub(crate) fn try_finalize(&self, id: ParticipantId) -> Result<Attempt<bool>, PoolError> {
        let before = self.require_participant(id)?;
        let partner = self.linked_partner(&before)?;

        let mut ids = vec![id];
        ids.extend(partner);
        let Some(_guards) = self.locks.try_lock_all(&ids) else {
            return Ok(Attempt::Busy(id));
        };

        let mut participant = self.require_participant(id)?;
        if self.linked_partner(&participant)? != partner {
            // Pairing changed between the read and the lock; start over.
            return Ok(Attempt::Busy(id));
        }
        if participant.state == LifecycleState::Offline {
            return Ok(Attempt::Done(false));
        }

        let now = self.now();
        let mut batch = WriteBatch::new();
        let mut events = Vec::new();

        if let Some(pairing) = self.store.open_pairing_for(id)? {
            let votes = self.store.votes(pairing.id)?;
            batch.end_pairing(pairing.id, pairing.status, VoteOutcome::PartnerDisconnected, now);
            events = self.settle(
                &pairing,
                VoteOutcome::PartnerDisconnected,
                &votes,
                Some(id),
                now,
                &mut batch,
            )?;
        } else if participant.effective_state() == LifecycleState::InSession {
            if let Some(mut other) = partner.map(|p| self.store.participant(p)).transpose()?.flatten() {
                if other.partner == Some(id) && other.effective_state() == LifecycleState::InSession {
                    self.apply_event(&mut other, LifecycleEvent::SessionEnded)?;
                    other.clear_partner();
                    other.updated_at = now;
                    if let Some(pairing) = participant.pairing {
                        events.push(PoolEvent::SessionInterrupted {
                            pairing,
                            participant: other.id,
                        });
                    }
                    batch.put_participant(other);
                }
            }
        }

        let had_entry = self.store.queue_entry(id)?.is_some();
        if had_entry {
            batch.remove_queue_entry(id);
        }
        let cooldown_until = clock::offset(now, self.config.liveness.cooldown);
        self.apply_event(&mut participant, LifecycleEvent::Disconnect)?;
        participant.online = false;
        participant.cooldown_until = Some(cooldown_until);
        participant.clear_partner();
        participant.updated_at = now;
        batch.put_participant(participant);

        self.store.apply(batch)?;

        info!(participant = %id, cooldown_until = %cooldown_until, "finalized_offline");
        for event in events {
            self.emit(event);
        }
        if had_entry {
            self.emit(PoolEvent::Left {
                participant: id,
                reason: LeaveReason::Disconnected,
            });
        }
        self.emit(PoolEvent::Offline {
            participant: id,
            cooldown_until,
        });
        self.signal_cancel(id);
        Ok(Attempt::Done(true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_thresholds() {
        let cfg = LivenessConfig::default();
        let now = Utc::now();
        let ago = |secs: i64| now - chrono::TimeDelta::seconds(secs);
        assert_eq!(classify(ago(3), now, &cfg), Liveness::Fresh);
        assert_eq!(classify(ago(15), now, &cfg), Liveness::Stale);
        assert_eq!(classify(ago(44), now, &cfg), Liveness::Stale);
        assert_eq!(classify(ago(45), now, &cfg), Liveness::Expired);
    }

    #[test]
    fn future_heartbeat_is_fresh() {
        let cfg = LivenessConfig::default();
        let now = Utc::now();
        assert_eq!(
            classify(now + chrono::TimeDelta::seconds(5), now, &cfg),
            Liveness::Fresh
        );
    }
}
