//! Participant lifecycle state machine.
//!
//! Every lifecycle change in the system is expressed as a [`LifecycleEvent`]
//! and evaluated by [`transition`], a single exhaustive table. Illegal
//! combinations are rejected with a [`TransitionError`]; callers log the
//! rejection and never apply a fallback state.
//!
//! | From | Event | To |
//! |------|-------|----|
//! | idle, ended | join | waiting |
//! | waiting | join | waiting (refresh) |
//! | waiting | leave | idle |
//! | waiting | matched | paired |
//! | paired | vote window opened | voting |
//! | voting | mutual accept | in-session |
//! | voting | requeue | waiting |
//! | paired, voting, ended | release | idle |
//! | in-session | session ended | ended |
//! | any online state | heartbeat missed | soft-offline |
//! | soft-offline | resume(s) | s |
//! | anything but offline | disconnect | offline |
//! | offline | reconnect | cooling-down |
//! | cooling-down | cooldown expired | idle |
//! | online states, cooling-down | force idle | idle |

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Participant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Idle,
    Waiting,
    Paired,
    Voting,
    InSession,
    Ended,
    SoftOffline,
    Offline,
    CoolingDown,
}

impl LifecycleState {
    pub const ALL: [LifecycleState; 9] = [
        LifecycleState::Idle,
        LifecycleState::Waiting,
        LifecycleState::Paired,
        LifecycleState::Voting,
        LifecycleState::InSession,
        LifecycleState::Ended,
        LifecycleState::SoftOffline,
        LifecycleState::Offline,
        LifecycleState::CoolingDown,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Waiting => "waiting",
            Self::Paired => "paired",
            Self::Voting => "voting",
            Self::InSession => "in_session",
            Self::Ended => "ended",
            Self::SoftOffline => "soft_offline",
            Self::Offline => "offline",
            Self::CoolingDown => "cooling_down",
        }
    }

    /// States a participant can be in while its connection is healthy and
    /// that a soft-offline participant may resume into.
    pub const fn is_resumable(self) -> bool {
        matches!(
            self,
            Self::Idle | Self::Waiting | Self::Paired | Self::Voting | Self::InSession | Self::Ended
        )
    }

    /// States that must be backed by a live pairing.
    pub const fn requires_pairing(self) -> bool {
        matches!(self, Self::Paired | Self::Voting)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "event", content = "target", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Join,
    Leave,
    Matched,
    VoteWindowOpened,
    MutualAccept,
    Requeue,
    Release,
    SessionEnded,
    HeartbeatMissed,
    Resume(LifecycleState),
    Disconnect,
    Reconnect,
    CooldownExpired,
    ForceIdle,
}

impl LifecycleEvent {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Join => "join",
            Self::Leave => "leave",
            Self::Matched => "matched",
            Self::VoteWindowOpened => "vote_window_opened",
            Self::MutualAccept => "mutual_accept",
            Self::Requeue => "requeue",
            Self::Release => "release",
            Self::SessionEnded => "session_ended",
            Self::HeartbeatMissed => "heartbeat_missed",
            Self::Resume(_) => "resume",
            Self::Disconnect => "disconnect",
            Self::Reconnect => "reconnect",
            Self::CooldownExpired => "cooldown_expired",
            Self::ForceIdle => "force_idle",
        }
    }

    /// Events that, for a soft-offline participant, act on the state it will
    /// resume into rather than on the soft-offline marker itself.
    const fn targets_resume_state(self) -> bool {
        !matches!(
            self,
            Self::HeartbeatMissed | Self::Resume(_) | Self::Disconnect
        )
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resume(target) => write!(f, "resume({target})"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// A lifecycle event that is not legal from the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal lifecycle transition: {event} from {from}")]
pub struct TransitionError {
    pub from: LifecycleState,
    pub event: LifecycleEvent,
}

/// Evaluate the lifecycle table.
pub fn transition(
    from: LifecycleState,
    event: LifecycleEvent,
) -> Result<LifecycleState, TransitionError> {
    use LifecycleEvent as E;
    use LifecycleState as S;

    let next = match (from, event) {
        (S::Idle | S::Ended | S::Waiting, E::Join) => Some(S::Waiting),
        (S::Waiting, E::Leave) => Some(S::Idle),
        (S::Waiting, E::Matched) => Some(S::Paired),
        (S::Paired, E::VoteWindowOpened) => Some(S::Voting),
        (S::Voting, E::MutualAccept) => Some(S::InSession),
        (S::Voting, E::Requeue) => Some(S::Waiting),
        (S::Paired | S::Voting | S::Ended, E::Release) => Some(S::Idle),
        (S::InSession, E::SessionEnded) => Some(S::Ended),
        (state, E::HeartbeatMissed) if state.is_resumable() => Some(S::SoftOffline),
        (S::SoftOffline, E::Resume(target)) if target.is_resumable() => Some(target),
        (state, E::Disconnect) if state != S::Offline => Some(S::Offline),
        (S::Offline, E::Reconnect) => Some(S::CoolingDown),
        (S::CoolingDown, E::CooldownExpired) => Some(S::Idle),
        (state, E::ForceIdle) if state.is_resumable() || state == S::CoolingDown => Some(S::Idle),
        _ => None,
    };

    next.ok_or(TransitionError { from, event })
}

impl Participant {
    /// Apply a lifecycle event to this participant.
    ///
    /// While soft-offline, events other than heartbeat/disconnect signals are
    /// evaluated against `resume_state`, so a resolution that happens during
    /// the grace period is not lost when the participant comes back.
    /// Returns the participant's new `state`.
    pub fn apply(&mut self, event: LifecycleEvent) -> Result<LifecycleState, TransitionError> {
        match (self.state, event) {
            (LifecycleState::SoftOffline, event) if event.targets_resume_state() => {
                let base = self.resume_state.unwrap_or(LifecycleState::Idle);
                let next = transition(base, event)?;
                self.resume_state = Some(next);
            }
            (from, LifecycleEvent::HeartbeatMissed) => {
                self.state = transition(from, event)?;
                self.resume_state = Some(from);
            }
            (from, LifecycleEvent::Resume(_)) => {
                self.state = transition(from, event)?;
                self.resume_state = None;
            }
            (from, event) => {
                self.state = transition(from, event)?;
                if self.state == LifecycleState::Offline {
                    self.resume_state = None;
                }
            }
        }
        Ok(self.state)
    }

    /// Check an event against the table without mutating anything.
    pub fn can_apply(&self, event: LifecycleEvent) -> bool {
        self.clone().apply(event).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Gender, ParticipantId, Profile};
    use chrono::Utc;

    use LifecycleEvent as E;
    use LifecycleState as S;

    fn participant() -> Participant {
        Participant::new(
            ParticipantId::new(),
            Profile::new(Gender::Female, [Gender::Male], 28),
            Utc::now(),
        )
    }

    #[test]
    fn happy_path_through_a_session() {
        let mut state = S::Idle;
        for (event, expected) in [
            (E::Join, S::Waiting),
            (E::Matched, S::Paired),
            (E::VoteWindowOpened, S::Voting),
            (E::MutualAccept, S::InSession),
            (E::SessionEnded, S::Ended),
            (E::Join, S::Waiting),
        ] {
            state = transition(state, event).expect("legal transition");
            assert_eq!(state, expected);
        }
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let err = transition(S::Idle, E::Matched).unwrap_err();
        assert_eq!(err.from, S::Idle);
        assert_eq!(err.event, E::Matched);
        assert!(transition(S::InSession, E::Join).is_err());
        assert!(transition(S::CoolingDown, E::Join).is_err());
        assert!(transition(S::Offline, E::Join).is_err());
        assert!(transition(S::Offline, E::Disconnect).is_err());
        assert!(transition(S::Voting, E::Matched).is_err());
        assert!(transition(S::SoftOffline, E::Resume(S::Offline)).is_err());
    }

    #[test]
    fn every_state_has_an_exit() {
        for state in S::ALL {
            let reachable = [
                E::ForceIdle,
                E::Reconnect,
                E::Resume(S::Idle),
                E::CooldownExpired,
            ]
            .iter()
            .any(|event| transition(state, *event).is_ok());
            assert!(reachable, "{state} has no exit");
        }
    }

    #[test]
    fn soft_offline_routes_events_to_resume_state() {
        let mut p = participant();
        p.apply(E::Join).unwrap();
        p.apply(E::Matched).unwrap();
        p.apply(E::VoteWindowOpened).unwrap();
        assert_eq!(p.apply(E::HeartbeatMissed).unwrap(), S::SoftOffline);
        assert_eq!(p.resume_state, Some(S::Voting));

        // Vote resolved while the participant was away.
        assert_eq!(p.apply(E::Release).unwrap(), S::SoftOffline);
        assert_eq!(p.resume_state, Some(S::Idle));

        assert_eq!(p.apply(E::Resume(S::Idle)).unwrap(), S::Idle);
        assert_eq!(p.resume_state, None);
    }

    #[test]
    fn disconnect_clears_resume_state() {
        let mut p = participant();
        p.apply(E::Join).unwrap();
        p.apply(E::HeartbeatMissed).unwrap();
        assert_eq!(p.apply(E::Disconnect).unwrap(), S::Offline);
        assert_eq!(p.resume_state, None);
        assert_eq!(p.apply(E::Reconnect).unwrap(), S::CoolingDown);
        assert_eq!(p.apply(E::CooldownExpired).unwrap(), S::Idle);
    }

    #[test]
    fn rejected_apply_leaves_participant_untouched() {
        let mut p = participant();
        let before = p.clone();
        assert!(p.apply(E::MutualAccept).is_err());
        assert_eq!(p, before);
        assert!(!p.can_apply(E::Requeue));
        assert!(p.can_apply(E::Join));
    }
}
