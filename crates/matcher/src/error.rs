use pool::{PairingId, ParticipantId, StoreError, TransitionError};
use thiserror::Error;

/// Failures surfaced by engine operations.
///
/// Ineligibility, lock conflicts during matching and "no candidate" are not
/// errors; they come back as [`Eligibility`](crate::Eligibility),
/// [`PairAttempt`](crate::PairAttempt) and [`MatchOutcome`](crate::MatchOutcome)
/// values instead.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),
    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),
    #[error("participant {0} is locked by another operation")]
    LockConflict(ParticipantId),
    #[error("unknown participant {0}")]
    UnknownParticipant(ParticipantId),
    #[error("unknown pairing {0}")]
    UnknownPairing(PairingId),
    #[error("participant {participant} is not a member of pairing {pairing}")]
    NotAMember {
        participant: ParticipantId,
        pairing: PairingId,
    },
    #[error("pairing {0} has no open vote window")]
    VoteWindowNotOpen(PairingId),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("invalid profile: {0}")]
    InvalidProfile(String),
}

impl PoolError {
    /// Whether the same call may succeed if simply repeated.
    pub fn is_retryable(&self) -> bool {
        match self {
            PoolError::LockConflict(_) | PoolError::VoteWindowNotOpen(_) => true,
            PoolError::Storage(StoreError::Constraint(_)) => true,
            PoolError::Storage(StoreError::Backend(_)) => true,
            PoolError::Storage(StoreError::NotFound(_))
            | PoolError::InvalidTransition(_)
            | PoolError::UnknownParticipant(_)
            | PoolError::UnknownPairing(_)
            | PoolError::NotAMember { .. }
            | PoolError::InvalidConfig(_)
            | PoolError::InvalidProfile(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pool::{LifecycleEvent, LifecycleState};

    #[test]
    fn classification() {
        assert!(PoolError::LockConflict(ParticipantId::new()).is_retryable());
        assert!(PoolError::from(StoreError::backend("poisoned")).is_retryable());
        let rejected = TransitionError {
            from: LifecycleState::Idle,
            event: LifecycleEvent::MutualAccept,
        };
        assert!(!PoolError::from(rejected).is_retryable());
        assert!(!PoolError::InvalidConfig("x".into()).is_retryable());
    }
}
