//! Error surface of the public API

use duet::{
    Arbiter, ConfigLoadError, DuetConfig, Gender, PairingId, ParticipantId, PoolConfig, PoolError,
    Profile, VoteChoice, build_arbiter,
};

#[tokio::test]
async fn unknown_identities_are_reported_not_panicked() {
    let arbiter = Arbiter::in_memory(PoolConfig::default()).unwrap();
    let ghost = ParticipantId::new();

    assert!(matches!(
        arbiter.heartbeat(ghost).await,
        Err(PoolError::UnknownParticipant(id)) if id == ghost
    ));
    assert!(matches!(
        arbiter.find_partner(ghost).await,
        Err(PoolError::UnknownParticipant(_))
    ));
    assert!(matches!(
        arbiter
            .submit_vote(ghost, PairingId::new(), VoteChoice::Accept)
            .await,
        Err(PoolError::UnknownPairing(_))
    ));
    assert!(!arbiter.join(ghost).await.unwrap());
    assert!(arbiter.participant(ghost).await.unwrap().is_none());
    assert!(arbiter.score(ghost).await.unwrap().is_none());
}

#[tokio::test]
async fn ineligibility_is_a_value_not_an_error() {
    let arbiter = Arbiter::in_memory(PoolConfig::default()).unwrap();
    let id = arbiter
        .register(Profile::new(Gender::Male, [Gender::Female], 30))
        .await
        .unwrap();
    arbiter.handle_disconnect(id).await.unwrap();

    assert!(!arbiter.join(id).await.unwrap());
    assert!(!arbiter.eligibility(id).await.unwrap().is_eligible());
}

#[test]
fn retryable_errors_are_classified() {
    assert!(PoolError::LockConflict(ParticipantId::new()).is_retryable());
    assert!(!PoolError::UnknownParticipant(ParticipantId::new()).is_retryable());
    assert!(!PoolError::InvalidConfig("x".into()).is_retryable());
    assert!(!PoolError::InvalidProfile("x".into()).is_retryable());
}

#[test]
fn invalid_configs_fail_fast() {
    let mut config = PoolConfig::default();
    config.vote.vote_window = std::time::Duration::ZERO;
    assert!(matches!(
        Arbiter::in_memory(config),
        Err(PoolError::InvalidConfig(msg)) if msg.contains("vote_window")
    ));

    let yaml = "version: \"1.0\"\npool:\n  search:\n    candidate_limit: 0\n";
    assert!(matches!(
        DuetConfig::from_yaml(yaml),
        Err(ConfigLoadError::Validation(msg)) if msg.contains("candidate_limit")
    ));

    let mut duet = DuetConfig::default();
    duet.pool.search.tier3_max_attempts = 0;
    assert!(build_arbiter(&duet).is_err());
}
