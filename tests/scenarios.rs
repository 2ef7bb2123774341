//! End-to-end lifecycle scenarios through the `duet` umbrella crate

use std::sync::Arc;
use std::time::Duration;

use duet::{
    Arbiter, BoostReason, DuetConfig, Gender, LeaveReason, LifecycleState, ManualClock,
    MatchOutcome, MemorySink, MemoryStore, ParticipantId, PoolStore, Profile, SearchOrder,
    TierPolicy, VoteChoice, VoteOutcome,
};

struct World {
    arbiter: Arbiter,
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
    events: Arc<MemorySink>,
}

fn world() -> World {
    world_with(true)
}

/// A world where joining only enqueues and pairing waits for a cycle.
fn staged_world() -> World {
    world_with(false)
}

fn world_with(match_on_join: bool) -> World {
    let yaml = format!(
        r#"
version: "1.0"
name: "scenarios"
pool:
  vote:
    read_delay: 1
  search:
    tier3_retry_delay: 2
    tier3_max_attempts: 3
    match_on_join: {match_on_join}
"#
    );
    let config = DuetConfig::from_yaml(&yaml).expect("valid yaml");
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::starting_now());
    let events = Arc::new(MemorySink::new());
    let arbiter = Arbiter::builder(config.pool)
        .store(store.clone())
        .clock(clock.clone())
        .events(events.clone())
        .search_order(SearchOrder::seeded(42))
        .build()
        .expect("valid config");
    World {
        arbiter,
        store,
        clock,
        events,
    }
}

impl World {
    async fn waiting(&self, profile: Profile) -> ParticipantId {
        let id = self.arbiter.register(profile).await.unwrap();
        assert!(self.arbiter.join(id).await.unwrap());
        id
    }

    async fn state(&self, id: ParticipantId) -> LifecycleState {
        self.arbiter.participant(id).await.unwrap().unwrap().state
    }
}

fn seeker(gender: Gender, seeking: Gender) -> Profile {
    Profile::new(gender, [seeking], 30).with_age_range(25, 35)
}

#[tokio::test]
async fn scenario_a_exact_match_as_soon_as_both_join() {
    let w = world();
    let a = w.waiting(seeker(Gender::Female, Gender::Male)).await;
    let b = w.waiting(seeker(Gender::Male, Gender::Female)).await;

    assert_eq!(w.events.count("paired"), 1);
    assert_eq!(w.arbiter.run_matching_cycle().await.unwrap(), 0);
    assert_eq!(w.store.queue().unwrap().len(), 0);
    assert_eq!(w.store.open_pairings().unwrap().len(), 1);
    let pairing = w.arbiter.open_pairing_for(a).await.unwrap().unwrap();
    assert!(pairing.pair.contains(b));
    assert_eq!(pairing.tier, duet::Tier::Exact);
}

#[tokio::test]
async fn scenario_c_partner_disconnects_after_an_accept() {
    let w = world();
    let a = w.waiting(seeker(Gender::Female, Gender::Male)).await;
    let b = w.waiting(seeker(Gender::Male, Gender::Female)).await;
    let pairing = w.arbiter.open_pairing_for(a).await.unwrap().unwrap();

    let report = w
        .arbiter
        .submit_vote(a, pairing.id, VoteChoice::Accept)
        .await
        .unwrap();
    assert!(!report.completed);
    assert!(w.arbiter.handle_disconnect(b).await.unwrap());

    let accepter = w.arbiter.participant(a).await.unwrap().unwrap();
    assert_eq!(accepter.state, LifecycleState::Waiting);
    assert!(accepter.fairness.boost_points > 0.0);
    assert!(w.store.queue_entry(a).unwrap().is_some());

    let gone = w.arbiter.participant(b).await.unwrap().unwrap();
    assert_eq!(gone.state, LifecycleState::Offline);
    assert!(gone.cooldown_until.is_some());
    assert!(w.arbiter.blocklist().await.unwrap().is_empty());
}

#[tokio::test]
async fn scenario_d_mutual_accept_is_never_repeated() {
    let w = world();
    let a = w.waiting(seeker(Gender::Female, Gender::Male)).await;
    let b = w.waiting(seeker(Gender::Male, Gender::Female)).await;
    let pairing = w.arbiter.open_pairing_for(a).await.unwrap().unwrap();

    w.arbiter
        .submit_vote(b, pairing.id, VoteChoice::Accept)
        .await
        .unwrap();
    let report = w
        .arbiter
        .submit_vote(a, pairing.id, VoteChoice::Accept)
        .await
        .unwrap();
    assert_eq!(report.outcome, VoteOutcome::MutualAccept);
    assert_eq!(w.events.count("session_started"), 1);
    assert!(w.arbiter.end_session(pairing.id).await.unwrap());

    assert!(w.arbiter.join(a).await.unwrap());
    assert!(w.arbiter.join(b).await.unwrap());
    w.clock.advance(Duration::from_secs(90));

    let search = w.arbiter.config().search.clone();
    for policy in [
        TierPolicy::exact(),
        TierPolicy::expanded(1, &search),
        TierPolicy::expanded(2, &search),
        TierPolicy::guaranteed(),
    ] {
        assert!(w.arbiter.search(a, policy).await.unwrap().is_empty());
    }
    for _ in 0..3 {
        assert_eq!(w.arbiter.run_matching_cycle().await.unwrap(), 0);
    }
    assert_eq!(
        w.arbiter.find_partner(b).await.unwrap(),
        MatchOutcome::WaitingForPartner
    );
    assert!(w.arbiter.is_blocked(a, b).await.unwrap());
    assert!(w.arbiter.is_blocked(b, a).await.unwrap());
}

#[tokio::test]
async fn scenario_e_vote_window_expires_with_one_accept() {
    let w = world();
    let a = w.waiting(seeker(Gender::Female, Gender::Male)).await;
    let b = w.waiting(seeker(Gender::Male, Gender::Female)).await;
    let pairing = w.arbiter.open_pairing_for(a).await.unwrap().unwrap();
    w.arbiter
        .submit_vote(a, pairing.id, VoteChoice::Accept)
        .await
        .unwrap();

    w.clock.advance(Duration::from_secs(21));
    assert_eq!(w.arbiter.guardian_sweep().await.unwrap(), 1);

    assert_eq!(w.state(a).await, LifecycleState::Waiting);
    assert!(w.arbiter.score(a).await.unwrap().unwrap() >= 25.0);
    assert_eq!(w.state(b).await, LifecycleState::Idle);
    assert!(w.arbiter.blocklist().await.unwrap().is_empty());
    assert_eq!(
        w.arbiter.pairing(pairing.id).await.unwrap().unwrap().outcome,
        Some(VoteOutcome::IdleTimeout)
    );
    assert_eq!(w.arbiter.guardian_sweep().await.unwrap(), 0);
}

#[tokio::test]
async fn gender_reciprocity_holds_at_every_tier() {
    let w = world();
    let a = w.waiting(seeker(Gender::Female, Gender::Male)).await;
    // Seeks women, but is a woman herself: `a` does not seek her back.
    let b = w.waiting(seeker(Gender::Female, Gender::Female)).await;
    let search = w.arbiter.config().search.clone();
    for policy in [
        TierPolicy::exact(),
        TierPolicy::expanded(1, &search),
        TierPolicy::expanded(2, &search),
        TierPolicy::guaranteed(),
    ] {
        assert!(w.arbiter.search(a, policy).await.unwrap().is_empty());
        assert!(w.arbiter.search(b, policy).await.unwrap().is_empty());
    }
    w.clock.advance(Duration::from_secs(120));
    assert_eq!(w.arbiter.run_matching_cycle().await.unwrap(), 0);
}

#[tokio::test]
async fn repeated_cycles_pair_floor_of_half_the_pool() {
    let w = staged_world();
    let mut ids = Vec::new();
    for i in 0..15u8 {
        // Everyone seeks everyone; age ranges are deliberately disjoint so
        // most pairs only qualify at the guaranteed tier.
        let gender = [Gender::Female, Gender::Male, Gender::NonBinary][usize::from(i % 3)];
        let profile = Profile::new(gender, [Gender::Female, Gender::Male, Gender::NonBinary], 20 + i * 3)
            .with_age_range(20 + i * 3, 21 + i * 3);
        ids.push(w.waiting(profile).await);
    }

    for _ in 0..5 {
        w.arbiter.run_matching_cycle().await.unwrap();
        w.clock.advance(Duration::from_secs(1));
    }
    assert_eq!(w.store.open_pairings().unwrap().len(), 7);
    assert_eq!(w.store.queue().unwrap().len(), 1);
}

#[tokio::test]
async fn waiting_scores_only_climb_until_paired() {
    let w = world();
    let a = w.waiting(seeker(Gender::Female, Gender::Male)).await;
    let mut last = w.arbiter.score(a).await.unwrap().unwrap();
    for _ in 0..10 {
        w.clock.advance(Duration::from_secs(7));
        w.arbiter.recompute_scores().await.unwrap();
        let now = w.arbiter.score(a).await.unwrap().unwrap();
        assert!(now >= last);
        last = now;
    }

    for _ in 0..6 {
        w.arbiter
            .boost(a, 25.0, BoostReason::Manual("retention".into()))
            .await
            .unwrap();
    }
    let ledger = w.arbiter.participant(a).await.unwrap().unwrap().fairness;
    assert_eq!(ledger.boost_points, 100.0);

    let b = w.waiting(seeker(Gender::Male, Gender::Female)).await;
    let pairing = w.arbiter.open_pairing_for(a).await.unwrap().unwrap();
    assert!(pairing.pair.contains(b));
    let ledger = w.arbiter.participant(a).await.unwrap().unwrap().fairness;
    assert_eq!(ledger.boost_points, 0.0);
}

#[tokio::test]
async fn silent_participants_are_dropped_and_can_come_back() {
    let w = world();
    let a = w.waiting(seeker(Gender::Female, Gender::Male)).await;

    w.clock.advance(Duration::from_secs(20));
    assert_eq!(w.arbiter.scan_liveness().await.unwrap().soft_offline, 1);
    w.clock.advance(Duration::from_secs(30));
    assert_eq!(w.arbiter.scan_liveness().await.unwrap().finalized, 1);
    assert_eq!(w.state(a).await, LifecycleState::Offline);
    assert!(w.store.queue_entry(a).unwrap().is_none());

    assert_eq!(
        w.arbiter.heartbeat(a).await.unwrap(),
        LifecycleState::CoolingDown
    );
    assert!(!w.arbiter.join(a).await.unwrap());
    w.clock.advance(Duration::from_secs(61));
    assert_eq!(w.arbiter.heartbeat(a).await.unwrap(), LifecycleState::Idle);
    assert!(w.arbiter.join(a).await.unwrap());
    assert!(w.arbiter.leave(a, LeaveReason::UserRequested).await.unwrap());
    assert_eq!(w.state(a).await, LifecycleState::Idle);
}

#[tokio::test]
async fn staged_pool_pairs_on_the_first_cycle() {
    let w = staged_world();
    let a = w.waiting(seeker(Gender::Female, Gender::Male)).await;
    let b = w.waiting(seeker(Gender::Male, Gender::Female)).await;
    assert_eq!(w.events.count("paired"), 0);
    assert_eq!(w.store.queue().unwrap().len(), 2);

    assert_eq!(w.arbiter.run_matching_cycle().await.unwrap(), 1);
    let pairing = w.arbiter.open_pairing_for(b).await.unwrap().unwrap();
    assert!(pairing.pair.contains(a));
    assert_eq!(w.state(a).await, LifecycleState::Voting);
}
