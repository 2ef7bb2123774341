//! Concurrency tests for the Duet pairing engine

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use duet::{
    Arbiter, Gender, LifecycleState, MatchOutcome, MemorySink, MemoryStore, PairAttempt, PairKey,
    Pairing, ParticipantId, PoolConfig, PoolStore, Profile, RetryConfig, TierPolicy, VoteChoice,
    VoteOutcome, VoteReport,
};

fn contended_config() -> PoolConfig {
    let mut cfg = PoolConfig::default();
    cfg.search.tier3_retry_delay = Duration::from_millis(2);
    cfg.search.tier3_max_attempts = 5;
    cfg.vote.read_delay = Duration::from_millis(1);
    cfg.lock_retry = RetryConfig::fixed(200, Duration::from_millis(1));
    cfg
}

/// Joins only enqueue, so tests can set up the race themselves.
fn staged_config() -> PoolConfig {
    let mut cfg = contended_config();
    cfg.search.match_on_join = false;
    cfg
}

fn profile(i: usize) -> Profile {
    let age = 20 + (i % 30) as u8;
    match i % 3 {
        0 => Profile::new(Gender::Female, [Gender::Male], age),
        1 => Profile::new(Gender::Male, [Gender::Female], age),
        _ => Profile::new(Gender::NonBinary, [Gender::Female, Gender::Male, Gender::NonBinary], age),
    }
}

/// Every open pairing has two distinct members, no member is in two open
/// pairings and no pair key repeats.
fn assert_exclusive(store: &MemoryStore) -> usize {
    let open = store.open_pairings().unwrap();
    let mut members = HashSet::new();
    let mut keys = HashSet::new();
    for pairing in &open {
        assert_ne!(pairing.pair.low(), pairing.pair.high());
        assert!(keys.insert(pairing.pair), "pair {:?} created twice", pairing.pair);
        for member in pairing.pair.members() {
            assert!(members.insert(member), "{member} is in two open pairings");
            let row = store.participant(member).unwrap().unwrap();
            assert_eq!(row.pairing, Some(pairing.id));
            assert_eq!(row.partner, pairing.pair.other(member));
        }
    }
    open.len()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn five_hundred_concurrent_joins_never_double_book() {
    let store = Arc::new(MemoryStore::new());
    let arbiter = Arbiter::builder(contended_config())
        .store(store.clone())
        .build()
        .unwrap();

    let mut ids = Vec::with_capacity(500);
    for i in 0..500 {
        ids.push(arbiter.register(profile(i)).await.unwrap());
    }

    let mut tasks = Vec::with_capacity(504);
    for id in ids.iter().copied() {
        let arbiter = arbiter.clone();
        tasks.push(tokio::spawn(async move {
            arbiter.join(id).await?;
            arbiter.find_partner(id).await.map(|_| ())
        }));
    }
    for _ in 0..4 {
        let arbiter = arbiter.clone();
        tasks.push(tokio::spawn(async move {
            arbiter.run_matching_cycle().await.map(|_| ())
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let pairings = assert_exclusive(&store);
    assert!(pairings <= 250);
    assert!(pairings > 0);
    assert_eq!(arbiter.locks_held(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_pair_attempts_never_form_a_triangle() {
    for _ in 0..20 {
        let arbiter = Arbiter::in_memory(staged_config()).unwrap();
        let a = arbiter
            .register(Profile::new(Gender::Female, [Gender::Male], 30))
            .await
            .unwrap();
        let b = arbiter
            .register(Profile::new(Gender::Male, [Gender::Female], 30))
            .await
            .unwrap();
        let c = arbiter
            .register(Profile::new(Gender::Male, [Gender::Female], 30))
            .await
            .unwrap();
        for id in [a, b, c] {
            assert!(arbiter.join(id).await.unwrap());
        }

        let attempts: Vec<_> = (0..8)
            .map(|i| {
                let arbiter = arbiter.clone();
                let partner = if i % 2 == 0 { b } else { c };
                tokio::spawn(async move {
                    loop {
                        match arbiter.try_pair(a, partner, TierPolicy::guaranteed()).await? {
                            PairAttempt::LockConflict => tokio::task::yield_now().await,
                            settled => return Ok::<_, duet::PoolError>(settled),
                        }
                    }
                })
            })
            .collect();

        let mut paired = Vec::new();
        for attempt in attempts {
            if let PairAttempt::Paired(pairing) = attempt.await.unwrap().unwrap() {
                paired.push(pairing);
            }
        }
        assert_eq!(paired.len(), 1, "exactly one attempt may win");
        let winner = paired[0].pair.other(a).unwrap();
        let loser = if winner == b { c } else { b };
        assert!(arbiter.open_pairing_for(loser).await.unwrap().is_none());
        assert_eq!(arbiter.queue_len().await.unwrap(), 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_searches_from_both_sides_settle_on_one_pairing() {
    let arbiter = Arbiter::in_memory(staged_config()).unwrap();
    let a = arbiter
        .register(Profile::new(Gender::Female, [Gender::Male], 30))
        .await
        .unwrap();
    let b = arbiter
        .register(Profile::new(Gender::Male, [Gender::Female], 30))
        .await
        .unwrap();
    arbiter.join(a).await.unwrap();
    arbiter.join(b).await.unwrap();

    let searches: Vec<_> = [a, b]
        .into_iter()
        .map(|id| {
            let arbiter = arbiter.clone();
            tokio::spawn(async move { arbiter.find_partner(id).await })
        })
        .collect();

    let mut pairing_ids = HashSet::new();
    for search in searches {
        match search.await.unwrap().unwrap() {
            MatchOutcome::Paired(pairing) => {
                pairing_ids.insert(pairing.id);
            }
            MatchOutcome::AlreadyPaired(id) => {
                pairing_ids.insert(id);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    assert_eq!(pairing_ids.len(), 1);
    let key = PairKey::new(a, b).unwrap();
    let open = arbiter.open_pairing_for(a).await.unwrap().unwrap();
    assert_eq!(open.pair, key);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leave_and_join_storms_keep_the_queue_consistent() {
    let store = Arc::new(MemoryStore::new());
    let arbiter = Arbiter::builder(contended_config())
        .store(store.clone())
        .build()
        .unwrap();
    let ids: Vec<ParticipantId> = {
        let mut ids = Vec::new();
        for i in 0..40 {
            ids.push(arbiter.register(profile(i)).await.unwrap());
        }
        ids
    };

    let tasks: Vec<_> = ids
        .iter()
        .copied()
        .map(|id| {
            let arbiter = arbiter.clone();
            tokio::spawn(async move {
                for _ in 0..5 {
                    arbiter.join(id).await?;
                    arbiter.leave(id, duet::LeaveReason::UserRequested).await?;
                }
                arbiter.join(id).await
            })
        })
        .collect();
    let cycle = {
        let arbiter = arbiter.clone();
        tokio::spawn(async move {
            for _ in 0..5 {
                arbiter.run_matching_cycle().await?;
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            Ok::<_, duet::PoolError>(())
        })
    };
    for task in tasks {
        task.await.unwrap().unwrap();
    }
    cycle.await.unwrap().unwrap();

    assert_exclusive(&store);
    for entry in store.queue().unwrap() {
        let row = store.participant(entry.participant).unwrap().unwrap();
        assert_eq!(row.state, duet::LifecycleState::Waiting);
        assert!(row.pairing.is_none());
    }
}

struct VotingPair {
    arbiter: Arbiter,
    sink: Arc<MemorySink>,
    a: ParticipantId,
    b: ParticipantId,
    pairing: Pairing,
}

/// Two compatible participants paired on join, vote window open.
async fn voting_pair() -> VotingPair {
    let sink = Arc::new(MemorySink::new());
    let arbiter = Arbiter::builder(contended_config())
        .events(sink.clone())
        .build()
        .unwrap();
    let a = arbiter
        .register(Profile::new(Gender::Female, [Gender::Male], 30))
        .await
        .unwrap();
    let b = arbiter
        .register(Profile::new(Gender::Male, [Gender::Female], 30))
        .await
        .unwrap();
    arbiter.join(a).await.unwrap();
    arbiter.join(b).await.unwrap();
    let pairing = arbiter.open_pairing_for(a).await.unwrap().unwrap();
    VotingPair {
        arbiter,
        sink,
        a,
        b,
        pairing,
    }
}

async fn vote_together(
    pair: &VotingPair,
    a_choice: VoteChoice,
    b_choice: VoteChoice,
) -> [VoteReport; 2] {
    let first = {
        let arbiter = pair.arbiter.clone();
        let (voter, pairing) = (pair.a, pair.pairing.id);
        tokio::spawn(async move { arbiter.submit_vote(voter, pairing, a_choice).await })
    };
    let second = {
        let arbiter = pair.arbiter.clone();
        let (voter, pairing) = (pair.b, pair.pairing.id);
        tokio::spawn(async move { arbiter.submit_vote(voter, pairing, b_choice).await })
    };
    let (first, second) = tokio::join!(first, second);
    [first.unwrap().unwrap(), second.unwrap().unwrap()]
}

/// Each report is either still waiting or the final outcome, and at least
/// one caller saw the pairing resolve.
fn assert_single_resolution(pair: &VotingPair, reports: &[VoteReport; 2], expected: VoteOutcome) {
    for report in reports {
        if report.completed {
            assert_eq!(report.outcome, expected);
        } else {
            assert_eq!(report.outcome, VoteOutcome::Pending);
        }
    }
    assert!(reports.iter().any(|report| report.completed));
    assert_eq!(pair.sink.count("vote_resolved"), 1);
    assert_eq!(pair.sink.count("blocklisted"), 1);
    assert_eq!(pair.arbiter.locks_held(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn simultaneous_accepts_start_exactly_one_session() {
    for _ in 0..20 {
        let pair = voting_pair().await;
        let reports = vote_together(&pair, VoteChoice::Accept, VoteChoice::Accept).await;
        assert_single_resolution(&pair, &reports, VoteOutcome::MutualAccept);

        assert_eq!(pair.sink.count("session_started"), 1);
        for id in [pair.a, pair.b] {
            let row = pair.arbiter.participant(id).await.unwrap().unwrap();
            assert_eq!(row.state, LifecycleState::InSession);
        }
        let stored = pair.arbiter.pairing(pair.pairing.id).await.unwrap().unwrap();
        assert_eq!(stored.outcome, Some(VoteOutcome::MutualAccept));
        assert_eq!(pair.arbiter.blocklist().await.unwrap().len(), 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn simultaneous_accept_and_decline_split_once() {
    for _ in 0..20 {
        let pair = voting_pair().await;
        let reports = vote_together(&pair, VoteChoice::Accept, VoteChoice::Decline).await;
        assert_single_resolution(&pair, &reports, VoteOutcome::Split);

        assert_eq!(pair.sink.count("session_started"), 0);
        assert_eq!(pair.sink.count("requeued"), 1);
        let accepter = pair.arbiter.participant(pair.a).await.unwrap().unwrap();
        assert_eq!(accepter.state, LifecycleState::Waiting);
        assert_eq!(accepter.fairness.boost_events, 1);
        let decliner = pair.arbiter.participant(pair.b).await.unwrap().unwrap();
        assert_eq!(decliner.state, LifecycleState::Idle);
        assert_eq!(decliner.fairness.skips, 1);
        assert!(pair.arbiter.is_blocked(pair.b, pair.a).await.unwrap());
        assert_eq!(pair.arbiter.queue_len().await.unwrap(), 1);
    }
}
