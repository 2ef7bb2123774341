//! Common utilities for Duet benchmarks
//!
//! Builds pools of waiting participants with a spread of genders, ages and
//! locales so the search tiers all get exercised.

#![allow(dead_code)]

use std::time::Duration;

use duet::{Arbiter, Gender, ParticipantId, PoolConfig, Profile, SearchOrder};

const LOCALES: [&str; 4] = ["en", "de", "es", "fr"];

/// Deterministic profile for participant number `i`.
pub fn sample_profile(i: usize) -> Profile {
    let age = 18 + (i * 7 % 40) as u8;
    let (gender, seeking): (Gender, &[Gender]) = match i % 5 {
        0 | 1 => (Gender::Female, &[Gender::Male]),
        2 | 3 => (Gender::Male, &[Gender::Female]),
        _ => (Gender::NonBinary, &[Gender::Female, Gender::Male, Gender::NonBinary]),
    };
    let spread = 3 + (i % 8) as u8;
    Profile::new(gender, seeking.iter().copied(), age)
        .with_age_range(age.saturating_sub(spread), age.saturating_add(spread))
        .with_locale(LOCALES[i % LOCALES.len()])
}

pub fn bench_config() -> PoolConfig {
    let mut cfg = PoolConfig::default();
    cfg.search.tier3_retry_delay = Duration::from_millis(1);
    cfg.vote.read_delay = Duration::from_millis(1);
    cfg.search.match_on_join = false;
    cfg
}

/// Arbiter with `n` participants registered and waiting.
pub async fn populated_pool(n: usize) -> (Arbiter, Vec<ParticipantId>) {
    let arbiter = Arbiter::builder(bench_config())
        .events(std::sync::Arc::new(duet::NoopSink))
        .search_order(SearchOrder::seeded(n as u64))
        .build()
        .expect("bench config is valid");
    let mut ids = Vec::with_capacity(n);
    for i in 0..n {
        let id = arbiter
            .register(sample_profile(i))
            .await
            .expect("register");
        arbiter.join(id).await.expect("join");
        ids.push(id);
    }
    (arbiter, ids)
}
