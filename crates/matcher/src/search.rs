//! Tiered candidate search.
//!
//! Compatibility is one symmetric predicate, [`compatible`], parameterised by
//! a [`TierPolicy`]. Gender reciprocity is checked by the same code at every
//! tier; only the age and locale constraints loosen.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use pool::{LifecycleState, PairKey, Participant, ParticipantId, PoolStore, Profile, QueueEntry, Tier};
use serde::{Deserialize, Serialize};

use crate::config::SearchConfig;
use crate::engine::Engine;
use crate::error::PoolError;

/// Constraints applied by one search tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierPolicy {
    pub tier: Tier,
    /// Years added to both ends of both age ranges.
    pub widen_years: u8,
    pub ignore_locale: bool,
}

impl TierPolicy {
    /// Stated preferences as written.
    pub fn exact() -> Self {
        Self {
            tier: Tier::Exact,
            widen_years: 0,
            ignore_locale: false,
        }
    }

    /// Widened preferences. Level 1 widens ages by one step; level 2 widens
    /// by two steps and drops locale constraints.
    pub fn expanded(level: u8, cfg: &SearchConfig) -> Self {
        let level = level.clamp(1, 2);
        Self {
            tier: Tier::Expanded,
            widen_years: cfg.age_widen_step.saturating_mul(level),
            ignore_locale: level >= 2,
        }
    }

    /// Only gender reciprocity and the blocklist remain.
    pub fn guaranteed() -> Self {
        Self {
            tier: Tier::Guaranteed,
            widen_years: 0,
            ignore_locale: true,
        }
    }
}

/// Each side seeks the other's gender.
pub fn gender_reciprocal(a: &Profile, b: &Profile) -> bool {
    a.seeks(b.gender) && b.seeks(a.gender)
}

/// Symmetric compatibility under `policy`.
pub fn compatible(a: &Profile, b: &Profile, policy: &TierPolicy) -> bool {
    if !gender_reciprocal(a, b) {
        return false;
    }
    if policy.tier == Tier::Guaranteed {
        return true;
    }

    let ages = a.age_range.widened(policy.widen_years).contains(b.age)
        && b.age_range.widened(policy.widen_years).contains(a.age);
    let locales =
        policy.ignore_locale || (a.accepts_locale(&b.locale) && b.accepts_locale(&a.locale));
    ages && locales
}

/// Whether a participant may be picked as a candidate (or start a search).
pub(crate) fn is_pairable(participant: &Participant, now: DateTime<Utc>) -> bool {
    participant.online
        && participant.state == LifecycleState::Waiting
        && participant.pairing.is_none()
        && !participant.is_cooling_down(now)
}

/// Source of the random tie-break between otherwise equal candidates.
#[derive(Debug)]
pub struct SearchOrder {
    rng: Mutex<fastrand::Rng>,
}

impl SearchOrder {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(fastrand::Rng::new()),
        }
    }

    /// Reproducible tie-breaks.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(fastrand::Rng::with_seed(seed)),
        }
    }

    fn tiebreak(&self) -> u64 {
        self.rng
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .u64(..)
    }
}

impl Default for SearchOrder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub participant: ParticipantId,
    pub score: f64,
    pub enqueued_at: DateTime<Utc>,
    #[serde(skip)]
    pub(crate) tiebreak: u64,
}

/// Highest score first, then longest wait, then the random draw.
pub(crate) fn fairness_order(a: &Candidate, b: &Candidate) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.enqueued_at.cmp(&b.enqueued_at))
        .then_with(|| a.tiebreak.cmp(&b.tiebreak))
}

/// Queue entries and their owners read once, then used for many searches.
///
/// The snapshot may go stale; pairing re-validates everything under lock.
#[derive(Debug, Default)]
pub(crate) struct PoolSnapshot {
    queued: HashMap<ParticipantId, (QueueEntry, Participant)>,
}

impl PoolSnapshot {
    pub(crate) fn load(store: &dyn PoolStore) -> Result<Self, PoolError> {
        let mut queued = HashMap::new();
        for entry in store.queue()? {
            if let Some(participant) = store.participant(entry.participant)? {
                queued.insert(entry.participant, (entry, participant));
            }
        }
        Ok(Self { queued })
    }

    pub(crate) fn len(&self) -> usize {
        self.queued.len()
    }

    pub(crate) fn get(&self, id: ParticipantId) -> Option<&(QueueEntry, Participant)> {
        self.queued.get(&id)
    }

    pub(crate) fn remove(&mut self, id: ParticipantId) {
        self.queued.remove(&id);
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &(QueueEntry, Participant)> {
        self.queued.values()
    }

    /// Queued ids in fairness order.
    pub(crate) fn ordered_ids(&self, order: &SearchOrder) -> Vec<ParticipantId> {
        let mut all: Vec<Candidate> = self
            .queued
            .values()
            .map(|(entry, _)| Candidate {
                participant: entry.participant,
                score: entry.score,
                enqueued_at: entry.enqueued_at,
                tiebreak: order.tiebreak(),
            })
            .collect();
        all.sort_by(fairness_order);
        all.into_iter().map(|c| c.participant).collect()
    }

    /// Pairable participants other than `searcher` that are gender-reciprocal
    /// with `profile`.
    pub(crate) fn compatible_waiting(
        &self,
        searcher: ParticipantId,
        profile: &Profile,
        now: DateTime<Utc>,
    ) -> usize {
        self.iter()
            .filter(|(_, other)| {
                other.id != searcher
                    && is_pairable(other, now)
                    && gender_reciprocal(profile, &other.profile)
            })
            .count()
    }
}

impl Engine {
    /// Ordered candidates for `searcher` under `policy`, at most
    /// `candidate_limit` of them.
    pub(crate) fn candidates(
        &self,
        searcher: &Participant,
        policy: &TierPolicy,
        snapshot: &PoolSnapshot,
    ) -> Result<Vec<Candidate>, PoolError> {
        let now = self.now();
        let mut found = Vec::new();

        for (entry, other) in snapshot.iter() {
            if other.id == searcher.id || !is_pairable(other, now) {
                continue;
            }
            if !compatible(&searcher.profile, &other.profile, policy) {
                continue;
            }
            let Some(pair) = PairKey::new(searcher.id, other.id) else {
                continue;
            };
            if self.store.is_blocked(pair)? {
                continue;
            }
            found.push(Candidate {
                participant: other.id,
                score: entry.score,
                enqueued_at: entry.enqueued_at,
                tiebreak: self.order.tiebreak(),
            });
        }

        found.sort_by(fairness_order);
        found.truncate(self.config.search.candidate_limit);
        Ok(found)
    }
}
