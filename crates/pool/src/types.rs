//! Records stored in the participant pool.
//!
//! Everything here is plain data: identities, profiles, queue entries,
//! pairings, votes and blocklist entries. Behaviour that mutates these records
//! lives in [`crate::lifecycle`] (state transitions) and in the matcher crate.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::lifecycle::LifecycleState;

/// Stable identity of a participant.
///
/// The derived `Ord` is the total order used when acquiring identity locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(pub Uuid);

impl ParticipantId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ParticipantId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identity of a pairing row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PairingId(pub Uuid);

impl PairingId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PairingId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PairingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Unordered pair of distinct participants, stored lower-first.
///
/// Canonical ordering makes `(a, b)` and `(b, a)` the same key, which is what
/// lets the store enforce pairing uniqueness and symmetric blocklist lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PairKey {
    low: ParticipantId,
    high: ParticipantId,
}

impl PairKey {
    /// Returns `None` when both sides are the same participant.
    pub fn new(a: ParticipantId, b: ParticipantId) -> Option<Self> {
        match a.cmp(&b) {
            std::cmp::Ordering::Less => Some(Self { low: a, high: b }),
            std::cmp::Ordering::Greater => Some(Self { low: b, high: a }),
            std::cmp::Ordering::Equal => None,
        }
    }

    pub fn low(&self) -> ParticipantId {
        self.low
    }

    pub fn high(&self) -> ParticipantId {
        self.high
    }

    pub fn contains(&self, id: ParticipantId) -> bool {
        self.low == id || self.high == id
    }

    /// The other member of the pair, if `id` is a member.
    pub fn other(&self, id: ParticipantId) -> Option<ParticipantId> {
        if id == self.low {
            Some(self.high)
        } else if id == self.high {
            Some(self.low)
        } else {
            None
        }
    }

    pub fn members(&self) -> [ParticipantId; 2] {
        [self.low, self.high]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gender {
    Female,
    Male,
    NonBinary,
}

/// Inclusive age bounds a participant accepts in a partner.
///
/// Deserialized bounds are reordered like [`AgeRange::new`]; a range built
/// through the public fields may still be inverted, see
/// [`is_ordered`](AgeRange::is_ordered).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "AgeBounds")]
pub struct AgeRange {
    pub min: u8,
    pub max: u8,
}

impl AgeRange {
    pub fn new(min: u8, max: u8) -> Self {
        if min <= max {
            Self { min, max }
        } else {
            Self { min: max, max: min }
        }
    }

    pub fn contains(&self, age: u8) -> bool {
        age >= self.min && age <= self.max
    }

    /// Range widened by `years` on both ends, saturating at the u8 bounds.
    pub fn widened(&self, years: u8) -> Self {
        Self {
            min: self.min.saturating_sub(years),
            max: self.max.saturating_add(years),
        }
    }

    pub fn width(&self) -> u8 {
        self.max.abs_diff(self.min)
    }

    pub fn is_ordered(&self) -> bool {
        self.min <= self.max
    }
}

#[derive(Deserialize)]
struct AgeBounds {
    min: u8,
    max: u8,
}

impl From<AgeBounds> for AgeRange {
    fn from(bounds: AgeBounds) -> Self {
        AgeRange::new(bounds.min, bounds.max)
    }
}

impl Default for AgeRange {
    fn default() -> Self {
        Self { min: 18, max: 99 }
    }
}

/// Matching-relevant slice of a participant's profile.
///
/// Owned by the profile collaborator; the pool only keeps a copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub gender: Gender,
    /// Genders this participant wants to be paired with.
    pub seeking: BTreeSet<Gender>,
    pub age: u8,
    pub age_range: AgeRange,
    pub locale: String,
    /// Empty means any locale is acceptable.
    #[serde(default)]
    pub accepted_locales: BTreeSet<String>,
}

impl Profile {
    pub fn new(gender: Gender, seeking: impl IntoIterator<Item = Gender>, age: u8) -> Self {
        Self {
            gender,
            seeking: seeking.into_iter().collect(),
            age,
            age_range: AgeRange::default(),
            locale: "en".to_string(),
            accepted_locales: BTreeSet::new(),
        }
    }

    pub fn with_age_range(mut self, min: u8, max: u8) -> Self {
        self.age_range = AgeRange::new(min, max);
        self
    }

    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = locale.into();
        self
    }

    pub fn with_accepted_locales<I, S>(mut self, locales: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.accepted_locales = locales.into_iter().map(Into::into).collect();
        self
    }

    pub fn seeks(&self, gender: Gender) -> bool {
        self.seeking.contains(&gender)
    }

    pub fn accepts_locale(&self, locale: &str) -> bool {
        self.accepted_locales.is_empty() || self.accepted_locales.contains(locale)
    }
}

/// Per-participant fairness bookkeeping since the last successful pairing.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FairnessLedger {
    pub boost_points: f64,
    pub boost_events: u32,
    pub skips: u32,
}

impl FairnessLedger {
    /// Baseline after a successful pairing. Skips survive the reset.
    pub fn reset(&mut self) {
        self.boost_points = 0.0;
        self.boost_events = 0;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub profile: Profile,
    pub online: bool,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub last_seen: DateTime<Utc>,
    pub state: LifecycleState,
    /// State restored when a soft-offline participant's heartbeat resumes.
    #[serde(default)]
    pub resume_state: Option<LifecycleState>,
    #[serde(default)]
    pub partner: Option<ParticipantId>,
    #[serde(default)]
    pub pairing: Option<PairingId>,
    #[serde(default)]
    pub fairness: FairnessLedger,
    pub updated_at: DateTime<Utc>,
}

impl Participant {
    /// A freshly registered, online, idle participant.
    pub fn new(id: ParticipantId, profile: Profile, now: DateTime<Utc>) -> Self {
        Self {
            id,
            profile,
            online: true,
            cooldown_until: None,
            last_seen: now,
            state: LifecycleState::Idle,
            resume_state: None,
            partner: None,
            pairing: None,
            fairness: FairnessLedger::default(),
            updated_at: now,
        }
    }

    pub fn is_cooling_down(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.is_some_and(|until| until > now)
    }

    /// The state that governs matching decisions: while soft-offline this is
    /// the state the participant will resume into.
    pub fn effective_state(&self) -> LifecycleState {
        match self.state {
            LifecycleState::SoftOffline => self.resume_state.unwrap_or(LifecycleState::Idle),
            state => state,
        }
    }

    pub fn clear_partner(&mut self) {
        self.partner = None;
        self.pairing = None;
    }
}

/// A waiting participant's slot in the pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub participant: ParticipantId,
    pub score: f64,
    pub enqueued_at: DateTime<Utc>,
    /// Highest compatibility tier attempted so far (0 = none yet, 3 = guaranteed).
    pub tier: u8,
}

impl QueueEntry {
    pub fn new(participant: ParticipantId, score: f64, enqueued_at: DateTime<Utc>) -> Self {
        Self {
            participant,
            score,
            enqueued_at,
            tier: 0,
        }
    }
}

/// Compatibility strictness level used by candidate search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Exact = 1,
    Expanded = 2,
    Guaranteed = 3,
}

impl Tier {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Tier::Exact => "exact",
            Tier::Expanded => "expanded",
            Tier::Guaranteed => "guaranteed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingStatus {
    Pending,
    VoteActive,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteChoice {
    Accept,
    Decline,
}

/// How a pairing's vote concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteOutcome {
    /// Not resolved yet; waiting for the partner's vote.
    Pending,
    MutualAccept,
    Split,
    MutualDecline,
    IdleTimeout,
    PartnerDisconnected,
    /// Torn down by reconciliation before a vote window opened.
    Abandoned,
}

impl VoteOutcome {
    /// Outcomes that record a permanent blocklist entry.
    pub fn is_permanent(self) -> bool {
        matches!(
            self,
            VoteOutcome::MutualAccept | VoteOutcome::Split | VoteOutcome::MutualDecline
        )
    }

    pub fn is_final(self) -> bool {
        !matches!(self, VoteOutcome::Pending)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            VoteOutcome::Pending => "pending",
            VoteOutcome::MutualAccept => "mutual_accept",
            VoteOutcome::Split => "split",
            VoteOutcome::MutualDecline => "mutual_decline",
            VoteOutcome::IdleTimeout => "idle_timeout",
            VoteOutcome::PartnerDisconnected => "partner_disconnected",
            VoteOutcome::Abandoned => "abandoned",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pairing {
    pub id: PairingId,
    pub pair: PairKey,
    pub status: PairingStatus,
    pub tier: Tier,
    pub created_at: DateTime<Utc>,
    pub vote_opened_at: Option<DateTime<Utc>>,
    pub vote_expires_at: Option<DateTime<Utc>>,
    pub outcome: Option<VoteOutcome>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Pairing {
    pub fn pending(pair: PairKey, tier: Tier, now: DateTime<Utc>) -> Self {
        Self {
            id: PairingId::new(),
            pair,
            status: PairingStatus::Pending,
            tier,
            created_at: now,
            vote_opened_at: None,
            vote_expires_at: None,
            outcome: None,
            ended_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status != PairingStatus::Ended
    }

    pub fn vote_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == PairingStatus::VoteActive
            && self.vote_expires_at.is_some_and(|expiry| expiry <= now)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    pub pairing: PairingId,
    pub voter: ParticipantId,
    pub choice: VoteChoice,
    pub cast_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    MutualAccept,
    Split,
    MutualDecline,
}

impl BlockReason {
    /// Blocklist reason for a vote outcome; `None` for temporary outcomes.
    pub fn for_outcome(outcome: VoteOutcome) -> Option<Self> {
        match outcome {
            VoteOutcome::MutualAccept => Some(BlockReason::MutualAccept),
            VoteOutcome::Split => Some(BlockReason::Split),
            VoteOutcome::MutualDecline => Some(BlockReason::MutualDecline),
            VoteOutcome::Pending
            | VoteOutcome::IdleTimeout
            | VoteOutcome::PartnerDisconnected
            | VoteOutcome::Abandoned => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockEntry {
    pub pair: PairKey,
    pub reason: BlockReason,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_key_is_canonical_and_rejects_self() {
        let a = ParticipantId::new();
        let b = ParticipantId::new();
        assert_eq!(PairKey::new(a, b), PairKey::new(b, a));
        assert!(PairKey::new(a, a).is_none());

        let key = PairKey::new(a, b).unwrap();
        assert!(key.low() < key.high());
        assert_eq!(key.other(a), Some(b));
        assert_eq!(key.other(b), Some(a));
        assert_eq!(key.other(ParticipantId::new()), None);
    }

    #[test]
    fn age_range_widening_saturates() {
        let range = AgeRange::new(20, 30).widened(5);
        assert_eq!(range, AgeRange::new(15, 35));
        let edge = AgeRange::new(2, 254).widened(10);
        assert_eq!(edge, AgeRange::new(0, 255));
        assert_eq!(AgeRange::new(40, 30), AgeRange::new(30, 40));
    }

    #[test]
    fn inverted_bounds_never_underflow() {
        let inverted = AgeRange { min: 40, max: 20 };
        assert!(!inverted.is_ordered());
        assert_eq!(inverted.width(), 20);

        let parsed: AgeRange = serde_json::from_str(r#"{ "min": 40, "max": 20 }"#).unwrap();
        assert_eq!(parsed, AgeRange::new(20, 40));
        assert!(parsed.is_ordered());
    }

    #[test]
    fn empty_locale_set_accepts_anything() {
        let open = Profile::new(Gender::Female, [Gender::Male], 30);
        assert!(open.accepts_locale("de"));
        let strict = open.clone().with_accepted_locales(["en"]);
        assert!(strict.accepts_locale("en"));
        assert!(!strict.accepts_locale("de"));
    }

    #[test]
    fn only_decisive_outcomes_block() {
        assert!(VoteOutcome::MutualAccept.is_permanent());
        assert!(VoteOutcome::Split.is_permanent());
        assert!(VoteOutcome::MutualDecline.is_permanent());
        assert!(!VoteOutcome::IdleTimeout.is_permanent());
        assert!(!VoteOutcome::PartnerDisconnected.is_permanent());
        assert_eq!(BlockReason::for_outcome(VoteOutcome::IdleTimeout), None);
    }
}
