//! # Duet Matcher (`matcher`)
//!
//! ## Purpose
//!
//! `matcher` is the pairing engine that sits on top of the `pool` state
//! crate. It decides who enters the pool, who is paired with whom, how a
//! pairing's vote resolves, what happens when a participant goes silent,
//! and how drifted state is reconciled.
//!
//! All of it is reached through one facade, [`Arbiter`]. Components are kept
//! in separate modules but share the arbiter's store, clock, event sink,
//! identity lock table and configuration:
//!
//! - [`eligibility`]: `join` / `leave` and the [`Eligibility`] gate.
//! - [`fairness`]: capped fairness score, periodic recompute, boosts.
//! - [`search`]: the symmetric [`compatible`] predicate and tiered,
//!   fairness-ordered candidate lists.
//! - [`pairing`]: lock-ordered, re-validated atomic pairing ([`PairAttempt`]).
//! - [`orchestrator`]: Tier 1 → Tier 2 → Tier 3 passes, the persistent
//!   `find_partner` loop and the pool-wide `run_matching_cycle`.
//! - [`vote`]: vote persistence, read-after-write check and resolution.
//! - [`liveness`]: heartbeats, soft-offline, offline finalization, cooldown.
//! - [`guardian`]: idempotent reconciliation passes.
//!
//! Expected control flow (ineligible, lock conflict, no candidate) is
//! expressed as enum values; [`PoolError`] is reserved for storage failures,
//! rejected lifecycle transitions and caller mistakes.
//!
//! ## Example Usage
//!
//! ```no_run
//! use matcher::{Arbiter, PoolConfig};
//! use pool::{Gender, Profile, VoteChoice};
//!
//! # async fn demo() -> Result<(), matcher::PoolError> {
//! let arbiter = Arbiter::in_memory(PoolConfig::default())?;
//!
//! let ana = arbiter
//!     .register(Profile::new(Gender::Female, [Gender::Male], 29).with_age_range(25, 35))
//!     .await?;
//! let ben = arbiter
//!     .register(Profile::new(Gender::Male, [Gender::Female], 31).with_age_range(25, 35))
//!     .await?;
//!
//! arbiter.join(ana).await?;
//! arbiter.join(ben).await?;
//!
//! // Compatible joins pair straight away.
//! if let Some(pairing) = arbiter.open_pairing_for(ana).await? {
//!     arbiter.submit_vote(ana, pairing.id, VoteChoice::Accept).await?;
//!     let report = arbiter.submit_vote(ben, pairing.id, VoteChoice::Accept).await?;
//!     assert!(report.completed);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod eligibility;
pub mod error;
pub mod fairness;
pub mod guardian;
pub mod liveness;
pub mod metrics;
pub mod orchestrator;
pub mod pairing;
pub mod retry;
pub mod search;
pub mod vote;

mod engine;
mod serde_millis;

pub use crate::config::{
    FairnessConfig, GuardianConfig, LivenessConfig, PoolConfig, SearchConfig, VoteConfig,
};
pub use crate::eligibility::{Eligibility, IneligibleReason};
pub use crate::engine::{Arbiter, ArbiterBuilder};
pub use crate::error::PoolError;
pub use crate::fairness::{compute_score, FairnessInputs, ScoreBreakdown};
pub use crate::guardian::GuardianReport;
pub use crate::liveness::{classify, Liveness, LivenessReport};
pub use crate::metrics::{set_pool_metrics, PoolMetrics};
pub use crate::orchestrator::MatchOutcome;
pub use crate::pairing::{PairAttempt, PairRejection};
pub use crate::retry::RetryConfig;
pub use crate::search::{compatible, gender_reciprocal, Candidate, SearchOrder, TierPolicy};
pub use crate::vote::VoteReport;
