//! Engine configuration.
//!
//! Every knob has a serde default so partial YAML/JSON documents deserialize
//! into a complete [`PoolConfig`]. Durations are written as milliseconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PoolError;
use crate::retry::RetryConfig;

/// Weights and caps for the fairness score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FairnessConfig {
    /// Points per second waited.
    #[serde(default = "FairnessConfig::default_wait_weight")]
    pub wait_weight: f64,
    /// Ceiling for the wait contribution.
    #[serde(default = "FairnessConfig::default_wait_cap")]
    pub wait_cap: f64,
    /// Points granted by one compensating boost.
    #[serde(default = "FairnessConfig::default_boost_increment")]
    pub boost_increment: f64,
    #[serde(default = "FairnessConfig::default_boost_cap")]
    pub boost_cap: f64,
    /// Penalty per decline that produced a split.
    #[serde(default = "FairnessConfig::default_skip_weight")]
    pub skip_weight: f64,
    #[serde(default = "FairnessConfig::default_skip_cap")]
    pub skip_cap: f64,
    /// Scale of the narrow-age-range bonus (full weight for a zero-width range).
    #[serde(default = "FairnessConfig::default_narrowness_weight")]
    pub narrowness_weight: f64,
    /// Added when the participant restricts accepted locales.
    #[serde(default = "FairnessConfig::default_locale_bonus")]
    pub locale_bonus: f64,
    #[serde(default = "FairnessConfig::default_narrowness_cap")]
    pub narrowness_cap: f64,
    #[serde(default = "FairnessConfig::default_low_density_bonus")]
    pub low_density_bonus: f64,
    /// Fewer compatible counterparts than this earns the low-density bonus.
    #[serde(default = "FairnessConfig::default_low_density_threshold")]
    pub low_density_threshold: usize,
}

impl FairnessConfig {
    pub(crate) fn default_wait_weight() -> f64 {
        1.0
    }

    pub(crate) fn default_wait_cap() -> f64 {
        120.0
    }

    pub(crate) fn default_boost_increment() -> f64 {
        25.0
    }

    pub(crate) fn default_boost_cap() -> f64 {
        100.0
    }

    pub(crate) fn default_skip_weight() -> f64 {
        5.0
    }

    pub(crate) fn default_skip_cap() -> f64 {
        30.0
    }

    pub(crate) fn default_narrowness_weight() -> f64 {
        10.0
    }

    pub(crate) fn default_locale_bonus() -> f64 {
        10.0
    }

    pub(crate) fn default_narrowness_cap() -> f64 {
        20.0
    }

    pub(crate) fn default_low_density_bonus() -> f64 {
        15.0
    }

    pub(crate) fn default_low_density_threshold() -> usize {
        3
    }
}

impl Default for FairnessConfig {
    fn default() -> Self {
        Self {
            wait_weight: Self::default_wait_weight(),
            wait_cap: Self::default_wait_cap(),
            boost_increment: Self::default_boost_increment(),
            boost_cap: Self::default_boost_cap(),
            skip_weight: Self::default_skip_weight(),
            skip_cap: Self::default_skip_cap(),
            narrowness_weight: Self::default_narrowness_weight(),
            locale_bonus: Self::default_locale_bonus(),
            narrowness_cap: Self::default_narrowness_cap(),
            low_density_bonus: Self::default_low_density_bonus(),
            low_density_threshold: Self::default_low_density_threshold(),
        }
    }
}

/// Candidate search and orchestrator pacing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Maximum candidates returned per search.
    #[serde(default = "SearchConfig::default_candidate_limit")]
    pub candidate_limit: usize,
    /// Wait after which Tier 2 widening level 1 applies.
    #[serde(
        with = "crate::serde_millis",
        default = "SearchConfig::default_tier2_first_threshold"
    )]
    pub tier2_first_threshold: Duration,
    /// Wait after which Tier 2 widening level 2 applies.
    #[serde(
        with = "crate::serde_millis",
        default = "SearchConfig::default_tier2_second_threshold"
    )]
    pub tier2_second_threshold: Duration,
    /// Years added to each end of both age ranges per widening level.
    #[serde(default = "SearchConfig::default_age_widen_step")]
    pub age_widen_step: u8,
    #[serde(default = "SearchConfig::default_tier3_max_attempts")]
    pub tier3_max_attempts: u32,
    #[serde(
        with = "crate::serde_millis",
        default = "SearchConfig::default_tier3_retry_delay"
    )]
    pub tier3_retry_delay: Duration,
    /// Recompute the searcher's fairness score every N Tier 3 attempts.
    #[serde(default = "SearchConfig::default_recompute_every")]
    pub recompute_every: u32,
    /// Run one orchestrator pass for a participant as soon as it joins.
    /// When off, only `run_matching_cycle` and `find_partner` pair.
    #[serde(default = "SearchConfig::default_match_on_join")]
    pub match_on_join: bool,
}

impl SearchConfig {
    pub(crate) fn default_candidate_limit() -> usize {
        16
    }

    pub(crate) fn default_tier2_first_threshold() -> Duration {
        Duration::from_secs(30)
    }

    pub(crate) fn default_tier2_second_threshold() -> Duration {
        Duration::from_secs(60)
    }

    pub(crate) fn default_age_widen_step() -> u8 {
        5
    }

    pub(crate) fn default_tier3_max_attempts() -> u32 {
        30
    }

    pub(crate) fn default_tier3_retry_delay() -> Duration {
        Duration::from_secs(1)
    }

    pub(crate) fn default_recompute_every() -> u32 {
        5
    }

    pub(crate) fn default_match_on_join() -> bool {
        true
    }

    /// Tier 2 widening level for a participant that has waited `wait`.
    pub fn widening_level(&self, wait: Duration) -> Option<u8> {
        if wait >= self.tier2_second_threshold {
            Some(2)
        } else if wait >= self.tier2_first_threshold {
            Some(1)
        } else {
            None
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            candidate_limit: Self::default_candidate_limit(),
            tier2_first_threshold: Self::default_tier2_first_threshold(),
            tier2_second_threshold: Self::default_tier2_second_threshold(),
            age_widen_step: Self::default_age_widen_step(),
            tier3_max_attempts: Self::default_tier3_max_attempts(),
            tier3_retry_delay: Self::default_tier3_retry_delay(),
            recompute_every: Self::default_recompute_every(),
            match_on_join: Self::default_match_on_join(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteConfig {
    /// How long a pairing's vote window stays open.
    #[serde(
        with = "crate::serde_millis",
        default = "VoteConfig::default_vote_window"
    )]
    pub vote_window: Duration,
    /// Re-reads of the partner's vote before reporting "still waiting".
    #[serde(default = "VoteConfig::default_read_retries")]
    pub read_retries: u32,
    #[serde(
        with = "crate::serde_millis",
        default = "VoteConfig::default_read_delay"
    )]
    pub read_delay: Duration,
}

impl VoteConfig {
    pub(crate) fn default_vote_window() -> Duration {
        Duration::from_secs(20)
    }

    pub(crate) fn default_read_retries() -> u32 {
        3
    }

    pub(crate) fn default_read_delay() -> Duration {
        Duration::from_millis(50)
    }
}

impl Default for VoteConfig {
    fn default() -> Self {
        Self {
            vote_window: Self::default_vote_window(),
            read_retries: Self::default_read_retries(),
            read_delay: Self::default_read_delay(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LivenessConfig {
    #[serde(
        with = "crate::serde_millis",
        default = "LivenessConfig::default_soft_offline_after"
    )]
    pub soft_offline_after: Duration,
    #[serde(
        with = "crate::serde_millis",
        default = "LivenessConfig::default_offline_after"
    )]
    pub offline_after: Duration,
    /// Time an offline participant must wait before joining again.
    #[serde(
        with = "crate::serde_millis",
        default = "LivenessConfig::default_cooldown"
    )]
    pub cooldown: Duration,
}

impl LivenessConfig {
    pub(crate) fn default_soft_offline_after() -> Duration {
        Duration::from_secs(15)
    }

    pub(crate) fn default_offline_after() -> Duration {
        Duration::from_secs(45)
    }

    pub(crate) fn default_cooldown() -> Duration {
        Duration::from_secs(60)
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            soft_offline_after: Self::default_soft_offline_after(),
            offline_after: Self::default_offline_after(),
            cooldown: Self::default_cooldown(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardianConfig {
    /// How long a pairing may sit without an open vote window.
    #[serde(
        with = "crate::serde_millis",
        default = "GuardianConfig::default_pending_grace"
    )]
    pub pending_grace: Duration,
}

impl GuardianConfig {
    pub(crate) fn default_pending_grace() -> Duration {
        Duration::from_secs(5)
    }
}

impl Default for GuardianConfig {
    fn default() -> Self {
        Self {
            pending_grace: Self::default_pending_grace(),
        }
    }
}

/// Top-level configuration for an [`Arbiter`](crate::Arbiter).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Configuration schema version.
    #[serde(default = "PoolConfig::default_version")]
    pub version: String,
    #[serde(default)]
    pub fairness: FairnessConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub vote: VoteConfig,
    #[serde(default)]
    pub liveness: LivenessConfig,
    #[serde(default)]
    pub guardian: GuardianConfig,
    /// Bounded lock acquisition for user-driven single-identity operations.
    #[serde(default = "PoolConfig::default_lock_retry")]
    pub lock_retry: RetryConfig,
}

impl PoolConfig {
    pub(crate) fn default_version() -> String {
        "v1".to_string()
    }

    pub(crate) fn default_lock_retry() -> RetryConfig {
        RetryConfig::fixed(5, Duration::from_millis(10))
    }

    /// Validate the configuration before building an engine.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.version.trim().is_empty() {
            return Err(PoolError::InvalidConfig(
                "config.version must not be empty".into(),
            ));
        }

        let f = &self.fairness;
        let non_negative = [
            ("fairness.wait_weight", f.wait_weight),
            ("fairness.wait_cap", f.wait_cap),
            ("fairness.boost_increment", f.boost_increment),
            ("fairness.boost_cap", f.boost_cap),
            ("fairness.skip_weight", f.skip_weight),
            ("fairness.skip_cap", f.skip_cap),
            ("fairness.narrowness_weight", f.narrowness_weight),
            ("fairness.locale_bonus", f.locale_bonus),
            ("fairness.narrowness_cap", f.narrowness_cap),
            ("fairness.low_density_bonus", f.low_density_bonus),
        ];
        for (name, value) in non_negative {
            if !value.is_finite() || value < 0.0 {
                return Err(PoolError::InvalidConfig(format!(
                    "{name} must be a finite value >= 0.0"
                )));
            }
        }

        let s = &self.search;
        if s.candidate_limit == 0 {
            return Err(PoolError::InvalidConfig(
                "search.candidate_limit must be greater than zero".into(),
            ));
        }
        if s.tier2_second_threshold < s.tier2_first_threshold {
            return Err(PoolError::InvalidConfig(
                "search.tier2_second_threshold must be >= tier2_first_threshold".into(),
            ));
        }
        if s.tier3_max_attempts == 0 {
            return Err(PoolError::InvalidConfig(
                "search.tier3_max_attempts must be greater than zero".into(),
            ));
        }
        if s.recompute_every == 0 {
            return Err(PoolError::InvalidConfig(
                "search.recompute_every must be greater than zero".into(),
            ));
        }

        if self.vote.vote_window.is_zero() {
            return Err(PoolError::InvalidConfig(
                "vote.vote_window must be greater than zero".into(),
            ));
        }

        let l = &self.liveness;
        if l.soft_offline_after.is_zero() {
            return Err(PoolError::InvalidConfig(
                "liveness.soft_offline_after must be greater than zero".into(),
            ));
        }
        if l.offline_after <= l.soft_offline_after {
            return Err(PoolError::InvalidConfig(
                "liveness.offline_after must be greater than soft_offline_after".into(),
            ));
        }

        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            version: Self::default_version(),
            fairness: FairnessConfig::default(),
            search: SearchConfig::default(),
            vote: VoteConfig::default(),
            liveness: LivenessConfig::default(),
            guardian: GuardianConfig::default(),
            lock_retry: Self::default_lock_retry(),
        }
    }
}
