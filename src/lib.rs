//! Workspace umbrella crate for Duet.
//!
//! Re-exports the pool state model and the matching engine so callers can
//! depend on a single crate, and wires an [`Arbiter`] from a YAML
//! [`DuetConfig`].
//!
//! ```no_run
//! use duet::{build_arbiter, DuetConfig, Gender, Profile};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = DuetConfig::from_file("duet.yaml")?;
//! let arbiter = build_arbiter(&config)?;
//!
//! let id = arbiter
//!     .register(Profile::new(Gender::Female, [Gender::Male], 29).with_age_range(25, 35))
//!     .await?;
//! arbiter.join(id).await?;
//! let pairing = arbiter.open_pairing_for(id).await?;
//! # let _ = pairing;
//! # Ok(())
//! # }
//! ```

mod config;

pub use config::{ConfigLoadError, DuetConfig};

pub use matcher::{
    Arbiter, ArbiterBuilder, Candidate, Eligibility, FairnessConfig, GuardianConfig,
    GuardianReport, IneligibleReason, LivenessConfig, LivenessReport, MatchOutcome, PairAttempt,
    PairRejection, PoolConfig, PoolError, PoolMetrics, RetryConfig, SearchConfig, SearchOrder,
    TierPolicy, VoteConfig, VoteReport, compatible, set_pool_metrics,
};
pub use pool::{
    BlockEntry, BoostReason, Clock, EventSink, Gender, LeaveReason, LifecycleState, ManualClock,
    MemorySink, MemoryStore, NoopSink, PairKey, Pairing, PairingId, PairingStatus, Participant,
    ParticipantId, PoolEvent, PoolStore, Profile, SystemClock, Tier, TracingSink, VoteChoice,
    VoteOutcome,
};

use std::sync::Arc;

use tracing::info;

/// Build an arbiter over the in-memory store with the system clock and a
/// tracing event sink.
pub fn build_arbiter(config: &DuetConfig) -> Result<Arbiter, PoolError> {
    build_arbiter_with(config, Arc::new(MemoryStore::new()), Arc::new(TracingSink))
}

/// Build an arbiter over caller-supplied storage and event sink.
pub fn build_arbiter_with(
    config: &DuetConfig,
    store: Arc<dyn PoolStore>,
    events: Arc<dyn EventSink>,
) -> Result<Arbiter, PoolError> {
    let arbiter = Arbiter::builder(config.pool.clone())
        .store(store)
        .events(events)
        .build()?;
    info!(
        config = config.name.as_deref().unwrap_or("default"),
        version = %config.pool.version,
        "arbiter_built"
    );
    Ok(arbiter)
}
