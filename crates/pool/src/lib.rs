//! # Duet Pool (`pool`)
//!
//! ## Purpose
//!
//! `pool` owns the shared state of the pairing engine and the primitives
//! every component uses to touch it:
//!
//! - [`types`]: participants, queue entries, pairings, votes, blocklist rows.
//! - [`lifecycle`]: the exhaustive `(state, event) -> state` table. Every
//!   lifecycle change goes through [`transition`] or [`Participant::apply`].
//! - [`store`]: the [`PoolStore`] trait with atomic [`WriteBatch`]es, plus the
//!   in-process [`MemoryStore`].
//! - [`locks`]: non-blocking per-identity locks acquired in a fixed order.
//! - [`clock`]: [`Clock`] abstraction with a manual clock for tests.
//! - [`events`]: [`PoolEvent`] and the write-only [`EventSink`].
//!
//! Matching, voting, liveness and reconciliation logic live in the `matcher`
//! crate, which only ever mutates state through this crate's store batches
//! while holding the relevant identity locks.
//!
//! ## Example
//!
//! ```
//! use chrono::Utc;
//! use pool::{
//!     Gender, MemoryStore, Participant, ParticipantId, PoolStore, Profile, WriteBatch,
//! };
//!
//! let store = MemoryStore::new();
//! let id = ParticipantId::new();
//! let profile = Profile::new(Gender::Female, [Gender::Male], 29).with_age_range(25, 35);
//!
//! let mut batch = WriteBatch::new();
//! batch.put_participant(Participant::new(id, profile, Utc::now()));
//! store.apply(batch).unwrap();
//!
//! assert!(store.participant(id).unwrap().is_some());
//! ```

pub mod clock;
pub mod events;
pub mod lifecycle;
pub mod locks;
pub mod store;
pub mod types;

pub use crate::clock::{Clock, ManualClock, SystemClock};
pub use crate::events::{
    BoostReason, EventSink, LeaveReason, MemorySink, NoopSink, PoolEvent, RepairKind, ScoreReason,
    TracingSink,
};
pub use crate::lifecycle::{transition, LifecycleEvent, LifecycleState, TransitionError};
pub use crate::locks::{IdentityGuard, LockTable, PairGuard};
pub use crate::store::{MemoryStore, Mutation, PoolStore, StoreError, WriteBatch};
pub use crate::types::{
    AgeRange, BlockEntry, BlockReason, FairnessLedger, Gender, PairKey, Pairing, PairingId,
    PairingStatus, Participant, ParticipantId, Profile, QueueEntry, Tier, Vote, VoteChoice,
    VoteOutcome,
};
