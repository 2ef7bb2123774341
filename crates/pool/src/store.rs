//! Transactional storage for the pool.
//!
//! [`PoolStore`] is the seam to the durable store collaborator. Reads return
//! owned snapshots; writes are grouped into a [`WriteBatch`] that the backend
//! applies all-or-nothing. Backends must enforce two constraints inside
//! [`PoolStore::apply`]:
//!
//! - a participant is a member of at most one non-ended pairing
//!   ([`Mutation::InsertPairing`]);
//! - [`Mutation::EndPairing`] only succeeds when the stored status matches the
//!   expected one, so two resolvers cannot both end the same pairing.
//!
//! Identity locks (see [`crate::locks`]) serialise writers per participant;
//! the constraints above are the last line that keeps a buggy caller from
//! committing a duplicate pairing.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::{
    BlockEntry, PairKey, Pairing, PairingId, PairingStatus, Participant, ParticipantId,
    QueueEntry, Vote, VoteOutcome,
};

mod memory;

pub use memory::MemoryStore;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// A batch violated a uniqueness or compare-and-set constraint.
    #[error("constraint violation: {0}")]
    Constraint(String),
    /// A batch referenced a row that does not exist.
    #[error("row not found: {0}")]
    NotFound(String),
    /// The backend itself failed.
    #[error("storage backend failure: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn constraint(msg: impl Into<String>) -> Self {
        StoreError::Constraint(msg.into())
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        StoreError::Backend(msg.into())
    }
}

/// A single write inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    PutParticipant(Participant),
    PutQueueEntry(QueueEntry),
    RemoveQueueEntry(ParticipantId),
    /// Create a pairing; fails if either member already has an open pairing.
    InsertPairing(Pairing),
    /// Overwrite an existing pairing row.
    UpdatePairing(Pairing),
    /// Compare-and-set a pairing to `ended`.
    EndPairing {
        id: PairingId,
        expected: PairingStatus,
        outcome: VoteOutcome,
        ended_at: DateTime<Utc>,
    },
    /// Upsert keyed on `(pairing, voter)`; the last write wins.
    PutVote(Vote),
    /// Idempotent; an existing entry for the same pair is kept.
    InsertBlock(BlockEntry),
}

/// Ordered set of mutations committed atomically.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<Mutation>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: Mutation) -> &mut Self {
        self.ops.push(op);
        self
    }

    pub fn put_participant(&mut self, participant: Participant) -> &mut Self {
        self.push(Mutation::PutParticipant(participant))
    }

    pub fn put_queue_entry(&mut self, entry: QueueEntry) -> &mut Self {
        self.push(Mutation::PutQueueEntry(entry))
    }

    pub fn remove_queue_entry(&mut self, id: ParticipantId) -> &mut Self {
        self.push(Mutation::RemoveQueueEntry(id))
    }

    pub fn insert_pairing(&mut self, pairing: Pairing) -> &mut Self {
        self.push(Mutation::InsertPairing(pairing))
    }

    pub fn update_pairing(&mut self, pairing: Pairing) -> &mut Self {
        self.push(Mutation::UpdatePairing(pairing))
    }

    pub fn end_pairing(
        &mut self,
        id: PairingId,
        expected: PairingStatus,
        outcome: VoteOutcome,
        ended_at: DateTime<Utc>,
    ) -> &mut Self {
        self.push(Mutation::EndPairing {
            id,
            expected,
            outcome,
            ended_at,
        })
    }

    pub fn put_vote(&mut self, vote: Vote) -> &mut Self {
        self.push(Mutation::PutVote(vote))
    }

    pub fn insert_block(&mut self, entry: BlockEntry) -> &mut Self {
        self.push(Mutation::InsertBlock(entry))
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn ops(&self) -> &[Mutation] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<Mutation> {
        self.ops
    }
}

/// Storage backend for participants, the queue, pairings, votes and the
/// blocklist.
pub trait PoolStore: Send + Sync {
    fn participant(&self, id: ParticipantId) -> Result<Option<Participant>, StoreError>;
    fn participants(&self) -> Result<Vec<Participant>, StoreError>;

    fn queue_entry(&self, id: ParticipantId) -> Result<Option<QueueEntry>, StoreError>;
    /// Snapshot of every waiting entry, in no particular order.
    fn queue(&self) -> Result<Vec<QueueEntry>, StoreError>;

    fn pairing(&self, id: PairingId) -> Result<Option<Pairing>, StoreError>;
    /// The non-ended pairing `id` belongs to, if any.
    fn open_pairing_for(&self, id: ParticipantId) -> Result<Option<Pairing>, StoreError>;
    fn open_pairings(&self) -> Result<Vec<Pairing>, StoreError>;
    fn pairings(&self) -> Result<Vec<Pairing>, StoreError>;

    fn votes(&self, pairing: PairingId) -> Result<Vec<Vote>, StoreError>;

    fn is_blocked(&self, pair: PairKey) -> Result<bool, StoreError>;
    fn blocklist(&self) -> Result<Vec<BlockEntry>, StoreError>;

    /// Apply every mutation in `batch` or none of them.
    fn apply(&self, batch: WriteBatch) -> Result<(), StoreError>;
}
