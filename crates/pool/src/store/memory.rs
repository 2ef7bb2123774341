use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use crate::store::{Mutation, PoolStore, StoreError, WriteBatch};
use crate::types::{
    BlockEntry, PairKey, Pairing, PairingId, PairingStatus, Participant, ParticipantId,
    QueueEntry, Vote,
};

#[derive(Default)]
struct Tables {
    participants: HashMap<ParticipantId, Participant>,
    queue: HashMap<ParticipantId, QueueEntry>,
    pairings: HashMap<PairingId, Pairing>,
    /// Member -> its non-ended pairing. Backs the one-open-pairing constraint.
    open_by_member: HashMap<ParticipantId, PairingId>,
    votes: HashMap<(PairingId, ParticipantId), Vote>,
    blocklist: HashMap<PairKey, BlockEntry>,
}

impl Tables {
    /// Check every constraint in `ops` against current rows plus the rows the
    /// batch itself creates, without touching anything.
    fn validate(&self, ops: &[Mutation]) -> Result<(), StoreError> {
        let mut staged: HashMap<PairingId, PairingStatus> = HashMap::new();
        let mut claimed: HashSet<ParticipantId> = HashSet::new();
        let mut released: HashSet<ParticipantId> = HashSet::new();

        let status_of = |staged: &HashMap<PairingId, PairingStatus>, id: &PairingId| {
            staged
                .get(id)
                .copied()
                .or_else(|| self.pairings.get(id).map(|p| p.status))
        };

        for op in ops {
            match op {
                Mutation::InsertPairing(pairing) => {
                    if status_of(&staged, &pairing.id).is_some() {
                        return Err(StoreError::constraint(format!(
                            "pairing {} already exists",
                            pairing.id
                        )));
                    }
                    for member in pairing.pair.members() {
                        let held_in_store = self.open_by_member.contains_key(&member)
                            && !released.contains(&member);
                        if held_in_store || claimed.contains(&member) {
                            return Err(StoreError::constraint(format!(
                                "participant {member} already has an open pairing"
                            )));
                        }
                        if pairing.is_open() {
                            claimed.insert(member);
                        }
                    }
                    staged.insert(pairing.id, pairing.status);
                }
                Mutation::UpdatePairing(pairing) => {
                    if status_of(&staged, &pairing.id).is_none() {
                        return Err(StoreError::NotFound(format!("pairing {}", pairing.id)));
                    }
                    staged.insert(pairing.id, pairing.status);
                }
                Mutation::EndPairing { id, expected, .. } => match status_of(&staged, id) {
                    None => return Err(StoreError::NotFound(format!("pairing {id}"))),
                    Some(actual) if actual != *expected => {
                        return Err(StoreError::constraint(format!(
                            "pairing {id} is {actual:?}, expected {expected:?}"
                        )));
                    }
                    Some(_) => {
                        if let Some(pairing) = self.pairings.get(id) {
                            released.extend(pairing.pair.members());
                        }
                        staged.insert(*id, PairingStatus::Ended);
                    }
                },
                Mutation::PutVote(vote) => {
                    if status_of(&staged, &vote.pairing).is_none() {
                        return Err(StoreError::NotFound(format!("pairing {}", vote.pairing)));
                    }
                }
                Mutation::PutParticipant(_)
                | Mutation::PutQueueEntry(_)
                | Mutation::RemoveQueueEntry(_)
                | Mutation::InsertBlock(_) => {}
            }
        }
        Ok(())
    }

    fn put_pairing(&mut self, pairing: Pairing) {
        for member in pairing.pair.members() {
            if pairing.is_open() {
                self.open_by_member.insert(member, pairing.id);
            } else if self.open_by_member.get(&member) == Some(&pairing.id) {
                self.open_by_member.remove(&member);
            }
        }
        self.pairings.insert(pairing.id, pairing);
    }

    fn commit(&mut self, op: Mutation) {
        match op {
            Mutation::PutParticipant(participant) => {
                self.participants.insert(participant.id, participant);
            }
            Mutation::PutQueueEntry(entry) => {
                self.queue.insert(entry.participant, entry);
            }
            Mutation::RemoveQueueEntry(id) => {
                self.queue.remove(&id);
            }
            Mutation::InsertPairing(pairing) | Mutation::UpdatePairing(pairing) => {
                self.put_pairing(pairing);
            }
            Mutation::EndPairing {
                id,
                outcome,
                ended_at,
                ..
            } => {
                if let Some(mut pairing) = self.pairings.get(&id).cloned() {
                    pairing.status = PairingStatus::Ended;
                    pairing.outcome = Some(outcome);
                    pairing.ended_at = Some(ended_at);
                    self.put_pairing(pairing);
                }
            }
            Mutation::PutVote(vote) => {
                self.votes.insert((vote.pairing, vote.voter), vote);
            }
            Mutation::InsertBlock(entry) => {
                self.blocklist.entry(entry.pair).or_insert(entry);
            }
        }
    }
}

/// In-process [`PoolStore`] backed by hash maps behind a single `RwLock`.
///
/// Every batch is validated and committed under one write guard, which gives
/// the all-or-nothing semantics the engine relies on. Suitable for tests,
/// single-node deployments and as the reference for other backends.
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
        }
    }

    fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> Result<T, StoreError> {
        let guard = self
            .tables
            .read()
            .map_err(|_| StoreError::backend("poisoned lock"))?;
        Ok(f(&guard))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolStore for MemoryStore {
    fn participant(&self, id: ParticipantId) -> Result<Option<Participant>, StoreError> {
        self.read(|t| t.participants.get(&id).cloned())
    }

    fn participants(&self) -> Result<Vec<Participant>, StoreError> {
        self.read(|t| t.participants.values().cloned().collect())
    }

    fn queue_entry(&self, id: ParticipantId) -> Result<Option<QueueEntry>, StoreError> {
        self.read(|t| t.queue.get(&id).cloned())
    }

    fn queue(&self) -> Result<Vec<QueueEntry>, StoreError> {
        self.read(|t| t.queue.values().cloned().collect())
    }

    fn pairing(&self, id: PairingId) -> Result<Option<Pairing>, StoreError> {
        self.read(|t| t.pairings.get(&id).cloned())
    }

    fn open_pairing_for(&self, id: ParticipantId) -> Result<Option<Pairing>, StoreError> {
        self.read(|t| {
            t.open_by_member
                .get(&id)
                .and_then(|pairing| t.pairings.get(pairing))
                .cloned()
        })
    }

    fn open_pairings(&self) -> Result<Vec<Pairing>, StoreError> {
        self.read(|t| {
            t.pairings
                .values()
                .filter(|p| p.is_open())
                .cloned()
                .collect()
        })
    }

    fn pairings(&self) -> Result<Vec<Pairing>, StoreError> {
        self.read(|t| t.pairings.values().cloned().collect())
    }

    fn votes(&self, pairing: PairingId) -> Result<Vec<Vote>, StoreError> {
        self.read(|t| {
            t.votes
                .values()
                .filter(|v| v.pairing == pairing)
                .cloned()
                .collect()
        })
    }

    fn is_blocked(&self, pair: PairKey) -> Result<bool, StoreError> {
        self.read(|t| t.blocklist.contains_key(&pair))
    }

    fn blocklist(&self) -> Result<Vec<BlockEntry>, StoreError> {
        self.read(|t| t.blocklist.values().cloned().collect())
    }

    fn apply(&self, batch: WriteBatch) -> Result<(), StoreError> {
        // The write guard is held for validation and commit together.
        let mut guard = self
            .tables
            .write()
            .map_err(|_| StoreError::backend("poisoned lock"))?;
        guard.validate(batch.ops())?;
        for op in batch.into_ops() {
            guard.commit(op);
        }
        Ok(())
    }
}
