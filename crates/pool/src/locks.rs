//! Advisory per-participant exclusive locks.
//!
//! Acquisition never waits: [`LockTable::try_lock`] either claims the identity
//! or reports that someone else holds it. Two-identity acquisition always
//! goes lower id first, so no pair of callers can deadlock against each other
//! even if a future backend makes acquisition blocking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::types::{PairKey, ParticipantId};

#[derive(Debug, Clone, Copy)]
struct Holder {
    token: u64,
    acquired_at: Instant,
}

/// Table of identity locks currently held.
#[derive(Debug, Default)]
pub struct LockTable {
    held: DashMap<ParticipantId, Holder>,
    next_token: AtomicU64,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `id` if nobody holds it.
    pub fn try_lock(&self, id: ParticipantId) -> Option<IdentityGuard<'_>> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        match self.held.entry(id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(Holder {
                    token,
                    acquired_at: Instant::now(),
                });
                Some(IdentityGuard {
                    table: self,
                    id,
                    token,
                })
            }
        }
    }

    /// Claim both members of `pair`, lower id first. Nothing stays held when
    /// either claim fails.
    pub fn try_lock_pair(&self, pair: PairKey) -> Option<PairGuard<'_>> {
        let low = self.try_lock(pair.low())?;
        let high = self.try_lock(pair.high())?;
        Some(PairGuard {
            _low: low,
            _high: high,
        })
    }

    /// Claim every id in ascending order. Duplicates are claimed once.
    /// Nothing stays held when any claim fails.
    pub fn try_lock_all(&self, ids: &[ParticipantId]) -> Option<Vec<IdentityGuard<'_>>> {
        let mut ordered = ids.to_vec();
        ordered.sort();
        ordered.dedup();
        ordered.into_iter().map(|id| self.try_lock(id)).collect()
    }

    pub fn is_locked(&self, id: ParticipantId) -> bool {
        self.held.contains_key(&id)
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }

    /// Age of the oldest lock currently held, for diagnostics.
    pub fn oldest_hold(&self) -> Option<std::time::Duration> {
        self.held
            .iter()
            .map(|entry| entry.value().acquired_at.elapsed())
            .max()
    }

    fn release(&self, id: ParticipantId, token: u64) {
        self.held.remove_if(&id, |_, holder| holder.token == token);
    }
}

/// Releases the identity lock on drop.
#[derive(Debug)]
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct IdentityGuard<'a> {
    table: &'a LockTable,
    id: ParticipantId,
    token: u64,
}

impl IdentityGuard<'_> {
    pub fn id(&self) -> ParticipantId {
        self.id
    }
}

impl Drop for IdentityGuard<'_> {
    fn drop(&mut self) {
        self.table.release(self.id, self.token);
    }
}

/// Both identity locks of a pair.
#[derive(Debug)]
#[must_use = "the locks are released as soon as the guard is dropped"]
pub struct PairGuard<'a> {
    _low: IdentityGuard<'a>,
    _high: IdentityGuard<'a>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn lock_is_exclusive_and_released_on_drop() {
        let table = LockTable::new();
        let id = ParticipantId::new();
        let guard = table.try_lock(id).expect("first lock");
        assert!(table.try_lock(id).is_none());
        assert!(table.is_locked(id));
        drop(guard);
        assert!(!table.is_locked(id));
        assert!(table.try_lock(id).is_some());
    }

    #[test]
    fn failed_pair_lock_releases_the_first_claim() {
        let table = LockTable::new();
        let a = ParticipantId::new();
        let b = ParticipantId::new();
        let key = PairKey::new(a, b).unwrap();

        let _held = table.try_lock(key.high()).unwrap();
        assert!(table.try_lock_pair(key).is_none());
        assert!(!table.is_locked(key.low()));
        assert_eq!(table.held_count(), 1);
    }

    #[test]
    fn lock_all_claims_each_identity_once() {
        let table = LockTable::new();
        let a = ParticipantId::new();
        let b = ParticipantId::new();
        let guards = table.try_lock_all(&[b, a, b]).expect("free identities");
        assert_eq!(guards.len(), 2);
        assert!(table.try_lock_all(&[a]).is_none());
        drop(guards);
        assert_eq!(table.held_count(), 0);
    }

    #[test]
    fn concurrent_claims_admit_exactly_one_holder() {
        let table = Arc::new(LockTable::new());
        let id = ParticipantId::new();
        let barrier = Arc::new(std::sync::Barrier::new(16));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let table = Arc::clone(&table);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let guard = table.try_lock(id);
                    let won = guard.is_some();
                    // Hold long enough for every thread to attempt.
                    thread::sleep(std::time::Duration::from_millis(20));
                    won
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
