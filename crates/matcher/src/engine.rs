use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use pool::{
    BlockEntry, BoostReason, Clock, EventSink, LeaveReason, LifecycleEvent, LifecycleState,
    LockTable, MemoryStore, PairKey, Pairing, PairingId, Participant, ParticipantId, PoolEvent,
    PoolStore, Profile, SystemClock, TracingSink, Vote, VoteChoice, WriteBatch,
};
use tokio::sync::Notify;
use tracing::{info, warn, Instrument};

use crate::config::PoolConfig;
use crate::eligibility::Eligibility;
use crate::error::PoolError;
use crate::guardian::GuardianReport;
use crate::liveness::LivenessReport;
use crate::orchestrator::MatchOutcome;
use crate::pairing::PairAttempt;
use crate::retry::execute_with_retry_async;
use crate::search::{Candidate, PoolSnapshot, SearchOrder, TierPolicy};
use crate::vote::VoteReport;


/// Result of a single non-blocking lock attempt.
#[derive(Debug)]
pub(crate) enum Attempt<T> {
    Done(T),
    /// The named identity was locked by someone else.
    Busy(ParticipantId),
}

impl<T> Attempt<T> {
    pub(crate) fn map<U>(self, f: impl FnOnce(T) -> U) -> Attempt<U> {
        match self {
            Attempt::Done(value) => Attempt::Done(f(value)),
            Attempt::Busy(id) => Attempt::Busy(id),
        }
    }
}

/// Shared state behind an [`Arbiter`]. Component modules add their
/// operations as `impl Engine` blocks.
pub(crate) struct Engine {
    pub(crate) store: Arc<dyn PoolStore>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) config: PoolConfig,
    pub(crate) locks: LockTable,
    pub(crate) order: SearchOrder,
    /// Wakes sleeping `find_partner` loops on leave/disconnect/pairing.
    cancel: DashMap<ParticipantId, Arc<Notify>>,
}

impl Engine {
    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub(crate) fn emit(&self, event: PoolEvent) {
        self.events.emit(event);
    }

    pub(crate) fn require_participant(&self, id: ParticipantId) -> Result<Participant, PoolError> {
        self.store
            .participant(id)?
            .ok_or(PoolError::UnknownParticipant(id))
    }

    /// Apply a lifecycle event, reporting rejected transitions as anomalies.
    pub(crate) fn apply_event(
        &self,
        participant: &mut Participant,
        event: LifecycleEvent,
    ) -> Result<LifecycleState, PoolError> {
        participant.apply(event).map_err(|err| {
            warn!(
                participant = %participant.id,
                from = %err.from,
                event = %err.event,
                "transition_rejected"
            );
            self.emit(PoolEvent::TransitionRejected {
                participant: participant.id,
                from: err.from,
                event: err.event.to_string(),
            });
            PoolError::from(err)
        })
    }

    pub(crate) fn cancel_token(&self, id: ParticipantId) -> Arc<Notify> {
        Arc::clone(self.cancel.entry(id).or_default().value())
    }

    pub(crate) fn release_cancel_token(&self, id: ParticipantId, token: Arc<Notify>) {
        drop(token);
        self.cancel
            .remove_if(&id, |_, notify| Arc::strong_count(notify) == 1);
    }

    pub(crate) fn signal_cancel(&self, id: ParticipantId) {
        if let Some(notify) = self.cancel.get(&id) {
            notify.notify_waiters();
        }
    }

    /// Run a non-blocking locked operation, retrying briefly while its
    /// identities are busy. Never holds a lock across the sleep.
    pub(crate) async fn with_lock_retry<T, F>(&self, mut op: F) -> Result<T, PoolError>
    where
        F: FnMut() -> Result<Attempt<T>, PoolError>,
    {
        let outcome = execute_with_retry_async(&self.config.lock_retry, |_| {
            let step = match op() {
                Ok(Attempt::Done(value)) => Ok(Ok(value)),
                Ok(Attempt::Busy(id)) => Err(id),
                Err(err) => Ok(Err(err)),
            };
            std::future::ready(step)
        })
        .await;

        match outcome.into_result() {
            Ok(result) => result,
            Err(id) => Err(PoolError::LockConflict(id)),
        }
    }
}

/// Builder for an [`Arbiter`]. Unset collaborators default to an in-memory
/// store, the system clock and a tracing event sink.
pub struct ArbiterBuilder {
    config: PoolConfig,
    store: Option<Arc<dyn PoolStore>>,
    clock: Option<Arc<dyn Clock>>,
    events: Option<Arc<dyn EventSink>>,
    order: Option<SearchOrder>,
}

impl ArbiterBuilder {
    pub fn store(mut self, store: Arc<dyn PoolStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn search_order(mut self, order: SearchOrder) -> Self {
        self.order = Some(order);
        self
    }

    pub fn build(self) -> Result<Arbiter, PoolError> {
        self.config.validate()?;
        let engine = Engine {
            store: self.store.unwrap_or_else(|| Arc::new(MemoryStore::new())),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            events: self.events.unwrap_or_else(|| Arc::new(TracingSink)),
            config: self.config,
            locks: LockTable::new(),
            order: self.order.unwrap_or_default(),
            cancel: DashMap::new(),
        };
        Ok(Arbiter {
            engine: Arc::new(engine),
        })
    }
}

/// The single entry point to the pool.
///
/// Cheap to clone; clones share the same store, locks and configuration.
/// Every mutation of participant, queue, pairing, vote and blocklist rows
/// goes through one of these methods.
#[derive(Clone)]
pub struct Arbiter {
    engine: Arc<Engine>,
}

impl Arbiter {
    pub fn builder(config: PoolConfig) -> ArbiterBuilder {
        ArbiterBuilder {
            config,
            store: None,
            clock: None,
            events: None,
            order: None,
        }
    }

    /// In-memory store, system clock, tracing sink.
    pub fn in_memory(config: PoolConfig) -> Result<Self, PoolError> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.engine.config
    }

    /// Create an idle, online participant.
    pub async fn register(&self, profile: Profile) -> Result<ParticipantId, PoolError> {
        let range = profile.age_range;
        if !range.is_ordered() {
            return Err(PoolError::InvalidProfile(format!(
                "age range {}..={} is inverted",
                range.min, range.max
            )));
        }
        let engine = &self.engine;
        let id = ParticipantId::new();
        let mut batch = WriteBatch::new();
        batch.put_participant(Participant::new(id, profile, engine.now()));
        engine.store.apply(batch)?;
        info!(participant = %id, "registered");
        engine.emit(PoolEvent::Registered { participant: id });
        Ok(id)
    }

    /// Enter the pool. `false` means ineligible; errors are reserved for
    /// storage failures and lock contention.
    ///
    /// With `search.match_on_join` set (the default) an accepted join runs
    /// one orchestrator pass for `id` straight away, so a compatible waiting
    /// partner is paired without waiting for the next cycle.
    pub async fn join(&self, id: ParticipantId) -> Result<bool, PoolError> {
        let span = tracing::info_span!("join", participant = %id);
        let engine = &self.engine;
        async {
            let joined = engine.with_lock_retry(|| engine.try_join(id)).await?;
            if joined && engine.config.search.match_on_join {
                engine.match_joined(id)?;
            }
            Ok(joined)
        }
        .instrument(span)
        .await
    }

    pub async fn eligibility(&self, id: ParticipantId) -> Result<Eligibility, PoolError> {
        self.engine.eligibility(id)
    }

    /// Leave the pool. Returns whether a queue entry was removed.
    pub async fn leave(&self, id: ParticipantId, reason: LeaveReason) -> Result<bool, PoolError> {
        self.engine
            .with_lock_retry(|| self.engine.try_leave(id, reason))
            .await
    }

    /// One pass over the whole pool. Returns the number of pairings created.
    pub async fn run_matching_cycle(&self) -> Result<usize, PoolError> {
        let span = tracing::info_span!("matching_cycle");
        self.engine.run_matching_cycle().instrument(span).await
    }

    /// Persistent search for one participant.
    pub async fn find_partner(&self, id: ParticipantId) -> Result<MatchOutcome, PoolError> {
        self.engine.find_partner(id).await
    }

    /// A single atomic pairing attempt between two specific participants.
    pub async fn try_pair(
        &self,
        a: ParticipantId,
        b: ParticipantId,
        policy: TierPolicy,
    ) -> Result<PairAttempt, PoolError> {
        self.engine.try_pair(a, b, &policy)
    }

    /// Ordered candidates for `id` under `policy`, as the orchestrator sees them.
    pub async fn search(
        &self,
        id: ParticipantId,
        policy: TierPolicy,
    ) -> Result<Vec<Candidate>, PoolError> {
        let engine = &self.engine;
        let searcher = engine.require_participant(id)?;
        let snapshot = PoolSnapshot::load(engine.store.as_ref())?;
        engine.candidates(&searcher, &policy, &snapshot)
    }

    pub async fn submit_vote(
        &self,
        voter: ParticipantId,
        pairing: PairingId,
        choice: VoteChoice,
    ) -> Result<VoteReport, PoolError> {
        let span = tracing::info_span!("submit_vote", voter = %voter, pairing = %pairing);
        self.engine
            .submit_vote(voter, pairing, choice)
            .instrument(span)
            .await
    }

    /// The external session for a mutually accepted pairing finished.
    pub async fn end_session(&self, pairing: PairingId) -> Result<bool, PoolError> {
        self.engine
            .with_lock_retry(|| self.engine.try_end_session(pairing))
            .await
    }

    /// Liveness signal. Returns the participant's state afterwards.
    pub async fn heartbeat(&self, id: ParticipantId) -> Result<LifecycleState, PoolError> {
        self.engine
            .with_lock_retry(|| self.engine.try_heartbeat(id))
            .await
    }

    /// Explicit transport close: finalize to offline now. Returns `false`
    /// when the participant was already offline.
    pub async fn handle_disconnect(&self, id: ParticipantId) -> Result<bool, PoolError> {
        let span = tracing::info_span!("handle_disconnect", participant = %id);
        self.engine
            .with_lock_retry(|| self.engine.try_finalize(id))
            .instrument(span)
            .await
    }

    pub async fn scan_liveness(&self) -> Result<LivenessReport, PoolError> {
        self.engine.scan_liveness()
    }

    /// Run every reconciliation pass once. Returns the number of repairs.
    pub async fn guardian_sweep(&self) -> Result<usize, PoolError> {
        Ok(self.engine.guardian_sweep()?.total())
    }

    /// Like [`guardian_sweep`](Self::guardian_sweep) with per-pass counts.
    pub async fn guardian_report(&self) -> Result<GuardianReport, PoolError> {
        self.engine.guardian_sweep()
    }

    /// Grant boost points outside a vote outcome. Returns the points granted
    /// after the cap.
    pub async fn boost(
        &self,
        id: ParticipantId,
        amount: f64,
        reason: BoostReason,
    ) -> Result<f64, PoolError> {
        self.engine
            .with_lock_retry(|| self.engine.try_boost(id, amount, &reason))
            .await
    }

    /// Recompute every queued score now. Returns the number raised.
    pub async fn recompute_scores(&self) -> Result<usize, PoolError> {
        self.engine.recompute_scores()
    }

    /// Current queue score, if queued.
    pub async fn score(&self, id: ParticipantId) -> Result<Option<f64>, PoolError> {
        Ok(self.engine.store.queue_entry(id)?.map(|entry| entry.score))
    }

    pub async fn participant(&self, id: ParticipantId) -> Result<Option<Participant>, PoolError> {
        Ok(self.engine.store.participant(id)?)
    }

    pub async fn pairing(&self, id: PairingId) -> Result<Option<Pairing>, PoolError> {
        Ok(self.engine.store.pairing(id)?)
    }

    pub async fn open_pairing_for(&self, id: ParticipantId) -> Result<Option<Pairing>, PoolError> {
        Ok(self.engine.store.open_pairing_for(id)?)
    }

    pub async fn votes(&self, pairing: PairingId) -> Result<Vec<Vote>, PoolError> {
        Ok(self.engine.store.votes(pairing)?)
    }

    pub async fn queue_len(&self) -> Result<usize, PoolError> {
        Ok(self.engine.store.queue()?.len())
    }

    /// Symmetric blocklist lookup; a participant is never blocked with itself.
    pub async fn is_blocked(&self, a: ParticipantId, b: ParticipantId) -> Result<bool, PoolError> {
        match PairKey::new(a, b) {
            Some(pair) => Ok(self.engine.store.is_blocked(pair)?),
            None => Ok(false),
        }
    }

    pub async fn blocklist(&self) -> Result<Vec<BlockEntry>, PoolError> {
        Ok(self.engine.store.blocklist()?)
    }

    /// Identity locks currently held, for diagnostics.
    pub fn locks_held(&self) -> usize {
        self.engine.locks.held_count()
    }
}
