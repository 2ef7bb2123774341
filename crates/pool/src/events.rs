//! Structured events emitted by the engine.
//!
//! The engine writes every lifecycle change, score write and repair to an
//! [`EventSink`]. Sinks are fire-and-forget: `emit` cannot fail and must not
//! block for long. Storage and display of the events belong to whoever
//! implements the sink.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::lifecycle::LifecycleState;
use crate::types::{BlockReason, PairingId, ParticipantId, Tier, VoteChoice, VoteOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaveReason {
    UserRequested,
    Disconnected,
    Cooldown,
    /// Queue slot consumed by a committed pairing.
    Paired,
    Repair,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoostReason {
    /// Accepted while the partner declined.
    AcceptedInSplit,
    /// Accepted while the partner never voted.
    AcceptedBeforeTimeout,
    /// Accepted (or was waiting) when the partner disconnected.
    PartnerDisconnected,
    /// Operator or collaborator supplied boost.
    Manual(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreReason {
    Enqueued,
    Recompute,
    Boost(BoostReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairKind {
    /// Paired with no vote window ever opened.
    StalePending,
    /// Vote window expired without resolution.
    ExpiredVote,
    /// Partner back-references disagree.
    AsymmetricPartner,
    /// Lifecycle state contradicts the stored facts.
    IllegalState,
    /// Queue entry whose owner is not waiting.
    OrphanQueueEntry,
}

impl RepairKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StalePending => "stale_pending",
            Self::ExpiredVote => "expired_vote",
            Self::AsymmetricPartner => "asymmetric_partner",
            Self::IllegalState => "illegal_state",
            Self::OrphanQueueEntry => "orphan_queue_entry",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PoolEvent {
    Registered {
        participant: ParticipantId,
    },
    Joined {
        participant: ParticipantId,
        refreshed: bool,
    },
    JoinRejected {
        participant: ParticipantId,
        reason: String,
    },
    Left {
        participant: ParticipantId,
        reason: LeaveReason,
    },
    ScoreChanged {
        participant: ParticipantId,
        before: f64,
        after: f64,
        reason: ScoreReason,
    },
    Paired {
        pairing: PairingId,
        low: ParticipantId,
        high: ParticipantId,
        tier: Tier,
    },
    VoteWindowOpened {
        pairing: PairingId,
        expires_at: DateTime<Utc>,
    },
    VoteRecorded {
        pairing: PairingId,
        voter: ParticipantId,
        choice: VoteChoice,
    },
    VoteResolved {
        pairing: PairingId,
        outcome: VoteOutcome,
    },
    SessionStarted {
        pairing: PairingId,
        participants: [ParticipantId; 2],
    },
    SessionEnded {
        pairing: PairingId,
    },
    SessionInterrupted {
        pairing: PairingId,
        participant: ParticipantId,
    },
    Blocklisted {
        low: ParticipantId,
        high: ParticipantId,
        reason: BlockReason,
    },
    Requeued {
        participant: ParticipantId,
        boosted: bool,
    },
    SoftOffline {
        participant: ParticipantId,
    },
    Resumed {
        participant: ParticipantId,
        state: LifecycleState,
    },
    Offline {
        participant: ParticipantId,
        cooldown_until: DateTime<Utc>,
    },
    Reconnected {
        participant: ParticipantId,
        state: LifecycleState,
    },
    TransitionRejected {
        participant: ParticipantId,
        from: LifecycleState,
        event: String,
    },
    MatchAnomaly {
        participant: ParticipantId,
        attempts: u32,
        detail: String,
    },
    Repair {
        kind: RepairKind,
        participant: Option<ParticipantId>,
        pairing: Option<PairingId>,
        before: serde_json::Value,
        after: serde_json::Value,
    },
}

impl PoolEvent {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Registered { .. } => "registered",
            Self::Joined { .. } => "joined",
            Self::JoinRejected { .. } => "join_rejected",
            Self::Left { .. } => "left",
            Self::ScoreChanged { .. } => "score_changed",
            Self::Paired { .. } => "paired",
            Self::VoteWindowOpened { .. } => "vote_window_opened",
            Self::VoteRecorded { .. } => "vote_recorded",
            Self::VoteResolved { .. } => "vote_resolved",
            Self::SessionStarted { .. } => "session_started",
            Self::SessionEnded { .. } => "session_ended",
            Self::SessionInterrupted { .. } => "session_interrupted",
            Self::Blocklisted { .. } => "blocklisted",
            Self::Requeued { .. } => "requeued",
            Self::SoftOffline { .. } => "soft_offline",
            Self::Resumed { .. } => "resumed",
            Self::Offline { .. } => "offline",
            Self::Reconnected { .. } => "reconnected",
            Self::TransitionRejected { .. } => "transition_rejected",
            Self::MatchAnomaly { .. } => "match_anomaly",
            Self::Repair { .. } => "repair",
        }
    }

    /// Events that indicate a bug or drift rather than normal traffic.
    pub const fn is_anomaly(&self) -> bool {
        matches!(
            self,
            Self::TransitionRejected { .. } | Self::MatchAnomaly { .. } | Self::Repair { .. }
        )
    }
}

/// Write-only destination for [`PoolEvent`]s.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: PoolEvent);
}

/// Forwards events to `tracing`, anomalies at `warn`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: PoolEvent) {
        let name = event.name();
        let payload = serde_json::to_string(&event).unwrap_or_default();
        if event.is_anomaly() {
            warn!(event = name, payload = %payload, "pool_anomaly");
        } else {
            info!(event = name, payload = %payload, "pool_event");
        }
    }
}

/// Drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: PoolEvent) {}
}

/// Keeps events in memory; intended for tests and local inspection.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<PoolEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PoolEvent> {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn drain(&self) -> Vec<PoolEvent> {
        std::mem::take(&mut *self.events.lock().unwrap_or_else(|p| p.into_inner()))
    }

    pub fn count(&self, name: &str) -> usize {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|e| e.name() == name)
            .count()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: PoolEvent) {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(event);
    }
}
