use std::collections::HashMap;

use chrono::{DateTime, Utc};
use hive_protocol::{AgentId, TrustLevel, PREFERRED_AGENTS_LIMIT};
use serde::{Deserialize, Serialize};

/// Score assigned to a peer the first time it is observed.
pub const INITIAL_TRUST_SCORE: f64 = 0.5;

/// Minimum score for a peer to count as preferred.
pub const PREFERRED_TRUST_THRESHOLD: f64 = 0.6;

/// Scores are kept at this many steps per unit; every event delta is a whole
/// number of steps.
const SCORE_STEPS: f64 = 100.0;

fn quantize(score: f64) -> f64 {
    (score * SCORE_STEPS).round() / SCORE_STEPS
}

/// Locally observed interaction outcome with a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustEvent {
    MessageReceived,
    TaskCompleted,
    TaskFailed,
    TaskAccepted,
    CapabilityOffered,
    KnowledgeVerified,
    KnowledgeInvalid,
}

impl TrustEvent {
    /// Fixed score delta applied for this event.
    pub fn delta(self) -> f64 {
        match self {
            Self::MessageReceived => 0.01,
            Self::TaskCompleted => 0.10,
            Self::TaskFailed => -0.05,
            Self::TaskAccepted => 0.03,
            Self::CapabilityOffered => 0.02,
            Self::KnowledgeVerified => 0.05,
            Self::KnowledgeInvalid => -0.10,
        }
    }
}

impl std::fmt::Display for TrustEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::MessageReceived => "message_received",
            Self::TaskCompleted => "task_completed",
            Self::TaskFailed => "task_failed",
            Self::TaskAccepted => "task_accepted",
            Self::CapabilityOffered => "capability_offered",
            Self::KnowledgeVerified => "knowledge_verified",
            Self::KnowledgeInvalid => "knowledge_invalid",
        };
        write!(f, "{s}")
    }
}

/// Map a score to its discrete trust level.
/// Boundaries are inclusive: 0.8 is high, 0.6 medium, 0.4 low.
pub fn level_for_score(score: f64) -> TrustLevel {
    if score >= 0.8 {
        TrustLevel::High
    } else if score >= 0.6 {
        TrustLevel::Medium
    } else if score >= 0.4 {
        TrustLevel::Low
    } else {
        TrustLevel::Untrusted
    }
}

/// Trust state for one peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustRecord {
    /// Always within [0, 1].
    pub score: f64,
    pub interaction_count: u64,
    pub last_interaction_at: DateTime<Utc>,
}

impl TrustRecord {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            score: INITIAL_TRUST_SCORE,
            interaction_count: 0,
            last_interaction_at: now,
        }
    }
}

/// Per-peer trust scores held by one endpoint.
///
/// Scores are only ever derived from interactions this endpoint observed
/// itself. Peers learn nothing but the discrete level.
#[derive(Debug, Default)]
pub struct TrustTable {
    records: HashMap<AgentId, TrustRecord>,
}

impl TrustTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `event` to `agent` and return the new score.
    pub fn record(&mut self, agent: &AgentId, event: TrustEvent) -> f64 {
        self.record_at(agent, event, Utc::now())
    }

    pub fn record_at(&mut self, agent: &AgentId, event: TrustEvent, now: DateTime<Utc>) -> f64 {
        let record = self
            .records
            .entry(agent.clone())
            .or_insert_with(|| TrustRecord::new(now));
        record.score = quantize(record.score + event.delta()).clamp(0.0, 1.0);
        record.interaction_count += 1;
        record.last_interaction_at = now;
        tracing::trace!(agent = %agent, event = %event, score = record.score, "trust updated");
        record.score
    }

    /// Seed a peer with a known score, e.g. from operator configuration.
    pub fn set_score(&mut self, agent: &AgentId, score: f64) {
        let record = self
            .records
            .entry(agent.clone())
            .or_insert_with(|| TrustRecord::new(Utc::now()));
        record.score = score.clamp(0.0, 1.0);
    }

    pub fn score(&self, agent: &AgentId) -> Option<f64> {
        self.records.get(agent).map(|r| r.score)
    }

    pub fn get(&self, agent: &AgentId) -> Option<&TrustRecord> {
        self.records.get(agent)
    }

    /// `Unknown` when the peer has never been observed.
    pub fn trust_level(&self, agent: &AgentId) -> TrustLevel {
        self.records
            .get(agent)
            .map(|r| level_for_score(r.score))
            .unwrap_or(TrustLevel::Unknown)
    }

    /// Peers scoring at least 0.6, best first, at most `PREFERRED_AGENTS_LIMIT`.
    pub fn preferred_agents(&self) -> Vec<AgentId> {
        self.preferred_agents_limited(PREFERRED_AGENTS_LIMIT)
    }

    pub fn preferred_agents_limited(&self, limit: usize) -> Vec<AgentId> {
        let mut candidates: Vec<(&AgentId, f64)> = self
            .records
            .iter()
            .filter(|(_, r)| r.score >= PREFERRED_TRUST_THRESHOLD)
            .map(|(id, r)| (id, r.score))
            .collect();
        candidates.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        candidates
            .into_iter()
            .take(limit)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
