use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::AgentId;

/// A unit of work as it travels between agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub task_id: String,
    pub description: String,
    #[serde(default)]
    pub required_capabilities: BTreeSet<String>,
    #[serde(default)]
    pub priority: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
}

impl TaskSpec {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            task_id: Uuid::new_v4().to_string(),
            description: description.into(),
            required_capabilities: BTreeSet::new(),
            priority: 0,
            deadline: None,
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Capabilities from `required_capabilities` that `held` does not contain.
    pub fn missing_capabilities(&self, held: &BTreeSet<String>) -> Vec<String> {
        self.required_capabilities
            .iter()
            .filter(|c| !held.contains(*c))
            .cloned()
            .collect()
    }
}

/// Terms attached to a task negotiation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Terms {
    pub deadline: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_level: Option<f64>,
}

impl Terms {
    pub fn with_deadline(deadline: DateTime<Utc>) -> Self {
        Self {
            deadline,
            compensation: None,
            quality_level: None,
        }
    }
}

/// How the participants of a collaboration are organised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollaborationMode {
    Parallel,
    Sequential,
    Hierarchical,
}

/// Discrete trust level derived from a locally held trust score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    /// No interaction has been observed with this peer.
    Unknown,
    Untrusted,
    Low,
    Medium,
    High,
}

impl std::fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Untrusted => "untrusted",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        };
        write!(f, "{s}")
    }
}

/// Decision rule applied to a consensus round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusType {
    /// Every participant approves.
    Unanimous,
    /// More than half of all participants approve.
    Majority,
    /// At least two thirds of all participants approve.
    Supermajority,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Vote {
    Approve,
    Reject,
}

/// Outcome of a consensus round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
    /// No participant replied.
    Unknown,
}

/// A single vote cast in a consensus round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusBallot {
    pub consensus_id: String,
    pub from_agent: AgentId,
    pub vote: Vote,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

/// A bid submitted in answer to a call for proposals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bid {
    pub bid_id: String,
    pub cfp_id: String,
    pub from_agent: AgentId,
    pub cost: f64,
    /// Estimated completion time in milliseconds.
    pub estimated_time_ms: u64,
    pub quality_level: f64,
    pub valid_until: DateTime<Utc>,
}

/// What a bidder is prepared to offer for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BidQuote {
    pub cost: f64,
    pub estimated_time_ms: u64,
    pub quality_level: f64,
}

/// A single eligibility criterion of a call for proposals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Criterion {
    Capability(String),
    MaxCost(f64),
    MaxEstimatedTimeMs(u64),
    MinQuality(f64),
}

impl Criterion {
    pub fn is_satisfied_by(&self, capabilities: &BTreeSet<String>, quote: &BidQuote) -> bool {
        match self {
            Criterion::Capability(c) => capabilities.contains(c),
            Criterion::MaxCost(max) => quote.cost <= *max,
            Criterion::MaxEstimatedTimeMs(max) => quote.estimated_time_ms <= *max,
            Criterion::MinQuality(min) => quote.quality_level >= *min,
        }
    }
}

/// Requirements of a call for proposals; a bidder must satisfy all criteria.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Requirements {
    #[serde(default)]
    pub criteria: Vec<Criterion>,
}

impl Requirements {
    pub fn new(criteria: Vec<Criterion>) -> Self {
        Self { criteria }
    }

    pub fn is_satisfied_by(&self, capabilities: &BTreeSet<String>, quote: &BidQuote) -> bool {
        self.criteria
            .iter()
            .all(|c| c.is_satisfied_by(capabilities, quote))
    }
}
