use std::collections::HashMap;

use chrono::{DateTime, Utc};
use hive_protocol::{AgentId, TaskSpec, Terms};
use serde::{Deserialize, Serialize};

use crate::AgentError;

/// Lifecycle of a negotiation. `Accepted` and `Rejected` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationStatus {
    Negotiating,
    Accepted,
    Rejected,
}

impl std::fmt::Display for NegotiationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Negotiating => "negotiating",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
        };
        write!(f, "{s}")
    }
}

/// Who opened the negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationDirection {
    /// We proposed the task to a peer.
    Outbound,
    /// A peer proposed the task to us.
    Inbound,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Negotiation {
    pub id: String,
    pub counterparty: AgentId,
    pub task: TaskSpec,
    pub direction: NegotiationDirection,
    pub status: NegotiationStatus,
    pub proposed_terms: Terms,
    pub counter_terms: Option<Terms>,
    /// Reason code recorded on rejection.
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Negotiation {
    pub fn new(
        id: impl Into<String>,
        counterparty: AgentId,
        task: TaskSpec,
        proposed_terms: Terms,
        direction: NegotiationDirection,
    ) -> Self {
        Self {
            id: id.into(),
            counterparty,
            task,
            direction,
            status: NegotiationStatus::Negotiating,
            proposed_terms,
            counter_terms: None,
            reason: None,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status != NegotiationStatus::Negotiating
    }

    pub fn accept(&mut self, counter_terms: Option<Terms>) -> Result<(), AgentError> {
        self.ensure_open()?;
        self.status = NegotiationStatus::Accepted;
        self.counter_terms = counter_terms;
        self.resolved_at = Some(Utc::now());
        Ok(())
    }

    pub fn reject(&mut self, reason: impl Into<String>) -> Result<(), AgentError> {
        self.ensure_open()?;
        self.status = NegotiationStatus::Rejected;
        self.reason = Some(reason.into());
        self.resolved_at = Some(Utc::now());
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), AgentError> {
        if self.is_terminal() {
            return Err(AgentError::InvalidTransition {
                negotiation_id: self.id.clone(),
                status: self.status,
            });
        }
        Ok(())
    }
}

/// Negotiations owned by one endpoint, keyed by negotiation id.
#[derive(Debug, Default)]
pub struct NegotiationBook {
    negotiations: HashMap<String, Negotiation>,
}

impl NegotiationBook {
    pub fn insert(&mut self, negotiation: Negotiation) {
        self.negotiations.insert(negotiation.id.clone(), negotiation);
    }

    pub fn get(&self, id: &str) -> Option<&Negotiation> {
        self.negotiations.get(id)
    }

    pub fn accept(&mut self, id: &str, counter_terms: Option<Terms>) -> Result<&Negotiation, AgentError> {
        let negotiation = self
            .negotiations
            .get_mut(id)
            .ok_or_else(|| AgentError::UnknownNegotiation(id.to_string()))?;
        negotiation.accept(counter_terms)?;
        Ok(negotiation)
    }

    pub fn reject(&mut self, id: &str, reason: &str) -> Result<&Negotiation, AgentError> {
        let negotiation = self
            .negotiations
            .get_mut(id)
            .ok_or_else(|| AgentError::UnknownNegotiation(id.to_string()))?;
        negotiation.reject(reason)?;
        Ok(negotiation)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Negotiation> {
        self.negotiations.values()
    }

    /// Negotiations that have not reached a terminal state.
    pub fn open_count(&self) -> usize {
        self.negotiations.values().filter(|n| !n.is_terminal()).count()
    }

    pub fn len(&self) -> usize {
        self.negotiations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.negotiations.is_empty()
    }
}
