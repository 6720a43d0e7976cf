use std::time::Duration;

use hive_network::NetworkError;
use hive_protocol::ProtocolError;
use thiserror::Error;

use crate::negotiation::NegotiationStatus;

/// Errors surfaced by an agent endpoint.
#[derive(Debug, Error)]
pub enum AgentError {
    /// No correlated reply arrived within the request's ttl. Retryable.
    #[error("no response in conversation {conversation_id} within {ttl:?}")]
    ResponseTimeout {
        conversation_id: String,
        ttl: Duration,
    },

    /// The request was cancelled explicitly. Not retryable.
    #[error("request in conversation {0} was cancelled")]
    Cancelled(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("conversation {0} already has a pending request")]
    DuplicateConversation(String),

    #[error("negotiation {negotiation_id} is already {status}")]
    InvalidTransition {
        negotiation_id: String,
        status: NegotiationStatus,
    },

    #[error("unknown negotiation: {0}")]
    UnknownNegotiation(String),

    #[error("unknown knowledge item: {0}")]
    UnknownKnowledge(String),

    #[error("response generator failed: {0}")]
    Generator(String),

    #[error("endpoint is not running")]
    NotRunning,

    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl AgentError {
    /// Whether the caller may reasonably retry the same operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AgentError::ResponseTimeout { .. } | AgentError::Network(_))
    }
}
