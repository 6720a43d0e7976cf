use thiserror::Error;

/// Errors raised while building, encoding or verifying protocol messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("message {message_id} expired at {expired_at}")]
    Expired {
        message_id: String,
        expired_at: chrono::DateTime<chrono::Utc>,
    },

    #[error("duplicate delivery of message {0}")]
    Duplicate(String),

    #[error("payload does not match performative {performative}: {reason}")]
    PayloadMismatch { performative: String, reason: String },
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::Serialization(e.to_string())
    }
}
