//! Hive message channel
//!
//! Provides the transport seam agents talk over:
//! - `MessageChannel` trait: topic pub/sub with per-topic publish order
//! - `InMemoryChannel`: in-process implementation backed by tokio mpsc queues
//! - `Topics`: topic naming for agent inboxes and the shared broadcast topic

pub mod channel;
pub mod topics;

pub use channel::{
    Delivery, HandlerFuture, InMemoryChannel, MessageChannel, MessageHandler, SubscriptionId,
};
pub use topics::Topics;

/// Errors raised by a message channel.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("channel is closed")]
    Closed,

    #[error("no async runtime available to drive subscription: {0}")]
    NoRuntime(String),

    #[error("invalid topic: {0}")]
    InvalidTopic(String),

    #[error("encoding error: {0}")]
    Encoding(String),
}

impl From<hive_protocol::ProtocolError> for NetworkError {
    fn from(e: hive_protocol::ProtocolError) -> Self {
        NetworkError::Encoding(e.to_string())
    }
}
