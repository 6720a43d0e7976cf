//! Hive agent endpoint
//!
//! One `AgentEndpoint` per agent identity. It owns everything local to that
//! agent: the pending-request map, the trust table, negotiations, and the
//! performative handler registry. No state is shared between endpoints.

pub mod audit;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod generator;
pub mod handlers;
pub mod mock_generator;
pub mod negotiation;
pub mod pending;

pub use audit::{AuditEntry, AuditKind, AuditLog, MemoryAuditLog, TracingAuditLog};
pub use config::EndpointConfig;
pub use endpoint::{
    AgentEndpoint, CollaborationOutcome, CollaborationReply, EndpointBuilder, HelpOffer,
    InboundOutcome, KnowledgeEntry, ParticipantOutcome, SendOptions,
};
pub use error::AgentError;
pub use generator::{
    AcceptAll, CapabilityEvaluator, Generation, GenerationOptions, GeneratorEvaluator,
    ResponseGenerator,
};
pub use handlers::{HandlerRegistry, HandlerResult, PerformativeHandler};
pub use mock_generator::MockGenerator;
pub use negotiation::{Negotiation, NegotiationDirection, NegotiationStatus};
pub use pending::{PendingRequest, PendingResponse, PendingStats};
