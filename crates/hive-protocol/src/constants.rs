//! Protocol-wide constants.

/// Version string carried by every message.
pub const PROTOCOL_VERSION: &str = "hive/1.0";

/// Recipient address used for broadcast messages.
pub const BROADCAST_ADDRESS: &str = "broadcast";

/// Prefix of self-certifying agent identifiers.
pub const AGENT_DID_PREFIX: &str = "did:hive:";

/// Default time-to-live for messages that do not specify one.
pub const DEFAULT_MESSAGE_TTL_SECS: u64 = 300;

/// Capability requests expire after 30 seconds.
pub const CAPABILITY_REQUEST_TTL_SECS: u64 = 30;

/// Task negotiations expire after 60 seconds.
pub const NEGOTIATION_TTL_SECS: u64 = 60;

/// Collaboration requests expire after 45 seconds.
pub const COLLABORATION_TTL_SECS: u64 = 45;

/// Broadcast help requests expire after 60 seconds.
pub const HELP_REQUEST_TTL_SECS: u64 = 60;

/// Default timeout for a delegated task assignment.
pub const TASK_DELEGATION_TIMEOUT_SECS: u64 = 300;

/// A proposed deadline must be at least this far in the future to be accepted.
pub const MIN_DEADLINE_LEAD_SECS: u64 = 60;

/// Maximum normalized workload at which new work is still accepted.
pub const MAX_ACCEPTABLE_WORKLOAD: f64 = 0.8;

/// Number of concurrent commitments that corresponds to a workload of 1.0.
pub const DEFAULT_WORKLOAD_CAPACITY: usize = 10;

/// Maximum number of preferred agents returned by the trust table.
pub const PREFERRED_AGENTS_LIMIT: usize = 5;

/// How long message ids are remembered for duplicate suppression.
pub const DEDUP_WINDOW_SECS: u64 = 600;

/// Reason codes attached to REJECT replies.
pub mod reject_reasons {
    pub const MISSING_CAPABILITIES: &str = "missing_capabilities";
    pub const CAPABILITY_NOT_HELD: &str = "capability_not_held";
    pub const EVALUATION_DECLINED: &str = "evaluation_declined";
    pub const DEADLINE_TOO_SOON: &str = "deadline_too_soon";
    pub const WORKLOAD_EXCEEDED: &str = "workload_exceeded";
    pub const NO_EXECUTOR: &str = "no_executor";
    pub const MALFORMED_PAYLOAD: &str = "malformed_payload";
    pub const RESPONSE_TIMEOUT: &str = "response_timeout";
}
