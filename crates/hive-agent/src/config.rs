use std::collections::BTreeSet;
use std::time::Duration;

use hive_protocol::constants::*;

/// Tunables of one agent endpoint.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Capabilities this agent holds.
    pub capabilities: BTreeSet<String>,
    /// Concurrent commitments that correspond to a workload of 1.0.
    pub workload_capacity: usize,
    /// New work is declined above this workload.
    pub max_acceptable_workload: f64,
    /// Proposed deadlines closer than this are declined.
    pub min_deadline_lead: Duration,
    /// Drop inbound messages that carry no valid signature.
    pub require_signatures: bool,
    /// How long delivered message ids are remembered.
    pub dedup_window: Duration,
    pub default_ttl: Duration,
    pub capability_request_ttl: Duration,
    pub negotiation_ttl: Duration,
    pub collaboration_ttl: Duration,
    pub help_request_ttl: Duration,
    /// Shared knowledge items kept before the oldest is evicted.
    pub knowledge_limit: usize,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            capabilities: BTreeSet::new(),
            workload_capacity: DEFAULT_WORKLOAD_CAPACITY,
            max_acceptable_workload: MAX_ACCEPTABLE_WORKLOAD,
            min_deadline_lead: Duration::from_secs(MIN_DEADLINE_LEAD_SECS),
            require_signatures: false,
            dedup_window: Duration::from_secs(DEDUP_WINDOW_SECS),
            default_ttl: Duration::from_secs(DEFAULT_MESSAGE_TTL_SECS),
            capability_request_ttl: Duration::from_secs(CAPABILITY_REQUEST_TTL_SECS),
            negotiation_ttl: Duration::from_secs(NEGOTIATION_TTL_SECS),
            collaboration_ttl: Duration::from_secs(COLLABORATION_TTL_SECS),
            help_request_ttl: Duration::from_secs(HELP_REQUEST_TTL_SECS),
            knowledge_limit: 256,
        }
    }
}

impl EndpointConfig {
    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }
}
