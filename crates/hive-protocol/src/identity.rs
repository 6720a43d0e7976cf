use serde::{Deserialize, Serialize};

use crate::constants::{AGENT_DID_PREFIX, BROADCAST_ADDRESS};

/// Identifier of an agent on the bus.
///
/// Any string is accepted; agents that own a signing key usually use the
/// self-certifying `did:hive:<sha256(pubkey)>` form from
/// [`crate::crypto::derive_agent_id`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    /// The pseudo-recipient of broadcast messages.
    pub fn broadcast() -> Self {
        Self(BROADCAST_ADDRESS.to_string())
    }

    pub fn is_broadcast(&self) -> bool {
        self.0 == BROADCAST_ADDRESS
    }

    /// Whether this id has the self-certifying DID form.
    pub fn is_did(&self) -> bool {
        self.0.starts_with(AGENT_DID_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AgentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_address() {
        assert!(AgentId::broadcast().is_broadcast());
        assert!(!AgentId::from("alice").is_broadcast());
    }

    #[test]
    fn test_serializes_as_plain_string() {
        let json = serde_json::to_string(&AgentId::from("alice")).unwrap();
        assert_eq!(json, "\"alice\"");
    }
}
