use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, SigningKey, VerifyingKey};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_MESSAGE_TTL_SECS, PROTOCOL_VERSION};
use crate::identity::AgentId;
use crate::types::*;
use crate::ProtocolError;

/// Typed intent tag of a message.
///
/// `Custom` keeps the set open: any tag unknown to this crate round-trips
/// unchanged and can be routed to a handler registered for it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Performative {
    Inform,
    Request,
    Query,
    Propose,
    Accept,
    Reject,
    Cfp,
    Bid,
    Subscribe,
    ConsensusRequest,
    ConsensusResponse,
    CapabilityRequest,
    CapabilityOffer,
    TaskNegotiation,
    CollaborationRequest,
    KnowledgeShare,
    HelpRequest,
    TaskAssignment,
    TaskResult,
    Custom(String),
}

impl Performative {
    pub fn as_str(&self) -> &str {
        match self {
            Performative::Inform => "INFORM",
            Performative::Request => "REQUEST",
            Performative::Query => "QUERY",
            Performative::Propose => "PROPOSE",
            Performative::Accept => "ACCEPT",
            Performative::Reject => "REJECT",
            Performative::Cfp => "CFP",
            Performative::Bid => "BID",
            Performative::Subscribe => "SUBSCRIBE",
            Performative::ConsensusRequest => "CONSENSUS_REQUEST",
            Performative::ConsensusResponse => "CONSENSUS_RESPONSE",
            Performative::CapabilityRequest => "CAPABILITY_REQUEST",
            Performative::CapabilityOffer => "CAPABILITY_OFFER",
            Performative::TaskNegotiation => "TASK_NEGOTIATION",
            Performative::CollaborationRequest => "COLLABORATION_REQUEST",
            Performative::KnowledgeShare => "KNOWLEDGE_SHARE",
            Performative::HelpRequest => "HELP_REQUEST",
            Performative::TaskAssignment => "TASK_ASSIGNMENT",
            Performative::TaskResult => "TASK_RESULT",
            Performative::Custom(tag) => tag.as_str(),
        }
    }
}

impl FromStr for Performative {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "INFORM" => Performative::Inform,
            "REQUEST" => Performative::Request,
            "QUERY" => Performative::Query,
            "PROPOSE" => Performative::Propose,
            "ACCEPT" => Performative::Accept,
            "REJECT" => Performative::Reject,
            "CFP" => Performative::Cfp,
            "BID" => Performative::Bid,
            "SUBSCRIBE" => Performative::Subscribe,
            "CONSENSUS_REQUEST" => Performative::ConsensusRequest,
            "CONSENSUS_RESPONSE" => Performative::ConsensusResponse,
            "CAPABILITY_REQUEST" => Performative::CapabilityRequest,
            "CAPABILITY_OFFER" => Performative::CapabilityOffer,
            "TASK_NEGOTIATION" => Performative::TaskNegotiation,
            "COLLABORATION_REQUEST" => Performative::CollaborationRequest,
            "KNOWLEDGE_SHARE" => Performative::KnowledgeShare,
            "HELP_REQUEST" => Performative::HelpRequest,
            "TASK_ASSIGNMENT" => Performative::TaskAssignment,
            "TASK_RESULT" => Performative::TaskResult,
            other => Performative::Custom(other.to_string()),
        })
    }
}

impl std::fmt::Display for Performative {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for Performative {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Performative {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        match Performative::from_str(&tag) {
            Ok(p) => Ok(p),
            Err(never) => match never {},
        }
    }
}

/// Serde adapter carrying a `Duration` as integer milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Top-level message envelope exchanged over the channel.
///
/// `conversation_id` is shared by a request and all of its responses.
/// `ttl` is relative to `created_at`; receivers recompute expiry from the two.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub protocol: String,
    pub id: String,
    pub from: AgentId,
    pub to: AgentId,
    pub performative: Performative,
    pub payload: serde_json::Value,
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(rename = "ttl_ms", with = "duration_ms")]
    pub ttl: Duration,
    pub requires_response: bool,
    /// Hex Ed25519 public key of the sender, present on signed messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_key: Option<String>,
    /// Hex Ed25519 signature over [`Message::signing_payload`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// Fields covered by the signature, in a fixed order.
#[derive(Serialize)]
struct SigningView<'a> {
    protocol: &'a str,
    id: &'a str,
    from: &'a AgentId,
    to: &'a AgentId,
    performative: &'a Performative,
    payload: &'a serde_json::Value,
    conversation_id: &'a str,
    in_reply_to: &'a Option<String>,
    created_at: &'a DateTime<Utc>,
    ttl_ms: u64,
    requires_response: bool,
    sender_key: &'a Option<String>,
}

impl Message {
    pub fn new(
        from: AgentId,
        to: AgentId,
        performative: Performative,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            protocol: PROTOCOL_VERSION.to_string(),
            id: uuid::Uuid::new_v4().to_string(),
            from,
            to,
            performative,
            payload,
            conversation_id: uuid::Uuid::new_v4().to_string(),
            in_reply_to: None,
            created_at: Utc::now(),
            ttl: Duration::from_secs(DEFAULT_MESSAGE_TTL_SECS),
            requires_response: false,
            sender_key: None,
            signature: None,
        }
    }

    /// Build a reply that stays in the conversation of `original`.
    pub fn reply_to(
        original: &Message,
        from: AgentId,
        performative: Performative,
        payload: serde_json::Value,
    ) -> Self {
        let mut reply = Message::new(from, original.from.clone(), performative, payload);
        reply.conversation_id = original.conversation_id.clone();
        reply.in_reply_to = Some(original.id.clone());
        reply.ttl = original.ttl;
        reply
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = conversation_id.into();
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn expecting_response(mut self, requires_response: bool) -> Self {
        self.requires_response = requires_response;
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.to.is_broadcast()
    }

    /// Absolute instant after which the message is void.
    pub fn expires_at(&self) -> DateTime<Utc> {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);
        self.created_at
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// A message is valid while `now <= created_at + ttl`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at()
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Time left before expiry, zero if already expired.
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at() - now).to_std().unwrap_or(Duration::ZERO)
    }

    /// Canonical bytes covered by the signature.
    pub fn signing_payload(&self) -> Result<Vec<u8>, ProtocolError> {
        let view = SigningView {
            protocol: &self.protocol,
            id: &self.id,
            from: &self.from,
            to: &self.to,
            performative: &self.performative,
            payload: &self.payload,
            conversation_id: &self.conversation_id,
            in_reply_to: &self.in_reply_to,
            created_at: &self.created_at,
            ttl_ms: self.ttl.as_millis() as u64,
            requires_response: self.requires_response,
            sender_key: &self.sender_key,
        };
        Ok(serde_json::to_vec(&view)?)
    }

    /// Attach the sender key and an Ed25519 signature.
    pub fn sign(&mut self, key: &SigningKey) -> Result<(), ProtocolError> {
        self.sender_key = Some(hex::encode(key.verifying_key().as_bytes()));
        let payload = self.signing_payload()?;
        let signature = crate::crypto::sign_message(key, &payload);
        self.signature = Some(hex::encode(signature.to_bytes()));
        Ok(())
    }

    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }

    /// Verify the signature against a known key for the sender.
    pub fn verify_with(&self, key: &VerifyingKey) -> Result<(), ProtocolError> {
        let sig_hex = self
            .signature
            .as_deref()
            .ok_or_else(|| ProtocolError::InvalidSignature("message is not signed".into()))?;
        let sig_bytes = hex::decode(sig_hex)
            .map_err(|e| ProtocolError::InvalidSignature(format!("invalid signature hex: {e}")))?;
        let sig_arr: [u8; 64] = sig_bytes
            .as_slice()
            .try_into()
            .map_err(|_| ProtocolError::InvalidSignature("signature wrong length".into()))?;
        let signature = Signature::from_bytes(&sig_arr);
        crate::crypto::verify_signature(key, &self.signing_payload()?, &signature)
    }

    /// Verify a message whose sender id is derived from its own embedded key.
    pub fn verify_self_certified(&self) -> Result<(), ProtocolError> {
        let key_hex = self
            .sender_key
            .as_deref()
            .ok_or_else(|| ProtocolError::InvalidSignature("no sender key".into()))?;
        let key = crate::crypto::verifying_key_from_hex(key_hex)?;
        if crate::crypto::derive_agent_id(&key) != self.from.as_str() {
            return Err(ProtocolError::InvalidSignature(format!(
                "sender key does not belong to {}",
                self.from
            )));
        }
        self.verify_with(&key)
    }

    /// Wire encoding (JSON).
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let message: Message = serde_json::from_slice(bytes)?;
        if message.id.is_empty() || message.conversation_id.is_empty() {
            return Err(ProtocolError::InvalidMessage(
                "message id and conversation id must be non-empty".into(),
            ));
        }
        Ok(message)
    }

    /// Decode the payload into its typed form.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| ProtocolError::PayloadMismatch {
            performative: self.performative.to_string(),
            reason: e.to_string(),
        })
    }
}

// ── Specific Message Payloads ──

/// Ask a peer whether it will provide a capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityRequestParams {
    pub capability: String,
    #[serde(default)]
    pub context: serde_json::Value,
}

/// Answer to a capability request (carried by ACCEPT or REJECT).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityResponseParams {
    pub capability: String,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// The responder's view of the requester.
    pub trust_level: TrustLevel,
}

/// Unsolicited or help-driven announcement of held capabilities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityOfferParams {
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_response_to: Option<String>,
}

/// Proposal to hand a task to a peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskNegotiationParams {
    pub negotiation_id: String,
    pub task: TaskSpec,
    pub terms: Terms,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

/// Answer to a task negotiation (carried by ACCEPT or REJECT).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiationReplyParams {
    pub negotiation_id: String,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counter_terms: Option<Terms>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaborationRequestParams {
    pub collaboration_id: String,
    pub task: TaskSpec,
    pub mode: CollaborationMode,
    pub participants: Vec<AgentId>,
    /// Position of the addressee in a sequential collaboration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaborationReplyParams {
    pub collaboration_id: String,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeShareParams {
    pub knowledge_id: String,
    pub topic: String,
    pub content: serde_json::Value,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelpRequestParams {
    pub request_id: String,
    pub problem: String,
    #[serde(default)]
    pub required_capabilities: BTreeSet<String>,
    #[serde(default)]
    pub urgency: Urgency,
    /// Peers the requester trusts most; helpers may use this to defer.
    #[serde(default)]
    pub preferred_agents: Vec<AgentId>,
}

/// Call for proposals opening a contract-net round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CfpParams {
    pub cfp_id: String,
    pub task: TaskSpec,
    pub requirements: Requirements,
    pub deadline: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusRequestParams {
    pub consensus_id: String,
    pub proposal: serde_json::Value,
    pub consensus_type: ConsensusType,
    pub deadline: DateTime<Utc>,
}

/// Task assignment from a coordinator to an executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignmentParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    pub task: TaskSpec,
    /// Outputs of completed dependencies, keyed by task id.
    #[serde(default)]
    pub inputs: BTreeMap<String, serde_json::Value>,
}

/// Result submission from an executor back to its coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResultParams {
    pub task_id: String,
    pub success: bool,
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub cost: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Message {
        Message::new(
            AgentId::from("alice"),
            AgentId::from("bob"),
            Performative::Propose,
            serde_json::json!({"task": "index", "weight": 3}),
        )
    }

    #[test]
    fn test_performative_tags_roundtrip() {
        for p in [
            Performative::Cfp,
            Performative::ConsensusResponse,
            Performative::TaskAssignment,
            Performative::Custom("AUCTION_CLOSE".into()),
        ] {
            let json = serde_json::to_string(&p).unwrap();
            let restored: Performative = serde_json::from_str(&json).unwrap();
            assert_eq!(restored, p);
        }
        assert_eq!(serde_json::to_string(&Performative::ConsensusRequest).unwrap(), "\"CONSENSUS_REQUEST\"");
    }

    #[test]
    fn test_expiry_boundary_is_inclusive() {
        let msg = sample().with_ttl(Duration::from_secs(10));
        let at_deadline = msg.created_at + chrono::Duration::seconds(10);
        assert!(!msg.is_expired_at(at_deadline));
        assert!(msg.is_expired_at(at_deadline + chrono::Duration::milliseconds(1)));
    }

    #[test]
    fn test_reply_keeps_conversation() {
        let request = sample().expecting_response(true);
        let reply = Message::reply_to(&request, AgentId::from("bob"), Performative::Accept, serde_json::json!({}));
        assert_eq!(reply.conversation_id, request.conversation_id);
        assert_eq!(reply.in_reply_to.as_deref(), Some(request.id.as_str()));
        assert_eq!(reply.to, AgentId::from("alice"));
        assert!(!reply.requires_response);
    }

    #[test]
    fn test_wire_shape_carries_ttl_ms_and_timestamp() {
        let msg = sample().with_ttl(Duration::from_millis(1500));
        let value: serde_json::Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["ttl_ms"], 1500);
        assert_eq!(value["performative"], "PROPOSE");
        assert!(value["created_at"].is_string());
        assert!(value.get("signature").is_none());
    }

    #[test]
    fn test_decode_rejects_empty_ids() {
        let mut msg = sample();
        msg.conversation_id.clear();
        let bytes = serde_json::to_vec(&msg).unwrap();
        assert!(matches!(Message::decode(&bytes), Err(ProtocolError::InvalidMessage(_))));
    }

    #[test]
    fn test_payload_mismatch_reported() {
        let msg = sample();
        let result = msg.payload_as::<TaskResultParams>();
        assert!(matches!(result, Err(ProtocolError::PayloadMismatch { .. })));
    }
}
