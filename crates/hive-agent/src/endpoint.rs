//! Per-agent protocol endpoint.
//!
//! Frames traffic on the shared channel as typed performatives for one
//! agent identity:
//! - outbound: fire-and-forget `send`, correlated `request`, `broadcast`
//! - inbound: expiry, signature and duplicate screening, trust update,
//!   reply correlation, then dispatch by performative
//! - negotiation, collaboration, knowledge and help-request primitives
//!
//! Inbound traffic from the agent's inbox and the broadcast topic is fed
//! into one queue and handled strictly in order by a single dispatch task.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock as StdRwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use ed25519_dalek::{SigningKey, VerifyingKey};
use futures::future::join_all;
use hive_network::{Delivery, MessageChannel, SubscriptionId, Topics};
use hive_protocol::crypto::{derive_agent_id, generate_keypair, verifying_key_from_hex};
use hive_protocol::dedup::DeliveryWindow;
use hive_protocol::reject_reasons;
use hive_protocol::*;
use hive_state::{TrustEvent, TrustTable};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::audit::{AuditEntry, AuditKind, AuditLog, TracingAuditLog};
use crate::config::EndpointConfig;
use crate::generator::{AcceptAll, CapabilityEvaluator, ResponseGenerator};
use crate::handlers::{HandlerRegistry, PerformativeHandler};
use crate::negotiation::{Negotiation, NegotiationBook, NegotiationDirection};
use crate::pending::{PendingRequest, PendingRequests, PendingResponse, PendingStats};
use crate::AgentError;

/// Per-message overrides for outbound traffic.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Join an existing conversation instead of starting a new one.
    pub conversation_id: Option<String>,
    /// Falls back to the endpoint's default ttl.
    pub ttl: Option<Duration>,
    pub in_reply_to: Option<String>,
}

impl SendOptions {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            ..Self::default()
        }
    }

    pub fn in_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }
}

/// What the inbound pipeline did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundOutcome {
    /// Our own broadcast echoed back.
    SelfMessage,
    /// Addressed to another agent.
    Misaddressed,
    Expired,
    InvalidSignature,
    Duplicate,
    /// Completed a pending request.
    Resolved,
    /// Handed to the registered handler.
    Dispatched,
    /// No handler for the performative.
    Unhandled,
}

/// A knowledge item received from a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub knowledge_id: String,
    pub source: AgentId,
    pub topic: String,
    pub content: serde_json::Value,
    pub confidence: f64,
    pub received_at: DateTime<Utc>,
    /// Set once the item has been checked locally.
    pub verified: Option<bool>,
}

/// Answer of one invited agent to a collaboration request.
#[derive(Debug, Clone, PartialEq)]
pub enum ParticipantOutcome {
    Accepted,
    Rejected(String),
    TimedOut,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollaborationReply {
    pub agent: AgentId,
    pub outcome: ParticipantOutcome,
}

#[derive(Debug, Clone)]
pub struct CollaborationOutcome {
    pub collaboration_id: String,
    pub mode: CollaborationMode,
    /// One entry per target, in the order the targets were given.
    pub replies: Vec<CollaborationReply>,
}

impl CollaborationOutcome {
    pub fn accepted(&self) -> Vec<AgentId> {
        self.replies
            .iter()
            .filter(|r| r.outcome == ParticipantOutcome::Accepted)
            .map(|r| r.agent.clone())
            .collect()
    }
}

/// First capability offer received for a broadcast help request.
#[derive(Debug, Clone, PartialEq)]
pub struct HelpOffer {
    pub request_id: String,
    pub from: AgentId,
    pub capabilities: Vec<String>,
    pub description: String,
}

#[derive(Default)]
pub(crate) struct EndpointState {
    trust: TrustTable,
    negotiations: NegotiationBook,
    active_tasks: HashSet<String>,
    collaborations: HashSet<String>,
    peer_capabilities: HashMap<AgentId, BTreeSet<String>>,
    knowledge: VecDeque<KnowledgeEntry>,
    dedup: DeliveryWindow,
}

impl EndpointState {
    fn workload(&self, capacity: usize) -> f64 {
        let commitments =
            self.negotiations.open_count() + self.active_tasks.len() + self.collaborations.len();
        (commitments as f64 / capacity.max(1) as f64).min(1.0)
    }
}

struct EndpointInner {
    agent_id: AgentId,
    signing_key: Option<SigningKey>,
    /// Keys bound to plain agent ids, configured or first seen.
    peer_keys: StdRwLock<HashMap<AgentId, VerifyingKey>>,
    config: EndpointConfig,
    channel: Arc<dyn MessageChannel>,
    pending: PendingRequests,
    state: RwLock<EndpointState>,
    handlers: StdRwLock<HandlerRegistry>,
    evaluator: Arc<dyn CapabilityEvaluator>,
    generator: Option<Arc<dyn ResponseGenerator>>,
    audit: Arc<dyn AuditLog>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
}

/// Builder for [`AgentEndpoint`].
pub struct EndpointBuilder {
    channel: Arc<dyn MessageChannel>,
    agent_id: Option<AgentId>,
    signing_key: Option<SigningKey>,
    peer_keys: HashMap<AgentId, VerifyingKey>,
    config: EndpointConfig,
    evaluator: Option<Arc<dyn CapabilityEvaluator>>,
    generator: Option<Arc<dyn ResponseGenerator>>,
    audit: Option<Arc<dyn AuditLog>>,
}

impl EndpointBuilder {
    /// Use a plain agent id. Without a signing key, outbound messages are unsigned.
    pub fn agent_id(mut self, agent_id: impl Into<AgentId>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    /// Sign outbound messages with `key`. Unless an explicit id is set the
    /// agent id is derived from the key.
    pub fn signing_key(mut self, key: SigningKey) -> Self {
        self.signing_key = Some(key);
        self
    }

    pub fn config(mut self, config: EndpointConfig) -> Self {
        self.config = config;
        self
    }

    /// Accept signed traffic from the plain id `agent` only under `key`.
    pub fn peer_key(mut self, agent: impl Into<AgentId>, key: VerifyingKey) -> Self {
        self.peer_keys.insert(agent.into(), key);
        self
    }

    pub fn capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn evaluator(mut self, evaluator: Arc<dyn CapabilityEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    pub fn generator(mut self, generator: Arc<dyn ResponseGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn audit(mut self, audit: Arc<dyn AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn build(self) -> AgentEndpoint {
        let (agent_id, signing_key) = match (self.agent_id, self.signing_key) {
            (Some(id), key) => (id, key),
            (None, Some(key)) => (AgentId::new(derive_agent_id(&key.verifying_key())), Some(key)),
            (None, None) => {
                let key = generate_keypair();
                (AgentId::new(derive_agent_id(&key.verifying_key())), Some(key))
            }
        };

        let state = EndpointState {
            dedup: DeliveryWindow::with_window(self.config.dedup_window),
            ..EndpointState::default()
        };

        AgentEndpoint {
            inner: Arc::new(EndpointInner {
                agent_id,
                signing_key,
                peer_keys: StdRwLock::new(self.peer_keys),
                config: self.config,
                channel: self.channel,
                pending: PendingRequests::new(),
                state: RwLock::new(state),
                handlers: StdRwLock::new(HandlerRegistry::with_defaults()),
                evaluator: self.evaluator.unwrap_or_else(|| Arc::new(AcceptAll)),
                generator: self.generator,
                audit: self.audit.unwrap_or_else(|| Arc::new(TracingAuditLog)),
                subscriptions: Mutex::new(Vec::new()),
            }),
        }
    }
}

/// Typed, correlated view of the channel for one agent.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct AgentEndpoint {
    inner: Arc<EndpointInner>,
}

impl AgentEndpoint {
    pub fn builder(channel: Arc<dyn MessageChannel>) -> EndpointBuilder {
        EndpointBuilder {
            channel,
            agent_id: None,
            signing_key: None,
            peer_keys: HashMap::new(),
            config: EndpointConfig::default(),
            evaluator: None,
            generator: None,
            audit: None,
        }
    }

    // ── Lifecycle ──

    /// Subscribe to the agent inbox and the broadcast topic and start the
    /// dispatch task. Calling it again while running is a no-op.
    pub async fn start(&self) -> Result<(), AgentError> {
        let mut subscriptions = self.inner.subscriptions.lock().await;
        if !subscriptions.is_empty() {
            return Ok(());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let inbox = Topics::inbox(&self.inner.agent_id);
        subscriptions.push(self.inner.channel.subscribe_queue(&inbox, tx.clone())?);
        match self.inner.channel.subscribe_queue(&Topics::broadcast(), tx) {
            Ok(id) => subscriptions.push(id),
            Err(e) => {
                for id in subscriptions.drain(..) {
                    self.inner.channel.unsubscribe(id);
                }
                return Err(e.into());
            }
        }

        tokio::spawn(dispatch_loop(Arc::downgrade(&self.inner), rx));

        tracing::info!(
            agent_id = %self.inner.agent_id,
            capabilities = ?self.inner.config.capabilities,
            signed = self.inner.signing_key.is_some(),
            "agent endpoint started"
        );
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        !self.inner.subscriptions.lock().await.is_empty()
    }

    /// Leave the channel and cancel every outstanding request.
    pub async fn shutdown(&self) {
        let subscriptions: Vec<SubscriptionId> =
            self.inner.subscriptions.lock().await.drain(..).collect();
        for id in subscriptions {
            self.inner.channel.unsubscribe(id);
        }
        let cancelled = self.inner.pending.cancel_all().await;
        tracing::info!(agent_id = %self.inner.agent_id, cancelled, "agent endpoint stopped");
    }

    // ── Identity and configuration ──

    pub fn agent_id(&self) -> &AgentId {
        &self.inner.agent_id
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.inner.config
    }

    pub fn capabilities(&self) -> &BTreeSet<String> {
        &self.inner.config.capabilities
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.inner.config.capabilities.contains(capability)
    }

    pub fn generator(&self) -> Option<Arc<dyn ResponseGenerator>> {
        self.inner.generator.clone()
    }

    pub(crate) fn evaluator(&self) -> &Arc<dyn CapabilityEvaluator> {
        &self.inner.evaluator
    }

    /// Hand an entry to the audit sink without waiting on it.
    pub fn audit(&self, kind: AuditKind, subject: impl Into<String>, detail: serde_json::Value) {
        self.inner.audit.record(
            AuditEntry::new(self.inner.agent_id.clone(), kind, subject).with_detail(detail),
        );
    }

    /// Install `handler` for `performative`, returning the one it replaces.
    pub fn register_handler(
        &self,
        performative: Performative,
        handler: Arc<dyn PerformativeHandler>,
    ) -> Option<Arc<dyn PerformativeHandler>> {
        let mut handlers = self.inner.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.register(performative, handler)
    }

    // ── Outbound ──

    /// Send without waiting for a reply. Returns the message id.
    pub async fn send(
        &self,
        to: AgentId,
        performative: Performative,
        payload: serde_json::Value,
        options: SendOptions,
    ) -> Result<String, AgentError> {
        let message = self.prepare(to, performative, payload, &options, false)?;
        self.publish(message)
    }

    /// Send and wait for the first reply in the same conversation.
    ///
    /// Fails with `ResponseTimeout` once the ttl elapses, or `Cancelled`
    /// if [`cancel_request`](Self::cancel_request) is called meanwhile.
    pub async fn request(
        &self,
        to: AgentId,
        performative: Performative,
        payload: serde_json::Value,
        options: SendOptions,
    ) -> Result<Message, AgentError> {
        self.request_pending(to, performative, payload, options)
            .await?
            .wait()
            .await
    }

    /// Like [`request`](Self::request) but returns the await handle, whose
    /// conversation id can be used for cancellation.
    pub async fn request_pending(
        &self,
        to: AgentId,
        performative: Performative,
        payload: serde_json::Value,
        options: SendOptions,
    ) -> Result<PendingResponse, AgentError> {
        let message = self.prepare(to, performative, payload, &options, true)?;
        let expected_from = (!message.to.is_broadcast()).then(|| message.to.clone());
        let conversation_id = message.conversation_id.clone();

        // Registered before publishing so an immediate reply cannot be missed.
        let handle = self.inner.pending.register(&message, expected_from).await?;
        if let Err(e) = self.publish(message) {
            self.inner.pending.discard(&conversation_id).await;
            return Err(e);
        }
        Ok(handle)
    }

    pub async fn broadcast(
        &self,
        performative: Performative,
        payload: serde_json::Value,
        options: SendOptions,
    ) -> Result<String, AgentError> {
        self.send(AgentId::broadcast(), performative, payload, options)
            .await
    }

    /// Answer `original` within its conversation.
    pub async fn reply(
        &self,
        original: &Message,
        performative: Performative,
        payload: serde_json::Value,
    ) -> Result<String, AgentError> {
        let mut message =
            Message::reply_to(original, self.inner.agent_id.clone(), performative, payload);
        if let Some(key) = &self.inner.signing_key {
            message.sign(key)?;
        }
        self.publish(message)
    }

    pub async fn cancel_request(&self, conversation_id: &str) -> bool {
        self.inner.pending.cancel(conversation_id).await
    }

    pub async fn pending_requests(&self) -> Vec<PendingRequest> {
        self.inner.pending.snapshot().await
    }

    pub fn pending_stats(&self) -> PendingStats {
        self.inner.pending.stats()
    }

    fn prepare(
        &self,
        to: AgentId,
        performative: Performative,
        payload: serde_json::Value,
        options: &SendOptions,
        requires_response: bool,
    ) -> Result<Message, AgentError> {
        let mut message = Message::new(self.inner.agent_id.clone(), to, performative, payload)
            .with_ttl(options.ttl.unwrap_or(self.inner.config.default_ttl))
            .expecting_response(requires_response);
        if let Some(conversation_id) = &options.conversation_id {
            message.conversation_id = conversation_id.clone();
        }
        message.in_reply_to = options.in_reply_to.clone();
        if let Some(key) = &self.inner.signing_key {
            message.sign(key)?;
        }
        Ok(message)
    }

    fn publish(&self, message: Message) -> Result<String, AgentError> {
        let topic = Topics::for_recipient(&message.to);
        let id = message.id.clone();
        tracing::debug!(
            from = %message.from,
            to = %message.to,
            performative = %message.performative,
            conversation_id = %message.conversation_id,
            "sending message"
        );
        self.inner.channel.publish(&topic, message)?;
        Ok(id)
    }

    // ── Inbound ──

    /// Run one message through the inbound pipeline.
    ///
    /// Invalid messages are dropped and logged here; handler errors are
    /// logged and never propagate.
    pub async fn deliver(&self, message: Message) -> InboundOutcome {
        let inner = &self.inner;
        if message.from == inner.agent_id {
            tracing::trace!(message_id = %message.id, "ignoring own message");
            return InboundOutcome::SelfMessage;
        }
        if !message.is_broadcast() && message.to != inner.agent_id {
            tracing::debug!(message_id = %message.id, to = %message.to, "message not addressed to us");
            return InboundOutcome::Misaddressed;
        }

        let now = Utc::now();
        if message.is_expired_at(now) {
            tracing::warn!(
                agent_id = %inner.agent_id,
                message_id = %message.id,
                from = %message.from,
                performative = %message.performative,
                expired_at = %message.expires_at(),
                "dropping expired message"
            );
            return InboundOutcome::Expired;
        }

        if let Err(e) = self.check_signature(&message) {
            tracing::warn!(
                agent_id = %inner.agent_id,
                message_id = %message.id,
                from = %message.from,
                error = %e,
                "dropping message with invalid signature"
            );
            return InboundOutcome::InvalidSignature;
        }

        {
            let mut state = inner.state.write().await;
            if state.dedup.check_and_insert(&message.id, now).is_err() {
                tracing::debug!(message_id = %message.id, "duplicate delivery ignored");
                return InboundOutcome::Duplicate;
            }
            state.trust.record(&message.from, TrustEvent::MessageReceived);
        }

        if inner.pending.resolve(&message).await {
            tracing::debug!(
                conversation_id = %message.conversation_id,
                from = %message.from,
                "reply correlated"
            );
            return InboundOutcome::Resolved;
        }

        let handler = {
            let handlers = inner.handlers.read().unwrap_or_else(|e| e.into_inner());
            handlers.get(&message.performative)
        };
        let Some(handler) = handler else {
            tracing::debug!(
                performative = %message.performative,
                from = %message.from,
                "no handler registered"
            );
            return InboundOutcome::Unhandled;
        };

        if let Err(e) = handler.handle(self, &message).await {
            tracing::warn!(
                agent_id = %inner.agent_id,
                performative = %message.performative,
                message_id = %message.id,
                error = %e,
                "handler failed"
            );
        }
        InboundOutcome::Dispatched
    }

    /// `did:hive:` senders certify their own key. A plain id is only ever
    /// accepted under the key pinned for it. With `require_signatures` the
    /// key must have been pinned up front; otherwise the first verified key
    /// seen for the id is pinned.
    fn check_signature(&self, message: &Message) -> Result<(), ProtocolError> {
        if !message.is_signed() {
            if self.inner.config.require_signatures {
                return Err(ProtocolError::InvalidSignature("message is not signed".into()));
            }
            return Ok(());
        }
        if message.from.is_did() {
            return message.verify_self_certified();
        }
        let key_hex = message
            .sender_key
            .as_deref()
            .ok_or_else(|| ProtocolError::InvalidSignature("no sender key".into()))?;
        let key = verifying_key_from_hex(key_hex)?;

        let pinned = self.peer_key(&message.from);
        match pinned {
            Some(pinned) if pinned != key => {
                return Err(ProtocolError::InvalidSignature(format!(
                    "sender key does not match the key pinned for {}",
                    message.from
                )));
            }
            None if self.inner.config.require_signatures => {
                return Err(ProtocolError::InvalidSignature(format!(
                    "no key pinned for {}",
                    message.from
                )));
            }
            _ => {}
        }
        message.verify_with(&key)?;

        if pinned.is_none() {
            let mut keys = self.inner.peer_keys.write().unwrap_or_else(|e| e.into_inner());
            keys.entry(message.from.clone()).or_insert(key);
            tracing::debug!(agent = %message.from, "pinned first-seen sender key");
        }
        Ok(())
    }

    /// Key currently pinned for a plain agent id.
    pub fn peer_key(&self, agent: &AgentId) -> Option<VerifyingKey> {
        let keys = self.inner.peer_keys.read().unwrap_or_else(|e| e.into_inner());
        keys.get(agent).copied()
    }

    /// Pin (or re-pin) the key expected from `agent`.
    pub fn pin_peer_key(&self, agent: &AgentId, key: VerifyingKey) {
        let mut keys = self.inner.peer_keys.write().unwrap_or_else(|e| e.into_inner());
        keys.insert(agent.clone(), key);
    }

    /// Public half of this endpoint's signing key, if it signs.
    pub fn verifying_key(&self) -> Option<VerifyingKey> {
        self.inner.signing_key.as_ref().map(|k| k.verifying_key())
    }

    // ── Trust ──

    pub async fn trust_score(&self, agent: &AgentId) -> Option<f64> {
        self.inner.state.read().await.trust.score(agent)
    }

    pub async fn trust_level(&self, agent: &AgentId) -> TrustLevel {
        self.inner.state.read().await.trust.trust_level(agent)
    }

    pub async fn preferred_agents(&self) -> Vec<AgentId> {
        self.inner.state.read().await.trust.preferred_agents()
    }

    /// Apply a locally observed outcome to `agent`'s score.
    pub async fn record_interaction(&self, agent: &AgentId, event: TrustEvent) -> f64 {
        self.inner.state.write().await.trust.record(agent, event)
    }

    /// Seed a peer's score, e.g. from configuration.
    pub async fn seed_trust(&self, agent: &AgentId, score: f64) {
        self.inner.state.write().await.trust.set_score(agent, score);
    }

    // ── Workload ──

    /// Open negotiations, active tasks and collaborations over capacity, capped at 1.
    pub async fn workload(&self) -> f64 {
        self.inner
            .state
            .read()
            .await
            .workload(self.inner.config.workload_capacity)
    }

    /// Mark an accepted task finished. Returns whether it was active.
    pub async fn complete_task(&self, task_id: &str) -> bool {
        self.inner.state.write().await.active_tasks.remove(task_id)
    }

    pub async fn complete_collaboration(&self, collaboration_id: &str) -> bool {
        self.inner
            .state
            .write()
            .await
            .collaborations
            .remove(collaboration_id)
    }

    pub(crate) async fn begin_task(&self, task_id: &str) {
        self.inner
            .state
            .write()
            .await
            .active_tasks
            .insert(task_id.to_string());
    }

    pub(crate) async fn join_collaboration(&self, collaboration_id: &str) {
        self.inner
            .state
            .write()
            .await
            .collaborations
            .insert(collaboration_id.to_string());
    }

    // ── Capabilities ──

    /// Ask `target` whether it will provide `capability`.
    pub async fn request_capability(
        &self,
        target: AgentId,
        capability: impl Into<String>,
        context: serde_json::Value,
    ) -> Result<CapabilityResponseParams, AgentError> {
        let params = CapabilityRequestParams {
            capability: capability.into(),
            context,
        };
        let reply = self
            .request(
                target,
                Performative::CapabilityRequest,
                to_payload(&params)?,
                SendOptions::with_ttl(self.inner.config.capability_request_ttl),
            )
            .await?;
        Ok(reply.payload_as()?)
    }

    /// Advertise this agent's capabilities to `target`, or to everyone.
    pub async fn offer_capability(
        &self,
        target: Option<AgentId>,
        description: impl Into<String>,
    ) -> Result<String, AgentError> {
        let params = CapabilityOfferParams {
            capabilities: self.inner.config.capabilities.iter().cloned().collect(),
            description: description.into(),
            in_response_to: None,
        };
        self.send(
            target.unwrap_or_else(AgentId::broadcast),
            Performative::CapabilityOffer,
            to_payload(&params)?,
            SendOptions::default(),
        )
        .await
    }

    /// Capabilities a peer has advertised to us.
    pub async fn peer_capabilities(&self, agent: &AgentId) -> Option<BTreeSet<String>> {
        self.inner
            .state
            .read()
            .await
            .peer_capabilities
            .get(agent)
            .cloned()
    }

    /// Peers known to hold `capability`, most trusted first.
    pub async fn peers_with_capability(&self, capability: &str) -> Vec<AgentId> {
        let state = self.inner.state.read().await;
        let mut peers: Vec<(AgentId, f64)> = state
            .peer_capabilities
            .iter()
            .filter(|(_, caps)| caps.contains(capability))
            .map(|(id, _)| (id.clone(), state.trust.score(id).unwrap_or(0.0)))
            .collect();
        peers.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        peers.into_iter().map(|(id, _)| id).collect()
    }

    pub(crate) async fn remember_capabilities<I>(&self, agent: &AgentId, capabilities: I)
    where
        I: IntoIterator<Item = String>,
    {
        let mut state = self.inner.state.write().await;
        state
            .peer_capabilities
            .entry(agent.clone())
            .or_default()
            .extend(capabilities);
    }

    // ── Negotiation ──

    /// Propose `task` to `target` and wait for its decision.
    ///
    /// The returned negotiation is always terminal. A missing reply rejects
    /// the negotiation with `response_timeout` and surfaces `ResponseTimeout`.
    pub async fn negotiate_task(
        &self,
        target: AgentId,
        task: TaskSpec,
        terms: Terms,
        rationale: Option<String>,
    ) -> Result<Negotiation, AgentError> {
        let negotiation_id = uuid::Uuid::new_v4().to_string();
        let params = TaskNegotiationParams {
            negotiation_id: negotiation_id.clone(),
            task: task.clone(),
            terms: terms.clone(),
            rationale,
        };
        let payload = to_payload(&params)?;
        self.inner.state.write().await.negotiations.insert(Negotiation::new(
            negotiation_id.clone(),
            target.clone(),
            task,
            terms,
            NegotiationDirection::Outbound,
        ));

        let options = SendOptions::with_ttl(self.inner.config.negotiation_ttl)
            .in_conversation(negotiation_id.clone());
        let result = self
            .request(target.clone(), Performative::TaskNegotiation, payload, options)
            .await;

        let mut state = self.inner.state.write().await;
        let outcome = match result {
            Ok(reply) => {
                let decision = reply.payload_as::<NegotiationReplyParams>();
                match (&reply.performative, decision) {
                    (Performative::Accept, Ok(decision)) => {
                        state.negotiations.accept(&negotiation_id, decision.counter_terms)?;
                        state.trust.record(&target, TrustEvent::TaskAccepted);
                        Ok(AuditKind::NegotiationAccepted)
                    }
                    (Performative::Reject, Ok(decision)) => {
                        let reason = decision.reason.unwrap_or_else(|| "rejected".into());
                        state.negotiations.reject(&negotiation_id, &reason)?;
                        Ok(AuditKind::NegotiationRejected)
                    }
                    (performative, _) => {
                        state
                            .negotiations
                            .reject(&negotiation_id, reject_reasons::MALFORMED_PAYLOAD)?;
                        Err(AgentError::InvalidMessage(format!(
                            "unexpected {performative} reply to negotiation {negotiation_id}"
                        )))
                    }
                }
            }
            Err(e) => {
                let reason = match &e {
                    AgentError::ResponseTimeout { .. } => reject_reasons::RESPONSE_TIMEOUT,
                    AgentError::Cancelled(_) => "cancelled",
                    _ => "send_failed",
                };
                state.negotiations.reject(&negotiation_id, reason)?;
                Err(e)
            }
        };

        let negotiation = state
            .negotiations
            .get(&negotiation_id)
            .cloned()
            .ok_or_else(|| AgentError::UnknownNegotiation(negotiation_id.clone()))?;
        drop(state);

        let kind = match &outcome {
            Ok(kind) => *kind,
            Err(_) => AuditKind::NegotiationRejected,
        };
        self.audit(
            kind,
            &negotiation_id,
            serde_json::json!({
                "counterparty": target,
                "task_id": negotiation.task.task_id,
                "reason": negotiation.reason,
            }),
        );
        tracing::info!(
            negotiation_id = %negotiation_id,
            counterparty = %target,
            status = %negotiation.status,
            "negotiation closed"
        );

        outcome.map(|_| negotiation)
    }

    /// Accept the negotiation carried by `request`.
    pub async fn accept_task(
        &self,
        request: &Message,
        counter_terms: Option<Terms>,
    ) -> Result<String, AgentError> {
        let params: TaskNegotiationParams = request.payload_as()?;
        {
            let mut state = self.inner.state.write().await;
            track_inbound(&mut state, request, &params);
            state
                .negotiations
                .accept(&params.negotiation_id, counter_terms.clone())?;
            state.active_tasks.insert(params.task.task_id.clone());
        }
        self.audit(
            AuditKind::NegotiationAccepted,
            &params.negotiation_id,
            serde_json::json!({ "counterparty": request.from, "task_id": params.task.task_id }),
        );
        let reply = NegotiationReplyParams {
            negotiation_id: params.negotiation_id,
            accepted: true,
            reason: None,
            counter_terms,
        };
        self.reply(request, Performative::Accept, to_payload(&reply)?)
            .await
    }

    /// Reject the negotiation carried by `request` with a reason code.
    pub async fn reject_task(&self, request: &Message, reason: &str) -> Result<String, AgentError> {
        let params: TaskNegotiationParams = request.payload_as()?;
        {
            let mut state = self.inner.state.write().await;
            track_inbound(&mut state, request, &params);
            state.negotiations.reject(&params.negotiation_id, reason)?;
        }
        self.audit(
            AuditKind::NegotiationRejected,
            &params.negotiation_id,
            serde_json::json!({ "counterparty": request.from, "reason": reason }),
        );
        let reply = NegotiationReplyParams {
            negotiation_id: params.negotiation_id,
            accepted: false,
            reason: Some(reason.to_string()),
            counter_terms: None,
        };
        self.reply(request, Performative::Reject, to_payload(&reply)?)
            .await
    }

    /// Check a proposed task against local capabilities, deadline lead and
    /// workload. `Err` carries the reason code to reply with.
    pub async fn evaluate_task(&self, task: &TaskSpec, terms: &Terms) -> Result<(), &'static str> {
        let config = &self.inner.config;
        if !task.missing_capabilities(&config.capabilities).is_empty() {
            return Err(reject_reasons::MISSING_CAPABILITIES);
        }
        let earliest = chrono::Duration::from_std(config.min_deadline_lead)
            .ok()
            .and_then(|lead| Utc::now().checked_add_signed(lead));
        match earliest {
            Some(earliest) if terms.deadline >= earliest => {}
            _ => return Err(reject_reasons::DEADLINE_TOO_SOON),
        }
        if self.workload().await > config.max_acceptable_workload {
            return Err(reject_reasons::WORKLOAD_EXCEEDED);
        }
        Ok(())
    }

    pub async fn negotiation(&self, negotiation_id: &str) -> Option<Negotiation> {
        self.inner
            .state
            .read()
            .await
            .negotiations
            .get(negotiation_id)
            .cloned()
    }

    /// All negotiations this endpoint has taken part in, oldest first.
    pub async fn negotiations(&self) -> Vec<Negotiation> {
        let state = self.inner.state.read().await;
        let mut all: Vec<Negotiation> = state.negotiations.iter().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }

    // ── Collaboration ──

    /// Invite each target into a collaboration on `task`.
    ///
    /// Invitations go out concurrently, one conversation per target, and the
    /// call returns once every target has answered or timed out.
    pub async fn request_collaboration(
        &self,
        targets: &[AgentId],
        task: TaskSpec,
        mode: CollaborationMode,
    ) -> Result<CollaborationOutcome, AgentError> {
        let collaboration_id = uuid::Uuid::new_v4().to_string();
        let ttl = self.inner.config.collaboration_ttl;

        let invitations = targets.iter().enumerate().map(|(position, target)| {
            let params = CollaborationRequestParams {
                collaboration_id: collaboration_id.clone(),
                task: task.clone(),
                mode,
                participants: targets.to_vec(),
                position: match mode {
                    CollaborationMode::Parallel => None,
                    CollaborationMode::Sequential | CollaborationMode::Hierarchical => {
                        Some(position)
                    }
                },
            };
            async move {
                let outcome = self.invite(target.clone(), &params, ttl).await;
                CollaborationReply {
                    agent: target.clone(),
                    outcome,
                }
            }
        });
        let replies = join_all(invitations).await;

        let outcome = CollaborationOutcome {
            collaboration_id: collaboration_id.clone(),
            mode,
            replies,
        };
        let accepted = outcome.accepted();
        if !accepted.is_empty() {
            self.join_collaboration(&collaboration_id).await;
        }
        self.audit(
            if accepted.is_empty() {
                AuditKind::CollaborationRejected
            } else {
                AuditKind::CollaborationAccepted
            },
            &collaboration_id,
            serde_json::json!({ "mode": mode, "accepted": accepted, "invited": targets }),
        );
        tracing::info!(
            collaboration_id = %collaboration_id,
            invited = targets.len(),
            accepted = accepted.len(),
            "collaboration request settled"
        );
        Ok(outcome)
    }

    async fn invite(
        &self,
        target: AgentId,
        params: &CollaborationRequestParams,
        ttl: Duration,
    ) -> ParticipantOutcome {
        let payload = match to_payload(params) {
            Ok(payload) => payload,
            Err(e) => return ParticipantOutcome::Failed(e.to_string()),
        };
        let reply = match self
            .request(
                target,
                Performative::CollaborationRequest,
                payload,
                SendOptions::with_ttl(ttl),
            )
            .await
        {
            Ok(reply) => reply,
            Err(AgentError::ResponseTimeout { .. }) => return ParticipantOutcome::TimedOut,
            Err(e) => return ParticipantOutcome::Failed(e.to_string()),
        };
        match (&reply.performative, reply.payload_as::<CollaborationReplyParams>()) {
            (Performative::Accept, Ok(_)) => ParticipantOutcome::Accepted,
            (Performative::Reject, Ok(answer)) => {
                ParticipantOutcome::Rejected(answer.reason.unwrap_or_default())
            }
            (_, Err(e)) => ParticipantOutcome::Failed(e.to_string()),
            (other, Ok(_)) => ParticipantOutcome::Failed(format!("unexpected {other} reply")),
        }
    }

    // ── Knowledge ──

    /// Share a knowledge item with `target`, or broadcast it.
    pub async fn share_knowledge(
        &self,
        target: Option<AgentId>,
        topic: impl Into<String>,
        content: serde_json::Value,
        confidence: f64,
    ) -> Result<String, AgentError> {
        let params = KnowledgeShareParams {
            knowledge_id: uuid::Uuid::new_v4().to_string(),
            topic: topic.into(),
            content,
            confidence: confidence.clamp(0.0, 1.0),
        };
        self.send(
            target.unwrap_or_else(AgentId::broadcast),
            Performative::KnowledgeShare,
            to_payload(&params)?,
            SendOptions::default(),
        )
        .await?;
        Ok(params.knowledge_id)
    }

    /// Record the result of checking a received knowledge item and adjust
    /// the source's trust accordingly. Returns the source's new score.
    pub async fn verify_knowledge(&self, knowledge_id: &str, valid: bool) -> Result<f64, AgentError> {
        let (source, score) = {
            let mut state = self.inner.state.write().await;
            let entry = state
                .knowledge
                .iter_mut()
                .find(|k| k.knowledge_id == knowledge_id)
                .ok_or_else(|| AgentError::UnknownKnowledge(knowledge_id.to_string()))?;
            entry.verified = Some(valid);
            let source = entry.source.clone();
            let event = if valid {
                TrustEvent::KnowledgeVerified
            } else {
                TrustEvent::KnowledgeInvalid
            };
            let score = state.trust.record(&source, event);
            (source, score)
        };
        self.audit(
            AuditKind::KnowledgeVerified,
            knowledge_id,
            serde_json::json!({ "source": source, "valid": valid }),
        );
        Ok(score)
    }

    pub async fn knowledge(&self) -> Vec<KnowledgeEntry> {
        self.inner.state.read().await.knowledge.iter().cloned().collect()
    }

    pub(crate) async fn store_knowledge(&self, entry: KnowledgeEntry) {
        let mut state = self.inner.state.write().await;
        if state
            .knowledge
            .iter()
            .any(|k| k.knowledge_id == entry.knowledge_id)
        {
            return;
        }
        state.knowledge.push_back(entry);
        while state.knowledge.len() > self.inner.config.knowledge_limit {
            state.knowledge.pop_front();
        }
    }

    // ── Help ──

    /// Broadcast a help request and return the first capability offer.
    ///
    /// Currently preferred peers are listed in the request so responders
    /// can see who the requester would rather hear from.
    pub async fn request_help(
        &self,
        problem: impl Into<String>,
        required_capabilities: BTreeSet<String>,
        urgency: Urgency,
    ) -> Result<HelpOffer, AgentError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let params = HelpRequestParams {
            request_id: request_id.clone(),
            problem: problem.into(),
            required_capabilities,
            urgency,
            preferred_agents: self.preferred_agents().await,
        };
        let options = SendOptions::with_ttl(self.inner.config.help_request_ttl)
            .in_conversation(request_id.clone());
        let reply = self
            .request(
                AgentId::broadcast(),
                Performative::HelpRequest,
                to_payload(&params)?,
                options,
            )
            .await?;

        let offer: CapabilityOfferParams = reply.payload_as()?;
        self.remember_capabilities(&reply.from, offer.capabilities.iter().cloned())
            .await;
        self.record_interaction(&reply.from, TrustEvent::CapabilityOffered)
            .await;
        Ok(HelpOffer {
            request_id,
            from: reply.from,
            capabilities: offer.capabilities,
            description: offer.description,
        })
    }
}

fn track_inbound(state: &mut EndpointState, request: &Message, params: &TaskNegotiationParams) {
    if state.negotiations.get(&params.negotiation_id).is_none() {
        state.negotiations.insert(Negotiation::new(
            params.negotiation_id.clone(),
            request.from.clone(),
            params.task.clone(),
            params.terms.clone(),
            NegotiationDirection::Inbound,
        ));
    }
}

pub(crate) fn to_payload<T: Serialize>(value: &T) -> Result<serde_json::Value, AgentError> {
    serde_json::to_value(value).map_err(|e| AgentError::Protocol(e.into()))
}

async fn dispatch_loop(inner: Weak<EndpointInner>, mut rx: mpsc::UnboundedReceiver<Delivery>) {
    while let Some(delivery) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let endpoint = AgentEndpoint { inner };
        endpoint.deliver(delivery.message).await;
    }
    tracing::debug!("dispatch loop finished");
}
