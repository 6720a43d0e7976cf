//! Performative dispatch.
//!
//! Each performative tag maps to one `PerformativeHandler`. Handlers run on
//! the endpoint's dispatch task, one message at a time, so they must not
//! await replies to their own requests; long-running work is spawned.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use hive_protocol::reject_reasons;
use hive_protocol::*;
use hive_state::TrustEvent;

use crate::audit::AuditKind;
use crate::endpoint::{to_payload, AgentEndpoint, KnowledgeEntry};
use crate::generator::GenerationOptions;
use crate::AgentError;

/// Boxed future returned by a `PerformativeHandler`.
pub type HandlerResult<'a> = Pin<Box<dyn Future<Output = Result<(), AgentError>> + Send + 'a>>;

/// Reaction to one inbound performative.
pub trait PerformativeHandler: Send + Sync {
    fn handle<'a>(&'a self, endpoint: &'a AgentEndpoint, message: &'a Message) -> HandlerResult<'a>;
}

/// Performative tag → handler.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<Performative, Arc<dyn PerformativeHandler>>,
}

impl HandlerRegistry {
    /// Registry with the built-in handlers installed.
    pub fn with_defaults() -> Self {
        let mut registry = Self::default();
        registry.register(Performative::CapabilityRequest, Arc::new(CapabilityRequestHandler));
        registry.register(Performative::CapabilityOffer, Arc::new(CapabilityOfferHandler));
        registry.register(Performative::TaskNegotiation, Arc::new(TaskNegotiationHandler));
        registry.register(Performative::CollaborationRequest, Arc::new(CollaborationRequestHandler));
        registry.register(Performative::KnowledgeShare, Arc::new(KnowledgeShareHandler));
        registry.register(Performative::HelpRequest, Arc::new(HelpRequestHandler));
        registry.register(Performative::TaskAssignment, Arc::new(TaskAssignmentHandler));
        registry
    }

    pub fn register(
        &mut self,
        performative: Performative,
        handler: Arc<dyn PerformativeHandler>,
    ) -> Option<Arc<dyn PerformativeHandler>> {
        self.handlers.insert(performative, handler)
    }

    pub fn get(&self, performative: &Performative) -> Option<Arc<dyn PerformativeHandler>> {
        self.handlers.get(performative).cloned()
    }

    pub fn contains(&self, performative: &Performative) -> bool {
        self.handlers.contains_key(performative)
    }
}

/// Accepts when the capability is held and the evaluator approves.
pub struct CapabilityRequestHandler;

impl PerformativeHandler for CapabilityRequestHandler {
    fn handle<'a>(&'a self, endpoint: &'a AgentEndpoint, message: &'a Message) -> HandlerResult<'a> {
        Box::pin(async move {
            let trust_level = endpoint.trust_level(&message.from).await;
            let params: CapabilityRequestParams = match message.payload_as() {
                Ok(params) => params,
                Err(e) => {
                    let refusal = CapabilityResponseParams {
                        capability: String::new(),
                        accepted: false,
                        reason: Some(reject_reasons::MALFORMED_PAYLOAD.into()),
                        trust_level,
                    };
                    endpoint
                        .reply(message, Performative::Reject, to_payload(&refusal)?)
                        .await?;
                    return Err(e.into());
                }
            };

            if !endpoint.has_capability(&params.capability) {
                return answer_capability_request(
                    endpoint,
                    message,
                    params,
                    Some(reject_reasons::CAPABILITY_NOT_HELD),
                    trust_level,
                )
                .await;
            }

            // The evaluator may consult a generator; answer from a task.
            let endpoint = endpoint.clone();
            let request = message.clone();
            tokio::spawn(async move {
                let reason = match endpoint.evaluator().evaluate(&request.from, &params).await {
                    Ok(true) => None,
                    Ok(false) => Some(reject_reasons::EVALUATION_DECLINED),
                    Err(e) => {
                        tracing::warn!(error = %e, capability = %params.capability, "capability evaluator failed");
                        Some(reject_reasons::EVALUATION_DECLINED)
                    }
                };
                if let Err(e) = answer_capability_request(&endpoint, &request, params, reason, trust_level).await {
                    tracing::warn!(from = %request.from, error = %e, "failed to answer capability request");
                }
            });
            Ok(())
        })
    }
}

async fn answer_capability_request(
    endpoint: &AgentEndpoint,
    message: &Message,
    params: CapabilityRequestParams,
    reason: Option<&'static str>,
    trust_level: TrustLevel,
) -> Result<(), AgentError> {
    let response = CapabilityResponseParams {
        capability: params.capability,
        accepted: reason.is_none(),
        reason: reason.map(str::to_string),
        trust_level,
    };
    let performative = if response.accepted {
        Performative::Accept
    } else {
        Performative::Reject
    };
    tracing::debug!(
        from = %message.from,
        capability = %response.capability,
        accepted = response.accepted,
        "answered capability request"
    );
    endpoint
        .reply(message, performative, to_payload(&response)?)
        .await?;
    Ok(())
}

/// Records an unsolicited capability offer.
pub struct CapabilityOfferHandler;

impl PerformativeHandler for CapabilityOfferHandler {
    fn handle<'a>(&'a self, endpoint: &'a AgentEndpoint, message: &'a Message) -> HandlerResult<'a> {
        Box::pin(async move {
            let offer: CapabilityOfferParams = message.payload_as()?;
            endpoint
                .record_interaction(&message.from, TrustEvent::CapabilityOffered)
                .await;
            endpoint
                .remember_capabilities(&message.from, offer.capabilities)
                .await;
            Ok(())
        })
    }
}

/// Accepts when capabilities, deadline lead and workload all allow it.
pub struct TaskNegotiationHandler;

impl PerformativeHandler for TaskNegotiationHandler {
    fn handle<'a>(&'a self, endpoint: &'a AgentEndpoint, message: &'a Message) -> HandlerResult<'a> {
        Box::pin(async move {
            let params: TaskNegotiationParams = match message.payload_as() {
                Ok(params) => params,
                Err(e) => {
                    tracing::warn!(from = %message.from, error = %e, "malformed task negotiation");
                    return Err(e.into());
                }
            };
            match endpoint.evaluate_task(&params.task, &params.terms).await {
                Ok(()) => {
                    endpoint.accept_task(message, None).await?;
                    tracing::info!(
                        negotiation_id = %params.negotiation_id,
                        from = %message.from,
                        task_id = %params.task.task_id,
                        "accepted task"
                    );
                }
                Err(reason) => {
                    endpoint.reject_task(message, reason).await?;
                    tracing::info!(
                        negotiation_id = %params.negotiation_id,
                        from = %message.from,
                        reason,
                        "rejected task"
                    );
                }
            }
            Ok(())
        })
    }
}

/// Joins a collaboration when the task fits and there is spare capacity.
pub struct CollaborationRequestHandler;

impl PerformativeHandler for CollaborationRequestHandler {
    fn handle<'a>(&'a self, endpoint: &'a AgentEndpoint, message: &'a Message) -> HandlerResult<'a> {
        Box::pin(async move {
            let params: CollaborationRequestParams = message.payload_as()?;
            let reason = if !params
                .task
                .missing_capabilities(endpoint.capabilities())
                .is_empty()
            {
                Some(reject_reasons::MISSING_CAPABILITIES)
            } else if endpoint.workload().await > endpoint.config().max_acceptable_workload {
                Some(reject_reasons::WORKLOAD_EXCEEDED)
            } else {
                None
            };

            let reply = CollaborationReplyParams {
                collaboration_id: params.collaboration_id.clone(),
                accepted: reason.is_none(),
                reason: reason.map(str::to_string),
            };
            let performative = if reply.accepted {
                endpoint.join_collaboration(&params.collaboration_id).await;
                endpoint.audit(
                    AuditKind::CollaborationAccepted,
                    &params.collaboration_id,
                    serde_json::json!({ "initiator": message.from, "mode": params.mode }),
                );
                Performative::Accept
            } else {
                Performative::Reject
            };
            endpoint
                .reply(message, performative, to_payload(&reply)?)
                .await?;
            Ok(())
        })
    }
}

/// Stores shared knowledge until it is verified or evicted.
pub struct KnowledgeShareHandler;

impl PerformativeHandler for KnowledgeShareHandler {
    fn handle<'a>(&'a self, endpoint: &'a AgentEndpoint, message: &'a Message) -> HandlerResult<'a> {
        Box::pin(async move {
            let params: KnowledgeShareParams = message.payload_as()?;
            endpoint
                .store_knowledge(KnowledgeEntry {
                    knowledge_id: params.knowledge_id,
                    source: message.from.clone(),
                    topic: params.topic,
                    content: params.content,
                    confidence: params.confidence.clamp(0.0, 1.0),
                    received_at: Utc::now(),
                    verified: None,
                })
                .await;
            Ok(())
        })
    }
}

/// Offers help when every required capability is held and there is spare capacity.
pub struct HelpRequestHandler;

impl PerformativeHandler for HelpRequestHandler {
    fn handle<'a>(&'a self, endpoint: &'a AgentEndpoint, message: &'a Message) -> HandlerResult<'a> {
        Box::pin(async move {
            let params: HelpRequestParams = message.payload_as()?;
            let held = endpoint.capabilities();
            if !params.required_capabilities.is_subset(held) {
                tracing::trace!(request_id = %params.request_id, "cannot help, capabilities missing");
                return Ok(());
            }
            if endpoint.workload().await > endpoint.config().max_acceptable_workload {
                tracing::debug!(request_id = %params.request_id, "cannot help, workload too high");
                return Ok(());
            }

            let offer = CapabilityOfferParams {
                capabilities: params.required_capabilities.iter().cloned().collect(),
                description: format!("available to help with: {}", params.problem),
                in_response_to: Some(params.request_id.clone()),
            };
            endpoint
                .reply(message, Performative::CapabilityOffer, to_payload(&offer)?)
                .await?;
            tracing::debug!(
                request_id = %params.request_id,
                requester = %message.from,
                urgency = ?params.urgency,
                "offered help"
            );
            Ok(())
        })
    }
}

/// Executes an assigned task with the response generator and reports the result.
///
/// Execution is spawned so the dispatch task keeps draining the inbox.
pub struct TaskAssignmentHandler;

impl PerformativeHandler for TaskAssignmentHandler {
    fn handle<'a>(&'a self, endpoint: &'a AgentEndpoint, message: &'a Message) -> HandlerResult<'a> {
        Box::pin(async move {
            let params: TaskAssignmentParams = message.payload_as()?;
            let missing = params.task.missing_capabilities(endpoint.capabilities());
            if !missing.is_empty() {
                let result = TaskResultParams {
                    task_id: params.task.task_id,
                    success: false,
                    output: serde_json::Value::Null,
                    error: Some(format!(
                        "{}: {}",
                        reject_reasons::MISSING_CAPABILITIES,
                        missing.join(",")
                    )),
                    tokens_used: 0,
                    cost: 0.0,
                };
                endpoint
                    .reply(message, Performative::Reject, to_payload(&result)?)
                    .await?;
                return Ok(());
            }

            let Some(generator) = endpoint.generator() else {
                let result = TaskResultParams {
                    task_id: params.task.task_id,
                    success: false,
                    output: serde_json::Value::Null,
                    error: Some(reject_reasons::NO_EXECUTOR.into()),
                    tokens_used: 0,
                    cost: 0.0,
                };
                endpoint
                    .reply(message, Performative::Reject, to_payload(&result)?)
                    .await?;
                return Ok(());
            };

            endpoint.begin_task(&params.task.task_id).await;
            let endpoint = endpoint.clone();
            let request = message.clone();
            tokio::spawn(async move {
                let task_id = params.task.task_id.clone();
                let prompt = assignment_prompt(&params);
                let options = GenerationOptions::default();
                let result = match generator.generate(&prompt, &options).await {
                    Ok(generation) => TaskResultParams {
                        task_id: task_id.clone(),
                        success: true,
                        output: serde_json::json!({ "content": generation.content }),
                        error: None,
                        tokens_used: generation.tokens_used,
                        cost: generation.cost,
                    },
                    Err(e) => TaskResultParams {
                        task_id: task_id.clone(),
                        success: false,
                        output: serde_json::Value::Null,
                        error: Some(e.to_string()),
                        tokens_used: 0,
                        cost: 0.0,
                    },
                };
                endpoint.complete_task(&task_id).await;

                let success = result.success;
                let sent = match to_payload(&result) {
                    Ok(payload) => endpoint.reply(&request, Performative::TaskResult, payload).await,
                    Err(e) => Err(e),
                };
                match sent {
                    Ok(_) => tracing::info!(task_id = %task_id, success, "task result reported"),
                    Err(e) => tracing::warn!(task_id = %task_id, error = %e, "failed to report task result"),
                }
            });
            Ok(())
        })
    }
}

fn assignment_prompt(params: &TaskAssignmentParams) -> String {
    let mut prompt = params.task.description.clone();
    if !params.inputs.is_empty() {
        prompt.push_str("\n\nInputs from completed dependencies:");
        for (task_id, output) in &params.inputs {
            prompt.push_str(&format!("\n- {task_id}: {output}"));
        }
    }
    prompt
}
