//! External collaborators consumed by an endpoint.
//!
//! Text generation is delegated to a `ResponseGenerator` that abstracts the
//! LLM component, allowing different backends. Capability requests are
//! screened by a pluggable `CapabilityEvaluator`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use hive_protocol::{AgentId, CapabilityRequestParams};
use serde::{Deserialize, Serialize};

use crate::AgentError;

/// Options passed through to the generator backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

/// Text produced for one prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    pub content: String,
    pub tokens_used: u64,
    pub cost: f64,
}

/// Produces text for a prompt. Used for negotiation rationale, capability
/// screening and task execution.
pub trait ResponseGenerator: Send + Sync {
    fn generate<'a>(
        &'a self,
        prompt: &'a str,
        options: &'a GenerationOptions,
    ) -> Pin<Box<dyn Future<Output = Result<Generation, AgentError>> + Send + 'a>>;
}

/// Decides whether to honour a capability request the agent is able to serve.
pub trait CapabilityEvaluator: Send + Sync {
    fn evaluate<'a>(
        &'a self,
        requester: &'a AgentId,
        request: &'a CapabilityRequestParams,
    ) -> Pin<Box<dyn Future<Output = Result<bool, AgentError>> + Send + 'a>>;
}

/// Approves every request for a held capability.
pub struct AcceptAll;

impl CapabilityEvaluator for AcceptAll {
    fn evaluate<'a>(
        &'a self,
        _requester: &'a AgentId,
        _request: &'a CapabilityRequestParams,
    ) -> Pin<Box<dyn Future<Output = Result<bool, AgentError>> + Send + 'a>> {
        Box::pin(async { Ok(true) })
    }
}

/// Asks the generator whether to take the request on.
///
/// The answer counts as approval when it starts with "yes" or "accept".
/// Generator failures decline the request.
pub struct GeneratorEvaluator {
    generator: Arc<dyn ResponseGenerator>,
    options: GenerationOptions,
}

impl GeneratorEvaluator {
    pub fn new(generator: Arc<dyn ResponseGenerator>) -> Self {
        Self {
            generator,
            options: GenerationOptions {
                system: Some(
                    "You screen capability requests for an autonomous agent. \
                     Answer YES or NO."
                        .into(),
                ),
                max_tokens: Some(16),
                temperature: Some(0.0),
            },
        }
    }
}

impl CapabilityEvaluator for GeneratorEvaluator {
    fn evaluate<'a>(
        &'a self,
        requester: &'a AgentId,
        request: &'a CapabilityRequestParams,
    ) -> Pin<Box<dyn Future<Output = Result<bool, AgentError>> + Send + 'a>> {
        Box::pin(async move {
            let prompt = format!(
                "Agent {requester} asks you to provide '{}'. Context: {}. Should you accept?",
                request.capability, request.context
            );
            match self.generator.generate(&prompt, &self.options).await {
                Ok(answer) => {
                    let answer = answer.content.trim().to_ascii_lowercase();
                    Ok(answer.starts_with("yes") || answer.starts_with("accept"))
                }
                Err(e) => {
                    tracing::warn!(
                        requester = %requester,
                        capability = %request.capability,
                        error = %e,
                        "capability evaluation failed, declining"
                    );
                    Ok(false)
                }
            }
        })
    }
}
