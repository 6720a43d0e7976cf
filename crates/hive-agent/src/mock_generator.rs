//! Mock response generator for testing
//!
//! Produces deterministic text without calling a model, so agents can
//! execute assignments and screen requests in tests and local swarms.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::generator::{Generation, GenerationOptions, ResponseGenerator};
use crate::AgentError;

/// Cost charged per token by the mock.
const MOCK_COST_PER_TOKEN: f64 = 0.000_01;

/// Mock generator that echoes a canned or derived answer.
#[derive(Default)]
pub struct MockGenerator {
    response: Option<String>,
    failure: Option<String>,
    delay: Option<Duration>,
    calls: AtomicU64,
}

impl MockGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always answer with `content`.
    pub fn with_response(mut self, content: impl Into<String>) -> Self {
        self.response = Some(content.into());
        self
    }

    /// Fail every call with `reason`.
    pub fn failing(mut self, reason: impl Into<String>) -> Self {
        self.failure = Some(reason.into());
        self
    }

    /// Sleep before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of prompts received so far.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

impl ResponseGenerator for MockGenerator {
    fn generate<'a>(
        &'a self,
        prompt: &'a str,
        _options: &'a GenerationOptions,
    ) -> Pin<Box<dyn Future<Output = Result<Generation, AgentError>> + Send + 'a>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(reason) = &self.failure {
                return Err(AgentError::Generator(reason.clone()));
            }

            let content = match &self.response {
                Some(content) => content.clone(),
                None => {
                    let headline = prompt.lines().next().unwrap_or_default();
                    format!("Completed: {headline}")
                }
            };
            let tokens_used = (prompt.split_whitespace().count()
                + content.split_whitespace().count()) as u64;

            tracing::debug!(tokens_used, "generated mock response");

            Ok(Generation {
                content,
                tokens_used,
                cost: tokens_used as f64 * MOCK_COST_PER_TOKEN,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_derived_response_uses_first_line() {
        let generator = MockGenerator::new();
        let out = generator
            .generate("Write tests\nfor the parser", &GenerationOptions::default())
            .await
            .unwrap();
        assert_eq!(out.content, "Completed: Write tests");
        assert!(out.tokens_used > 0);
        assert!(out.cost > 0.0);
        assert_eq!(generator.calls(), 1);
    }

    #[tokio::test]
    async fn test_failing_generator() {
        let generator = MockGenerator::new().failing("model offline");
        let err = generator
            .generate("anything", &GenerationOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Generator(reason) if reason == "model offline"));
    }
}
