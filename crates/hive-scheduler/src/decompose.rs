//! Objective decomposition strategies.
//!
//! A strategy turns one objective into a flat list of subtasks with
//! capability tags and dependencies. The graph module validates the result;
//! strategies are free to return anything, including cycles.

use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use hive_agent::{GenerationOptions, ResponseGenerator};
use serde::{Deserialize, Serialize};

use crate::SchedulerError;

/// A unit of work submitted to the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Objective {
    pub description: String,
    /// Selects a rule set in `RuleBasedDecomposer`; inferred from the
    /// description when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default)]
    pub priority: u8,
}

impl Objective {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            category: None,
            priority: 0,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }
}

/// One subtask as produced by a strategy, before graph validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtaskSpec {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub required_capabilities: BTreeSet<String>,
    #[serde(default)]
    pub priority: u8,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
}

impl SubtaskSpec {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            required_capabilities: BTreeSet::new(),
            priority: 0,
            dependencies: BTreeSet::new(),
        }
    }

    pub fn requires<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_capabilities
            .extend(capabilities.into_iter().map(Into::into));
        self
    }

    pub fn after<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies
            .extend(dependencies.into_iter().map(Into::into));
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }
}

/// Pluggable decomposition.
pub trait DecompositionStrategy: Send + Sync {
    fn decompose<'a>(
        &'a self,
        objective: &'a Objective,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<SubtaskSpec>, SchedulerError>> + Send + 'a>>;
}

/// Fixed pipelines per objective category.
///
/// - `research`: gather, then analyze, then report
/// - `development`: design, implement, then test and document in parallel
/// - `analysis`: collect, analyze, then visualize and summarize in parallel
/// - anything else: a single general task
#[derive(Debug, Clone, Default)]
pub struct RuleBasedDecomposer;

impl RuleBasedDecomposer {
    pub fn new() -> Self {
        Self
    }

    /// Category named on the objective, or guessed from its description.
    pub fn category_of(objective: &Objective) -> &'static str {
        let text = match &objective.category {
            Some(category) => category.to_ascii_lowercase(),
            None => objective.description.to_ascii_lowercase(),
        };
        if text.contains("research") || text.contains("investigate") {
            "research"
        } else if text.contains("develop") || text.contains("implement") || text.contains("build") {
            "development"
        } else if text.contains("analy") {
            "analysis"
        } else {
            "general"
        }
    }

    fn subtasks(objective: &Objective) -> Vec<SubtaskSpec> {
        let what = &objective.description;
        let p = objective.priority;
        match Self::category_of(objective) {
            "research" => vec![
                SubtaskSpec::new("gather", format!("Gather sources for: {what}"))
                    .requires(["research"])
                    .with_priority(p),
                SubtaskSpec::new("analyze", format!("Analyze findings for: {what}"))
                    .requires(["analysis"])
                    .after(["gather"])
                    .with_priority(p),
                SubtaskSpec::new("report", format!("Write up results for: {what}"))
                    .requires(["writing"])
                    .after(["analyze"])
                    .with_priority(p),
            ],
            "development" => vec![
                SubtaskSpec::new("design", format!("Design: {what}"))
                    .requires(["architecture"])
                    .with_priority(p),
                SubtaskSpec::new("implement", format!("Implement: {what}"))
                    .requires(["coding"])
                    .after(["design"])
                    .with_priority(p),
                SubtaskSpec::new("test", format!("Test: {what}"))
                    .requires(["testing"])
                    .after(["implement"])
                    .with_priority(p),
                SubtaskSpec::new("document", format!("Document: {what}"))
                    .requires(["writing"])
                    .after(["implement"])
                    .with_priority(p),
            ],
            "analysis" => vec![
                SubtaskSpec::new("collect", format!("Collect data for: {what}"))
                    .requires(["data"])
                    .with_priority(p),
                SubtaskSpec::new("analyze", format!("Analyze data for: {what}"))
                    .requires(["analysis"])
                    .after(["collect"])
                    .with_priority(p),
                SubtaskSpec::new("visualize", format!("Visualize results for: {what}"))
                    .requires(["visualization"])
                    .after(["analyze"])
                    .with_priority(p),
                SubtaskSpec::new("summarize", format!("Summarize results for: {what}"))
                    .requires(["writing"])
                    .after(["analyze"])
                    .with_priority(p),
            ],
            _ => vec![SubtaskSpec::new("execute", what.clone())
                .requires(["general"])
                .with_priority(p)],
        }
    }
}

impl DecompositionStrategy for RuleBasedDecomposer {
    fn decompose<'a>(
        &'a self,
        objective: &'a Objective,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<SubtaskSpec>, SchedulerError>> + Send + 'a>> {
        Box::pin(async move {
            let subtasks = Self::subtasks(objective);
            tracing::info!(
                category = Self::category_of(objective),
                subtasks = subtasks.len(),
                "objective decomposed"
            );
            Ok(subtasks)
        })
    }
}

/// Asks the generator for a JSON array of subtasks.
pub struct GeneratorDecomposer {
    generator: Arc<dyn ResponseGenerator>,
    options: GenerationOptions,
}

impl GeneratorDecomposer {
    pub fn new(generator: Arc<dyn ResponseGenerator>) -> Self {
        Self {
            generator,
            options: GenerationOptions {
                system: Some(
                    "Split the objective into subtasks. Reply with a JSON array only; each item has \
                     id, description, required_capabilities, priority and dependencies."
                        .into(),
                ),
                max_tokens: Some(1024),
                temperature: Some(0.2),
            },
        }
    }

    /// Parse a generator answer, tolerating a surrounding code fence.
    pub fn parse(content: &str) -> Result<Vec<SubtaskSpec>, SchedulerError> {
        let trimmed = content.trim();
        let body = trimmed
            .strip_prefix("```json")
            .or_else(|| trimmed.strip_prefix("```"))
            .and_then(|rest| rest.strip_suffix("```"))
            .unwrap_or(trimmed);
        let subtasks: Vec<SubtaskSpec> = serde_json::from_str(body.trim())
            .map_err(|e| SchedulerError::Decomposition(format!("unparseable subtask list: {e}")))?;
        if subtasks.is_empty() {
            return Err(SchedulerError::Decomposition("empty subtask list".into()));
        }
        Ok(subtasks)
    }
}

impl DecompositionStrategy for GeneratorDecomposer {
    fn decompose<'a>(
        &'a self,
        objective: &'a Objective,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<SubtaskSpec>, SchedulerError>> + Send + 'a>> {
        Box::pin(async move {
            let prompt = format!("Objective: {}", objective.description);
            let generation = self
                .generator
                .generate(&prompt, &self.options)
                .await
                .map_err(|e| SchedulerError::Decomposition(format!("generator failed: {e}")))?;
            let subtasks = Self::parse(&generation.content)?;
            tracing::info!(
                subtasks = subtasks.len(),
                tokens_used = generation.tokens_used,
                "objective decomposed by generator"
            );
            Ok(subtasks)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_inferred_from_description() {
        assert_eq!(RuleBasedDecomposer::category_of(&Objective::new("Research solar cells")), "research");
        assert_eq!(RuleBasedDecomposer::category_of(&Objective::new("Build a CLI")), "development");
        assert_eq!(RuleBasedDecomposer::category_of(&Objective::new("Analyze churn")), "analysis");
        assert_eq!(RuleBasedDecomposer::category_of(&Objective::new("Water the plants")), "general");
        assert_eq!(
            RuleBasedDecomposer::category_of(&Objective::new("Water the plants").with_category("development")),
            "development"
        );
    }

    #[tokio::test]
    async fn test_development_pipeline_shape() {
        let subtasks = RuleBasedDecomposer::new()
            .decompose(&Objective::new("implement login"))
            .await
            .unwrap();
        let ids: Vec<&str> = subtasks.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["design", "implement", "test", "document"]);
        assert!(subtasks[2].dependencies.contains("implement"));
        assert!(subtasks[3].dependencies.contains("implement"));
    }

    #[test]
    fn test_parse_fenced_json() {
        let content = "```json\n[{\"id\":\"a\",\"description\":\"first\"},\
                       {\"id\":\"b\",\"description\":\"second\",\"dependencies\":[\"a\"]}]\n```";
        let subtasks = GeneratorDecomposer::parse(content).unwrap();
        assert_eq!(subtasks.len(), 2);
        assert!(subtasks[1].dependencies.contains("a"));
    }

    #[test]
    fn test_parse_rejects_garbage_and_empty() {
        assert!(matches!(
            GeneratorDecomposer::parse("sure, here are some tasks"),
            Err(SchedulerError::Decomposition(_))
        ));
        assert!(matches!(GeneratorDecomposer::parse("[]"), Err(SchedulerError::Decomposition(_))));
    }
}
