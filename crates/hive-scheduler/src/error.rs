use std::fmt;

use hive_agent::AgentError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structural failures that abort plan construction or lookup.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("circular dependency involving task {task_id}")]
    CircularDependency { task_id: String },

    #[error("task {task_id} depends on unknown task {dependency}")]
    UnknownDependency { task_id: String, dependency: String },

    #[error("duplicate task id {0}")]
    DuplicateTask(String),

    #[error("unknown plan {0}")]
    UnknownPlan(String),

    #[error("decomposition failed: {0}")]
    Decomposition(String),

    #[error("agent error: {0}")]
    Agent(#[from] AgentError),
}

/// Why a single task did not complete. Attached to that task's outcome;
/// never aborts the plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum TaskFailure {
    /// No reply within the delegation timeout.
    TaskTimeout,
    /// No agent holds every required capability.
    NoEligibleAgent,
    /// The agent refused or reported an unsuccessful result.
    Rejected(String),
    Cancelled,
    /// The assignment could not be sent or the reply was unusable.
    DelegationFailed(String),
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskFailure::TaskTimeout => write!(f, "task timed out"),
            TaskFailure::NoEligibleAgent => write!(f, "no eligible agent"),
            TaskFailure::Rejected(reason) => write!(f, "rejected: {reason}"),
            TaskFailure::Cancelled => write!(f, "cancelled"),
            TaskFailure::DelegationFailed(reason) => write!(f, "delegation failed: {reason}"),
        }
    }
}

impl From<AgentError> for TaskFailure {
    fn from(e: AgentError) -> Self {
        match e {
            AgentError::ResponseTimeout { .. } => TaskFailure::TaskTimeout,
            AgentError::Cancelled(_) => TaskFailure::Cancelled,
            other => TaskFailure::DelegationFailed(other.to_string()),
        }
    }
}
