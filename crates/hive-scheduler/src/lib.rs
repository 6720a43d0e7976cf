//! Hive task graph scheduler
//!
//! Turns an objective into a dependency-ordered plan and delegates its tasks
//! to agents over a coordinator's `AgentEndpoint`:
//!
//! - `decompose`: pluggable strategies producing subtasks
//! - `graph`: dependency graph, topological order, parallel groups
//! - `assign`: agent selection by capability and load
//! - `executor`: group-by-group delegation with per-task outcomes
//! - `coordinator`: submit / status / cancel surface

pub mod assign;
pub mod coordinator;
pub mod decompose;
pub mod error;
pub mod executor;
pub mod graph;

pub use assign::{capability_match_ratio, find_best_agent, rank_agents};
pub use coordinator::{PlanStatus, TaskGraphScheduler};
pub use decompose::{DecompositionStrategy, GeneratorDecomposer, Objective, RuleBasedDecomposer, SubtaskSpec};
pub use error::{SchedulerError, TaskFailure};
pub use executor::{
    tasks_per_agent, PlanExecutor, PlanHandle, PlanReport, PlanState, SchedulerConfig, TaskOutcome,
    TaskStatus, DEFAULT_DELEGATION_TIMEOUT,
};
pub use graph::{
    build_dependency_graph, group_parallel_tasks, topological_sort, ExecutionPlan, TaskGraph, TaskNode,
};
