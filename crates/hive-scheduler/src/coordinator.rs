//! Coordinator surface: submit an objective, poll its plan, cancel it.

use std::collections::HashMap;
use std::sync::Arc;

use hive_agent::AgentEndpoint;
use hive_state::AgentDirectory;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::decompose::{DecompositionStrategy, Objective, RuleBasedDecomposer, SubtaskSpec};
use crate::executor::{PlanExecutor, PlanHandle, PlanReport, PlanState, SchedulerConfig, TaskOutcome};
use crate::graph::ExecutionPlan;
use crate::{SchedulerError, TaskFailure};

/// Snapshot returned by [`TaskGraphScheduler::get_plan_status`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStatus {
    pub plan_id: String,
    pub state: PlanState,
    pub groups_completed: usize,
    pub total_groups: usize,
    pub failures: Vec<(String, TaskFailure)>,
    pub tasks: Vec<TaskOutcome>,
}

impl From<PlanReport> for PlanStatus {
    fn from(report: PlanReport) -> Self {
        Self {
            failures: report.failures(),
            plan_id: report.plan_id,
            state: report.state,
            groups_completed: report.groups_completed,
            total_groups: report.total_groups,
            tasks: report.tasks.into_values().collect(),
        }
    }
}

struct TrackedPlan {
    plan: Arc<ExecutionPlan>,
    handle: Arc<PlanHandle>,
}

/// Owns the plans started from one coordinator endpoint.
#[derive(Clone)]
pub struct TaskGraphScheduler {
    executor: PlanExecutor,
    strategy: Arc<dyn DecompositionStrategy>,
    plans: Arc<RwLock<HashMap<String, TrackedPlan>>>,
}

impl TaskGraphScheduler {
    /// Scheduler using the rule-based decomposer.
    pub fn new(endpoint: AgentEndpoint, directory: Arc<dyn AgentDirectory>, config: SchedulerConfig) -> Self {
        Self::with_strategy(endpoint, directory, config, Arc::new(RuleBasedDecomposer::new()))
    }

    pub fn with_strategy(
        endpoint: AgentEndpoint,
        directory: Arc<dyn AgentDirectory>,
        config: SchedulerConfig,
        strategy: Arc<dyn DecompositionStrategy>,
    ) -> Self {
        Self {
            executor: PlanExecutor::new(endpoint, directory, config),
            strategy,
            plans: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn executor(&self) -> &PlanExecutor {
        &self.executor
    }

    pub async fn decompose(&self, objective: &Objective) -> Result<Vec<SubtaskSpec>, SchedulerError> {
        self.strategy.decompose(objective).await
    }

    /// Decompose and validate without executing.
    pub async fn plan(&self, objective: Objective) -> Result<ExecutionPlan, SchedulerError> {
        let subtasks = self.decompose(&objective).await?;
        ExecutionPlan::build(objective, &subtasks)
    }

    /// Build a plan for `objective` and start executing it in the background.
    ///
    /// Structural problems (cycles, unknown dependencies, decomposition
    /// failures) are returned here; per-task problems show up in the status.
    pub async fn submit_objective(&self, objective: Objective) -> Result<String, SchedulerError> {
        let plan = self.plan(objective).await?;
        Ok(self.submit_plan(plan).await)
    }

    /// Start executing an already built plan.
    pub async fn submit_plan(&self, plan: ExecutionPlan) -> String {
        let plan_id = plan.plan_id.clone();
        let plan = Arc::new(plan);
        let handle = Arc::new(PlanHandle::new(&plan));
        self.plans.write().await.insert(
            plan_id.clone(),
            TrackedPlan {
                plan: plan.clone(),
                handle: handle.clone(),
            },
        );

        let executor = self.executor.clone();
        tokio::spawn(async move {
            executor.execute_task_plan(&plan, &handle).await;
        });
        tracing::info!(plan_id = %plan_id, "objective submitted");
        plan_id
    }

    pub async fn get_plan_status(&self, plan_id: &str) -> Result<PlanStatus, SchedulerError> {
        let handle = self.handle(plan_id).await?;
        Ok(handle.report().await.into())
    }

    pub async fn get_plan(&self, plan_id: &str) -> Result<Arc<ExecutionPlan>, SchedulerError> {
        self.plans
            .read()
            .await
            .get(plan_id)
            .map(|t| t.plan.clone())
            .ok_or_else(|| SchedulerError::UnknownPlan(plan_id.to_string()))
    }

    /// Stop dispatching further groups and abort in-flight delegations.
    /// Returns false when the plan had already finished.
    pub async fn cancel_plan(&self, plan_id: &str) -> Result<bool, SchedulerError> {
        let handle = self.handle(plan_id).await?;
        let cancelled = handle.cancel(self.executor.endpoint()).await;
        if cancelled {
            tracing::info!(plan_id = %plan_id, "plan cancelled");
        }
        Ok(cancelled)
    }

    /// Wait for the plan to finish and return its final status.
    pub async fn wait_for_plan(&self, plan_id: &str) -> Result<PlanStatus, SchedulerError> {
        let handle = self.handle(plan_id).await?;
        Ok(handle.wait().await.into())
    }

    /// Forget finished plans. Returns how many were dropped.
    pub async fn prune_finished(&self) -> usize {
        let mut plans = self.plans.write().await;
        let mut finished = Vec::new();
        for (id, tracked) in plans.iter() {
            if tracked.handle.report().await.is_finished() {
                finished.push(id.clone());
            }
        }
        for id in &finished {
            plans.remove(id);
        }
        finished.len()
    }

    async fn handle(&self, plan_id: &str) -> Result<Arc<PlanHandle>, SchedulerError> {
        self.plans
            .read()
            .await
            .get(plan_id)
            .map(|t| t.handle.clone())
            .ok_or_else(|| SchedulerError::UnknownPlan(plan_id.to_string()))
    }
}
