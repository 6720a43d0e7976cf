//! Plan execution: group-by-group dispatch with a barrier between groups.
//!
//! Every task of a group is delegated concurrently. A task that cannot be
//! placed, is refused, fails or times out is recorded on its own outcome;
//! siblings and later groups still run. Outputs of completed dependencies
//! travel with each assignment.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use hive_agent::{AgentEndpoint, AuditKind, SendOptions};
use hive_protocol::*;
use hive_state::{AgentDirectory, AgentProfile, TrustEvent};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, RwLock};

use crate::assign::find_best_agent;
use crate::graph::{ExecutionPlan, TaskNode};
use crate::TaskFailure;

/// Default delegation timeout.
pub const DEFAULT_DELEGATION_TIMEOUT: Duration = Duration::from_secs(TASK_DELEGATION_TIMEOUT_SECS);

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub delegation_timeout: Duration,
    /// Load added to an agent's snapshot workload for each task already
    /// placed on it within the current group.
    pub workload_step: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            delegation_timeout: DEFAULT_DELEGATION_TIMEOUT,
            workload_step: 0.1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentId>,
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<TaskFailure>,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub cost: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskOutcome {
    fn pending(task_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            status: TaskStatus::Pending,
            agent: None,
            output: serde_json::Value::Null,
            failure: None,
            tokens_used: 0,
            cost: 0.0,
            finished_at: None,
        }
    }

    fn failed(task_id: &str, agent: Option<AgentId>, failure: TaskFailure) -> Self {
        Self {
            status: TaskStatus::Failed,
            agent,
            failure: Some(failure),
            finished_at: Some(Utc::now()),
            ..Self::pending(task_id)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanState {
    Running,
    Completed,
    Cancelled,
}

/// Progress of one plan. Always lists every task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanReport {
    pub plan_id: String,
    pub state: PlanState,
    pub groups_completed: usize,
    pub total_groups: usize,
    pub tasks: BTreeMap<String, TaskOutcome>,
}

impl PlanReport {
    pub fn new(plan: &ExecutionPlan) -> Self {
        Self {
            plan_id: plan.plan_id.clone(),
            state: PlanState::Running,
            groups_completed: 0,
            total_groups: plan.groups.len(),
            tasks: plan
                .order
                .iter()
                .map(|id| (id.clone(), TaskOutcome::pending(id)))
                .collect(),
        }
    }

    /// Failed tasks with their reasons, in task id order.
    pub fn failures(&self) -> Vec<(String, TaskFailure)> {
        self.tasks
            .values()
            .filter_map(|t| t.failure.clone().map(|f| (t.task_id.clone(), f)))
            .collect()
    }

    pub fn completed(&self) -> usize {
        self.tasks
            .values()
            .filter(|t| t.status == TaskStatus::Completed)
            .count()
    }

    pub fn is_finished(&self) -> bool {
        self.state != PlanState::Running
    }
}

/// Shared run state of one plan: its report, the cancel flag and the
/// conversations of delegations still in flight.
pub struct PlanHandle {
    report: RwLock<PlanReport>,
    cancel: watch::Sender<bool>,
    finished: watch::Sender<bool>,
    in_flight: Mutex<HashSet<String>>,
}

impl PlanHandle {
    pub fn new(plan: &ExecutionPlan) -> Self {
        Self {
            report: RwLock::new(PlanReport::new(plan)),
            cancel: watch::channel(false).0,
            finished: watch::channel(false).0,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub async fn report(&self) -> PlanReport {
        self.report.read().await.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Flag the plan cancelled and abort in-flight delegations through
    /// `endpoint`. Returns false if the plan already finished.
    pub async fn cancel(&self, endpoint: &AgentEndpoint) -> bool {
        {
            // The executor settles the final state under the same lock.
            let report = self.report.write().await;
            if report.is_finished() {
                return false;
            }
            self.cancel.send_replace(true);
        }
        let conversations: Vec<String> = self.in_flight.lock().await.drain().collect();
        for conversation_id in conversations {
            endpoint.cancel_request(&conversation_id).await;
        }
        true
    }

    /// Resolves once execution stopped, returning the final report.
    pub async fn wait(&self) -> PlanReport {
        let mut finished = self.finished.subscribe();
        // Err only if the sender is gone, which cannot happen while `self` lives.
        let _ = finished.wait_for(|done| *done).await;
        self.report().await
    }
}

/// Dispatches plans from one coordinator endpoint.
#[derive(Clone)]
pub struct PlanExecutor {
    endpoint: AgentEndpoint,
    directory: Arc<dyn AgentDirectory>,
    config: SchedulerConfig,
}

impl PlanExecutor {
    pub fn new(endpoint: AgentEndpoint, directory: Arc<dyn AgentDirectory>, config: SchedulerConfig) -> Self {
        Self {
            endpoint,
            directory,
            config,
        }
    }

    pub fn endpoint(&self) -> &AgentEndpoint {
        &self.endpoint
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Run `plan` to completion or cancellation, recording progress on `handle`.
    pub async fn execute_task_plan(&self, plan: &ExecutionPlan, handle: &PlanHandle) -> PlanReport {
        tracing::info!(
            plan_id = %plan.plan_id,
            tasks = plan.order.len(),
            groups = plan.groups.len(),
            "executing plan"
        );

        for (index, group) in plan.groups.iter().enumerate() {
            if handle.is_cancelled() {
                break;
            }

            let assignments = self.assign_group(plan, group).await;
            {
                let mut report = handle.report.write().await;
                for (node, agent) in &assignments {
                    if let (Some(outcome), Some(agent)) = (report.tasks.get_mut(&node.id), agent) {
                        outcome.status = TaskStatus::Running;
                        outcome.agent = Some(agent.clone());
                    }
                }
            }

            let inputs = {
                let report = handle.report.read().await;
                assignments
                    .iter()
                    .map(|(node, _)| dependency_inputs(node, &report))
                    .collect::<Vec<_>>()
            };
            let runs = assignments
                .iter()
                .zip(inputs)
                .map(|((node, agent), inputs)| self.run_task(plan, node, agent.clone(), inputs, handle));
            let outcomes = join_all(runs).await;

            let mut report = handle.report.write().await;
            for outcome in outcomes {
                report.tasks.insert(outcome.task_id.clone(), outcome);
            }
            report.groups_completed = index + 1;
            tracing::debug!(
                plan_id = %plan.plan_id,
                group = index,
                size = group.len(),
                "group finished"
            );
        }

        let final_report = {
            let mut report = handle.report.write().await;
            if handle.is_cancelled() {
                report.state = PlanState::Cancelled;
                for outcome in report.tasks.values_mut() {
                    if matches!(outcome.status, TaskStatus::Pending | TaskStatus::Running) {
                        *outcome = TaskOutcome::failed(&outcome.task_id, outcome.agent.clone(), TaskFailure::Cancelled);
                    }
                }
            } else {
                report.state = PlanState::Completed;
            }
            report.clone()
        };
        handle.finished.send_replace(true);

        let failures = final_report.failures().len();
        tracing::info!(
            plan_id = %plan.plan_id,
            state = ?final_report.state,
            completed = final_report.completed(),
            failures,
            "plan finished"
        );
        self.endpoint.audit(
            AuditKind::PlanFinished,
            &plan.plan_id,
            serde_json::json!({
                "state": final_report.state,
                "completed": final_report.completed(),
                "failures": failures,
            }),
        );
        final_report
    }

    /// Choose an agent for every task of `group`, spreading load within the group.
    async fn assign_group<'p>(&self, plan: &'p ExecutionPlan, group: &[String]) -> Vec<(&'p TaskNode, Option<AgentId>)> {
        let mut profiles: Vec<AgentProfile> = self.directory.snapshot().await;
        let mut assignments = Vec::with_capacity(group.len());
        for id in group {
            let Some(node) = plan.graph.get(id) else {
                continue;
            };
            let chosen = find_best_agent(&profiles, &node.required_capabilities).map(|p| p.agent_id.clone());
            if let Some(agent) = &chosen {
                if let Some(profile) = profiles.iter_mut().find(|p| &p.agent_id == agent) {
                    profile.workload = (profile.workload + self.config.workload_step).min(1.0);
                }
            }
            assignments.push((node, chosen));
        }
        assignments
    }

    async fn run_task(
        &self,
        plan: &ExecutionPlan,
        node: &TaskNode,
        agent: Option<AgentId>,
        inputs: BTreeMap<String, serde_json::Value>,
        handle: &PlanHandle,
    ) -> TaskOutcome {
        let Some(agent) = agent else {
            tracing::warn!(plan_id = %plan.plan_id, task_id = %node.id, "no eligible agent");
            return TaskOutcome::failed(&node.id, None, TaskFailure::NoEligibleAgent);
        };
        if handle.is_cancelled() {
            return TaskOutcome::failed(&node.id, Some(agent), TaskFailure::Cancelled);
        }

        let params = TaskAssignmentParams {
            plan_id: Some(plan.plan_id.clone()),
            task: TaskSpec {
                task_id: format!("{}/{}", plan.plan_id, node.id),
                description: node.description.clone(),
                required_capabilities: node.required_capabilities.clone(),
                priority: node.priority,
                deadline: None,
            },
            inputs,
        };

        match self.delegate(&agent, &params, Some(handle)).await {
            Ok(result) if result.success => {
                self.endpoint.record_interaction(&agent, TrustEvent::TaskCompleted).await;
                self.endpoint.audit(
                    AuditKind::TaskCompleted,
                    &params.task.task_id,
                    serde_json::json!({ "agent": agent }),
                );
                TaskOutcome {
                    task_id: node.id.clone(),
                    status: TaskStatus::Completed,
                    agent: Some(agent),
                    output: result.output,
                    failure: None,
                    tokens_used: result.tokens_used,
                    cost: result.cost,
                    finished_at: Some(Utc::now()),
                }
            }
            Ok(result) => {
                let reason = result.error.unwrap_or_else(|| "unsuccessful".into());
                self.task_failed(&agent, &params.task.task_id, &reason).await;
                TaskOutcome {
                    tokens_used: result.tokens_used,
                    cost: result.cost,
                    ..TaskOutcome::failed(&node.id, Some(agent), TaskFailure::Rejected(reason))
                }
            }
            Err(failure) => {
                if failure != TaskFailure::Cancelled {
                    self.task_failed(&agent, &params.task.task_id, &failure.to_string()).await;
                }
                TaskOutcome::failed(&node.id, Some(agent), failure)
            }
        }
    }

    async fn task_failed(&self, agent: &AgentId, task_id: &str, reason: &str) {
        tracing::warn!(task_id = %task_id, agent = %agent, reason = %reason, "task failed");
        self.endpoint.record_interaction(agent, TrustEvent::TaskFailed).await;
        self.endpoint.audit(
            AuditKind::TaskFailed,
            task_id,
            serde_json::json!({ "agent": agent, "reason": reason }),
        );
    }

    /// Send one assignment to `agent` and wait for its result.
    ///
    /// A missing reply within the delegation timeout is `TaskTimeout`; the
    /// pending entry is gone by the time this returns.
    pub async fn delegate_task(
        &self,
        agent: &AgentId,
        params: &TaskAssignmentParams,
    ) -> Result<TaskResultParams, TaskFailure> {
        self.delegate(agent, params, None).await
    }

    async fn delegate(
        &self,
        agent: &AgentId,
        params: &TaskAssignmentParams,
        handle: Option<&PlanHandle>,
    ) -> Result<TaskResultParams, TaskFailure> {
        let payload = serde_json::to_value(params)
            .map_err(|e| TaskFailure::DelegationFailed(e.to_string()))?;
        let pending = self
            .endpoint
            .request_pending(
                agent.clone(),
                Performative::TaskAssignment,
                payload,
                SendOptions::with_ttl(self.config.delegation_timeout),
            )
            .await?;
        let conversation_id = pending.conversation_id().to_string();

        if let Some(handle) = handle {
            handle.in_flight.lock().await.insert(conversation_id.clone());
            // Cancellation may have raced the registration above.
            if handle.is_cancelled() {
                self.endpoint.cancel_request(&conversation_id).await;
            }
        }
        self.endpoint.audit(
            AuditKind::TaskDelegated,
            &params.task.task_id,
            serde_json::json!({ "agent": agent, "conversation_id": conversation_id }),
        );
        tracing::debug!(task_id = %params.task.task_id, agent = %agent, "task delegated");

        let reply = pending.wait().await;
        if let Some(handle) = handle {
            handle.in_flight.lock().await.remove(&conversation_id);
        }
        let reply = reply?;

        match reply.performative {
            Performative::TaskResult => reply
                .payload_as::<TaskResultParams>()
                .map_err(|e| TaskFailure::DelegationFailed(e.to_string())),
            Performative::Reject => {
                let reason = reply
                    .payload_as::<TaskResultParams>()
                    .ok()
                    .and_then(|r| r.error)
                    .unwrap_or_else(|| "rejected".into());
                Err(TaskFailure::Rejected(reason))
            }
            other => Err(TaskFailure::DelegationFailed(format!(
                "unexpected reply {other}"
            ))),
        }
    }
}

/// Outputs of the completed dependencies of `node`, keyed by task id.
fn dependency_inputs(node: &TaskNode, report: &PlanReport) -> BTreeMap<String, serde_json::Value> {
    node.dependencies
        .iter()
        .filter_map(|dep| {
            let outcome = report.tasks.get(dep)?;
            (outcome.status == TaskStatus::Completed).then(|| (dep.clone(), outcome.output.clone()))
        })
        .collect()
}

/// Count of tasks per agent in a report; handy for checking load spread.
pub fn tasks_per_agent(report: &PlanReport) -> HashMap<AgentId, usize> {
    let mut counts = HashMap::new();
    for outcome in report.tasks.values() {
        if let Some(agent) = &outcome.agent {
            *counts.entry(agent.clone()).or_insert(0) += 1;
        }
    }
    counts
}
