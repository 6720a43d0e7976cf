use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use hive_protocol::AgentId;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Capability and load snapshot of one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub agent_id: AgentId,
    pub capabilities: BTreeSet<String>,
    /// Normalized load in [0, 1].
    pub workload: f64,
    pub last_seen: DateTime<Utc>,
}

impl AgentProfile {
    pub fn new<I, S>(agent_id: AgentId, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            agent_id,
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            workload: 0.0,
            last_seen: Utc::now(),
        }
    }

    pub fn with_workload(mut self, workload: f64) -> Self {
        self.workload = workload.clamp(0.0, 1.0);
        self
    }
}

/// Discovery feed consulted when assigning tasks.
pub trait AgentDirectory: Send + Sync {
    fn snapshot<'a>(&'a self) -> Pin<Box<dyn Future<Output = Vec<AgentProfile>> + Send + 'a>>;
}

/// Registry of known agents, owned by one coordinator.
#[derive(Debug, Default)]
pub struct AgentRegistry {
    agents: RwLock<HashMap<AgentId, AgentProfile>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert(&self, profile: AgentProfile) {
        tracing::debug!(
            agent = %profile.agent_id,
            capabilities = profile.capabilities.len(),
            "agent registered"
        );
        self.agents
            .write()
            .await
            .insert(profile.agent_id.clone(), profile);
    }

    pub async fn remove(&self, agent: &AgentId) -> Option<AgentProfile> {
        self.agents.write().await.remove(agent)
    }

    pub async fn get(&self, agent: &AgentId) -> Option<AgentProfile> {
        self.agents.read().await.get(agent).cloned()
    }

    /// Shift an agent's workload by `delta`, clamped to [0, 1].
    /// Returns the new workload, or `None` for an unknown agent.
    pub async fn adjust_workload(&self, agent: &AgentId, delta: f64) -> Option<f64> {
        let mut agents = self.agents.write().await;
        let profile = agents.get_mut(agent)?;
        profile.workload = (profile.workload + delta).clamp(0.0, 1.0);
        profile.last_seen = Utc::now();
        Some(profile.workload)
    }

    pub async fn len(&self) -> usize {
        self.agents.read().await.len()
    }
}

impl AgentDirectory for AgentRegistry {
    fn snapshot<'a>(&'a self) -> Pin<Box<dyn Future<Output = Vec<AgentProfile>> + Send + 'a>> {
        Box::pin(async move {
            let mut profiles: Vec<AgentProfile> =
                self.agents.read().await.values().cloned().collect();
            profiles.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
            profiles
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_workload_adjustment_is_clamped() {
        let registry = AgentRegistry::new();
        let id = AgentId::from("worker");
        registry
            .upsert(AgentProfile::new(id.clone(), ["code"]).with_workload(0.95))
            .await;

        assert_eq!(registry.adjust_workload(&id, 0.1).await, Some(1.0));
        assert_eq!(registry.adjust_workload(&id, -2.0).await, Some(0.0));
        assert_eq!(registry.adjust_workload(&AgentId::from("nobody"), 0.1).await, None);
    }

    #[tokio::test]
    async fn test_snapshot_is_sorted_by_id() {
        let registry = AgentRegistry::new();
        registry.upsert(AgentProfile::new(AgentId::from("b"), ["x"])).await;
        registry.upsert(AgentProfile::new(AgentId::from("a"), ["y"])).await;
        let ids: Vec<_> = registry
            .snapshot()
            .await
            .into_iter()
            .map(|p| p.agent_id.to_string())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
