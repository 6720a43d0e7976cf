//! In-process swarm: one coordinator plus the workers listed in the config,
//! all sharing a single `InMemoryChannel`.

use std::sync::Arc;
use std::time::Duration;

use hive_agent::{AgentEndpoint, AuditLog, MockGenerator, TracingAuditLog};
use hive_consensus::{
    ConsensusCoordinator, ConsensusOutcome, ConsensusParticipant, ContractNetCoordinator, GeneratorVoter,
};
use hive_network::InMemoryChannel;
use hive_protocol::crypto::{generate_keypair, load_or_create_keypair};
use hive_protocol::{AgentId, ConsensusType};
use hive_scheduler::{Objective, PlanStatus, TaskGraphScheduler};
use hive_state::{AgentProfile, AgentRegistry};
use tokio::task::JoinHandle;

use crate::config::{ConnectorConfig, SwarmAgent};
use crate::ConnectorError;

pub struct LocalSwarm {
    channel: Arc<InMemoryChannel>,
    coordinator: AgentEndpoint,
    workers: Vec<AgentEndpoint>,
    registry: Arc<AgentRegistry>,
    scheduler: TaskGraphScheduler,
    contract_net: ContractNetCoordinator,
    consensus: ConsensusCoordinator,
    reaper: JoinHandle<()>,
}

impl LocalSwarm {
    /// Start the coordinator and every configured worker.
    pub async fn start(config: &ConnectorConfig) -> Result<Self, ConnectorError> {
        Self::start_with_audit(config, Arc::new(TracingAuditLog)).await
    }

    /// Same as [`LocalSwarm::start`], recording the coordinator's audit trail in `audit`.
    pub async fn start_with_audit(
        config: &ConnectorConfig,
        audit: Arc<dyn AuditLog>,
    ) -> Result<Self, ConnectorError> {
        let mut channel = InMemoryChannel::new();
        if config.protocol.wire_encoding {
            channel = channel.with_wire_encoding();
        }
        let channel = Arc::new(channel);

        let mut builder = AgentEndpoint::builder(channel.clone())
            .config(config.endpoint_config())
            .audit(audit);
        if let Some(path) = &config.agent.key_file {
            builder = builder.signing_key(load_or_create_keypair(path)?);
        } else if config.protocol.require_signatures {
            builder = builder.signing_key(generate_keypair());
        }
        if let Some(id) = &config.agent.id {
            builder = builder.agent_id(id.as_str());
        }
        let coordinator = builder.build();
        coordinator.start().await?;

        let registry = Arc::new(AgentRegistry::new());
        let mut workers = Vec::with_capacity(config.swarm.agents.len());
        for spec in &config.swarm.agents {
            let worker = start_worker(&channel, config, spec).await?;
            let profile = AgentProfile::new(worker.agent_id().clone(), spec.capabilities.iter().cloned())
                .with_workload(spec.workload);
            registry.upsert(profile).await;
            workers.push(worker);
        }

        pin_keys(&coordinator, &workers);

        let scheduler = TaskGraphScheduler::new(coordinator.clone(), registry.clone(), config.scheduler_config());
        let contract_net = ContractNetCoordinator::install(coordinator.clone(), config.contract_net_config());
        let reaper = contract_net.spawn_reaper();
        let consensus = ConsensusCoordinator::new(coordinator.clone());

        tracing::info!(
            coordinator = %coordinator.agent_id(),
            workers = workers.len(),
            wire_encoding = config.protocol.wire_encoding,
            "local swarm started"
        );

        Ok(Self {
            channel,
            coordinator,
            workers,
            registry,
            scheduler,
            contract_net,
            consensus,
            reaper,
        })
    }

    pub fn coordinator(&self) -> &AgentEndpoint {
        &self.coordinator
    }

    pub fn workers(&self) -> &[AgentEndpoint] {
        &self.workers
    }

    pub fn worker_ids(&self) -> Vec<AgentId> {
        self.workers.iter().map(|w| w.agent_id().clone()).collect()
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn scheduler(&self) -> &TaskGraphScheduler {
        &self.scheduler
    }

    pub fn contract_net(&self) -> &ContractNetCoordinator {
        &self.contract_net
    }

    pub fn consensus(&self) -> &ConsensusCoordinator {
        &self.consensus
    }

    /// Decompose `objective`, execute the plan and return its final status.
    pub async fn run_objective(&self, objective: Objective) -> Result<PlanStatus, ConnectorError> {
        let plan_id = self.scheduler.submit_objective(objective).await?;
        Ok(self.scheduler.wait_for_plan(&plan_id).await?)
    }

    /// Put `proposal` to every worker.
    pub async fn vote(
        &self,
        proposal: serde_json::Value,
        consensus_type: ConsensusType,
        timeout: Duration,
    ) -> Result<ConsensusOutcome, ConnectorError> {
        let participants = self.worker_ids();
        Ok(self
            .consensus
            .reach_consensus(proposal, &participants, consensus_type, timeout)
            .await?)
    }

    /// Stop every endpoint and close the channel.
    pub async fn shutdown(self) {
        self.reaper.abort();
        for worker in &self.workers {
            worker.shutdown().await;
        }
        self.coordinator.shutdown().await;
        self.channel.close();
        tracing::info!("local swarm stopped");
    }
}

/// Every member accepts signed traffic from every other member's plain id.
fn pin_keys(coordinator: &AgentEndpoint, workers: &[AgentEndpoint]) {
    let members: Vec<&AgentEndpoint> = std::iter::once(coordinator).chain(workers).collect();
    for member in &members {
        for peer in &members {
            if member.agent_id() == peer.agent_id() {
                continue;
            }
            if let Some(key) = peer.verifying_key() {
                member.pin_peer_key(peer.agent_id(), key);
            }
        }
    }
}

async fn start_worker(
    channel: &Arc<InMemoryChannel>,
    config: &ConnectorConfig,
    spec: &SwarmAgent,
) -> Result<AgentEndpoint, ConnectorError> {
    let mut generator = MockGenerator::new();
    if let Some(response) = &spec.response {
        generator = generator.with_response(response.clone());
    }
    if spec.delay_ms > 0 {
        generator = generator.with_delay(Duration::from_millis(spec.delay_ms));
    }
    let generator = Arc::new(generator);

    let mut builder = AgentEndpoint::builder(channel.clone())
        .agent_id(spec.id.as_str())
        .config(config.endpoint_config_with(spec.capabilities.iter().cloned()))
        .generator(generator.clone());
    if config.protocol.require_signatures {
        builder = builder.signing_key(generate_keypair());
    }
    let worker = builder.build();
    ConsensusParticipant::install(&worker, Arc::new(GeneratorVoter::new(generator)));
    worker.start().await?;
    Ok(worker)
}
