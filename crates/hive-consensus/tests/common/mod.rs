#![allow(dead_code)]

use std::sync::Arc;

use hive_agent::{AgentEndpoint, AuditLog, EndpointConfig};
use hive_network::InMemoryChannel;

pub async fn agent(channel: &Arc<InMemoryChannel>, id: &str, capabilities: &[&str]) -> AgentEndpoint {
    let endpoint = AgentEndpoint::builder(channel.clone())
        .agent_id(id)
        .config(EndpointConfig::default().with_capabilities(capabilities.iter().copied()))
        .build();
    endpoint.start().await.unwrap();
    endpoint
}

pub async fn audited_agent(channel: &Arc<InMemoryChannel>, id: &str, audit: Arc<dyn AuditLog>) -> AgentEndpoint {
    let endpoint = AgentEndpoint::builder(channel.clone())
        .agent_id(id)
        .audit(audit)
        .build();
    endpoint.start().await.unwrap();
    endpoint
}
