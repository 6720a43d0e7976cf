//! Hive connector
//!
//! Wires the protocol crates into a runnable node:
//! - `config`: TOML configuration and its conversion into library settings
//! - `logging`: tracing subscriber setup for the binary
//! - `swarm`: coordinator and workers sharing one in-process channel

pub mod config;
pub mod logging;
pub mod swarm;

pub use config::{ConfigError, ConnectorConfig, SwarmAgent};
pub use swarm::LocalSwarm;

/// Errors raised while bringing up or driving a node.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Protocol(#[from] hive_protocol::ProtocolError),

    #[error(transparent)]
    Agent(#[from] hive_agent::AgentError),

    #[error(transparent)]
    Scheduler(#[from] hive_scheduler::SchedulerError),

    #[error(transparent)]
    Consensus(#[from] hive_consensus::ConsensusError),
}
